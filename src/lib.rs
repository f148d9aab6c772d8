pub mod cache;
pub mod config;
pub mod context;
pub mod engine;
pub mod gateway;
pub mod grid;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod push;
pub mod store;
pub mod sweep;
pub mod wal;
