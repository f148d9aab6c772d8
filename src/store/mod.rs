//! Document-store boundary.
//!
//! The engine only ever talks to [`DocumentStore`]: single-document writes,
//! simple equality / range / membership queries, and per-field uniqueness.
//! There are no multi-document transactions.

mod memory;
pub mod occupancy;

pub use memory::MemoryStore;
pub use occupancy::{OccupancyStore, ParkingLookup, ReservationLookup};

use std::cmp::Ordering;
use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::ObjectId;

pub type Document = Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Collection {
    Providers,
    Spaces,
    Users,
    Sensors,
    Reservations,
    Parking,
    Records,
}

impl Collection {
    pub const ALL: [Collection; 7] = [
        Collection::Providers,
        Collection::Spaces,
        Collection::Users,
        Collection::Sensors,
        Collection::Reservations,
        Collection::Parking,
        Collection::Records,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Providers => "providers",
            Collection::Spaces => "spaces",
            Collection::Users => "users",
            Collection::Sensors => "sensors",
            Collection::Reservations => "reservations",
            Collection::Parking => "parking",
            Collection::Records => "records",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// A write would violate a unique index (or reuse an `_id`).
    DuplicateKey {
        collection: Collection,
        field: String,
        key: String,
    },
    Unavailable(String),
    Codec(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::DuplicateKey { collection, field, key } => {
                write!(f, "duplicate key {collection}.{field} = {key}")
            }
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
            StoreError::Codec(e) => write!(f, "document codec: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// An entity persisted as one document in a fixed collection.
pub trait Model: Serialize + DeserializeOwned + Send + Sync + Sized {
    const COLLECTION: Collection;

    fn id(&self) -> ObjectId;

    fn encode(&self) -> Result<Document, StoreError> {
        serde_json::to_value(self).map_err(|e| StoreError::Codec(e.to_string()))
    }

    fn decode(doc: Document) -> Result<Self, StoreError> {
        serde_json::from_value(doc).map_err(|e| StoreError::Codec(e.to_string()))
    }
}

/// Query predicate over dotted field paths (`location.latitude`).
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(&'static str, Value),
    In(&'static str, Vec<Value>),
    /// `gte <= field < lt`, either bound optional.
    Range {
        path: &'static str,
        gte: Option<f64>,
        lt: Option<f64>,
    },
    /// Array field contains the value.
    ElemMatch(&'static str, Value),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn id(id: ObjectId) -> Self {
        Filter::Eq("_id", Value::String(id.to_string()))
    }

    pub fn eq(path: &'static str, value: impl Into<Value>) -> Self {
        Filter::Eq(path, value.into())
    }

    pub fn ids(path: &'static str, ids: impl IntoIterator<Item = ObjectId>) -> Self {
        Filter::In(path, ids.into_iter().map(|id| Value::String(id.to_string())).collect())
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(path, want) => lookup(doc, path).is_some_and(|v| values_equal(v, want)),
            Filter::In(path, set) => {
                lookup(doc, path).is_some_and(|v| set.iter().any(|w| values_equal(v, w)))
            }
            Filter::Range { path, gte, lt } => match lookup(doc, path).and_then(Value::as_f64) {
                Some(v) => gte.is_none_or(|lo| v >= lo) && lt.is_none_or(|hi| v < hi),
                None => false,
            },
            Filter::ElemMatch(path, want) => match lookup(doc, path) {
                Some(Value::Array(items)) => items.iter().any(|v| values_equal(v, want)),
                _ => false,
            },
            Filter::And(all) => all.iter().all(|f| f.matches(doc)),
            Filter::Or(any) => any.iter().any(|f| f.matches(doc)),
        }
    }
}

/// Resolve a dotted path inside a document.
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |v, key| v.get(key))
}

// Numbers compare by value so that `1` and `1.0` are the same key.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().partial_cmp(&y.as_f64()) == Some(Ordering::Equal)
        }
        _ => a == b,
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// All matching documents, in insertion order.
    async fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>, StoreError>;

    async fn find_one(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError>;

    /// Insert a new document. Fails with `DuplicateKey` on `_id` or any unique index.
    async fn insert(&self, collection: Collection, doc: Document) -> Result<(), StoreError>;

    /// Replace the first match. `Ok(false)` when nothing matched.
    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        doc: Document,
    ) -> Result<bool, StoreError>;

    /// Remove every match, returning how many were removed.
    async fn remove(&self, collection: Collection, filter: &Filter) -> Result<u64, StoreError>;

    /// Declare a unique index on `field`. Documents lacking the field are not indexed.
    async fn ensure_unique(&self, collection: Collection, field: &'static str) -> Result<(), StoreError>;
}
