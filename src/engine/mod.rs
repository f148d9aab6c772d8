mod admin;
mod error;
mod reserve;
mod sensor;
#[cfg(test)]
mod tests;

pub use error::{EngineError, ErrorKind};
pub use reserve::Displacement;
pub use sensor::Arrival;

use std::sync::Arc;

use crate::grid::{Cell, GridIndexer};
use crate::model::{Location, ObjectId, Space};
use crate::notify::{DomainEvent, Notifier};
use crate::store::OccupancyStore;

/// Reservation arbitration over a transactionless document store.
///
/// The engine keeps no in-process state and takes no locks: every decision is
/// re-read from the store, and contention on a space is settled by the unique
/// indexes on `space` (whoever's write lands first owns the space). Events go
/// out through the [`Notifier`] without waiting on delivery.
pub struct Engine {
    pub(super) occupancy: OccupancyStore,
    pub(super) grid: GridIndexer,
    pub(super) notifier: Arc<Notifier>,
}

pub(super) fn cell_of(location: &Location) -> Cell {
    Cell::containing(location.latitude, location.longitude)
}

impl Engine {
    pub fn new(occupancy: OccupancyStore, grid: GridIndexer, notifier: Arc<Notifier>) -> Self {
        Self {
            occupancy,
            grid,
            notifier,
        }
    }

    pub fn occupancy(&self) -> &OccupancyStore {
        &self.occupancy
    }

    pub fn grid(&self) -> &GridIndexer {
        &self.grid
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub(super) fn publish(&self, event: DomainEvent) {
        self.notifier.publish(event);
    }

    pub(super) async fn require_space(&self, id: ObjectId) -> Result<Space, EngineError> {
        self.occupancy
            .space(id)
            .await?
            .ok_or_else(|| EngineError::not_found("space", id))
    }
}
