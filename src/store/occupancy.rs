//! Typed occupancy queries over the document store.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use super::{Collection, DocumentStore, Filter, Model, StoreError};
use crate::grid::Cell;
use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationLookup {
    ById(ObjectId),
    BySpace(ObjectId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkingLookup {
    ById(ObjectId),
    BySpace(ObjectId),
}

fn cell_filter(cell: &Cell) -> Filter {
    let b = cell.bounds();
    Filter::And(vec![
        Filter::Range {
            path: "location.latitude",
            gte: Some(b.lat_lo),
            lt: Some(b.lat_hi),
        },
        Filter::Range {
            path: "location.longitude",
            gte: Some(b.lng_lo),
            lt: Some(b.lng_hi),
        },
    ])
}

fn space_ref(value: &Value) -> Option<ObjectId> {
    value.get("space")?.as_str()?.parse().ok()
}

#[derive(Clone)]
pub struct OccupancyStore {
    store: Arc<dyn DocumentStore>,
}

impl OccupancyStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Unique indexes the arbitration relies on: one reservation, one session
    /// and one sensor per space, one sensor per physical address.
    pub async fn ensure_indexes(&self) -> Result<(), StoreError> {
        self.store.ensure_unique(Collection::Reservations, "space").await?;
        self.store.ensure_unique(Collection::Parking, "space").await?;
        self.store.ensure_unique(Collection::Sensors, "space").await?;
        self.store.ensure_unique(Collection::Sensors, "address").await?;
        Ok(())
    }

    // ── generic helpers ──────────────────────────────────

    pub async fn find<T: Model>(&self, filter: &Filter) -> Result<Vec<T>, StoreError> {
        self.store
            .find(T::COLLECTION, filter)
            .await?
            .into_iter()
            .map(T::decode)
            .collect()
    }

    pub async fn find_one<T: Model>(&self, filter: &Filter) -> Result<Option<T>, StoreError> {
        self.store
            .find_one(T::COLLECTION, filter)
            .await?
            .map(T::decode)
            .transpose()
    }

    pub async fn get<T: Model>(&self, id: ObjectId) -> Result<Option<T>, StoreError> {
        self.find_one(&Filter::id(id)).await
    }

    pub async fn insert<T: Model>(&self, model: &T) -> Result<(), StoreError> {
        self.store.insert(T::COLLECTION, model.encode()?).await
    }

    /// Replace by id. `Ok(false)` when the document no longer exists.
    pub async fn replace<T: Model>(&self, model: &T) -> Result<bool, StoreError> {
        self.store
            .update_one(T::COLLECTION, &Filter::id(model.id()), model.encode()?)
            .await
    }

    async fn remove_by_id(&self, collection: Collection, id: ObjectId) -> Result<bool, StoreError> {
        Ok(self.store.remove(collection, &Filter::id(id)).await? > 0)
    }

    // ── spaces ───────────────────────────────────────────

    pub async fn space(&self, id: ObjectId) -> Result<Option<Space>, StoreError> {
        self.get(id).await
    }

    /// Non-deleted spaces inside any of `cells`, minus those referenced by a
    /// reservation or parking session. The two exclusion reads are separate
    /// queries, so a result may already be taken by the time it is used; the
    /// unique index on `space` catches that at insert time.
    pub async fn find_free_spaces_in_cells(
        &self,
        provider: Option<ObjectId>,
        cells: &[Cell],
    ) -> Result<Vec<Space>, StoreError> {
        if cells.is_empty() {
            return Ok(Vec::new());
        }
        let mut clauses = vec![
            Filter::eq("deleted", false),
            Filter::Or(cells.iter().map(cell_filter).collect()),
        ];
        if let Some(provider) = provider {
            clauses.push(Filter::eq("provider", provider.to_string()));
        }
        let candidates: Vec<Space> = self.find(&Filter::And(clauses)).await?;
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let in_candidates = Filter::ids("space", candidates.iter().map(|s| s.id));
        let mut taken: HashSet<ObjectId> = HashSet::new();
        for collection in [Collection::Parking, Collection::Reservations] {
            taken.extend(
                self.store
                    .find(collection, &in_candidates)
                    .await?
                    .iter()
                    .filter_map(space_ref),
            );
        }
        Ok(candidates
            .into_iter()
            .filter(|s| !taken.contains(&s.id))
            .collect())
    }

    pub async fn spaces_of_provider(&self, provider: ObjectId) -> Result<Vec<Space>, StoreError> {
        self.find(&Filter::eq("provider", provider.to_string())).await
    }

    // ── reservations ─────────────────────────────────────

    pub async fn reservation(&self, lookup: ReservationLookup) -> Result<Option<Reservation>, StoreError> {
        match lookup {
            ReservationLookup::ById(id) => self.get(id).await,
            ReservationLookup::BySpace(space) => {
                self.find_one(&Filter::eq("space", space.to_string())).await
            }
        }
    }

    pub async fn insert_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        self.insert(reservation).await
    }

    /// Remove a reservation, but only if it still sits on `space`.
    /// `Ok(false)` when it vanished or was moved elsewhere.
    pub async fn remove_reservation(&self, id: ObjectId, space: ObjectId) -> Result<bool, StoreError> {
        let filter = Filter::And(vec![Filter::id(id), Filter::eq("space", space.to_string())]);
        Ok(self.store.remove(Collection::Reservations, &filter).await? > 0)
    }

    /// Move a reservation to `to`, but only if it still sits on `from`.
    /// `Ok(false)` when it vanished or was already moved.
    pub async fn relocate_reservation(
        &self,
        reservation: &Reservation,
        to: ObjectId,
    ) -> Result<bool, StoreError> {
        let filter = Filter::And(vec![
            Filter::id(reservation.id),
            Filter::eq("space", reservation.space.to_string()),
        ]);
        let moved = Reservation {
            space: to,
            ..reservation.clone()
        };
        self.store
            .update_one(Collection::Reservations, &filter, moved.encode()?)
            .await
    }

    /// Reservations with `begin` in `[from, to)`.
    pub async fn reservations_beginning_in(&self, from: Ms, to: Ms) -> Result<Vec<Reservation>, StoreError> {
        self.find(&Filter::Range {
            path: "begin",
            gte: Some(from as f64),
            lt: Some(to as f64),
        })
        .await
    }

    /// Reservations with `begin < t`.
    pub async fn reservations_begun_before(&self, t: Ms) -> Result<Vec<Reservation>, StoreError> {
        self.find(&Filter::Range {
            path: "begin",
            gte: None,
            lt: Some(t as f64),
        })
        .await
    }

    pub async fn reservations_of_user(&self, user: ObjectId) -> Result<Vec<Reservation>, StoreError> {
        self.find(&Filter::eq("user", user.to_string())).await
    }

    // ── parking sessions ─────────────────────────────────

    pub async fn parking(&self, lookup: ParkingLookup) -> Result<Option<ParkingSession>, StoreError> {
        match lookup {
            ParkingLookup::ById(id) => self.get(id).await,
            ParkingLookup::BySpace(space) => {
                self.find_one(&Filter::eq("space", space.to_string())).await
            }
        }
    }

    pub async fn insert_parking(&self, session: &ParkingSession) -> Result<(), StoreError> {
        self.insert(session).await
    }

    pub async fn remove_parking(&self, id: ObjectId) -> Result<bool, StoreError> {
        self.remove_by_id(Collection::Parking, id).await
    }

    pub async fn parking_of_user(&self, user: ObjectId) -> Result<Vec<ParkingSession>, StoreError> {
        self.find(&Filter::eq("user", user.to_string())).await
    }

    // ── records ──────────────────────────────────────────

    pub async fn insert_record(&self, record: &Record) -> Result<(), StoreError> {
        self.insert(record).await
    }

    pub async fn records_of_user(&self, user: ObjectId) -> Result<Vec<Record>, StoreError> {
        self.find(&Filter::eq("user", user.to_string())).await
    }

    // ── users and sensors ────────────────────────────────

    pub async fn user(&self, id: ObjectId) -> Result<Option<User>, StoreError> {
        self.get(id).await
    }

    pub async fn user_by_vehicle(&self, vehicle: &str) -> Result<Option<User>, StoreError> {
        self.find_one(&Filter::ElemMatch("vehicle_ids", Value::String(vehicle.to_string())))
            .await
    }

    pub async fn sensor(&self, id: ObjectId) -> Result<Option<Sensor>, StoreError> {
        self.get(id).await
    }

    pub async fn sensor_by_address(&self, address: PhysicalAddress) -> Result<Option<Sensor>, StoreError> {
        self.find_one(&Filter::eq("address", address.to_string())).await
    }

    pub async fn sensor_for_space(&self, space: ObjectId) -> Result<Option<Sensor>, StoreError> {
        self.find_one(&Filter::eq("space", space.to_string())).await
    }
}
