use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::*;
use crate::cache::{MemoryCache, OccupancyCache};
use crate::model::*;
use crate::notify::{EventSink, OccupancySink};
use crate::store::{
    Collection, Document, DocumentStore, Filter, MemoryStore, ParkingLookup, ReservationLookup,
    StoreError,
};

const T0: Ms = 1_700_000_000_000;
const ONE_CELL: &str = "1.00-1.01:1.00-1.01";

struct Harness {
    engine: Arc<Engine>,
    cache: Arc<MemoryCache>,
    events: broadcast::Receiver<(Ms, DomainEvent)>,
    provider: Provider,
}

async fn harness() -> Harness {
    harness_on(Arc::new(MemoryStore::new())).await
}

async fn harness_on(store: Arc<dyn DocumentStore>) -> Harness {
    let occupancy = OccupancyStore::new(store);
    occupancy.ensure_indexes().await.unwrap();
    let cache = Arc::new(MemoryCache::new());
    let sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(OccupancySink::new(cache.clone()))];
    let notifier = Arc::new(Notifier::new(sinks));
    let events = notifier.subscribe();
    let engine = Arc::new(Engine::new(occupancy, GridIndexer::default(), notifier));
    let provider = engine.create_provider("City", ProviderKind::Government).await.unwrap();
    Harness {
        engine,
        cache,
        events,
        provider,
    }
}

impl Harness {
    async fn space_at(&self, latitude: f64, longitude: f64, fee: Fee) -> Space {
        self.engine
            .create_space(self.provider.id, Location { latitude, longitude }, "", fee)
            .await
            .unwrap()
    }

    async fn user(&self, vehicle: &str) -> User {
        self.engine
            .register_user(vec![format!("device-{vehicle}")], vec![vehicle.to_string()])
            .await
            .unwrap()
    }

    async fn sensor(&self, space: &Space, n: u8) -> Sensor {
        self.engine
            .register_sensor(PhysicalAddress::new([0x02, 0, 0, 0, 0, n]), space.id)
            .await
            .unwrap()
    }

    fn drain(&mut self) -> Vec<DomainEvent> {
        let mut out = Vec::new();
        while let Ok((_, event)) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    async fn wait_for_cache(&self, space: ObjectId, occupied: bool) {
        for _ in 0..200 {
            if self.cache.occupied(space).await.unwrap() == Some(occupied) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("cache never reported {space} occupied={occupied}");
    }
}

fn hourly() -> Fee {
    Fee::new(HOUR, 10.0)
}

/// Counts reads so tests can assert that validation happens before the store.
struct CountingStore {
    inner: MemoryStore,
    reads: AtomicUsize,
}

#[async_trait]
impl DocumentStore for CountingStore {
    async fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.find(collection, filter).await
    }

    async fn find_one(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.find_one(collection, filter).await
    }

    async fn insert(&self, collection: Collection, doc: Document) -> Result<(), StoreError> {
        self.inner.insert(collection, doc).await
    }

    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        doc: Document,
    ) -> Result<bool, StoreError> {
        self.inner.update_one(collection, filter, doc).await
    }

    async fn remove(&self, collection: Collection, filter: &Filter) -> Result<u64, StoreError> {
        self.inner.remove(collection, filter).await
    }

    async fn ensure_unique(&self, collection: Collection, field: &'static str) -> Result<(), StoreError> {
        self.inner.ensure_unique(collection, field).await
    }
}

/// Runs a competing write at a chosen point inside an engine operation.
enum Interference {
    /// Another path removes the reservation just before a relocation lands.
    RemoveOnRelocate(ObjectId),
    /// Another path moves the reservation while free spaces are searched,
    /// and the search comes back empty.
    MoveOnSpaceSearch { reservation: Reservation, to: ObjectId },
}

struct InterferingStore {
    inner: Arc<MemoryStore>,
    armed: std::sync::Mutex<Option<Interference>>,
}

impl InterferingStore {
    fn new() -> Self {
        Self {
            inner: Arc::new(MemoryStore::new()),
            armed: std::sync::Mutex::new(None),
        }
    }

    fn arm(&self, interference: Interference) {
        *self.armed.lock().unwrap() = Some(interference);
    }

    fn take_if(&self, pick: impl Fn(&Interference) -> bool) -> Option<Interference> {
        let mut armed = self.armed.lock().unwrap();
        if armed.as_ref().is_some_and(pick) { armed.take() } else { None }
    }
}

#[async_trait]
impl DocumentStore for InterferingStore {
    async fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        if matches!(collection, Collection::Spaces) {
            let taken = self.take_if(|i| matches!(i, Interference::MoveOnSpaceSearch { .. }));
            if let Some(Interference::MoveOnSpaceSearch { reservation, to }) = taken {
                let occupancy = OccupancyStore::new(self.inner.clone());
                assert!(occupancy.relocate_reservation(&reservation, to).await?);
                return Ok(Vec::new());
            }
        }
        self.inner.find(collection, filter).await
    }

    async fn find_one(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError> {
        self.inner.find_one(collection, filter).await
    }

    async fn insert(&self, collection: Collection, doc: Document) -> Result<(), StoreError> {
        self.inner.insert(collection, doc).await
    }

    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        doc: Document,
    ) -> Result<bool, StoreError> {
        if matches!(collection, Collection::Reservations) {
            let taken = self.take_if(|i| matches!(i, Interference::RemoveOnRelocate(_)));
            if let Some(Interference::RemoveOnRelocate(id)) = taken {
                self.inner.remove(Collection::Reservations, &Filter::id(id)).await?;
            }
        }
        self.inner.update_one(collection, filter, doc).await
    }

    async fn remove(&self, collection: Collection, filter: &Filter) -> Result<u64, StoreError> {
        self.inner.remove(collection, filter).await
    }

    async fn ensure_unique(&self, collection: Collection, field: &'static str) -> Result<(), StoreError> {
        self.inner.ensure_unique(collection, field).await
    }
}

// ── Reservations ─────────────────────────────────────────

#[tokio::test]
async fn reservation_lands_on_the_only_space_in_range() {
    let h = harness().await;
    let space = h.space_at(1.005, 1.005, hourly()).await;
    let user = h.user("TAG-1").await;

    let reservation = h
        .engine
        .create_reservation(user.id, "1.00-1.02:1.00-1.02", T0 + HOUR, T0)
        .await
        .unwrap();
    assert_eq!(reservation.space, space.id);
    assert_eq!(reservation.user, user.id);
    assert_eq!(reservation.begin, T0 + HOUR);

    let second = h.user("TAG-2").await;
    let err = h
        .engine
        .create_reservation(second.id, "1.00-1.02:1.00-1.02", T0 + HOUR, T0)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::NoAvailability);
}

#[tokio::test]
async fn oversized_grid_is_rejected_before_any_read() {
    let store = Arc::new(CountingStore {
        inner: MemoryStore::new(),
        reads: AtomicUsize::new(0),
    });
    let h = harness_on(store.clone()).await;
    let user = h.user("TAG-1").await;
    store.reads.store(0, Ordering::SeqCst);

    // 10 x 15 cells
    let err = h
        .engine
        .create_reservation(user.id, "1.00-1.10:1.00-1.15", T0, T0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(store.reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_grid_and_past_begin_are_invalid() {
    let h = harness().await;
    h.space_at(1.005, 1.005, hourly()).await;
    let user = h.user("TAG-1").await;

    for spec in ["", "nonsense", "1.00-1.01", "1.02-1.00:1.00-1.01"] {
        let err = h.engine.create_reservation(user.id, spec, T0, T0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput, "{spec:?}");
    }

    let err = h
        .engine
        .create_reservation(user.id, ONE_CELL, T0 - SECOND, T0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn unknown_user_cannot_reserve() {
    let h = harness().await;
    h.space_at(1.005, 1.005, hourly()).await;
    let err = h
        .engine
        .create_reservation(ObjectId::new(), ONE_CELL, T0, T0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound("user", _)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_never_share_a_space() {
    let h = harness().await;
    let mut spaces = Vec::new();
    for i in 0..3 {
        spaces.push(h.space_at(1.001 + i as f64 * 0.002, 1.005, hourly()).await);
    }
    let mut users = Vec::new();
    for i in 0..8 {
        users.push(h.user(&format!("TAG-{i}")).await);
    }

    let mut handles = Vec::new();
    for user in &users {
        let engine = h.engine.clone();
        let user = user.id;
        handles.push(tokio::spawn(async move {
            engine.create_reservation(user, ONE_CELL, T0 + HOUR, T0).await
        }));
    }

    let mut won = Vec::new();
    let mut lost = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(reservation) => won.push(reservation.space),
            Err(EngineError::NoAvailability) => lost += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    won.sort();
    won.dedup();
    assert_eq!(won.len(), 3);
    assert_eq!(lost, 5);
}

#[tokio::test]
async fn provider_reservation_stays_with_the_provider() {
    let h = harness().await;
    let city_space = h.space_at(1.005, 1.005, hourly()).await;
    let garage = h
        .engine
        .create_provider("Garage", ProviderKind::Private)
        .await
        .unwrap();
    let garage_space = h
        .engine
        .create_space(garage.id, Location { latitude: 1.006, longitude: 1.006 }, "G-1", hourly())
        .await
        .unwrap();
    let user = h.user("TAG-1").await;

    let reservation = h
        .engine
        .create_provider_reservation(user.id, garage.id, ONE_CELL, T0, T0)
        .await
        .unwrap();
    assert_eq!(reservation.space, garage_space.id);

    let err = h
        .engine
        .create_provider_reservation(user.id, garage.id, ONE_CELL, T0, T0)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::NoAvailability);

    let any = h.engine.create_reservation(user.id, ONE_CELL, T0, T0).await.unwrap();
    assert_eq!(any.space, city_space.id);
}

#[tokio::test]
async fn create_then_cancel_frees_the_space() {
    let mut h = harness().await;
    let space = h.space_at(1.005, 1.005, hourly()).await;
    let user = h.user("TAG-1").await;

    let reservation = h.engine.create_reservation(user.id, ONE_CELL, T0 + HOUR, T0).await.unwrap();
    h.wait_for_cache(space.id, true).await;

    let cancelled = h.engine.cancel_reservation(user.id, reservation.id).await.unwrap();
    assert_eq!(cancelled, reservation);
    h.wait_for_cache(space.id, false).await;

    assert!(h
        .engine
        .occupancy()
        .reservation(ReservationLookup::ById(reservation.id))
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        h.drain(),
        vec![
            DomainEvent::SpaceReserved {
                space: space.id,
                cell: Cell::containing(1.005, 1.005),
                reservation: reservation.id,
            },
            DomainEvent::SpaceFreed {
                space: space.id,
                cell: Cell::containing(1.005, 1.005),
                cancelled_reservation: true,
            },
        ]
    );

    // Space is reservable again.
    h.engine.create_reservation(user.id, ONE_CELL, T0 + HOUR, T0).await.unwrap();
}

#[tokio::test]
async fn cancel_checks_ownership() {
    let h = harness().await;
    h.space_at(1.005, 1.005, hourly()).await;
    let owner = h.user("TAG-1").await;
    let other = h.user("TAG-2").await;
    let reservation = h.engine.create_reservation(owner.id, ONE_CELL, T0, T0).await.unwrap();

    let err = h.engine.cancel_reservation(other.id, reservation.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    h.engine.cancel_reservation(owner.id, reservation.id).await.unwrap();
    let err = h.engine.cancel_reservation(owner.id, reservation.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn cancel_follows_a_relocated_reservation() {
    let mut h = harness().await;
    let a = h.space_at(1.005, 1.005, hourly()).await;
    let b = h.space_at(1.015, 1.005, hourly()).await;
    let sensor = h.sensor(&a, 1).await;
    let holder = h.user("TAG-X").await;
    h.user("TAG-Y").await;
    let reservation = h.engine.create_reservation(holder.id, ONE_CELL, T0 + HOUR, T0).await.unwrap();
    h.engine.sensor_reports_arrival("TAG-Y", sensor.id, T0 + MINUTE).await.unwrap();
    h.drain();

    let cancelled = h.engine.cancel_reservation(holder.id, reservation.id).await.unwrap();
    assert_eq!(cancelled.space, b.id);
    assert_eq!(
        h.drain(),
        vec![DomainEvent::SpaceFreed {
            space: b.id,
            cell: Cell::containing(1.015, 1.005),
            cancelled_reservation: true,
        }]
    );
    h.wait_for_cache(b.id, false).await;
    h.wait_for_cache(a.id, true).await;
}

// ── Sensor arrivals and departures ───────────────────────

#[tokio::test]
async fn billing_rounds_up_to_whole_units() {
    let h = harness().await;
    let space = h.space_at(1.005, 1.005, Fee::new(30 * MINUTE, 2.5)).await;
    let sensor = h.sensor(&space, 1).await;
    let user = h.user("TAG-1").await;

    h.engine.sensor_reports_arrival("TAG-1", sensor.id, T0).await.unwrap();
    let exact = h
        .engine
        .sensor_reports_departure(sensor.id, T0 + 30 * MINUTE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exact.charge, 2.5);
    assert_eq!(exact.reason, RecordReason::Parking);
    assert_eq!(exact.plate.as_deref(), Some("TAG-1"));
    assert_eq!((exact.begin, exact.end), (T0, T0 + 30 * MINUTE));

    h.engine.sensor_reports_arrival("TAG-1", sensor.id, T0 + HOUR).await.unwrap();
    let over = h
        .engine
        .sensor_reports_departure(sensor.id, T0 + HOUR + 30 * MINUTE + SECOND)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(over.charge, 5.0);

    let records = h.engine.records_of(user.id).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| !r.paid));
}

#[tokio::test]
async fn repeated_departure_bills_once() {
    let h = harness().await;
    let space = h.space_at(1.005, 1.005, hourly()).await;
    let sensor = h.sensor(&space, 1).await;
    let user = h.user("TAG-1").await;

    // Nothing parked yet.
    assert_eq!(h.engine.sensor_reports_departure(sensor.id, T0).await.unwrap(), None);

    h.engine.sensor_reports_arrival("TAG-1", sensor.id, T0).await.unwrap();
    assert!(h.engine.sensor_reports_departure(sensor.id, T0 + HOUR).await.unwrap().is_some());
    assert_eq!(h.engine.sensor_reports_departure(sensor.id, T0 + HOUR).await.unwrap(), None);
    assert_eq!(h.engine.sensor_reports_departure(sensor.id, T0 + 2 * HOUR).await.unwrap(), None);

    assert_eq!(h.engine.records_of(user.id).await.unwrap().len(), 1);
    assert!(h.engine.parking_of(user.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn arrival_honors_own_reservation() {
    let mut h = harness().await;
    let space = h.space_at(1.005, 1.005, hourly()).await;
    let sensor = h.sensor(&space, 1).await;
    let user = h.user("TAG-1").await;
    let reservation = h.engine.create_reservation(user.id, ONE_CELL, T0, T0).await.unwrap();
    h.drain();

    let arrival = h.engine.sensor_reports_arrival("TAG-1", sensor.id, T0 + MINUTE).await.unwrap();
    assert_eq!(arrival.honored, Some(reservation));
    assert_eq!(arrival.displaced, None);
    assert_eq!(arrival.closed, None);
    assert_eq!(arrival.session.user, user.id);
    assert!(h.engine.reservations_of(user.id).await.unwrap().is_empty());
    assert_eq!(
        h.drain(),
        vec![DomainEvent::SpaceParked {
            space: space.id,
            cell: Cell::containing(1.005, 1.005),
            user: user.id,
        }]
    );
    h.wait_for_cache(space.id, true).await;
}

#[tokio::test]
async fn conflicting_arrival_relocates_reservation() {
    let mut h = harness().await;
    let a = h.space_at(1.005, 1.005, hourly()).await;
    // Neighboring cell, outside the reservation's range.
    let b = h.space_at(1.015, 1.005, hourly()).await;
    let sensor = h.sensor(&a, 1).await;
    let holder = h.user("TAG-X").await;
    let parker = h.user("TAG-Y").await;

    let reservation = h.engine.create_reservation(holder.id, ONE_CELL, T0 + HOUR, T0).await.unwrap();
    assert_eq!(reservation.space, a.id);
    h.drain();

    let arrival = h.engine.sensor_reports_arrival("TAG-Y", sensor.id, T0 + MINUTE).await.unwrap();
    let moved = Reservation {
        space: b.id,
        ..reservation.clone()
    };
    assert_eq!(
        arrival.displaced,
        Some(Displacement::Relocated {
            reservation: moved.clone(),
            from: a.id,
        })
    );

    let stored = h
        .engine
        .occupancy()
        .reservation(ReservationLookup::ById(reservation.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.space, b.id);
    let session = h
        .engine
        .occupancy()
        .parking(ParkingLookup::BySpace(a.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.user, parker.id);

    let events = h.drain();
    assert!(events.contains(&DomainEvent::UserReservationChanged {
        user: holder.id,
        reservation: moved,
        from: a.id,
    }));
    assert!(matches!(events.last(), Some(DomainEvent::SpaceParked { space, .. }) if *space == a.id));
    h.wait_for_cache(b.id, true).await;
    h.wait_for_cache(a.id, true).await;
}

#[tokio::test]
async fn conflicting_arrival_without_alternative_cancels() {
    let mut h = harness().await;
    let a = h.space_at(1.005, 1.005, hourly()).await;
    // Too far to count as nearby.
    h.space_at(1.045, 1.005, hourly()).await;
    let sensor = h.sensor(&a, 1).await;
    let holder = h.user("TAG-X").await;
    let parker = h.user("TAG-Y").await;

    let reservation = h.engine.create_reservation(holder.id, ONE_CELL, T0 + HOUR, T0).await.unwrap();
    h.drain();

    let arrival = h.engine.sensor_reports_arrival("TAG-Y", sensor.id, T0 + MINUTE).await.unwrap();
    assert_eq!(
        arrival.displaced,
        Some(Displacement::Cancelled {
            reservation: reservation.clone(),
        })
    );
    assert!(h.engine.reservations_of(holder.id).await.unwrap().is_empty());
    assert_eq!(h.engine.parking_of(parker.id).await.unwrap().len(), 1);

    let events = h.drain();
    assert!(events.contains(&DomainEvent::UserReservationCancelled {
        user: holder.id,
        reservation,
        compensation_due: true,
    }));
    // The space ends up occupied despite the cancellation's free event.
    assert!(matches!(events.last(), Some(DomainEvent::SpaceParked { space, .. }) if *space == a.id));
    h.wait_for_cache(a.id, true).await;
}

#[tokio::test]
async fn displaced_reservation_moved_elsewhere_is_left_alone() {
    let store = Arc::new(InterferingStore::new());
    let mut h = harness_on(store.clone()).await;
    let a = h.space_at(1.005, 1.005, hourly()).await;
    // Too far to count as nearby.
    let far = h.space_at(1.045, 1.005, hourly()).await;
    let sensor = h.sensor(&a, 1).await;
    let holder = h.user("TAG-X").await;
    h.user("TAG-Y").await;
    let reservation = h.engine.create_reservation(holder.id, ONE_CELL, T0 + HOUR, T0).await.unwrap();
    h.drain();

    store.arm(Interference::MoveOnSpaceSearch {
        reservation: reservation.clone(),
        to: far.id,
    });
    let arrival = h.engine.sensor_reports_arrival("TAG-Y", sensor.id, T0 + MINUTE).await.unwrap();
    assert_eq!(arrival.displaced, Some(Displacement::Vanished));

    let stored = h
        .engine
        .occupancy()
        .reservation(ReservationLookup::ById(reservation.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.space, far.id);
    assert_eq!(
        h.drain(),
        vec![DomainEvent::SpaceParked {
            space: a.id,
            cell: Cell::containing(1.005, 1.005),
            user: arrival.session.user,
        }]
    );
}

#[tokio::test]
async fn displaced_reservation_removed_mid_relocation_vanishes() {
    let store = Arc::new(InterferingStore::new());
    let mut h = harness_on(store.clone()).await;
    let a = h.space_at(1.005, 1.005, hourly()).await;
    let b = h.space_at(1.015, 1.005, hourly()).await;
    let sensor = h.sensor(&a, 1).await;
    let holder = h.user("TAG-X").await;
    let parker = h.user("TAG-Y").await;
    let reservation = h.engine.create_reservation(holder.id, ONE_CELL, T0 + HOUR, T0).await.unwrap();
    h.drain();

    store.arm(Interference::RemoveOnRelocate(reservation.id));
    let arrival = h.engine.sensor_reports_arrival("TAG-Y", sensor.id, T0 + MINUTE).await.unwrap();
    assert_eq!(arrival.displaced, Some(Displacement::Vanished));
    assert!(h.engine.reservations_of(holder.id).await.unwrap().is_empty());
    assert_eq!(h.engine.parking_of(parker.id).await.unwrap().len(), 1);

    let events = h.drain();
    assert!(!events.iter().any(|e| matches!(
        e,
        DomainEvent::UserReservationChanged { .. } | DomainEvent::UserReservationCancelled { .. }
    )));
    assert!(!events.iter().any(|e| matches!(e, DomainEvent::SpaceReserved { space, .. } if *space == b.id)));
}

#[tokio::test]
async fn arrival_over_open_session_closes_it() {
    let h = harness().await;
    let space = h.space_at(1.005, 1.005, hourly()).await;
    let sensor = h.sensor(&space, 1).await;
    let first = h.user("TAG-1").await;
    let second = h.user("TAG-2").await;

    h.engine.sensor_reports_arrival("TAG-1", sensor.id, T0).await.unwrap();
    let arrival = h
        .engine
        .sensor_reports_arrival("TAG-2", sensor.id, T0 + 90 * MINUTE)
        .await
        .unwrap();

    let closed = arrival.closed.unwrap();
    assert_eq!(closed.user, first.id);
    assert_eq!(closed.charge, 20.0);
    assert!(h.engine.parking_of(first.id).await.unwrap().is_empty());
    assert_eq!(h.engine.parking_of(second.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn arrival_rejections() {
    let h = harness().await;
    let space = h.space_at(1.005, 1.005, hourly()).await;
    let sensor = h.sensor(&space, 1).await;
    h.user("TAG-1").await;

    let err = h.engine.sensor_reports_arrival("NOBODY", sensor.id, T0).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound("vehicle", _)));

    let err = h.engine.sensor_reports_arrival("", sensor.id, T0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = h
        .engine
        .sensor_reports_arrival("TAG-1", ObjectId::new(), T0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound("sensor", _)));

    let err = h.engine.sensor_reports_departure(ObjectId::new(), T0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ── Expiry ───────────────────────────────────────────────

#[tokio::test]
async fn expiry_is_billed_once() {
    let h = harness().await;
    h.space_at(1.005, 1.005, Fee::new(15 * MINUTE, 1.0)).await;
    let user = h.user("TAG-1").await;
    let reservation = h.engine.create_reservation(user.id, ONE_CELL, T0, T0).await.unwrap();

    let record = h.engine.expire_reservation(&reservation, T0 + MINUTE).await.unwrap().unwrap();
    assert_eq!(record.reason, RecordReason::NoShow);
    assert_eq!(record.plate, None);
    assert_eq!(record.charge, 4.0);

    assert_eq!(h.engine.expire_reservation(&reservation, T0 + MINUTE).await.unwrap(), None);
    assert_eq!(h.engine.records_of(user.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn expiry_follows_a_relocated_reservation() {
    let mut h = harness().await;
    let a = h.space_at(1.005, 1.005, hourly()).await;
    let b = h.space_at(1.015, 1.005, Fee::new(15 * MINUTE, 1.0)).await;
    let sensor = h.sensor(&a, 1).await;
    let holder = h.user("TAG-X").await;
    h.user("TAG-Y").await;
    let listed = h.engine.create_reservation(holder.id, ONE_CELL, T0, T0).await.unwrap();
    assert_eq!(listed.space, a.id);

    // The sweep listed the reservation on A, then an arrival moved it to B.
    h.engine.sensor_reports_arrival("TAG-Y", sensor.id, T0 + MINUTE).await.unwrap();
    h.drain();

    let record = h.engine.expire_reservation(&listed, T0 + 2 * MINUTE).await.unwrap().unwrap();
    assert_eq!(record.space, b.id);
    assert_eq!(record.charge, 4.0);
    let moved = Reservation {
        space: b.id,
        ..listed.clone()
    };
    assert_eq!(
        h.drain(),
        vec![
            DomainEvent::UserReservationExpired {
                user: holder.id,
                reservation: moved,
                charge: 4.0,
            },
            DomainEvent::SpaceFreed {
                space: b.id,
                cell: Cell::containing(1.015, 1.005),
                cancelled_reservation: true,
            },
        ]
    );
    h.wait_for_cache(b.id, false).await;
    h.wait_for_cache(a.id, true).await;
}

// ── Administration ───────────────────────────────────────

#[tokio::test]
async fn space_validation_and_soft_delete() {
    let h = harness().await;
    let loc = Location { latitude: 1.005, longitude: 1.005 };

    let err = h
        .engine
        .create_space(ObjectId::new(), loc, "A", hourly())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound("provider", _)));
    let err = h
        .engine
        .create_space(h.provider.id, Location { latitude: 91.0, longitude: 0.0 }, "A", hourly())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    let err = h
        .engine
        .create_space(h.provider.id, loc, "A", Fee::new(0, 1.0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let space = h.space_at(1.005, 1.005, hourly()).await;
    let user = h.user("TAG-1").await;
    let reservation = h.engine.create_reservation(user.id, ONE_CELL, T0, T0).await.unwrap();

    let err = h.engine.delete_space(space.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    h.engine.cancel_reservation(user.id, reservation.id).await.unwrap();
    let deleted = h.engine.delete_space(space.id).await.unwrap();
    assert!(deleted.deleted);
    assert!(h.engine.delete_space(space.id).await.unwrap().deleted);
    assert!(h.engine.space(space.id).await.unwrap().deleted);

    let err = h.engine.create_reservation(user.id, ONE_CELL, T0, T0).await.unwrap_err();
    assert_eq!(err, EngineError::NoAvailability);
    let err = h
        .engine
        .register_sensor(PhysicalAddress::new([1, 2, 3, 4, 5, 6]), space.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn vehicles_belong_to_one_user() {
    let h = harness().await;
    let user = h.user("TAG-1").await;

    let err = h
        .engine
        .register_user(vec![], vec!["TAG-1".into()])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let other = h.user("TAG-2").await;
    let err = h.engine.add_vehicle(other.id, "TAG-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // Re-adding your own tag is a no-op.
    let same = h.engine.add_vehicle(user.id, "TAG-1").await.unwrap();
    assert_eq!(same.vehicle_ids, vec!["TAG-1".to_string()]);

    let updated = h.engine.add_vehicle(user.id, "TAG-3").await.unwrap();
    assert_eq!(updated.vehicle_ids, vec!["TAG-1".to_string(), "TAG-3".to_string()]);
    let updated = h.engine.add_device(user.id, "phone-2").await.unwrap();
    assert_eq!(updated.device_ids.len(), 2);
    assert_eq!(h.engine.user(user.id).await.unwrap(), updated);

    let err = h.engine.add_device(ObjectId::new(), "phone").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn sensor_registration_and_authorization() {
    let h = harness().await;
    let a = h.space_at(1.005, 1.005, hourly()).await;
    let b = h.space_at(1.006, 1.006, hourly()).await;
    let sensor = h.sensor(&a, 1).await;
    assert_eq!(sensor.secret.len(), 16);

    // One sensor per address and per space.
    let err = h.engine.register_sensor(sensor.address, b.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = h
        .engine
        .register_sensor(PhysicalAddress::new([9, 9, 9, 9, 9, 9]), a.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let authorized = h.engine.authorize_sensor(sensor.address, &sensor.secret).await.unwrap();
    assert_eq!(authorized, sensor);
    let err = h.engine.authorize_sensor(sensor.address, "wrong").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    let err = h
        .engine
        .authorize_sensor(PhysicalAddress::new([7, 7, 7, 7, 7, 7]), &sensor.secret)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn store_errors_map_to_kinds() {
    let dup = StoreError::DuplicateKey {
        collection: Collection::Reservations,
        field: "space".into(),
        key: "x".into(),
    };
    assert_eq!(EngineError::from(dup).kind(), ErrorKind::Conflict);
    assert_eq!(
        EngineError::from(StoreError::Unavailable("down".into())).kind(),
        ErrorKind::StoreUnavailable
    );
    assert_eq!(ErrorKind::NoAvailability.as_str(), "no_availability");
    assert_eq!(ErrorKind::Forbidden.as_str(), "forbidden");
}
