//! Domain event fan-out.
//!
//! The engine publishes typed [`DomainEvent`]s and never waits on delivery.
//! Each [`EventSink`] drains its own queue on its own task, so a slow push
//! gateway cannot delay map deltas, and per-sink ordering is preserved.
//! Delivery is at-most-once: a full queue drops the event with a warning.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::cache::OccupancyCache;
use crate::grid::Cell;
use crate::model::{Ms, ObjectId, PhysicalAddress, Reservation};
use crate::push::{PushGateway, PushMessage};
use crate::store::OccupancyStore;

const CHANNEL_CAPACITY: usize = 256;
const SINK_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    SpaceReserved {
        space: ObjectId,
        cell: Cell,
        reservation: ObjectId,
    },
    SpaceParked {
        space: ObjectId,
        cell: Cell,
        user: ObjectId,
    },
    SpaceFreed {
        space: ObjectId,
        cell: Cell,
        cancelled_reservation: bool,
    },
    /// The reservation was moved off `from`; `reservation.space` is the new space.
    UserReservationChanged {
        user: ObjectId,
        reservation: Reservation,
        from: ObjectId,
    },
    UserReservationCancelled {
        user: ObjectId,
        reservation: Reservation,
        /// Displaced with no alternative. The amount owed is not computed here.
        compensation_due: bool,
    },
    ReservationStartingSoon {
        user: ObjectId,
        reservation: Reservation,
    },
    UserReservationExpired {
        user: ObjectId,
        reservation: Reservation,
        charge: f64,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::SpaceReserved { .. } => "reserved",
            DomainEvent::SpaceParked { .. } => "parked",
            DomainEvent::SpaceFreed { .. } => "freed",
            DomainEvent::UserReservationChanged { .. } => "userReservationChanged",
            DomainEvent::UserReservationCancelled { .. } => "userReservationCancelled",
            DomainEvent::ReservationStartingSoon { .. } => "reservationStartingSoon",
            DomainEvent::UserReservationExpired { .. } => "userReservationExpired",
        }
    }

    /// `(space, cell, occupied)` for space-level events.
    pub fn occupancy(&self) -> Option<(ObjectId, Cell, bool)> {
        match self {
            DomainEvent::SpaceReserved { space, cell, .. }
            | DomainEvent::SpaceParked { space, cell, .. } => Some((*space, *cell, true)),
            DomainEvent::SpaceFreed { space, cell, .. } => Some((*space, *cell, false)),
            _ => None,
        }
    }

    /// The user a device push goes to, for user-level events.
    pub fn user(&self) -> Option<ObjectId> {
        match self {
            DomainEvent::UserReservationChanged { user, .. }
            | DomainEvent::UserReservationCancelled { user, .. }
            | DomainEvent::ReservationStartingSoon { user, .. }
            | DomainEvent::UserReservationExpired { user, .. } => Some(*user),
            _ => None,
        }
    }
}

/// 13-byte map delta: 12-byte space id, then 1 for occupied or 0 for free.
pub fn occupancy_delta(space: ObjectId, occupied: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(13);
    buf.put_slice(space.bytes());
    buf.put_u8(occupied as u8);
    buf.freeze()
}

// ── Hubs ─────────────────────────────────────────────────

/// Live map viewers, keyed by cell id.
pub struct GridHub {
    channels: DashMap<String, broadcast::Sender<Bytes>>,
}

impl GridHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn subscribe(&self, cell: &Cell) -> broadcast::Receiver<Bytes> {
        self.channels
            .entry(cell.id())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody watches the cell.
    pub fn publish(&self, cell: &Cell, delta: Bytes) {
        if let Some(sender) = self.channels.get(&cell.id()) {
            let _ = sender.send(delta);
        }
    }

    /// Drop channels whose viewers have all gone.
    pub fn cleanup(&self) {
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
    }

    pub fn topics(&self) -> usize {
        self.channels.len()
    }
}

impl Default for GridHub {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SensorMessageKind {
    Reservation,
    CancelledReservation,
}

/// Server-initiated frame to a sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorMessage {
    #[serde(rename = "type")]
    pub kind: SensorMessageKind,
    pub destination: PhysicalAddress,
}

/// Connected sensors, keyed by hardware address.
pub struct SensorHub {
    connections: DashMap<PhysicalAddress, mpsc::Sender<SensorMessage>>,
}

impl SensorHub {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Bind `address` to a live connection, replacing any earlier binding.
    pub fn bind(&self, address: PhysicalAddress, tx: mpsc::Sender<SensorMessage>) {
        self.connections.insert(address, tx);
    }

    /// Unbind, but only if `tx` is still the bound connection.
    pub fn unbind(&self, address: PhysicalAddress, tx: &mpsc::Sender<SensorMessage>) {
        self.connections.remove_if(&address, |_, bound| bound.same_channel(tx));
    }

    /// `false` when the sensor is not connected or its queue is full.
    pub fn send(&self, address: PhysicalAddress, message: SensorMessage) -> bool {
        match self.connections.get(&address) {
            Some(tx) => tx.try_send(message).is_ok(),
            None => false,
        }
    }

    pub fn is_connected(&self, address: PhysicalAddress) -> bool {
        self.connections.contains_key(&address)
    }
}

impl Default for SensorHub {
    fn default() -> Self {
        Self::new()
    }
}

// ── Sinks ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SinkError(pub String);

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for SinkError {}

#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn dispatch(&self, event: &DomainEvent) -> Result<(), SinkError>;
}

/// Keeps the occupancy cache in step with space events.
pub struct OccupancySink {
    cache: Arc<dyn OccupancyCache>,
}

impl OccupancySink {
    pub fn new(cache: Arc<dyn OccupancyCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl EventSink for OccupancySink {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn dispatch(&self, event: &DomainEvent) -> Result<(), SinkError> {
        let Some((space, _, occupied)) = event.occupancy() else {
            return Ok(());
        };
        self.cache
            .set_occupied(space, occupied)
            .await
            .map_err(|e| SinkError(e.to_string()))
    }
}

/// Tells the space's sensor that a reservation is pending or was cancelled.
pub struct SensorSink {
    occupancy: OccupancyStore,
    hub: Arc<SensorHub>,
}

impl SensorSink {
    pub fn new(occupancy: OccupancyStore, hub: Arc<SensorHub>) -> Self {
        Self { occupancy, hub }
    }
}

#[async_trait]
impl EventSink for SensorSink {
    fn name(&self) -> &'static str {
        "sensor"
    }

    async fn dispatch(&self, event: &DomainEvent) -> Result<(), SinkError> {
        let (space, kind) = match event {
            DomainEvent::SpaceReserved { space, .. } => (*space, SensorMessageKind::Reservation),
            DomainEvent::SpaceFreed {
                space,
                cancelled_reservation: true,
                ..
            } => (*space, SensorMessageKind::CancelledReservation),
            _ => return Ok(()),
        };
        let sensor = self
            .occupancy
            .sensor_for_space(space)
            .await
            .map_err(|e| SinkError(e.to_string()))?;
        let Some(sensor) = sensor else {
            return Ok(());
        };
        let message = SensorMessage {
            kind,
            destination: sensor.address,
        };
        if !self.hub.send(sensor.address, message) {
            debug!("sensor {} not connected, dropping {kind:?}", sensor.address);
        }
        Ok(())
    }
}

/// Pushes 13-byte deltas to viewers of the affected cell.
pub struct GridSink {
    hub: Arc<GridHub>,
}

impl GridSink {
    pub fn new(hub: Arc<GridHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl EventSink for GridSink {
    fn name(&self) -> &'static str {
        "grid"
    }

    async fn dispatch(&self, event: &DomainEvent) -> Result<(), SinkError> {
        if let Some((space, cell, occupied)) = event.occupancy() {
            self.hub.publish(&cell, occupancy_delta(space, occupied));
        }
        Ok(())
    }
}

fn push_message(event: &DomainEvent) -> Option<PushMessage> {
    let (title, body, reservation) = match event {
        DomainEvent::UserReservationChanged { reservation, .. } => (
            "Reservation moved",
            "Your reserved space was taken. You have been moved to a free space nearby.".to_string(),
            reservation,
        ),
        DomainEvent::UserReservationCancelled {
            reservation,
            compensation_due,
            ..
        } => (
            "Reservation cancelled",
            if *compensation_due {
                "Your reserved space was taken and no other space was free nearby. You will be compensated.".to_string()
            } else {
                "Your reservation was cancelled.".to_string()
            },
            reservation,
        ),
        DomainEvent::ReservationStartingSoon { reservation, .. } => (
            "Reservation starts soon",
            "Your reserved space is waiting for you.".to_string(),
            reservation,
        ),
        DomainEvent::UserReservationExpired {
            reservation, charge, ..
        } => (
            "Reservation expired",
            format!("You did not arrive in time. A no-show charge of {charge:.2} was recorded."),
            reservation,
        ),
        _ => return None,
    };
    Some(PushMessage {
        title: title.to_string(),
        body,
        data: json!({
            "type": event.name(),
            "reservation": reservation.id.to_string(),
            "space": reservation.space.to_string(),
            "begin": reservation.begin,
        }),
    })
}

/// Sends user-level events to every registered device of the user.
pub struct PushSink {
    occupancy: OccupancyStore,
    gateway: Arc<dyn PushGateway>,
}

impl PushSink {
    pub fn new(occupancy: OccupancyStore, gateway: Arc<dyn PushGateway>) -> Self {
        Self { occupancy, gateway }
    }
}

#[async_trait]
impl EventSink for PushSink {
    fn name(&self) -> &'static str {
        "push"
    }

    async fn dispatch(&self, event: &DomainEvent) -> Result<(), SinkError> {
        let (Some(user), Some(message)) = (event.user(), push_message(event)) else {
            return Ok(());
        };
        let user = self
            .occupancy
            .user(user)
            .await
            .map_err(|e| SinkError(e.to_string()))?;
        let Some(user) = user else {
            return Ok(());
        };
        let mut failed = 0usize;
        for device in &user.device_ids {
            if let Err(e) = self.gateway.notify(device, &message).await {
                warn!("push to device {device} failed: {e}");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(SinkError(format!(
                "{failed} of {} devices unreachable",
                user.device_ids.len()
            )));
        }
        Ok(())
    }
}

// ── Notifier ─────────────────────────────────────────────

struct SinkQueue {
    name: &'static str,
    tx: mpsc::Sender<DomainEvent>,
}

async fn sink_worker(sink: Arc<dyn EventSink>, mut rx: mpsc::Receiver<DomainEvent>) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = sink.dispatch(&event).await {
            warn!(sink = sink.name(), event = event.name(), "notification failed: {e}");
            metrics::counter!(crate::observability::NOTIFY_FAILURES_TOTAL, "sink" => sink.name())
                .increment(1);
        }
    }
}

/// Owns the sinks and their worker tasks. Must be created inside a tokio runtime.
pub struct Notifier {
    observers: broadcast::Sender<(Ms, DomainEvent)>,
    queues: Vec<SinkQueue>,
}

impl Notifier {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        let queues = sinks
            .into_iter()
            .map(|sink| {
                let (tx, rx) = mpsc::channel(SINK_QUEUE_CAPACITY);
                let name = sink.name();
                tokio::spawn(sink_worker(sink, rx));
                SinkQueue { name, tx }
            })
            .collect();
        Self {
            observers: broadcast::channel(CHANNEL_CAPACITY).0,
            queues,
        }
    }

    /// Hand the event to every sink without waiting for delivery.
    pub fn publish(&self, event: DomainEvent) {
        debug!(event = event.name(), "publish");
        for queue in &self.queues {
            if queue.tx.try_send(event.clone()).is_err() {
                warn!(sink = queue.name, event = event.name(), "sink queue full, event dropped");
                metrics::counter!(crate::observability::NOTIFY_DROPPED_TOTAL, "sink" => queue.name)
                    .increment(1);
            }
        }
        let _ = self.observers.send((crate::model::now_ms(), event));
    }

    /// Every event published from now on, stamped with its publish time.
    pub fn subscribe(&self) -> broadcast::Receiver<(Ms, DomainEvent)> {
        self.observers.subscribe()
    }
}
