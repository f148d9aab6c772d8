use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

use crate::store::{Collection, Model};

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const SECOND: Ms = 1_000;
pub const MINUTE: Ms = 60 * SECOND;
pub const HOUR: Ms = 60 * MINUTE;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

// ── Identity ─────────────────────────────────────────────────────

static OBJECT_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// 12-byte document id: `[4: unix seconds BE][5: random][3: counter BE]`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    pub fn new() -> Self {
        let secs = (now_ms() / SECOND) as u32;
        let random = Ulid::new().random().to_be_bytes();
        let count = OBJECT_ID_COUNTER.fetch_add(1, Ordering::Relaxed).to_be_bytes();

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&random[11..16]);
        bytes[9..12].copy_from_slice(&count[1..4]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError(pub String);

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid id: {}", self.0)
    }
}

impl std::error::Error for ParseIdError {}

fn parse_hex_bytes<const N: usize>(s: &str) -> Option<[u8; N]> {
    if s.len() != N * 2 || !s.is_ascii() {
        return None;
    }
    let mut out = [0u8; N];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

impl FromStr for ObjectId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex_bytes::<12>(s)
            .map(Self)
            .ok_or_else(|| ParseIdError(s.to_string()))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 6-byte sensor hardware address, rendered `aa:bb:cc:dd:ee:ff`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalAddress([u8; 6]);

impl PhysicalAddress {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalAddress({self})")
    }
}

impl FromStr for PhysicalAddress {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(ParseIdError(s.to_string()));
        }
        let mut out = [0u8; 6];
        for (slot, part) in out.iter_mut().zip(parts) {
            *slot = parse_hex_bytes::<1>(part).ok_or_else(|| ParseIdError(s.to_string()))?[0];
        }
        Ok(Self(out))
    }
}

impl Serialize for PhysicalAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PhysicalAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Charge per started unit of time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fee {
    pub unit_time: Ms,
    pub charge: f64,
}

impl Fee {
    pub fn new(unit_time: Ms, charge: f64) -> Self {
        Self { unit_time, charge }
    }

    /// Billed units for `elapsed`, rounded up. Never undercharges a partial unit.
    pub fn units_for(&self, elapsed: Ms) -> i64 {
        if elapsed <= 0 || self.unit_time <= 0 {
            return 0;
        }
        (elapsed + self.unit_time - 1) / self.unit_time
    }

    pub fn charge_for(&self, elapsed: Ms) -> f64 {
        self.units_for(elapsed) as f64 * self.charge
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Government,
    Private,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub name: String,
    pub kind: ProviderKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Space {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub provider: ObjectId,
    pub location: Location,
    pub markings: String,
    pub fee: Fee,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    #[serde(default)]
    pub device_ids: Vec<String>,
    #[serde(default)]
    pub vehicle_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sensor {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub address: PhysicalAddress,
    pub secret: String,
    pub space: ObjectId,
}

/// A hold on a space ahead of arrival. At most one per space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub space: ObjectId,
    pub user: ObjectId,
    pub begin: Ms,
}

/// A vehicle currently occupying a space. At most one per space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkingSession {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub space: ObjectId,
    pub user: ObjectId,
    pub plate: String,
    pub begin: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordReason {
    Parking,
    NoShow,
}

/// Billed history entry. Immutable apart from `paid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub space: ObjectId,
    pub user: ObjectId,
    pub plate: Option<String>,
    pub begin: Ms,
    pub end: Ms,
    pub charge: f64,
    pub paid: bool,
    pub reason: RecordReason,
}

impl Record {
    /// Close a parking session at `end`, billing by the space's fee schedule.
    pub fn from_session(session: &ParkingSession, fee: &Fee, end: Ms) -> Self {
        Self {
            id: ObjectId::new(),
            space: session.space,
            user: session.user,
            plate: Some(session.plate.clone()),
            begin: session.begin,
            end,
            charge: fee.charge_for(end - session.begin),
            paid: false,
            reason: RecordReason::Parking,
        }
    }

    /// Flat one-hour charge against a reservation that was never honored.
    pub fn no_show(reservation: &Reservation, fee: &Fee, now: Ms) -> Self {
        Self {
            id: ObjectId::new(),
            space: reservation.space,
            user: reservation.user,
            plate: None,
            begin: reservation.begin,
            end: now,
            charge: fee.charge_for(HOUR),
            paid: false,
            reason: RecordReason::NoShow,
        }
    }
}

macro_rules! impl_model {
    ($ty:ty, $collection:expr) => {
        impl Model for $ty {
            const COLLECTION: Collection = $collection;

            fn id(&self) -> ObjectId {
                self.id
            }
        }
    };
}

impl_model!(Provider, Collection::Providers);
impl_model!(Space, Collection::Spaces);
impl_model!(User, Collection::Users);
impl_model!(Sensor, Collection::Sensors);
impl_model!(Reservation, Collection::Reservations);
impl_model!(ParkingSession, Collection::Parking);
impl_model!(Record, Collection::Records);
