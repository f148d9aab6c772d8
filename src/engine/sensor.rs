use tracing::{debug, info, warn};

use super::{Displacement, Engine, EngineError, cell_of};
use crate::limits::MAX_VEHICLE_ID_LEN;
use crate::model::*;
use crate::notify::DomainEvent;
use crate::observability as obs;
use crate::store::{ParkingLookup, ReservationLookup, StoreError};

/// Outcome of a sensor-reported arrival.
#[derive(Debug, Clone, PartialEq)]
pub struct Arrival {
    pub session: ParkingSession,
    /// Record of a stale session that was still open on the space.
    pub closed: Option<Record>,
    /// The arriving user's own reservation on this space, now consumed.
    pub honored: Option<Reservation>,
    /// Another user's reservation that stood on this space.
    pub displaced: Option<Displacement>,
}

impl Engine {
    async fn sensor_space(&self, sensor_id: ObjectId) -> Result<Space, EngineError> {
        let sensor = self
            .occupancy
            .sensor(sensor_id)
            .await?
            .ok_or_else(|| EngineError::not_found("sensor", sensor_id))?;
        self.require_space(sensor.space).await
    }

    /// A vehicle tagged `vehicle` pulled into the space watched by `sensor_id`.
    pub async fn sensor_reports_arrival(
        &self,
        vehicle: &str,
        sensor_id: ObjectId,
        now: Ms,
    ) -> Result<Arrival, EngineError> {
        if vehicle.is_empty() || vehicle.len() > MAX_VEHICLE_ID_LEN {
            return Err(EngineError::InvalidInput(format!("bad vehicle id {vehicle:?}")));
        }
        let user = self
            .occupancy
            .user_by_vehicle(vehicle)
            .await?
            .ok_or_else(|| EngineError::not_found("vehicle", vehicle))?;
        let space = self.sensor_space(sensor_id).await?;
        if space.deleted {
            return Err(EngineError::InvalidInput(format!("space {} is deleted", space.id)));
        }

        let closed = match self.occupancy.parking(ParkingLookup::BySpace(space.id)).await? {
            Some(stale) => {
                warn!(session = %stale.id, space = %space.id, "closing stale session before arrival");
                self.close_session(&space, &stale, now).await?
            }
            None => None,
        };

        let session = ParkingSession {
            id: ObjectId::new(),
            space: space.id,
            user: user.id,
            plate: vehicle.to_string(),
            begin: now,
        };
        match self.occupancy.insert_parking(&session).await {
            Ok(()) => {}
            Err(StoreError::DuplicateKey { .. }) => {
                return Err(EngineError::Conflict(format!(
                    "space {} was taken by a concurrent arrival",
                    space.id
                )));
            }
            Err(e) => return Err(e.into()),
        }
        metrics::counter!(obs::SESSIONS_STARTED_TOTAL).increment(1);
        info!(session = %session.id, space = %space.id, user = %user.id, "parked");

        let mut honored = None;
        let mut displaced = None;
        if let Some(reservation) = self
            .occupancy
            .reservation(ReservationLookup::BySpace(space.id))
            .await?
        {
            if reservation.user == user.id {
                if self.occupancy.remove_reservation(reservation.id, space.id).await? {
                    debug!(reservation = %reservation.id, "reservation honored");
                    honored = Some(reservation);
                }
            } else {
                displaced = Some(self.displace(&space, &reservation).await?);
            }
        }

        // Published last so that occupancy consumers end on "occupied" even
        // when a displaced reservation freed the space just before.
        self.publish(DomainEvent::SpaceParked {
            space: space.id,
            cell: cell_of(&space.location),
            user: user.id,
        });

        Ok(Arrival {
            session,
            closed,
            honored,
            displaced,
        })
    }

    /// The vehicle over `sensor_id` left. `Ok(None)` when there was no session,
    /// so repeated reports never produce a second Record.
    pub async fn sensor_reports_departure(
        &self,
        sensor_id: ObjectId,
        now: Ms,
    ) -> Result<Option<Record>, EngineError> {
        let space = self.sensor_space(sensor_id).await?;
        let Some(session) = self.occupancy.parking(ParkingLookup::BySpace(space.id)).await? else {
            warn!(space = %space.id, sensor = %sensor_id, "departure without a parking session");
            return Ok(None);
        };
        self.close_session(&space, &session, now).await
    }

    /// Remove the session and bill it. Whoever removes the session writes the Record.
    async fn close_session(
        &self,
        space: &Space,
        session: &ParkingSession,
        now: Ms,
    ) -> Result<Option<Record>, EngineError> {
        if !self.occupancy.remove_parking(session.id).await? {
            debug!(session = %session.id, "session already closed");
            return Ok(None);
        }
        let record = Record::from_session(session, &space.fee, now);
        self.occupancy.insert_record(&record).await?;
        metrics::counter!(obs::RECORDS_CREATED_TOTAL, "reason" => "parking").increment(1);
        info!(session = %session.id, charge = record.charge, "session closed");

        self.publish(DomainEvent::SpaceFreed {
            space: space.id,
            cell: cell_of(&space.location),
            cancelled_reservation: false,
        });
        Ok(Some(record))
    }
}
