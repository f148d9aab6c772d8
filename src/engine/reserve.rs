use std::collections::HashSet;

use tracing::{debug, info, warn};

use super::{Engine, EngineError, cell_of};
use crate::limits::{MAX_RESERVE_ATTEMPTS, RELOCATION_RADIUS};
use crate::model::*;
use crate::notify::DomainEvent;
use crate::observability as obs;
use crate::store::{ReservationLookup, StoreError};

/// What happened to a reservation that stood on a space someone else parked in.
#[derive(Debug, Clone, PartialEq)]
pub enum Displacement {
    /// Moved to a free space nearby.
    Relocated { reservation: Reservation, from: ObjectId },
    /// Nothing free nearby; the holder is owed compensation.
    Cancelled { reservation: Reservation },
    /// Cancelled or moved by another path before we got to it.
    Vanished,
}

impl Engine {
    /// Reserve the first free space in `grid_spec` for `user`, starting at `begin`.
    pub async fn create_reservation(
        &self,
        user: ObjectId,
        grid_spec: &str,
        begin: Ms,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        self.reserve(user, None, grid_spec, begin, now).await
    }

    /// Same as [`create_reservation`](Self::create_reservation), limited to one provider's spaces.
    pub async fn create_provider_reservation(
        &self,
        user: ObjectId,
        provider: ObjectId,
        grid_spec: &str,
        begin: Ms,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        self.reserve(user, Some(provider), grid_spec, begin, now).await
    }

    async fn reserve(
        &self,
        user: ObjectId,
        provider: Option<ObjectId>,
        grid_spec: &str,
        begin: Ms,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        // Reject bad or oversized grids before touching the store.
        let cells = self.grid.cells_covering(grid_spec)?;
        if begin < now {
            return Err(EngineError::InvalidInput(format!(
                "reservation begins in the past ({begin} < {now})"
            )));
        }
        if self.occupancy.user(user).await?.is_none() {
            return Err(EngineError::not_found("user", user));
        }

        let mut tried = HashSet::new();
        for attempt in 1..=MAX_RESERVE_ATTEMPTS {
            let free = self
                .occupancy
                .find_free_spaces_in_cells(provider, &cells)
                .await?;
            let Some(space) = free.into_iter().find(|s| !tried.contains(&s.id)) else {
                break;
            };
            tried.insert(space.id);

            let reservation = Reservation {
                id: ObjectId::new(),
                space: space.id,
                user,
                begin,
            };
            match self.occupancy.insert_reservation(&reservation).await {
                Ok(()) => {
                    metrics::counter!(obs::RESERVATIONS_CREATED_TOTAL).increment(1);
                    info!(reservation = %reservation.id, space = %space.id, %user, "reserved");
                    self.publish(DomainEvent::SpaceReserved {
                        space: space.id,
                        cell: cell_of(&space.location),
                        reservation: reservation.id,
                    });
                    return Ok(reservation);
                }
                Err(StoreError::DuplicateKey { .. }) => {
                    metrics::counter!(obs::RESERVATION_CONFLICTS_TOTAL).increment(1);
                    debug!(space = %space.id, attempt, "lost reservation race, trying next candidate");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::NoAvailability)
    }

    /// Cancel `user`'s own reservation.
    pub async fn cancel_reservation(
        &self,
        user: ObjectId,
        reservation_id: ObjectId,
    ) -> Result<Reservation, EngineError> {
        for _ in 0..MAX_RESERVE_ATTEMPTS {
            let reservation = self
                .occupancy
                .reservation(ReservationLookup::ById(reservation_id))
                .await?
                .ok_or_else(|| EngineError::not_found("reservation", reservation_id))?;
            if reservation.user != user {
                return Err(EngineError::Forbidden(format!(
                    "reservation {reservation_id} belongs to another user"
                )));
            }
            // Conditional on the space just read, so a concurrent relocation
            // is followed rather than freeing the old space.
            if !self
                .occupancy
                .remove_reservation(reservation.id, reservation.space)
                .await?
            {
                debug!(reservation = %reservation_id, "reservation moved while cancelling, re-reading");
                continue;
            }
            info!(reservation = %reservation.id, space = %reservation.space, "cancelled");

            let space = self.require_space(reservation.space).await?;
            self.publish(DomainEvent::SpaceFreed {
                space: space.id,
                cell: cell_of(&space.location),
                cancelled_reservation: true,
            });
            return Ok(reservation);
        }
        Err(EngineError::Conflict(format!(
            "reservation {reservation_id} kept moving while cancelling"
        )))
    }

    /// Move `displaced` off `space` to a free space in the surrounding cells,
    /// or cancel it if there is none.
    ///
    /// The reservation is re-read before every write, and the write itself is
    /// conditional on the reservation still sitting on `space`, so a concurrent
    /// cancellation or expiry is observed as [`Displacement::Vanished`].
    pub(super) async fn displace(
        &self,
        space: &Space,
        displaced: &Reservation,
    ) -> Result<Displacement, EngineError> {
        let around = cell_of(&space.location).neighborhood(RELOCATION_RADIUS);
        let mut tried = HashSet::from([space.id]);

        for _ in 0..MAX_RESERVE_ATTEMPTS {
            let current = self
                .occupancy
                .reservation(ReservationLookup::ById(displaced.id))
                .await?;
            let Some(current) = current.filter(|r| r.space == space.id) else {
                debug!(reservation = %displaced.id, "displaced reservation already gone");
                return Ok(Displacement::Vanished);
            };

            let free = self.occupancy.find_free_spaces_in_cells(None, &around).await?;
            let Some(target) = free.into_iter().find(|s| !tried.contains(&s.id)) else {
                break;
            };
            tried.insert(target.id);

            match self.occupancy.relocate_reservation(&current, target.id).await {
                Ok(true) => {
                    let moved = Reservation {
                        space: target.id,
                        ..current
                    };
                    metrics::counter!(obs::RELOCATIONS_TOTAL).increment(1);
                    info!(reservation = %moved.id, from = %space.id, to = %target.id, "relocated");
                    self.publish(DomainEvent::SpaceReserved {
                        space: target.id,
                        cell: cell_of(&target.location),
                        reservation: moved.id,
                    });
                    self.publish(DomainEvent::UserReservationChanged {
                        user: moved.user,
                        reservation: moved.clone(),
                        from: space.id,
                    });
                    return Ok(Displacement::Relocated {
                        reservation: moved,
                        from: space.id,
                    });
                }
                Ok(false) => {
                    debug!(reservation = %displaced.id, "displaced reservation changed under us");
                    return Ok(Displacement::Vanished);
                }
                Err(StoreError::DuplicateKey { .. }) => {
                    metrics::counter!(obs::RESERVATION_CONFLICTS_TOTAL).increment(1);
                    debug!(target = %target.id, "relocation target taken, trying next");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !self.occupancy.remove_reservation(displaced.id, space.id).await? {
            debug!(reservation = %displaced.id, "displaced reservation moved or gone before cancel");
            return Ok(Displacement::Vanished);
        }
        metrics::counter!(obs::DISPLACED_CANCELLATIONS_TOTAL).increment(1);
        metrics::counter!(obs::COMPENSATION_PENDING_TOTAL).increment(1);
        warn!(
            reservation = %displaced.id,
            user = %displaced.user,
            space = %space.id,
            "displaced reservation cancelled with no alternative, compensation pending"
        );
        self.publish(DomainEvent::SpaceFreed {
            space: space.id,
            cell: cell_of(&space.location),
            cancelled_reservation: true,
        });
        self.publish(DomainEvent::UserReservationCancelled {
            user: displaced.user,
            reservation: displaced.clone(),
            compensation_due: true,
        });
        Ok(Displacement::Cancelled {
            reservation: displaced.clone(),
        })
    }

    /// Reclaim a reservation nobody showed up for, billing a flat hour.
    ///
    /// `reservation` may be a stale listing: the reservation is re-read and
    /// expired wherever it sits now. `Ok(None)` when another path already
    /// removed it.
    pub async fn expire_reservation(
        &self,
        reservation: &Reservation,
        now: Ms,
    ) -> Result<Option<Record>, EngineError> {
        let Some(current) = self
            .occupancy
            .reservation(ReservationLookup::ById(reservation.id))
            .await?
        else {
            debug!(reservation = %reservation.id, "expired reservation already gone");
            return Ok(None);
        };
        let space = self.require_space(current.space).await?;
        if !self.occupancy.remove_reservation(current.id, current.space).await? {
            debug!(reservation = %current.id, "expired reservation moved or gone, next sweep retries");
            return Ok(None);
        }
        let record = Record::no_show(&current, &space.fee, now);
        self.occupancy.insert_record(&record).await?;
        metrics::counter!(obs::RECORDS_CREATED_TOTAL, "reason" => "no_show").increment(1);
        info!(reservation = %current.id, space = %space.id, charge = record.charge, "reservation expired");

        self.publish(DomainEvent::UserReservationExpired {
            user: current.user,
            reservation: current.clone(),
            charge: record.charge,
        });
        self.publish(DomainEvent::SpaceFreed {
            space: space.id,
            cell: cell_of(&space.location),
            cancelled_reservation: true,
        });
        Ok(Some(record))
    }

    /// Tell the holder their reservation is about to begin.
    pub fn remind(&self, reservation: &Reservation) {
        self.publish(DomainEvent::ReservationStartingSoon {
            user: reservation.user,
            reservation: reservation.clone(),
        });
    }
}
