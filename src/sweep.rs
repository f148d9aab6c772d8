//! Periodic reconciliation: starting-soon reminders, no-show expiry, and WAL
//! compaction.
//!
//! The reminder boundary lives in process memory. Running more than one
//! sweeper against the same store double-notifies and double-bills.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::engine::{Engine, EngineError};
use crate::model::{Ms, now_ms};
use crate::observability as obs;
use crate::store::MemoryStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reminded: usize,
    pub expired: usize,
}

pub struct Sweeper {
    engine: Arc<Engine>,
    lead: Ms,
    grace: Ms,
    /// Reminders have gone out for every reservation beginning before this.
    reminded_until: Ms,
}

impl Sweeper {
    pub fn new(engine: Arc<Engine>, lead: Ms, grace: Ms, start: Ms) -> Self {
        Self {
            engine,
            lead,
            grace,
            reminded_until: start,
        }
    }

    pub fn reminded_until(&self) -> Ms {
        self.reminded_until
    }

    /// One pass. A store error abandons the rest of the tick; whatever was not
    /// handled is picked up by the next one.
    pub async fn tick(&mut self, now: Ms) -> Result<SweepReport, EngineError> {
        let mut report = SweepReport::default();
        let occupancy = self.engine.occupancy();

        let horizon = now + self.lead;
        if horizon > self.reminded_until {
            let upcoming = occupancy
                .reservations_beginning_in(self.reminded_until, horizon)
                .await?;
            for reservation in &upcoming {
                self.engine.remind(reservation);
            }
            report.reminded = upcoming.len();
            // Only advance once the whole window went out.
            self.reminded_until = horizon;
        }

        for reservation in occupancy.reservations_begun_before(now - self.grace).await? {
            if self.engine.expire_reservation(&reservation, now).await?.is_some() {
                report.expired += 1;
            }
        }

        metrics::counter!(obs::SWEEP_REMINDERS_TOTAL).increment(report.reminded as u64);
        metrics::counter!(obs::SWEEP_EXPIRATIONS_TOTAL).increment(report.expired as u64);
        Ok(report)
    }

    /// Tick every `every` forever. Failed ticks are logged and counted, never fatal.
    pub async fn run(mut self, every: Duration) {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let started = Instant::now();
            match self.tick(now_ms()).await {
                Ok(report) if report != SweepReport::default() => {
                    info!(reminded = report.reminded, expired = report.expired, "sweep");
                }
                Ok(_) => debug!("sweep: nothing to do"),
                Err(e) => {
                    error!("sweep tick failed: {e}");
                    metrics::counter!(obs::SWEEP_FAILURES_TOTAL).increment(1);
                }
            }
            metrics::histogram!(obs::SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        }
    }
}

/// Compact the store's WAL whenever it has grown by `threshold` appends.
pub async fn run_compactor(store: Arc<MemoryStore>, threshold: u64, every: Duration) {
    if !store.is_durable() {
        return;
    }
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!(appends, "WAL compacted"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}
