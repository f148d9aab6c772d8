use std::net::SocketAddr;

// ── Arbitration ─────────────────────────────────────────────────

/// Counter: reservations inserted.
pub const RESERVATIONS_CREATED_TOTAL: &str = "parkgrid_reservations_created_total";

/// Counter: reservation or relocation writes that lost a uniqueness race.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "parkgrid_reservation_conflicts_total";

/// Counter: displaced reservations moved to another space.
pub const RELOCATIONS_TOTAL: &str = "parkgrid_relocations_total";

/// Counter: displaced reservations cancelled for lack of an alternative.
pub const DISPLACED_CANCELLATIONS_TOTAL: &str = "parkgrid_displaced_cancellations_total";

/// Counter: users owed compensation (amount not computed).
pub const COMPENSATION_PENDING_TOTAL: &str = "parkgrid_compensation_pending_total";

/// Counter: parking sessions started.
pub const SESSIONS_STARTED_TOTAL: &str = "parkgrid_sessions_started_total";

/// Counter: billing records written. Labels: reason.
pub const RECORDS_CREATED_TOTAL: &str = "parkgrid_records_created_total";

// ── Sweep ───────────────────────────────────────────────────────

pub const SWEEP_REMINDERS_TOTAL: &str = "parkgrid_sweep_reminders_total";
pub const SWEEP_EXPIRATIONS_TOTAL: &str = "parkgrid_sweep_expirations_total";

/// Counter: ticks abandoned on a store error.
pub const SWEEP_FAILURES_TOTAL: &str = "parkgrid_sweep_failures_total";

/// Histogram: sweep tick duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "parkgrid_sweep_duration_seconds";

// ── Notification ────────────────────────────────────────────────

/// Counter: sink deliveries that failed. Labels: sink.
pub const NOTIFY_FAILURES_TOTAL: &str = "parkgrid_notify_failures_total";

/// Counter: events dropped on a full sink queue. Labels: sink.
pub const NOTIFY_DROPPED_TOTAL: &str = "parkgrid_notify_dropped_total";

// ── Gateway ─────────────────────────────────────────────────────

/// Gauge: open gateway connections. Labels: port.
pub const CONNECTIONS_ACTIVE: &str = "parkgrid_connections_active";

/// Counter: gateway connections accepted. Labels: port.
pub const CONNECTIONS_TOTAL: &str = "parkgrid_connections_total";

/// Counter: connections turned away at the limit. Labels: port.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "parkgrid_connections_rejected_total";

/// Counter: sensor frames refused authorization.
pub const SENSOR_AUTH_FAILURES_TOTAL: &str = "parkgrid_sensor_auth_failures_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkgrid_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (ops per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkgrid_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
