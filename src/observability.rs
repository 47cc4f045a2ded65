use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roomd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roomd_query_duration_seconds";

/// Counter: booking creates rejected because the slot was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "roomd_booking_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "roomd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomd_wal_flush_batch_size";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRoom { .. } => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::InsertBooking { .. } => "insert_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::UpdateBooking { .. } => "update_booking",
        Command::SelectRooms => "select_rooms",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAvailability { .. } => "select_availability",
        Command::Listen { .. } => "listen",
    }
}
