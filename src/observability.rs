use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "allocd_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "allocd_query_duration_seconds";

/// Counter: mutations rejected because a resource was already booked.
pub const CONFLICTS_TOTAL: &str = "allocd_conflicts_total";

// ── Connections and tenants ─────────────────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "allocd_connections_active";

pub const CONNECTIONS_TOTAL: &str = "allocd_connections_total";

/// Counter: connections turned away at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "allocd_connections_rejected_total";

/// Gauge: tenants with a loaded engine.
pub const TENANTS_ACTIVE: &str = "allocd_tenants_active";

// ── WAL ─────────────────────────────────────────────────────────

pub const WAL_FLUSH_DURATION_SECONDS: &str = "allocd_wal_flush_duration_seconds";

/// Histogram: changes per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "allocd_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op without a port.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertUser { .. } => "insert_user",
        Command::UpdateUser { .. } => "update_user",
        Command::InsertResource { .. } => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::InsertEvent { .. } => "insert_event",
        Command::UpdateEvent { .. } => "update_event",
        Command::DeleteEvent { .. } => "delete_event",
        Command::InsertAllocation { .. } => "insert_allocation",
        Command::DeleteAllocation { .. } => "delete_allocation",
        Command::SelectUsers => "select_users",
        Command::SelectResources => "select_resources",
        Command::SelectEvents { .. } => "select_events",
        Command::SelectAllocations { .. } => "select_allocations",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectUtilization { .. } => "select_utilization",
    }
}
