use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "lessonbook_queries_total";

/// Histogram: command latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "lessonbook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "lessonbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "lessonbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "lessonbook_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "lessonbook_tenants_active";

/// Counter: logins that did not resolve to an actor.
pub const AUTH_FAILURES_TOTAL: &str = "lessonbook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "lessonbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "lessonbook_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "lessonbook_wal_compactions_total";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: booking state transitions. Labels: transition (hold, confirm, cancel, reschedule, expire).
pub const BOOKING_TRANSITIONS_TOTAL: &str = "lessonbook_booking_transitions_total";

/// Counter: outbox rows handled by the relay. Labels: outcome (processed, failed, requeued).
pub const OUTBOX_EVENTS_TOTAL: &str = "lessonbook_outbox_events_total";

/// Counter: notifications created and published.
pub const NOTIFICATIONS_SENT_TOTAL: &str = "lessonbook_notifications_sent_total";

/// Counter: packages moved to EXPIRED.
pub const PACKAGES_EXPIRED_TOTAL: &str = "lessonbook_packages_expired_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertUser { .. } => "insert_user",
        Command::SetUserActive { .. } => "set_user_active",
        Command::InsertTeacherProfile { .. } => "insert_teacher_profile",
        Command::UpdateTeacherProfile { .. } => "update_teacher_profile",
        Command::InsertSlot { .. } => "insert_slot",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::InsertPackage { .. } => "insert_package",
        Command::InsertPayment { .. } => "insert_payment",
        Command::SetPaymentStatus { .. } => "set_payment_status",
        Command::InsertHold { .. } => "insert_hold",
        Command::ConfirmBooking { .. } => "confirm_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::RescheduleBooking { .. } => "reschedule_booking",
        Command::UpdateLesson { .. } => "update_lesson",
        Command::RunJob { .. } => "run_job",
        Command::Select { view, .. } => view.label(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{Job, View};

    #[test]
    fn labels_are_distinct_per_view() {
        let a = Command::Select { view: View::OpenSlots, filters: Default::default() };
        let b = Command::Select { view: View::AuditLog, filters: Default::default() };
        assert_eq!(command_label(&a), "select_open_slots");
        assert_eq!(command_label(&b), "select_audit_log");
        assert_eq!(command_label(&Command::RunJob { job: Job::ProcessOutbox }), "run_job");
    }

    #[test]
    fn init_without_port_is_noop() {
        assert!(init(None).is_ok());
    }
}
