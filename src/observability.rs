use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands executed. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "slotbook_commands_total";

/// Histogram: command latency in seconds. Labels: command.
pub const COMMAND_DURATION_SECONDS: &str = "slotbook_command_duration_seconds";

/// Counter: committed bookings.
pub const BOOKINGS_TOTAL: &str = "slotbook_bookings_total";

/// Counter: booking cancellations.
pub const CANCELLATIONS_TOTAL: &str = "slotbook_cancellations_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Counter: failed hello attempts.
pub const AUTH_FAILURES_TOTAL: &str = "slotbook_auth_failures_total";

/// Counter: notification emails handed to the delivery backend.
pub const EMAILS_SENT_TOTAL: &str = "slotbook_emails_sent_total";

/// Counter: notifications dropped because the mailer queue was full.
pub const NOTIFICATIONS_DROPPED: &str = "slotbook_notifications_dropped_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

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

/// Map a Request variant to a short label for metrics.
pub fn command_label(req: &Request) -> &'static str {
    match req {
        Request::Hello { .. } => "hello",
        Request::CreateSemester { .. } => "create_semester",
        Request::DeleteSemester { .. } => "delete_semester",
        Request::ListSemesters => "list_semesters",
        Request::GetSemester { .. } => "get_semester",
        Request::ActiveSemester => "active_semester",
        Request::CreateSlot { .. } => "create_slot",
        Request::CreateSlots { .. } => "create_slots",
        Request::DeleteSlot { .. } => "delete_slot",
        Request::ListSlots { .. } => "list_slots",
        Request::CreateStudent { .. } => "create_student",
        Request::UpdateStudent { .. } => "update_student",
        Request::DeleteStudent { .. } => "delete_student",
        Request::ListStudents => "list_students",
        Request::CreateMeeting { .. } => "create_meeting",
        Request::DeleteMeeting { .. } => "delete_meeting",
        Request::ListMeetings { .. } => "list_meetings",
        Request::GetMeeting { .. } => "get_meeting",
        Request::ListOpenSlots { .. } => "list_open_slots",
        Request::Book { .. } => "book",
        Request::Cancel { .. } => "cancel",
        Request::CancelWithCode { .. } => "cancel_with_code",
        Request::ListEmails => "list_emails",
        Request::EmailEvent { .. } => "email_event",
        Request::Watch { .. } => "watch",
        Request::Unwatch { .. } => "unwatch",
    }
}
