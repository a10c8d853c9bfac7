use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use tokio::sync::mpsc;
use ulid::Ulid;

use crate::auth::AdvisorRegistry;
use crate::engine::Engine;
use crate::model::{Span, Ts};

pub const FROM_ADDR: &str = "Advisement Scheduler <no-reply@advisement-scheduler.example>";

/// Depth of the notification queue. Bookings use try_send and drop on
/// overflow, so a slow mailer never stalls the booking path.
pub const QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// Meeting created: invite the student to pick a slot.
    Invited,
    Booked,
    Cancelled,
}

/// What the engine hands the mailer after a meeting-state change. Carries
/// only ids plus the slot time; the mailer resolves names and addresses
/// itself so the booking path stays cheap.
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub kind: NotificationKind,
    pub meeting_id: Ulid,
    pub semester_id: Ulid,
    /// The booked (or previously booked) slot; None for invitations.
    pub slot_span: Option<Span>,
}

#[derive(Debug)]
pub struct MailError(pub String);

impl std::fmt::Display for MailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mail error: {}", self.0)
    }
}

impl std::error::Error for MailError {}

/// Delivery backend. Returns the provider-assigned message id, which keys
/// the later lifecycle callbacks.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        reply_to: Option<&str>,
    ) -> Result<String, MailError>;
}

/// Default backend: logs the message and mints a synthetic message id.
/// Useful for development and tests; lifecycle callbacks can still be
/// driven against the recorded id.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        _body: &str,
        _reply_to: Option<&str>,
    ) -> Result<String, MailError> {
        let message_id = format!("local-{}", Ulid::new());
        tracing::info!(%to, %subject, %message_id, from = FROM_ADDR, "mail dispatched");
        Ok(message_id)
    }
}

fn format_slot_time(t: Ts) -> String {
    match DateTime::from_timestamp(t, 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M UTC").to_string(),
        None => t.to_string(),
    }
}

fn contact_suffix(email: &Option<String>) -> String {
    match email {
        Some(e) => format!(" ({e})"),
        None => String::new(),
    }
}

pub(crate) fn render_student_invite(
    student_name: &str,
    advisor_name: &str,
    advisor_email: &str,
    meeting_link: &str,
) -> (String, String) {
    let subject = format!("Schedule your advisement meeting \u{2014} {advisor_name}");
    let body = format!(
        "Advisement meeting with {advisor_name}\n\
         Duration: 15 minutes\n\
         \n\
         Hi {student_name},\n\
         \n\
         {advisor_name} has invited you to schedule an advisement meeting. \
         Use the link below to view available time slots and book a time that \
         works for you.\n\
         \n\
         View Available Time Slots: {meeting_link}\n\
         \n\
         Questions? Reply to this email or contact your advisor directly at \
         {advisor_email}\n",
    );
    (subject, body)
}

pub(crate) fn render_booked(student_name: &str, student_email: &Option<String>, start: Ts) -> (String, String) {
    let when = format_slot_time(start);
    let subject = format!("{student_name} scheduled an advisement meeting");
    let body = format!(
        "Meeting Scheduled\n\
         Scheduled for {when}\n\
         \n\
         {student_name}{} has scheduled an advisement meeting for {when}.\n\
         \n\
         You can view and manage all upcoming meetings from your Advisement \
         Scheduler dashboard.\n\
         \n\
         This notification was sent automatically by Advisement Scheduler.\n",
        contact_suffix(student_email),
    );
    (subject, body)
}

pub(crate) fn render_cancelled(student_name: &str, student_email: &Option<String>, prior_start: Ts) -> (String, String) {
    let when = format_slot_time(prior_start);
    let subject = format!("{student_name} cancelled an advisement meeting");
    let body = format!(
        "Meeting Cancelled\n\
         No upcoming meeting\n\
         \n\
         {student_name}{} has cancelled their advisement meeting that was \
         scheduled for {when}.\n\
         \n\
         No action is required on your end, but you may want to follow up \
         with {student_name} to reschedule.\n\
         \n\
         This notification was sent automatically by Advisement Scheduler.\n",
        contact_suffix(student_email),
    );
    (subject, body)
}

/// Background task: drains the notification queue, composes the notice,
/// sends it, and records the email for lifecycle tracking. Failures are
/// logged and skipped; the triggering mutation is already committed.
///
/// Invitations go to the student (carrying their booking link); booking and
/// cancellation notices go to the advisor.
pub async fn run_mailer(
    engine: Arc<Engine>,
    registry: Arc<AdvisorRegistry>,
    mailer: Arc<dyn Mailer>,
    base_url: String,
    mut rx: mpsc::Receiver<NotificationRequest>,
) {
    while let Some(req) = rx.recv().await {
        let (semester, student, meeting) = match engine.meeting_context(req.meeting_id).await {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(meeting_id = %req.meeting_id, error = %e, "notification context lookup failed");
                continue;
            }
        };
        let advisor = match registry.by_id(&semester.advisor_id) {
            Some(a) => a,
            None => {
                tracing::warn!(advisor_id = %semester.advisor_id, "no registered advisor for notification");
                continue;
            }
        };

        let (to, subject, body, reply_to) = match req.kind {
            NotificationKind::Invited => {
                let Some(student_email) = student.email.clone() else {
                    tracing::debug!(meeting_id = %req.meeting_id, "student has no email, skipping invite");
                    continue;
                };
                let link = format!("{base_url}/meeting/{}", meeting.secret_code);
                let (subject, body) =
                    render_student_invite(&student.name, &advisor.name, &advisor.email, &link);
                (student_email, subject, body, Some(advisor.email.clone()))
            }
            NotificationKind::Booked => {
                let start = req.slot_span.map_or(0, |s| s.start);
                let (subject, body) = render_booked(&student.name, &student.email, start);
                (advisor.email.clone(), subject, body, student.email.clone())
            }
            NotificationKind::Cancelled => {
                let start = req.slot_span.map_or(0, |s| s.start);
                let (subject, body) = render_cancelled(&student.name, &student.email, start);
                (advisor.email.clone(), subject, body, student.email.clone())
            }
        };

        let message_id = match mailer.send(&to, &subject, &body, reply_to.as_deref()).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(%to, error = %e, "mail send failed");
                continue;
            }
        };
        metrics::counter!(crate::observability::EMAILS_SENT_TOTAL).increment(1);

        if let Err(e) = engine
            .record_email(advisor.id, message_id, to, subject, body, reply_to)
            .await
        {
            tracing::error!(error = %e, "failed to record email");
        }
    }
}
