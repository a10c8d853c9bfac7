mod contact;
mod error;
mod mutations;
mod queries;
mod validate;

pub use error::EngineError;
pub use queries::SemesterRef;
pub use validate::now_ts;

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;
use uuid::Uuid;

use crate::mailer::NotificationRequest;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSemesterState = Arc<RwLock<SemesterState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(
    batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>,
    result: &io::Result<()>,
) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    /// Semester metadata, duplicated outside the per-semester lock so
    /// overlap checks and the active-semester scan stay lock-free.
    pub(super) semesters: DashMap<Ulid, Semester>,
    /// Everything scoped to a semester, behind one write lock per semester.
    pub state: DashMap<Ulid, SharedSemesterState>,
    pub(super) students: DashMap<Ulid, Student>,
    pub(super) emails: DashMap<Ulid, Email>,
    /// Reverse lookups: slot/meeting id → owning semester id.
    pub(super) slot_to_semester: DashMap<Ulid, Ulid>,
    pub(super) meeting_to_semester: DashMap<Ulid, Ulid>,
    /// Secret code → meeting id; also the collision check for code generation.
    pub(super) code_to_meeting: DashMap<Uuid, Ulid>,
    /// Delivery-provider message id → email record id.
    pub(super) message_to_email: DashMap<String, Ulid>,
    /// Serializes semester creation so two concurrent creates cannot both
    /// pass the per-advisor overlap scan.
    pub(super) semester_create_lock: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    mail_tx: OnceLock<mpsc::Sender<NotificationRequest>>,
}

/// Apply a semester-scoped event to a SemesterState (no locking — caller
/// holds the lock). Index maps are updated alongside.
fn apply_to_semester(
    ss: &mut SemesterState,
    event: &Event,
    students: &DashMap<Ulid, Student>,
    slot_index: &DashMap<Ulid, Ulid>,
    meeting_index: &DashMap<Ulid, Ulid>,
    code_index: &DashMap<Uuid, Ulid>,
) {
    match event {
        Event::SlotCreated { id, semester_id, span } => {
            ss.insert_slot(TimeSlot { id: *id, span: *span });
            slot_index.insert(*id, *semester_id);
        }
        Event::SlotDeleted { id, .. } => {
            ss.remove_slot(*id);
            slot_index.remove(id);
        }
        Event::MeetingCreated {
            id,
            semester_id,
            student_id,
            secret_code,
        } => {
            ss.meetings.push(Meeting {
                id: *id,
                student_id: *student_id,
                secret_code: *secret_code,
                time_slot_id: None,
            });
            meeting_index.insert(*id, *semester_id);
            code_index.insert(*secret_code, *id);
        }
        Event::MeetingDeleted { id, .. } => {
            if let Some(meeting) = ss.remove_meeting(*id) {
                code_index.remove(&meeting.secret_code);
            }
            meeting_index.remove(id);
        }
        Event::MeetingBooked {
            id,
            time_slot_id,
            student_email,
            student_phone,
            ..
        } => {
            if let Some(meeting) = ss.meeting_mut(*id) {
                meeting.time_slot_id = Some(*time_slot_id);
                if let Some(mut student) = students.get_mut(&meeting.student_id) {
                    if student_email.is_some() {
                        student.email = student_email.clone();
                    }
                    if student_phone.is_some() {
                        student.phone = student_phone.clone();
                    }
                }
            }
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(meeting) = ss.meeting_mut(*id) {
                meeting.time_slot_id = None;
            }
        }
        // Top-level events are handled at the DashMap level, not here
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            semesters: DashMap::new(),
            state: DashMap::new(),
            students: DashMap::new(),
            emails: DashMap::new(),
            slot_to_semester: DashMap::new(),
            meeting_to_semester: DashMap::new(),
            code_to_meeting: DashMap::new(),
            message_to_email: DashMap::new(),
            semester_create_lock: Mutex::new(()),
            wal_tx,
            notify,
            mail_tx: OnceLock::new(),
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly (no contention). Never use blocking_write here
        // because this may run inside an async context.
        for event in &events {
            if let Some(semester_id) = event_semester_id(event) {
                if let Some(entry) = engine.state.get(&semester_id) {
                    let ss_arc = entry.clone();
                    let mut guard = ss_arc.try_write().expect("replay: uncontended write");
                    apply_to_semester(
                        &mut guard,
                        event,
                        &engine.students,
                        &engine.slot_to_semester,
                        &engine.meeting_to_semester,
                        &engine.code_to_meeting,
                    );
                }
            } else {
                engine.apply_top_level(event);
            }
        }

        Ok(engine)
    }

    /// Apply an event that lives outside any per-semester lock.
    fn apply_top_level(&self, event: &Event) {
        match event {
            Event::SemesterCreated {
                id,
                advisor_id,
                display_name,
                span,
            } => {
                let semester = Semester {
                    id: *id,
                    advisor_id: *advisor_id,
                    display_name: display_name.clone(),
                    span: *span,
                };
                self.semesters.insert(*id, semester.clone());
                self.state
                    .insert(*id, Arc::new(RwLock::new(SemesterState::new(semester))));
            }
            Event::SemesterDeleted { id } => {
                // Live deletes cascade their index entries under the semester
                // lock before the event is applied; this branch only runs
                // during replay, where the state arcs have no other holders.
                if let Some((_, ss_arc)) = self.state.remove(id)
                    && let Ok(ss) = ss_arc.try_read()
                {
                    for slot in &ss.slots {
                        self.slot_to_semester.remove(&slot.id);
                    }
                    for meeting in &ss.meetings {
                        self.meeting_to_semester.remove(&meeting.id);
                        self.code_to_meeting.remove(&meeting.secret_code);
                    }
                }
                self.semesters.remove(id);
            }
            Event::StudentCreated {
                id,
                advisor_id,
                name,
                email,
                phone,
            } => {
                self.students.insert(
                    *id,
                    Student {
                        id: *id,
                        advisor_id: *advisor_id,
                        name: name.clone(),
                        email: email.clone(),
                        phone: phone.clone(),
                    },
                );
            }
            Event::StudentUpdated { id, name, email, phone } => {
                if let Some(mut student) = self.students.get_mut(id) {
                    student.name = name.clone();
                    student.email = email.clone();
                    student.phone = phone.clone();
                }
            }
            Event::StudentDeleted { id } => {
                self.students.remove(id);
            }
            Event::EmailQueued {
                id,
                owner_id,
                message_id,
                to,
                subject,
                body,
                reply_to,
            } => {
                self.emails.insert(
                    *id,
                    Email {
                        id: *id,
                        owner_id: *owner_id,
                        message_id: message_id.clone(),
                        status: EmailStatus::Queued,
                        to: to.clone(),
                        subject: subject.clone(),
                        body: body.clone(),
                        reply_to: reply_to.clone(),
                    },
                );
                self.message_to_email.insert(message_id.clone(), *id);
            }
            Event::EmailStatusChanged { id, status } => {
                if let Some(mut email) = self.emails.get_mut(id) {
                    email.status = *status;
                }
            }
            // Semester-scoped events never reach here
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_semester_state(&self, id: &Ulid) -> Option<SharedSemesterState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn semester_for_slot(&self, slot_id: &Ulid) -> Option<Ulid> {
        self.slot_to_semester.get(slot_id).map(|e| *e.value())
    }

    pub fn semester_for_meeting(&self, meeting_id: &Ulid) -> Option<Ulid> {
        self.meeting_to_semester.get(meeting_id).map(|e| *e.value())
    }

    pub fn meeting_by_code(&self, code: &Uuid) -> Option<Ulid> {
        self.code_to_meeting.get(code).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call, for semester-scoped events.
    /// Caller holds the semester write lock.
    pub(super) async fn persist_and_apply(
        &self,
        semester_id: Ulid,
        ss: &mut SemesterState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_semester(
            ss,
            event,
            &self.students,
            &self.slot_to_semester,
            &self.meeting_to_semester,
            &self.code_to_meeting,
        );
        self.notify.send(semester_id, event);
        Ok(())
    }

    /// WAL-append + apply for events outside any semester lock. Semester
    /// creation still notifies watchers of that semester; deletion bypasses
    /// this path and notifies from under the semester lock.
    pub(super) async fn persist_top_level(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_top_level(event);
        if let Event::SemesterCreated { id, .. } = event {
            self.notify.send(*id, event);
        }
        Ok(())
    }

    /// Lookup meeting → semester, acquire its write lock.
    pub(super) async fn resolve_meeting_write(
        &self,
        meeting_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<SemesterState>), EngineError> {
        let semester_id = self
            .semester_for_meeting(meeting_id)
            .ok_or(EngineError::NotFound("meeting"))?;
        let ss = self
            .get_semester_state(&semester_id)
            .ok_or(EngineError::NotFound("semester"))?;
        let guard = ss.write_owned().await;
        Ok((semester_id, guard))
    }

    /// Wire up the outbound notification channel. Called once at startup,
    /// after the mailer task exists; bookings before that are not notified.
    pub fn set_mail_tx(&self, tx: mpsc::Sender<NotificationRequest>) {
        let _ = self.mail_tx.set(tx);
    }

    /// Fire-and-forget dispatch to the mailer. A full queue drops the
    /// notification rather than stalling the booking path.
    pub(super) fn dispatch_notification(&self, req: NotificationRequest) {
        if let Some(tx) = self.mail_tx.get()
            && tx.try_send(req).is_err()
        {
            tracing::warn!("notification queue full, dropping");
            metrics::counter!(crate::observability::NOTIFICATIONS_DROPPED).increment(1);
        }
    }
}

/// Extract the owning semester id from a semester-scoped event.
fn event_semester_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::SlotCreated { semester_id, .. }
        | Event::SlotDeleted { semester_id, .. }
        | Event::MeetingCreated { semester_id, .. }
        | Event::MeetingDeleted { semester_id, .. }
        | Event::MeetingBooked { semester_id, .. }
        | Event::BookingCancelled { semester_id, .. } => Some(*semester_id),
        _ => None,
    }
}
