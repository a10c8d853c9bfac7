use tokio::sync::oneshot;
use ulid::Ulid;
use uuid::Uuid;

use crate::limits::*;
use crate::mailer::{NotificationKind, NotificationRequest};
use crate::model::*;

use super::contact::{merge_contact, validate_email, validate_phone};
use super::queries::SemesterRef;
use super::validate::{
    check_slot_bounds, find_semester_overlap, find_slot_overlap, format_ts,
    validate_semester_dates,
};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_semester(
        &self,
        advisor_id: Ulid,
        display_name: String,
        start: Ts,
        end: Ts,
    ) -> Result<Ulid, EngineError> {
        if self.semesters.len() >= MAX_SEMESTERS {
            return Err(EngineError::LimitExceeded("too many semesters"));
        }
        if display_name.chars().count() > MAX_NAME_LEN {
            return Err(EngineError::Validation(
                "Display name cannot be more than 50 characters".into(),
            ));
        }
        let span = validate_semester_dates(start, end)?;

        // Two concurrent creates must not both pass the overlap scan.
        let _create_guard = self.semester_create_lock.lock().await;
        let existing: Vec<Semester> = self.semesters.iter().map(|e| e.value().clone()).collect();
        if let Some(overlapping) = find_semester_overlap(existing.iter(), advisor_id, &span) {
            return Err(EngineError::Conflict(format!(
                "New semester overlaps with existing semester: {}",
                overlapping.display_name
            )));
        }

        let id = Ulid::new();
        let event = Event::SemesterCreated {
            id,
            advisor_id,
            display_name,
            span,
        };
        self.persist_top_level(&event).await?;
        Ok(id)
    }

    pub async fn delete_semester(&self, advisor_id: Ulid, id: Ulid) -> Result<(), EngineError> {
        let semester = self
            .semesters
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound("semester"))?;
        if semester.advisor_id != advisor_id {
            return Err(EngineError::Forbidden("You can only delete your own semesters"));
        }

        let ss = self
            .get_semester_state(&id)
            .ok_or(EngineError::NotFound("semester"))?;
        // Hold the write lock across the delete so no slot or meeting can
        // land between the index cleanup and the map removal. A concurrent
        // mutation waits here and finds the semester gone when it resolves.
        let guard = ss.write().await;

        let event = Event::SemesterDeleted { id };
        self.wal_append(&event).await?;

        // Cascade: drop index entries for everything the semester held.
        for slot in &guard.slots {
            self.slot_to_semester.remove(&slot.id);
        }
        for meeting in &guard.meetings {
            self.meeting_to_semester.remove(&meeting.id);
            self.code_to_meeting.remove(&meeting.secret_code);
        }
        self.state.remove(&id);
        self.semesters.remove(&id);

        // Final event on the channel, then tear it down.
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    pub async fn create_time_slot(
        &self,
        advisor_id: Ulid,
        semester: SemesterRef,
        start: Ts,
    ) -> Result<Ulid, EngineError> {
        let semester = self.resolve_semester(advisor_id, semester)?;
        let ss = self
            .get_semester_state(&semester.id)
            .ok_or(EngineError::NotFound("semester"))?;
        let mut guard = ss.write().await;
        if guard.slots.len() >= MAX_SLOTS_PER_SEMESTER {
            return Err(EngineError::LimitExceeded("too many slots in semester"));
        }

        let span = check_slot_bounds(&semester.span, start, false)?;
        if find_slot_overlap(&guard, &span).is_some() {
            return Err(EngineError::Conflict("New slot overlaps with existing slot".into()));
        }

        let id = Ulid::new();
        let event = Event::SlotCreated {
            id,
            semester_id: semester.id,
            span,
        };
        self.persist_and_apply(semester.id, &mut guard, &event).await?;
        Ok(id)
    }

    /// Atomically create a batch of slots. All-or-nothing: every candidate
    /// is validated against the semester bounds, the existing slots, and the
    /// rest of the batch before anything is committed.
    pub async fn create_time_slots(
        &self,
        advisor_id: Ulid,
        semester: SemesterRef,
        starts: Vec<Ts>,
        timezone: Option<String>,
    ) -> Result<Vec<Ulid>, EngineError> {
        if starts.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        // The client picks starts in its own timezone but sends unix seconds;
        // the zone is only useful for tracing a misbehaving client.
        if let Some(tz) = &timezone {
            tracing::debug!(timezone = %tz, count = starts.len(), "bulk slot creation");
        }

        // Resolve even for an empty batch, so a bad semester reference is
        // still reported.
        let semester = self.resolve_semester(advisor_id, semester)?;
        if starts.is_empty() {
            return Ok(Vec::new());
        }
        let ss = self
            .get_semester_state(&semester.id)
            .ok_or(EngineError::NotFound("semester"))?;
        let mut guard = ss.write().await;
        if guard.slots.len() + starts.len() > MAX_SLOTS_PER_SEMESTER {
            return Err(EngineError::LimitExceeded("too many slots in semester"));
        }

        // Phase 1: validate bounds, then every candidate against the
        // existing slots, then pairwise within the batch. An existing-slot
        // conflict anywhere in the batch wins over a pairwise one.
        let mut candidates = Vec::with_capacity(starts.len());
        for start in &starts {
            candidates.push(check_slot_bounds(&semester.span, *start, true)?);
        }
        for span in &candidates {
            if let Some(existing) = find_slot_overlap(&guard, span) {
                return Err(EngineError::Conflict(format!(
                    "New slot overlaps with existing slot at {}",
                    format_ts(existing.span.start)
                )));
            }
        }
        for (i, span) in candidates.iter().enumerate() {
            if candidates[..i].iter().any(|other| other.overlaps(span)) {
                return Err(EngineError::Conflict(
                    "Some of the selected times overlap with each other".into(),
                ));
            }
        }

        // Phase 2: all validated — commit the batch.
        let mut ids = Vec::with_capacity(candidates.len());
        for span in candidates {
            let id = Ulid::new();
            let event = Event::SlotCreated {
                id,
                semester_id: semester.id,
                span,
            };
            self.persist_and_apply(semester.id, &mut guard, &event).await?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Delete a slot; returns the owning semester id. A slot booked into a
    /// meeting cannot be deleted.
    pub async fn delete_time_slot(
        &self,
        advisor_id: Ulid,
        slot_id: Ulid,
    ) -> Result<Ulid, EngineError> {
        let semester_id = self
            .semester_for_slot(&slot_id)
            .ok_or(EngineError::NotFound("time slot"))?;
        let semester = self
            .semesters
            .get(&semester_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound("semester"))?;
        if semester.advisor_id != advisor_id {
            return Err(EngineError::Forbidden(
                "You cannot delete time slots you did not create",
            ));
        }

        let ss = self
            .get_semester_state(&semester_id)
            .ok_or(EngineError::NotFound("semester"))?;
        let mut guard = ss.write().await;
        if guard.slot(slot_id).is_none() {
            return Err(EngineError::NotFound("time slot"));
        }
        if guard.booking_for_slot(slot_id).is_some() {
            return Err(EngineError::Conflict(
                "Cannot delete a time slot with an associated meeting".into(),
            ));
        }

        let event = Event::SlotDeleted {
            id: slot_id,
            semester_id,
        };
        self.persist_and_apply(semester_id, &mut guard, &event).await?;
        Ok(semester_id)
    }

    pub async fn create_student(
        &self,
        advisor_id: Ulid,
        name: String,
        email: Option<String>,
        phone: Option<String>,
    ) -> Result<Ulid, EngineError> {
        if self.students.len() >= MAX_STUDENTS {
            return Err(EngineError::LimitExceeded("too many students"));
        }
        if name.chars().count() > MAX_STUDENT_NAME_LEN {
            return Err(EngineError::LimitExceeded("student name too long"));
        }
        let email = email.as_deref().map(validate_email).transpose()?;
        let phone = phone.as_deref().map(validate_phone).transpose()?;

        let id = Ulid::new();
        let event = Event::StudentCreated {
            id,
            advisor_id,
            name,
            email,
            phone,
        };
        self.persist_top_level(&event).await?;
        Ok(id)
    }

    pub async fn update_student(
        &self,
        advisor_id: Ulid,
        id: Ulid,
        name: String,
        email: Option<String>,
        phone: Option<String>,
    ) -> Result<(), EngineError> {
        let student = self
            .students
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound("student"))?;
        if student.advisor_id != advisor_id {
            return Err(EngineError::Forbidden("You can only update your own students"));
        }
        if name.chars().count() > MAX_STUDENT_NAME_LEN {
            return Err(EngineError::LimitExceeded("student name too long"));
        }
        let email = email.as_deref().map(validate_email).transpose()?;
        let phone = phone.as_deref().map(validate_phone).transpose()?;

        let event = Event::StudentUpdated { id, name, email, phone };
        self.persist_top_level(&event).await
    }

    pub async fn delete_student(&self, advisor_id: Ulid, id: Ulid) -> Result<(), EngineError> {
        let student = self
            .students
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound("student"))?;
        if student.advisor_id != advisor_id {
            return Err(EngineError::Forbidden("You can only delete your own students"));
        }

        let event = Event::StudentDeleted { id };
        self.persist_top_level(&event).await
    }

    /// Create a meeting invite for a student, minting a fresh secret code.
    /// Codes are globally unique; generation retries on collision and gives
    /// up after a bounded number of attempts rather than looping forever.
    pub async fn create_meeting(
        &self,
        advisor_id: Ulid,
        student_id: Ulid,
        semester: SemesterRef,
    ) -> Result<Ulid, EngineError> {
        let student = self
            .students
            .get(&student_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound("student"))?;
        if student.advisor_id != advisor_id {
            return Err(EngineError::Forbidden(
                "You can only create meetings for your own students",
            ));
        }
        let semester = self.resolve_semester(advisor_id, semester)?;

        let mut secret_code = None;
        for _ in 0..MAX_CODE_ATTEMPTS {
            let candidate = Uuid::new_v4();
            if !self.code_to_meeting.contains_key(&candidate) {
                secret_code = Some(candidate);
                break;
            }
        }
        let secret_code =
            secret_code.ok_or(EngineError::Internal("secret code generation exhausted"))?;

        let ss = self
            .get_semester_state(&semester.id)
            .ok_or(EngineError::NotFound("semester"))?;
        let mut guard = ss.write().await;
        if guard.meetings.len() >= MAX_MEETINGS_PER_SEMESTER {
            return Err(EngineError::LimitExceeded("too many meetings in semester"));
        }

        let id = Ulid::new();
        let event = Event::MeetingCreated {
            id,
            semester_id: semester.id,
            student_id,
            secret_code,
        };
        self.persist_and_apply(semester.id, &mut guard, &event).await?;

        self.dispatch_notification(NotificationRequest {
            kind: NotificationKind::Invited,
            meeting_id: id,
            semester_id: semester.id,
            slot_span: None,
        });
        Ok(id)
    }

    pub async fn delete_meeting(&self, advisor_id: Ulid, id: Ulid) -> Result<(), EngineError> {
        let (semester_id, mut guard) = self.resolve_meeting_write(&id).await?;
        if guard.semester.advisor_id != advisor_id {
            return Err(EngineError::Forbidden(
                "You can only delete meetings for your own semesters",
            ));
        }
        if guard.meeting(id).is_none() {
            return Err(EngineError::NotFound("meeting"));
        }

        let event = Event::MeetingDeleted { id, semester_id };
        self.persist_and_apply(semester_id, &mut guard, &event).await
    }

    /// Book a meeting into a slot. Gated by the secret code, not by an
    /// advisor session. Supplied contact info is validated, then fills any
    /// blank field on the student record; an existing value is never
    /// overwritten.
    pub async fn book_meeting(
        &self,
        meeting_id: Ulid,
        slot_id: Ulid,
        secret_code: Uuid,
        booker_email: Option<&str>,
        booker_phone: Option<&str>,
    ) -> Result<(), EngineError> {
        let meeting_semester = self
            .semester_for_meeting(&meeting_id)
            .ok_or(EngineError::NotFound("meeting"))?;
        let ss = self
            .get_semester_state(&meeting_semester)
            .ok_or(EngineError::NotFound("semester"))?;
        let mut guard = ss.write().await;

        // Everything below happens under the semester write lock, so two
        // students racing for the same slot cannot both pass the checks.
        // The code gate comes first: a caller without the code learns
        // nothing about the slot.
        let meeting = guard
            .meeting(meeting_id)
            .ok_or(EngineError::NotFound("meeting"))?
            .clone();
        if meeting.secret_code != secret_code {
            return Err(EngineError::Forbidden("Incorrect secret code"));
        }
        let slot_semester = self
            .semester_for_slot(&slot_id)
            .ok_or(EngineError::NotFound("time slot"))?;
        if slot_semester != meeting_semester {
            return Err(EngineError::Conflict("Semesters are mismatched".into()));
        }
        let slot = *guard.slot(slot_id).ok_or(EngineError::NotFound("time slot"))?;
        if let Some(assigned) = meeting.time_slot_id {
            if assigned == slot_id {
                return Err(EngineError::Conflict(
                    "Time slot is already assigned to this meeting".into(),
                ));
            }
            return Err(EngineError::Conflict(
                "Another time slot is already assigned to this meeting".into(),
            ));
        }
        if guard.booking_for_slot(slot_id).is_some() {
            return Err(EngineError::Conflict("Time slot is already booked".into()));
        }

        // Merge contact info before committing so the event carries the
        // final values and replay needs no merge logic.
        let student = self
            .students
            .get(&meeting.student_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound("student"))?;
        let student_email = merge_contact(&student.email, booker_email, validate_email)?;
        let student_phone = merge_contact(&student.phone, booker_phone, validate_phone)?;

        let event = Event::MeetingBooked {
            id: meeting_id,
            semester_id: meeting_semester,
            time_slot_id: slot_id,
            student_email,
            student_phone,
        };
        self.persist_and_apply(meeting_semester, &mut guard, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_TOTAL).increment(1);

        self.dispatch_notification(NotificationRequest {
            kind: NotificationKind::Booked,
            meeting_id,
            semester_id: meeting_semester,
            slot_span: Some(slot.span),
        });
        Ok(())
    }

    /// Advisor-side cancellation: clears the booked slot so the student can
    /// pick again.
    pub async fn cancel_booking(
        &self,
        advisor_id: Ulid,
        meeting_id: Ulid,
    ) -> Result<(), EngineError> {
        let (semester_id, mut guard) = self.resolve_meeting_write(&meeting_id).await?;
        if guard.semester.advisor_id != advisor_id {
            return Err(EngineError::Forbidden(
                "You can only cancel meetings for your own semesters",
            ));
        }
        self.cancel_in_guard(semester_id, &mut guard, meeting_id).await
    }

    /// Student-side cancellation, gated by the secret code.
    pub async fn cancel_booking_with_code(
        &self,
        meeting_id: Ulid,
        secret_code: Uuid,
    ) -> Result<(), EngineError> {
        let (semester_id, mut guard) = self.resolve_meeting_write(&meeting_id).await?;
        let meeting = guard
            .meeting(meeting_id)
            .ok_or(EngineError::NotFound("meeting"))?;
        if meeting.secret_code != secret_code {
            return Err(EngineError::Forbidden("Incorrect secret code"));
        }
        self.cancel_in_guard(semester_id, &mut guard, meeting_id).await
    }

    async fn cancel_in_guard(
        &self,
        semester_id: Ulid,
        guard: &mut SemesterState,
        meeting_id: Ulid,
    ) -> Result<(), EngineError> {
        let meeting = guard
            .meeting(meeting_id)
            .ok_or(EngineError::NotFound("meeting"))?;
        let slot_id = meeting
            .time_slot_id
            .ok_or_else(|| EngineError::Conflict("Meeting has no booked time slot".into()))?;
        // The prior slot time goes into the cancellation notice.
        let prior_span = guard.slot(slot_id).map(|s| s.span);

        let event = Event::BookingCancelled {
            id: meeting_id,
            semester_id,
        };
        self.persist_and_apply(semester_id, guard, &event).await?;
        metrics::counter!(crate::observability::CANCELLATIONS_TOTAL).increment(1);

        if let Some(slot_span) = prior_span {
            self.dispatch_notification(NotificationRequest {
                kind: NotificationKind::Cancelled,
                meeting_id,
                semester_id,
                slot_span: Some(slot_span),
            });
        }
        Ok(())
    }

    /// Record a dispatched email. Called by the mailer after handing the
    /// message to the delivery provider.
    pub async fn record_email(
        &self,
        owner_id: Ulid,
        message_id: String,
        to: String,
        subject: String,
        body: String,
        reply_to: Option<String>,
    ) -> Result<Ulid, EngineError> {
        if self.emails.len() >= MAX_EMAILS {
            return Err(EngineError::LimitExceeded("too many email records"));
        }
        let id = Ulid::new();
        let event = Event::EmailQueued {
            id,
            owner_id,
            message_id,
            to,
            subject,
            body,
            reply_to,
        };
        self.persist_top_level(&event).await?;
        Ok(id)
    }

    /// Apply a delivery-lifecycle callback from the provider, keyed by the
    /// provider-assigned message id.
    pub async fn email_event(
        &self,
        message_id: &str,
        status: EmailStatus,
    ) -> Result<(), EngineError> {
        let id = self
            .message_to_email
            .get(message_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound("email"))?;
        let event = Event::EmailStatusChanged { id, status };
        self.persist_top_level(&event).await
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Students first (bookings reference them),
    /// then each semester's contents, then email records.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.students.iter() {
            let s = entry.value();
            events.push(Event::StudentCreated {
                id: s.id,
                advisor_id: s.advisor_id,
                name: s.name.clone(),
                email: s.email.clone(),
                phone: s.phone.clone(),
            });
        }

        let semester_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        for id in semester_ids {
            let ss_arc = match self.state.get(&id) {
                Some(e) => e.value().clone(),
                None => continue,
            };
            let guard = ss_arc.read().await;
            if !self.state.contains_key(&id) {
                // Deleted while we waited for the lock
                continue;
            }

            events.push(Event::SemesterCreated {
                id: guard.semester.id,
                advisor_id: guard.semester.advisor_id,
                display_name: guard.semester.display_name.clone(),
                span: guard.semester.span,
            });
            for slot in &guard.slots {
                events.push(Event::SlotCreated {
                    id: slot.id,
                    semester_id: id,
                    span: slot.span,
                });
            }
            for meeting in &guard.meetings {
                events.push(Event::MeetingCreated {
                    id: meeting.id,
                    semester_id: id,
                    student_id: meeting.student_id,
                    secret_code: meeting.secret_code,
                });
                if let Some(slot_id) = meeting.time_slot_id {
                    // Contact merge already happened; no values to re-apply.
                    events.push(Event::MeetingBooked {
                        id: meeting.id,
                        semester_id: id,
                        time_slot_id: slot_id,
                        student_email: None,
                        student_phone: None,
                    });
                }
            }
        }

        for entry in self.emails.iter() {
            let e = entry.value();
            events.push(Event::EmailQueued {
                id: e.id,
                owner_id: e.owner_id,
                message_id: e.message_id.clone(),
                to: e.to.clone(),
                subject: e.subject.clone(),
                body: e.body.clone(),
                reply_to: e.reply_to.clone(),
            });
            if e.status != EmailStatus::Queued {
                events.push(Event::EmailStatusChanged {
                    id: e.id,
                    status: e.status,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
