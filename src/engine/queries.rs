use ulid::Ulid;
use uuid::Uuid;

use crate::model::*;

use super::validate::now_ts;
use super::{Engine, EngineError};

/// How an advisor-facing operation names its semester: explicitly by id, or
/// implicitly as "the semester active right now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemesterRef {
    Id(Ulid),
    Active,
}

impl Engine {
    /// Resolve a semester reference for an advisor. Explicit ids must belong
    /// to the advisor; `Active` picks the advisor's semester whose date range
    /// contains the current time, inclusive on both ends.
    pub(super) fn resolve_semester(
        &self,
        advisor_id: Ulid,
        semester: SemesterRef,
    ) -> Result<Semester, EngineError> {
        match semester {
            SemesterRef::Id(id) => {
                let semester = self
                    .semesters
                    .get(&id)
                    .map(|e| e.value().clone())
                    .ok_or(EngineError::NotFound("semester"))?;
                if semester.advisor_id != advisor_id {
                    return Err(EngineError::Forbidden(
                        "You can only modify your own semesters",
                    ));
                }
                Ok(semester)
            }
            SemesterRef::Active => {
                let now = now_ts();
                self.semesters
                    .iter()
                    .filter(|e| e.value().advisor_id == advisor_id)
                    .find(|e| e.value().span.contains_inclusive(now))
                    .map(|e| e.value().clone())
                    .ok_or(EngineError::NotFound("active semester"))
            }
        }
    }

    pub fn active_semester(&self, advisor_id: Ulid) -> Result<Semester, EngineError> {
        self.resolve_semester(advisor_id, SemesterRef::Active)
    }

    /// All of an advisor's semesters, newest first.
    pub fn list_semesters(&self, advisor_id: Ulid) -> Vec<Semester> {
        let mut semesters: Vec<Semester> = self
            .semesters
            .iter()
            .filter(|e| e.value().advisor_id == advisor_id)
            .map(|e| e.value().clone())
            .collect();
        // Ulids are creation-ordered, so id-descending is newest-first.
        semesters.sort_by(|a, b| b.id.cmp(&a.id));
        semesters
    }

    /// Fetch one semester. Absent ids yield None rather than an error; a
    /// present semester owned by someone else is an ownership failure.
    pub fn get_semester(
        &self,
        advisor_id: Ulid,
        id: Ulid,
    ) -> Result<Option<Semester>, EngineError> {
        let semester = match self.semesters.get(&id) {
            Some(e) => e.value().clone(),
            None => return Ok(None),
        };
        if semester.advisor_id != advisor_id {
            return Err(EngineError::Forbidden("You can only view your own semesters"));
        }
        Ok(Some(semester))
    }

    /// A semester's slots as the owning advisor sees them: each joined with
    /// the student booked into it, if any. Sorted by start time.
    pub async fn list_slots(
        &self,
        advisor_id: Ulid,
        semester: SemesterRef,
    ) -> Result<Vec<SlotView>, EngineError> {
        let semester = self.resolve_semester(advisor_id, semester)?;
        let ss = self
            .get_semester_state(&semester.id)
            .ok_or(EngineError::NotFound("semester"))?;
        let guard = ss.read().await;

        Ok(guard
            .slots
            .iter()
            .map(|slot| {
                let student = guard
                    .booking_for_slot(slot.id)
                    .and_then(|m| self.students.get(&m.student_id))
                    .map(|e| e.value().clone());
                SlotView {
                    id: slot.id,
                    semester_id: semester.id,
                    span: slot.span,
                    student,
                }
            })
            .collect())
    }

    /// The slots a student may pick for their meeting, gated by the secret
    /// code. A meeting that is already booked sees only its own slot; an
    /// unbooked one sees every slot not reserved by another meeting.
    pub async fn list_slots_for_meeting(
        &self,
        meeting_id: Ulid,
        secret_code: Uuid,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let semester_id = self
            .semester_for_meeting(&meeting_id)
            .ok_or(EngineError::NotFound("meeting"))?;
        let ss = self
            .get_semester_state(&semester_id)
            .ok_or(EngineError::NotFound("semester"))?;
        let guard = ss.read().await;

        let meeting = guard
            .meeting(meeting_id)
            .ok_or(EngineError::NotFound("meeting"))?;
        if meeting.secret_code != secret_code {
            return Err(EngineError::Forbidden("Incorrect secret code"));
        }

        if let Some(slot_id) = meeting.time_slot_id {
            let slot = guard
                .slot(slot_id)
                .copied()
                .ok_or(EngineError::NotFound("selected time slot for meeting"))?;
            return Ok(vec![slot]);
        }

        Ok(guard
            .slots
            .iter()
            .filter(|slot| guard.booking_for_slot(slot.id).is_none())
            .copied()
            .collect())
    }

    /// Resolve a secret code to the full invite page: semester, student,
    /// and the slots currently open to this meeting. Unknown codes yield
    /// None so the caller cannot distinguish them from never-issued ones.
    pub async fn meeting_page_by_code(
        &self,
        secret_code: Uuid,
    ) -> Result<Option<MeetingPage>, EngineError> {
        let meeting_id = match self.meeting_by_code(&secret_code) {
            Some(id) => id,
            None => return Ok(None),
        };
        let semester_id = self
            .semester_for_meeting(&meeting_id)
            .ok_or(EngineError::NotFound("semester"))?;
        let ss = self
            .get_semester_state(&semester_id)
            .ok_or(EngineError::NotFound("semester"))?;
        let guard = ss.read().await;

        let meeting = guard
            .meeting(meeting_id)
            .ok_or(EngineError::NotFound("meeting"))?;
        let student = self
            .students
            .get(&meeting.student_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound("student"))?;

        // A slot is available if nobody holds it, or this meeting does.
        let available_slots = guard
            .slots
            .iter()
            .filter(|slot| match guard.booking_for_slot(slot.id) {
                None => true,
                Some(holder) => holder.id == meeting_id,
            })
            .copied()
            .collect();

        Ok(Some(MeetingPage {
            meeting_id,
            semester: guard.semester.clone(),
            student,
            booked_slot_id: meeting.time_slot_id,
            available_slots,
        }))
    }

    /// A semester's meetings, each joined with its student and booked slot.
    pub async fn list_meetings(
        &self,
        advisor_id: Ulid,
        semester_id: Ulid,
    ) -> Result<Vec<MeetingView>, EngineError> {
        let semester = self
            .semesters
            .get(&semester_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound("semester"))?;
        if semester.advisor_id != advisor_id {
            return Err(EngineError::Forbidden(
                "You can only view meetings for your own semesters",
            ));
        }
        let ss = self
            .get_semester_state(&semester_id)
            .ok_or(EngineError::NotFound("semester"))?;
        let guard = ss.read().await;

        Ok(guard
            .meetings
            .iter()
            .map(|meeting| {
                let student = self
                    .students
                    .get(&meeting.student_id)
                    .map(|e| e.value().clone());
                let time_slot = meeting.time_slot_id.and_then(|sid| guard.slot(sid).copied());
                MeetingView {
                    id: meeting.id,
                    semester_id,
                    secret_code: meeting.secret_code,
                    student,
                    time_slot,
                }
            })
            .collect())
    }

    /// The advisor's roster: each student joined with the display name of
    /// the latest-starting semester they have a meeting in.
    pub async fn list_students(&self, advisor_id: Ulid) -> Vec<StudentView> {
        let mut students: Vec<Student> = self
            .students
            .iter()
            .filter(|e| e.value().advisor_id == advisor_id)
            .map(|e| e.value().clone())
            .collect();
        students.sort_by(|a, b| a.id.cmp(&b.id));

        // Student id → (semester start, display name) of their latest meeting.
        let mut latest: std::collections::HashMap<Ulid, (Ts, String)> =
            std::collections::HashMap::new();
        let semester_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        for id in semester_ids {
            let ss_arc = match self.state.get(&id) {
                Some(e) => e.value().clone(),
                None => continue,
            };
            let guard = ss_arc.read().await;
            if guard.semester.advisor_id != advisor_id {
                continue;
            }
            let start = guard.semester.span.start;
            let name = guard.semester.display_name.clone();
            for meeting in &guard.meetings {
                latest
                    .entry(meeting.student_id)
                    .and_modify(|cur| {
                        if start > cur.0 {
                            *cur = (start, name.clone());
                        }
                    })
                    .or_insert_with(|| (start, name.clone()));
            }
        }

        students
            .into_iter()
            .map(|s| {
                let last_meeting_semester = latest.get(&s.id).map(|(_, name)| name.clone());
                StudentView {
                    id: s.id,
                    name: s.name,
                    email: s.email,
                    phone: s.phone,
                    last_meeting_semester,
                }
            })
            .collect()
    }

    /// Every email record owned by the advisor, newest first.
    pub fn list_emails(&self, advisor_id: Ulid) -> Vec<Email> {
        let mut emails: Vec<Email> = self
            .emails
            .iter()
            .filter(|e| e.value().owner_id == advisor_id)
            .map(|e| e.value().clone())
            .collect();
        emails.sort_by(|a, b| b.id.cmp(&a.id));
        emails
    }

    /// Context for composing a notification email about a meeting.
    pub async fn meeting_context(
        &self,
        meeting_id: Ulid,
    ) -> Result<(Semester, Student, Meeting), EngineError> {
        let semester_id = self
            .semester_for_meeting(&meeting_id)
            .ok_or(EngineError::NotFound("meeting"))?;
        let ss = self
            .get_semester_state(&semester_id)
            .ok_or(EngineError::NotFound("semester"))?;
        let guard = ss.read().await;
        let meeting = guard
            .meeting(meeting_id)
            .ok_or(EngineError::NotFound("meeting"))?
            .clone();
        let student = self
            .students
            .get(&meeting.student_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound("student"))?;
        Ok((guard.semester.clone(), student, meeting))
    }
}
