use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use crate::limits::SLOT_DURATION_SECS;

/// Unix seconds — the only time type.
pub type Ts = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ts,
    pub end: Ts,
}

impl Span {
    pub fn new(start: Ts, end: Ts) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// A fixed-duration slot interval starting at `start`.
    pub fn slot_at(start: Ts) -> Self {
        Self::new(start, start + SLOT_DURATION_SECS)
    }

    pub fn duration_secs(&self) -> Ts {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Inclusive-both-ends containment, matching the active-semester lookup
    /// (`startDate <= now <= endDate`).
    pub fn contains_inclusive(&self, t: Ts) -> bool {
        self.start <= t && t <= self.end
    }
}

// ── Domain records ───────────────────────────────────────────────

/// A bounded date range owned by one advisor; the scoping unit for time
/// slots and meetings. Immutable once created, except for deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Semester {
    pub id: Ulid,
    pub advisor_id: Ulid,
    pub display_name: String,
    pub span: Span,
}

/// A fixed-duration bookable interval within a semester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: Ulid,
    pub advisor_id: Ulid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// A per-student booking invite. `time_slot_id` starts unset and is assigned
/// exactly once by booking; cancellation clears it, allowing rebooking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meeting {
    pub id: Ulid,
    pub student_id: Ulid,
    pub secret_code: Uuid,
    pub time_slot_id: Option<Ulid>,
}

/// Delivery lifecycle of a dispatched notification email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    Queued,
    Sent,
    Delivered,
    DeliveryDelayed,
    Complained,
    Bounced,
    Opened,
    Clicked,
    Failed,
}

/// Record of a dispatched notification. Status is patched by asynchronous
/// delivery-event callbacks; records are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Email {
    pub id: Ulid,
    pub owner_id: Ulid,
    /// Id assigned by the external delivery provider; callbacks key on it.
    pub message_id: String,
    pub status: EmailStatus,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub reply_to: Option<String>,
}

// ── Per-semester mutable state ───────────────────────────────────

/// A semester together with everything scoped to it. The engine keeps one
/// of these behind a write lock; booking and bulk slot creation are atomic
/// because they validate and commit under that single lock.
#[derive(Debug, Clone)]
pub struct SemesterState {
    pub semester: Semester,
    /// All slots, sorted by `span.start`.
    pub slots: Vec<TimeSlot>,
    pub meetings: Vec<Meeting>,
}

impl SemesterState {
    pub fn new(semester: Semester) -> Self {
        Self {
            semester,
            slots: Vec::new(),
            meetings: Vec::new(),
        }
    }

    /// Insert a slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: TimeSlot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, id: Ulid) -> Option<TimeSlot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.remove(pos))
    }

    pub fn slot(&self, id: Ulid) -> Option<&TimeSlot> {
        self.slots.iter().find(|s| s.id == id)
    }

    /// Slots whose span overlaps the query window. Binary search skips
    /// slots starting at or after `query.end`.
    pub fn overlapping_slots(&self, query: &Span) -> impl Iterator<Item = &TimeSlot> {
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }

    pub fn meeting(&self, id: Ulid) -> Option<&Meeting> {
        self.meetings.iter().find(|m| m.id == id)
    }

    pub fn meeting_mut(&mut self, id: Ulid) -> Option<&mut Meeting> {
        self.meetings.iter_mut().find(|m| m.id == id)
    }

    pub fn remove_meeting(&mut self, id: Ulid) -> Option<Meeting> {
        let pos = self.meetings.iter().position(|m| m.id == id)?;
        Some(self.meetings.remove(pos))
    }

    /// The meeting currently booked into `slot_id`, if any. A slot is
    /// referenced by at most one meeting; enforced here, not by storage.
    pub fn booking_for_slot(&self, slot_id: Ulid) -> Option<&Meeting> {
        self.meetings.iter().find(|m| m.time_slot_id == Some(slot_id))
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SemesterCreated {
        id: Ulid,
        advisor_id: Ulid,
        display_name: String,
        span: Span,
    },
    SemesterDeleted {
        id: Ulid,
    },
    SlotCreated {
        id: Ulid,
        semester_id: Ulid,
        span: Span,
    },
    SlotDeleted {
        id: Ulid,
        semester_id: Ulid,
    },
    StudentCreated {
        id: Ulid,
        advisor_id: Ulid,
        name: String,
        email: Option<String>,
        phone: Option<String>,
    },
    StudentUpdated {
        id: Ulid,
        name: String,
        email: Option<String>,
        phone: Option<String>,
    },
    StudentDeleted {
        id: Ulid,
    },
    MeetingCreated {
        id: Ulid,
        semester_id: Ulid,
        student_id: Ulid,
        secret_code: Uuid,
    },
    MeetingDeleted {
        id: Ulid,
        semester_id: Ulid,
    },
    /// Booking commit. Contact fields carry the already-merged
    /// fill-in-if-blank result so replay is deterministic.
    MeetingBooked {
        id: Ulid,
        semester_id: Ulid,
        time_slot_id: Ulid,
        student_email: Option<String>,
        student_phone: Option<String>,
    },
    BookingCancelled {
        id: Ulid,
        semester_id: Ulid,
    },
    EmailQueued {
        id: Ulid,
        owner_id: Ulid,
        message_id: String,
        to: String,
        subject: String,
        body: String,
        reply_to: Option<String>,
    },
    EmailStatusChanged {
        id: Ulid,
        status: EmailStatus,
    },
}

// ── Query result types ───────────────────────────────────────────

/// A slot as the owning advisor sees it: joined with the student of the
/// meeting booked into it, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotView {
    pub id: Ulid,
    pub semester_id: Ulid,
    pub span: Span,
    pub student: Option<Student>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeetingView {
    pub id: Ulid,
    pub semester_id: Ulid,
    pub secret_code: Uuid,
    pub student: Option<Student>,
    pub time_slot: Option<TimeSlot>,
}

/// A student as the advisor roster shows them: joined with the display name
/// of the semester of their most recent meeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudentView {
    pub id: Ulid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub last_meeting_semester: Option<String>,
}

/// Everything a student needs to render their invite page, resolved from
/// the secret code alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeetingPage {
    pub meeting_id: Ulid,
    pub semester: Semester,
    pub student: Student,
    pub booked_slot_id: Option<Ulid>,
    pub available_slots: Vec<TimeSlot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_secs(), 100);
        assert!(s.contains_inclusive(100));
        assert!(s.contains_inclusive(200)); // inclusive both ends
        assert!(!s.contains_inclusive(201));
    }

    #[test]
    fn span_overlap_symmetry() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }

    #[test]
    fn span_adjacent_not_overlapping() {
        let a = Span::new(0, 15);
        let b = Span::new(15, 30);
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
    }

    #[test]
    fn slot_at_is_fifteen_minutes() {
        let s = Span::slot_at(1000);
        assert_eq!(s.duration_secs(), 900);
    }

    fn semester() -> Semester {
        Semester {
            id: Ulid::new(),
            advisor_id: Ulid::new(),
            display_name: "Fall".into(),
            span: Span::new(0, 1_000_000),
        }
    }

    fn slot(start: Ts) -> TimeSlot {
        TimeSlot {
            id: Ulid::new(),
            span: Span::slot_at(start),
        }
    }

    #[test]
    fn slot_ordering() {
        let mut ss = SemesterState::new(semester());
        ss.insert_slot(slot(3000));
        ss.insert_slot(slot(1000));
        ss.insert_slot(slot(2000));
        assert_eq!(ss.slots[0].span.start, 1000);
        assert_eq!(ss.slots[1].span.start, 2000);
        assert_eq!(ss.slots[2].span.start, 3000);
    }

    #[test]
    fn slot_remove_preserves_order() {
        let mut ss = SemesterState::new(semester());
        let a = slot(1000);
        let b = slot(2000);
        let c = slot(3000);
        for s in [a, b, c] {
            ss.insert_slot(s);
        }
        ss.remove_slot(b.id);
        assert_eq!(ss.slots.len(), 2);
        assert_eq!(ss.slots[0].id, a.id);
        assert_eq!(ss.slots[1].id, c.id);
    }

    #[test]
    fn overlapping_slots_skips_non_overlapping() {
        let mut ss = SemesterState::new(semester());
        ss.insert_slot(slot(1000)); // ends 1900
        ss.insert_slot(slot(5000)); // ends 5900
        ss.insert_slot(slot(9000)); // starts after query end

        let query = Span::new(5000, 6000);
        let hits: Vec<_> = ss.overlapping_slots(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span.start, 5000);
    }

    #[test]
    fn overlapping_slots_adjacent_not_included() {
        // Slot ending exactly at query.start is NOT overlapping (half-open)
        let mut ss = SemesterState::new(semester());
        ss.insert_slot(slot(1000)); // [1000, 1900)
        let query = Span::new(1900, 2000);
        assert!(ss.overlapping_slots(&query).next().is_none());
    }

    #[test]
    fn overlapping_slots_empty_semester() {
        let ss = SemesterState::new(semester());
        let query = Span::new(0, 1_000_000);
        assert!(ss.overlapping_slots(&query).next().is_none());
    }

    #[test]
    fn booking_for_slot_finds_meeting() {
        let mut ss = SemesterState::new(semester());
        let s = slot(1000);
        ss.insert_slot(s);
        let mid = Ulid::new();
        ss.meetings.push(Meeting {
            id: mid,
            student_id: Ulid::new(),
            secret_code: Uuid::new_v4(),
            time_slot_id: Some(s.id),
        });
        ss.meetings.push(Meeting {
            id: Ulid::new(),
            student_id: Ulid::new(),
            secret_code: Uuid::new_v4(),
            time_slot_id: None,
        });
        assert_eq!(ss.booking_for_slot(s.id).unwrap().id, mid);
        assert!(ss.booking_for_slot(Ulid::new()).is_none());
    }

    #[test]
    fn remove_meeting_returns_record() {
        let mut ss = SemesterState::new(semester());
        let mid = Ulid::new();
        ss.meetings.push(Meeting {
            id: mid,
            student_id: Ulid::new(),
            secret_code: Uuid::new_v4(),
            time_slot_id: None,
        });
        let removed = ss.remove_meeting(mid).unwrap();
        assert_eq!(removed.id, mid);
        assert!(ss.meetings.is_empty());
        assert!(ss.remove_meeting(mid).is_none());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SemesterCreated {
            id: Ulid::new(),
            advisor_id: Ulid::new(),
            display_name: "Spring 2026".into(),
            span: Span::new(1000, 2000),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn email_status_wire_names() {
        let s = serde_json::to_string(&EmailStatus::DeliveryDelayed).unwrap();
        assert_eq!(s, "\"delivery_delayed\"");
        let back: EmailStatus = serde_json::from_str("\"bounced\"").unwrap();
        assert_eq!(back, EmailStatus::Bounced);
    }
}
