use chrono::DateTime;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub fn now_ts() -> Ts {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as Ts
}

/// RFC 3339 rendering for error messages, UTC.
pub(crate) fn format_ts(t: Ts) -> String {
    match DateTime::from_timestamp(t, 0) {
        Some(dt) => dt.to_rfc3339(),
        None => t.to_string(),
    }
}

fn is_valid_date(t: Ts) -> bool {
    (MIN_VALID_TIMESTAMP..=MAX_VALID_TIMESTAMP).contains(&t)
        && DateTime::from_timestamp(t, 0).is_some()
}

/// Validate semester dates: both must parse as calendar dates, and the
/// duration must be between 1 and 366 days.
pub(crate) fn validate_semester_dates(start: Ts, end: Ts) -> Result<Span, EngineError> {
    if !is_valid_date(start) {
        return Err(EngineError::Validation("Start date is invalid".into()));
    }
    if !is_valid_date(end) {
        return Err(EngineError::Validation("End date is invalid".into()));
    }
    let duration = end - start;
    if duration < MIN_SEMESTER_DURATION_SECS {
        return Err(EngineError::Validation(
            "Semesters must last at least 1 day".into(),
        ));
    }
    if duration > MAX_SEMESTER_DURATION_SECS {
        return Err(EngineError::Validation(
            "Semester must last less than a year".into(),
        ));
    }
    Ok(Span::new(start, end))
}

/// First existing semester of the same advisor whose `[start, end)` range
/// overlaps the candidate, if any.
pub(crate) fn find_semester_overlap<'a>(
    existing: impl Iterator<Item = &'a Semester>,
    advisor_id: ulid::Ulid,
    candidate: &Span,
) -> Option<Semester> {
    existing
        .filter(|s| s.advisor_id == advisor_id)
        .find(|s| s.span.overlaps(candidate))
        .cloned()
}

/// Validate a candidate slot start against its semester bounds and return
/// the full 15-minute span. `describe_start` controls whether the error
/// message names the offending start time (bulk) or not (single).
pub(crate) fn check_slot_bounds(
    semester: &Span,
    start: Ts,
    describe_start: bool,
) -> Result<Span, EngineError> {
    if !is_valid_date(start) {
        let msg = if describe_start {
            "One or more start times are invalid".into()
        } else {
            "Start date is invalid".to_string()
        };
        return Err(EngineError::Validation(msg));
    }
    if start < semester.start {
        let msg = if describe_start {
            format!("Slot at {} cannot start before semester starts", format_ts(start))
        } else {
            "Slot cannot start before semester starts".into()
        };
        return Err(EngineError::Validation(msg));
    }
    let span = Span::slot_at(start);
    if span.end > semester.end {
        let msg = if describe_start {
            format!("Slot at {} cannot end after semester ends", format_ts(start))
        } else {
            "Slot cannot end after semester ends".into()
        };
        return Err(EngineError::Validation(msg));
    }
    Ok(span)
}

/// First existing slot overlapping the candidate span, if any.
pub(crate) fn find_slot_overlap(state: &SemesterState, candidate: &Span) -> Option<TimeSlot> {
    state.overlapping_slots(candidate).next().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const DAY: Ts = 86_400;

    #[test]
    fn semester_duration_bounds() {
        assert!(validate_semester_dates(0, DAY).is_ok());
        assert!(validate_semester_dates(0, 366 * DAY).is_ok());

        let too_short = validate_semester_dates(0, DAY - 1).unwrap_err();
        assert_eq!(too_short.to_string(), "Semesters must last at least 1 day");

        let too_long = validate_semester_dates(0, 366 * DAY + 1).unwrap_err();
        assert_eq!(too_long.to_string(), "Semester must last less than a year");
    }

    #[test]
    fn semester_reversed_dates_rejected() {
        // end before start falls out as a sub-1-day duration
        let err = validate_semester_dates(1000, 500).unwrap_err();
        assert_eq!(err.to_string(), "Semesters must last at least 1 day");
    }

    #[test]
    fn semester_unparseable_date_rejected() {
        let err = validate_semester_dates(-5, DAY).unwrap_err();
        assert_eq!(err.to_string(), "Start date is invalid");
        let err = validate_semester_dates(0, MAX_VALID_TIMESTAMP + 1).unwrap_err();
        assert_eq!(err.to_string(), "End date is invalid");
    }

    #[test]
    fn slot_bounds_containment() {
        let sem = Span::new(1000, 2000);
        // Start at semester start: fine
        let span = check_slot_bounds(&sem, 1000, false).unwrap();
        assert_eq!(span, Span::new(1000, 1900));
        // End would cross semester end
        let err = check_slot_bounds(&sem, 1990, false).unwrap_err();
        assert_eq!(err.to_string(), "Slot cannot end after semester ends");
        // Start before semester
        let err = check_slot_bounds(&sem, 999, false).unwrap_err();
        assert_eq!(err.to_string(), "Slot cannot start before semester starts");
    }

    #[test]
    fn slot_bounds_bulk_names_offender() {
        let sem = Span::new(1000, 2000);
        let err = check_slot_bounds(&sem, 500, true).unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("Slot at "));
        assert!(msg.ends_with("cannot start before semester starts"));
    }

    #[test]
    fn semester_overlap_scan_is_per_advisor() {
        let advisor = Ulid::new();
        let other = Ulid::new();
        let existing = vec![
            Semester {
                id: Ulid::new(),
                advisor_id: other,
                display_name: "Other's".into(),
                span: Span::new(0, 100 * DAY),
            },
            Semester {
                id: Ulid::new(),
                advisor_id: advisor,
                display_name: "Mine".into(),
                span: Span::new(50 * DAY, 150 * DAY),
            },
        ];

        // Overlaps only the other advisor's range → no conflict
        let hit = find_semester_overlap(existing.iter(), advisor, &Span::new(0, 40 * DAY));
        assert!(hit.is_none());

        // Overlaps own range → conflict names it
        let hit = find_semester_overlap(existing.iter(), advisor, &Span::new(140 * DAY, 200 * DAY));
        assert_eq!(hit.unwrap().display_name, "Mine");

        // Touching ranges do not overlap (half-open)
        let hit = find_semester_overlap(existing.iter(), advisor, &Span::new(150 * DAY, 200 * DAY));
        assert!(hit.is_none());
    }
}
