use crate::model::Ts;

/// Maximum length of a semester display name.
pub const MAX_NAME_LEN: usize = 50;

/// Maximum length of a student name.
pub const MAX_STUDENT_NAME_LEN: usize = 200;

/// Fixed slot duration: 15 minutes, in seconds.
pub const SLOT_DURATION_SECS: Ts = 15 * 60;

/// Semester duration bounds, in seconds.
pub const MIN_SEMESTER_DURATION_SECS: Ts = 86_400;
pub const MAX_SEMESTER_DURATION_SECS: Ts = 366 * 86_400;

/// Timestamps must be representable as calendar dates and stay inside a
/// sane window (year 1970..=9999, unix seconds).
pub const MIN_VALID_TIMESTAMP: Ts = 0;
pub const MAX_VALID_TIMESTAMP: Ts = 253_402_300_799;

/// Caps on collection sizes so a single deployment cannot grow state unbounded.
pub const MAX_SEMESTERS: usize = 10_000;
pub const MAX_SLOTS_PER_SEMESTER: usize = 50_000;
pub const MAX_MEETINGS_PER_SEMESTER: usize = 50_000;
pub const MAX_STUDENTS: usize = 100_000;
pub const MAX_EMAILS: usize = 1_000_000;

/// Maximum candidates in one bulk slot-creation batch.
pub const MAX_BATCH_SIZE: usize = 1_000;

/// Secret-code generation gives up after this many collision retries.
pub const MAX_CODE_ATTEMPTS: usize = 10;

/// Longest accepted wire-protocol line, in bytes.
pub const MAX_WIRE_LINE_LEN: usize = 256 * 1024;
