use std::sync::LazyLock;

use regex::Regex;

use super::EngineError;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());

// North-American style numbers, optional country prefix. The stored form
// keeps only the digits.
static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\+?\d{0,3}\s?[(]?\d{3}[)]?[-\s\.]?\d{3}[-\s\.]?\d{4}$").unwrap()
});

pub(crate) fn validate_email(email: &str) -> Result<String, EngineError> {
    if EMAIL_RE.is_match(email) {
        Ok(email.to_string())
    } else {
        Err(EngineError::Validation("Invalid email address".into()))
    }
}

/// Validate and normalize a phone number to digits only.
pub(crate) fn validate_phone(phone: &str) -> Result<String, EngineError> {
    if PHONE_RE.is_match(phone) {
        Ok(phone.chars().filter(|c| c.is_ascii_digit()).collect())
    } else {
        Err(EngineError::Validation("Invalid phone number".into()))
    }
}

/// Fill-in-if-blank merge for a student contact field: a supplied value is
/// validated but only stored when the student has no value yet. Returns the
/// value the record should hold afterwards.
pub(crate) fn merge_contact(
    existing: &Option<String>,
    supplied: Option<&str>,
    validate: impl Fn(&str) -> Result<String, EngineError>,
) -> Result<Option<String>, EngineError> {
    match (existing, supplied) {
        (Some(have), Some(given)) => {
            validate(given)?;
            Ok(Some(have.clone()))
        }
        (None, Some(given)) => Ok(Some(validate(given)?)),
        (have, None) => Ok(have.clone()),
    }
}
