//! Field-level semantic validation, shared by the action handlers.
//!
//! Schema-shape validation (types, required fields) happens when the
//! dispatcher deserializes the parameter struct; these helpers cover what
//! serde cannot express: bounds, enum membership, date shape, email syntax.

use crate::error::ActionError;
use crate::normalize::{is_valid_email, normalize_email};

/// Trim and bound a required string field.
pub fn bounded_string(
    value: &str,
    field: &str,
    min: usize,
    max: usize,
) -> Result<String, ActionError> {
    let trimmed = value.trim();
    if trimmed.len() < min || trimmed.len() > max {
        return Err(ActionError::InvalidInput(format!(
            "{field} must be between {min} and {max} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Require membership in a fixed value set.
pub fn enum_member(value: &str, field: &str, allowed: &[&str]) -> Result<(), ActionError> {
    if allowed.contains(&value) {
        return Ok(());
    }
    Err(ActionError::InvalidInput(format!(
        "{field} must be one of: {}",
        allowed.join(", ")
    )))
}

/// Require a YYYY-MM-DD calendar date.
pub fn yyyy_mm_dd(value: &str, field: &str) -> Result<(), ActionError> {
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| ActionError::InvalidInput(format!("{field} must be YYYY-MM-DD")))
}

/// Normalize and syntax-check an email field.
pub fn email_field(raw: &str, field: &str) -> Result<String, ActionError> {
    let email = normalize_email(raw);
    if !is_valid_email(&email) {
        return Err(ActionError::InvalidInput(format!(
            "{field} is not a valid email address: {raw}"
        )));
    }
    Ok(email)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_string_trims_and_bounds() {
        assert_eq!(bounded_string("  hi  ", "title", 1, 10).unwrap(), "hi");
        assert!(bounded_string("   ", "title", 1, 10).is_err());
        assert!(bounded_string("toolongvalue", "title", 1, 5).is_err());
    }

    #[test]
    fn test_enum_member() {
        assert!(enum_member("new", "status", &["new", "lost"]).is_ok());
        let err = enum_member("bogus", "status", &["new", "lost"]).unwrap_err();
        assert!(err.to_string().contains("status must be one of"));
    }

    #[test]
    fn test_yyyy_mm_dd() {
        assert!(yyyy_mm_dd("2026-08-06", "due_date").is_ok());
        assert!(yyyy_mm_dd("08/06/2026", "due_date").is_err());
        assert!(yyyy_mm_dd("2026-13-01", "due_date").is_err());
    }

    #[test]
    fn test_email_field_normalizes() {
        assert_eq!(
            email_field("Jane <JANE@X.COM>", "email").unwrap(),
            "jane@x.com"
        );
        assert!(email_field("nope", "email").is_err());
    }
}
