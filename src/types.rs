//! Core domain types shared across the dispatcher, store, and adapters.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{ActionError, ErrorKind};

// ============================================================================
// Caller context
// ============================================================================

/// Per-invocation bundle built from the authenticated session.
///
/// `now` is the only clock action bodies ever see: relative-time arguments
/// ("in 5 minutes") resolve against it, which keeps handlers deterministic
/// under test. Created once per dispatch, discarded after.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub user_id: String,
    pub timezone: chrono_tz::Tz,
    pub now: DateTime<Utc>,
}

impl CallerContext {
    pub fn new(user_id: impl Into<String>, timezone: chrono_tz::Tz, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            timezone,
            now,
        }
    }
}

// ============================================================================
// Result envelope
// ============================================================================

/// Uniform result envelope returned to the calling agent.
///
/// Exactly one variant per invocation. `RequiresConfirmation` is returned
/// before the action body runs and never implies any side effect occurred.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionResult {
    Ok {
        payload: serde_json::Value,
    },
    RequiresConfirmation {
        message: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl ActionResult {
    pub fn ok(payload: serde_json::Value) -> Self {
        ActionResult::Ok { payload }
    }

    pub fn confirm(message: impl Into<String>) -> Self {
        ActionResult::RequiresConfirmation {
            message: message.into(),
        }
    }
}

impl From<ActionError> for ActionResult {
    fn from(err: ActionError) -> Self {
        ActionResult::Error {
            kind: err.kind(),
            message: err.to_string(),
            detail: err.detail(),
        }
    }
}

/// Gate wrapper for mutating actions: the caller's own arguments plus an
/// explicit `confirm` flag. The dispatcher unwraps this generically so the
/// confirmation rule is enforced in one place, never per action body.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct Mutating<T> {
    /// Must be exactly `true` for the action body to run. Anything else
    /// yields `requires_confirmation` and no side effect.
    #[serde(default)]
    pub confirm: bool,
    #[serde(flatten)]
    pub args: T,
}

/// Catalogue entry advertised to the calling agent.
#[derive(Debug, Clone, Serialize)]
pub struct ActionSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub requires_confirmation: bool,
    /// JSON Schema for the action's arguments (including `confirm` for
    /// mutating actions).
    pub input_schema: serde_json::Value,
}

// ============================================================================
// Local records
// ============================================================================

/// A sales lead owned by one user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// One of: new, contacted, qualified, converted, lost.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub const LEAD_STATUSES: &[&str] = &["new", "contacted", "qualified", "converted", "lost"];

/// Status marker written on a lead when it is converted to a customer.
pub const LEAD_STATUS_CONVERTED: &str = "converted";

/// A customer record, usually created by converting a lead.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Source lead, when this customer came from a conversion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A task on the user's worklist.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskItem {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    /// One of: pending, done.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// "manual" for user-created tasks, "booking" for synced calendar
    /// bookings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    /// Provider event id for synced bookings; the dedup key for re-syncs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub const TASK_STATUSES: &[&str] = &["pending", "done"];

/// Best-effort audit row appended after a successful synchronous send.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SentLogEntry {
    pub id: String,
    pub user_id: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub provider_message_id: String,
    pub sent_at: String,
}

/// Stored identity used for sender-name resolution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    pub email: String,
}

// ============================================================================
// Scheduled sends
// ============================================================================

/// Status of a deferred email delivery.
///
/// `pending → processing → {sent | partial | failed}` is driven by the
/// sweeper; `pending | processing → cancelled` by the cancel action.
/// Terminal states never transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Pending,
    Processing,
    Sent,
    Partial,
    Failed,
    Cancelled,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendStatus::Pending => "pending",
            SendStatus::Processing => "processing",
            SendStatus::Sent => "sent",
            SendStatus::Partial => "partial",
            SendStatus::Failed => "failed",
            SendStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SendStatus::Pending),
            "processing" => Some(SendStatus::Processing),
            "sent" => Some(SendStatus::Sent),
            "partial" => Some(SendStatus::Partial),
            "failed" => Some(SendStatus::Failed),
            "cancelled" => Some(SendStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SendStatus::Sent | SendStatus::Partial | SendStatus::Failed | SendStatus::Cancelled
        )
    }

    /// Whether the cancel action may still take this row.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, SendStatus::Pending | SendStatus::Processing)
    }
}

/// A durable deferred-mail record, advanced by the external sweeper.
///
/// Invariant: `sent_count + failed_count <= attempted_count <= recipients.len()`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledSend {
    pub id: String,
    pub user_id: String,
    /// Non-empty; every address is normalized at creation.
    pub recipients: Vec<String>,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Absolute UTC instant, resolved exactly once at creation.
    pub scheduled_for: DateTime<Utc>,
    /// Caller's IANA timezone at creation, kept for display.
    pub timezone: String,
    pub status: SendStatus,
    pub attempted_count: u32,
    pub sent_count: u32,
    pub failed_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Calendar view
// ============================================================================

/// Projection of a provider-owned calendar event.
///
/// Owned entirely by the calendar provider; never cached locally as a
/// source of truth.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEventView {
    pub id: String,
    pub summary: String,
    pub status: String,
    pub start: String,
    pub end: String,
    pub attendees: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conference_link: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_envelope_tagging() {
        let ok = ActionResult::ok(serde_json::json!({"count": 3}));
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["payload"]["count"], 3);

        let confirm = ActionResult::confirm("Send this email?");
        let json = serde_json::to_value(&confirm).unwrap();
        assert_eq!(json["status"], "requires_confirmation");
        assert_eq!(json["message"], "Send this email?");
    }

    #[test]
    fn test_error_envelope_from_action_error() {
        let result = ActionResult::from(ActionError::NotFound("lead abc".into()));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["kind"], "not_found");
        assert_eq!(json["message"], "lead abc");
        assert!(json.get("detail").is_none());
    }

    #[test]
    fn test_mutating_wrapper_flattens() {
        #[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
        struct Args {
            title: String,
        }

        let parsed: Mutating<Args> =
            serde_json::from_value(serde_json::json!({"confirm": true, "title": "call Jane"}))
                .unwrap();
        assert!(parsed.confirm);
        assert_eq!(parsed.args.title, "call Jane");

        // confirm defaults to false when absent
        let parsed: Mutating<Args> =
            serde_json::from_value(serde_json::json!({"title": "call Jane"})).unwrap();
        assert!(!parsed.confirm);
    }

    #[test]
    fn test_send_status_round_trip_and_terminality() {
        for s in [
            SendStatus::Pending,
            SendStatus::Processing,
            SendStatus::Sent,
            SendStatus::Partial,
            SendStatus::Failed,
            SendStatus::Cancelled,
        ] {
            assert_eq!(SendStatus::parse(s.as_str()), Some(s));
        }
        assert!(!SendStatus::Pending.is_terminal());
        assert!(!SendStatus::Processing.is_terminal());
        assert!(SendStatus::Sent.is_terminal());
        assert!(SendStatus::Cancelled.is_terminal());
        assert!(SendStatus::Pending.is_cancellable());
        assert!(SendStatus::Processing.is_cancellable());
        assert!(!SendStatus::Partial.is_cancellable());
        assert_eq!(SendStatus::parse("bogus"), None);
    }
}
