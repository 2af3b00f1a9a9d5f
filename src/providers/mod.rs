//! Provider boundary: credential resolution, port traits, and the shared
//! HTTP plumbing the REST adapters sit on.
//!
//! Adapters receive an already-valid credential and an already-normalized
//! payload, and return minimal projections — never the raw provider body.
//! Non-2xx responses become `ProviderCallFailed` with a truncated body;
//! adapters perform no retries. Silent duplication of an agent-triggered
//! send or booking is worse than a visible failure.
//!
//! Modules:
//! - gmail: Gmail API v1 message send
//! - gcal: Google Calendar API v3 events
//! - calendly: Calendly event types
//! - calcom: Cal.com event types

pub mod calcom;
pub mod calendly;
pub mod gcal;
pub mod gmail;

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ActionError;
use crate::types::CalendarEventView;

// ============================================================================
// Providers and credentials
// ============================================================================

/// The external systems this crate talks to. Each is an independent OAuth
/// connection owned by the credential resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Gmail,
    GoogleCalendar,
    Calendly,
    CalCom,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gmail => "gmail",
            ProviderKind::GoogleCalendar => "google_calendar",
            ProviderKind::Calendly => "calendly",
            ProviderKind::CalCom => "calcom",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A currently-valid access token, opaque to the dispatcher.
///
/// Owned and refreshed exclusively by the [`CredentialResolver`]; requested
/// fresh per call and never persisted here.
#[derive(Debug, Clone)]
pub struct ProviderCredential {
    pub access_token: String,
    /// The connected identity, where the provider exposes one (e.g. the
    /// mailbox address for Gmail).
    pub provider_identity: Option<String>,
}

/// Supplies a valid, possibly-refreshed access token for a user/provider
/// pair. Implemented by the host's OAuth layer.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Errors with `NotConnected` when the user never authorized the
    /// provider and `RefreshFailed` when renewal is impossible.
    async fn resolve(
        &self,
        user_id: &str,
        provider: ProviderKind,
    ) -> Result<ProviderCredential, ActionError>;
}

// ============================================================================
// Port traits
// ============================================================================

/// Outbound mail, normalized before it gets here: recipients canonicalized,
/// at least one of html/text present.
#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub to: Vec<String>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub message_id: String,
}

#[async_trait]
pub trait MailPort: Send + Sync {
    async fn send(
        &self,
        credential: &ProviderCredential,
        mail: &OutgoingMail,
    ) -> Result<SendReceipt, ActionError>;
}

/// A new event, with both endpoints already resolved to absolute instants.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// IANA timezone for the provider's wall-clock rendering.
    pub timezone: String,
    pub attendees: Vec<String>,
    /// Opt into an auto-generated conference link.
    pub with_conference: bool,
}

/// Partial update; `None` fields are left untouched on the provider side.
#[derive(Debug, Clone, Default)]
pub struct EventPatch {
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub timezone: Option<String>,
    pub attendees: Option<Vec<String>>,
}

impl EventPatch {
    pub fn is_empty(&self) -> bool {
        self.summary.is_none()
            && self.description.is_none()
            && self.location.is_none()
            && self.start.is_none()
            && self.end.is_none()
            && self.attendees.is_none()
    }
}

#[async_trait]
pub trait CalendarPort: Send + Sync {
    async fn create_event(
        &self,
        credential: &ProviderCredential,
        draft: &EventDraft,
    ) -> Result<CalendarEventView, ActionError>;

    async fn list_events(
        &self,
        credential: &ProviderCredential,
        window: &TimeWindow,
    ) -> Result<Vec<CalendarEventView>, ActionError>;

    async fn update_event(
        &self,
        credential: &ProviderCredential,
        event_id: &str,
        patch: &EventPatch,
    ) -> Result<CalendarEventView, ActionError>;

    async fn delete_event(
        &self,
        credential: &ProviderCredential,
        event_id: &str,
    ) -> Result<(), ActionError>;
}

/// A bookable event type projected from a scheduling-link provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingEventType {
    pub uri: String,
    pub name: String,
    pub scheduling_url: String,
}

#[async_trait]
pub trait SchedulingLinkPort: Send + Sync {
    fn provider(&self) -> ProviderKind;

    async fn list_event_types(
        &self,
        credential: &ProviderCredential,
    ) -> Result<Vec<SchedulingEventType>, ActionError>;
}

// ============================================================================
// Time windows
// ============================================================================

/// Meetings with no stated end default to this length.
pub const DEFAULT_EVENT_MINUTES: i64 = 30;

/// An absolute, validated [start, end) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Resolve both endpoints from an explicit end instant or a duration,
    /// defaulting to [`DEFAULT_EVENT_MINUTES`]. Rejects `end <= start` and
    /// non-positive durations.
    pub fn resolve(
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        duration_minutes: Option<i64>,
    ) -> Result<Self, ActionError> {
        let end = match (end, duration_minutes) {
            (Some(end), _) => end,
            (None, Some(minutes)) => {
                if minutes <= 0 {
                    return Err(ActionError::InvalidInput(format!(
                        "duration_minutes must be positive, got {minutes}"
                    )));
                }
                start + chrono::Duration::minutes(minutes)
            }
            (None, None) => start + chrono::Duration::minutes(DEFAULT_EVENT_MINUTES),
        };

        if end <= start {
            return Err(ActionError::InvalidInput(
                "event end must be after its start".to_string(),
            ));
        }
        Ok(TimeWindow { start, end })
    }
}

// ============================================================================
// Scheduling links
// ============================================================================

/// Prefill values appended to a shareable scheduling link.
#[derive(Debug, Clone, Default)]
pub struct LinkPrefill {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Build a prefillable share link from a provider's scheduling URL.
pub fn build_scheduling_link(
    provider: ProviderKind,
    event_type: &SchedulingEventType,
    prefill: Option<&LinkPrefill>,
) -> Result<String, ActionError> {
    let mut url = url::Url::parse(&event_type.scheduling_url).map_err(|e| {
        ActionError::ProviderCallFailed {
            provider,
            status: 0,
            detail: format!("unparseable scheduling url {}: {e}", event_type.scheduling_url),
        }
    })?;

    if let Some(prefill) = prefill {
        let mut pairs = url.query_pairs_mut();
        if let Some(ref name) = prefill.name {
            pairs.append_pair("name", name);
        }
        if let Some(ref email) = prefill.email {
            pairs.append_pair("email", email);
        }
    }

    Ok(url.into())
}

// ============================================================================
// HTTP plumbing
// ============================================================================

/// Per-request ceiling. A hung provider call must surface as an error, not
/// block the dispatcher indefinitely.
const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// How much of a failing response body is kept for diagnosis.
pub(crate) const ERROR_BODY_LIMIT: usize = 600;

pub(crate) fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    })
}

/// Map a non-2xx response to the error taxonomy. A 401 means the token the
/// resolver handed out was rejected, which surfaces as a refresh failure.
pub(crate) fn provider_failure(
    provider: ProviderKind,
    status: reqwest::StatusCode,
    body: String,
) -> ActionError {
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return ActionError::RefreshFailed {
            provider,
            reason: "access token rejected by the provider".to_string(),
        };
    }
    let detail: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    ActionError::ProviderCallFailed {
        provider,
        status: status.as_u16(),
        detail,
    }
}

/// Map a transport-level failure (timeout, connect, decode) to the taxonomy.
pub(crate) fn transport_failure(provider: ProviderKind, err: reqwest::Error) -> ActionError {
    ActionError::ProviderCallFailed {
        provider,
        status: 0,
        detail: err.to_string(),
    }
}
