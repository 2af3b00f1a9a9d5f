//! Calendar actions: create, list, update, cancel events, and booking sync.
//!
//! Wall-clock inputs resolve against the caller's IANA timezone; both
//! window endpoints are fixed before the adapter is called, with a
//! 30-minute default for meetings with no stated end.

use chrono::{DateTime, NaiveDateTime, Utc};
use schemars::JsonSchema;
use serde::Deserialize;

use super::{to_payload, validate};
use crate::db::Store;
use crate::error::ActionError;
use crate::providers::{
    gcal, CalendarPort, CredentialResolver, EventDraft, EventPatch, ProviderKind, TimeWindow,
};
use crate::types::{CallerContext, TaskItem};

const DEFAULT_LIST_DAYS: i64 = 7;
const DEFAULT_SYNC_DAYS: i64 = 14;
const MAX_WINDOW_DAYS: i64 = 60;

/// Parse an instant that may be RFC 3339 or a bare wall-clock value.
/// Bare values are interpreted in `tz`.
fn parse_instant(s: &str, tz: &chrono_tz::Tz, field: &str) -> Result<DateTime<Utc>, ActionError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M"))
        .map_err(|_| {
            ActionError::InvalidInput(format!(
                "{field} must be RFC 3339 or YYYY-MM-DDTHH:MM[:SS], got {s}"
            ))
        })?;
    chrono::TimeZone::from_local_datetime(tz, &naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| {
            ActionError::InvalidInput(format!("{field} does not exist in timezone {}", tz.name()))
        })
}

fn resolve_timezone(
    requested: Option<&str>,
    ctx: &CallerContext,
) -> Result<chrono_tz::Tz, ActionError> {
    match requested {
        Some(name) => name
            .parse()
            .map_err(|_| ActionError::InvalidInput(format!("unknown IANA timezone: {name}"))),
        None => Ok(ctx.timezone),
    }
}

fn normalized_attendees(raw: &[String]) -> Result<Vec<String>, ActionError> {
    let mut attendees = Vec::new();
    for addr in raw {
        let email = validate::email_field(addr, "attendees")?;
        if !attendees.contains(&email) {
            attendees.push(email);
        }
    }
    Ok(attendees)
}

// ============================================================================
// Create
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateCalendarEventParams {
    #[schemars(description = "Event title")]
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    #[schemars(description = "Start time, RFC 3339 or wall-clock YYYY-MM-DDTHH:MM")]
    pub start_iso: String,
    #[schemars(description = "End time. Defaults to 30 minutes after start")]
    pub end_iso: Option<String>,
    #[schemars(description = "Event length in minutes, as an alternative to end_iso")]
    pub duration_minutes: Option<i64>,
    #[schemars(description = "Attendee email addresses")]
    pub attendees: Option<Vec<String>>,
    #[schemars(description = "IANA timezone for wall-clock times. Defaults to the caller's")]
    pub timezone: Option<String>,
    #[schemars(description = "Set true to attach an auto-generated meeting link")]
    pub with_meet_link: Option<bool>,
}

pub async fn create_event(
    credentials: &dyn CredentialResolver,
    calendar: &dyn CalendarPort,
    ctx: &CallerContext,
    params: CreateCalendarEventParams,
) -> Result<serde_json::Value, ActionError> {
    let summary = validate::bounded_string(&params.summary, "summary", 1, 300)?;
    let tz = resolve_timezone(params.timezone.as_deref(), ctx)?;

    let start = parse_instant(&params.start_iso, &tz, "start_iso")?;
    let end = params
        .end_iso
        .as_deref()
        .map(|s| parse_instant(s, &tz, "end_iso"))
        .transpose()?;
    let window = TimeWindow::resolve(start, end, params.duration_minutes)?;

    let attendees = normalized_attendees(params.attendees.as_deref().unwrap_or(&[]))?;

    let credential = credentials
        .resolve(&ctx.user_id, ProviderKind::GoogleCalendar)
        .await?;
    let view = calendar
        .create_event(
            &credential,
            &EventDraft {
                summary,
                description: params.description,
                location: params.location,
                start: window.start,
                end: window.end,
                timezone: tz.name().to_string(),
                attendees,
                with_conference: params.with_meet_link.unwrap_or(false),
            },
        )
        .await?;
    to_payload(&view)
}

// ============================================================================
// List
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListCalendarEventsParams {
    #[schemars(description = "Window start. Defaults to now")]
    pub start_iso: Option<String>,
    #[schemars(description = "Window end. Defaults to days after the start")]
    pub end_iso: Option<String>,
    #[schemars(description = "Window length in days when end_iso is absent (default 7, max 60)")]
    pub days: Option<i64>,
}

fn list_window(
    params: &ListCalendarEventsParams,
    ctx: &CallerContext,
) -> Result<TimeWindow, ActionError> {
    let tz = ctx.timezone;
    let start = params
        .start_iso
        .as_deref()
        .map(|s| parse_instant(s, &tz, "start_iso"))
        .transpose()?
        .unwrap_or(ctx.now);
    let end = params
        .end_iso
        .as_deref()
        .map(|s| parse_instant(s, &tz, "end_iso"))
        .transpose()?;

    let days = params.days.unwrap_or(DEFAULT_LIST_DAYS);
    if !(1..=MAX_WINDOW_DAYS).contains(&days) {
        return Err(ActionError::InvalidInput(format!(
            "days must be between 1 and {MAX_WINDOW_DAYS}"
        )));
    }
    TimeWindow::resolve(start, end, Some(days * 24 * 60))
}

pub async fn list_events(
    credentials: &dyn CredentialResolver,
    calendar: &dyn CalendarPort,
    ctx: &CallerContext,
    params: ListCalendarEventsParams,
) -> Result<serde_json::Value, ActionError> {
    let window = list_window(&params, ctx)?;
    let credential = credentials
        .resolve(&ctx.user_id, ProviderKind::GoogleCalendar)
        .await?;
    let events = calendar.list_events(&credential, &window).await?;
    to_payload(&events)
}

// ============================================================================
// Update / cancel
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UpdateCalendarEventParams {
    #[schemars(description = "Provider event id")]
    pub event_id: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    #[schemars(description = "New start time")]
    pub start_iso: Option<String>,
    #[schemars(description = "New end time")]
    pub end_iso: Option<String>,
    #[schemars(description = "Replacement attendee list")]
    pub attendees: Option<Vec<String>>,
    #[schemars(description = "IANA timezone for wall-clock times. Defaults to the caller's")]
    pub timezone: Option<String>,
}

pub async fn update_event(
    credentials: &dyn CredentialResolver,
    calendar: &dyn CalendarPort,
    ctx: &CallerContext,
    params: UpdateCalendarEventParams,
) -> Result<serde_json::Value, ActionError> {
    let tz = resolve_timezone(params.timezone.as_deref(), ctx)?;

    let start = params
        .start_iso
        .as_deref()
        .map(|s| parse_instant(s, &tz, "start_iso"))
        .transpose()?;
    let end = params
        .end_iso
        .as_deref()
        .map(|s| parse_instant(s, &tz, "end_iso"))
        .transpose()?;
    if let (Some(start), Some(end)) = (start, end) {
        if end <= start {
            return Err(ActionError::InvalidInput(
                "event end must be after its start".to_string(),
            ));
        }
    }

    let summary = params
        .summary
        .as_deref()
        .map(|s| validate::bounded_string(s, "summary", 1, 300))
        .transpose()?;
    let attendees = params
        .attendees
        .as_deref()
        .map(normalized_attendees)
        .transpose()?;

    let patch = EventPatch {
        summary,
        description: params.description,
        location: params.location,
        start,
        end,
        timezone: Some(tz.name().to_string()),
        attendees,
    };
    if patch.is_empty() {
        return Err(ActionError::InvalidInput(
            "nothing to update: provide at least one field".to_string(),
        ));
    }

    let credential = credentials
        .resolve(&ctx.user_id, ProviderKind::GoogleCalendar)
        .await?;
    let view = calendar
        .update_event(&credential, &params.event_id, &patch)
        .await?;
    to_payload(&view)
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CancelCalendarEventParams {
    #[schemars(description = "Provider event id")]
    pub event_id: String,
}

pub async fn cancel_event(
    credentials: &dyn CredentialResolver,
    calendar: &dyn CalendarPort,
    ctx: &CallerContext,
    params: CancelCalendarEventParams,
) -> Result<serde_json::Value, ActionError> {
    let credential = credentials
        .resolve(&ctx.user_id, ProviderKind::GoogleCalendar)
        .await?;
    calendar.delete_event(&credential, &params.event_id).await?;
    Ok(serde_json::json!({ "cancelled": true, "eventId": params.event_id }))
}

// ============================================================================
// Booking sync
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SyncBookingsParams {
    #[schemars(description = "How many days ahead to scan (default 14, max 60)")]
    pub days: Option<i64>,
}

/// Pull upcoming provider events into local tasks. The provider event id is
/// the dedup key, so re-syncing a window is idempotent.
pub async fn sync_bookings(
    store: &Store,
    credentials: &dyn CredentialResolver,
    calendar: &dyn CalendarPort,
    ctx: &CallerContext,
    params: SyncBookingsParams,
) -> Result<serde_json::Value, ActionError> {
    let days = params.days.unwrap_or(DEFAULT_SYNC_DAYS);
    if !(1..=MAX_WINDOW_DAYS).contains(&days) {
        return Err(ActionError::InvalidInput(format!(
            "days must be between 1 and {MAX_WINDOW_DAYS}"
        )));
    }
    let window = TimeWindow::resolve(ctx.now, None, Some(days * 24 * 60))?;

    let credential = credentials
        .resolve(&ctx.user_id, ProviderKind::GoogleCalendar)
        .await?;
    let events = calendar.list_events(&credential, &window).await?;

    let mut created = 0usize;
    let mut skipped = 0usize;
    for event in &events {
        if event.id.is_empty() {
            continue;
        }
        if store.find_task_by_source(&ctx.user_id, &event.id)?.is_some() {
            skipped += 1;
            continue;
        }

        let due_date = gcal::parse_event_datetime(&event.start)
            .map(|dt| dt.with_timezone(&ctx.timezone).date_naive().to_string());
        let context = if event.attendees.is_empty() {
            None
        } else {
            Some(format!("With {}", event.attendees.join(", ")))
        };

        store.insert_task(&TaskItem {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: ctx.user_id.clone(),
            title: format!("Booking: {}", event.summary),
            due_date,
            status: "pending".to_string(),
            context,
            source_type: Some("booking".to_string()),
            source_id: Some(event.id.clone()),
            created_at: crate::db::ts(&ctx.now),
            updated_at: crate::db::ts(&ctx.now),
        })?;
        created += 1;
    }

    Ok(serde_json::json!({ "created": created, "skipped": skipped }))
}
