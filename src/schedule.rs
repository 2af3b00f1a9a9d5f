//! Deferred-send lifecycle.
//!
//! Creation and cancellation run inside the dispatcher; the sweeper-facing
//! operations (`claim_due`, `finalize`) are the boundary the external
//! polling loop drives. Status machine:
//! `pending → processing → {sent | partial | failed}`, with
//! `pending | processing → cancelled` available to the cancel action only.

use chrono::{DateTime, Duration, Utc};

use crate::db::Store;
use crate::error::ActionError;
use crate::normalize::{is_valid_email, normalize_email};
use crate::types::{CallerContext, ScheduledSend, SendStatus};

/// Floor between "now" and the earliest permitted fire time. Anything
/// closer is effectively an immediate send and belongs to the synchronous
/// send action.
pub const MIN_SCHEDULE_LEAD_SECONDS: i64 = 30;

/// Everything needed to create a deferred send. Subject and bodies arrive
/// already templated; recipients are normalized here.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub recipients: Vec<String>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    /// Absolute fire time, RFC 3339. Mutually exclusive with `in_minutes`.
    pub send_at_iso: Option<String>,
    /// Relative fire time, resolved against `ctx.now`.
    pub in_minutes: Option<i64>,
}

/// Resolve the fire instant from exactly one of the two time sources.
/// The result is persisted verbatim and never re-derived.
pub fn resolve_scheduled_for(
    ctx: &CallerContext,
    send_at_iso: Option<&str>,
    in_minutes: Option<i64>,
) -> Result<DateTime<Utc>, ActionError> {
    match (send_at_iso, in_minutes) {
        (Some(_), Some(_)) => Err(ActionError::InvalidInput(
            "provide exactly one of send_at_iso and in_minutes, not both".to_string(),
        )),
        (None, None) => Err(ActionError::InvalidInput(
            "provide one of send_at_iso or in_minutes".to_string(),
        )),
        (Some(iso), None) => DateTime::parse_from_rfc3339(iso)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| ActionError::InvalidInput(format!("send_at_iso: {e}"))),
        (None, Some(minutes)) => {
            if minutes <= 0 {
                return Err(ActionError::InvalidInput(format!(
                    "in_minutes must be positive, got {minutes}"
                )));
            }
            Ok(ctx.now + Duration::minutes(minutes))
        }
    }
}

/// Validate and persist a new deferred send with status `pending`.
pub fn create_scheduled_send(
    store: &Store,
    ctx: &CallerContext,
    req: &ScheduleRequest,
) -> Result<ScheduledSend, ActionError> {
    let mut recipients = Vec::new();
    for raw in &req.recipients {
        let email = normalize_email(raw);
        if !is_valid_email(&email) {
            return Err(ActionError::InvalidInput(format!(
                "recipient is not a valid email address: {raw}"
            )));
        }
        if !recipients.contains(&email) {
            recipients.push(email);
        }
    }
    if recipients.is_empty() {
        return Err(ActionError::InvalidInput(
            "at least one recipient is required".to_string(),
        ));
    }

    let subject = req.subject.trim();
    if subject.is_empty() {
        return Err(ActionError::InvalidInput("subject is required".to_string()));
    }

    let html = req.html.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let text = req.text.as_deref().map(str::trim).filter(|s| !s.is_empty());
    if html.is_none() && text.is_none() {
        return Err(ActionError::InvalidInput(
            "at least one of html or text body is required".to_string(),
        ));
    }

    let scheduled_for =
        resolve_scheduled_for(ctx, req.send_at_iso.as_deref(), req.in_minutes)?;
    if scheduled_for < ctx.now + Duration::seconds(MIN_SCHEDULE_LEAD_SECONDS) {
        return Err(ActionError::InvalidInput(format!(
            "scheduled_for must be at least {MIN_SCHEDULE_LEAD_SECONDS}s in the future; \
             use the immediate send action instead"
        )));
    }

    let send = ScheduledSend {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: ctx.user_id.clone(),
        recipients,
        subject: subject.to_string(),
        html: html.map(str::to_string),
        text: text.map(str::to_string),
        scheduled_for,
        timezone: ctx.timezone.name().to_string(),
        status: SendStatus::Pending,
        attempted_count: 0,
        sent_count: 0,
        failed_count: 0,
        last_error: None,
        processed_at: None,
        created_at: ctx.now,
    };
    store.insert_scheduled_send(&send)?;
    Ok(send)
}

/// Cancel a send while it is still pending or processing.
///
/// The transition is a conditional update, so a concurrent sweeper
/// finalization loses nothing: zero rows affected means the row went
/// terminal first, reported as `InvalidState`.
pub fn cancel_scheduled_send(
    store: &Store,
    ctx: &CallerContext,
    id: &str,
) -> Result<ScheduledSend, ActionError> {
    let changed = store.cancel_scheduled_send(&ctx.user_id, id)?;
    let row = store
        .get_scheduled_send(&ctx.user_id, id)?
        .ok_or_else(|| ActionError::NotFound(format!("scheduled send {id}")))?;

    if changed == 0 {
        return Err(ActionError::InvalidState(format!(
            "scheduled send {id} is already {}, only pending or processing sends can be cancelled",
            row.status.as_str()
        )));
    }
    Ok(row)
}

/// Sweeper boundary: claim due pending rows, transitioning them to
/// `processing`.
pub fn claim_due(
    store: &Store,
    now: &DateTime<Utc>,
    limit: usize,
) -> Result<Vec<ScheduledSend>, ActionError> {
    Ok(store.claim_due_sends(now, limit)?)
}

/// Sweeper boundary: record per-recipient counts and finalize a processing
/// row. The terminal status is derived from the counts: no failures →
/// `sent`, no successes → `failed`, otherwise `partial`.
pub fn finalize(
    store: &Store,
    id: &str,
    attempted: u32,
    sent: u32,
    failed: u32,
    last_error: Option<&str>,
    now: &DateTime<Utc>,
) -> Result<ScheduledSend, ActionError> {
    let row = store
        .get_scheduled_send_any(id)?
        .ok_or_else(|| ActionError::NotFound(format!("scheduled send {id}")))?;

    if row.status != SendStatus::Processing {
        return Err(ActionError::InvalidState(format!(
            "scheduled send {id} is {}, only processing sends can be finalized",
            row.status.as_str()
        )));
    }
    if sent + failed > attempted || attempted as usize > row.recipients.len() {
        return Err(ActionError::InvalidState(format!(
            "inconsistent counts for send {id}: sent {sent} + failed {failed} vs \
             attempted {attempted} of {} recipients",
            row.recipients.len()
        )));
    }

    let status = if failed == 0 && sent > 0 {
        SendStatus::Sent
    } else if sent == 0 {
        SendStatus::Failed
    } else {
        SendStatus::Partial
    };
    store.finalize_send(id, status, attempted, sent, failed, last_error, now)?;

    store
        .get_scheduled_send_any(id)?
        .ok_or_else(|| ActionError::NotFound(format!("scheduled send {id}")))
}
