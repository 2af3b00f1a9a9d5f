//! Mail actions: immediate send, deferred send, and deferred-send cancel.
//!
//! Recipients are canonicalized and the sender-name placeholders resolved
//! before any text leaves the process. The post-send audit row is
//! best-effort: an already-delivered email cannot be undone, so a failed
//! log write is reported in the logs, never to the caller.

use schemars::JsonSchema;
use serde::Deserialize;

use super::{to_payload, validate};
use crate::db::Store;
use crate::error::ActionError;
use crate::normalize::{apply_sender_placeholder, resolve_sender_name};
use crate::providers::{CredentialResolver, MailPort, OutgoingMail, ProviderKind};
use crate::schedule::{self, ScheduleRequest};
use crate::types::{CallerContext, SentLogEntry};

/// Shared mail-body fields, validated and templated in one place.
struct PreparedMail {
    to: Vec<String>,
    subject: String,
    html: Option<String>,
    text: Option<String>,
}

fn prepare_mail(
    store: &Store,
    ctx: &CallerContext,
    to: &[String],
    subject: &str,
    html: Option<&str>,
    text: Option<&str>,
) -> Result<PreparedMail, ActionError> {
    let mut recipients = Vec::new();
    for raw in to {
        let email = validate::email_field(raw, "to")?;
        if !recipients.contains(&email) {
            recipients.push(email);
        }
    }
    if recipients.is_empty() {
        return Err(ActionError::InvalidInput(
            "at least one recipient is required".to_string(),
        ));
    }

    let subject = validate::bounded_string(subject, "subject", 1, 500)?;
    let html = html.map(str::trim).filter(|s| !s.is_empty());
    let text = text.map(str::trim).filter(|s| !s.is_empty());
    if html.is_none() && text.is_none() {
        return Err(ActionError::InvalidInput(
            "at least one of html or text body is required".to_string(),
        ));
    }

    let sender = resolve_sender_name(store.get_profile(&ctx.user_id)?.as_ref());
    Ok(PreparedMail {
        to: recipients,
        subject: apply_sender_placeholder(&subject, &sender),
        html: html.map(|h| apply_sender_placeholder(h, &sender)),
        text: text.map(|t| apply_sender_placeholder(t, &sender)),
    })
}

// ============================================================================
// Immediate send
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SendEmailParams {
    #[schemars(description = "Recipient email addresses")]
    pub to: Vec<String>,
    #[schemars(description = "Subject line")]
    pub subject: String,
    #[schemars(description = "HTML body")]
    pub html: Option<String>,
    #[schemars(description = "Plain-text body")]
    pub text: Option<String>,
}

pub async fn send_email(
    store: &Store,
    credentials: &dyn CredentialResolver,
    mailer: &dyn MailPort,
    ctx: &CallerContext,
    params: SendEmailParams,
) -> Result<serde_json::Value, ActionError> {
    let prepared = prepare_mail(
        store,
        ctx,
        &params.to,
        &params.subject,
        params.html.as_deref(),
        params.text.as_deref(),
    )?;

    let credential = credentials.resolve(&ctx.user_id, ProviderKind::Gmail).await?;
    let mail = OutgoingMail {
        to: prepared.to.clone(),
        subject: prepared.subject.clone(),
        html: prepared.html,
        text: prepared.text,
    };
    let receipt = mailer.send(&credential, &mail).await?;

    // Best-effort audit: the send already happened.
    let entry = SentLogEntry {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: ctx.user_id.clone(),
        recipients: prepared.to.clone(),
        subject: prepared.subject.clone(),
        provider_message_id: receipt.message_id.clone(),
        sent_at: crate::db::ts(&ctx.now),
    };
    if let Err(e) = store.append_sent_log(&entry) {
        log::warn!(
            "sent-log append failed after successful send {}: {e}",
            receipt.message_id
        );
    }

    Ok(serde_json::json!({
        "messageId": receipt.message_id,
        "to": prepared.to,
        "subject": prepared.subject,
    }))
}

// ============================================================================
// Deferred send
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ScheduleEmailParams {
    #[schemars(description = "Recipient email addresses")]
    pub to: Vec<String>,
    #[schemars(description = "Subject line")]
    pub subject: String,
    #[schemars(description = "HTML body")]
    pub html: Option<String>,
    #[schemars(description = "Plain-text body")]
    pub text: Option<String>,
    #[schemars(description = "Absolute send time, RFC 3339. Use this or in_minutes, not both")]
    pub send_at_iso: Option<String>,
    #[schemars(description = "Minutes from now to send. Use this or send_at_iso, not both")]
    pub in_minutes: Option<i64>,
}

pub async fn schedule_email(
    store: &Store,
    ctx: &CallerContext,
    params: ScheduleEmailParams,
) -> Result<serde_json::Value, ActionError> {
    let prepared = prepare_mail(
        store,
        ctx,
        &params.to,
        &params.subject,
        params.html.as_deref(),
        params.text.as_deref(),
    )?;

    let send = schedule::create_scheduled_send(
        store,
        ctx,
        &ScheduleRequest {
            recipients: prepared.to,
            subject: prepared.subject,
            html: prepared.html,
            text: prepared.text,
            send_at_iso: params.send_at_iso,
            in_minutes: params.in_minutes,
        },
    )?;
    to_payload(&send)
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CancelScheduledEmailParams {
    #[schemars(description = "Id of the scheduled send to cancel")]
    pub id: String,
}

pub async fn cancel_scheduled_email(
    store: &Store,
    ctx: &CallerContext,
    params: CancelScheduledEmailParams,
) -> Result<serde_json::Value, ActionError> {
    let send = schedule::cancel_scheduled_send(store, ctx, &params.id)?;
    to_payload(&send)
}
