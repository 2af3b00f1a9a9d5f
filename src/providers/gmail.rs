//! Gmail API v1 — message send.
//!
//! Assembles an RFC 2822 message, encodes it URL-safe base64, and posts it
//! to `users/me/messages/send`. Only the provider message id comes back.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use super::{
    http_client, provider_failure, transport_failure, MailPort, OutgoingMail,
    ProviderCredential, ProviderKind, SendReceipt,
};
use crate::error::ActionError;

const SEND_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me/messages/send";

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    id: String,
}

/// Mail adapter backed by the connected Gmail account.
pub struct GmailMailer;

#[async_trait]
impl MailPort for GmailMailer {
    async fn send(
        &self,
        credential: &ProviderCredential,
        mail: &OutgoingMail,
    ) -> Result<SendReceipt, ActionError> {
        let mime = build_mime(credential.provider_identity.as_deref(), mail);
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(mime);

        let resp = http_client()
            .post(SEND_URL)
            .bearer_auth(&credential.access_token)
            .json(&serde_json::json!({ "raw": raw }))
            .send()
            .await
            .map_err(|e| transport_failure(ProviderKind::Gmail, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(provider_failure(ProviderKind::Gmail, status, body));
        }

        let body: SendResponse = resp
            .json()
            .await
            .map_err(|e| transport_failure(ProviderKind::Gmail, e))?;
        Ok(SendReceipt {
            message_id: body.id,
        })
    }
}

/// Assemble the RFC 2822 payload.
///
/// Both bodies present → multipart/alternative (text first, html second, so
/// capable clients prefer html). HTML only → a tag-stripped text fallback
/// is derived, since some recipients render plain text only. Text only →
/// a single text/plain part.
fn build_mime(from_identity: Option<&str>, mail: &OutgoingMail) -> String {
    let mut headers = String::new();
    if let Some(from) = from_identity {
        headers.push_str(&format!("From: {from}\r\n"));
    }
    headers.push_str(&format!("To: {}\r\n", mail.to.join(", ")));
    headers.push_str(&format!("Subject: {}\r\n", mail.subject));
    headers.push_str("MIME-Version: 1.0\r\n");

    let text = mail
        .text
        .clone()
        .or_else(|| mail.html.as_deref().map(html_to_text));

    if let (Some(html), Some(text)) = (&mail.html, &text) {
        let boundary = format!("leadflow_{}", uuid::Uuid::new_v4().simple());
        headers.push_str(&format!(
            "Content-Type: multipart/alternative; boundary=\"{boundary}\"\r\n\r\n"
        ));
        headers.push_str(&format!(
            "--{boundary}\r\nContent-Type: text/plain; charset=\"UTF-8\"\r\n\r\n{text}\r\n"
        ));
        headers.push_str(&format!(
            "--{boundary}\r\nContent-Type: text/html; charset=\"UTF-8\"\r\n\r\n{html}\r\n"
        ));
        headers.push_str(&format!("--{boundary}--\r\n"));
    } else {
        // Upstream validation guarantees at least one body, so this is the
        // text-only shape; an empty string is the safe degenerate rendering.
        headers.push_str(&format!(
            "Content-Type: text/plain; charset=\"UTF-8\"\r\n\r\n{}",
            text.unwrap_or_default()
        ));
    }

    headers
}

/// Derive a plain-text fallback from an HTML body: line breaks for
/// `<br>`/`</p>`, tags stripped, common entities decoded.
fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(lt) = rest.find('<') {
        out.push_str(&rest[..lt]);
        let after = &rest[lt + 1..];
        match after.find('>') {
            Some(gt) => {
                let tag = after[..gt].trim().to_lowercase();
                if tag.starts_with("br") || tag == "/p" || tag == "/div" {
                    out.push('\n');
                }
                rest = &after[gt + 1..];
            }
            // Unterminated tag: drop the remainder
            None => {
                rest = "";
            }
        }
    }
    out.push_str(rest);

    out.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .trim()
        .to_string()
}
