//! Scheduling-link action: list bookable event types across the connected
//! link providers and build prefillable share links.
//!
//! Read-only against every provider, so no confirmation is required. The
//! handler iterates the configured ports uniformly; it never branches on a
//! concrete provider.

use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;

use super::validate;
use crate::error::ActionError;
use crate::providers::{
    build_scheduling_link, CredentialResolver, LinkPrefill, ProviderKind, SchedulingLinkPort,
};
use crate::types::CallerContext;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetSchedulingLinksParams {
    #[schemars(description = "Restrict to one provider: calendly or calcom")]
    pub provider: Option<String>,
    #[schemars(description = "Invitee name to prefill into the link")]
    pub prefill_name: Option<String>,
    #[schemars(description = "Invitee email to prefill into the link")]
    pub prefill_email: Option<String>,
}

fn parse_provider(name: &str) -> Result<ProviderKind, ActionError> {
    match name {
        "calendly" => Ok(ProviderKind::Calendly),
        "calcom" => Ok(ProviderKind::CalCom),
        other => Err(ActionError::InvalidInput(format!(
            "provider must be calendly or calcom, got {other}"
        ))),
    }
}

pub async fn get_scheduling_links(
    credentials: &dyn CredentialResolver,
    ports: &[Arc<dyn SchedulingLinkPort>],
    ctx: &CallerContext,
    params: GetSchedulingLinksParams,
) -> Result<serde_json::Value, ActionError> {
    let requested = params.provider.as_deref().map(parse_provider).transpose()?;

    let prefill = if params.prefill_name.is_some() || params.prefill_email.is_some() {
        Some(LinkPrefill {
            name: params.prefill_name.clone(),
            email: params
                .prefill_email
                .as_deref()
                .map(|e| validate::email_field(e, "prefill_email"))
                .transpose()?,
        })
    } else {
        None
    };

    let mut links = Vec::new();
    for port in ports {
        let provider = port.provider();
        if requested.is_some_and(|r| r != provider) {
            continue;
        }

        let credential = match credentials.resolve(&ctx.user_id, provider).await {
            Ok(credential) => credential,
            // When listing across all providers, one that was never
            // connected is simply absent from the result. An explicitly
            // requested provider still errors.
            Err(ActionError::NotConnected { .. }) if requested.is_none() => {
                log::debug!("skipping {provider}: not connected");
                continue;
            }
            Err(e) => return Err(e),
        };

        for event_type in port.list_event_types(&credential).await? {
            let share_link = build_scheduling_link(provider, &event_type, prefill.as_ref())?;
            links.push(serde_json::json!({
                "provider": provider.as_str(),
                "uri": event_type.uri,
                "name": event_type.name,
                "schedulingUrl": event_type.scheduling_url,
                "shareLink": share_link,
            }));
        }
    }

    Ok(serde_json::Value::Array(links))
}
