//! Calendly API v2 — event type listing.
//!
//! Two-step fetch: resolve the connected user's URI from `/users/me`, then
//! list that user's active event types. Only `{uri, name, scheduling_url}`
//! is projected out; share links are assembled locally from
//! `scheduling_url`, which keeps this surface read-only.

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    http_client, provider_failure, transport_failure, ProviderCredential, ProviderKind,
    SchedulingEventType, SchedulingLinkPort,
};
use crate::error::ActionError;

const ME_URL: &str = "https://api.calendly.com/users/me";
const EVENT_TYPES_URL: &str = "https://api.calendly.com/event_types";

#[derive(Debug, Deserialize)]
struct MeResponse {
    resource: MeResource,
}

#[derive(Debug, Deserialize)]
struct MeResource {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct EventTypesResponse {
    #[serde(default)]
    collection: Vec<EventTypeRaw>,
}

#[derive(Debug, Deserialize)]
struct EventTypeRaw {
    #[serde(default)]
    uri: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    scheduling_url: String,
    #[serde(default)]
    active: Option<bool>,
}

fn project(collection: Vec<EventTypeRaw>) -> Vec<SchedulingEventType> {
    collection
        .into_iter()
        .filter(|et| et.active != Some(false))
        .filter(|et| !et.scheduling_url.is_empty())
        .map(|et| SchedulingEventType {
            uri: et.uri,
            name: et.name,
            scheduling_url: et.scheduling_url,
        })
        .collect()
}

/// Scheduling-link adapter backed by the user's Calendly account.
pub struct CalendlyLinks;

#[async_trait]
impl SchedulingLinkPort for CalendlyLinks {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Calendly
    }

    async fn list_event_types(
        &self,
        credential: &ProviderCredential,
    ) -> Result<Vec<SchedulingEventType>, ActionError> {
        let resp = http_client()
            .get(ME_URL)
            .bearer_auth(&credential.access_token)
            .send()
            .await
            .map_err(|e| transport_failure(ProviderKind::Calendly, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(provider_failure(ProviderKind::Calendly, status, body));
        }
        let me: MeResponse = resp
            .json()
            .await
            .map_err(|e| transport_failure(ProviderKind::Calendly, e))?;

        let resp = http_client()
            .get(EVENT_TYPES_URL)
            .bearer_auth(&credential.access_token)
            .query(&[("user", me.resource.uri.as_str()), ("active", "true")])
            .send()
            .await
            .map_err(|e| transport_failure(ProviderKind::Calendly, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(provider_failure(ProviderKind::Calendly, status, body));
        }
        let body: EventTypesResponse = resp
            .json()
            .await
            .map_err(|e| transport_failure(ProviderKind::Calendly, e))?;

        Ok(project(body.collection))
    }
}
