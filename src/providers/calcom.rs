//! Cal.com API v2 — event type listing.
//!
//! Same two-step recipe as the Calendly adapter: resolve the connected
//! username from `/v2/me`, list event types, and build each scheduling URL
//! from `username/slug` since Cal.com does not return one directly.

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    http_client, provider_failure, transport_failure, ProviderCredential, ProviderKind,
    SchedulingEventType, SchedulingLinkPort,
};
use crate::error::ActionError;

const ME_URL: &str = "https://api.cal.com/v2/me";
const EVENT_TYPES_URL: &str = "https://api.cal.com/v2/event-types";
const BOOKING_BASE: &str = "https://cal.com";

#[derive(Debug, Deserialize)]
struct MeResponse {
    data: MeData,
}

#[derive(Debug, Deserialize)]
struct MeData {
    #[serde(default)]
    username: String,
}

#[derive(Debug, Deserialize)]
struct EventTypesResponse {
    #[serde(default)]
    data: Vec<EventTypeRaw>,
}

#[derive(Debug, Deserialize)]
struct EventTypeRaw {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    slug: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    hidden: bool,
}

fn project(username: &str, data: Vec<EventTypeRaw>) -> Vec<SchedulingEventType> {
    data.into_iter()
        .filter(|et| !et.hidden && !et.slug.is_empty())
        .map(|et| SchedulingEventType {
            uri: et.id.to_string(),
            name: et.title,
            scheduling_url: format!("{BOOKING_BASE}/{username}/{}", et.slug),
        })
        .collect()
}

/// Scheduling-link adapter backed by the user's Cal.com account.
pub struct CalComLinks;

#[async_trait]
impl SchedulingLinkPort for CalComLinks {
    fn provider(&self) -> ProviderKind {
        ProviderKind::CalCom
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
            .map_err(|e| transport_failure(ProviderKind::CalCom, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(provider_failure(ProviderKind::CalCom, status, body));
        }
        let me: MeResponse = resp
            .json()
            .await
            .map_err(|e| transport_failure(ProviderKind::CalCom, e))?;

        let resp = http_client()
            .get(EVENT_TYPES_URL)
            .bearer_auth(&credential.access_token)
            .send()
            .await
            .map_err(|e| transport_failure(ProviderKind::CalCom, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(provider_failure(ProviderKind::CalCom, status, body));
        }
        let body: EventTypesResponse = resp
            .json()
            .await
            .map_err(|e| transport_failure(ProviderKind::CalCom, e))?;

        Ok(project(&me.data.username, body.data))
    }
}
