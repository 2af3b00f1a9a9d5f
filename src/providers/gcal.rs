//! Google Calendar API v3 — event create, list, update, delete.
//!
//! Time windows arrive already resolved; wall-clock fields are sent with an
//! explicit IANA timezone. The auto-generated Meet link is an opt-in via
//! `conferenceDataVersion=1`, isolated here so action bodies never see it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{
    http_client, provider_failure, transport_failure, CalendarPort, EventDraft, EventPatch,
    ProviderCredential, ProviderKind, TimeWindow,
};
use crate::error::ActionError;
use crate::types::CalendarEventView;

const EVENTS_URL: &str = "https://www.googleapis.com/calendar/v3/calendars/primary/events";

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventListResponse {
    #[serde(default)]
    items: Vec<GoogleEventRaw>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEventRaw {
    #[serde(default)]
    id: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    status: Option<String>,
    start: Option<EventDateTime>,
    end: Option<EventDateTime>,
    #[serde(default)]
    attendees: Vec<AttendeeRaw>,
    #[serde(default)]
    hangout_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventDateTime {
    date_time: Option<String>,
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttendeeRaw {
    #[serde(default)]
    email: String,
    #[serde(default)]
    resource: Option<bool>,
}

impl GoogleEventRaw {
    /// Minimal projection handed back to action bodies; the raw payload
    /// never crosses the adapter boundary.
    fn project(self) -> CalendarEventView {
        let attendees = self
            .attendees
            .into_iter()
            .filter(|a| a.resource != Some(true))
            .map(|a| a.email)
            .filter(|e| !e.is_empty())
            .collect();

        let pick = |edt: Option<EventDateTime>| {
            edt.and_then(|s| s.date_time.or(s.date)).unwrap_or_default()
        };

        CalendarEventView {
            id: self.id,
            summary: self.summary.unwrap_or_else(|| "(No title)".to_string()),
            status: self.status.unwrap_or_else(|| "confirmed".to_string()),
            start: pick(self.start),
            end: pick(self.end),
            attendees,
            conference_link: self.hangout_link,
        }
    }
}

// ============================================================================
// Request bodies
// ============================================================================

fn datetime_field(instant: &DateTime<Utc>, timezone: &str) -> serde_json::Value {
    serde_json::json!({
        "dateTime": instant.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "timeZone": timezone,
    })
}

fn draft_body(draft: &EventDraft) -> serde_json::Value {
    let mut body = serde_json::json!({
        "summary": draft.summary,
        "start": datetime_field(&draft.start, &draft.timezone),
        "end": datetime_field(&draft.end, &draft.timezone),
    });
    if let Some(ref description) = draft.description {
        body["description"] = serde_json::json!(description);
    }
    if let Some(ref location) = draft.location {
        body["location"] = serde_json::json!(location);
    }
    if !draft.attendees.is_empty() {
        body["attendees"] = serde_json::json!(draft
            .attendees
            .iter()
            .map(|e| serde_json::json!({ "email": e }))
            .collect::<Vec<_>>());
    }
    if draft.with_conference {
        body["conferenceData"] = serde_json::json!({
            "createRequest": {
                "requestId": uuid::Uuid::new_v4().to_string(),
                "conferenceSolutionKey": { "type": "hangoutsMeet" },
            }
        });
    }
    body
}

fn patch_body(patch: &EventPatch, timezone: &str) -> serde_json::Value {
    let mut body = serde_json::json!({});
    if let Some(ref summary) = patch.summary {
        body["summary"] = serde_json::json!(summary);
    }
    if let Some(ref description) = patch.description {
        body["description"] = serde_json::json!(description);
    }
    if let Some(ref location) = patch.location {
        body["location"] = serde_json::json!(location);
    }
    if let Some(ref start) = patch.start {
        body["start"] = datetime_field(start, timezone);
    }
    if let Some(ref end) = patch.end {
        body["end"] = datetime_field(end, timezone);
    }
    if let Some(ref attendees) = patch.attendees {
        body["attendees"] = serde_json::json!(attendees
            .iter()
            .map(|e| serde_json::json!({ "email": e }))
            .collect::<Vec<_>>());
    }
    body
}

// ============================================================================
// Adapter
// ============================================================================

/// Calendar adapter backed by the user's primary Google calendar.
pub struct GoogleCalendar;

impl GoogleCalendar {
    async fn read_event_response(
        resp: reqwest::Response,
    ) -> Result<CalendarEventView, ActionError> {
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ActionError::NotFound("calendar event not found".to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(provider_failure(ProviderKind::GoogleCalendar, status, body));
        }
        let raw: GoogleEventRaw = resp
            .json()
            .await
            .map_err(|e| transport_failure(ProviderKind::GoogleCalendar, e))?;
        Ok(raw.project())
    }
}

#[async_trait]
impl CalendarPort for GoogleCalendar {
    async fn create_event(
        &self,
        credential: &ProviderCredential,
        draft: &EventDraft,
    ) -> Result<CalendarEventView, ActionError> {
        let mut request = http_client()
            .post(EVENTS_URL)
            .bearer_auth(&credential.access_token)
            .json(&draft_body(draft));
        if draft.with_conference {
            request = request.query(&[("conferenceDataVersion", "1")]);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| transport_failure(ProviderKind::GoogleCalendar, e))?;
        Self::read_event_response(resp).await
    }

    async fn list_events(
        &self,
        credential: &ProviderCredential,
        window: &TimeWindow,
    ) -> Result<Vec<CalendarEventView>, ActionError> {
        let time_min = window.start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let time_max = window.end.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        let mut all_events = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = http_client()
                .get(EVENTS_URL)
                .bearer_auth(&credential.access_token)
                .query(&[
                    ("timeMin", time_min.as_str()),
                    ("timeMax", time_max.as_str()),
                    ("singleEvents", "true"),
                    ("orderBy", "startTime"),
                    ("maxResults", "250"),
                ]);
            if let Some(ref token) = page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let resp = request
                .send()
                .await
                .map_err(|e| transport_failure(ProviderKind::GoogleCalendar, e))?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(provider_failure(ProviderKind::GoogleCalendar, status, body));
            }

            let body: EventListResponse = resp
                .json()
                .await
                .map_err(|e| transport_failure(ProviderKind::GoogleCalendar, e))?;

            for item in body.items {
                if item.status.as_deref() == Some("cancelled") {
                    continue;
                }
                all_events.push(item.project());
            }

            page_token = body.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        Ok(all_events)
    }

    async fn update_event(
        &self,
        credential: &ProviderCredential,
        event_id: &str,
        patch: &EventPatch,
    ) -> Result<CalendarEventView, ActionError> {
        let timezone = patch.timezone.as_deref().unwrap_or("UTC");
        let resp = http_client()
            .patch(format!("{EVENTS_URL}/{event_id}"))
            .bearer_auth(&credential.access_token)
            .json(&patch_body(patch, timezone))
            .send()
            .await
            .map_err(|e| transport_failure(ProviderKind::GoogleCalendar, e))?;
        Self::read_event_response(resp).await
    }

    async fn delete_event(
        &self,
        credential: &ProviderCredential,
        event_id: &str,
    ) -> Result<(), ActionError> {
        let resp = http_client()
            .delete(format!("{EVENTS_URL}/{event_id}"))
            .bearer_auth(&credential.access_token)
            .send()
            .await
            .map_err(|e| transport_failure(ProviderKind::GoogleCalendar, e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(ActionError::NotFound("calendar event not found".to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(provider_failure(ProviderKind::GoogleCalendar, status, body));
        }
        Ok(())
    }
}

/// Parse an ISO datetime string from a provider event.
///
/// Date-only values (all-day events) are treated as midnight UTC.
pub fn parse_event_datetime(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if s.contains('T') {
        DateTime::parse_from_rfc3339(&s.replace('Z', "+00:00"))
            .or_else(|_| DateTime::parse_from_rfc3339(s))
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    } else {
        chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn draft() -> EventDraft {
        EventDraft {
            summary: "Demo with Acme".into(),
            description: Some("Walk through the Q3 roadmap".into()),
            location: None,
            start: Utc.with_ymd_and_hms(2026, 8, 10, 14, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2026, 8, 10, 14, 30, 0).unwrap(),
            timezone: "America/New_York".into(),
            attendees: vec!["jane@example.com".into()],
            with_conference: false,
        }
    }

    #[test]
    fn test_draft_body_shape() {
        let body = draft_body(&draft());
        assert_eq!(body["summary"], "Demo with Acme");
        assert_eq!(body["start"]["dateTime"], "2026-08-10T14:00:00Z");
        assert_eq!(body["start"]["timeZone"], "America/New_York");
        assert_eq!(body["end"]["dateTime"], "2026-08-10T14:30:00Z");
        assert_eq!(body["attendees"][0]["email"], "jane@example.com");
        assert!(body.get("conferenceData").is_none());
        assert!(body.get("location").is_none());
    }

    #[test]
    fn test_draft_body_conference_opt_in() {
        let mut d = draft();
        d.with_conference = true;
        let body = draft_body(&d);
        assert_eq!(
            body["conferenceData"]["createRequest"]["conferenceSolutionKey"]["type"],
            "hangoutsMeet"
        );
        assert!(body["conferenceData"]["createRequest"]["requestId"].is_string());
    }

    #[test]
    fn test_patch_body_only_set_fields() {
        let patch = EventPatch {
            summary: Some("Renamed".into()),
            ..Default::default()
        };
        let body = patch_body(&patch, "UTC");
        assert_eq!(body["summary"], "Renamed");
        assert!(body.get("start").is_none());
        assert!(body.get("end").is_none());
        assert!(body.get("attendees").is_none());
    }

    #[test]
    fn test_projection_filters_resource_rooms() {
        let json = r#"{
            "id": "evt1",
            "summary": "Team Standup",
            "status": "confirmed",
            "start": {"dateTime": "2026-08-10T09:00:00-05:00"},
            "end": {"dateTime": "2026-08-10T09:30:00-05:00"},
            "attendees": [
                {"email": "alice@company.com"},
                {"email": "room@resource.calendar.google.com", "resource": true}
            ],
            "hangoutLink": "https://meet.google.com/abc-defg-hij"
        }"#;
        let raw: GoogleEventRaw = serde_json::from_str(json).unwrap();
        let view = raw.project();
        assert_eq!(view.attendees, vec!["alice@company.com"]);
        assert_eq!(
            view.conference_link.as_deref(),
            Some("https://meet.google.com/abc-defg-hij")
        );
        assert_eq!(view.start, "2026-08-10T09:00:00-05:00");
    }

    #[test]
    fn test_projection_all_day_uses_date() {
        let json = r#"{
            "id": "allday1",
            "start": {"date": "2026-08-10"},
            "end": {"date": "2026-08-11"}
        }"#;
        let raw: GoogleEventRaw = serde_json::from_str(json).unwrap();
        let view = raw.project();
        assert_eq!(view.summary, "(No title)");
        assert_eq!(view.start, "2026-08-10");
    }

    #[test]
    fn test_list_response_deserialization() {
        let json = r#"{
            "items": [
                {"id": "e1", "summary": "One", "status": "confirmed"},
                {"id": "e2", "summary": "Gone", "status": "cancelled"}
            ],
            "nextPageToken": "tok"
        }"#;
        let resp: EventListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.items.len(), 2);
        assert_eq!(resp.next_page_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_parse_event_datetime() {
        let dt = parse_event_datetime("2026-08-10T09:00:00-05:00").unwrap();
        assert_eq!(dt.hour(), 14);
        let dt = parse_event_datetime("2026-08-10T14:00:00Z").unwrap();
        assert_eq!(dt.hour(), 14);
        let dt = parse_event_datetime("2026-08-10").unwrap();
        assert_eq!(dt.hour(), 0);
        assert!(parse_event_datetime("").is_none());
    }
}
