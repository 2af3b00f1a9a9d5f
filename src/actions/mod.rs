//! The action catalogue and the dispatcher façade.
//!
//! Actions are a fixed enumeration, each bound to a typed parameter struct
//! and a handler, so unknown names and malformed input are checked
//! exhaustively rather than discovered at call time. The dispatcher owns
//! the two rules the calling agent cannot be trusted with:
//!
//! 1. arguments are validated against the action's schema before anything
//!    else happens;
//! 2. no mutating or external-effect action runs unless this call carries
//!    `confirm: true`. Confirmation is stateless and per-call — nothing is
//!    remembered between invocations.

pub mod calendar;
pub mod links;
pub mod mail;
pub mod query;
pub mod records;
pub(crate) mod validate;

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;

use crate::db::Store;
use crate::error::ActionError;
use crate::providers::{
    calcom::CalComLinks, calendly::CalendlyLinks, gcal::GoogleCalendar, gmail::GmailMailer,
    CalendarPort, CredentialResolver, MailPort, SchedulingLinkPort,
};
use crate::types::{ActionResult, ActionSpec, CallerContext, Mutating};

// ============================================================================
// Action names
// ============================================================================

/// Every action the dispatcher knows. Unknown names fail to parse, which is
/// the `unknown_action` edge of the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionName {
    // Query — no side effects, no confirmation
    ListLeads,
    GetLead,
    SearchLeads,
    CountLeads,
    ListCustomers,
    GetCustomer,
    ListTasks,
    ListScheduledEmails,
    ListCalendarEvents,
    GetSchedulingLinks,
    // Local mutation — confirmation required
    CreateTask,
    UpdateTask,
    CreateLead,
    UpdateLead,
    ConvertLead,
    CreateCustomer,
    UpdateCustomer,
    // External effect — confirmation required
    SendEmail,
    ScheduleEmail,
    CancelScheduledEmail,
    CreateCalendarEvent,
    UpdateCalendarEvent,
    CancelCalendarEvent,
    SyncBookings,
}

impl ActionName {
    pub const ALL: &'static [ActionName] = &[
        ActionName::ListLeads,
        ActionName::GetLead,
        ActionName::SearchLeads,
        ActionName::CountLeads,
        ActionName::ListCustomers,
        ActionName::GetCustomer,
        ActionName::ListTasks,
        ActionName::ListScheduledEmails,
        ActionName::ListCalendarEvents,
        ActionName::GetSchedulingLinks,
        ActionName::CreateTask,
        ActionName::UpdateTask,
        ActionName::CreateLead,
        ActionName::UpdateLead,
        ActionName::ConvertLead,
        ActionName::CreateCustomer,
        ActionName::UpdateCustomer,
        ActionName::SendEmail,
        ActionName::ScheduleEmail,
        ActionName::CancelScheduledEmail,
        ActionName::CreateCalendarEvent,
        ActionName::UpdateCalendarEvent,
        ActionName::CancelCalendarEvent,
        ActionName::SyncBookings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionName::ListLeads => "list_leads",
            ActionName::GetLead => "get_lead",
            ActionName::SearchLeads => "search_leads",
            ActionName::CountLeads => "count_leads",
            ActionName::ListCustomers => "list_customers",
            ActionName::GetCustomer => "get_customer",
            ActionName::ListTasks => "list_tasks",
            ActionName::ListScheduledEmails => "list_scheduled_emails",
            ActionName::ListCalendarEvents => "list_calendar_events",
            ActionName::GetSchedulingLinks => "get_scheduling_links",
            ActionName::CreateTask => "create_task",
            ActionName::UpdateTask => "update_task",
            ActionName::CreateLead => "create_lead",
            ActionName::UpdateLead => "update_lead",
            ActionName::ConvertLead => "convert_lead",
            ActionName::CreateCustomer => "create_customer",
            ActionName::UpdateCustomer => "update_customer",
            ActionName::SendEmail => "send_email",
            ActionName::ScheduleEmail => "schedule_email",
            ActionName::CancelScheduledEmail => "cancel_scheduled_email",
            ActionName::CreateCalendarEvent => "create_calendar_event",
            ActionName::UpdateCalendarEvent => "update_calendar_event",
            ActionName::CancelCalendarEvent => "cancel_calendar_event",
            ActionName::SyncBookings => "sync_bookings",
        }
    }

    /// Whether the confirmation gate applies. Every action that writes the
    /// local store or calls a provider mutation requires it; provider reads
    /// and link building do not.
    pub fn requires_confirmation(&self) -> bool {
        !matches!(
            self,
            ActionName::ListLeads
                | ActionName::GetLead
                | ActionName::SearchLeads
                | ActionName::CountLeads
                | ActionName::ListCustomers
                | ActionName::GetCustomer
                | ActionName::ListTasks
                | ActionName::ListScheduledEmails
                | ActionName::ListCalendarEvents
                | ActionName::GetSchedulingLinks
        )
    }
}

impl FromStr for ActionName {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionName::ALL
            .iter()
            .find(|a| a.as_str() == s)
            .copied()
            .ok_or(())
    }
}

impl std::fmt::Display for ActionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Catalogue
// ============================================================================

fn schema<T: JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| serde_json::json!({}))
}

fn spec_for(action: ActionName) -> ActionSpec {
    let (description, input_schema) = match action {
        ActionName::ListLeads => (
            "List the caller's leads, optionally filtered by status.",
            schema::<query::ListLeadsParams>(),
        ),
        ActionName::GetLead => (
            "Fetch one lead by id.",
            schema::<query::GetLeadParams>(),
        ),
        ActionName::SearchLeads => (
            "Search leads by name, email, or company substring.",
            schema::<query::SearchLeadsParams>(),
        ),
        ActionName::CountLeads => (
            "Count the caller's leads, optionally filtered by status.",
            schema::<query::CountLeadsParams>(),
        ),
        ActionName::ListCustomers => (
            "List the caller's customers.",
            schema::<query::ListCustomersParams>(),
        ),
        ActionName::GetCustomer => (
            "Fetch one customer by id.",
            schema::<query::GetCustomerParams>(),
        ),
        ActionName::ListTasks => (
            "List the caller's tasks, optionally filtered by status.",
            schema::<query::ListTasksParams>(),
        ),
        ActionName::ListScheduledEmails => (
            "List the caller's scheduled (deferred) emails.",
            schema::<query::ListScheduledEmailsParams>(),
        ),
        ActionName::ListCalendarEvents => (
            "List upcoming calendar events in a time window.",
            schema::<calendar::ListCalendarEventsParams>(),
        ),
        ActionName::GetSchedulingLinks => (
            "List bookable event types from the connected scheduling-link providers and build prefillable share links.",
            schema::<links::GetSchedulingLinksParams>(),
        ),
        ActionName::CreateTask => (
            "Create a task on the caller's worklist.",
            schema::<Mutating<records::CreateTaskParams>>(),
        ),
        ActionName::UpdateTask => (
            "Update fields on an existing task.",
            schema::<Mutating<records::UpdateTaskParams>>(),
        ),
        ActionName::CreateLead => (
            "Create a new lead.",
            schema::<Mutating<records::CreateLeadParams>>(),
        ),
        ActionName::UpdateLead => (
            "Update fields on an existing lead.",
            schema::<Mutating<records::UpdateLeadParams>>(),
        ),
        ActionName::ConvertLead => (
            "Convert a lead into a customer, marking the lead converted.",
            schema::<Mutating<records::ConvertLeadParams>>(),
        ),
        ActionName::CreateCustomer => (
            "Create a new customer.",
            schema::<Mutating<records::CreateCustomerParams>>(),
        ),
        ActionName::UpdateCustomer => (
            "Update fields on an existing customer.",
            schema::<Mutating<records::UpdateCustomerParams>>(),
        ),
        ActionName::SendEmail => (
            "Send an email now from the caller's connected mailbox.",
            schema::<Mutating<mail::SendEmailParams>>(),
        ),
        ActionName::ScheduleEmail => (
            "Schedule an email for deferred delivery (at least 30 seconds out).",
            schema::<Mutating<mail::ScheduleEmailParams>>(),
        ),
        ActionName::CancelScheduledEmail => (
            "Cancel a scheduled email while it is still pending or processing.",
            schema::<Mutating<mail::CancelScheduledEmailParams>>(),
        ),
        ActionName::CreateCalendarEvent => (
            "Create a calendar event. Defaults to 30 minutes when no end is given.",
            schema::<Mutating<calendar::CreateCalendarEventParams>>(),
        ),
        ActionName::UpdateCalendarEvent => (
            "Update an existing calendar event.",
            schema::<Mutating<calendar::UpdateCalendarEventParams>>(),
        ),
        ActionName::CancelCalendarEvent => (
            "Cancel (delete) a calendar event.",
            schema::<Mutating<calendar::CancelCalendarEventParams>>(),
        ),
        ActionName::SyncBookings => (
            "Sync upcoming external bookings into local tasks.",
            schema::<Mutating<calendar::SyncBookingsParams>>(),
        ),
    };

    ActionSpec {
        name: action.as_str(),
        description,
        requires_confirmation: action.requires_confirmation(),
        input_schema,
    }
}

/// The full catalogue, for advertising to the calling agent.
pub fn catalogue() -> Vec<ActionSpec> {
    ActionName::ALL.iter().map(|a| spec_for(*a)).collect()
}

// ============================================================================
// Dispatch plumbing
// ============================================================================

/// Serialize a handler result into the envelope payload.
pub(crate) fn to_payload<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, ActionError> {
    serde_json::to_value(value)
        .map_err(|e| ActionError::InvalidState(format!("serialize payload: {e}")))
}

fn parse_args<P: DeserializeOwned>(raw: serde_json::Value) -> Result<P, ActionError> {
    serde_json::from_value(raw)
        .map_err(|e| ActionError::InvalidInput(format!("invalid arguments: {e}")))
}

/// Run a query action: parse, execute. No gate.
async fn plain<P, F, Fut>(raw: serde_json::Value, run: F) -> Result<ActionResult, ActionError>
where
    P: DeserializeOwned,
    F: FnOnce(P) -> Fut,
    Fut: Future<Output = Result<serde_json::Value, ActionError>>,
{
    let params: P = parse_args(raw)?;
    Ok(ActionResult::ok(run(params).await?))
}

/// Run a mutating action: parse (validation first, so malformed input is
/// reported even without confirmation), then gate, then execute. This is
/// the single place the confirmation rule lives.
async fn gated<P, N, F, Fut>(
    raw: serde_json::Value,
    notice: N,
    run: F,
) -> Result<ActionResult, ActionError>
where
    P: DeserializeOwned,
    N: FnOnce(&P) -> String,
    F: FnOnce(P) -> Fut,
    Fut: Future<Output = Result<serde_json::Value, ActionError>>,
{
    let wrapped: Mutating<P> = parse_args(raw)?;
    if !wrapped.confirm {
        let mut message = notice(&wrapped.args);
        message.push_str(" Re-invoke with confirm=true to proceed.");
        return Ok(ActionResult::confirm(message));
    }
    Ok(ActionResult::ok(run(wrapped.args).await?))
}

// ============================================================================
// Dispatcher
// ============================================================================

/// The façade between the calling agent and everything with consequences.
pub struct Dispatcher {
    store: Arc<Store>,
    credentials: Arc<dyn CredentialResolver>,
    mail: Arc<dyn MailPort>,
    calendar: Arc<dyn CalendarPort>,
    links: Vec<Arc<dyn SchedulingLinkPort>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        credentials: Arc<dyn CredentialResolver>,
        mail: Arc<dyn MailPort>,
        calendar: Arc<dyn CalendarPort>,
        links: Vec<Arc<dyn SchedulingLinkPort>>,
    ) -> Self {
        Self {
            store,
            credentials,
            mail,
            calendar,
            links,
        }
    }

    /// Production wiring: Gmail, Google Calendar, Calendly, and Cal.com
    /// adapters behind the given credential resolver.
    pub fn with_default_adapters(
        store: Arc<Store>,
        credentials: Arc<dyn CredentialResolver>,
    ) -> Self {
        Self::new(
            store,
            credentials,
            Arc::new(GmailMailer),
            Arc::new(GoogleCalendar),
            vec![Arc::new(CalendlyLinks), Arc::new(CalComLinks)],
        )
    }

    /// Dispatch one invocation. Always returns a structured envelope; no
    /// handler failure propagates raw.
    pub async fn dispatch(
        &self,
        name: &str,
        args: serde_json::Value,
        ctx: &CallerContext,
    ) -> ActionResult {
        if ctx.user_id.trim().is_empty() {
            return ActionResult::from(ActionError::Unauthorized);
        }

        let Ok(action) = ActionName::from_str(name) else {
            return ActionResult::from(ActionError::UnknownAction(name.to_string()));
        };

        match self.execute(action, args, ctx).await {
            Ok(result) => result,
            Err(e) => {
                log::warn!("action {action} failed for user {}: {e}", ctx.user_id);
                ActionResult::from(e)
            }
        }
    }

    async fn execute(
        &self,
        action: ActionName,
        raw: serde_json::Value,
        ctx: &CallerContext,
    ) -> Result<ActionResult, ActionError> {
        let store = self.store.as_ref();
        let credentials = self.credentials.as_ref();

        match action {
            // --- queries ---------------------------------------------------
            ActionName::ListLeads => plain(raw, |p| query::list_leads(store, ctx, p)).await,
            ActionName::GetLead => plain(raw, |p| query::get_lead(store, ctx, p)).await,
            ActionName::SearchLeads => plain(raw, |p| query::search_leads(store, ctx, p)).await,
            ActionName::CountLeads => plain(raw, |p| query::count_leads(store, ctx, p)).await,
            ActionName::ListCustomers => {
                plain(raw, |p| query::list_customers(store, ctx, p)).await
            }
            ActionName::GetCustomer => plain(raw, |p| query::get_customer(store, ctx, p)).await,
            ActionName::ListTasks => plain(raw, |p| query::list_tasks(store, ctx, p)).await,
            ActionName::ListScheduledEmails => {
                plain(raw, |p| query::list_scheduled_emails(store, ctx, p)).await
            }
            ActionName::ListCalendarEvents => {
                plain(raw, |p| {
                    calendar::list_events(credentials, self.calendar.as_ref(), ctx, p)
                })
                .await
            }
            ActionName::GetSchedulingLinks => {
                plain(raw, |p| {
                    links::get_scheduling_links(credentials, &self.links, ctx, p)
                })
                .await
            }

            // --- local mutations -------------------------------------------
            ActionName::CreateTask => {
                gated(
                    raw,
                    |p: &records::CreateTaskParams| format!("Create task \"{}\"?", p.title),
                    |p| records::create_task(store, ctx, p),
                )
                .await
            }
            ActionName::UpdateTask => {
                gated(
                    raw,
                    |p: &records::UpdateTaskParams| format!("Update task {}?", p.id),
                    |p| records::update_task(store, ctx, p),
                )
                .await
            }
            ActionName::CreateLead => {
                gated(
                    raw,
                    |p: &records::CreateLeadParams| {
                        format!("Create lead {} <{}>?", p.name, p.email)
                    },
                    |p| records::create_lead(store, ctx, p),
                )
                .await
            }
            ActionName::UpdateLead => {
                gated(
                    raw,
                    |p: &records::UpdateLeadParams| format!("Update lead {}?", p.id),
                    |p| records::update_lead(store, ctx, p),
                )
                .await
            }
            ActionName::ConvertLead => {
                gated(
                    raw,
                    |p: &records::ConvertLeadParams| {
                        format!("Convert lead {} into a customer?", p.lead_id)
                    },
                    |p| records::convert_lead(store, ctx, p),
                )
                .await
            }
            ActionName::CreateCustomer => {
                gated(
                    raw,
                    |p: &records::CreateCustomerParams| {
                        format!("Create customer {} <{}>?", p.name, p.email)
                    },
                    |p| records::create_customer(store, ctx, p),
                )
                .await
            }
            ActionName::UpdateCustomer => {
                gated(
                    raw,
                    |p: &records::UpdateCustomerParams| format!("Update customer {}?", p.id),
                    |p| records::update_customer(store, ctx, p),
                )
                .await
            }

            // --- external effects ------------------------------------------
            ActionName::SendEmail => {
                gated(
                    raw,
                    |p: &mail::SendEmailParams| {
                        format!("Send \"{}\" to {}?", p.subject, p.to.join(", "))
                    },
                    |p| mail::send_email(store, credentials, self.mail.as_ref(), ctx, p),
                )
                .await
            }
            ActionName::ScheduleEmail => {
                gated(
                    raw,
                    |p: &mail::ScheduleEmailParams| {
                        format!("Schedule \"{}\" to {}?", p.subject, p.to.join(", "))
                    },
                    |p| mail::schedule_email(store, ctx, p),
                )
                .await
            }
            ActionName::CancelScheduledEmail => {
                gated(
                    raw,
                    |p: &mail::CancelScheduledEmailParams| {
                        format!("Cancel scheduled email {}?", p.id)
                    },
                    |p| mail::cancel_scheduled_email(store, ctx, p),
                )
                .await
            }
            ActionName::CreateCalendarEvent => {
                gated(
                    raw,
                    |p: &calendar::CreateCalendarEventParams| {
                        format!("Create calendar event \"{}\" at {}?", p.summary, p.start_iso)
                    },
                    |p| calendar::create_event(credentials, self.calendar.as_ref(), ctx, p),
                )
                .await
            }
            ActionName::UpdateCalendarEvent => {
                gated(
                    raw,
                    |p: &calendar::UpdateCalendarEventParams| {
                        format!("Update calendar event {}?", p.event_id)
                    },
                    |p| calendar::update_event(credentials, self.calendar.as_ref(), ctx, p),
                )
                .await
            }
            ActionName::CancelCalendarEvent => {
                gated(
                    raw,
                    |p: &calendar::CancelCalendarEventParams| {
                        format!("Cancel calendar event {}?", p.event_id)
                    },
                    |p| calendar::cancel_event(credentials, self.calendar.as_ref(), ctx, p),
                )
                .await
            }
            ActionName::SyncBookings => {
                gated(
                    raw,
                    |_: &calendar::SyncBookingsParams| {
                        "Sync upcoming bookings into local tasks?".to_string()
                    },
                    |p| {
                        calendar::sync_bookings(
                            store,
                            credentials,
                            self.calendar.as_ref(),
                            ctx,
                            p,
                        )
                    },
                )
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use crate::providers::{
        EventDraft, EventPatch, OutgoingMail, ProviderCredential, ProviderKind,
        SchedulingEventType, SendReceipt, TimeWindow,
    };
    use crate::types::{CalendarEventView, Lead, TaskItem, UserProfile};

    // -----------------------------------------------------------------------
    // Spy ports and fixtures
    // -----------------------------------------------------------------------

    struct StaticResolver {
        connected: HashSet<ProviderKind>,
    }

    impl StaticResolver {
        fn all() -> Self {
            Self {
                connected: [
                    ProviderKind::Gmail,
                    ProviderKind::GoogleCalendar,
                    ProviderKind::Calendly,
                    ProviderKind::CalCom,
                ]
                .into_iter()
                .collect(),
            }
        }

        fn only(providers: &[ProviderKind]) -> Self {
            Self {
                connected: providers.iter().copied().collect(),
            }
        }
    }

    #[async_trait]
    impl CredentialResolver for StaticResolver {
        async fn resolve(
            &self,
            _user_id: &str,
            provider: ProviderKind,
        ) -> Result<ProviderCredential, ActionError> {
            if self.connected.contains(&provider) {
                Ok(ProviderCredential {
                    access_token: "tok".to_string(),
                    provider_identity: Some("me@myco.com".to_string()),
                })
            } else {
                Err(ActionError::NotConnected { provider })
            }
        }
    }

    #[derive(Default)]
    struct SpyMail {
        sends: AtomicUsize,
        last: parking_lot::Mutex<Option<OutgoingMail>>,
    }

    #[async_trait]
    impl MailPort for SpyMail {
        async fn send(
            &self,
            _credential: &ProviderCredential,
            mail: &OutgoingMail,
        ) -> Result<SendReceipt, ActionError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some(mail.clone());
            Ok(SendReceipt {
                message_id: "msg_1".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct SpyCalendar {
        calls: AtomicUsize,
        drafts: parking_lot::Mutex<Vec<EventDraft>>,
        listed: parking_lot::Mutex<Vec<CalendarEventView>>,
        deleted: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CalendarPort for SpyCalendar {
        async fn create_event(
            &self,
            _credential: &ProviderCredential,
            draft: &EventDraft,
        ) -> Result<CalendarEventView, ActionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.drafts.lock().push(draft.clone());
            Ok(CalendarEventView {
                id: "evt_new".to_string(),
                summary: draft.summary.clone(),
                status: "confirmed".to_string(),
                start: draft.start.to_rfc3339(),
                end: draft.end.to_rfc3339(),
                attendees: draft.attendees.clone(),
                conference_link: draft
                    .with_conference
                    .then(|| "https://meet.example/xyz".to_string()),
            })
        }

        async fn list_events(
            &self,
            _credential: &ProviderCredential,
            _window: &TimeWindow,
        ) -> Result<Vec<CalendarEventView>, ActionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.listed.lock().clone())
        }

        async fn update_event(
            &self,
            _credential: &ProviderCredential,
            event_id: &str,
            patch: &EventPatch,
        ) -> Result<CalendarEventView, ActionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CalendarEventView {
                id: event_id.to_string(),
                summary: patch.summary.clone().unwrap_or_else(|| "unchanged".into()),
                status: "confirmed".to_string(),
                start: String::new(),
                end: String::new(),
                attendees: patch.attendees.clone().unwrap_or_default(),
                conference_link: None,
            })
        }

        async fn delete_event(
            &self,
            _credential: &ProviderCredential,
            event_id: &str,
        ) -> Result<(), ActionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.deleted.lock().push(event_id.to_string());
            Ok(())
        }
    }

    struct SpyLinks {
        kind: ProviderKind,
        calls: AtomicUsize,
    }

    impl SpyLinks {
        fn new(kind: ProviderKind) -> Self {
            Self {
                kind,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SchedulingLinkPort for SpyLinks {
        fn provider(&self) -> ProviderKind {
            self.kind
        }

        async fn list_event_types(
            &self,
            _credential: &ProviderCredential,
        ) -> Result<Vec<SchedulingEventType>, ActionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![SchedulingEventType {
                uri: format!("{}/et1", self.kind),
                name: "Intro call".to_string(),
                scheduling_url: format!("https://{}.example/jane/intro", self.kind),
            }])
        }
    }

    fn ctx() -> CallerContext {
        CallerContext::new(
            "u1",
            chrono_tz::America::New_York,
            Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).unwrap(),
        )
    }

    struct Harness {
        dispatcher: Dispatcher,
        store: Arc<Store>,
        mail: Arc<SpyMail>,
        calendar: Arc<SpyCalendar>,
    }

    fn harness_with(resolver: StaticResolver) -> Harness {
        let store = Arc::new(Store::open_in_memory().expect("in-memory store"));
        let mail = Arc::new(SpyMail::default());
        let calendar = Arc::new(SpyCalendar::default());
        let links: Vec<Arc<dyn SchedulingLinkPort>> = vec![
            Arc::new(SpyLinks::new(ProviderKind::Calendly)),
            Arc::new(SpyLinks::new(ProviderKind::CalCom)),
        ];
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(resolver),
            mail.clone(),
            calendar.clone(),
            links,
        );
        Harness {
            dispatcher,
            store,
            mail,
            calendar,
        }
    }

    fn harness() -> Harness {
        harness_with(StaticResolver::all())
    }

    fn as_json(result: &ActionResult) -> serde_json::Value {
        serde_json::to_value(result).expect("serializable envelope")
    }

    fn seed_lead(store: &Store, id: &str, email: &str) {
        store
            .insert_lead(&Lead {
                id: id.to_string(),
                user_id: "u1".to_string(),
                name: "Jane Doe".to_string(),
                email: email.to_string(),
                company: Some("Acme".to_string()),
                phone: None,
                status: "qualified".to_string(),
                notes: None,
                created_at: "2026-08-01T10:00:00Z".to_string(),
                updated_at: "2026-08-01T10:00:00Z".to_string(),
            })
            .expect("seed lead");
    }

    // -----------------------------------------------------------------------
    // Dispatch contract
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_unknown_action() {
        let h = harness();
        let result = h.dispatcher.dispatch("launch_rocket", json!({}), &ctx()).await;
        let json = as_json(&result);
        assert_eq!(json["status"], "error");
        assert_eq!(json["kind"], "unknown_action");
    }

    #[tokio::test]
    async fn test_empty_user_is_unauthorized() {
        let h = harness();
        let anon = CallerContext::new("  ", chrono_tz::UTC, ctx().now);
        let result = h.dispatcher.dispatch("list_leads", json!({}), &anon).await;
        assert_eq!(as_json(&result)["kind"], "unauthorized");
    }

    #[tokio::test]
    async fn test_malformed_arguments_fail_validation_before_the_gate() {
        let h = harness();
        // title missing entirely; confirm also absent — validation reports
        // first, per the dispatch order
        let result = h.dispatcher.dispatch("create_task", json!({}), &ctx()).await;
        let json = as_json(&result);
        assert_eq!(json["status"], "error");
        assert_eq!(json["kind"], "invalid_input");
        assert!(json["message"].as_str().unwrap().contains("title"));
    }

    #[tokio::test]
    async fn test_unconfirmed_send_is_blocked_with_zero_side_effects() {
        let h = harness();
        let args = json!({
            "to": ["jane@example.com"],
            "subject": "Hello",
            "text": "Hi there"
        });

        let result = h.dispatcher.dispatch("send_email", args.clone(), &ctx()).await;
        let json = as_json(&result);
        assert_eq!(json["status"], "requires_confirmation");
        assert!(json["message"].as_str().unwrap().contains("confirm=true"));

        // confirm: false is not confirmation either
        let mut explicit = args;
        explicit["confirm"] = json!(false);
        let result = h.dispatcher.dispatch("send_email", explicit, &ctx()).await;
        assert_eq!(as_json(&result)["status"], "requires_confirmation");

        assert_eq!(h.mail.sends.load(Ordering::SeqCst), 0);
        assert!(h.store.list_sent_log("u1", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unconfirmed_local_mutation_writes_nothing() {
        let h = harness();
        let result = h
            .dispatcher
            .dispatch(
                "create_lead",
                json!({"name": "Jane", "email": "jane@example.com"}),
                &ctx(),
            )
            .await;
        assert_eq!(as_json(&result)["status"], "requires_confirmation");
        assert_eq!(h.store.count_leads("u1", None).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queries_need_no_confirmation() {
        let h = harness();
        seed_lead(&h.store, "l1", "jane@example.com");

        let result = h.dispatcher.dispatch("list_leads", json!({}), &ctx()).await;
        let json = as_json(&result);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["payload"].as_array().unwrap().len(), 1);

        let result = h
            .dispatcher
            .dispatch("get_lead", json!({"id": "ghost"}), &ctx())
            .await;
        assert_eq!(as_json(&result)["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_search_leads_matches_substring() {
        let h = harness();
        seed_lead(&h.store, "l1", "jane@acme.com");

        let result = h
            .dispatcher
            .dispatch("search_leads", json!({"query": "acme"}), &ctx())
            .await;
        let json = as_json(&result);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["payload"].as_array().unwrap().len(), 1);

        let result = h
            .dispatcher
            .dispatch("search_leads", json!({"query": "zzz"}), &ctx())
            .await;
        assert_eq!(as_json(&result)["payload"].as_array().unwrap().len(), 0);

        let result = h
            .dispatcher
            .dispatch("search_leads", json!({"query": "  "}), &ctx())
            .await;
        assert_eq!(as_json(&result)["kind"], "invalid_input");
    }

    // -----------------------------------------------------------------------
    // Mail
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_confirmed_send_templates_normalizes_and_audits() {
        let h = harness();
        h.store
            .upsert_profile(&UserProfile {
                user_id: "u1".to_string(),
                display_name: None,
                first_name: Some("Jane".to_string()),
                last_name: Some("Doe".to_string()),
                email: "jane@myco.com".to_string(),
            })
            .unwrap();

        let result = h
            .dispatcher
            .dispatch(
                "send_email",
                json!({
                    "confirm": true,
                    "to": ["Bob Smith <BOB@Example.COM>", "bob@example.com"],
                    "subject": "Intro from [Your Name]",
                    "text": "Hi Bob,\n\nBest,\n[your name]"
                }),
                &ctx(),
            )
            .await;

        let json = as_json(&result);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["payload"]["messageId"], "msg_1");

        assert_eq!(h.mail.sends.load(Ordering::SeqCst), 1);
        let sent = h.mail.last.lock().clone().unwrap();
        assert_eq!(sent.to, vec!["bob@example.com"]); // normalized + deduped
        assert_eq!(sent.subject, "Intro from Jane Doe");
        assert_eq!(sent.text.as_deref(), Some("Hi Bob,\n\nBest,\nJane Doe"));

        let log = h.store.list_sent_log("u1", 10).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].provider_message_id, "msg_1");
    }

    #[tokio::test]
    async fn test_send_without_connection_is_not_connected() {
        let h = harness_with(StaticResolver::only(&[ProviderKind::GoogleCalendar]));
        let result = h
            .dispatcher
            .dispatch(
                "send_email",
                json!({
                    "confirm": true,
                    "to": ["jane@example.com"],
                    "subject": "Hello",
                    "text": "hi"
                }),
                &ctx(),
            )
            .await;
        assert_eq!(as_json(&result)["kind"], "not_connected");
        assert_eq!(h.mail.sends.load(Ordering::SeqCst), 0);
    }

    // -----------------------------------------------------------------------
    // Scheduled sends through the dispatcher
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_schedule_cancel_lifecycle() {
        let h = harness();
        let result = h
            .dispatcher
            .dispatch(
                "schedule_email",
                json!({
                    "confirm": true,
                    "to": ["jane@example.com"],
                    "subject": "Later",
                    "text": "hello",
                    "in_minutes": 5
                }),
                &ctx(),
            )
            .await;
        let json = as_json(&result);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["payload"]["status"], "pending");
        let id = json["payload"]["id"].as_str().unwrap().to_string();

        let result = h
            .dispatcher
            .dispatch(
                "cancel_scheduled_email",
                json!({"confirm": true, "id": id}),
                &ctx(),
            )
            .await;
        assert_eq!(as_json(&result)["payload"]["status"], "cancelled");

        // second cancel: InvalidState, not corruption
        let result = h
            .dispatcher
            .dispatch(
                "cancel_scheduled_email",
                json!({"confirm": true, "id": id}),
                &ctx(),
            )
            .await;
        assert_eq!(as_json(&result)["kind"], "invalid_state");
    }

    #[tokio::test]
    async fn test_schedule_below_floor_is_rejected() {
        let h = harness();
        let soon = (ctx().now + chrono::Duration::seconds(10)).to_rfc3339();
        let result = h
            .dispatcher
            .dispatch(
                "schedule_email",
                json!({
                    "confirm": true,
                    "to": ["jane@example.com"],
                    "subject": "Too soon",
                    "text": "hello",
                    "send_at_iso": soon
                }),
                &ctx(),
            )
            .await;
        assert_eq!(as_json(&result)["kind"], "invalid_input");
        assert!(h
            .store
            .list_scheduled_sends("u1", None, 10)
            .unwrap()
            .is_empty());
    }

    // -----------------------------------------------------------------------
    // Lead conversion
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_convert_lead_copies_then_marks() {
        let h = harness();
        seed_lead(&h.store, "l1", "A@B.com");

        let result = h
            .dispatcher
            .dispatch(
                "convert_lead",
                json!({"confirm": true, "lead_id": "l1"}),
                &ctx(),
            )
            .await;
        let json = as_json(&result);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["payload"]["email"], "a@b.com");
        assert_eq!(json["payload"]["leadId"], "l1");

        let lead = h.store.get_lead("u1", "l1").unwrap().unwrap();
        assert_eq!(lead.status, "converted");

        // converting again is an invalid state, not a duplicate customer
        let result = h
            .dispatcher
            .dispatch(
                "convert_lead",
                json!({"confirm": true, "lead_id": "l1"}),
                &ctx(),
            )
            .await;
        assert_eq!(as_json(&result)["kind"], "invalid_state");
        assert_eq!(h.store.list_customers("u1", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_convert_lead_mark_failure_keeps_customer() {
        let h = harness();
        seed_lead(&h.store, "l1", "A@B.com");
        h.store
            .conn_ref()
            .execute_batch(
                "CREATE TRIGGER block_convert BEFORE UPDATE ON leads
                 FOR EACH ROW WHEN NEW.status = 'converted'
                 BEGIN SELECT RAISE(ABORT, 'conversion blocked'); END;",
            )
            .unwrap();

        let result = h
            .dispatcher
            .dispatch(
                "convert_lead",
                json!({"confirm": true, "lead_id": "l1"}),
                &ctx(),
            )
            .await;
        let json = as_json(&result);
        assert_eq!(json["status"], "error");
        // the failed step is named so the caller can retry the remainder
        assert!(json["message"].as_str().unwrap().contains("marking lead"));

        // the first write stands: the customer exists and is queryable
        let customers = h.store.list_customers("u1", 10).unwrap();
        assert_eq!(customers.len(), 1);
        assert_eq!(customers[0].email, "a@b.com");
        // and the source lead was not marked
        assert_eq!(h.store.get_lead("u1", "l1").unwrap().unwrap().status, "qualified");
    }

    // -----------------------------------------------------------------------
    // Calendar
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_create_event_defaults_to_thirty_minutes() {
        let h = harness();
        let result = h
            .dispatcher
            .dispatch(
                "create_calendar_event",
                json!({
                    "confirm": true,
                    "summary": "Demo",
                    "start_iso": "2026-08-10T14:00:00Z"
                }),
                &ctx(),
            )
            .await;
        assert_eq!(as_json(&result)["status"], "ok");

        let drafts = h.calendar.drafts.lock();
        assert_eq!(drafts.len(), 1);
        assert_eq!(
            drafts[0].end - drafts[0].start,
            chrono::Duration::minutes(30)
        );
        assert!(!drafts[0].with_conference);
    }

    #[tokio::test]
    async fn test_create_event_rejects_inverted_window_before_any_call() {
        let h = harness();
        let result = h
            .dispatcher
            .dispatch(
                "create_calendar_event",
                json!({
                    "confirm": true,
                    "summary": "Demo",
                    "start_iso": "2026-08-10T14:00:00Z",
                    "end_iso": "2026-08-10T13:00:00Z"
                }),
                &ctx(),
            )
            .await;
        assert_eq!(as_json(&result)["kind"], "invalid_input");
        assert_eq!(h.calendar.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wall_clock_start_resolves_in_caller_timezone() {
        let h = harness();
        let result = h
            .dispatcher
            .dispatch(
                "create_calendar_event",
                json!({
                    "confirm": true,
                    "summary": "Local time demo",
                    "start_iso": "2026-08-10T09:00:00"
                }),
                &ctx(),
            )
            .await;
        assert_eq!(as_json(&result)["status"], "ok");

        // 9 AM America/New_York in August is 13:00 UTC (EDT)
        let drafts = h.calendar.drafts.lock();
        assert_eq!(
            drafts[0].start,
            Utc.with_ymd_and_hms(2026, 8, 10, 13, 0, 0).unwrap()
        );
        assert_eq!(drafts[0].timezone, "America/New_York");
    }

    #[tokio::test]
    async fn test_sync_bookings_dedups_on_event_id() {
        let h = harness();
        *h.calendar.listed.lock() = vec![
            CalendarEventView {
                id: "evt_1".to_string(),
                summary: "Intro call".to_string(),
                status: "confirmed".to_string(),
                start: "2026-08-10T14:00:00Z".to_string(),
                end: "2026-08-10T14:30:00Z".to_string(),
                attendees: vec!["jane@example.com".to_string()],
                conference_link: None,
            },
            CalendarEventView {
                id: "evt_2".to_string(),
                summary: "Renewal".to_string(),
                status: "confirmed".to_string(),
                start: "2026-08-11T15:00:00Z".to_string(),
                end: "2026-08-11T15:30:00Z".to_string(),
                attendees: vec![],
                conference_link: None,
            },
        ];
        // evt_1 was synced on a previous run
        h.store
            .insert_task(&TaskItem {
                id: "t0".to_string(),
                user_id: "u1".to_string(),
                title: "Booking: Intro call".to_string(),
                due_date: None,
                status: "pending".to_string(),
                context: None,
                source_type: Some("booking".to_string()),
                source_id: Some("evt_1".to_string()),
                created_at: "2026-08-01T10:00:00Z".to_string(),
                updated_at: "2026-08-01T10:00:00Z".to_string(),
            })
            .unwrap();

        let result = h
            .dispatcher
            .dispatch("sync_bookings", json!({"confirm": true}), &ctx())
            .await;
        let json = as_json(&result);
        assert_eq!(json["payload"]["created"], 1);
        assert_eq!(json["payload"]["skipped"], 1);

        // idempotent: a second run creates nothing new
        let result = h
            .dispatcher
            .dispatch("sync_bookings", json!({"confirm": true}), &ctx())
            .await;
        assert_eq!(as_json(&result)["payload"]["created"], 0);
        assert_eq!(as_json(&result)["payload"]["skipped"], 2);
    }

    // -----------------------------------------------------------------------
    // Scheduling links
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_scheduling_links_skip_unconnected_providers() {
        let h = harness_with(StaticResolver::only(&[ProviderKind::Calendly]));
        // no confirm field at all: link building is read-only
        let result = h
            .dispatcher
            .dispatch(
                "get_scheduling_links",
                json!({"prefill_email": "ADA@Example.com"}),
                &ctx(),
            )
            .await;
        let json = as_json(&result);
        assert_eq!(json["status"], "ok");

        let links = json["payload"].as_array().unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0]["provider"], "calendly");
        assert!(links[0]["shareLink"]
            .as_str()
            .unwrap()
            .contains("email=ada%40example.com"));
    }

    #[tokio::test]
    async fn test_scheduling_links_explicit_provider_errors_when_unconnected() {
        let h = harness_with(StaticResolver::only(&[ProviderKind::Calendly]));
        let result = h
            .dispatcher
            .dispatch(
                "get_scheduling_links",
                json!({"provider": "calcom"}),
                &ctx(),
            )
            .await;
        assert_eq!(as_json(&result)["kind"], "not_connected");
    }

    // -----------------------------------------------------------------------
    // Catalogue
    // -----------------------------------------------------------------------

    #[test]
    fn test_catalogue_covers_every_action_once() {
        let specs = catalogue();
        assert_eq!(specs.len(), ActionName::ALL.len());

        let names: HashSet<&str> = specs.iter().map(|s| s.name).collect();
        assert_eq!(names.len(), specs.len());
    }

    #[test]
    fn test_catalogue_schemas_expose_the_gate() {
        for spec in catalogue() {
            let confirm = spec.input_schema.get("properties").and_then(|p| p.get("confirm"));
            if spec.requires_confirmation {
                assert!(
                    confirm.is_some(),
                    "{} is mutating but its schema lacks confirm",
                    spec.name
                );
            } else {
                assert!(
                    confirm.is_none(),
                    "{} is read-only but advertises confirm",
                    spec.name
                );
            }
        }
    }

    #[test]
    fn test_action_name_round_trip() {
        for action in ActionName::ALL {
            assert_eq!(ActionName::from_str(action.as_str()), Ok(*action));
        }
        assert!(ActionName::from_str("definitely_not_an_action").is_err());
    }
}
