//! Query actions: read-only lookups against the local store.
//!
//! No side effects, no confirmation. Every lookup is scoped to the caller's
//! user id; single-entity misses are `NotFound`.

use schemars::JsonSchema;
use serde::Deserialize;

use super::{to_payload, validate};
use crate::db::Store;
use crate::error::ActionError;
use crate::types::{CallerContext, SendStatus, LEAD_STATUSES, TASK_STATUSES};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 200;

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT).max(1)
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListLeadsParams {
    #[schemars(description = "Filter: new, contacted, qualified, converted, or lost")]
    pub status: Option<String>,
    #[schemars(description = "Max results (default 50, max 200)")]
    pub limit: Option<usize>,
}

pub async fn list_leads(
    store: &Store,
    ctx: &CallerContext,
    params: ListLeadsParams,
) -> Result<serde_json::Value, ActionError> {
    if let Some(ref status) = params.status {
        validate::enum_member(status, "status", LEAD_STATUSES)?;
    }
    let leads = store.list_leads(
        &ctx.user_id,
        params.status.as_deref(),
        clamp_limit(params.limit),
    )?;
    to_payload(&leads)
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetLeadParams {
    #[schemars(description = "Lead id")]
    pub id: String,
}

pub async fn get_lead(
    store: &Store,
    ctx: &CallerContext,
    params: GetLeadParams,
) -> Result<serde_json::Value, ActionError> {
    let lead = store
        .get_lead(&ctx.user_id, &params.id)?
        .ok_or_else(|| ActionError::NotFound(format!("lead {}", params.id)))?;
    to_payload(&lead)
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchLeadsParams {
    #[schemars(description = "Substring to match against lead name, email, or company")]
    pub query: String,
    #[schemars(description = "Max results (default 50, max 200)")]
    pub limit: Option<usize>,
}

pub async fn search_leads(
    store: &Store,
    ctx: &CallerContext,
    params: SearchLeadsParams,
) -> Result<serde_json::Value, ActionError> {
    if params.query.trim().is_empty() {
        return Err(ActionError::InvalidInput("query must not be empty".to_string()));
    }
    let leads = store.search_leads(&ctx.user_id, &params.query, clamp_limit(params.limit))?;
    to_payload(&leads)
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CountLeadsParams {
    #[schemars(description = "Filter: new, contacted, qualified, converted, or lost")]
    pub status: Option<String>,
}

pub async fn count_leads(
    store: &Store,
    ctx: &CallerContext,
    params: CountLeadsParams,
) -> Result<serde_json::Value, ActionError> {
    if let Some(ref status) = params.status {
        validate::enum_member(status, "status", LEAD_STATUSES)?;
    }
    let count = store.count_leads(&ctx.user_id, params.status.as_deref())?;
    Ok(serde_json::json!({ "count": count }))
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListCustomersParams {
    #[schemars(description = "Max results (default 50, max 200)")]
    pub limit: Option<usize>,
}

pub async fn list_customers(
    store: &Store,
    ctx: &CallerContext,
    params: ListCustomersParams,
) -> Result<serde_json::Value, ActionError> {
    let customers = store.list_customers(&ctx.user_id, clamp_limit(params.limit))?;
    to_payload(&customers)
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetCustomerParams {
    #[schemars(description = "Customer id")]
    pub id: String,
}

pub async fn get_customer(
    store: &Store,
    ctx: &CallerContext,
    params: GetCustomerParams,
) -> Result<serde_json::Value, ActionError> {
    let customer = store
        .get_customer(&ctx.user_id, &params.id)?
        .ok_or_else(|| ActionError::NotFound(format!("customer {}", params.id)))?;
    to_payload(&customer)
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListTasksParams {
    #[schemars(description = "Filter: pending or done")]
    pub status: Option<String>,
    #[schemars(description = "Max results (default 50, max 200)")]
    pub limit: Option<usize>,
}

pub async fn list_tasks(
    store: &Store,
    ctx: &CallerContext,
    params: ListTasksParams,
) -> Result<serde_json::Value, ActionError> {
    if let Some(ref status) = params.status {
        validate::enum_member(status, "status", TASK_STATUSES)?;
    }
    let tasks = store.list_tasks(
        &ctx.user_id,
        params.status.as_deref(),
        clamp_limit(params.limit),
    )?;
    to_payload(&tasks)
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListScheduledEmailsParams {
    #[schemars(description = "Filter: pending, processing, sent, partial, failed, or cancelled")]
    pub status: Option<String>,
    #[schemars(description = "Max results (default 50, max 200)")]
    pub limit: Option<usize>,
}

pub async fn list_scheduled_emails(
    store: &Store,
    ctx: &CallerContext,
    params: ListScheduledEmailsParams,
) -> Result<serde_json::Value, ActionError> {
    let status = params
        .status
        .as_deref()
        .map(|s| {
            SendStatus::parse(s).ok_or_else(|| {
                ActionError::InvalidInput(format!(
                    "status must be one of: pending, processing, sent, partial, failed, cancelled; got {s}"
                ))
            })
        })
        .transpose()?;
    let sends = store.list_scheduled_sends(&ctx.user_id, status, clamp_limit(params.limit))?;
    to_payload(&sends)
}
