//! Local-mutation actions: tasks, leads, customers.
//!
//! Each performs one logical write. The exception is lead conversion: a
//! copy-then-mark sequence of two writes, where a failure of the second is
//! reported but never rolls back the first — the new customer is the
//! source of truth once created.

use schemars::JsonSchema;
use serde::Deserialize;

use super::{to_payload, validate};
use crate::db::Store;
use crate::error::ActionError;
use crate::types::{CallerContext, Customer, Lead, TaskItem, LEAD_STATUSES, TASK_STATUSES};

fn now_stamp(ctx: &CallerContext) -> String {
    crate::db::ts(&ctx.now)
}

// ============================================================================
// Tasks
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateTaskParams {
    #[schemars(description = "Task title")]
    pub title: String,
    #[schemars(description = "Due date, YYYY-MM-DD")]
    pub due_date: Option<String>,
    #[schemars(description = "Free-form context for the task")]
    pub context: Option<String>,
}

pub async fn create_task(
    store: &Store,
    ctx: &CallerContext,
    params: CreateTaskParams,
) -> Result<serde_json::Value, ActionError> {
    let title = validate::bounded_string(&params.title, "title", 1, 280)?;
    if let Some(ref date) = params.due_date {
        validate::yyyy_mm_dd(date, "due_date")?;
    }
    let context = params
        .context
        .as_deref()
        .map(|c| validate::bounded_string(c, "context", 1, 2000))
        .transpose()?;

    let task = TaskItem {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: ctx.user_id.clone(),
        title,
        due_date: params.due_date,
        status: "pending".to_string(),
        context,
        source_type: Some("manual".to_string()),
        source_id: None,
        created_at: now_stamp(ctx),
        updated_at: now_stamp(ctx),
    };
    store.insert_task(&task)?;
    to_payload(&task)
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UpdateTaskParams {
    #[schemars(description = "Task id")]
    pub id: String,
    pub title: Option<String>,
    #[schemars(description = "New status: pending or done")]
    pub status: Option<String>,
    #[schemars(description = "Due date, YYYY-MM-DD")]
    pub due_date: Option<String>,
    #[schemars(description = "Set true to remove the due date")]
    pub clear_due_date: Option<bool>,
    pub context: Option<String>,
}

pub async fn update_task(
    store: &Store,
    ctx: &CallerContext,
    params: UpdateTaskParams,
) -> Result<serde_json::Value, ActionError> {
    if let Some(ref status) = params.status {
        validate::enum_member(status, "status", TASK_STATUSES)?;
    }
    if let Some(ref date) = params.due_date {
        validate::yyyy_mm_dd(date, "due_date")?;
    }

    let mut task = store
        .get_task(&ctx.user_id, &params.id)?
        .ok_or_else(|| ActionError::NotFound(format!("task {}", params.id)))?;

    if let Some(title) = params.title {
        task.title = validate::bounded_string(&title, "title", 1, 280)?;
    }
    if let Some(status) = params.status {
        task.status = status;
    }
    if params.clear_due_date == Some(true) {
        task.due_date = None;
    } else if let Some(date) = params.due_date {
        task.due_date = Some(date);
    }
    if let Some(context) = params.context {
        task.context = Some(validate::bounded_string(&context, "context", 1, 2000)?);
    }
    task.updated_at = now_stamp(ctx);

    store.update_task(&task)?;
    to_payload(&task)
}

// ============================================================================
// Leads
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateLeadParams {
    #[schemars(description = "Lead's full name")]
    pub name: String,
    #[schemars(description = "Lead's email address")]
    pub email: String,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
}

pub async fn create_lead(
    store: &Store,
    ctx: &CallerContext,
    params: CreateLeadParams,
) -> Result<serde_json::Value, ActionError> {
    let name = validate::bounded_string(&params.name, "name", 1, 200)?;
    let email = validate::email_field(&params.email, "email")?;

    let lead = Lead {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: ctx.user_id.clone(),
        name,
        email,
        company: params.company,
        phone: params.phone,
        status: "new".to_string(),
        notes: params.notes,
        created_at: now_stamp(ctx),
        updated_at: now_stamp(ctx),
    };
    store.insert_lead(&lead)?;
    to_payload(&lead)
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UpdateLeadParams {
    #[schemars(description = "Lead id")]
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    pub phone: Option<String>,
    #[schemars(description = "New status: new, contacted, qualified, converted, or lost")]
    pub status: Option<String>,
    pub notes: Option<String>,
}

pub async fn update_lead(
    store: &Store,
    ctx: &CallerContext,
    params: UpdateLeadParams,
) -> Result<serde_json::Value, ActionError> {
    if let Some(ref status) = params.status {
        validate::enum_member(status, "status", LEAD_STATUSES)?;
    }

    let mut lead = store
        .get_lead(&ctx.user_id, &params.id)?
        .ok_or_else(|| ActionError::NotFound(format!("lead {}", params.id)))?;

    if let Some(name) = params.name {
        lead.name = validate::bounded_string(&name, "name", 1, 200)?;
    }
    if let Some(email) = params.email {
        lead.email = validate::email_field(&email, "email")?;
    }
    if let Some(company) = params.company {
        lead.company = Some(company);
    }
    if let Some(phone) = params.phone {
        lead.phone = Some(phone);
    }
    if let Some(status) = params.status {
        lead.status = status;
    }
    if let Some(notes) = params.notes {
        lead.notes = Some(notes);
    }
    lead.updated_at = now_stamp(ctx);

    store.update_lead(&lead)?;
    to_payload(&lead)
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ConvertLeadParams {
    #[schemars(description = "Id of the lead to convert into a customer")]
    pub lead_id: String,
    #[schemars(description = "Notes to carry onto the new customer record")]
    pub notes: Option<String>,
}

/// Convert a lead into a customer: copy the record, then mark the source
/// lead converted. Both writes are attempted; if marking fails, the error
/// names the failed step and the already-created customer stands.
pub async fn convert_lead(
    store: &Store,
    ctx: &CallerContext,
    params: ConvertLeadParams,
) -> Result<serde_json::Value, ActionError> {
    let lead = store
        .get_lead(&ctx.user_id, &params.lead_id)?
        .ok_or_else(|| ActionError::NotFound(format!("lead {}", params.lead_id)))?;

    if lead.status == crate::types::LEAD_STATUS_CONVERTED {
        return Err(ActionError::InvalidState(format!(
            "lead {} is already converted",
            params.lead_id
        )));
    }

    let customer = Customer {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: ctx.user_id.clone(),
        name: lead.name.clone(),
        email: crate::normalize::normalize_email(&lead.email),
        company: lead.company.clone(),
        phone: lead.phone.clone(),
        notes: params.notes.or_else(|| lead.notes.clone()),
        lead_id: Some(lead.id.clone()),
        created_at: now_stamp(ctx),
        updated_at: now_stamp(ctx),
    };
    store.insert_customer(&customer)?;

    if let Err(e) = store.mark_lead_converted(&ctx.user_id, &lead.id, &now_stamp(ctx)) {
        return Err(ActionError::InvalidState(format!(
            "customer {} was created, but marking lead {} converted failed: {e}; \
             retry update_lead to finish the conversion",
            customer.id, lead.id
        )));
    }

    to_payload(&customer)
}

// ============================================================================
// Customers
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateCustomerParams {
    #[schemars(description = "Customer's full name")]
    pub name: String,
    #[schemars(description = "Customer's email address")]
    pub email: String,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
}

pub async fn create_customer(
    store: &Store,
    ctx: &CallerContext,
    params: CreateCustomerParams,
) -> Result<serde_json::Value, ActionError> {
    let name = validate::bounded_string(&params.name, "name", 1, 200)?;
    let email = validate::email_field(&params.email, "email")?;

    let customer = Customer {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: ctx.user_id.clone(),
        name,
        email,
        company: params.company,
        phone: params.phone,
        notes: params.notes,
        lead_id: None,
        created_at: now_stamp(ctx),
        updated_at: now_stamp(ctx),
    };
    store.insert_customer(&customer)?;
    to_payload(&customer)
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UpdateCustomerParams {
    #[schemars(description = "Customer id")]
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
}

pub async fn update_customer(
    store: &Store,
    ctx: &CallerContext,
    params: UpdateCustomerParams,
) -> Result<serde_json::Value, ActionError> {
    let mut customer = store
        .get_customer(&ctx.user_id, &params.id)?
        .ok_or_else(|| ActionError::NotFound(format!("customer {}", params.id)))?;

    if let Some(name) = params.name {
        customer.name = validate::bounded_string(&name, "name", 1, 200)?;
    }
    if let Some(email) = params.email {
        customer.email = validate::email_field(&email, "email")?;
    }
    if let Some(company) = params.company {
        customer.company = Some(company);
    }
    if let Some(phone) = params.phone {
        customer.phone = Some(phone);
    }
    if let Some(notes) = params.notes {
        customer.notes = Some(notes);
    }
    customer.updated_at = now_stamp(ctx);

    store.update_customer(&customer)?;
    to_payload(&customer)
}
