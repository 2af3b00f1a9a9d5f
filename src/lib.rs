//! Leadflow assistant actions — confirmation-gated dispatch of CRM
//! operations invoked by an LLM agent.
//!
//! The host hands [`Dispatcher::dispatch`] an action name and raw JSON
//! arguments; the dispatcher validates the arguments, applies the
//! confirmation gate, executes the action body, and returns a uniform
//! [`ActionResult`] envelope. Provider calls (Gmail, Google Calendar,
//! Calendly, Cal.com) go through narrow port traits so action bodies never
//! see provider-specific quirks.
//!
//! Modules:
//! - actions: the action catalogue and the dispatcher façade
//! - db: SQLite store for leads, customers, tasks, scheduled sends
//! - providers: credential resolver, port traits, REST adapters
//! - schedule: deferred-send lifecycle and sweeper boundary
//! - normalize: email canonicalization and sender templating

pub mod actions;
pub mod db;
pub mod error;
pub mod normalize;
pub mod providers;
pub mod schedule;
pub mod types;

pub use actions::{catalogue, ActionName, Dispatcher};
pub use error::{ActionError, ErrorKind};
pub use types::{ActionResult, ActionSpec, CallerContext};
