//! SQLite-based store for CRM records and scheduled sends.
//!
//! The store is the durable layer behind the local-mutation actions and the
//! scheduled-send lifecycle. Every read and write is scoped to the owning
//! `user_id`; the sweeper-facing operations (`claim_due_sends`,
//! `finalize_send`) are the only cross-user surface, since the sweeper
//! drains all users' due mail.

use std::path::PathBuf;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection};
use thiserror::Error;

use crate::types::{
    Customer, Lead, ScheduledSend, SendStatus, SentLogEntry, TaskItem, UserProfile,
};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory: {0}")]
    CreateDir(std::io::Error),
    #[error("{0}")]
    RowNotFound(String),
    #[error("malformed row: {0}")]
    Malformed(String),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS user_profiles (
    user_id      TEXT PRIMARY KEY,
    display_name TEXT,
    first_name   TEXT,
    last_name    TEXT,
    email        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS leads (
    id         TEXT PRIMARY KEY,
    user_id    TEXT NOT NULL,
    name       TEXT NOT NULL,
    email      TEXT NOT NULL,
    company    TEXT,
    phone      TEXT,
    status     TEXT NOT NULL DEFAULT 'new',
    notes      TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_leads_user ON leads(user_id, status);

CREATE TABLE IF NOT EXISTS customers (
    id         TEXT PRIMARY KEY,
    user_id    TEXT NOT NULL,
    name       TEXT NOT NULL,
    email      TEXT NOT NULL,
    company    TEXT,
    phone      TEXT,
    notes      TEXT,
    lead_id    TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_customers_user ON customers(user_id);

CREATE TABLE IF NOT EXISTS tasks (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL,
    title       TEXT NOT NULL,
    due_date    TEXT,
    status      TEXT NOT NULL DEFAULT 'pending',
    context     TEXT,
    source_type TEXT,
    source_id   TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id, status);
CREATE INDEX IF NOT EXISTS idx_tasks_source ON tasks(user_id, source_id);

CREATE TABLE IF NOT EXISTS scheduled_sends (
    id              TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL,
    recipients      TEXT NOT NULL,
    subject         TEXT NOT NULL,
    html            TEXT,
    text            TEXT,
    scheduled_for   TEXT NOT NULL,
    timezone        TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'pending',
    attempted_count INTEGER NOT NULL DEFAULT 0,
    sent_count      INTEGER NOT NULL DEFAULT 0,
    failed_count    INTEGER NOT NULL DEFAULT 0,
    last_error      TEXT,
    processed_at    TEXT,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sends_due ON scheduled_sends(status, scheduled_for);
CREATE INDEX IF NOT EXISTS idx_sends_user ON scheduled_sends(user_id);

CREATE TABLE IF NOT EXISTS sent_log (
    id                  TEXT PRIMARY KEY,
    user_id             TEXT NOT NULL,
    recipients          TEXT NOT NULL,
    subject             TEXT NOT NULL,
    provider_message_id TEXT NOT NULL,
    sent_at             TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sent_log_user ON sent_log(user_id);
";

/// UTC instants are stored as fixed-width `...Z` strings so that
/// lexicographic comparison in SQL matches chronological order.
pub(crate) fn ts(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn parse_ts(s: &str) -> Result<chrono::DateTime<chrono::Utc>, DbError> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| DbError::Malformed(format!("timestamp {s}: {e}")))
}

/// Column-level image of a `scheduled_sends` row, before JSON and timestamp
/// decoding.
struct RawSendRow {
    id: String,
    user_id: String,
    recipients_json: String,
    subject: String,
    html: Option<String>,
    text: Option<String>,
    scheduled_for: String,
    timezone: String,
    status: String,
    attempted_count: i64,
    sent_count: i64,
    failed_count: i64,
    last_error: Option<String>,
    processed_at: Option<String>,
    created_at: String,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store. Useful for testing.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Borrow the underlying connection for ad-hoc statements.
    pub fn conn_ref(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError>,
    {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&conn) {
            Ok(val) => {
                conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // User profiles
    // -----------------------------------------------------------------------

    pub fn upsert_profile(&self, profile: &UserProfile) -> Result<(), DbError> {
        self.conn.lock().execute(
            "INSERT INTO user_profiles (user_id, display_name, first_name, last_name, email)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
               display_name = excluded.display_name,
               first_name = excluded.first_name,
               last_name = excluded.last_name,
               email = excluded.email",
            params![
                profile.user_id,
                profile.display_name,
                profile.first_name,
                profile.last_name,
                profile.email
            ],
        )?;
        Ok(())
    }

    pub fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, display_name, first_name, last_name, email
             FROM user_profiles WHERE user_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![user_id], |row| {
            Ok(UserProfile {
                user_id: row.get(0)?,
                display_name: row.get(1)?,
                first_name: row.get(2)?,
                last_name: row.get(3)?,
                email: row.get(4)?,
            })
        })?;
        rows.next().transpose().map_err(DbError::from)
    }

    // -----------------------------------------------------------------------
    // Leads
    // -----------------------------------------------------------------------

    fn lead_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lead> {
        Ok(Lead {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            email: row.get(3)?,
            company: row.get(4)?,
            phone: row.get(5)?,
            status: row.get(6)?,
            notes: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    const LEAD_COLUMNS: &'static str =
        "id, user_id, name, email, company, phone, status, notes, created_at, updated_at";

    pub fn insert_lead(&self, lead: &Lead) -> Result<(), DbError> {
        self.conn.lock().execute(
            "INSERT INTO leads (id, user_id, name, email, company, phone, status, notes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                lead.id, lead.user_id, lead.name, lead.email, lead.company, lead.phone,
                lead.status, lead.notes, lead.created_at, lead.updated_at
            ],
        )?;
        Ok(())
    }

    pub fn get_lead(&self, user_id: &str, id: &str) -> Result<Option<Lead>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM leads WHERE user_id = ?1 AND id = ?2",
            Self::LEAD_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![user_id, id], Self::lead_from_row)?;
        rows.next().transpose().map_err(DbError::from)
    }

    pub fn list_leads(
        &self,
        user_id: &str,
        status: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Lead>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM leads
             WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC LIMIT ?3",
            Self::LEAD_COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id, status, limit as i64], Self::lead_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Substring search over lead name, email, and company.
    pub fn search_leads(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Lead>, DbError> {
        let pattern = format!("%{}%", query.trim());
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM leads
             WHERE user_id = ?1
               AND (name LIKE ?2 OR email LIKE ?2 OR company LIKE ?2)
             ORDER BY created_at DESC LIMIT ?3",
            Self::LEAD_COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id, pattern, limit as i64], Self::lead_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn count_leads(&self, user_id: &str, status: Option<&str>) -> Result<i64, DbError> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM leads WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2)",
            params![user_id, status],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn update_lead(&self, lead: &Lead) -> Result<(), DbError> {
        let changed = self.conn.lock().execute(
            "UPDATE leads SET name = ?3, email = ?4, company = ?5, phone = ?6,
                              status = ?7, notes = ?8, updated_at = ?9
             WHERE user_id = ?1 AND id = ?2",
            params![
                lead.user_id, lead.id, lead.name, lead.email, lead.company, lead.phone,
                lead.status, lead.notes, lead.updated_at
            ],
        )?;
        if changed == 0 {
            return Err(DbError::RowNotFound(format!("lead {}", lead.id)));
        }
        Ok(())
    }

    /// Mark a lead converted (the second write of the convert sequence).
    pub fn mark_lead_converted(
        &self,
        user_id: &str,
        id: &str,
        updated_at: &str,
    ) -> Result<(), DbError> {
        let changed = self.conn.lock().execute(
            "UPDATE leads SET status = ?3, updated_at = ?4 WHERE user_id = ?1 AND id = ?2",
            params![user_id, id, crate::types::LEAD_STATUS_CONVERTED, updated_at],
        )?;
        if changed == 0 {
            return Err(DbError::RowNotFound(format!("lead {id}")));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Customers
    // -----------------------------------------------------------------------

    fn customer_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Customer> {
        Ok(Customer {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            email: row.get(3)?,
            company: row.get(4)?,
            phone: row.get(5)?,
            notes: row.get(6)?,
            lead_id: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    const CUSTOMER_COLUMNS: &'static str =
        "id, user_id, name, email, company, phone, notes, lead_id, created_at, updated_at";

    pub fn insert_customer(&self, customer: &Customer) -> Result<(), DbError> {
        self.conn.lock().execute(
            "INSERT INTO customers (id, user_id, name, email, company, phone, notes, lead_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                customer.id, customer.user_id, customer.name, customer.email, customer.company,
                customer.phone, customer.notes, customer.lead_id, customer.created_at,
                customer.updated_at
            ],
        )?;
        Ok(())
    }

    pub fn get_customer(&self, user_id: &str, id: &str) -> Result<Option<Customer>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM customers WHERE user_id = ?1 AND id = ?2",
            Self::CUSTOMER_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![user_id, id], Self::customer_from_row)?;
        rows.next().transpose().map_err(DbError::from)
    }

    pub fn list_customers(&self, user_id: &str, limit: usize) -> Result<Vec<Customer>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM customers WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            Self::CUSTOMER_COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id, limit as i64], Self::customer_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn update_customer(&self, customer: &Customer) -> Result<(), DbError> {
        let changed = self.conn.lock().execute(
            "UPDATE customers SET name = ?3, email = ?4, company = ?5, phone = ?6,
                                  notes = ?7, updated_at = ?8
             WHERE user_id = ?1 AND id = ?2",
            params![
                customer.user_id, customer.id, customer.name, customer.email, customer.company,
                customer.phone, customer.notes, customer.updated_at
            ],
        )?;
        if changed == 0 {
            return Err(DbError::RowNotFound(format!("customer {}", customer.id)));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskItem> {
        Ok(TaskItem {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            due_date: row.get(3)?,
            status: row.get(4)?,
            context: row.get(5)?,
            source_type: row.get(6)?,
            source_id: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    const TASK_COLUMNS: &'static str =
        "id, user_id, title, due_date, status, context, source_type, source_id, created_at, updated_at";

    pub fn insert_task(&self, task: &TaskItem) -> Result<(), DbError> {
        self.conn.lock().execute(
            "INSERT INTO tasks (id, user_id, title, due_date, status, context, source_type, source_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                task.id, task.user_id, task.title, task.due_date, task.status, task.context,
                task.source_type, task.source_id, task.created_at, task.updated_at
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, user_id: &str, id: &str) -> Result<Option<TaskItem>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE user_id = ?1 AND id = ?2",
            Self::TASK_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![user_id, id], Self::task_from_row)?;
        rows.next().transpose().map_err(DbError::from)
    }

    pub fn list_tasks(
        &self,
        user_id: &str,
        status: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TaskItem>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks
             WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC LIMIT ?3",
            Self::TASK_COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id, status, limit as i64], Self::task_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn update_task(&self, task: &TaskItem) -> Result<(), DbError> {
        let changed = self.conn.lock().execute(
            "UPDATE tasks SET title = ?3, due_date = ?4, status = ?5, context = ?6, updated_at = ?7
             WHERE user_id = ?1 AND id = ?2",
            params![
                task.user_id, task.id, task.title, task.due_date, task.status, task.context,
                task.updated_at
            ],
        )?;
        if changed == 0 {
            return Err(DbError::RowNotFound(format!("task {}", task.id)));
        }
        Ok(())
    }

    /// Look up a synced task by its provider event id (booking dedup key).
    pub fn find_task_by_source(
        &self,
        user_id: &str,
        source_id: &str,
    ) -> Result<Option<TaskItem>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE user_id = ?1 AND source_id = ?2",
            Self::TASK_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![user_id, source_id], Self::task_from_row)?;
        rows.next().transpose().map_err(DbError::from)
    }

    // -----------------------------------------------------------------------
    // Scheduled sends
    // -----------------------------------------------------------------------

    fn send_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSendRow> {
        Ok(RawSendRow {
            id: row.get(0)?,
            user_id: row.get(1)?,
            recipients_json: row.get(2)?,
            subject: row.get(3)?,
            html: row.get(4)?,
            text: row.get(5)?,
            scheduled_for: row.get(6)?,
            timezone: row.get(7)?,
            status: row.get(8)?,
            attempted_count: row.get(9)?,
            sent_count: row.get(10)?,
            failed_count: row.get(11)?,
            last_error: row.get(12)?,
            processed_at: row.get(13)?,
            created_at: row.get(14)?,
        })
    }

    /// Decode the JSON/timestamp columns. Kept separate from the rusqlite
    /// row mapper so parse failures surface as `DbError::Malformed`.
    fn finish_send_row(raw: RawSendRow) -> Result<ScheduledSend, DbError> {
        let status = SendStatus::parse(&raw.status)
            .ok_or_else(|| DbError::Malformed(format!("send status {}", raw.status)))?;
        Ok(ScheduledSend {
            id: raw.id,
            user_id: raw.user_id,
            recipients: serde_json::from_str(&raw.recipients_json)
                .map_err(|e| DbError::Malformed(format!("recipients: {e}")))?,
            subject: raw.subject,
            html: raw.html,
            text: raw.text,
            scheduled_for: parse_ts(&raw.scheduled_for)?,
            timezone: raw.timezone,
            status,
            attempted_count: raw.attempted_count as u32,
            sent_count: raw.sent_count as u32,
            failed_count: raw.failed_count as u32,
            last_error: raw.last_error,
            processed_at: raw.processed_at.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&raw.created_at)?,
        })
    }

    const SEND_COLUMNS: &'static str = "id, user_id, recipients, subject, html, text, \
         scheduled_for, timezone, status, attempted_count, sent_count, failed_count, \
         last_error, processed_at, created_at";

    pub fn insert_scheduled_send(&self, send: &ScheduledSend) -> Result<(), DbError> {
        let recipients = serde_json::to_string(&send.recipients)
            .map_err(|e| DbError::Malformed(format!("recipients: {e}")))?;
        self.conn.lock().execute(
            "INSERT INTO scheduled_sends
               (id, user_id, recipients, subject, html, text, scheduled_for, timezone, status,
                attempted_count, sent_count, failed_count, last_error, processed_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                send.id,
                send.user_id,
                recipients,
                send.subject,
                send.html,
                send.text,
                ts(&send.scheduled_for),
                send.timezone,
                send.status.as_str(),
                send.attempted_count as i64,
                send.sent_count as i64,
                send.failed_count as i64,
                send.last_error,
                send.processed_at.as_ref().map(ts),
                ts(&send.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_scheduled_send(
        &self,
        user_id: &str,
        id: &str,
    ) -> Result<Option<ScheduledSend>, DbError> {
        let raw = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM scheduled_sends WHERE user_id = ?1 AND id = ?2",
                Self::SEND_COLUMNS
            ))?;
            let mut rows = stmt.query_map(params![user_id, id], Self::send_from_row)?;
            rows.next().transpose()?
        };
        raw.map(Self::finish_send_row).transpose()
    }

    pub fn list_scheduled_sends(
        &self,
        user_id: &str,
        status: Option<SendStatus>,
        limit: usize,
    ) -> Result<Vec<ScheduledSend>, DbError> {
        let raw = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM scheduled_sends
                 WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY scheduled_for ASC LIMIT ?3",
                Self::SEND_COLUMNS
            ))?;
            let rows = stmt.query_map(
                params![user_id, status.map(|s| s.as_str()), limit as i64],
                Self::send_from_row,
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        raw.into_iter().map(Self::finish_send_row).collect()
    }

    /// Unscoped lookup for the sweeper boundary, which drains all users'
    /// rows. Dispatcher-facing code uses [`Store::get_scheduled_send`].
    pub fn get_scheduled_send_any(&self, id: &str) -> Result<Option<ScheduledSend>, DbError> {
        let raw = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM scheduled_sends WHERE id = ?1",
                Self::SEND_COLUMNS
            ))?;
            let mut rows = stmt.query_map(params![id], Self::send_from_row)?;
            rows.next().transpose()?
        };
        raw.map(Self::finish_send_row).transpose()
    }

    /// Conditionally cancel a send while it is still pending or processing.
    /// Returns the number of rows transitioned (0 or 1).
    pub fn cancel_scheduled_send(&self, user_id: &str, id: &str) -> Result<usize, DbError> {
        let changed = self.conn.lock().execute(
            "UPDATE scheduled_sends SET status = 'cancelled'
             WHERE user_id = ?1 AND id = ?2 AND status IN ('pending', 'processing')",
            params![user_id, id],
        )?;
        Ok(changed)
    }

    /// Sweeper boundary: atomically claim due pending sends, transitioning
    /// them to `processing`. Cross-user on purpose.
    pub fn claim_due_sends(
        &self,
        now: &chrono::DateTime<chrono::Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledSend>, DbError> {
        let raw = self.with_transaction(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM scheduled_sends
                 WHERE status = 'pending' AND scheduled_for <= ?1
                 ORDER BY scheduled_for ASC LIMIT ?2",
                Self::SEND_COLUMNS
            ))?;
            let rows = stmt.query_map(params![ts(now), limit as i64], Self::send_from_row)?;
            let claimed = rows.collect::<Result<Vec<_>, _>>()?;
            for row in &claimed {
                conn.execute(
                    "UPDATE scheduled_sends SET status = 'processing' WHERE id = ?1",
                    params![row.id],
                )?;
            }
            Ok(claimed)
        })?;
        raw.into_iter()
            .map(|row| {
                Self::finish_send_row(row).map(|mut send| {
                    send.status = SendStatus::Processing;
                    send
                })
            })
            .collect()
    }

    /// Sweeper boundary: record per-recipient counts and finalize a
    /// processing row to its terminal status.
    pub fn finalize_send(
        &self,
        id: &str,
        status: SendStatus,
        attempted: u32,
        sent: u32,
        failed: u32,
        last_error: Option<&str>,
        processed_at: &chrono::DateTime<chrono::Utc>,
    ) -> Result<(), DbError> {
        let changed = self.conn.lock().execute(
            "UPDATE scheduled_sends
             SET status = ?2, attempted_count = ?3, sent_count = ?4, failed_count = ?5,
                 last_error = ?6, processed_at = ?7
             WHERE id = ?1 AND status = 'processing'",
            params![
                id,
                status.as_str(),
                attempted as i64,
                sent as i64,
                failed as i64,
                last_error,
                ts(processed_at)
            ],
        )?;
        if changed == 0 {
            return Err(DbError::RowNotFound(format!("processing send {id}")));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sent log
    // -----------------------------------------------------------------------

    pub fn append_sent_log(&self, entry: &SentLogEntry) -> Result<(), DbError> {
        let recipients = serde_json::to_string(&entry.recipients)
            .map_err(|e| DbError::Malformed(format!("recipients: {e}")))?;
        self.conn.lock().execute(
            "INSERT INTO sent_log (id, user_id, recipients, subject, provider_message_id, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.id,
                entry.user_id,
                recipients,
                entry.subject,
                entry.provider_message_id,
                entry.sent_at
            ],
        )?;
        Ok(())
    }

    pub fn list_sent_log(&self, user_id: &str, limit: usize) -> Result<Vec<SentLogEntry>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, recipients, subject, provider_message_id, sent_at
             FROM sent_log WHERE user_id = ?1 ORDER BY sent_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (id, user_id, recipients_json, subject, provider_message_id, sent_at) = row?;
            entries.push(SentLogEntry {
                id,
                user_id,
                recipients: serde_json::from_str(&recipients_json)
                    .map_err(|e| DbError::Malformed(format!("recipients: {e}")))?,
                subject,
                provider_message_id,
                sent_at,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn lead(user: &str, id: &str, email: &str) -> Lead {
        Lead {
            id: id.into(),
            user_id: user.into(),
            name: "Jane Doe".into(),
            email: email.into(),
            company: Some("Acme".into()),
            phone: None,
            status: "new".into(),
            notes: None,
            created_at: "2026-08-06T10:00:00Z".into(),
            updated_at: "2026-08-06T10:00:00Z".into(),
        }
    }

    fn send(user: &str, id: &str, status: SendStatus) -> ScheduledSend {
        ScheduledSend {
            id: id.into(),
            user_id: user.into(),
            recipients: vec!["jane@example.com".into()],
            subject: "Hello".into(),
            html: None,
            text: Some("hi".into()),
            scheduled_for: Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).unwrap(),
            timezone: "America/New_York".into(),
            status,
            attempted_count: 0,
            sent_count: 0,
            failed_count: 0,
            last_error: None,
            processed_at: None,
            created_at: Utc.with_ymd_and_hms(2026, 8, 6, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_open_at_creates_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open_at(dir.path().join("nested").join("crm.db")).unwrap();
        store.insert_lead(&lead("u1", "l1", "a@b.co")).unwrap();
        assert!(dir.path().join("nested").join("crm.db").exists());
    }

    #[test]
    fn test_lead_lookups_are_user_scoped() {
        let store = Store::open_in_memory().unwrap();
        store.insert_lead(&lead("u1", "l1", "a@b.co")).unwrap();

        assert!(store.get_lead("u1", "l1").unwrap().is_some());
        assert!(store.get_lead("u2", "l1").unwrap().is_none());
        assert_eq!(store.list_leads("u2", None, 50).unwrap().len(), 0);
        assert_eq!(store.count_leads("u1", None).unwrap(), 1);
        assert_eq!(store.count_leads("u1", Some("lost")).unwrap(), 0);
    }

    #[test]
    fn test_update_missing_lead_is_row_not_found() {
        let store = Store::open_in_memory().unwrap();
        let err = store.update_lead(&lead("u1", "ghost", "a@b.co")).unwrap_err();
        assert!(matches!(err, DbError::RowNotFound(_)));
    }

    #[test]
    fn test_scheduled_send_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_scheduled_send(&send("u1", "s1", SendStatus::Pending))
            .unwrap();

        let loaded = store.get_scheduled_send("u1", "s1").unwrap().unwrap();
        assert_eq!(loaded.recipients, vec!["jane@example.com"]);
        assert_eq!(loaded.status, SendStatus::Pending);
        assert_eq!(
            loaded.scheduled_for,
            Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).unwrap()
        );
        assert!(loaded.processed_at.is_none());

        // scoped to owner
        assert!(store.get_scheduled_send("u2", "s1").unwrap().is_none());
    }

    #[test]
    fn test_cancel_is_conditional_on_status() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_scheduled_send(&send("u1", "s1", SendStatus::Pending))
            .unwrap();
        store
            .insert_scheduled_send(&send("u1", "s2", SendStatus::Sent))
            .unwrap();

        assert_eq!(store.cancel_scheduled_send("u1", "s1").unwrap(), 1);
        assert_eq!(store.cancel_scheduled_send("u1", "s1").unwrap(), 0); // already cancelled
        assert_eq!(store.cancel_scheduled_send("u1", "s2").unwrap(), 0); // terminal
    }

    #[test]
    fn test_claim_due_sends_transitions_and_filters() {
        let store = Store::open_in_memory().unwrap();
        let mut due = send("u1", "due", SendStatus::Pending);
        due.scheduled_for = Utc.with_ymd_and_hms(2026, 8, 6, 11, 0, 0).unwrap();
        let mut future = send("u2", "future", SendStatus::Pending);
        future.scheduled_for = Utc.with_ymd_and_hms(2026, 8, 6, 18, 0, 0).unwrap();
        store.insert_scheduled_send(&due).unwrap();
        store.insert_scheduled_send(&future).unwrap();

        let now = Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).unwrap();
        let claimed = store.claim_due_sends(&now, 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, "due");
        assert_eq!(claimed[0].status, SendStatus::Processing);

        // A second claim finds nothing — the row left pending.
        assert!(store.claim_due_sends(&now, 10).unwrap().is_empty());
        let row = store.get_scheduled_send("u1", "due").unwrap().unwrap();
        assert_eq!(row.status, SendStatus::Processing);
    }

    #[test]
    fn test_finalize_requires_processing() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_scheduled_send(&send("u1", "s1", SendStatus::Pending))
            .unwrap();
        let now = Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).unwrap();

        let err = store
            .finalize_send("s1", SendStatus::Sent, 1, 1, 0, None, &now)
            .unwrap_err();
        assert!(matches!(err, DbError::RowNotFound(_)));

        store.claim_due_sends(&now, 10).unwrap();
        store
            .finalize_send("s1", SendStatus::Partial, 2, 1, 1, Some("bounce"), &now)
            .unwrap();
        let row = store.get_scheduled_send("u1", "s1").unwrap().unwrap();
        assert_eq!(row.status, SendStatus::Partial);
        assert_eq!(row.attempted_count, 2);
        assert_eq!(row.sent_count, 1);
        assert_eq!(row.failed_count, 1);
        assert_eq!(row.last_error.as_deref(), Some("bounce"));
        assert!(row.processed_at.is_some());
    }

    #[test]
    fn test_task_source_dedup_lookup() {
        let store = Store::open_in_memory().unwrap();
        let task = TaskItem {
            id: "t1".into(),
            user_id: "u1".into(),
            title: "Booking: Intro call".into(),
            due_date: Some("2026-08-10".into()),
            status: "pending".into(),
            context: None,
            source_type: Some("booking".into()),
            source_id: Some("evt_123".into()),
            created_at: "2026-08-06T10:00:00Z".into(),
            updated_at: "2026-08-06T10:00:00Z".into(),
        };
        store.insert_task(&task).unwrap();
        assert!(store.find_task_by_source("u1", "evt_123").unwrap().is_some());
        assert!(store.find_task_by_source("u1", "evt_999").unwrap().is_none());
        assert!(store.find_task_by_source("u2", "evt_123").unwrap().is_none());
    }

    #[test]
    fn test_sent_log_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store
            .append_sent_log(&SentLogEntry {
                id: "log1".into(),
                user_id: "u1".into(),
                recipients: vec!["a@b.co".into(), "c@d.co".into()],
                subject: "Update".into(),
                provider_message_id: "msg_1".into(),
                sent_at: "2026-08-06T10:00:00Z".into(),
            })
            .unwrap();
        let entries = store.list_sent_log("u1", 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].recipients.len(), 2);
        assert!(store.list_sent_log("u2", 10).unwrap().is_empty());
    }
}
