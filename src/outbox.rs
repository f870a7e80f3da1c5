//! Notification outbox.
//!
//! State-changing operations write notifications into the `notifications`
//! table inside their own transaction. [`flush`] delivers them after commit;
//! a failed delivery is logged and left pending, never undoing the change
//! that produced it.
//!
//! Several processes may flush the same database. Each row is claimed with a
//! short lease before it is handed to the dispatcher, so only one of them
//! delivers it.

use std::fmt;

use chrono::TimeDelta;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use crate::error::ShiftError;

/// Deliveries are given up after this many failed attempts.
pub const MAX_ATTEMPTS: i64 = 5;

/// How long a claimed row stays out of other flushes. A flusher that dies
/// mid-delivery leaves the row to be retried after this.
const CLAIM_LEASE: &str = "+60 seconds";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    BookingCreated,
    BookingCanceled,
    LateCancellation,
    BookingConfirmed,
    BookingCompleted,
    NoShow,
    ShiftReminder,
    SlotChanged,
    RegistrationSubmitted,
    RegistrationApproved,
    RegistrationRejected,
    AffiliationChanged,
    AccountStatusChanged,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BookingCreated => "booking_created",
            Self::BookingCanceled => "booking_canceled",
            Self::LateCancellation => "late_cancellation",
            Self::BookingConfirmed => "booking_confirmed",
            Self::BookingCompleted => "booking_completed",
            Self::NoShow => "no_show",
            Self::ShiftReminder => "shift_reminder",
            Self::SlotChanged => "slot_changed",
            Self::RegistrationSubmitted => "registration_submitted",
            Self::RegistrationApproved => "registration_approved",
            Self::RegistrationRejected => "registration_rejected",
            Self::AffiliationChanged => "affiliation_changed",
            Self::AccountStatusChanged => "account_status_changed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ShiftError> {
        const ALL: [MessageKind; 13] = [
            MessageKind::BookingCreated,
            MessageKind::BookingCanceled,
            MessageKind::LateCancellation,
            MessageKind::BookingConfirmed,
            MessageKind::BookingCompleted,
            MessageKind::NoShow,
            MessageKind::ShiftReminder,
            MessageKind::SlotChanged,
            MessageKind::RegistrationSubmitted,
            MessageKind::RegistrationApproved,
            MessageKind::RegistrationRejected,
            MessageKind::AffiliationChanged,
            MessageKind::AccountStatusChanged,
        ];
        ALL.into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ShiftError::InvalidInput(format!("unknown message kind '{s}'")))
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromSql for MessageKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        MessageKind::parse(s).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    pub kind: MessageKind,
    pub payload: Value,
    pub created_at: String,
    pub delivered_at: Option<String>,
    pub attempts: i64,
    pub last_error: Option<String>,
}

/// Delivery channel towards chat users. Implementations must not assume
/// the caller waits for, or retries on, their result.
pub trait Dispatcher {
    fn notify(&self, user_id: i64, kind: MessageKind, payload: &Value) -> anyhow::Result<()>;
}

/// Dispatcher that only records deliveries in the log, optionally echoing
/// each one as a JSON line on stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher {
    pub echo_json: bool,
}

impl Dispatcher for LogDispatcher {
    fn notify(&self, user_id: i64, kind: MessageKind, payload: &Value) -> anyhow::Result<()> {
        tracing::info!(user_id, kind = %kind, %payload, "notification");
        if self.echo_json {
            let line = serde_json::json!({ "user_id": user_id, "kind": kind, "payload": payload });
            println!("{line}");
        }
        Ok(())
    }
}

pub fn enqueue(
    conn: &Connection,
    user_id: i64,
    kind: MessageKind,
    payload: Value,
) -> Result<(), ShiftError> {
    conn.execute(
        "INSERT INTO notifications (user_id, kind, payload) VALUES (?1, ?2, ?3)",
        rusqlite::params![user_id, kind.as_str(), payload],
    )?;
    Ok(())
}

/// Notify the manager of a cafe, or every active admin when it has none.
pub fn enqueue_for_cafe_staff(
    conn: &Connection,
    cafe_id: i64,
    kind: MessageKind,
    payload: Value,
) -> Result<(), ShiftError> {
    let manager: Option<i64> = conn
        .query_row(
            "SELECT u.id FROM cafes c JOIN users u ON u.id = c.manager_id
             WHERE c.id = ?1 AND u.active = 1",
            [cafe_id],
            |row| row.get(0),
        )
        .optional()?;
    let recipients = match manager {
        Some(id) => vec![id],
        None => {
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM users WHERE role = 'admin' AND active = 1 ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<i64>>>()?
        }
    };
    for user_id in recipients {
        enqueue(conn, user_id, kind, payload.clone())?;
    }
    Ok(())
}

fn read_notification(row: &rusqlite::Row) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: row.get(2)?,
        payload: row.get(3)?,
        created_at: row.get(4)?,
        delivered_at: row.get(5)?,
        attempts: row.get(6)?,
        last_error: row.get(7)?,
    })
}

const NOTIFICATION_COLUMNS: &str =
    "id, user_id, kind, payload, created_at, delivered_at, attempts, last_error";

/// List notifications, oldest first.
pub fn list(conn: &Connection, pending_only: bool) -> Result<Vec<Notification>, ShiftError> {
    let filter = if pending_only {
        "WHERE delivered_at IS NULL"
    } else {
        ""
    };
    let query = format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications {filter} ORDER BY id");
    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map([], read_notification)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Into::into)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Undelivered rows with attempts left that nobody is delivering right now.
fn deliverable(conn: &Connection) -> Result<Vec<Notification>, ShiftError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {NOTIFICATION_COLUMNS} FROM notifications
         WHERE delivered_at IS NULL AND attempts < ?1
           AND (claimed_until IS NULL OR claimed_until <= strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
         ORDER BY id"
    ))?;
    let rows = stmt.query_map([MAX_ATTEMPTS], read_notification)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Into::into)
}

/// Take a row for delivery. Returns false if another flush got there first.
fn claim(conn: &Connection, n: &Notification) -> Result<bool, ShiftError> {
    let changed = conn.execute(
        "UPDATE notifications
         SET attempts = attempts + 1,
             claimed_until = strftime('%Y-%m-%dT%H:%M:%SZ', 'now', ?3)
         WHERE id = ?1 AND delivered_at IS NULL AND attempts = ?2
           AND (claimed_until IS NULL OR claimed_until <= strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))",
        rusqlite::params![n.id, n.attempts, CLAIM_LEASE],
    )?;
    Ok(changed == 1)
}

/// Deliver pending notifications through `dispatcher`.
pub fn flush(conn: &Connection, dispatcher: &dyn Dispatcher) -> Result<FlushReport, ShiftError> {
    let mut report = FlushReport::default();
    for n in deliverable(conn)? {
        if !claim(conn, &n)? {
            tracing::debug!(notification = n.id, "claimed by another flush");
            continue;
        }
        match dispatcher.notify(n.user_id, n.kind, &n.payload) {
            Ok(()) => {
                conn.execute(
                    "UPDATE notifications
                     SET delivered_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now'),
                         claimed_until = NULL, last_error = NULL
                     WHERE id = ?1",
                    [n.id],
                )?;
                report.delivered += 1;
            }
            Err(e) => {
                tracing::warn!(
                    notification = n.id,
                    user_id = n.user_id,
                    kind = %n.kind,
                    attempt = n.attempts + 1,
                    error = %e,
                    "notification delivery failed"
                );
                conn.execute(
                    "UPDATE notifications SET claimed_until = NULL, last_error = ?2 WHERE id = ?1",
                    rusqlite::params![n.id, format!("{e:#}")],
                )?;
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

/// Delete delivered rows, and rows that ran out of attempts, older than
/// `keep`. Rows still waiting for delivery are never pruned.
pub fn prune(conn: &Connection, keep: TimeDelta) -> Result<usize, ShiftError> {
    let cutoff = format!("-{} seconds", keep.num_seconds().max(0));
    let removed = conn.execute(
        "DELETE FROM notifications
         WHERE created_at < strftime('%Y-%m-%dT%H:%M:%SZ', 'now', ?1)
           AND (delivered_at IS NOT NULL OR attempts >= ?2)",
        rusqlite::params![cutoff, MAX_ATTEMPTS],
    )?;
    tracing::info!(removed, "outbox pruned");
    Ok(removed)
}
