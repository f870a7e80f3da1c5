use rusqlite::Connection;

use crate::error::ShiftError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cafes (
    id           INTEGER PRIMARY KEY,
    name         TEXT NOT NULL UNIQUE COLLATE NOCASE CHECK(length(trim(name)) > 0),
    address      TEXT NOT NULL,
    phone        TEXT,
    description  TEXT NOT NULL DEFAULT '',
    opening_time TEXT,
    closing_time TEXT,
    manager_id   INTEGER UNIQUE REFERENCES users(id),
    active       INTEGER NOT NULL DEFAULT 1,
    created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    updated_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS users (
    id                INTEGER PRIMARY KEY,
    telegram_id       INTEGER NOT NULL UNIQUE,
    display_name      TEXT NOT NULL,
    phone             TEXT UNIQUE,
    role              TEXT NOT NULL DEFAULT 'pending'
                      CHECK(role IN ('admin', 'manager', 'barista', 'pending')),
    cafe_id           INTEGER REFERENCES cafes(id),
    requested_cafe_id INTEGER REFERENCES cafes(id),
    active            INTEGER NOT NULL DEFAULT 1,
    created_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    updated_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    CHECK (role != 'pending' OR cafe_id IS NULL)
);

CREATE TABLE IF NOT EXISTS slots (
    id                INTEGER PRIMARY KEY,
    cafe_id           INTEGER NOT NULL REFERENCES cafes(id),
    start_time        TEXT NOT NULL,
    end_time          TEXT NOT NULL,
    required_capacity INTEGER NOT NULL DEFAULT 1 CHECK(required_capacity >= 1),
    created_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    updated_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    CHECK (start_time < end_time)
);

CREATE INDEX IF NOT EXISTS slots_by_cafe_start ON slots(cafe_id, start_time);

CREATE TABLE IF NOT EXISTS bookings (
    id          INTEGER PRIMARY KEY,
    barista_id  INTEGER NOT NULL REFERENCES users(id),
    slot_id     INTEGER NOT NULL REFERENCES slots(id),
    status      TEXT NOT NULL DEFAULT 'booked'
                CHECK(status IN ('booked', 'confirmed_work', 'completed', 'canceled', 'no_show')),
    reminded_at TEXT,
    created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    updated_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE UNIQUE INDEX IF NOT EXISTS bookings_one_active_per_slot
    ON bookings(barista_id, slot_id)
    WHERE status IN ('booked', 'confirmed_work');

CREATE INDEX IF NOT EXISTS bookings_by_slot ON bookings(slot_id, status);
CREATE INDEX IF NOT EXISTS bookings_by_barista ON bookings(barista_id, status);

CREATE TABLE IF NOT EXISTS notifications (
    id           INTEGER PRIMARY KEY,
    user_id      INTEGER NOT NULL REFERENCES users(id),
    kind         TEXT NOT NULL,
    payload      TEXT NOT NULL,
    created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    delivered_at TEXT,
    attempts     INTEGER NOT NULL DEFAULT 0,
    last_error   TEXT,
    claimed_until TEXT
);

CREATE INDEX IF NOT EXISTS notifications_pending ON notifications(delivered_at, id);
";

fn set_pragmas(conn: &Connection) -> Result<(), ShiftError> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

pub fn open(path: &str) -> Result<Connection, ShiftError> {
    let conn = Connection::open(path)?;
    set_pragmas(&conn)?;
    Ok(conn)
}

pub fn init(conn: &Connection) -> Result<(), ShiftError> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

pub fn open_memory() -> Result<Connection, ShiftError> {
    let conn = Connection::open_in_memory()?;
    set_pragmas(&conn)?;
    init(&conn)?;
    Ok(conn)
}

/// Run `body` inside a `BEGIN IMMEDIATE` transaction.
///
/// The write lock is taken before the first read, so every check made by
/// `body` still holds when it commits. A busy or locked store is retried once
/// at this boundary and otherwise reported as `StoreUnavailable`.
pub fn immediate<T>(
    conn: &Connection,
    mut body: impl FnMut(&Connection) -> Result<T, ShiftError>,
) -> Result<T, ShiftError> {
    match attempt(conn, &mut body) {
        Err(e) if e.is_transient() => {
            tracing::debug!(error = %e, "store busy, retrying transaction once");
            attempt(conn, &mut body)
        }
        other => other,
    }
}

fn attempt<T>(
    conn: &Connection,
    body: &mut impl FnMut(&Connection) -> Result<T, ShiftError>,
) -> Result<T, ShiftError> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match body(conn) {
        Ok(value) => match conn.execute_batch("COMMIT") {
            Ok(()) => Ok(value),
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e.into())
            }
        },
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}
