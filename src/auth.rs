//! Capability gate evaluated once at the entry of every core operation.

use rusqlite::{Connection, OptionalExtension};

use crate::error::ShiftError;
use crate::model::Role;

/// The calling user, resolved from the store inside the operation's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: i64,
    pub role: Role,
    pub cafe_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Claim and confirm shifts: an active barista.
    BookShifts,
    /// Create slots and review a cafe: its manager or an admin.
    ManageCafe(i64),
    /// Cafe and account administration.
    Administer,
    /// Cancel or release a booking: its owner, the cafe's manager, or an admin.
    ActOnBooking { owner: i64, cafe_id: i64 },
}

/// Resolve an active user into an [`Actor`].
pub fn resolve(conn: &Connection, user_id: i64) -> Result<Actor, ShiftError> {
    let row: Option<(Role, Option<i64>, bool)> = conn
        .query_row(
            "SELECT role, cafe_id, active FROM users WHERE id = ?1",
            [user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    match row {
        None => Err(ShiftError::not_found("user", user_id)),
        Some((_, _, false)) => Err(ShiftError::Forbidden(format!(
            "user {user_id} is deactivated"
        ))),
        Some((role, cafe_id, true)) => Ok(Actor {
            user_id,
            role,
            cafe_id,
        }),
    }
}

/// Whether the actor is the manager recorded on the cafe.
pub fn manages(conn: &Connection, actor: &Actor, cafe_id: i64) -> Result<bool, ShiftError> {
    if actor.role != Role::Manager {
        return Ok(false);
    }
    let manager: Option<Option<i64>> = conn
        .query_row(
            "SELECT manager_id FROM cafes WHERE id = ?1",
            [cafe_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(manager.flatten() == Some(actor.user_id))
}

pub fn require(conn: &Connection, actor: &Actor, capability: Capability) -> Result<(), ShiftError> {
    let allowed = match capability {
        Capability::BookShifts => actor.role == Role::Barista,
        Capability::Administer => actor.role == Role::Admin,
        Capability::ManageCafe(cafe_id) => {
            actor.role == Role::Admin || manages(conn, actor, cafe_id)?
        }
        Capability::ActOnBooking { owner, cafe_id } => {
            actor.user_id == owner || actor.role == Role::Admin || manages(conn, actor, cafe_id)?
        }
    };
    if allowed {
        Ok(())
    } else {
        Err(ShiftError::Forbidden(describe_denial(actor, capability)))
    }
}

fn describe_denial(actor: &Actor, capability: Capability) -> String {
    let who = format!("user {} ({})", actor.user_id, actor.role);
    match capability {
        Capability::BookShifts => format!("{who} is not an approved barista"),
        Capability::Administer => format!("{who} is not an administrator"),
        Capability::ManageCafe(cafe_id) => format!("{who} does not manage cafe {cafe_id}"),
        Capability::ActOnBooking { .. } => format!("{who} may not act on this booking"),
    }
}
