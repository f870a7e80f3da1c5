//! Cafes and user accounts: registration, approval, affiliation changes.
//!
//! Cafe -> manager and user -> cafe are kept as two one-way pointers and are
//! always rewritten together inside one transaction.

use chrono::{NaiveDateTime, NaiveTime};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;

use crate::allocation;
use crate::auth::{self, Actor, Capability};
use crate::config::BootstrapConfig;
use crate::db;
use crate::error::ShiftError;
use crate::lifecycle;
use crate::model::{Cafe, Role, Slot, User};
use crate::outbox::{self, MessageKind};
use crate::validate::{check_opening_hours, validate_name, validate_phone};

const CAFE_COLUMNS: &str = "id, name, address, phone, description, opening_time, closing_time, \
                            manager_id, active, created_at";

const USER_COLUMNS: &str =
    "id, telegram_id, display_name, phone, role, cafe_id, requested_cafe_id, active, created_at";

fn read_cafe(row: &rusqlite::Row) -> rusqlite::Result<Cafe> {
    Ok(Cafe {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        phone: row.get(3)?,
        description: row.get(4)?,
        opening_time: row.get(5)?,
        closing_time: row.get(6)?,
        manager_id: row.get(7)?,
        active: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn read_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        telegram_id: row.get(1)?,
        display_name: row.get(2)?,
        phone: row.get(3)?,
        role: row.get(4)?,
        cafe_id: row.get(5)?,
        requested_cafe_id: row.get(6)?,
        active: row.get(7)?,
        created_at: row.get(8)?,
    })
}

pub fn get_cafe(conn: &Connection, cafe_id: i64) -> Result<Cafe, ShiftError> {
    conn.query_row(
        &format!("SELECT {CAFE_COLUMNS} FROM cafes WHERE id = ?1"),
        [cafe_id],
        read_cafe,
    )
    .optional()?
    .ok_or_else(|| ShiftError::not_found("cafe", cafe_id))
}

/// Case-insensitive lookup by name.
pub fn find_cafe_by_name(conn: &Connection, name: &str) -> Result<Option<Cafe>, ShiftError> {
    Ok(conn
        .query_row(
            &format!("SELECT {CAFE_COLUMNS} FROM cafes WHERE name = ?1 COLLATE NOCASE"),
            [name.trim()],
            read_cafe,
        )
        .optional()?)
}

pub fn list_cafes(conn: &Connection, include_inactive: bool) -> Result<Vec<Cafe>, ShiftError> {
    let filter = if include_inactive { "" } else { "WHERE active = 1" };
    let mut stmt = conn.prepare(&format!(
        "SELECT {CAFE_COLUMNS} FROM cafes {filter} ORDER BY name COLLATE NOCASE"
    ))?;
    let rows = stmt.query_map([], read_cafe)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Into::into)
}

pub fn get_user(conn: &Connection, user_id: i64) -> Result<User, ShiftError> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        [user_id],
        read_user,
    )
    .optional()?
    .ok_or_else(|| ShiftError::not_found("user", user_id))
}

pub fn find_user_by_telegram(
    conn: &Connection,
    telegram_id: i64,
) -> Result<Option<User>, ShiftError> {
    Ok(conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE telegram_id = ?1"),
            [telegram_id],
            read_user,
        )
        .optional()?)
}

fn query_users(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<User>, ShiftError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {USER_COLUMNS} FROM users {filter} ORDER BY display_name COLLATE NOCASE, id"
    ))?;
    let rows = stmt.query_map(params, read_user)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Into::into)
}

/// Admins see every account; a manager sees the staff of their cafe and
/// anyone asking to join it.
pub fn list_users(conn: &Connection, actor_id: i64) -> Result<Vec<User>, ShiftError> {
    let actor = auth::resolve(conn, actor_id)?;
    match actor.role {
        Role::Admin => query_users(conn, "", []),
        Role::Manager => {
            let cafe_id = managed_cafe(conn, &actor)?;
            query_users(
                conn,
                "WHERE cafe_id = ?1 OR requested_cafe_id = ?1",
                [cafe_id],
            )
        }
        _ => Err(ShiftError::Forbidden(format!(
            "user {actor_id} ({}) may not list users",
            actor.role
        ))),
    }
}

/// Registrations waiting for a decision the actor is allowed to make.
pub fn pending_registrations(conn: &Connection, actor_id: i64) -> Result<Vec<User>, ShiftError> {
    let actor = auth::resolve(conn, actor_id)?;
    match actor.role {
        Role::Admin => query_users(
            conn,
            "WHERE role = 'pending' AND active = 1 AND requested_cafe_id IS NOT NULL",
            [],
        ),
        Role::Manager => {
            let cafe_id = managed_cafe(conn, &actor)?;
            query_users(
                conn,
                "WHERE role = 'pending' AND active = 1 AND requested_cafe_id = ?1",
                [cafe_id],
            )
        }
        _ => Err(ShiftError::Forbidden(format!(
            "user {actor_id} ({}) may not review registrations",
            actor.role
        ))),
    }
}

fn managed_cafe(conn: &Connection, actor: &Actor) -> Result<i64, ShiftError> {
    match actor.cafe_id {
        Some(cafe_id) if auth::manages(conn, actor, cafe_id)? => Ok(cafe_id),
        _ => Err(ShiftError::Forbidden(format!(
            "user {} does not manage any cafe",
            actor.user_id
        ))),
    }
}

fn manager_of(conn: &Connection, cafe_id: i64) -> Result<Option<i64>, ShiftError> {
    let manager: Option<Option<i64>> = conn
        .query_row(
            "SELECT manager_id FROM cafes WHERE id = ?1",
            [cafe_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(manager.flatten())
}

fn active_cafe(conn: &Connection, cafe_id: i64) -> Result<Cafe, ShiftError> {
    let cafe = get_cafe(conn, cafe_id)?;
    if !cafe.active {
        return Err(ShiftError::InvalidInput(format!(
            "cafe '{}' is deactivated",
            cafe.name
        )));
    }
    Ok(cafe)
}

fn check_phone_free(conn: &Connection, phone: &str, user_id: Option<i64>) -> Result<(), ShiftError> {
    validate_phone(phone)?;
    let taken: Option<i64> = conn
        .query_row(
            "SELECT id FROM users WHERE phone = ?1 AND id IS NOT ?2",
            rusqlite::params![phone, user_id],
            |row| row.get(0),
        )
        .optional()?;
    if taken.is_some() {
        return Err(ShiftError::Duplicate(format!("phone {phone}")));
    }
    Ok(())
}

/// Get or create the account behind a telegram identity.
///
/// New identities start as `pending` unless the bootstrap allow-lists name
/// them: admins become `admin`, and a listed manager becomes `manager` of
/// their cafe if it exists and has nobody in charge.
pub fn bootstrap_user(
    conn: &Connection,
    seeds: &BootstrapConfig,
    telegram_id: i64,
    display_name: &str,
) -> Result<User, ShiftError> {
    db::immediate(conn, |conn| {
        if let Some(user) = find_user_by_telegram(conn, telegram_id)? {
            return Ok(user);
        }
        validate_name("display name", display_name)?;

        let mut role = Role::Pending;
        let mut cafe_id = None;
        if seeds.admins.contains(&telegram_id) {
            role = Role::Admin;
        } else if let Some(seed) = seeds.managers.iter().find(|m| m.telegram_id == telegram_id) {
            match find_cafe_by_name(conn, &seed.cafe)? {
                Some(cafe) if cafe.active && cafe.manager_id.is_none() => {
                    role = Role::Manager;
                    cafe_id = Some(cafe.id);
                }
                _ => tracing::warn!(
                    telegram_id,
                    cafe = %seed.cafe,
                    "listed manager's cafe is missing or already managed; starting as pending"
                ),
            }
        }

        conn.execute(
            "INSERT INTO users (telegram_id, display_name, role, cafe_id) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![telegram_id, display_name.trim(), role, cafe_id],
        )?;
        let user_id = conn.last_insert_rowid();
        if let Some(cafe_id) = cafe_id {
            conn.execute(
                "UPDATE cafes SET manager_id = ?1 WHERE id = ?2",
                [user_id, cafe_id],
            )?;
        }
        tracing::info!(user = user_id, telegram_id, role = %role, "new user");
        get_user(conn, user_id)
    })
}

/// A pending user asks to join a cafe as a barista.
pub fn submit_registration(
    conn: &Connection,
    user_id: i64,
    display_name: &str,
    phone: Option<&str>,
    requested_cafe: i64,
) -> Result<User, ShiftError> {
    let user = db::immediate(conn, |conn| {
        let actor = auth::resolve(conn, user_id)?;
        if actor.role != Role::Pending {
            return Err(ShiftError::InvalidTransition(format!(
                "user {user_id} is already registered as {}",
                actor.role
            )));
        }
        validate_name("display name", display_name)?;
        if let Some(phone) = phone {
            check_phone_free(conn, phone, Some(user_id))?;
        }
        let cafe = get_cafe(conn, requested_cafe)?;
        if !cafe.active {
            return Err(ShiftError::not_found("cafe", requested_cafe));
        }
        conn.execute(
            "UPDATE users SET display_name = ?2, phone = ?3, requested_cafe_id = ?4,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
             WHERE id = ?1",
            rusqlite::params![user_id, display_name.trim(), phone, requested_cafe],
        )?;
        outbox::enqueue_for_cafe_staff(
            conn,
            requested_cafe,
            MessageKind::RegistrationSubmitted,
            json!({ "user": user_id, "name": display_name.trim(), "phone": phone, "cafe": cafe.name }),
        )?;
        get_user(conn, user_id)
    })?;
    tracing::info!(user = user_id, cafe = requested_cafe, "registration submitted");
    Ok(user)
}

fn pending_target(conn: &Connection, user_id: i64) -> Result<User, ShiftError> {
    let user = get_user(conn, user_id)?;
    if user.role != Role::Pending || !user.active {
        return Err(ShiftError::InvalidTransition(format!(
            "user {user_id} has no pending registration"
        )));
    }
    Ok(user)
}

pub fn approve_registration(
    conn: &Connection,
    actor_id: i64,
    user_id: i64,
) -> Result<User, ShiftError> {
    let user = db::immediate(conn, |conn| {
        let actor = auth::resolve(conn, actor_id)?;
        let target = pending_target(conn, user_id)?;
        let Some(cafe_id) = target.requested_cafe_id else {
            return Err(ShiftError::InvalidTransition(format!(
                "user {user_id} has not asked to join a cafe"
            )));
        };
        auth::require(conn, &actor, Capability::ManageCafe(cafe_id))?;
        let cafe = active_cafe(conn, cafe_id)?;
        conn.execute(
            "UPDATE users SET role = 'barista', cafe_id = ?2, requested_cafe_id = NULL,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
             WHERE id = ?1",
            [user_id, cafe_id],
        )?;
        outbox::enqueue(
            conn,
            user_id,
            MessageKind::RegistrationApproved,
            json!({ "cafe": cafe.name }),
        )?;
        get_user(conn, user_id)
    })?;
    tracing::info!(user = user_id, approved_by = actor_id, "registration approved");
    Ok(user)
}

/// Reject a registration; the account is deactivated.
pub fn reject_registration(
    conn: &Connection,
    actor_id: i64,
    user_id: i64,
) -> Result<User, ShiftError> {
    let user = db::immediate(conn, |conn| {
        let actor = auth::resolve(conn, actor_id)?;
        let target = pending_target(conn, user_id)?;
        let capability = match target.requested_cafe_id {
            Some(cafe_id) => Capability::ManageCafe(cafe_id),
            None => Capability::Administer,
        };
        auth::require(conn, &actor, capability)?;
        conn.execute(
            "UPDATE users SET active = 0, requested_cafe_id = NULL,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
             WHERE id = ?1",
            [user_id],
        )?;
        outbox::enqueue(conn, user_id, MessageKind::RegistrationRejected, json!({}))?;
        get_user(conn, user_id)
    })?;
    tracing::info!(user = user_id, rejected_by = actor_id, "registration rejected");
    Ok(user)
}

fn check_hours(opening: Option<NaiveTime>, closing: Option<NaiveTime>) -> Result<(), ShiftError> {
    match (opening, closing) {
        (Some(open), Some(close)) if open == close => Err(ShiftError::InvalidInput(
            "opening and closing time must differ".into(),
        )),
        (Some(_), None) | (None, Some(_)) => Err(ShiftError::InvalidInput(
            "opening and closing time must be given together".into(),
        )),
        _ => Ok(()),
    }
}

/// Fields of a cafe being created.
#[derive(Debug, Clone, Default)]
pub struct NewCafe<'a> {
    pub name: &'a str,
    pub address: &'a str,
    pub phone: Option<&'a str>,
    pub description: &'a str,
    pub opening_time: Option<NaiveTime>,
    pub closing_time: Option<NaiveTime>,
}

pub fn create_cafe(conn: &Connection, actor_id: i64, new: &NewCafe) -> Result<Cafe, ShiftError> {
    let cafe = db::immediate(conn, |conn| {
        let actor = auth::resolve(conn, actor_id)?;
        auth::require(conn, &actor, Capability::Administer)?;
        validate_name("cafe name", new.name)?;
        validate_name("cafe address", new.address)?;
        if let Some(phone) = new.phone {
            validate_phone(phone)?;
        }
        check_hours(new.opening_time, new.closing_time)?;
        if find_cafe_by_name(conn, new.name)?.is_some() {
            return Err(ShiftError::Duplicate(format!("cafe '{}'", new.name.trim())));
        }
        conn.execute(
            "INSERT INTO cafes (name, address, phone, description, opening_time, closing_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                new.name.trim(),
                new.address.trim(),
                new.phone,
                new.description,
                new.opening_time,
                new.closing_time
            ],
        )?;
        get_cafe(conn, conn.last_insert_rowid())
    })?;
    tracing::info!(cafe = cafe.id, name = %cafe.name, "cafe created");
    Ok(cafe)
}

/// Changes to a cafe's details. `None` leaves a field as it is.
#[derive(Debug, Clone, Default)]
pub struct CafeEdit<'a> {
    pub name: Option<&'a str>,
    pub address: Option<&'a str>,
    pub phone: Option<&'a str>,
    pub description: Option<&'a str>,
}

pub fn update_cafe(
    conn: &Connection,
    actor_id: i64,
    cafe_id: i64,
    edit: &CafeEdit,
) -> Result<Cafe, ShiftError> {
    let cafe = db::immediate(conn, |conn| {
        let actor = auth::resolve(conn, actor_id)?;
        auth::require(conn, &actor, Capability::Administer)?;
        let current = get_cafe(conn, cafe_id)?;
        if let Some(name) = edit.name {
            validate_name("cafe name", name)?;
            if find_cafe_by_name(conn, name)?.is_some_and(|other| other.id != cafe_id) {
                return Err(ShiftError::Duplicate(format!("cafe '{}'", name.trim())));
            }
        }
        if let Some(address) = edit.address {
            validate_name("cafe address", address)?;
        }
        if let Some(phone) = edit.phone {
            validate_phone(phone)?;
        }
        conn.execute(
            "UPDATE cafes SET name = ?2, address = ?3, phone = ?4, description = ?5,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
             WHERE id = ?1",
            rusqlite::params![
                cafe_id,
                edit.name.map_or(current.name.as_str(), |n| n.trim()),
                edit.address.map_or(current.address.as_str(), |a| a.trim()),
                edit.phone.or(current.phone.as_deref()),
                edit.description.unwrap_or(&current.description),
            ],
        )?;
        get_cafe(conn, cafe_id)
    })?;
    tracing::info!(cafe = cafe_id, name = %cafe.name, "cafe updated");
    Ok(cafe)
}

/// Result of changing opening hours.
#[derive(Debug, Clone, Serialize)]
pub struct HoursUpdate {
    pub cafe: Cafe,
    /// Slots that have not started yet and no longer fit the new hours.
    /// They are kept; the staff decide whether to correct them.
    pub outside_hours: Vec<Slot>,
}

/// Set or clear opening hours.
pub fn update_cafe_hours(
    conn: &Connection,
    actor_id: i64,
    cafe_id: i64,
    opening: Option<NaiveTime>,
    closing: Option<NaiveTime>,
    now: NaiveDateTime,
) -> Result<HoursUpdate, ShiftError> {
    let update = db::immediate(conn, |conn| {
        let actor = auth::resolve(conn, actor_id)?;
        get_cafe(conn, cafe_id)?;
        auth::require(conn, &actor, Capability::ManageCafe(cafe_id))?;
        check_hours(opening, closing)?;
        conn.execute(
            "UPDATE cafes SET opening_time = ?2, closing_time = ?3,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
             WHERE id = ?1",
            rusqlite::params![cafe_id, opening, closing],
        )?;
        let outside_hours = allocation::upcoming_slots(conn, cafe_id, now)?
            .into_iter()
            .filter(|slot| {
                check_opening_hours(slot.start_time, slot.end_time, opening, closing).is_err()
            })
            .collect();
        Ok(HoursUpdate {
            cafe: get_cafe(conn, cafe_id)?,
            outside_hours,
        })
    })?;
    if !update.outside_hours.is_empty() {
        tracing::warn!(
            cafe = cafe_id,
            slots = update.outside_hours.len(),
            "upcoming slots fall outside the new opening hours"
        );
    }
    Ok(update)
}

/// Deactivated cafes keep their slots and bookings but accept no new ones.
pub fn set_cafe_active(
    conn: &Connection,
    actor_id: i64,
    cafe_id: i64,
    active: bool,
) -> Result<Cafe, ShiftError> {
    let cafe = db::immediate(conn, |conn| {
        let actor = auth::resolve(conn, actor_id)?;
        auth::require(conn, &actor, Capability::Administer)?;
        get_cafe(conn, cafe_id)?;
        conn.execute(
            "UPDATE cafes SET active = ?2, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
             WHERE id = ?1",
            rusqlite::params![cafe_id, active],
        )?;
        get_cafe(conn, cafe_id)
    })?;
    tracing::info!(cafe = cafe_id, active, "cafe status changed");
    Ok(cafe)
}

/// Point `cafe_id` at `user_id`, demoting whoever managed it before to a
/// barista there.
fn install_manager(conn: &Connection, user_id: i64, cafe_id: i64) -> Result<(), ShiftError> {
    if let Some(previous) = manager_of(conn, cafe_id)?.filter(|&id| id != user_id) {
        conn.execute("UPDATE cafes SET manager_id = NULL WHERE id = ?1", [cafe_id])?;
        conn.execute(
            "UPDATE users SET role = 'barista', updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
             WHERE id = ?1",
            [previous],
        )?;
        outbox::enqueue(
            conn,
            previous,
            MessageKind::AffiliationChanged,
            json!({ "role": Role::Barista, "cafe": cafe_id }),
        )?;
        tracing::info!(user = previous, cafe = cafe_id, "previous manager demoted");
    }
    conn.execute(
        "UPDATE cafes SET manager_id = ?1 WHERE id = ?2",
        [user_id, cafe_id],
    )?;
    Ok(())
}

/// Rewrite a user's role and cafe, keeping the manager pointers and the
/// user's bookings consistent with the result. Runs inside the caller's
/// transaction.
fn apply_affiliation(
    conn: &Connection,
    user: &User,
    role: Role,
    cafe_id: Option<i64>,
    now: NaiveDateTime,
) -> Result<(), ShiftError> {
    let old_cafe = user.cafe_id;

    // Release whatever cafe the user managed before.
    conn.execute(
        "UPDATE cafes SET manager_id = NULL WHERE manager_id = ?1",
        [user.id],
    )?;

    if role == Role::Manager {
        let Some(cafe_id) = cafe_id else {
            return Err(ShiftError::InvalidInput("a manager needs a cafe".into()));
        };
        install_manager(conn, user.id, cafe_id)?;
    }

    conn.execute(
        "UPDATE users SET role = ?2, cafe_id = ?3, requested_cafe_id = NULL,
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE id = ?1",
        rusqlite::params![user.id, role, cafe_id],
    )?;

    let canceled = if user.role == Role::Barista && role != Role::Barista {
        lifecycle::cascade_cancel_future(conn, user.id, None, now, "no longer a barista")?
    } else if user.role == Role::Barista && old_cafe.is_some() && old_cafe != cafe_id {
        lifecycle::cascade_cancel_future(conn, user.id, old_cafe, now, "moved to another cafe")?
    } else {
        Vec::new()
    };
    let canceled: Vec<i64> = canceled.iter().map(|d| d.booking.id).collect();

    let payload = json!({
        "user": user.id,
        "name": user.display_name,
        "role": role,
        "from_cafe": old_cafe,
        "to_cafe": cafe_id,
        "canceled_bookings": canceled,
    });
    outbox::enqueue(conn, user.id, MessageKind::AffiliationChanged, payload.clone())?;
    let mut staff_cafes: Vec<i64> = old_cafe.into_iter().chain(cafe_id).collect();
    staff_cafes.dedup();
    for staff_cafe in staff_cafes {
        if manager_of(conn, staff_cafe)? == Some(user.id) {
            continue;
        }
        outbox::enqueue_for_cafe_staff(
            conn,
            staff_cafe,
            MessageKind::AffiliationChanged,
            payload.clone(),
        )?;
    }
    tracing::info!(
        user = user.id,
        from = %user.role,
        to = %role,
        ?old_cafe,
        ?cafe_id,
        canceled = canceled.len(),
        "affiliation changed"
    );
    Ok(())
}

/// An account created directly by an administrator.
#[derive(Debug, Clone, Copy)]
pub struct NewUser<'a> {
    pub telegram_id: i64,
    pub display_name: &'a str,
    pub phone: Option<&'a str>,
    pub role: Role,
    pub cafe_id: Option<i64>,
}

/// Create an account without the registration round trip.
pub fn admin_create_user(
    conn: &Connection,
    actor_id: i64,
    new: &NewUser,
) -> Result<User, ShiftError> {
    let user = db::immediate(conn, |conn| {
        let actor = auth::resolve(conn, actor_id)?;
        auth::require(conn, &actor, Capability::Administer)?;
        if find_user_by_telegram(conn, new.telegram_id)?.is_some() {
            return Err(ShiftError::Duplicate(format!(
                "telegram id {}",
                new.telegram_id
            )));
        }
        validate_name("display name", new.display_name)?;
        if let Some(phone) = new.phone {
            check_phone_free(conn, phone, None)?;
        }
        let cafe_id = match new.role {
            Role::Pending => {
                return Err(ShiftError::InvalidInput(
                    "new accounts need a role other than pending".into(),
                ))
            }
            Role::Admin => None,
            Role::Manager | Role::Barista => {
                let Some(cafe_id) = new.cafe_id else {
                    return Err(ShiftError::InvalidInput(format!("a {} needs a cafe", new.role)));
                };
                active_cafe(conn, cafe_id)?;
                Some(cafe_id)
            }
        };
        conn.execute(
            "INSERT INTO users (telegram_id, display_name, phone, role, cafe_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                new.telegram_id,
                new.display_name.trim(),
                new.phone,
                new.role,
                cafe_id
            ],
        )?;
        let user_id = conn.last_insert_rowid();
        if let (Role::Manager, Some(cafe_id)) = (new.role, cafe_id) {
            install_manager(conn, user_id, cafe_id)?;
        }
        outbox::enqueue(
            conn,
            user_id,
            MessageKind::AffiliationChanged,
            json!({ "user": user_id, "role": new.role, "to_cafe": cafe_id }),
        )?;
        get_user(conn, user_id)
    })?;
    tracing::info!(user = user.id, role = %user.role, by = actor_id, "user created");
    Ok(user)
}

/// Change a user's display name or phone. Users may edit themselves;
/// administrators may edit anyone.
pub fn update_user_contact(
    conn: &Connection,
    actor_id: i64,
    user_id: i64,
    display_name: Option<&str>,
    phone: Option<&str>,
) -> Result<User, ShiftError> {
    db::immediate(conn, |conn| {
        let actor = auth::resolve(conn, actor_id)?;
        if actor.user_id != user_id {
            auth::require(conn, &actor, Capability::Administer)?;
        }
        let user = get_user(conn, user_id)?;
        if let Some(name) = display_name {
            validate_name("display name", name)?;
        }
        if let Some(phone) = phone {
            check_phone_free(conn, phone, Some(user_id))?;
        }
        conn.execute(
            "UPDATE users SET display_name = ?2, phone = ?3,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
             WHERE id = ?1",
            rusqlite::params![
                user_id,
                display_name.map_or(user.display_name.as_str(), |n| n.trim()),
                phone.or(user.phone.as_deref()),
            ],
        )?;
        get_user(conn, user_id)
    })
}

/// Put a user in charge of a cafe. The cafe's previous manager stays on as
/// a barista there.
pub fn assign_cafe_manager(
    conn: &Connection,
    actor_id: i64,
    cafe_id: i64,
    user_id: i64,
    now: NaiveDateTime,
) -> Result<User, ShiftError> {
    db::immediate(conn, |conn| {
        let actor = auth::resolve(conn, actor_id)?;
        auth::require(conn, &actor, Capability::Administer)?;
        active_cafe(conn, cafe_id)?;
        let user = get_user(conn, user_id)?;
        if !user.active {
            return Err(ShiftError::InvalidInput(format!(
                "user {user_id} is deactivated"
            )));
        }
        apply_affiliation(conn, &user, Role::Manager, Some(cafe_id), now)?;
        get_user(conn, user_id)
    })
}

/// Change a user's role and cafe.
///
/// Admins may set anything. A manager may only move baristas of their own
/// cafe to another cafe.
pub fn reassign_user(
    conn: &Connection,
    actor_id: i64,
    user_id: i64,
    role: Role,
    cafe_id: Option<i64>,
    now: NaiveDateTime,
) -> Result<User, ShiftError> {
    db::immediate(conn, |conn| {
        let actor = auth::resolve(conn, actor_id)?;
        let user = get_user(conn, user_id)?;
        if !user.active {
            return Err(ShiftError::InvalidInput(format!(
                "user {user_id} is deactivated"
            )));
        }
        match actor.role {
            Role::Admin => {}
            Role::Manager => {
                let own = managed_cafe(conn, &actor)?;
                if user.role != Role::Barista || user.cafe_id != Some(own) || role != Role::Barista
                {
                    return Err(ShiftError::Forbidden(format!(
                        "a manager may only move baristas of their own cafe; user {user_id} is {}",
                        user.role
                    )));
                }
            }
            _ => auth::require(conn, &actor, Capability::Administer)?,
        }

        let cafe_id = match role {
            Role::Pending => {
                return Err(ShiftError::InvalidInput(
                    "users cannot be sent back to pending".into(),
                ))
            }
            Role::Admin => None,
            Role::Manager | Role::Barista => {
                let Some(cafe_id) = cafe_id else {
                    return Err(ShiftError::InvalidInput(format!("a {role} needs a cafe")));
                };
                active_cafe(conn, cafe_id)?;
                Some(cafe_id)
            }
        };
        if user.role == role && user.cafe_id == cafe_id {
            return Ok(user);
        }
        apply_affiliation(conn, &user, role, cafe_id, now)?;
        get_user(conn, user_id)
    })
}

/// Deactivate or reactivate an account.
///
/// Deactivation cancels the user's future bookings and releases any cafe
/// they manage. A reactivated manager gets their cafe back only if nobody
/// took it over meanwhile, and is a barista there otherwise.
pub fn set_user_active(
    conn: &Connection,
    actor_id: i64,
    user_id: i64,
    active: bool,
    now: NaiveDateTime,
) -> Result<User, ShiftError> {
    let user = db::immediate(conn, |conn| {
        let actor = auth::resolve(conn, actor_id)?;
        auth::require(conn, &actor, Capability::Administer)?;
        if !active && user_id == actor_id {
            return Err(ShiftError::InvalidInput(
                "administrators cannot deactivate themselves".into(),
            ));
        }
        let user = get_user(conn, user_id)?;
        if user.active == active {
            return Ok(user);
        }

        if active {
            conn.execute(
                "UPDATE users SET active = 1, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
                 WHERE id = ?1",
                [user_id],
            )?;
            if let (Role::Manager, Some(cafe_id)) = (user.role, user.cafe_id) {
                if manager_of(conn, cafe_id)?.is_none() {
                    conn.execute(
                        "UPDATE cafes SET manager_id = ?1 WHERE id = ?2",
                        [user_id, cafe_id],
                    )?;
                } else {
                    conn.execute("UPDATE users SET role = 'barista' WHERE id = ?1", [user_id])?;
                }
            }
        } else {
            let canceled =
                lifecycle::cascade_cancel_future(conn, user_id, None, now, "account deactivated")?;
            conn.execute(
                "UPDATE cafes SET manager_id = NULL WHERE manager_id = ?1",
                [user_id],
            )?;
            conn.execute(
                "UPDATE users SET active = 0, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
                 WHERE id = ?1",
                [user_id],
            )?;
            let mut cafes: Vec<i64> = canceled.iter().map(|d| d.cafe_id).collect();
            cafes.sort_unstable();
            cafes.dedup();
            for cafe_id in cafes {
                outbox::enqueue_for_cafe_staff(
                    conn,
                    cafe_id,
                    MessageKind::AccountStatusChanged,
                    json!({ "user": user_id, "name": user.display_name, "active": false }),
                )?;
            }
        }
        outbox::enqueue(
            conn,
            user_id,
            MessageKind::AccountStatusChanged,
            json!({ "active": active }),
        )?;
        get_user(conn, user_id)
    })?;
    tracing::info!(user = user_id, active, by = actor_id, "account status changed");
    Ok(user)
}
