//! Slot allocation engine.
//!
//! Answers "what can be booked" and executes claims. Every claim runs inside
//! one `BEGIN IMMEDIATE` transaction: the capacity, duplicate, overlap and
//! rest-gap checks and the insert all happen under the store's write lock,
//! and the insert re-checks capacity in its own `WHERE` clause.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

use crate::auth::{self, Capability};
use crate::config::Rules;
use crate::db;
use crate::directory;
use crate::error::ShiftError;
use crate::lifecycle;
use crate::model::{Booking, BookingDetail, Role, Slot, SlotOccupancy};
use crate::outbox::{self, MessageKind};
use crate::validate::{self, Shift};

const SLOT_COLUMNS: &str = "id, cafe_id, start_time, end_time, required_capacity, created_at";

const BOOKING_COLUMNS: &str =
    "id, barista_id, slot_id, status, reminded_at, created_at, updated_at";

pub(crate) const BOOKING_DETAIL_SELECT: &str =
    "SELECT b.id, b.barista_id, b.slot_id, b.status, b.reminded_at, b.created_at, b.updated_at,
            c.id, c.name, s.start_time, s.end_time
     FROM bookings b
     JOIN slots s ON s.id = b.slot_id
     JOIN cafes c ON c.id = s.cafe_id";

const ACTIVE_COUNT: &str = "SELECT COUNT(*) FROM bookings
     WHERE slot_id = ?1 AND status IN ('booked', 'confirmed_work')";

/// Insert only while the slot still has room; zero affected rows means
/// another claim took the last place.
const CLAIM_IF_ROOM: &str = "INSERT INTO bookings (barista_id, slot_id, status)
     SELECT ?1, s.id, 'booked' FROM slots s
     WHERE s.id = ?2
       AND (SELECT COUNT(*) FROM bookings b
            WHERE b.slot_id = s.id AND b.status IN ('booked', 'confirmed_work'))
           < s.required_capacity";

fn read_slot(row: &rusqlite::Row) -> rusqlite::Result<Slot> {
    Ok(Slot {
        id: row.get(0)?,
        cafe_id: row.get(1)?,
        start_time: row.get(2)?,
        end_time: row.get(3)?,
        required_capacity: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn read_booking(row: &rusqlite::Row) -> rusqlite::Result<Booking> {
    Ok(Booking {
        id: row.get(0)?,
        barista_id: row.get(1)?,
        slot_id: row.get(2)?,
        status: row.get(3)?,
        reminded_at: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

pub(crate) fn read_booking_detail(row: &rusqlite::Row) -> rusqlite::Result<BookingDetail> {
    Ok(BookingDetail {
        booking: read_booking(row)?,
        cafe_id: row.get(7)?,
        cafe_name: row.get(8)?,
        start_time: row.get(9)?,
        end_time: row.get(10)?,
    })
}

/// Notification payload describing a booking.
pub(crate) fn booking_payload(detail: &BookingDetail) -> Value {
    json!({
        "booking": detail.booking.id,
        "barista": detail.booking.barista_id,
        "slot": detail.booking.slot_id,
        "cafe": detail.cafe_name,
        "start": detail.start_time,
        "end": detail.end_time,
        "status": detail.booking.status,
    })
}

pub fn get_slot(conn: &Connection, slot_id: i64) -> Result<Slot, ShiftError> {
    conn.query_row(
        &format!("SELECT {SLOT_COLUMNS} FROM slots WHERE id = ?1"),
        [slot_id],
        read_slot,
    )
    .optional()?
    .ok_or(ShiftError::SlotNotFound(slot_id))
}

/// Slots of a cafe that have not started yet, earliest first.
pub(crate) fn upcoming_slots(
    conn: &Connection,
    cafe_id: i64,
    now: NaiveDateTime,
) -> Result<Vec<Slot>, ShiftError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SLOT_COLUMNS} FROM slots
         WHERE cafe_id = ?1 AND start_time > ?2
         ORDER BY start_time, id"
    ))?;
    let rows = stmt.query_map(rusqlite::params![cafe_id, now], read_slot)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Into::into)
}

pub fn get_booking(conn: &Connection, booking_id: i64) -> Result<Booking, ShiftError> {
    conn.query_row(
        &format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = ?1"),
        [booking_id],
        read_booking,
    )
    .optional()?
    .ok_or_else(|| ShiftError::not_found("booking", booking_id))
}

pub fn get_booking_detail(conn: &Connection, booking_id: i64) -> Result<BookingDetail, ShiftError> {
    conn.query_row(
        &format!("{BOOKING_DETAIL_SELECT} WHERE b.id = ?1"),
        [booking_id],
        read_booking_detail,
    )
    .optional()?
    .ok_or_else(|| ShiftError::not_found("booking", booking_id))
}

fn active_count(conn: &Connection, slot_id: i64) -> Result<i64, ShiftError> {
    Ok(conn.query_row(ACTIVE_COUNT, [slot_id], |row| row.get(0))?)
}

fn has_active_booking(conn: &Connection, barista_id: i64, slot_id: i64) -> Result<bool, ShiftError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM bookings
         WHERE barista_id = ?1 AND slot_id = ?2 AND status IN ('booked', 'confirmed_work')",
        [barista_id, slot_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Slots at `cafe_id` starting in `[from, to)` that still have room, earliest first.
///
/// A deactivated cafe has nothing to offer.
pub fn list_available_slots(
    conn: &Connection,
    cafe_id: i64,
    from: NaiveDateTime,
    to: NaiveDateTime,
) -> Result<Vec<Slot>, ShiftError> {
    let cafe = directory::get_cafe(conn, cafe_id)?;
    if !cafe.active {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SLOT_COLUMNS} FROM slots s
         WHERE s.cafe_id = ?1 AND s.start_time >= ?2 AND s.start_time < ?3
           AND (SELECT COUNT(*) FROM bookings b
                WHERE b.slot_id = s.id AND b.status IN ('booked', 'confirmed_work'))
               < s.required_capacity
         ORDER BY s.start_time, s.id"
    ))?;
    let rows = stmt.query_map(rusqlite::params![cafe_id, from, to], read_slot)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Into::into)
}

/// Claim one place on a slot for the calling barista.
pub fn claim_slot(
    conn: &Connection,
    rules: &Rules,
    barista_id: i64,
    slot_id: i64,
    now: NaiveDateTime,
) -> Result<Booking, ShiftError> {
    let detail = db::immediate(conn, |conn| {
        let actor = auth::resolve(conn, barista_id)?;
        auth::require(conn, &actor, Capability::BookShifts)?;

        let slot = get_slot(conn, slot_id)?;
        let cafe = directory::get_cafe(conn, slot.cafe_id)?;
        if !cafe.active {
            return Err(ShiftError::SlotNotFound(slot_id));
        }
        if slot.start_time <= now {
            return Err(ShiftError::PastSlot(slot.start_time));
        }
        if active_count(conn, slot_id)? >= slot.required_capacity {
            return Err(ShiftError::SlotFull(slot_id));
        }
        if has_active_booking(conn, barista_id, slot_id)? {
            return Err(ShiftError::DuplicateBooking { slot: slot_id });
        }

        let candidate = Shift {
            booking_id: 0,
            cafe_id: slot.cafe_id,
            start: slot.start_time,
            end: slot.end_time,
        };
        let existing = validate::active_shifts(conn, barista_id, Some(slot_id))?;
        validate::check_shift_fits(&candidate, &existing, rules.min_rest)?;

        let inserted = conn.execute(CLAIM_IF_ROOM, [barista_id, slot_id])?;
        if inserted == 0 {
            return Err(ShiftError::SlotFull(slot_id));
        }
        let detail = get_booking_detail(conn, conn.last_insert_rowid())?;

        let payload = booking_payload(&detail);
        outbox::enqueue(conn, barista_id, MessageKind::BookingCreated, payload.clone())?;
        outbox::enqueue_for_cafe_staff(conn, slot.cafe_id, MessageKind::BookingCreated, payload)?;
        Ok(detail)
    })?;
    tracing::info!(
        booking = detail.booking.id,
        slot = slot_id,
        barista = barista_id,
        cafe = %detail.cafe_name,
        "slot claimed"
    );
    Ok(detail.booking)
}

/// Give an active booking back. Same rules as [`lifecycle::cancel`].
pub fn release_slot(
    conn: &Connection,
    rules: &Rules,
    actor_id: i64,
    booking_id: i64,
    now: NaiveDateTime,
) -> Result<Booking, ShiftError> {
    lifecycle::cancel(conn, rules, actor_id, booking_id, now)
}

/// Check a proposed slot window against the cafe it belongs to.
fn check_slot_window(
    conn: &Connection,
    cafe_id: i64,
    start: NaiveDateTime,
    end: NaiveDateTime,
    capacity: i64,
    now: NaiveDateTime,
) -> Result<(), ShiftError> {
    validate::check_time_range(start, end)?;
    if start <= now {
        return Err(ShiftError::PastSlot(start));
    }
    validate::validate_capacity(capacity)?;
    let cafe = directory::get_cafe(conn, cafe_id)?;
    validate::check_opening_hours(start, end, cafe.opening_time, cafe.closing_time)
}

pub fn create_slot(
    conn: &Connection,
    actor_id: i64,
    cafe_id: i64,
    start: NaiveDateTime,
    end: NaiveDateTime,
    required_capacity: i64,
    now: NaiveDateTime,
) -> Result<Slot, ShiftError> {
    let slot = db::immediate(conn, |conn| {
        let actor = auth::resolve(conn, actor_id)?;
        let cafe = directory::get_cafe(conn, cafe_id)?;
        if !cafe.active {
            return Err(ShiftError::not_found("cafe", cafe_id));
        }
        auth::require(conn, &actor, Capability::ManageCafe(cafe_id))?;
        check_slot_window(conn, cafe_id, start, end, required_capacity, now)?;
        conn.execute(
            "INSERT INTO slots (cafe_id, start_time, end_time, required_capacity)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![cafe_id, start, end, required_capacity],
        )?;
        get_slot(conn, conn.last_insert_rowid())
    })?;
    tracing::info!(slot = slot.id, cafe = cafe_id, %start, %end, "slot created");
    Ok(slot)
}

/// Administrative correction of a slot's window or capacity.
///
/// A slot nobody holds may be edited by its cafe's manager. Once it has
/// active bookings only an admin may edit it, and every holder must still
/// fit the new window.
#[allow(clippy::too_many_arguments)]
pub fn correct_slot(
    conn: &Connection,
    rules: &Rules,
    actor_id: i64,
    slot_id: i64,
    start: NaiveDateTime,
    end: NaiveDateTime,
    required_capacity: i64,
    now: NaiveDateTime,
) -> Result<Slot, ShiftError> {
    let slot = db::immediate(conn, |conn| {
        let actor = auth::resolve(conn, actor_id)?;
        let slot = get_slot(conn, slot_id)?;
        auth::require(conn, &actor, Capability::ManageCafe(slot.cafe_id))?;
        check_slot_window(conn, slot.cafe_id, start, end, required_capacity, now)?;

        let holders: Vec<(i64, i64)> = {
            let mut stmt = conn.prepare_cached(
                "SELECT id, barista_id FROM bookings
                 WHERE slot_id = ?1 AND status IN ('booked', 'confirmed_work')
                 ORDER BY id",
            )?;
            let rows = stmt.query_map([slot_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        if !holders.is_empty() {
            if actor.role != Role::Admin {
                return Err(ShiftError::Forbidden(format!(
                    "slot {slot_id} has active bookings; only an administrator may correct it"
                )));
            }
            if holders.len() as i64 > required_capacity {
                return Err(ShiftError::InvalidInput(format!(
                    "slot {slot_id} has {} active bookings, more than the new capacity {required_capacity}",
                    holders.len()
                )));
            }
            for &(booking_id, barista_id) in &holders {
                let candidate = Shift {
                    booking_id,
                    cafe_id: slot.cafe_id,
                    start,
                    end,
                };
                let others = validate::active_shifts(conn, barista_id, Some(slot_id))?;
                validate::check_shift_fits(&candidate, &others, rules.min_rest)?;
            }
        }

        conn.execute(
            "UPDATE slots SET start_time = ?2, end_time = ?3, required_capacity = ?4,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
             WHERE id = ?1",
            rusqlite::params![slot_id, start, end, required_capacity],
        )?;
        let payload = json!({ "slot": slot_id, "start": start, "end": end });
        for &(_, barista_id) in &holders {
            outbox::enqueue(conn, barista_id, MessageKind::SlotChanged, payload.clone())?;
        }
        get_slot(conn, slot_id)
    })?;
    tracing::info!(slot = slot_id, actor = actor_id, "slot corrected");
    Ok(slot)
}

/// Every slot of `cafe_id` starting on `date`, with who holds it.
pub fn slot_occupancy(
    conn: &Connection,
    actor_id: i64,
    cafe_id: i64,
    date: NaiveDate,
) -> Result<Vec<SlotOccupancy>, ShiftError> {
    let actor = auth::resolve(conn, actor_id)?;
    directory::get_cafe(conn, cafe_id)?;
    auth::require(conn, &actor, Capability::ManageCafe(cafe_id))?;

    let from = date.and_time(NaiveTime::MIN);
    let to = from + TimeDelta::days(1);
    let slots: Vec<Slot> = {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SLOT_COLUMNS} FROM slots
             WHERE cafe_id = ?1 AND start_time >= ?2 AND start_time < ?3
             ORDER BY start_time, id"
        ))?;
        let rows = stmt.query_map(rusqlite::params![cafe_id, from, to], read_slot)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut names = conn.prepare_cached(
        "SELECT u.display_name FROM bookings b JOIN users u ON u.id = b.barista_id
         WHERE b.slot_id = ?1 AND b.status IN ('booked', 'confirmed_work')
         ORDER BY b.id",
    )?;
    let mut result = Vec::with_capacity(slots.len());
    for slot in slots {
        let baristas = names
            .query_map([slot.id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        result.push(SlotOccupancy {
            booked: baristas.len() as i64,
            baristas,
            slot,
        });
    }
    Ok(result)
}

/// The barista's active bookings that have not ended yet, earliest first.
pub fn barista_bookings(
    conn: &Connection,
    barista_id: i64,
    now: NaiveDateTime,
) -> Result<Vec<BookingDetail>, ShiftError> {
    directory::get_user(conn, barista_id)?;
    let mut stmt = conn.prepare_cached(&format!(
        "{BOOKING_DETAIL_SELECT}
         WHERE b.barista_id = ?1 AND b.status IN ('booked', 'confirmed_work')
           AND s.end_time > ?2
         ORDER BY s.start_time, b.id"
    ))?;
    let rows = stmt.query_map(rusqlite::params![barista_id, now], read_booking_detail)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BookingStatus;

    fn at(day: u32, hour: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, day)
            .unwrap()
            .and_hms_opt(hour, min, 0)
            .unwrap()
    }

    fn now() -> NaiveDateTime {
        at(19, 12, 0)
    }

    /// Admin 1, manager 2 of cafe 1, baristas 3 and 4 at cafe 1, cafe 2 unmanaged.
    fn setup() -> Connection {
        let conn = db::open_memory().unwrap();
        conn.execute_batch(
            "INSERT INTO cafes (id, name, address) VALUES (1, 'North', 'a'), (2, 'South', 'b');
             INSERT INTO users (id, telegram_id, display_name, role) VALUES (1, 10, 'Ada', 'admin');
             INSERT INTO users (id, telegram_id, display_name, role, cafe_id) VALUES (2, 20, 'Max', 'manager', 1);
             INSERT INTO users (id, telegram_id, display_name, role, cafe_id) VALUES (3, 30, 'Bea', 'barista', 1);
             INSERT INTO users (id, telegram_id, display_name, role, cafe_id) VALUES (4, 40, 'Cid', 'barista', 1);
             UPDATE cafes SET manager_id = 2 WHERE id = 1;",
        )
        .unwrap();
        conn
    }

    fn slot(conn: &Connection, cafe: i64, start: NaiveDateTime, end: NaiveDateTime, cap: i64) -> i64 {
        create_slot(conn, 1, cafe, start, end, cap, now()).unwrap().id
    }

    #[test]
    fn claim_creates_booked_booking_and_notifies() {
        let conn = setup();
        let s = slot(&conn, 1, at(20, 9, 0), at(20, 13, 0), 1);
        let booking = claim_slot(&conn, &Rules::default(), 3, s, now()).unwrap();
        assert_eq!(booking.status, BookingStatus::Booked);
        assert_eq!(booking.barista_id, 3);

        let kinds: Vec<(i64, MessageKind)> = outbox::list(&conn, true)
            .unwrap()
            .into_iter()
            .map(|n| (n.user_id, n.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![(3, MessageKind::BookingCreated), (2, MessageKind::BookingCreated)]
        );
    }

    #[test]
    fn full_slot_is_rejected_and_hidden() {
        let conn = setup();
        let s = slot(&conn, 1, at(20, 9, 0), at(20, 13, 0), 1);
        claim_slot(&conn, &Rules::default(), 3, s, now()).unwrap();
        let err = claim_slot(&conn, &Rules::default(), 4, s, now()).unwrap_err();
        assert!(matches!(err, ShiftError::SlotFull(id) if id == s));
        let open = list_available_slots(&conn, 1, at(20, 0, 0), at(21, 0, 0)).unwrap();
        assert!(open.is_empty());
    }

    #[test]
    fn duplicate_claim_is_rejected() {
        let conn = setup();
        let s = slot(&conn, 1, at(20, 9, 0), at(20, 13, 0), 2);
        claim_slot(&conn, &Rules::default(), 3, s, now()).unwrap();
        let err = claim_slot(&conn, &Rules::default(), 3, s, now()).unwrap_err();
        assert!(matches!(err, ShiftError::DuplicateBooking { .. }));
    }

    #[test]
    fn overlapping_claim_is_rejected() {
        let conn = setup();
        let a = slot(&conn, 1, at(20, 9, 0), at(20, 13, 0), 1);
        let b = slot(&conn, 1, at(20, 12, 0), at(20, 16, 0), 1);
        claim_slot(&conn, &Rules::default(), 3, a, now()).unwrap();
        let err = claim_slot(&conn, &Rules::default(), 3, b, now()).unwrap_err();
        assert!(matches!(err, ShiftError::OverlappingShift { .. }));
    }

    #[test]
    fn unknown_or_inactive_slot_is_not_found() {
        let conn = setup();
        let s = slot(&conn, 2, at(20, 9, 0), at(20, 13, 0), 1);
        assert!(matches!(
            claim_slot(&conn, &Rules::default(), 3, 999, now()),
            Err(ShiftError::SlotNotFound(999))
        ));
        conn.execute("UPDATE cafes SET active = 0 WHERE id = 2", []).unwrap();
        assert!(matches!(
            claim_slot(&conn, &Rules::default(), 3, s, now()),
            Err(ShiftError::SlotNotFound(_))
        ));
        assert!(list_available_slots(&conn, 2, at(20, 0, 0), at(21, 0, 0))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn only_baristas_claim() {
        let conn = setup();
        let s = slot(&conn, 1, at(20, 9, 0), at(20, 13, 0), 1);
        assert!(matches!(
            claim_slot(&conn, &Rules::default(), 2, s, now()),
            Err(ShiftError::Forbidden(_))
        ));
    }

    #[test]
    fn available_slots_are_ordered_and_bounded() {
        let conn = setup();
        let late = slot(&conn, 1, at(20, 14, 0), at(20, 18, 0), 1);
        let early = slot(&conn, 1, at(20, 8, 0), at(20, 12, 0), 1);
        slot(&conn, 1, at(21, 8, 0), at(21, 12, 0), 1);
        let ids: Vec<i64> = list_available_slots(&conn, 1, at(20, 0, 0), at(21, 0, 0))
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![early, late]);
        assert!(matches!(
            list_available_slots(&conn, 9, at(20, 0, 0), at(21, 0, 0)),
            Err(ShiftError::NotFound { .. })
        ));
    }

    #[test]
    fn create_slot_validation() {
        let conn = setup();
        assert!(matches!(
            create_slot(&conn, 2, 1, at(20, 13, 0), at(20, 9, 0), 1, now()),
            Err(ShiftError::InvalidTimeRange(_))
        ));
        assert!(matches!(
            create_slot(&conn, 2, 1, at(18, 9, 0), at(18, 13, 0), 1, now()),
            Err(ShiftError::PastSlot(_))
        ));
        assert!(matches!(
            create_slot(&conn, 2, 1, at(20, 9, 0), at(20, 13, 0), 0, now()),
            Err(ShiftError::InvalidInput(_))
        ));
        assert!(matches!(
            create_slot(&conn, 2, 2, at(20, 9, 0), at(20, 13, 0), 1, now()),
            Err(ShiftError::Forbidden(_))
        ));
        assert!(matches!(
            create_slot(&conn, 3, 1, at(20, 9, 0), at(20, 13, 0), 1, now()),
            Err(ShiftError::Forbidden(_))
        ));
        assert!(create_slot(&conn, 2, 1, at(20, 9, 0), at(20, 13, 0), 1, now()).is_ok());
    }

    #[test]
    fn create_slot_respects_opening_hours() {
        let conn = setup();
        conn.execute(
            "UPDATE cafes SET opening_time = '08:00:00', closing_time = '20:00:00' WHERE id = 1",
            [],
        )
        .unwrap();
        assert!(matches!(
            create_slot(&conn, 2, 1, at(20, 6, 0), at(20, 10, 0), 1, now()),
            Err(ShiftError::InvalidTimeRange(_))
        ));
        assert!(create_slot(&conn, 2, 1, at(20, 8, 0), at(20, 12, 0), 1, now()).is_ok());
    }

    #[test]
    fn manager_corrects_only_unbooked_slots() {
        let conn = setup();
        let s = slot(&conn, 1, at(20, 9, 0), at(20, 13, 0), 2);
        let corrected =
            correct_slot(&conn, &Rules::default(), 2, s, at(20, 10, 0), at(20, 14, 0), 2, now())
                .unwrap();
        assert_eq!(corrected.start_time, at(20, 10, 0));

        claim_slot(&conn, &Rules::default(), 3, s, now()).unwrap();
        assert!(matches!(
            correct_slot(&conn, &Rules::default(), 2, s, at(20, 9, 0), at(20, 13, 0), 2, now()),
            Err(ShiftError::Forbidden(_))
        ));
        let corrected =
            correct_slot(&conn, &Rules::default(), 1, s, at(20, 9, 0), at(20, 13, 0), 1, now())
                .unwrap();
        assert_eq!(corrected.required_capacity, 1);
        let pending = outbox::list(&conn, true).unwrap();
        assert!(pending
            .iter()
            .any(|n| n.user_id == 3 && n.kind == MessageKind::SlotChanged));
    }

    #[test]
    fn correction_revalidates_existing_bookings() {
        let conn = setup();
        let a = slot(&conn, 1, at(20, 9, 0), at(20, 13, 0), 2);
        let b = slot(&conn, 1, at(20, 14, 0), at(20, 18, 0), 1);
        claim_slot(&conn, &Rules::default(), 3, a, now()).unwrap();
        claim_slot(&conn, &Rules::default(), 4, a, now()).unwrap();
        claim_slot(&conn, &Rules::default(), 3, b, now()).unwrap();

        assert!(matches!(
            correct_slot(&conn, &Rules::default(), 1, a, at(20, 9, 0), at(20, 13, 0), 1, now()),
            Err(ShiftError::InvalidInput(_))
        ));
        assert!(matches!(
            correct_slot(&conn, &Rules::default(), 1, a, at(20, 10, 0), at(20, 15, 0), 2, now()),
            Err(ShiftError::OverlappingShift { .. })
        ));
    }

    #[test]
    fn occupancy_lists_holders() {
        let conn = setup();
        let s = slot(&conn, 1, at(20, 9, 0), at(20, 13, 0), 2);
        slot(&conn, 1, at(21, 9, 0), at(21, 13, 0), 1);
        claim_slot(&conn, &Rules::default(), 3, s, now()).unwrap();

        let view = slot_occupancy(&conn, 2, 1, at(20, 0, 0).date()).unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].booked, 1);
        assert_eq!(view[0].baristas, vec!["Bea".to_string()]);
        assert!(!view[0].is_full());
        assert!(matches!(
            slot_occupancy(&conn, 3, 1, at(20, 0, 0).date()),
            Err(ShiftError::Forbidden(_))
        ));
    }

    #[test]
    fn barista_bookings_skip_finished_shifts() {
        let conn = setup();
        let a = slot(&conn, 1, at(20, 9, 0), at(20, 13, 0), 1);
        let b = slot(&conn, 2, at(21, 9, 0), at(21, 13, 0), 1);
        claim_slot(&conn, &Rules::default(), 3, a, now()).unwrap();
        claim_slot(&conn, &Rules::default(), 3, b, now()).unwrap();

        let upcoming = barista_bookings(&conn, 3, at(20, 14, 0)).unwrap();
        assert_eq!(upcoming.len(), 1);
        assert_eq!(upcoming[0].cafe_name, "South");
    }
}
