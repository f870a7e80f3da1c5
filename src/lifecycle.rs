//! Booking lifecycle: the state machine a booking moves through after a claim.
//!
//! ```text
//! booked ──confirm──▶ confirmed_work ──complete / sweep──▶ completed
//!   │                      │
//!   ├──cancel──▶ canceled ◀┘ (before start only)
//!   └──sweep after end──▶ no_show
//! ```
//!
//! Each transition is a guarded `UPDATE .. WHERE status = ?` inside its own
//! transaction, so sweeps and users racing on the same booking cannot both win.

use chrono::NaiveDateTime;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;

use crate::allocation::{self, booking_payload, read_booking_detail, BOOKING_DETAIL_SELECT};
use crate::auth::{self, Capability};
use crate::config::Rules;
use crate::db;
use crate::error::ShiftError;
use crate::model::{Booking, BookingDetail, BookingStatus};
use crate::outbox::{self, MessageKind};

/// Move a booking from `from` to `to`; fails if another caller moved it first.
fn transition(
    conn: &Connection,
    booking_id: i64,
    from: BookingStatus,
    to: BookingStatus,
) -> Result<(), ShiftError> {
    let updated = conn.execute(
        "UPDATE bookings SET status = ?1, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE id = ?2 AND status = ?3",
        rusqlite::params![to, booking_id, from],
    )?;
    if updated == 0 {
        return Err(ShiftError::InvalidTransition(format!(
            "booking {booking_id} is no longer {from}"
        )));
    }
    Ok(())
}

fn terminal(detail: &BookingDetail, action: &str) -> ShiftError {
    ShiftError::InvalidTransition(format!(
        "cannot {action} booking {}: it is {}",
        detail.booking.id, detail.booking.status
    ))
}

/// The barista confirms they are coming to the shift.
pub fn confirm_going(
    conn: &Connection,
    rules: &Rules,
    barista_id: i64,
    booking_id: i64,
    now: NaiveDateTime,
) -> Result<Booking, ShiftError> {
    let booking = db::immediate(conn, |conn| {
        let actor = auth::resolve(conn, barista_id)?;
        let detail = allocation::get_booking_detail(conn, booking_id)?;
        if detail.booking.barista_id != actor.user_id {
            return Err(ShiftError::Forbidden(format!(
                "booking {booking_id} belongs to another barista"
            )));
        }
        if detail.booking.status != BookingStatus::Booked {
            return Err(terminal(&detail, "confirm"));
        }
        let opens = detail.start_time - rules.confirm_opens_before;
        let closes = detail.start_time + rules.confirm_closes_after;
        if now < opens || now > closes {
            return Err(ShiftError::OutOfWindow { opens, closes });
        }
        transition(conn, booking_id, BookingStatus::Booked, BookingStatus::ConfirmedWork)?;
        let detail = allocation::get_booking_detail(conn, booking_id)?;
        outbox::enqueue_for_cafe_staff(
            conn,
            detail.cafe_id,
            MessageKind::BookingConfirmed,
            booking_payload(&detail),
        )?;
        Ok(detail.booking)
    })?;
    tracing::info!(booking = booking_id, barista = barista_id, "shift confirmed");
    Ok(booking)
}

/// Cancel an active booking.
///
/// The owner, the cafe's manager or an admin may cancel. A confirmed shift
/// can only be canceled before it starts; canceling it within the
/// late-cancel window also alerts the cafe staff.
pub fn cancel(
    conn: &Connection,
    rules: &Rules,
    actor_id: i64,
    booking_id: i64,
    now: NaiveDateTime,
) -> Result<Booking, ShiftError> {
    let (booking, late) = db::immediate(conn, |conn| {
        let actor = auth::resolve(conn, actor_id)?;
        let detail = allocation::get_booking_detail(conn, booking_id)?;
        let owner = detail.booking.barista_id;
        auth::require(
            conn,
            &actor,
            Capability::ActOnBooking {
                owner,
                cafe_id: detail.cafe_id,
            },
        )?;
        let late = match detail.booking.status {
            BookingStatus::Booked => false,
            BookingStatus::ConfirmedWork => {
                if now >= detail.start_time {
                    return Err(ShiftError::InvalidTransition(format!(
                        "booking {booking_id} is confirmed and its shift has started"
                    )));
                }
                detail.start_time - now <= rules.late_cancel
            }
            _ => return Err(terminal(&detail, "cancel")),
        };
        transition(conn, booking_id, detail.booking.status, BookingStatus::Canceled)?;

        let detail = allocation::get_booking_detail(conn, booking_id)?;
        let mut payload = booking_payload(&detail);
        payload["canceled_by"] = json!(actor_id);
        if actor_id == owner {
            outbox::enqueue_for_cafe_staff(
                conn,
                detail.cafe_id,
                MessageKind::BookingCanceled,
                payload.clone(),
            )?;
        } else {
            outbox::enqueue(conn, owner, MessageKind::BookingCanceled, payload.clone())?;
        }
        if late {
            outbox::enqueue_for_cafe_staff(
                conn,
                detail.cafe_id,
                MessageKind::LateCancellation,
                payload,
            )?;
        }
        Ok((detail.booking, late))
    })?;
    if late {
        tracing::warn!(booking = booking_id, actor = actor_id, "late cancellation");
    } else {
        tracing::info!(booking = booking_id, actor = actor_id, "booking canceled");
    }
    Ok(booking)
}

/// A manager or admin marks a confirmed shift as worked.
pub fn complete(conn: &Connection, actor_id: i64, booking_id: i64) -> Result<Booking, ShiftError> {
    let booking = db::immediate(conn, |conn| {
        let actor = auth::resolve(conn, actor_id)?;
        let detail = allocation::get_booking_detail(conn, booking_id)?;
        auth::require(conn, &actor, Capability::ManageCafe(detail.cafe_id))?;
        if detail.booking.status != BookingStatus::ConfirmedWork {
            return Err(terminal(&detail, "complete"));
        }
        finish(conn, &detail)
    })?;
    tracing::info!(booking = booking_id, actor = actor_id, "shift completed");
    Ok(booking)
}

fn finish(conn: &Connection, detail: &BookingDetail) -> Result<Booking, ShiftError> {
    let booking_id = detail.booking.id;
    transition(conn, booking_id, BookingStatus::ConfirmedWork, BookingStatus::Completed)?;
    let detail = allocation::get_booking_detail(conn, booking_id)?;
    outbox::enqueue(
        conn,
        detail.booking.barista_id,
        MessageKind::BookingCompleted,
        booking_payload(&detail),
    )?;
    Ok(detail.booking)
}

/// Mark an unconfirmed booking whose shift is over as a no-show.
///
/// Returns `false` without touching anything when the booking is not
/// `booked` or its shift has not ended yet.
pub fn mark_no_show(
    conn: &Connection,
    booking_id: i64,
    now: NaiveDateTime,
) -> Result<bool, ShiftError> {
    db::immediate(conn, |conn| {
        let detail = allocation::get_booking_detail(conn, booking_id)?;
        if detail.booking.status != BookingStatus::Booked || now < detail.end_time {
            return Ok(false);
        }
        transition(conn, booking_id, BookingStatus::Booked, BookingStatus::NoShow)?;
        let detail = allocation::get_booking_detail(conn, booking_id)?;
        outbox::enqueue_for_cafe_staff(
            conn,
            detail.cafe_id,
            MessageKind::NoShow,
            booking_payload(&detail),
        )?;
        tracing::info!(booking = booking_id, barista = detail.booking.barista_id, "no-show");
        Ok(true)
    })
}

/// Outcome of one sweep run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub changed: usize,
    pub failed: usize,
}

fn candidates(
    conn: &Connection,
    query: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<i64>, ShiftError> {
    let mut stmt = conn.prepare_cached(query)?;
    let rows = stmt.query_map(params, |row| row.get(0))?;
    rows.collect::<rusqlite::Result<Vec<i64>>>()
        .map_err(Into::into)
}

/// Run `step` once per booking, each in its own transaction. A failing
/// booking is logged and skipped so one bad row cannot stall the sweep.
fn sweep(
    name: &str,
    ids: Vec<i64>,
    mut step: impl FnMut(i64) -> Result<bool, ShiftError>,
) -> SweepReport {
    let mut report = SweepReport {
        examined: ids.len(),
        ..SweepReport::default()
    };
    for id in ids {
        match step(id) {
            Ok(true) => report.changed += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(sweep = name, booking = id, error = %e, "sweep step failed");
                report.failed += 1;
            }
        }
    }
    if report.changed > 0 || report.failed > 0 {
        tracing::info!(
            sweep = name,
            examined = report.examined,
            changed = report.changed,
            failed = report.failed,
            "sweep finished"
        );
    }
    report
}

/// Turn every unconfirmed booking whose shift has ended into a no-show.
/// Running it again over the same bookings changes nothing.
pub fn mark_no_show_sweep(conn: &Connection, now: NaiveDateTime) -> Result<SweepReport, ShiftError> {
    let ids = candidates(
        conn,
        "SELECT b.id FROM bookings b JOIN slots s ON s.id = b.slot_id
         WHERE b.status = 'booked' AND s.end_time <= ?1
         ORDER BY s.end_time, b.id",
        [now],
    )?;
    Ok(sweep("no_show", ids, |id| mark_no_show(conn, id, now)))
}

/// Complete every confirmed shift that has ended.
pub fn completion_sweep(conn: &Connection, now: NaiveDateTime) -> Result<SweepReport, ShiftError> {
    let ids = candidates(
        conn,
        "SELECT b.id FROM bookings b JOIN slots s ON s.id = b.slot_id
         WHERE b.status = 'confirmed_work' AND s.end_time <= ?1
         ORDER BY s.end_time, b.id",
        [now],
    )?;
    Ok(sweep("completion", ids, |id| {
        db::immediate(conn, |conn| {
            let detail = allocation::get_booking_detail(conn, id)?;
            if detail.booking.status != BookingStatus::ConfirmedWork || now < detail.end_time {
                return Ok(false);
            }
            finish(conn, &detail)?;
            Ok(true)
        })
    }))
}

/// Remind baristas of active shifts starting within the reminder horizon.
/// A booking is reminded at most once.
pub fn daily_reminder_sweep(
    conn: &Connection,
    rules: &Rules,
    now: NaiveDateTime,
) -> Result<SweepReport, ShiftError> {
    let horizon = now + rules.reminder_horizon;
    let ids = candidates(
        conn,
        "SELECT b.id FROM bookings b JOIN slots s ON s.id = b.slot_id
         WHERE b.status IN ('booked', 'confirmed_work') AND b.reminded_at IS NULL
           AND s.start_time > ?1 AND s.start_time <= ?2
         ORDER BY s.start_time, b.id",
        rusqlite::params![now, horizon],
    )?;
    Ok(sweep("reminder", ids, |id| {
        db::immediate(conn, |conn| {
            let marked = conn.execute(
                "UPDATE bookings SET reminded_at = ?2
                 WHERE id = ?1 AND reminded_at IS NULL AND status IN ('booked', 'confirmed_work')",
                rusqlite::params![id, now],
            )?;
            if marked == 0 {
                return Ok(false);
            }
            let detail = allocation::get_booking_detail(conn, id)?;
            outbox::enqueue(
                conn,
                detail.booking.barista_id,
                MessageKind::ShiftReminder,
                booking_payload(&detail),
            )?;
            Ok(true)
        })
    }))
}

/// Cancel a user's future active bookings, optionally only those at one
/// cafe. Runs inside the caller's transaction; each affected barista is
/// told why.
pub(crate) fn cascade_cancel_future(
    conn: &Connection,
    user_id: i64,
    cafe_id: Option<i64>,
    now: NaiveDateTime,
    reason: &str,
) -> Result<Vec<BookingDetail>, ShiftError> {
    let affected: Vec<BookingDetail> = {
        let mut stmt = conn.prepare_cached(&format!(
            "{BOOKING_DETAIL_SELECT}
             WHERE b.barista_id = ?1 AND b.status IN ('booked', 'confirmed_work')
               AND s.start_time > ?2 AND (?3 IS NULL OR s.cafe_id = ?3)
             ORDER BY s.start_time, b.id"
        ))?;
        let rows = stmt.query_map(rusqlite::params![user_id, now, cafe_id], read_booking_detail)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    let mut canceled = Vec::with_capacity(affected.len());
    for detail in affected {
        transition(conn, detail.booking.id, detail.booking.status, BookingStatus::Canceled)?;
        let detail = allocation::get_booking_detail(conn, detail.booking.id)?;
        let mut payload = booking_payload(&detail);
        payload["reason"] = json!(reason);
        outbox::enqueue(conn, user_id, MessageKind::BookingCanceled, payload)?;
        canceled.push(detail);
    }
    if !canceled.is_empty() {
        tracing::info!(user = user_id, count = canceled.len(), reason, "future bookings canceled");
    }
    Ok(canceled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeDelta};

    fn at(day: u32, hour: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, day)
            .unwrap()
            .and_hms_opt(hour, min, 0)
            .unwrap()
    }

    fn rules() -> Rules {
        Rules::default()
    }

    /// Admin 1, manager 2 of cafe 1, baristas 3 and 4; slot 1 on the 20th 09:00-13:00.
    fn setup() -> Connection {
        let conn = db::open_memory().unwrap();
        conn.execute_batch(
            "INSERT INTO cafes (id, name, address) VALUES (1, 'North', 'a');
             INSERT INTO users (id, telegram_id, display_name, role) VALUES (1, 10, 'Ada', 'admin');
             INSERT INTO users (id, telegram_id, display_name, role, cafe_id) VALUES (2, 20, 'Max', 'manager', 1);
             INSERT INTO users (id, telegram_id, display_name, role, cafe_id) VALUES (3, 30, 'Bea', 'barista', 1);
             INSERT INTO users (id, telegram_id, display_name, role, cafe_id) VALUES (4, 40, 'Cid', 'barista', 1);
             UPDATE cafes SET manager_id = 2 WHERE id = 1;
             INSERT INTO slots (id, cafe_id, start_time, end_time, required_capacity)
                 VALUES (1, 1, '2026-10-20 09:00:00', '2026-10-20 13:00:00', 2);",
        )
        .unwrap();
        conn
    }

    fn book(conn: &Connection, barista: i64) -> i64 {
        allocation::claim_slot(conn, &rules(), barista, 1, at(19, 8, 0))
            .unwrap()
            .id
    }

    fn status(conn: &Connection, booking: i64) -> BookingStatus {
        allocation::get_booking(conn, booking).unwrap().status
    }

    fn kinds_for(conn: &Connection, user: i64) -> Vec<MessageKind> {
        outbox::list(conn, true)
            .unwrap()
            .into_iter()
            .filter(|n| n.user_id == user)
            .map(|n| n.kind)
            .collect()
    }

    #[test]
    fn confirm_inside_window() {
        let conn = setup();
        let b = book(&conn, 3);
        let booking = confirm_going(&conn, &rules(), 3, b, at(20, 8, 30)).unwrap();
        assert_eq!(booking.status, BookingStatus::ConfirmedWork);
        assert!(matches!(
            confirm_going(&conn, &rules(), 3, b, at(20, 8, 40)),
            Err(ShiftError::InvalidTransition(_))
        ));
        assert!(kinds_for(&conn, 2).contains(&MessageKind::BookingConfirmed));
    }

    #[test]
    fn confirm_window_edges() {
        let conn = setup();
        let b = book(&conn, 3);
        let too_early = at(20, 9, 0) - TimeDelta::hours(24) - TimeDelta::minutes(1);
        match confirm_going(&conn, &rules(), 3, b, too_early).unwrap_err() {
            ShiftError::OutOfWindow { opens, closes } => {
                assert_eq!(opens, at(19, 9, 0));
                assert_eq!(closes, at(20, 10, 0));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            confirm_going(&conn, &rules(), 3, b, at(20, 10, 1)),
            Err(ShiftError::OutOfWindow { .. })
        ));
        assert!(confirm_going(&conn, &rules(), 3, b, at(20, 10, 0)).is_ok());
    }

    #[test]
    fn only_the_owner_confirms() {
        let conn = setup();
        let b = book(&conn, 3);
        assert!(matches!(
            confirm_going(&conn, &rules(), 4, b, at(20, 8, 30)),
            Err(ShiftError::Forbidden(_))
        ));
    }

    #[test]
    fn owner_cancel_notifies_staff() {
        let conn = setup();
        let b = book(&conn, 3);
        let booking = cancel(&conn, &rules(), 3, b, at(19, 9, 0)).unwrap();
        assert_eq!(booking.status, BookingStatus::Canceled);
        assert!(kinds_for(&conn, 2).contains(&MessageKind::BookingCanceled));
        assert!(matches!(
            cancel(&conn, &rules(), 3, b, at(19, 9, 0)),
            Err(ShiftError::InvalidTransition(_))
        ));
    }

    #[test]
    fn other_baristas_cannot_cancel() {
        let conn = setup();
        let b = book(&conn, 3);
        assert!(matches!(
            cancel(&conn, &rules(), 4, b, at(19, 9, 0)),
            Err(ShiftError::Forbidden(_))
        ));
        cancel(&conn, &rules(), 2, b, at(19, 9, 0)).unwrap();
        assert!(kinds_for(&conn, 3).contains(&MessageKind::BookingCanceled));
    }

    #[test]
    fn late_cancel_of_confirmed_shift_is_flagged() {
        let conn = setup();
        let b = book(&conn, 3);
        confirm_going(&conn, &rules(), 3, b, at(20, 7, 0)).unwrap();
        cancel(&conn, &rules(), 3, b, at(20, 7, 30)).unwrap();
        assert!(kinds_for(&conn, 2).contains(&MessageKind::LateCancellation));
    }

    #[test]
    fn confirmed_shift_cannot_be_canceled_after_start() {
        let conn = setup();
        let b = book(&conn, 3);
        confirm_going(&conn, &rules(), 3, b, at(20, 8, 0)).unwrap();
        assert!(matches!(
            cancel(&conn, &rules(), 2, b, at(20, 9, 30)),
            Err(ShiftError::InvalidTransition(_))
        ));
        assert_eq!(status(&conn, b), BookingStatus::ConfirmedWork);
    }

    #[test]
    fn complete_requires_confirmation_and_staff() {
        let conn = setup();
        let b = book(&conn, 3);
        assert!(matches!(
            complete(&conn, 2, b),
            Err(ShiftError::InvalidTransition(_))
        ));
        confirm_going(&conn, &rules(), 3, b, at(20, 8, 0)).unwrap();
        assert!(matches!(complete(&conn, 3, b), Err(ShiftError::Forbidden(_))));
        assert_eq!(complete(&conn, 2, b).unwrap().status, BookingStatus::Completed);
        assert!(kinds_for(&conn, 3).contains(&MessageKind::BookingCompleted));
    }

    #[test]
    fn no_show_waits_for_end_of_shift() {
        let conn = setup();
        let b = book(&conn, 3);
        assert!(!mark_no_show(&conn, b, at(20, 12, 59)).unwrap());
        assert_eq!(status(&conn, b), BookingStatus::Booked);
        assert!(mark_no_show(&conn, b, at(20, 13, 0)).unwrap());
        assert_eq!(status(&conn, b), BookingStatus::NoShow);
        assert!(!mark_no_show(&conn, b, at(20, 14, 0)).unwrap());
        assert!(kinds_for(&conn, 2).contains(&MessageKind::NoShow));
    }

    #[test]
    fn no_show_sweep_is_idempotent() {
        let conn = setup();
        let missed = book(&conn, 3);
        let confirmed = book(&conn, 4);
        confirm_going(&conn, &rules(), 4, confirmed, at(20, 8, 0)).unwrap();

        let first = mark_no_show_sweep(&conn, at(20, 14, 0)).unwrap();
        assert_eq!(first.changed, 1);
        let second = mark_no_show_sweep(&conn, at(20, 14, 0)).unwrap();
        assert_eq!(second, SweepReport::default());
        assert_eq!(status(&conn, missed), BookingStatus::NoShow);
        assert_eq!(status(&conn, confirmed), BookingStatus::ConfirmedWork);
    }

    #[test]
    fn completion_sweep_closes_confirmed_shifts() {
        let conn = setup();
        let b = book(&conn, 3);
        confirm_going(&conn, &rules(), 3, b, at(20, 8, 0)).unwrap();
        assert_eq!(completion_sweep(&conn, at(20, 12, 0)).unwrap().changed, 0);
        assert_eq!(completion_sweep(&conn, at(20, 13, 0)).unwrap().changed, 1);
        assert_eq!(status(&conn, b), BookingStatus::Completed);
    }

    #[test]
    fn reminders_go_out_once() {
        let conn = setup();
        book(&conn, 3);
        let first = daily_reminder_sweep(&conn, &rules(), at(19, 10, 0)).unwrap();
        assert_eq!(first.changed, 1);
        let second = daily_reminder_sweep(&conn, &rules(), at(19, 11, 0)).unwrap();
        assert_eq!(second.changed, 0);
        let reminders = kinds_for(&conn, 3)
            .into_iter()
            .filter(|k| *k == MessageKind::ShiftReminder)
            .count();
        assert_eq!(reminders, 1);
    }

    #[test]
    fn reminders_ignore_shifts_beyond_the_horizon() {
        let conn = setup();
        book(&conn, 3);
        let report = daily_reminder_sweep(&conn, &rules(), at(19, 8, 0)).unwrap();
        assert_eq!(report.examined, 0);
    }

    #[test]
    fn cascade_only_touches_future_bookings_at_the_cafe() {
        let conn = setup();
        conn.execute_batch(
            "INSERT INTO cafes (id, name, address) VALUES (2, 'South', 'b');
             INSERT INTO slots (id, cafe_id, start_time, end_time)
                 VALUES (2, 2, '2026-10-21 09:00:00', '2026-10-21 13:00:00');",
        )
        .unwrap();
        let north = book(&conn, 3);
        let south = allocation::claim_slot(&conn, &rules(), 3, 2, at(19, 8, 0))
            .unwrap()
            .id;

        let canceled = db::immediate(&conn, |conn| {
            cascade_cancel_future(conn, 3, Some(1), at(19, 9, 0), "moved")
        })
        .unwrap();
        assert_eq!(canceled.len(), 1);
        assert_eq!(status(&conn, north), BookingStatus::Canceled);
        assert_eq!(status(&conn, south), BookingStatus::Booked);
    }
}
