use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use rusqlite::Connection;

use crate::error::ShiftError;

/// An active booking reduced to what the allocation rules look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shift {
    pub booking_id: i64,
    pub cafe_id: i64,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Shift {
    /// Half-open interval overlap: back-to-back shifts do not overlap.
    pub fn overlaps(&self, start: NaiveDateTime, end: NaiveDateTime) -> bool {
        self.start < end && start < self.end
    }

    /// Calendar days touched by the shift; a shift ending exactly at midnight
    /// does not touch the following day.
    fn days(&self) -> (NaiveDate, NaiveDate) {
        let last = if self.end.time() == NaiveTime::MIN && self.end > self.start {
            (self.end - TimeDelta::seconds(1)).date()
        } else {
            self.end.date()
        };
        (self.start.date(), last)
    }

    pub fn shares_day_with(&self, other: &Shift) -> bool {
        let (a_first, a_last) = self.days();
        let (b_first, b_last) = other.days();
        a_first <= b_last && b_first <= a_last
    }

    /// Idle time between two non-overlapping shifts, whichever comes first.
    pub fn gap_to(&self, other: &Shift) -> TimeDelta {
        if self.end <= other.start {
            other.start - self.end
        } else {
            self.start - other.end
        }
    }
}

/// Check that a candidate shift fits next to the barista's existing active
/// shifts: no overlap at all, and at least `min_rest` between same-day shifts
/// at different cafes.
pub fn check_shift_fits(
    candidate: &Shift,
    existing: &[Shift],
    min_rest: TimeDelta,
) -> Result<(), ShiftError> {
    if let Some(clash) = existing
        .iter()
        .find(|s| s.overlaps(candidate.start, candidate.end))
    {
        return Err(ShiftError::OverlappingShift {
            conflicting: clash.booking_id,
            start: clash.start,
            end: clash.end,
        });
    }
    for other in existing {
        if other.cafe_id == candidate.cafe_id || !other.shares_day_with(candidate) {
            continue;
        }
        let gap = other.gap_to(candidate);
        if gap < min_rest {
            return Err(ShiftError::InsufficientRestGap {
                conflicting: other.booking_id,
                gap_minutes: gap.num_minutes(),
                required_minutes: min_rest.num_minutes(),
            });
        }
    }
    Ok(())
}

/// Load the barista's active shifts, optionally leaving one slot out.
pub fn active_shifts(
    conn: &Connection,
    barista_id: i64,
    excluding_slot: Option<i64>,
) -> Result<Vec<Shift>, ShiftError> {
    let mut stmt = conn.prepare_cached(
        "SELECT b.id, s.cafe_id, s.start_time, s.end_time FROM bookings b
         JOIN slots s ON s.id = b.slot_id
         WHERE b.barista_id = ?1 AND b.status IN ('booked', 'confirmed_work')
           AND s.id IS NOT ?2
         ORDER BY s.start_time",
    )?;
    let rows = stmt.query_map(rusqlite::params![barista_id, excluding_slot], |row| {
        Ok(Shift {
            booking_id: row.get(0)?,
            cafe_id: row.get(1)?,
            start: row.get(2)?,
            end: row.get(3)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Into::into)
}

pub fn check_time_range(start: NaiveDateTime, end: NaiveDateTime) -> Result<(), ShiftError> {
    if start >= end {
        return Err(ShiftError::InvalidTimeRange(format!(
            "start {start} must be before end {end}"
        )));
    }
    Ok(())
}

/// The opening period a shift starting at `start` falls in. Hours that wrap
/// past midnight open on one day and close on the next; a start before
/// opening time belongs to the period that opened the evening before.
fn opening_period(
    start: NaiveDateTime,
    open: NaiveTime,
    close: NaiveTime,
) -> Option<(NaiveDateTime, NaiveDateTime)> {
    if open < close {
        let day = start.date();
        return Some((day.and_time(open), day.and_time(close)));
    }
    let day = if start.time() >= open {
        start.date()
    } else {
        start.date().pred_opt()?
    };
    Some((day.and_time(open), day.succ_opt()?.and_time(close)))
}

/// A slot must sit inside a single opening period when both hours are set.
pub fn check_opening_hours(
    start: NaiveDateTime,
    end: NaiveDateTime,
    opening: Option<NaiveTime>,
    closing: Option<NaiveTime>,
) -> Result<(), ShiftError> {
    let (Some(open), Some(close)) = (opening, closing) else {
        return Ok(());
    };
    let within = opening_period(start, open, close)
        .is_some_and(|(opens, closes)| opens <= start && end <= closes);
    if !within {
        return Err(ShiftError::InvalidTimeRange(format!(
            "{start} - {end} is outside opening hours {} - {}",
            open.format("%H:%M"),
            close.format("%H:%M")
        )));
    }
    Ok(())
}

pub fn validate_capacity(capacity: i64) -> Result<(), ShiftError> {
    if capacity < 1 {
        return Err(ShiftError::InvalidInput(format!(
            "required capacity must be at least 1, got {capacity}"
        )));
    }
    Ok(())
}

/// Validate a display or cafe name: non-empty after trimming.
pub fn validate_name(what: &str, name: &str) -> Result<(), ShiftError> {
    if name.trim().is_empty() {
        return Err(ShiftError::InvalidInput(format!("{what} must not be empty")));
    }
    Ok(())
}

/// Validate a phone number: optional leading '+', then 7 to 15 digits.
pub fn validate_phone(phone: &str) -> Result<(), ShiftError> {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    if !(7..=15).contains(&digits.len()) || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ShiftError::InvalidInput(format!(
            "phone '{phone}' must be 7 to 15 digits with an optional leading '+'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(day: u32, hour: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, day)
            .unwrap()
            .and_hms_opt(hour, min, 0)
            .unwrap()
    }

    fn shift(id: i64, cafe: i64, start: NaiveDateTime, end: NaiveDateTime) -> Shift {
        Shift {
            booking_id: id,
            cafe_id: cafe,
            start,
            end,
        }
    }

    #[test]
    fn back_to_back_shifts_do_not_overlap() {
        let s = shift(1, 1, at(20, 9, 0), at(20, 13, 0));
        assert!(!s.overlaps(at(20, 13, 0), at(20, 17, 0)));
        assert!(s.overlaps(at(20, 12, 59), at(20, 17, 0)));
    }

    #[test]
    fn overlap_is_rejected_even_at_the_same_cafe() {
        let existing = [shift(1, 1, at(20, 9, 0), at(20, 13, 0))];
        let candidate = shift(0, 1, at(20, 12, 0), at(20, 16, 0));
        let err = check_shift_fits(&candidate, &existing, TimeDelta::minutes(60)).unwrap_err();
        assert!(matches!(err, ShiftError::OverlappingShift { conflicting: 1, .. }));
    }

    #[test]
    fn short_gap_at_another_cafe_is_rejected() {
        let existing = [shift(1, 1, at(20, 9, 0), at(20, 13, 0))];
        let candidate = shift(0, 2, at(20, 13, 20), at(20, 17, 0));
        let err = check_shift_fits(&candidate, &existing, TimeDelta::minutes(60)).unwrap_err();
        match err {
            ShiftError::InsufficientRestGap {
                gap_minutes,
                required_minutes,
                ..
            } => {
                assert_eq!(gap_minutes, 20);
                assert_eq!(required_minutes, 60);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn gap_is_measured_in_both_orders() {
        let existing = [shift(1, 1, at(20, 14, 0), at(20, 18, 0))];
        let candidate = shift(0, 2, at(20, 9, 0), at(20, 13, 30));
        assert!(check_shift_fits(&candidate, &existing, TimeDelta::minutes(60)).is_err());
        let candidate = shift(0, 2, at(20, 9, 0), at(20, 13, 0));
        assert!(check_shift_fits(&candidate, &existing, TimeDelta::minutes(60)).is_ok());
    }

    #[test]
    fn short_gap_at_the_same_cafe_is_allowed() {
        let existing = [shift(1, 1, at(20, 9, 0), at(20, 13, 0))];
        let candidate = shift(0, 1, at(20, 13, 0), at(20, 17, 0));
        assert!(check_shift_fits(&candidate, &existing, TimeDelta::minutes(60)).is_ok());
    }

    #[test]
    fn different_days_skip_the_rest_rule() {
        let existing = [shift(1, 1, at(20, 9, 0), at(20, 13, 0))];
        let candidate = shift(0, 2, at(21, 13, 10), at(21, 17, 0));
        assert!(check_shift_fits(&candidate, &existing, TimeDelta::minutes(60)).is_ok());
    }

    #[test]
    fn overnight_shift_shares_the_next_day() {
        let night = shift(1, 1, at(20, 22, 0), at(21, 2, 0));
        let morning = shift(0, 2, at(21, 2, 30), at(21, 8, 0));
        assert!(night.shares_day_with(&morning));
        let until_midnight = shift(2, 1, at(20, 20, 0), at(21, 0, 0));
        assert!(!until_midnight.shares_day_with(&morning));
    }

    #[test]
    fn time_range_must_be_forward() {
        assert!(check_time_range(at(20, 9, 0), at(20, 9, 0)).is_err());
        assert!(check_time_range(at(20, 10, 0), at(20, 9, 0)).is_err());
        assert!(check_time_range(at(20, 9, 0), at(20, 10, 0)).is_ok());
    }

    #[test]
    fn opening_hours() {
        let open = NaiveTime::from_hms_opt(8, 0, 0);
        let close = NaiveTime::from_hms_opt(20, 0, 0);
        assert!(check_opening_hours(at(20, 9, 0), at(20, 13, 0), open, close).is_ok());
        assert!(check_opening_hours(at(20, 7, 0), at(20, 13, 0), open, close).is_err());
        assert!(check_opening_hours(at(20, 7, 0), at(20, 13, 0), None, close).is_ok());

        let late_open = NaiveTime::from_hms_opt(18, 0, 0);
        let late_close = NaiveTime::from_hms_opt(2, 0, 0);
        assert!(check_opening_hours(at(20, 22, 0), at(21, 1, 0), late_open, late_close).is_ok());
        assert!(check_opening_hours(at(20, 12, 0), at(20, 16, 0), late_open, late_close).is_err());
        assert!(check_opening_hours(at(21, 0, 30), at(21, 2, 0), late_open, late_close).is_ok());
        // Starts and ends inside opening hours but spans the closed afternoon.
        assert!(check_opening_hours(at(20, 1, 0), at(20, 23, 0), late_open, late_close).is_err());
        assert!(check_opening_hours(at(20, 19, 0), at(21, 19, 0), late_open, late_close).is_err());
        assert!(check_opening_hours(at(20, 9, 0), at(21, 9, 0), open, close).is_err());
    }

    #[test]
    fn names_and_phones() {
        assert!(validate_name("cafe name", "North").is_ok());
        assert!(validate_name("cafe name", "   ").is_err());
        assert!(validate_phone("+79991234567").is_ok());
        assert!(validate_phone("1234567").is_ok());
        assert!(validate_phone("12-34").is_err());
        assert!(validate_phone("+").is_err());
    }

    #[test]
    fn capacity_must_be_positive() {
        assert!(validate_capacity(1).is_ok());
        assert!(validate_capacity(0).is_err());
    }
}
