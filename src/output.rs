use chrono::NaiveDateTime;

use crate::model::{BookingDetail, Cafe, Slot, SlotOccupancy, User};
use crate::outbox::Notification;

fn span(start: NaiveDateTime, end: NaiveDateTime) -> String {
    if start.date() == end.date() {
        format!("{} {}-{}", start.format("%Y-%m-%d"), start.format("%H:%M"), end.format("%H:%M"))
    } else {
        format!("{} - {}", start.format("%Y-%m-%d %H:%M"), end.format("%Y-%m-%d %H:%M"))
    }
}

pub fn format_cafe_list(cafes: &[Cafe]) -> String {
    let mut out = String::new();
    for cafe in cafes {
        let hours = match (cafe.opening_time, cafe.closing_time) {
            (Some(open), Some(close)) => {
                format!("{}-{}", open.format("%H:%M"), close.format("%H:%M"))
            }
            _ => "24h".to_string(),
        };
        let manager = cafe
            .manager_id
            .map(|id| format!(" (manager: {id})"))
            .unwrap_or_default();
        let inactive = if cafe.active { "" } else { " [inactive]" };
        out.push_str(&format!(
            "{:>4} {}  {}  {}{}{}\n",
            cafe.id, cafe.name, cafe.address, hours, manager, inactive
        ));
    }
    out
}

pub fn format_user_list(users: &[User]) -> String {
    let mut out = String::new();
    for user in users {
        let cafe = match (user.cafe_id, user.requested_cafe_id) {
            (Some(id), _) => format!(" @{id}"),
            (None, Some(id)) => format!(" (wants {id})"),
            (None, None) => String::new(),
        };
        let phone = user
            .phone
            .as_ref()
            .map(|p| format!("  {p}"))
            .unwrap_or_default();
        let inactive = if user.active { "" } else { " [inactive]" };
        out.push_str(&format!(
            "{:>4} {:<8} {}{}{}{}\n",
            user.id, user.role, user.display_name, cafe, phone, inactive
        ));
    }
    out
}

pub fn format_slot_list(slots: &[Slot]) -> String {
    let mut out = String::new();
    for slot in slots {
        out.push_str(&format!(
            "{:>4} {}  capacity {}\n",
            slot.id,
            span(slot.start_time, slot.end_time),
            slot.required_capacity
        ));
    }
    out
}

pub fn format_occupancy(rows: &[SlotOccupancy]) -> String {
    let mut out = String::new();
    for row in rows {
        let marker = if row.is_full() { "full" } else { "open" };
        let names = if row.baristas.is_empty() {
            String::new()
        } else {
            format!("  {}", row.baristas.join(", "))
        };
        out.push_str(&format!(
            "{:>4} {}  {}/{} {}{}\n",
            row.slot.id,
            span(row.slot.start_time, row.slot.end_time),
            row.booked,
            row.slot.required_capacity,
            marker,
            names
        ));
    }
    out
}

pub fn format_bookings(bookings: &[BookingDetail]) -> String {
    let mut out = String::new();
    for b in bookings {
        out.push_str(&format!(
            "{} {:>4} {}  {}  ({})\n",
            b.booking.status.icon(),
            b.booking.id,
            span(b.start_time, b.end_time),
            b.cafe_name,
            b.booking.status
        ));
    }
    out
}

pub fn format_notifications(notifications: &[Notification]) -> String {
    let mut out = String::new();
    for n in notifications {
        let state = match (&n.delivered_at, &n.last_error) {
            (Some(at), _) => format!("delivered {at}"),
            (None, Some(err)) => format!("pending, {} attempts: {err}", n.attempts),
            (None, None) => "pending".to_string(),
        };
        out.push_str(&format!(
            "[{}] user {} {} {}  ({})\n",
            n.created_at, n.user_id, n.kind, n.payload, state
        ));
    }
    out
}
