use std::fmt;

use chrono::{NaiveDateTime, NaiveTime};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::Serialize;

use crate::error::ShiftError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Barista,
    Pending,
}

impl Role {
    pub fn parse(s: &str) -> Result<Self, ShiftError> {
        match s {
            "admin" => Ok(Self::Admin),
            "manager" => Ok(Self::Manager),
            "barista" => Ok(Self::Barista),
            "pending" => Ok(Self::Pending),
            _ => Err(ShiftError::InvalidInput(format!(
                "invalid role '{s}': must be admin, manager, barista, or pending"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Manager => "manager",
            Self::Barista => "barista",
            Self::Pending => "pending",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Role::parse(s).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Booked,
    ConfirmedWork,
    Completed,
    Canceled,
    NoShow,
}

impl BookingStatus {
    pub fn parse(s: &str) -> Result<Self, ShiftError> {
        match s {
            "booked" => Ok(Self::Booked),
            "confirmed_work" => Ok(Self::ConfirmedWork),
            "completed" => Ok(Self::Completed),
            "canceled" => Ok(Self::Canceled),
            "no_show" => Ok(Self::NoShow),
            _ => Err(ShiftError::InvalidInput(format!(
                "invalid booking status '{s}'"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Booked => "booked",
            Self::ConfirmedWork => "confirmed_work",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::NoShow => "no_show",
        }
    }

    /// Booked and confirmed bookings hold a place on their slot.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Booked | Self::ConfirmedWork)
    }

    /// Returns display icon: .=booked, *=confirmed, x=completed, -=canceled, !=no-show
    pub fn icon(self) -> &'static str {
        match self {
            Self::Booked => ".",
            Self::ConfirmedWork => "*",
            Self::Completed => "x",
            Self::Canceled => "-",
            Self::NoShow => "!",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for BookingStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for BookingStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        BookingStatus::parse(s).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Cafe {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub phone: Option<String>,
    pub description: String,
    /// Both hours absent means the cafe is open around the clock.
    pub opening_time: Option<NaiveTime>,
    pub closing_time: Option<NaiveTime>,
    pub manager_id: Option<i64>,
    pub active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub telegram_id: i64,
    pub display_name: String,
    pub phone: Option<String>,
    pub role: Role,
    /// Home cafe for baristas, managed cafe for managers.
    pub cafe_id: Option<i64>,
    /// Cafe asked for in a pending registration.
    pub requested_cafe_id: Option<i64>,
    pub active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Slot {
    pub id: i64,
    pub cafe_id: i64,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub required_capacity: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Booking {
    pub id: i64,
    pub barista_id: i64,
    pub slot_id: i64,
    pub status: BookingStatus,
    pub reminded_at: Option<NaiveDateTime>,
    pub created_at: String,
    pub updated_at: String,
}

/// A booking joined with the slot and cafe it belongs to.
#[derive(Debug, Clone, Serialize)]
pub struct BookingDetail {
    #[serde(flatten)]
    pub booking: Booking,
    pub cafe_id: i64,
    pub cafe_name: String,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotOccupancy {
    #[serde(flatten)]
    pub slot: Slot,
    pub booked: i64,
    pub baristas: Vec<String>,
}

impl SlotOccupancy {
    pub fn is_full(&self) -> bool {
        self.booked >= self.slot.required_capacity
    }
}
