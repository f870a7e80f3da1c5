use chrono::NaiveDateTime;
use rusqlite::ErrorCode;
use serde::Serialize;
use thiserror::Error;

/// Typed failures returned by every core operation.
#[derive(Debug, Error)]
pub enum ShiftError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("slot {0} not found")]
    SlotNotFound(i64),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("slot {0} is full; refresh availability and pick another slot")]
    SlotFull(i64),

    #[error("slot {slot} is already booked by this barista")]
    DuplicateBooking { slot: i64 },

    #[error("shift overlaps booking {conflicting} ({start} - {end})")]
    OverlappingShift {
        conflicting: i64,
        start: NaiveDateTime,
        end: NaiveDateTime,
    },

    #[error(
        "only {gap_minutes} minutes of rest next to booking {conflicting} at another cafe; \
         {required_minutes} required"
    )]
    InsufficientRestGap {
        conflicting: i64,
        gap_minutes: i64,
        required_minutes: i64,
    },

    #[error("invalid time range: {0}")]
    InvalidTimeRange(String),

    #[error("slot start {0} has already passed")]
    PastSlot(NaiveDateTime),

    #[error("confirmation is only possible between {opens} and {closes}")]
    OutOfWindow {
        opens: NaiveDateTime,
        closes: NaiveDateTime,
    },

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0} already exists")]
    Duplicate(String),

    #[error("store unavailable, try again")]
    StoreUnavailable(#[source] rusqlite::Error),

    #[error("database error: {0}")]
    Store(#[source] rusqlite::Error),
}

/// Stable, render-friendly classification of a [`ShiftError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    InvalidTransition,
    SlotFull,
    DuplicateBooking,
    OverlappingShift,
    InsufficientRestGap,
    InvalidTimeRange,
    PastSlot,
    OutOfWindow,
    InvalidInput,
    Duplicate,
    StoreUnavailable,
    Internal,
}

impl ShiftError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } | Self::SlotNotFound(_) => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::InvalidTransition(_) => ErrorKind::InvalidTransition,
            Self::SlotFull(_) => ErrorKind::SlotFull,
            Self::DuplicateBooking { .. } => ErrorKind::DuplicateBooking,
            Self::OverlappingShift { .. } => ErrorKind::OverlappingShift,
            Self::InsufficientRestGap { .. } => ErrorKind::InsufficientRestGap,
            Self::InvalidTimeRange(_) => ErrorKind::InvalidTimeRange,
            Self::PastSlot(_) => ErrorKind::PastSlot,
            Self::OutOfWindow { .. } => ErrorKind::OutOfWindow,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Duplicate(_) => ErrorKind::Duplicate,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::Store(_) => ErrorKind::Internal,
        }
    }

    /// Busy or locked store; worth one more attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    pub(crate) fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }
}

impl From<rusqlite::Error> for ShiftError {
    fn from(value: rusqlite::Error) -> Self {
        match value.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                Self::StoreUnavailable(value)
            }
            _ => Self::Store(value),
        }
    }
}
