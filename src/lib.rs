//! Shift booking for a chain of cafes: cafes and staff, bookable shift
//! slots, race-free claims, and the booking lifecycle that follows.

pub mod allocation;
pub mod auth;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod outbox;
pub mod output;
pub mod validate;
pub mod watch;

pub use error::{ErrorKind, ShiftError};
