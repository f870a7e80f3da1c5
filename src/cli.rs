use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use clap::{Parser, Subcommand};

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

pub fn parse_datetime(s: &str) -> Result<NaiveDateTime, String> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .ok_or_else(|| format!("'{s}' is not a date and time like 2026-10-20 09:00"))
}

pub fn parse_time(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|_| format!("'{s}' is not a time like 08:30"))
}

pub fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| format!("'{s}' is not a date like 2026-10-20"))
}

#[derive(Parser)]
#[command(name = "shiftbook", about = "Shift booking for a chain of cafes")]
pub struct Cli {
    /// Path to the SQLite database [default: ~/.shiftbook/shiftbook.db]
    #[arg(long, env = "SHIFTBOOK_DB", global = true)]
    pub db: Option<String>,

    /// Path to the config file [default: ~/.shiftbook/config.toml]
    #[arg(long, env = "SHIFTBOOK_CONFIG", global = true)]
    pub config: Option<String>,

    /// Telegram id of the user issuing the command
    #[arg(long = "as", env = "SHIFTBOOK_ACTOR", global = true)]
    pub actor: Option<i64>,

    /// Pretend the current time is this (e.g. "2026-10-20 08:30")
    #[arg(long, global = true, value_parser = parse_datetime)]
    pub now: Option<NaiveDateTime>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create database and tables (idempotent)
    Init,

    /// First contact: create the account for --as if it does not exist
    Start {
        /// Display name
        #[arg(long)]
        name: String,
    },

    /// Ask to join a cafe as a barista
    Register {
        /// Display name
        name: String,
        /// Cafe id or name
        #[arg(long)]
        cafe: String,
        /// Phone number
        #[arg(long)]
        phone: Option<String>,
    },

    /// Manage cafes
    Cafe {
        #[command(subcommand)]
        command: CafeCommand,
    },

    /// Manage user accounts
    User {
        #[command(subcommand)]
        command: UserCommand,
    },

    /// Manage shift slots
    Slot {
        #[command(subcommand)]
        command: SlotCommand,
    },

    /// Claim a place on a slot
    Claim {
        /// Slot id
        slot: i64,
    },

    /// Give a booking back
    Release {
        /// Booking id
        booking: i64,
    },

    /// Confirm you are coming to a booked shift
    Confirm {
        /// Booking id
        booking: i64,
    },

    /// Mark a confirmed shift as worked
    Complete {
        /// Booking id
        booking: i64,
    },

    /// Cancel a booking
    Cancel {
        /// Booking id
        booking: i64,
    },

    /// List your upcoming bookings
    Bookings,

    /// Run one scheduled sweep now
    Sweep {
        #[command(subcommand)]
        command: SweepCommand,
    },

    /// Run the scheduled sweeps at their configured intervals
    Jobs {
        /// Run every sweep once and exit
        #[arg(long)]
        once: bool,
    },

    /// Inspect or deliver queued notifications
    Outbox {
        #[command(subcommand)]
        command: OutboxCommand,
    },

    /// Block until the database changes (e.g. after a full slot)
    Wait {
        /// Timeout in seconds
        #[arg(long, default_value = "60")]
        timeout: u64,
    },
}

#[derive(Subcommand)]
pub enum CafeCommand {
    /// Add a cafe
    Add {
        /// Cafe name (unique, case-insensitive)
        name: String,
        #[arg(long)]
        address: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(short, long, default_value = "")]
        desc: String,
        /// Opening time (HH:MM); omit both hours for a 24h cafe
        #[arg(long, value_parser = parse_time)]
        opens: Option<NaiveTime>,
        /// Closing time (HH:MM)
        #[arg(long, value_parser = parse_time)]
        closes: Option<NaiveTime>,
    },

    /// Change a cafe's name, address, phone or description
    Edit {
        cafe: i64,
        /// New name (unique, case-insensitive)
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        address: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(short, long)]
        desc: Option<String>,
    },

    /// List cafes
    List {
        /// Include deactivated cafes
        #[arg(long)]
        all: bool,
    },

    /// Set opening hours (omit both to open around the clock)
    Hours {
        cafe: i64,
        #[arg(long, value_parser = parse_time)]
        opens: Option<NaiveTime>,
        #[arg(long, value_parser = parse_time)]
        closes: Option<NaiveTime>,
    },

    /// Accept new slots and bookings again
    Activate { cafe: i64 },

    /// Stop new slots and bookings
    Deactivate { cafe: i64 },

    /// Put a user in charge of a cafe
    SetManager {
        cafe: i64,
        /// User id
        user: i64,
    },
}

#[derive(Subcommand)]
pub enum UserCommand {
    /// List users you may see
    List,

    /// Create an account directly
    Add {
        /// Telegram id of the new user
        telegram_id: i64,
        /// Display name
        name: String,
        /// admin, manager, or barista
        #[arg(long)]
        role: String,
        /// Cafe id (managers and baristas)
        #[arg(long)]
        cafe: Option<i64>,
        #[arg(long)]
        phone: Option<String>,
    },

    /// Change a user's display name or phone
    Edit {
        user: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        phone: Option<String>,
    },

    /// List registrations waiting for approval
    Pending,

    /// Approve a registration
    Approve { user: i64 },

    /// Reject a registration
    Reject { user: i64 },

    /// Change a user's role and cafe
    Reassign {
        user: i64,
        /// admin, manager, or barista
        #[arg(long)]
        role: String,
        /// Cafe id
        #[arg(long)]
        cafe: Option<i64>,
    },

    /// Reactivate an account
    Activate { user: i64 },

    /// Deactivate an account
    Deactivate { user: i64 },
}

#[derive(Subcommand)]
pub enum SlotCommand {
    /// Create a slot
    Add {
        cafe: i64,
        #[arg(value_parser = parse_datetime)]
        start: NaiveDateTime,
        #[arg(value_parser = parse_datetime)]
        end: NaiveDateTime,
        #[arg(short, long, default_value = "1")]
        capacity: i64,
    },

    /// List slots with free places
    List {
        cafe: i64,
        /// Start of range [default: now]
        #[arg(long, value_parser = parse_datetime)]
        from: Option<NaiveDateTime>,
        /// End of range [default: a week after --from]
        #[arg(long, value_parser = parse_datetime)]
        to: Option<NaiveDateTime>,
    },

    /// Correct a slot's window or capacity
    Correct {
        slot: i64,
        #[arg(value_parser = parse_datetime)]
        start: NaiveDateTime,
        #[arg(value_parser = parse_datetime)]
        end: NaiveDateTime,
        #[arg(short, long, default_value = "1")]
        capacity: i64,
    },

    /// Show who holds each slot on a day
    Occupancy {
        cafe: i64,
        /// Day [default: today]
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
    },
}

#[derive(Subcommand)]
pub enum SweepCommand {
    /// Mark unconfirmed, finished shifts as no-shows
    NoShow,
    /// Complete confirmed, finished shifts
    Complete,
    /// Remind baristas of upcoming shifts
    Remind,
}

#[derive(Subcommand)]
pub enum OutboxCommand {
    /// List notifications
    List {
        /// Include delivered notifications
        #[arg(long)]
        all: bool,
    },
    /// Deliver pending notifications
    Flush,
    /// Delete delivered and abandoned notifications
    Prune {
        /// Keep rows created within this many days
        #[arg(long, default_value = "30")]
        days: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn datetimes_accept_space_or_t() {
        let a = parse_datetime("2026-10-20 09:00").unwrap();
        let b = parse_datetime("2026-10-20T09:00:00").unwrap();
        assert_eq!(a, b);
        assert!(parse_datetime("tomorrow").is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "shiftbook",
            "claim",
            "7",
            "--as",
            "42",
            "--now",
            "2026-10-20 08:00",
        ])
        .unwrap();
        assert_eq!(cli.actor, Some(42));
        assert!(matches!(cli.command, Command::Claim { slot: 7 }));
    }

    #[test]
    fn user_add_takes_role_and_cafe() {
        let cli = Cli::try_parse_from([
            "shiftbook", "user", "add", "555", "Bea", "--role", "barista", "--cafe", "2",
        ])
        .unwrap();
        match cli.command {
            Command::User {
                command:
                    UserCommand::Add {
                        telegram_id,
                        name,
                        cafe,
                        ..
                    },
            } => {
                assert_eq!(telegram_id, 555);
                assert_eq!(name, "Bea");
                assert_eq!(cafe, Some(2));
            }
            _ => panic!("expected user add"),
        }
    }
}
