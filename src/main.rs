mod cli;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDateTime, TimeDelta};
use clap::Parser;
use rusqlite::Connection;
use serde::Serialize;
use tracing_subscriber::prelude::*;

use cli::{CafeCommand, Cli, Command, OutboxCommand, SlotCommand, SweepCommand, UserCommand};
use shiftbook::config::{Config, Rules};
use shiftbook::directory::{CafeEdit, NewCafe, NewUser};
use shiftbook::lifecycle::SweepReport;
use shiftbook::model::Role;
use shiftbook::outbox::LogDispatcher;
use shiftbook::{allocation, db, directory, lifecycle, outbox, output, watch, ShiftError};

fn shiftbook_home() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".shiftbook"))
}

fn resolve_path(cli_path: Option<String>, default_name: &str) -> Result<String> {
    match cli_path {
        Some(p) => Ok(p),
        None => {
            let path = shiftbook_home()?.join(default_name);
            Ok(path
                .to_str()
                .context("default path is not valid UTF-8")?
                .to_string())
        }
    }
}

fn ensure_db_dir(db_path: &str) -> Result<()> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

fn open_db(db_path: &str) -> Result<Connection> {
    let conn = db::open(db_path)?;
    db::init(&conn)?;
    Ok(conn)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shiftbook=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let json = cli.json;
    if let Err(e) = run(cli) {
        match e.downcast_ref::<ShiftError>() {
            Some(err) if json => {
                let body = serde_json::json!({ "error": err.kind(), "message": err.to_string() });
                println!("{body}");
            }
            _ => eprintln!("error: {e:#}"),
        }
        std::process::exit(1);
    }
}

/// Everything a command needs besides its own arguments.
struct Ctx {
    conn: Connection,
    config: Config,
    rules: Rules,
    actor_telegram: Option<i64>,
    now: NaiveDateTime,
    json: bool,
}

impl Ctx {
    /// Internal id of the `--as` user.
    fn actor(&self) -> Result<i64> {
        let Some(telegram_id) = self.actor_telegram else {
            bail!("this command needs --as <telegram id> (or SHIFTBOOK_ACTOR)");
        };
        match directory::find_user_by_telegram(&self.conn, telegram_id)? {
            Some(user) => Ok(user.id),
            None => bail!("telegram id {telegram_id} is unknown; run `shiftbook start` first"),
        }
    }

    fn print<T: Serialize>(&self, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            print!("{}", text(value));
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let report = outbox::flush(&self.conn, &LogDispatcher { echo_json: self.json })?;
        if report.failed > 0 {
            tracing::warn!(failed = report.failed, "some notifications are still pending");
        }
        Ok(())
    }
}

fn resolve_cafe(conn: &Connection, cafe: &str) -> Result<i64> {
    if let Ok(id) = cafe.parse::<i64>() {
        return Ok(directory::get_cafe(conn, id)?.id);
    }
    match directory::find_cafe_by_name(conn, cafe)? {
        Some(c) => Ok(c.id),
        None => bail!("cafe '{cafe}' not found"),
    }
}

fn run(cli: Cli) -> Result<()> {
    let db_path = resolve_path(cli.db, "shiftbook.db")?;
    let config_path = resolve_path(cli.config, "config.toml")?;
    ensure_db_dir(&db_path)?;
    let config = Config::load_from(Path::new(&config_path))?;

    match cli.command {
        Command::Init => {
            open_db(&db_path)?;
            eprintln!("Initialized {db_path}");
            Ok(())
        }
        Command::Wait { timeout } => {
            let (_watcher, rx) = watch::watch_db(&db_path)?;
            if !watch::wait_for_change(&rx, Duration::from_secs(timeout)) {
                bail!("no change within {timeout}s");
            }
            eprintln!("Database changed");
            Ok(())
        }
        Command::Jobs { once } => {
            let conn = open_db(&db_path)?;
            run_jobs(&conn, &config, cli.json, once)
        }
        command => {
            let ctx = Ctx {
                conn: open_db(&db_path)?,
                rules: config.rules(),
                config,
                actor_telegram: cli.actor,
                now: cli.now.unwrap_or_else(|| Local::now().naive_local()),
                json: cli.json,
            };
            run_command(&ctx, command)
        }
    }
}

/// Run one command, then deliver whatever it queued. Notifications committed
/// before a failure still go out; a failed flush is only logged.
fn run_command(ctx: &Ctx, command: Command) -> Result<()> {
    let result = dispatch(ctx, command);
    if let Err(e) = ctx.flush() {
        tracing::warn!(error = %e, "outbox flush failed");
    }
    result
}

fn dispatch(ctx: &Ctx, command: Command) -> Result<()> {
    let conn = &ctx.conn;
    let now = ctx.now;
    match command {
        Command::Init | Command::Wait { .. } | Command::Jobs { .. } => {
            bail!("this command does not act on behalf of a user")
        }

        Command::Start { name } => {
            let Some(telegram_id) = ctx.actor_telegram else {
                bail!("start needs --as <telegram id>");
            };
            let user = directory::bootstrap_user(conn, &ctx.config.bootstrap, telegram_id, &name)?;
            ctx.print(&user, |u| format!("{} is {}\n", u.display_name, u.role))?;
        }
        Command::Register { name, cafe, phone } => {
            let user_id = ctx.actor()?;
            let cafe_id = resolve_cafe(conn, &cafe)?;
            let user =
                directory::submit_registration(conn, user_id, &name, phone.as_deref(), cafe_id)?;
            eprintln!("Registration sent; waiting for approval");
            ctx.print(&user, |u| output::format_user_list(std::slice::from_ref(u)))?;
        }

        Command::Cafe { command } => cafe_command(ctx, command)?,
        Command::User { command } => user_command(ctx, command)?,
        Command::Slot { command } => slot_command(ctx, command)?,

        Command::Claim { slot } => {
            let booking = allocation::claim_slot(conn, &ctx.rules, ctx.actor()?, slot, now)?;
            eprintln!("Claimed slot {slot}");
            ctx.print(&booking, |b| format!("booking {}\n", b.id))?;
        }
        Command::Release { booking } => {
            let b = allocation::release_slot(conn, &ctx.rules, ctx.actor()?, booking, now)?;
            eprintln!("Released booking {booking}");
            ctx.print(&b, |b| format!("{}\n", b.status))?;
        }
        Command::Confirm { booking } => {
            let b = lifecycle::confirm_going(conn, &ctx.rules, ctx.actor()?, booking, now)?;
            eprintln!("Confirmed booking {booking}");
            ctx.print(&b, |b| format!("{}\n", b.status))?;
        }
        Command::Complete { booking } => {
            let b = lifecycle::complete(conn, ctx.actor()?, booking)?;
            eprintln!("Completed booking {booking}");
            ctx.print(&b, |b| format!("{}\n", b.status))?;
        }
        Command::Cancel { booking } => {
            let b = lifecycle::cancel(conn, &ctx.rules, ctx.actor()?, booking, now)?;
            eprintln!("Canceled booking {booking}");
            ctx.print(&b, |b| format!("{}\n", b.status))?;
        }
        Command::Bookings => {
            let bookings = allocation::barista_bookings(conn, ctx.actor()?, now)?;
            ctx.print(&bookings, |b| output::format_bookings(b))?;
        }

        Command::Sweep { command } => {
            let report = match command {
                SweepCommand::NoShow => lifecycle::mark_no_show_sweep(conn, now)?,
                SweepCommand::Complete => lifecycle::completion_sweep(conn, now)?,
                SweepCommand::Remind => lifecycle::daily_reminder_sweep(conn, &ctx.rules, now)?,
            };
            ctx.print(&report, format_sweep)?;
        }
        Command::Outbox { command } => match command {
            OutboxCommand::List { all } => {
                let notifications = outbox::list(conn, !all)?;
                ctx.print(&notifications, |n| output::format_notifications(n))?;
            }
            OutboxCommand::Flush => {
                let report = outbox::flush(conn, &LogDispatcher { echo_json: ctx.json })?;
                eprintln!("Delivered {}, failed {}", report.delivered, report.failed);
            }
            OutboxCommand::Prune { days } => {
                let removed = outbox::prune(conn, TimeDelta::days(i64::from(days)))?;
                eprintln!("Removed {removed} notifications");
            }
        },
    }
    Ok(())
}

fn cafe_command(ctx: &Ctx, command: CafeCommand) -> Result<()> {
    let conn = &ctx.conn;
    match command {
        CafeCommand::Add {
            name,
            address,
            phone,
            desc,
            opens,
            closes,
        } => {
            let cafe = directory::create_cafe(
                conn,
                ctx.actor()?,
                &NewCafe {
                    name: &name,
                    address: &address,
                    phone: phone.as_deref(),
                    description: &desc,
                    opening_time: opens,
                    closing_time: closes,
                },
            )?;
            eprintln!("Added cafe '{}'", cafe.name);
            ctx.print(&cafe, |c| format!("{}\n", c.id))?;
        }
        CafeCommand::List { all } => {
            let cafes = directory::list_cafes(conn, all)?;
            ctx.print(&cafes, |c| output::format_cafe_list(c))?;
        }
        CafeCommand::Edit {
            cafe,
            name,
            address,
            phone,
            desc,
        } => {
            let edit = CafeEdit {
                name: name.as_deref(),
                address: address.as_deref(),
                phone: phone.as_deref(),
                description: desc.as_deref(),
            };
            let cafe = directory::update_cafe(conn, ctx.actor()?, cafe, &edit)?;
            eprintln!("Updated cafe '{}'", cafe.name);
            ctx.print(&cafe, |c| output::format_cafe_list(std::slice::from_ref(c)))?;
        }
        CafeCommand::Hours { cafe, opens, closes } => {
            let update =
                directory::update_cafe_hours(conn, ctx.actor()?, cafe, opens, closes, ctx.now)?;
            eprintln!("Updated hours for '{}'", update.cafe.name);
            if !update.outside_hours.is_empty() {
                eprintln!("These upcoming slots are now outside opening hours:");
            }
            ctx.print(&update, |u| output::format_slot_list(&u.outside_hours))?;
        }
        CafeCommand::Activate { cafe } => {
            directory::set_cafe_active(conn, ctx.actor()?, cafe, true)?;
            eprintln!("Activated cafe {cafe}");
        }
        CafeCommand::Deactivate { cafe } => {
            directory::set_cafe_active(conn, ctx.actor()?, cafe, false)?;
            eprintln!("Deactivated cafe {cafe}");
        }
        CafeCommand::SetManager { cafe, user } => {
            let manager = directory::assign_cafe_manager(conn, ctx.actor()?, cafe, user, ctx.now)?;
            eprintln!("{} now manages cafe {cafe}", manager.display_name);
        }
    }
    Ok(())
}

fn user_command(ctx: &Ctx, command: UserCommand) -> Result<()> {
    let conn = &ctx.conn;
    match command {
        UserCommand::List => {
            let users = directory::list_users(conn, ctx.actor()?)?;
            ctx.print(&users, |u| output::format_user_list(u))?;
        }
        UserCommand::Add {
            telegram_id,
            name,
            role,
            cafe,
            phone,
        } => {
            let new = NewUser {
                telegram_id,
                display_name: &name,
                phone: phone.as_deref(),
                role: Role::parse(&role)?,
                cafe_id: cafe,
            };
            let u = directory::admin_create_user(conn, ctx.actor()?, &new)?;
            eprintln!("Added {} as {}", u.display_name, u.role);
            ctx.print(&u, |u| output::format_user_list(std::slice::from_ref(u)))?;
        }
        UserCommand::Edit { user, name, phone } => {
            let u = directory::update_user_contact(
                conn,
                ctx.actor()?,
                user,
                name.as_deref(),
                phone.as_deref(),
            )?;
            ctx.print(&u, |u| output::format_user_list(std::slice::from_ref(u)))?;
        }
        UserCommand::Pending => {
            let users = directory::pending_registrations(conn, ctx.actor()?)?;
            ctx.print(&users, |u| output::format_user_list(u))?;
        }
        UserCommand::Approve { user } => {
            let u = directory::approve_registration(conn, ctx.actor()?, user)?;
            eprintln!("Approved {}", u.display_name);
        }
        UserCommand::Reject { user } => {
            let u = directory::reject_registration(conn, ctx.actor()?, user)?;
            eprintln!("Rejected {}", u.display_name);
        }
        UserCommand::Reassign { user, role, cafe } => {
            let role = Role::parse(&role)?;
            let u = directory::reassign_user(conn, ctx.actor()?, user, role, cafe, ctx.now)?;
            ctx.print(&u, |u| output::format_user_list(std::slice::from_ref(u)))?;
        }
        UserCommand::Activate { user } => {
            let u = directory::set_user_active(conn, ctx.actor()?, user, true, ctx.now)?;
            eprintln!("Activated {}", u.display_name);
        }
        UserCommand::Deactivate { user } => {
            let u = directory::set_user_active(conn, ctx.actor()?, user, false, ctx.now)?;
            eprintln!("Deactivated {}", u.display_name);
        }
    }
    Ok(())
}

fn slot_command(ctx: &Ctx, command: SlotCommand) -> Result<()> {
    let conn = &ctx.conn;
    match command {
        SlotCommand::Add {
            cafe,
            start,
            end,
            capacity,
        } => {
            let slot = allocation::create_slot(conn, ctx.actor()?, cafe, start, end, capacity, ctx.now)?;
            eprintln!("Added slot {}", slot.id);
            ctx.print(&slot, |s| output::format_slot_list(std::slice::from_ref(s)))?;
        }
        SlotCommand::List { cafe, from, to } => {
            let from = from.unwrap_or(ctx.now);
            let to = to.unwrap_or(from + TimeDelta::days(7));
            let slots = allocation::list_available_slots(conn, cafe, from, to)?;
            ctx.print(&slots, |s| output::format_slot_list(s))?;
        }
        SlotCommand::Correct {
            slot,
            start,
            end,
            capacity,
        } => {
            let slot = allocation::correct_slot(
                conn,
                &ctx.rules,
                ctx.actor()?,
                slot,
                start,
                end,
                capacity,
                ctx.now,
            )?;
            eprintln!("Corrected slot {}", slot.id);
        }
        SlotCommand::Occupancy { cafe, date } => {
            let date = date.unwrap_or(ctx.now.date());
            let rows = allocation::slot_occupancy(conn, ctx.actor()?, cafe, date)?;
            ctx.print(&rows, |r| output::format_occupancy(r))?;
        }
    }
    Ok(())
}

fn format_sweep(report: &SweepReport) -> String {
    format!(
        "examined {}, changed {}, failed {}\n",
        report.examined, report.changed, report.failed
    )
}

/// A sweep that could not even list its candidates is retried on the next tick.
fn log_sweep(sweep: &str, result: Result<SweepReport, ShiftError>) {
    if let Err(e) = result {
        tracing::warn!(sweep, error = %e, "sweep failed");
    }
}

/// Run the sweeps forever, each on its own interval, flushing the outbox
/// after every run.
fn run_jobs(conn: &Connection, config: &Config, json: bool, once: bool) -> Result<()> {
    let rules = config.rules();
    let intervals = config.job_intervals();
    let dispatcher = LogDispatcher { echo_json: json };
    let mut next_no_show = Instant::now();
    let mut next_reminder = Instant::now();
    tracing::info!(
        no_show_secs = intervals.no_show.as_secs(),
        reminder_secs = intervals.reminders.as_secs(),
        "jobs started"
    );
    loop {
        let now = Local::now().naive_local();
        if Instant::now() >= next_no_show {
            log_sweep("no_show", lifecycle::mark_no_show_sweep(conn, now));
            log_sweep("completion", lifecycle::completion_sweep(conn, now));
            next_no_show = Instant::now() + intervals.no_show;
        }
        if Instant::now() >= next_reminder {
            log_sweep("reminder", lifecycle::daily_reminder_sweep(conn, &rules, now));
            next_reminder = Instant::now() + intervals.reminders;
        }
        if let Err(e) = outbox::flush(conn, &dispatcher) {
            tracing::warn!(error = %e, "outbox flush failed");
        }
        if once {
            return Ok(());
        }
        let wake = next_no_show.min(next_reminder);
        std::thread::sleep(wake.saturating_duration_since(Instant::now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx(actor_telegram: Option<i64>) -> Ctx {
        Ctx {
            conn: db::open_memory().unwrap(),
            config: Config::default(),
            rules: Rules::default(),
            actor_telegram,
            now: cli::parse_datetime("2026-10-19 12:00").unwrap(),
            json: false,
        }
    }

    #[test]
    fn command_error_survives_a_failed_flush() {
        let ctx = test_ctx(Some(42));
        directory::bootstrap_user(&ctx.conn, &ctx.config.bootstrap, 42, "Bea").unwrap();
        ctx.conn.execute_batch("DROP TABLE notifications").unwrap();
        assert!(ctx.flush().is_err());

        let err = run_command(&ctx, Command::Claim { slot: 99 }).unwrap_err();
        let core = err.downcast_ref::<ShiftError>().expect("typed core error");
        assert_eq!(core.kind(), shiftbook::ErrorKind::Forbidden);
    }

    #[test]
    fn successful_command_is_not_failed_by_flush() {
        let ctx = test_ctx(Some(42));
        ctx.conn.execute_batch("DROP TABLE notifications").unwrap();
        run_command(&ctx, Command::Start { name: "Bea".into() }).unwrap();
    }

    #[test]
    fn jobs_survive_a_failing_sweep() {
        let conn = db::open_memory().unwrap();
        conn.execute_batch("DROP TABLE bookings").unwrap();
        run_jobs(&conn, &Config::default(), false, true).unwrap();
    }
}
