use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};

/// SQLite writes through -wal and -journal siblings, so the directory holding
/// the database is watched. A bare file name lives in the current directory.
fn watch_dir(db_path: &str) -> &Path {
    match Path::new(db_path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Watch the schedule database and report writes on the returned channel.
/// The watcher must be kept alive for events to be received.
pub fn watch_db(db_path: &str) -> Result<(RecommendedWatcher, Receiver<()>)> {
    let (tx, rx) = mpsc::channel();

    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            if event.kind.is_modify() || event.kind.is_create() {
                // Receiver dropped means nobody is waiting any more.
                let _ = tx.send(());
            }
        }
    })
    .context("failed to create file watcher")?;

    let watch_path = watch_dir(db_path);
    watcher
        .watch(watch_path, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", watch_path.display()))?;

    Ok((watcher, rx))
}

/// Block until the database changes or `timeout` elapses.
/// Returns true if a change was seen.
pub fn wait_for_change(rx: &Receiver<()>, timeout: Duration) -> bool {
    let got = rx.recv_timeout(timeout).is_ok();
    if got {
        // A single commit fires several events; let them settle.
        let settle = Instant::now() + Duration::from_millis(50);
        while let Some(left) = settle.checked_duration_since(Instant::now()) {
            if rx.recv_timeout(left).is_err() {
                break;
            }
        }
    }
    got
}
