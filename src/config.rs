use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::TimeDelta;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesConfig {
    pub min_rest_minutes: Option<i64>,
    pub confirm_opens_before_minutes: Option<i64>,
    pub confirm_closes_after_minutes: Option<i64>,
    pub late_cancel_minutes: Option<i64>,
    pub reminder_horizon_minutes: Option<i64>,
}

/// Static allow-lists consulted when a telegram identity is seen for the first time.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub admins: Vec<i64>,
    #[serde(default)]
    pub managers: Vec<ManagerSeed>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerSeed {
    pub telegram_id: i64,
    /// Cafe name, matched case-insensitively.
    pub cafe: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobsConfig {
    pub no_show_interval_secs: Option<u64>,
    pub reminder_interval_secs: Option<u64>,
}

/// Timing rules applied by the allocation engine and the booking lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rules {
    /// Minimum idle time between same-day shifts at different cafes.
    pub min_rest: TimeDelta,
    /// How long before a shift starts the barista may confirm it.
    pub confirm_opens_before: TimeDelta,
    /// How long after a shift starts the barista may still confirm it.
    pub confirm_closes_after: TimeDelta,
    /// Canceling a confirmed shift this close to its start is flagged to the manager.
    pub late_cancel: TimeDelta,
    /// Shifts starting within this horizon get a reminder.
    pub reminder_horizon: TimeDelta,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            min_rest: TimeDelta::minutes(60),
            confirm_opens_before: TimeDelta::hours(24),
            confirm_closes_after: TimeDelta::minutes(60),
            late_cancel: TimeDelta::hours(2),
            reminder_horizon: TimeDelta::hours(24),
        }
    }
}

/// Upper bound for every `[rules]` duration: one week.
pub const MAX_RULE_MINUTES: i64 = 7 * 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobIntervals {
    pub no_show: Duration,
    pub reminders: Duration,
}

impl Config {
    /// Load config from `path`.
    /// Returns default config if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        config.validate(path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let r = &self.rules;
        for (key, value) in [
            ("min_rest_minutes", r.min_rest_minutes),
            ("confirm_opens_before_minutes", r.confirm_opens_before_minutes),
            ("confirm_closes_after_minutes", r.confirm_closes_after_minutes),
            ("late_cancel_minutes", r.late_cancel_minutes),
            ("reminder_horizon_minutes", r.reminder_horizon_minutes),
        ] {
            if let Some(v) = value {
                if v < 0 {
                    bail!(
                        "failed to parse {}: rules.{key} must not be negative",
                        path.display()
                    );
                }
                if v > MAX_RULE_MINUTES {
                    bail!(
                        "failed to parse {}: rules.{key} must be at most {MAX_RULE_MINUTES} minutes",
                        path.display()
                    );
                }
            }
        }
        let rules = self.rules();
        if rules.confirm_opens_before + rules.confirm_closes_after <= TimeDelta::zero() {
            bail!(
                "failed to parse {}: the confirmation window is empty",
                path.display()
            );
        }
        for (key, value) in [
            ("no_show_interval_secs", self.jobs.no_show_interval_secs),
            ("reminder_interval_secs", self.jobs.reminder_interval_secs),
        ] {
            if value == Some(0) {
                bail!("failed to parse {}: jobs.{key} must be positive", path.display());
            }
        }
        for seed in &self.bootstrap.managers {
            if self.bootstrap.admins.contains(&seed.telegram_id) {
                bail!(
                    "failed to parse {}: telegram id {} is listed as both admin and manager",
                    path.display(),
                    seed.telegram_id
                );
            }
        }
        Ok(())
    }

    pub fn rules(&self) -> Rules {
        let defaults = Rules::default();
        let r = &self.rules;
        let minutes = |value: Option<i64>, default: TimeDelta| {
            value.and_then(TimeDelta::try_minutes).unwrap_or(default)
        };
        Rules {
            min_rest: minutes(r.min_rest_minutes, defaults.min_rest),
            confirm_opens_before: minutes(
                r.confirm_opens_before_minutes,
                defaults.confirm_opens_before,
            ),
            confirm_closes_after: minutes(
                r.confirm_closes_after_minutes,
                defaults.confirm_closes_after,
            ),
            late_cancel: minutes(r.late_cancel_minutes, defaults.late_cancel),
            reminder_horizon: minutes(r.reminder_horizon_minutes, defaults.reminder_horizon),
        }
    }

    pub fn job_intervals(&self) -> JobIntervals {
        JobIntervals {
            no_show: Duration::from_secs(self.jobs.no_show_interval_secs.unwrap_or(600)),
            reminders: Duration::from_secs(self.jobs.reminder_interval_secs.unwrap_or(86_400)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn missing_file_returns_default() {
        let config = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.rules(), Rules::default());
        assert!(config.bootstrap.admins.is_empty());
        assert_eq!(config.job_intervals().no_show, Duration::from_secs(600));
    }

    #[test]
    fn parse_full_config() {
        let f = write_config(
            r#"
[rules]
min_rest_minutes = 45
confirm_closes_after_minutes = 30

[bootstrap]
admins = [100, 101]

[[bootstrap.managers]]
telegram_id = 200
cafe = "Central"

[jobs]
no_show_interval_secs = 300
"#,
        );
        let config = Config::load_from(f.path()).unwrap();
        let rules = config.rules();
        assert_eq!(rules.min_rest, TimeDelta::minutes(45));
        assert_eq!(rules.confirm_closes_after, TimeDelta::minutes(30));
        assert_eq!(rules.confirm_opens_before, TimeDelta::hours(24));
        assert_eq!(config.bootstrap.admins, vec![100, 101]);
        assert_eq!(config.bootstrap.managers[0].cafe, "Central");
        assert_eq!(config.job_intervals().no_show, Duration::from_secs(300));
        assert_eq!(config.job_intervals().reminders, Duration::from_secs(86_400));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let f = write_config("[rules]\nrest = 10\n");
        assert!(Config::load_from(f.path()).is_err());
    }

    #[test]
    fn negative_minutes_are_rejected() {
        let f = write_config("[rules]\nmin_rest_minutes = -5\n");
        let err = Config::load_from(f.path()).unwrap_err();
        assert!(err.to_string().contains("min_rest_minutes"), "{err}");
    }

    #[test]
    fn huge_minutes_are_rejected_not_panicking() {
        let f = write_config("[rules]\nmin_rest_minutes = 9223372036854775807\n");
        let err = Config::load_from(f.path()).unwrap_err();
        assert!(err.to_string().contains("rules.min_rest_minutes"), "{err}");

        let f = write_config("[rules]\nreminder_horizon_minutes = 10081\n");
        let err = Config::load_from(f.path()).unwrap_err();
        assert!(err.to_string().contains("reminder_horizon_minutes"), "{err}");

        let f = write_config("[rules]\nreminder_horizon_minutes = 10080\n");
        let config = Config::load_from(f.path()).unwrap();
        assert_eq!(config.rules().reminder_horizon, TimeDelta::days(7));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let f = write_config("[jobs]\nreminder_interval_secs = 0\n");
        assert!(Config::load_from(f.path()).is_err());
    }

    #[test]
    fn admin_and_manager_overlap_is_rejected() {
        let f = write_config(
            "[bootstrap]\nadmins = [7]\n[[bootstrap.managers]]\ntelegram_id = 7\ncafe = \"x\"\n",
        );
        let err = Config::load_from(f.path()).unwrap_err();
        assert!(err.to_string().contains("both admin and manager"), "{err}");
    }
}
