use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const HOME_ENV: &str = "SWEEP_HOME";
pub const CONFIG_FILE: &str = "config.yml";

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_RUN_STATUS_LOCK_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TRIAL_STOP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_TRIALS: usize = 20;
pub const DEFAULT_OBJECTIVE: &str = "loss";

pub const PRINT_TRIALS_CMD_ENV: &str = "PRINT_TRIALS_CMD";
pub const PRINT_TRIALS_ENV: &str = "PRINT_TRIALS";
pub const SAVE_TRIALS_ENV: &str = "SAVE_TRIALS";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    poll_interval: Option<u64>,
    #[serde(default)]
    run_status_lock_timeout: Option<u64>,
    #[serde(default)]
    trial_stop_timeout: Option<u64>,
    #[serde(default)]
    default_max_trials: Option<usize>,
    #[serde(default)]
    default_objective: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub home: PathBuf,
    pub poll_interval: Duration,
    pub run_status_lock_timeout: Duration,
    pub trial_stop_timeout: Duration,
    pub default_max_trials: usize,
    pub default_objective: String,
}

impl Config {
    /// Config rooted at `home` with built-in defaults.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            run_status_lock_timeout: Duration::from_secs(DEFAULT_RUN_STATUS_LOCK_TIMEOUT_SECS),
            trial_stop_timeout: Duration::from_secs(DEFAULT_TRIAL_STOP_TIMEOUT_SECS),
            default_max_trials: DEFAULT_MAX_TRIALS,
            default_objective: DEFAULT_OBJECTIVE.to_string(),
        }
    }

    /// Resolves home from `SWEEP_HOME` (default `~/.sweep`) and applies
    /// `<home>/config.yml` when present.
    pub fn load() -> Result<Self> {
        let home = match std::env::var_os(HOME_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => default_home(),
        };
        Self::load_from(&home)
    }

    pub fn load_from(home: &Path) -> Result<Self> {
        let mut config = Self::with_home(home);
        let path = home.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(config);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: ConfigFile = if raw.trim().is_empty() {
            ConfigFile::default()
        } else {
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        };
        if let Some(secs) = file.poll_interval {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = file.run_status_lock_timeout {
            config.run_status_lock_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.trial_stop_timeout {
            config.trial_stop_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = file.default_max_trials {
            config.default_max_trials = n;
        }
        if let Some(objective) = file.default_objective {
            config.default_objective = objective;
        }
        Ok(config)
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.home.join("locks")
    }
}

fn default_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sweep")
}

/// What a batch does with its expanded trials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchMode {
    PrintCommands,
    PrintTrials,
    Save(PathBuf),
    Run,
}

impl DispatchMode {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if lookup(PRINT_TRIALS_CMD_ENV).as_deref() == Some("1") {
            DispatchMode::PrintCommands
        } else if lookup(PRINT_TRIALS_ENV).as_deref() == Some("1") {
            DispatchMode::PrintTrials
        } else {
            match lookup(SAVE_TRIALS_ENV) {
                Some(path) if !path.is_empty() => DispatchMode::Save(PathBuf::from(path)),
                _ => DispatchMode::Run,
            }
        }
    }
}
