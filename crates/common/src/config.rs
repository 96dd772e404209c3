use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Which venue implementation the process talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VenueMode {
    Paper,
    Bridge,
}

impl std::fmt::Display for VenueMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VenueMode::Paper => write!(f, "paper"),
            VenueMode::Bridge => write!(f, "bridge"),
        }
    }
}

/// All process settings loaded from environment variables at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // Stores
    pub alerts_dir: PathBuf,
    pub signals_dir: PathBuf,
    pub policy_path: PathBuf,
    pub policy_load_attempts: u32,

    // Venue
    pub venue_mode: VenueMode,
    pub bridge_url: Option<String>,
    pub venue_timeout: Duration,
    pub paper_balance: f64,
    pub paper_slippage_bps: f64,

    // Pass cadence
    pub enrich_interval: Duration,
    pub execute_interval: Duration,
    pub risk_interval: Duration,
    pub loop_retry_delay: Duration,

    // Enrichment / execution
    pub alert_freshness: Duration,
    pub execution_window: Duration,
    pub order_max_attempts: u32,
    pub order_retry_delay: Duration,

    // Risk management
    pub modify_max_attempts: u32,
    pub modify_retry_delay: Duration,
    pub min_position_age: Duration,
    pub cooldown: Duration,
    pub noop_ticks: u32,
}

impl Config {
    /// Load all configuration from environment variables.
    /// Loads `.env` if present. Malformed values are a `Config` error.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let venue_mode = match optional_env("VENUE_MODE")
            .unwrap_or_else(|| "paper".to_string())
            .to_lowercase()
            .as_str()
        {
            "paper" => VenueMode::Paper,
            "bridge" => VenueMode::Bridge,
            other => {
                return Err(Error::Config(format!(
                    "VENUE_MODE must be 'paper' or 'bridge', got: '{other}'"
                )))
            }
        };

        let bridge_url = optional_env("VENUE_BRIDGE_URL");
        if venue_mode == VenueMode::Bridge && bridge_url.is_none() {
            return Err(Error::Config(
                "VENUE_BRIDGE_URL is required when VENUE_MODE=bridge".into(),
            ));
        }

        Ok(Config {
            alerts_dir: path_env("ALERTS_DIR", "data/alerts"),
            signals_dir: path_env("SIGNALS_DIR", "data/signals"),
            policy_path: path_env("POLICY_PATH", "config/policies.toml"),
            policy_load_attempts: parsed_env("POLICY_LOAD_ATTEMPTS", 3)?,
            venue_mode,
            bridge_url,
            venue_timeout: secs_env("VENUE_TIMEOUT_SECS", 10)?,
            paper_balance: parsed_env("PAPER_BALANCE", 10_000.0)?,
            paper_slippage_bps: parsed_env("PAPER_SLIPPAGE_BPS", 0.0)?,
            enrich_interval: secs_env("ENRICH_INTERVAL_SECS", 5)?,
            execute_interval: secs_env("EXECUTE_INTERVAL_SECS", 3)?,
            risk_interval: secs_env("RISK_INTERVAL_SECS", 10)?,
            loop_retry_delay: secs_env("LOOP_RETRY_DELAY_SECS", 5)?,
            alert_freshness: secs_env("ALERT_FRESHNESS_SECS", 60)?,
            execution_window: secs_env("EXECUTION_WINDOW_SECS", 300)?,
            order_max_attempts: parsed_env("ORDER_MAX_ATTEMPTS", 3)?,
            order_retry_delay: secs_env("ORDER_RETRY_DELAY_SECS", 2)?,
            modify_max_attempts: parsed_env("MODIFY_MAX_ATTEMPTS", 3)?,
            modify_retry_delay: secs_env("MODIFY_RETRY_DELAY_SECS", 5)?,
            min_position_age: secs_env("MIN_POSITION_AGE_SECS", 30)?,
            cooldown: secs_env("COOLDOWN_SECS", 60)?,
            noop_ticks: parsed_env("NOOP_TICKS", 5)?,
        })
    }
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn path_env(key: &str, default: &str) -> PathBuf {
    PathBuf::from(optional_env(key).unwrap_or_else(|| default.to_string()))
}

fn parsed_env<T: FromStr>(key: &str, default: T) -> Result<T> {
    match optional_env(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{key} has an invalid value: '{raw}'"))),
    }
}

fn secs_env(key: &str, default_secs: u64) -> Result<Duration> {
    parsed_env(key, default_secs).map(Duration::from_secs)
}
