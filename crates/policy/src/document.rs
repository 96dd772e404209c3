use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use common::{Error, Result, Side, VenueIdentity};

/// Top-level policy document (TOML), keyed by strategy id.
///
/// Example `config/policies.toml`:
/// ```toml
/// [strategies.algo11]
/// enabled = true
/// allowed_symbols = ["EURUSD", "XAUUSD"]
/// allowed_actions = ["buy", "sell"]
/// magic = 123456
///
/// [strategies.algo11.sizing]
/// mode = "fixed"
/// lots = 0.10
///
/// [strategies.algo11.protection]
/// mode = "fixed_pips"
/// sl_pips = 20
/// tp_pips = 40
/// trailing = { activate_at_pips = 15, lock_pips = 5 }
///
/// [strategies.algo11.reversal]
/// mode = "close"
/// magic_restriction = true
///
/// [strategies.algo11.venue]
/// terminal = "C:/Terminals/algo11/terminal64.exe"
/// login = 5012345
/// server = "Broker-Demo"
/// password_env = "ALGO11_PASSWORD"
/// ```
///
/// Entries are kept as raw TOML and parsed on lookup, so a malformed
/// strategy only fails its own lookups.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub strategies: BTreeMap<String, toml::Value>,
}

impl PolicyDocument {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("policy document: {e}")))
    }

    /// `Ok(None)` if the strategy is not in the document; `Err(Config)` if
    /// its entry is malformed.
    pub fn policy(&self, strategy_id: &str) -> Result<Option<StrategyPolicy>> {
        let Some(raw) = self.strategies.get(strategy_id) else {
            return Ok(None);
        };
        let policy: StrategyPolicy = raw
            .clone()
            .try_into()
            .map_err(|e| Error::Config(format!("strategy '{strategy_id}': {e}")))?;
        policy
            .validate()
            .map_err(|reason| Error::Config(format!("strategy '{strategy_id}': {reason}")))?;
        Ok(Some(policy))
    }

    pub fn strategy_ids(&self) -> Vec<String> {
        self.strategies.keys().cloned().collect()
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StrategyPolicy {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub allowed_symbols: BTreeSet<String>,
    pub allowed_actions: BTreeSet<Side>,
    /// Order tag number stamped on every order this strategy opens.
    pub magic: u64,
    pub sizing: SizingPolicy,
    pub protection: ProtectionPolicy,
    #[serde(default)]
    pub reversal: ReversalPolicy,
    #[serde(default)]
    pub venue: VenueAccount,
}

impl StrategyPolicy {
    pub fn allows_symbol(&self, symbol: &str) -> bool {
        self.allowed_symbols
            .iter()
            .any(|s| s.eq_ignore_ascii_case(symbol.trim()))
    }

    pub fn allows_action(&self, side: Side) -> bool {
        self.allowed_actions.contains(&side)
    }

    fn validate(&self) -> Result<(), String> {
        match self.sizing {
            SizingPolicy::Fixed { lots } if !(lots > 0.0) => {
                return Err(format!("fixed lots must be positive, got {lots}"));
            }
            SizingPolicy::PercentOfBalance {
                risk_percent,
                leverage,
                min_lot,
            } => {
                if !(risk_percent > 0.0 && risk_percent <= 100.0) {
                    return Err(format!("risk_percent must be in (0, 100], got {risk_percent}"));
                }
                if !(leverage > 0.0) {
                    return Err(format!("leverage must be positive, got {leverage}"));
                }
                if !(min_lot > 0.0) {
                    return Err(format!("min_lot must be positive, got {min_lot}"));
                }
            }
            SizingPolicy::Fixed { .. } => {}
        }
        match &self.protection {
            ProtectionPolicy::FixedPips {
                sl_pips,
                tp_pips,
                trailing,
            } => {
                if !(*sl_pips > 0.0 && *tp_pips > 0.0) {
                    return Err("sl_pips and tp_pips must be positive".into());
                }
                if let Some(t) = trailing {
                    if !(t.activate_at_pips > 0.0) || t.lock_pips < 0.0 {
                        return Err("trailing needs activate_at_pips > 0 and lock_pips >= 0".into());
                    }
                }
            }
            ProtectionPolicy::PercentBalance {
                sl_percent,
                tp_percent,
                breakeven_at,
            } => {
                if !(*sl_percent > 0.0 && *tp_percent > 0.0) {
                    return Err("sl_percent and tp_percent must be positive".into());
                }
                if let Some(b) = breakeven_at {
                    if !(*b > 0.0 && *b <= 1.0) {
                        return Err(format!("breakeven_at must be in (0, 1], got {b}"));
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SizingPolicy {
    /// Constant lot size.
    Fixed { lots: f64 },
    /// Risk a share of the balance, levered, against the reference price.
    PercentOfBalance {
        risk_percent: f64,
        leverage: f64,
        /// Fallback size whenever the computation cannot complete.
        min_lot: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct TrailingPolicy {
    pub activate_at_pips: f64,
    pub lock_pips: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ProtectionPolicy {
    FixedPips {
        sl_pips: f64,
        tp_pips: f64,
        #[serde(default)]
        trailing: Option<TrailingPolicy>,
    },
    PercentBalance {
        sl_percent: f64,
        tp_percent: f64,
        /// Fraction of the way to the target at which the stop moves to entry.
        #[serde(default)]
        breakeven_at: Option<f64>,
    },
}

impl ProtectionPolicy {
    pub fn label(&self) -> &'static str {
        match self {
            ProtectionPolicy::FixedPips { .. } => "fixed_pips",
            ProtectionPolicy::PercentBalance { .. } => "percent_balance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReversalMode {
    #[default]
    Off,
    /// Close opposite positions, then open the new leg.
    Close,
    /// Closing opposite positions is the whole trade.
    Netting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct ReversalPolicy {
    #[serde(default)]
    pub mode: ReversalMode,
    /// Only consider positions carrying this strategy's magic number.
    #[serde(default)]
    pub magic_restriction: bool,
}

/// Where a strategy's isolated account lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct VenueAccount {
    pub terminal: String,
    pub login: u64,
    pub server: String,
    /// Name of the environment variable holding the account password.
    pub password_env: Option<String>,
}

impl VenueAccount {
    pub fn identity(&self, strategy_id: &str) -> Result<VenueIdentity> {
        let password = match &self.password_env {
            Some(var) => std::env::var(var).map_err(|_| {
                Error::Config(format!(
                    "strategy '{strategy_id}': password variable '{var}' is not set"
                ))
            })?,
            None => String::new(),
        };
        Ok(VenueIdentity {
            strategy_id: strategy_id.to_string(),
            terminal: self.terminal.clone(),
            login: self.login,
            server: self.server.clone(),
            password,
        })
    }
}
