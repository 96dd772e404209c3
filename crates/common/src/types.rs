use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Direction of an alert, order or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for long, -1 for short. Multiplying a distance by this moves it
    /// toward profit.
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

impl FromStr for Side {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(Error::Other(format!("unknown side '{other}'"))),
        }
    }
}

/// Raw inbound alert as appended by the listener.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub side: Side,
    pub timeframe: String,
    pub strategy_id: String,
    pub consumed: bool,
}

impl AlertRecord {
    pub fn key(&self) -> SignalKey {
        SignalKey {
            timestamp: self.timestamp,
            symbol: self.symbol.clone(),
            strategy_id: self.strategy_id.clone(),
        }
    }
}

/// Dedup key shared by alerts and enriched signals.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalKey {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub strategy_id: String,
}

/// Lifecycle of an enriched signal. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    PendingExecution,
    Rejected,
    Executed,
    ProtectionApplied,
}

impl LifecycleState {
    /// Ordering used when merging duplicate records: the more advanced
    /// state wins.
    pub fn rank(self) -> u8 {
        match self {
            LifecycleState::PendingExecution => 0,
            LifecycleState::Rejected | LifecycleState::Executed => 1,
            LifecycleState::ProtectionApplied => 2,
        }
    }

    pub fn can_advance_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (PendingExecution, Rejected)
                | (PendingExecution, Executed)
                | (Executed, ProtectionApplied)
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::PendingExecution => write!(f, "pending_execution"),
            LifecycleState::Rejected => write!(f, "rejected"),
            LifecycleState::Executed => write!(f, "executed"),
            LifecycleState::ProtectionApplied => write!(f, "protection_applied"),
        }
    }
}

/// A sized, policy-validated order intent.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedSignal {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub side: Side,
    pub timeframe: String,
    pub strategy_id: String,
    pub lot_size: f64,
    pub protection_mode: String,
    pub state: LifecycleState,
    pub rejection_reason: Option<String>,
    pub order_ticket: Option<u64>,
    pub fill_price: Option<f64>,
    pub executed_at: Option<DateTime<Utc>>,
    pub processed_at: DateTime<Utc>,
}

impl EnrichedSignal {
    pub fn pending(
        alert: &AlertRecord,
        lot_size: f64,
        protection_mode: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::from_alert(
            alert,
            lot_size,
            protection_mode.into(),
            LifecycleState::PendingExecution,
            None,
            now,
        )
    }

    pub fn rejected(
        alert: &AlertRecord,
        reason: &RejectionReason,
        protection_mode: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::from_alert(
            alert,
            0.0,
            protection_mode.into(),
            LifecycleState::Rejected,
            Some(reason.to_string()),
            now,
        )
    }

    fn from_alert(
        alert: &AlertRecord,
        lot_size: f64,
        protection_mode: String,
        state: LifecycleState,
        rejection_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp: alert.timestamp,
            symbol: alert.symbol.clone(),
            side: alert.side,
            timeframe: alert.timeframe.clone(),
            strategy_id: alert.strategy_id.clone(),
            lot_size,
            protection_mode,
            state,
            rejection_reason,
            order_ticket: None,
            fill_price: None,
            executed_at: None,
            processed_at: now,
        }
    }

    pub fn key(&self) -> SignalKey {
        SignalKey {
            timestamp: self.timestamp,
            symbol: self.symbol.clone(),
            strategy_id: self.strategy_id.clone(),
        }
    }

    /// Stamp a fill. Returns false (and leaves the record untouched) if the
    /// signal is not awaiting execution.
    pub fn mark_executed(&mut self, ticket: u64, price: f64, at: DateTime<Utc>) -> bool {
        if !self.advance(LifecycleState::Executed, at) {
            return false;
        }
        self.order_ticket = Some(ticket);
        self.fill_price = Some(price);
        self.executed_at = Some(at);
        true
    }

    pub fn mark_rejected(&mut self, reason: &RejectionReason, at: DateTime<Utc>) -> bool {
        if !self.advance(LifecycleState::Rejected, at) {
            return false;
        }
        self.rejection_reason = Some(reason.to_string());
        true
    }

    pub fn advance(&mut self, next: LifecycleState, at: DateTime<Utc>) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        self.state = next;
        self.processed_at = at;
        true
    }
}

/// Why a signal never reached (or never will reach) the venue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    PolicyMissing,
    StrategyDisabled,
    ActionNotPermitted,
    SymbolNotPermitted,
    Stale,
    ExpiredBeforeExecution,
    MarketData(String),
    PartialReversal { closed: usize, total: usize },
    Other(String),
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::PolicyMissing => write!(f, "policy missing"),
            RejectionReason::StrategyDisabled => write!(f, "strategy disabled"),
            RejectionReason::ActionNotPermitted => write!(f, "action not permitted"),
            RejectionReason::SymbolNotPermitted => write!(f, "symbol not permitted"),
            RejectionReason::Stale => write!(f, "alert older than freshness window"),
            RejectionReason::ExpiredBeforeExecution => write!(f, "expired before execution"),
            RejectionReason::MarketData(s) => write!(f, "market data unavailable: {s}"),
            RejectionReason::PartialReversal { closed, total } => {
                write!(f, "reversal incomplete: closed {closed} of {total}")
            }
            RejectionReason::Other(s) => write!(f, "{s}"),
        }
    }
}

/// An open position as reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub open_price: f64,
    /// 0.0 when no stop is set.
    pub sl: f64,
    /// 0.0 when no target is set.
    pub tp: f64,
    pub volume: f64,
    pub opened_at: DateTime<Utc>,
    pub magic: u64,
    pub comment: String,
}

impl Position {
    /// Strategy that opened this position, recovered from the order tag.
    pub fn strategy_id(&self) -> Option<&str> {
        self.comment.strip_suffix(ORDER_TAG_SUFFIX)
    }
}

const ORDER_TAG_SUFFIX: &str = "_auto";

/// Comment attached to every order this system opens for a strategy.
pub fn order_tag(strategy_id: &str) -> String {
    format!("{strategy_id}{ORDER_TAG_SUFFIX}")
}

/// Instrument family, derived from a fixed symbol-prefix table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentClass {
    Metal,
    Crypto,
    Currency,
}

const METAL_PREFIXES: &[&str] = &["XAU", "XAG", "XPT", "XPD", "GOLD", "SILVER"];
const CRYPTO_PREFIXES: &[&str] = &[
    "BTC", "ETH", "LTC", "XRP", "BCH", "SOL", "ADA", "DOGE", "DOT", "BNB", "AVAX", "LINK",
];

impl InstrumentClass {
    pub fn of(symbol: &str) -> Self {
        let upper = symbol.trim().to_ascii_uppercase();
        if METAL_PREFIXES.iter().any(|p| upper.starts_with(p)) {
            InstrumentClass::Metal
        } else if CRYPTO_PREFIXES.iter().any(|p| upper.starts_with(p)) {
            InstrumentClass::Crypto
        } else {
            InstrumentClass::Currency
        }
    }

    /// Units of the base asset per 1.0 lot.
    pub fn contract_multiplier(self) -> f64 {
        match self {
            InstrumentClass::Metal => 100.0,
            InstrumentClass::Crypto => 1.0,
            InstrumentClass::Currency => 100_000.0,
        }
    }

    /// Points per pip.
    pub fn points_per_pip(self) -> f64 {
        match self {
            InstrumentClass::Metal | InstrumentClass::Crypto => 1.0,
            InstrumentClass::Currency => 10.0,
        }
    }
}

/// Elapsed time between two instants, clamped at zero for clock skew.
pub fn age(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or_default()
}

/// Round a price or volume to `digits` decimals.
pub fn round_to(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}

/// UTC calendar days a pass should scan: the previous day first, then today.
pub fn scan_days(now: DateTime<Utc>) -> [NaiveDate; 2] {
    let today = now.date_naive();
    [today.pred_opt().unwrap_or(today), today]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn alert() -> AlertRecord {
        AlertRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            timeframe: "15".into(),
            strategy_id: "alpha".into(),
            consumed: false,
        }
    }

    #[test]
    fn lifecycle_never_reverts() {
        let now = Utc::now();
        let mut sig = EnrichedSignal::pending(&alert(), 0.1, "fixed_pips", now);
        assert!(sig.mark_executed(42, 1.1, now));
        assert!(!sig.advance(LifecycleState::PendingExecution, now));
        assert!(!sig.mark_rejected(&RejectionReason::Stale, now));
        assert!(sig.advance(LifecycleState::ProtectionApplied, now));
        assert!(!sig.advance(LifecycleState::Executed, now));
        assert_eq!(sig.order_ticket, Some(42));
    }

    #[test]
    fn rejected_signal_cannot_execute() {
        let now = Utc::now();
        let mut sig =
            EnrichedSignal::rejected(&alert(), &RejectionReason::ActionNotPermitted, "none", now);
        assert!(!sig.mark_executed(1, 1.0, now));
        assert_eq!(sig.order_ticket, None);
        assert_eq!(sig.rejection_reason.as_deref(), Some("action not permitted"));
    }

    #[test]
    fn instrument_classes_from_prefix() {
        assert_eq!(InstrumentClass::of("XAUUSD"), InstrumentClass::Metal);
        assert_eq!(InstrumentClass::of("btcusd"), InstrumentClass::Crypto);
        assert_eq!(InstrumentClass::of("EURUSD"), InstrumentClass::Currency);
        assert_eq!(InstrumentClass::of("XAUUSD").contract_multiplier(), 100.0);
        assert_eq!(InstrumentClass::of("GBPJPY").points_per_pip(), 10.0);
    }

    #[test]
    fn order_tag_round_trips_strategy() {
        let pos = Position {
            ticket: 1,
            symbol: "EURUSD".into(),
            side: Side::Buy,
            open_price: 1.1,
            sl: 0.0,
            tp: 0.0,
            volume: 0.1,
            opened_at: Utc::now(),
            magic: 7,
            comment: order_tag("alpha"),
        };
        assert_eq!(pos.strategy_id(), Some("alpha"));
    }

    #[test]
    fn age_clamps_future_timestamps() {
        let now = Utc::now();
        assert_eq!(age(now, now + chrono::Duration::seconds(5)), Duration::ZERO);
    }

    #[test]
    fn side_parses_case_insensitively() {
        assert_eq!(" BUY ".parse::<Side>().unwrap(), Side::Buy);
        assert!("hold".parse::<Side>().is_err());
    }
}
