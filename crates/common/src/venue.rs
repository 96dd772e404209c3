use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Position, Result, Side};

/// Venue return code for a completed request.
pub const RETCODE_DONE: u32 = 10009;
/// Generic rejection.
pub const RETCODE_REJECT: u32 = 10006;
/// Malformed or unknown request target (e.g. position no longer open).
pub const RETCODE_INVALID: u32 = 10013;
/// Fill policy not supported for the symbol.
pub const RETCODE_INVALID_FILL: u32 = 10030;

/// Maximum price deviation in points accepted on market deals.
pub const DEFAULT_DEVIATION: u32 = 20;

/// Login details of one strategy's isolated account.
#[derive(Clone, PartialEq, Eq)]
pub struct VenueIdentity {
    pub strategy_id: String,
    pub terminal: String,
    pub login: u64,
    pub server: String,
    pub password: String,
}

impl std::fmt::Debug for VenueIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueIdentity")
            .field("strategy_id", &self.strategy_id)
            .field("terminal", &self.terminal)
            .field("login", &self.login)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    /// Smallest price increment.
    pub point: f64,
    /// Price precision in decimals.
    pub digits: u32,
    /// Account-currency value of a one-point move on one lot.
    pub tick_value: f64,
    pub volume_min: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
}

impl Tick {
    /// Price a new deal on `side` fills against.
    pub fn entry_price(&self, side: Side) -> f64 {
        match side {
            Side::Buy => self.ask,
            Side::Sell => self.bid,
        }
    }

    /// Price an open position on `side` would close at.
    pub fn exit_price(&self, side: Side) -> f64 {
        self.entry_price(side.opposite())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionFilter {
    pub symbol: Option<String>,
    pub magic: Option<u64>,
}

/// How the venue should treat a market order it cannot fill completely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
    FillOrKill,
    ImmediateOrCancel,
    Return,
}

impl FillPolicy {
    /// Order in which fill policies are tried until one is accepted.
    pub const PRIORITY: [FillPolicy; 3] = [
        FillPolicy::FillOrKill,
        FillPolicy::ImmediateOrCancel,
        FillPolicy::Return,
    ];
}

impl std::fmt::Display for FillPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FillPolicy::FillOrKill => write!(f, "FOK"),
            FillPolicy::ImmediateOrCancel => write!(f, "IOC"),
            FillPolicy::Return => write!(f, "RETURN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OrderRequest {
    /// Market deal. With `position` set it closes that position.
    Deal {
        symbol: String,
        side: Side,
        volume: f64,
        price: f64,
        deviation: u32,
        magic: u64,
        comment: String,
        filling: FillPolicy,
        position: Option<u64>,
    },
    /// Replace the stop-loss and take-profit of an open position.
    Protect {
        position: u64,
        symbol: String,
        sl: f64,
        tp: f64,
        magic: u64,
        comment: String,
    },
}

impl OrderRequest {
    pub fn symbol(&self) -> &str {
        match self {
            OrderRequest::Deal { symbol, .. } | OrderRequest::Protect { symbol, .. } => symbol,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub retcode: u32,
    pub ticket: u64,
    pub price: f64,
    pub comment: String,
}

impl OrderResult {
    pub fn is_done(&self) -> bool {
        self.retcode == RETCODE_DONE
    }

    /// Turn a non-done result into an `OrderRejected` error.
    pub fn into_result(self) -> Result<OrderResult> {
        if self.is_done() {
            Ok(self)
        } else {
            Err(crate::Error::OrderRejected {
                retcode: self.retcode,
                comment: self.comment,
            })
        }
    }
}

/// Entry point to the execution venue.
///
/// `PaperVenue` implements this for simulation and tests.
/// `BridgeVenue` implements this against a terminal bridge service.
///
/// Callers never connect directly: sessions are obtained through
/// `SessionBroker`, which enforces one open session per strategy.
#[async_trait]
pub trait Venue: Send + Sync {
    async fn connect(&self, identity: &VenueIdentity) -> Result<Box<dyn VenueSession>>;
}

/// A logged-in session scoped to one strategy's account.
#[async_trait]
pub trait VenueSession: Send {
    async fn account_info(&mut self) -> Result<AccountInfo>;

    /// Fails with `Error::MarketData` if the symbol cannot be selected.
    async fn symbol_info(&mut self, symbol: &str) -> Result<SymbolInfo>;

    /// Fails with `Error::MarketData` if no quote is available.
    async fn tick(&mut self, symbol: &str) -> Result<Tick>;

    async fn positions_get(&mut self, filter: &PositionFilter) -> Result<Vec<Position>>;

    /// Submit a request. A venue-side refusal is returned as a non-done
    /// `OrderResult`, not as `Err`.
    async fn order_send(&mut self, request: &OrderRequest) -> Result<OrderResult>;

    /// Log out. Called exactly once by the owning `StrategySession`, which
    /// keeps the strategy's lock until this returns.
    async fn disconnect(&mut self) -> Result<()>;
}
