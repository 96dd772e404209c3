use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use common::{
    AccountInfo, Error, FillPolicy, OrderRequest, OrderResult, Position, PositionFilter, Result,
    Side, SymbolInfo, Tick, Venue, VenueIdentity, VenueSession, RETCODE_DONE, RETCODE_INVALID,
    RETCODE_INVALID_FILL, RETCODE_REJECT,
};

/// Simulated execution venue for paper trading and tests.
///
/// Deals fill at the current quote with configurable slippage. Nothing ever
/// leaves the process. Failure knobs (refused logins, rejected requests,
/// unsupported fill policies) let callers exercise every fault path.
#[derive(Clone)]
pub struct PaperVenue {
    state: Arc<Mutex<PaperState>>,
    /// Slippage in basis points applied to all fills.
    slippage_bps: f64,
}

#[derive(Default)]
struct PaperState {
    balance: f64,
    account_unavailable: bool,
    symbols: HashMap<String, SymbolInfo>,
    ticks: HashMap<String, Tick>,
    positions: Vec<Position>,
    next_ticket: u64,
    unsupported_fillings: HashSet<FillPolicy>,
    /// Next N requests of any kind are refused.
    pending_rejections: u32,
    rejected_closes: HashSet<u64>,
    refused_logins: HashSet<String>,
    orders: Vec<OrderRequest>,
    open_sessions: HashMap<String, usize>,
    max_open_sessions: HashMap<String, usize>,
}

impl PaperVenue {
    pub fn new(initial_balance: f64, slippage_bps: f64) -> Self {
        info!(
            balance = initial_balance,
            slippage_bps = slippage_bps,
            "PaperVenue initialized"
        );
        Self {
            state: Arc::new(Mutex::new(PaperState {
                balance: initial_balance,
                next_ticket: 1_000,
                ..PaperState::default()
            })),
            slippage_bps,
        }
    }

    /// A venue quoting a small fixed set of instruments.
    pub fn with_standard_symbols(initial_balance: f64, slippage_bps: f64) -> Self {
        let venue = Self::new(initial_balance, slippage_bps);
        venue.add_symbol(symbol("EURUSD", 0.00001, 5, 1.0), quote(1.08500, 1.08510));
        venue.add_symbol(symbol("GBPUSD", 0.00001, 5, 1.0), quote(1.26500, 1.26512));
        venue.add_symbol(symbol("XAUUSD", 0.01, 2, 1.0), quote(2000.00, 2000.30));
        venue.add_symbol(symbol("BTCUSD", 0.01, 2, 0.01), quote(60_000.00, 60_010.00));
        venue
    }

    pub fn add_symbol(&self, info: SymbolInfo, tick: Tick) {
        let mut state = self.lock();
        state.ticks.insert(info.symbol.clone(), tick);
        state.symbols.insert(info.symbol.clone(), info);
    }

    pub fn set_tick(&self, symbol: &str, tick: Tick) {
        self.lock().ticks.insert(symbol.to_string(), tick);
    }

    pub fn remove_tick(&self, symbol: &str) {
        self.lock().ticks.remove(symbol);
    }

    pub fn set_balance(&self, balance: f64) {
        self.lock().balance = balance;
    }

    pub fn set_account_unavailable(&self, unavailable: bool) {
        self.lock().account_unavailable = unavailable;
    }

    /// Insert a position as if it had been opened earlier.
    pub fn seed_position(&self, position: Position) {
        let mut state = self.lock();
        state.next_ticket = state.next_ticket.max(position.ticket + 1);
        state.positions.push(position);
    }

    pub fn positions(&self) -> Vec<Position> {
        self.lock().positions.clone()
    }

    /// Every request received, accepted or not, in arrival order.
    pub fn orders(&self) -> Vec<OrderRequest> {
        self.lock().orders.clone()
    }

    pub fn reject_next(&self, count: u32) {
        self.lock().pending_rejections = count;
    }

    pub fn reject_close_of(&self, ticket: u64) {
        self.lock().rejected_closes.insert(ticket);
    }

    pub fn disable_filling(&self, filling: FillPolicy) {
        self.lock().unsupported_fillings.insert(filling);
    }

    pub fn refuse_login(&self, strategy_id: &str) {
        self.lock().refused_logins.insert(strategy_id.to_string());
    }

    /// Highest number of simultaneously open sessions seen for a strategy.
    pub fn max_concurrent_sessions(&self, strategy_id: &str) -> usize {
        self.lock()
            .max_open_sessions
            .get(strategy_id)
            .copied()
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub fn symbol(name: &str, point: f64, digits: u32, tick_value: f64) -> SymbolInfo {
    SymbolInfo {
        symbol: name.to_string(),
        point,
        digits,
        tick_value,
        volume_min: 0.01,
    }
}

pub fn quote(bid: f64, ask: f64) -> Tick {
    Tick {
        bid,
        ask,
        last: (bid + ask) / 2.0,
    }
}

#[async_trait]
impl Venue for PaperVenue {
    async fn connect(&self, identity: &VenueIdentity) -> Result<Box<dyn VenueSession>> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        if state.refused_logins.contains(&identity.strategy_id) {
            return Err(Error::VenueConnect {
                strategy: identity.strategy_id.clone(),
                reason: "login refused".into(),
            });
        }
        let open = {
            let open = state
                .open_sessions
                .entry(identity.strategy_id.clone())
                .or_insert(0);
            *open += 1;
            *open
        };
        let max = state
            .max_open_sessions
            .entry(identity.strategy_id.clone())
            .or_insert(0);
        *max = (*max).max(open);
        debug!(strategy = %identity.strategy_id, "Paper session opened");

        Ok(Box::new(PaperSession {
            strategy_id: identity.strategy_id.clone(),
            venue: self.clone(),
        }))
    }
}

struct PaperSession {
    strategy_id: String,
    venue: PaperVenue,
}

impl PaperSession {
    fn fill_price(&self, side: Side, tick: &Tick) -> f64 {
        let mid = tick.entry_price(side);
        match side {
            Side::Buy => mid * (1.0 + self.venue.slippage_bps / 10_000.0),
            Side::Sell => mid * (1.0 - self.venue.slippage_bps / 10_000.0),
        }
    }
}

fn refused(retcode: u32, comment: &str) -> OrderResult {
    OrderResult {
        retcode,
        ticket: 0,
        price: 0.0,
        comment: comment.to_string(),
    }
}

#[async_trait]
impl VenueSession for PaperSession {
    async fn account_info(&mut self) -> Result<AccountInfo> {
        tokio::task::yield_now().await;
        let state = self.venue.lock();
        if state.account_unavailable {
            return Err(Error::Venue("account info unavailable".into()));
        }
        Ok(AccountInfo {
            balance: state.balance,
        })
    }

    async fn symbol_info(&mut self, symbol: &str) -> Result<SymbolInfo> {
        self.venue
            .lock()
            .symbols
            .get(symbol)
            .cloned()
            .ok_or_else(|| Error::MarketData {
                symbol: symbol.to_string(),
                reason: "symbol not selectable".into(),
            })
    }

    async fn tick(&mut self, symbol: &str) -> Result<Tick> {
        self.venue
            .lock()
            .ticks
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::MarketData {
                symbol: symbol.to_string(),
                reason: "no tick".into(),
            })
    }

    async fn positions_get(&mut self, filter: &PositionFilter) -> Result<Vec<Position>> {
        tokio::task::yield_now().await;
        Ok(self
            .venue
            .lock()
            .positions
            .iter()
            .filter(|p| filter.symbol.as_ref().map_or(true, |s| &p.symbol == s))
            .filter(|p| filter.magic.map_or(true, |m| p.magic == m))
            .cloned()
            .collect())
    }

    async fn order_send(&mut self, request: &OrderRequest) -> Result<OrderResult> {
        tokio::task::yield_now().await;
        let mut state = self.venue.lock();
        state.orders.push(request.clone());

        if state.pending_rejections > 0 {
            state.pending_rejections -= 1;
            return Ok(refused(RETCODE_REJECT, "Requote"));
        }

        match request {
            OrderRequest::Deal {
                symbol,
                side,
                volume,
                magic,
                comment,
                filling,
                position,
                ..
            } => {
                if state.unsupported_fillings.contains(filling) {
                    return Ok(refused(RETCODE_INVALID_FILL, "Unsupported filling mode"));
                }
                let Some(tick) = state.ticks.get(symbol).copied() else {
                    return Ok(refused(RETCODE_INVALID, "Unknown symbol"));
                };
                let price = self.fill_price(*side, &tick);
                let ticket = state.next_ticket;
                state.next_ticket += 1;

                match position {
                    Some(target) => {
                        if state.rejected_closes.contains(target) {
                            return Ok(refused(RETCODE_REJECT, "Close rejected"));
                        }
                        let Some(idx) = state.positions.iter().position(|p| p.ticket == *target)
                        else {
                            return Ok(refused(RETCODE_INVALID, "Position not found"));
                        };
                        let closed = state.positions.remove(idx);
                        debug!(ticket = closed.ticket, price, "Paper position closed");
                    }
                    None => {
                        state.positions.push(Position {
                            ticket,
                            symbol: symbol.clone(),
                            side: *side,
                            open_price: price,
                            sl: 0.0,
                            tp: 0.0,
                            volume: *volume,
                            opened_at: Utc::now(),
                            magic: *magic,
                            comment: comment.clone(),
                        });
                        debug!(
                            ticket,
                            symbol = %symbol,
                            side = %side,
                            price,
                            "Paper position opened"
                        );
                    }
                }

                Ok(OrderResult {
                    retcode: RETCODE_DONE,
                    ticket,
                    price,
                    comment: "Request executed".into(),
                })
            }
            OrderRequest::Protect {
                position, sl, tp, ..
            } => {
                let Some(pos) = state.positions.iter_mut().find(|p| p.ticket == *position) else {
                    return Ok(refused(RETCODE_INVALID, "Position not found"));
                };
                pos.sl = *sl;
                pos.tp = *tp;
                Ok(OrderResult {
                    retcode: RETCODE_DONE,
                    ticket: *position,
                    price: 0.0,
                    comment: "Request executed".into(),
                })
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut state = self.venue.lock();
        if let Some(open) = state.open_sessions.get_mut(&self.strategy_id) {
            *open = open.saturating_sub(1);
        }
        debug!(strategy = %self.strategy_id, "Paper session closed");
        Ok(())
    }
}
