use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use common::{
    age, order_tag, run_passes, scan_days, sleep_or_cancel, CancellationToken, EnrichedSignal,
    Error, LifecycleState, OrderRequest, PassSchedule, RejectionReason, Result, RetryPolicy,
    SessionBroker, SignalKey, StrategySession, Tick, VenueSession, DEFAULT_DEVIATION,
};
use policy::{PolicyStore, ReversalMode, StrategyPolicy};
use store::SignalStore;

use crate::order::send_deal;
use crate::reversal::{close_opposites, Reversal};

#[derive(Debug, Clone, Copy)]
pub struct ExecutionSettings {
    /// Pending signals whose alert is older than this are rejected.
    pub execution_window: Duration,
    /// Also bounds the attempts to save a settled signal.
    pub order_retry: RetryPolicy,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            execution_window: Duration::from_secs(300),
            order_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub executed: usize,
    pub rejected: usize,
    /// Left pending for the next pass.
    pub deferred: usize,
}

enum Outcome {
    /// Reached a terminal state, already persisted.
    Settled(LifecycleState),
    /// Try again next pass.
    Deferred(Error),
    /// Another pass settled it first.
    AlreadySettled,
}

/// Submits pending signals to the venue.
///
/// This is the only component that opens or closes positions. Each signal is
/// handled inside one exclusive session for its strategy and persisted as
/// soon as it settles, so a crash mid-pass cannot lose a fill.
///
/// A settled signal the store refused to save is held in memory. Its key is
/// never submitted again, and every later pass retries the save.
pub struct ExecutionEngine {
    signals: Arc<SignalStore>,
    policies: Arc<PolicyStore>,
    sessions: Arc<SessionBroker>,
    settings: ExecutionSettings,
    unsaved: Mutex<HashMap<SignalKey, EnrichedSignal>>,
}

impl ExecutionEngine {
    pub fn new(
        signals: Arc<SignalStore>,
        policies: Arc<PolicyStore>,
        sessions: Arc<SessionBroker>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            signals,
            policies,
            sessions,
            settings,
            unsaved: Mutex::new(HashMap::new()),
        }
    }

    /// Run passes on `schedule` until shutdown.
    pub async fn run(&self, schedule: PassSchedule, shutdown: CancellationToken) {
        let token = shutdown.clone();
        run_passes("execution", schedule, shutdown, || {
            let token = &token;
            async move { self.run_pass(Utc::now(), token).await.map(|_| ()) }
        })
        .await;
    }

    pub async fn run_pass(
        &self,
        now: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> Result<ExecutionReport> {
        self.policies.refresh();
        self.save_held();
        let mut report = ExecutionReport::default();

        for day in scan_days(now) {
            let mut pending: Vec<EnrichedSignal> = self
                .signals
                .load(day)?
                .into_iter()
                .filter(|s| s.state == LifecycleState::PendingExecution)
                .filter(|s| !self.held().contains_key(&s.key()))
                .collect();
            pending.sort_by_key(|s| s.timestamp);

            for signal in pending {
                if shutdown.is_cancelled() {
                    return Ok(report);
                }
                let outcome = self
                    .execute(signal.clone(), now, shutdown)
                    .await
                    .unwrap_or_else(Outcome::Deferred);
                match outcome {
                    Outcome::Settled(LifecycleState::Executed) => report.executed += 1,
                    Outcome::Settled(_) => report.rejected += 1,
                    Outcome::AlreadySettled => {}
                    Outcome::Deferred(e) => {
                        warn!(
                            strategy = %signal.strategy_id,
                            symbol = %signal.symbol,
                            side = %signal.side,
                            decision = "deferred",
                            error = %e,
                            "Signal left pending"
                        );
                        report.deferred += 1;
                    }
                }
            }
        }

        if report != ExecutionReport::default() {
            info!(
                executed = report.executed,
                rejected = report.rejected,
                deferred = report.deferred,
                "Execution pass complete"
            );
        }
        Ok(report)
    }

    async fn execute(
        &self,
        signal: EnrichedSignal,
        now: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> Result<Outcome> {
        if age(now, signal.timestamp) >= self.settings.execution_window {
            let reason = RejectionReason::ExpiredBeforeExecution;
            return Ok(self.reject(signal, reason, now, shutdown).await);
        }
        let policy = match self.policies.policy(&signal.strategy_id) {
            Ok(Some(policy)) => policy,
            Ok(None) => {
                let reason = RejectionReason::PolicyMissing;
                return Ok(self.reject(signal, reason, now, shutdown).await);
            }
            Err(e) => return Ok(Outcome::Deferred(e)),
        };
        if !policy.enabled {
            let reason = RejectionReason::StrategyDisabled;
            return Ok(self.reject(signal, reason, now, shutdown).await);
        }
        let identity = match policy.venue.identity(&signal.strategy_id) {
            Ok(identity) => identity,
            Err(e) => return Ok(Outcome::Deferred(e)),
        };
        let mut session = match self.sessions.acquire(&identity).await {
            Ok(session) => session,
            Err(e) => return Ok(Outcome::Deferred(e)),
        };
        let outcome = self
            .execute_in_session(&mut session, signal, &policy, now, shutdown)
            .await;
        session.release().await;
        outcome
    }

    async fn execute_in_session(
        &self,
        session: &mut StrategySession,
        mut signal: EnrichedSignal,
        policy: &StrategyPolicy,
        now: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> Result<Outcome> {
        // The session serializes this strategy; re-read under it so a
        // concurrent pass cannot submit the same signal twice.
        if !self.still_pending(&signal)? {
            return Ok(Outcome::AlreadySettled);
        }

        let tick = match market_quote(&mut **session, &signal.symbol).await {
            Ok(tick) => tick,
            Err(Error::MarketData { reason, .. }) => {
                let reason = RejectionReason::MarketData(reason);
                return Ok(self.reject(signal, reason, now, shutdown).await);
            }
            Err(e) => return Ok(Outcome::Deferred(e)),
        };

        let reversal = close_opposites(
            &mut **session,
            &signal,
            policy,
            &tick,
            &self.settings.order_retry,
            shutdown,
        )
        .await;
        let netting = policy.reversal.mode == ReversalMode::Netting;
        match reversal {
            Ok(Reversal::Closed { count, last }) if netting => {
                info!(
                    strategy = %signal.strategy_id,
                    symbol = %signal.symbol,
                    closed = count,
                    decision = "executed",
                    "Netting close completes the signal"
                );
                signal.mark_executed(last.ticket, last.price, now);
                return Ok(self.settle(signal, shutdown).await);
            }
            Ok(_) => {}
            Err(Error::PartialReversal { closed, total, .. }) => {
                error!(
                    strategy = %signal.strategy_id,
                    symbol = %signal.symbol,
                    closed,
                    total,
                    "Reversal incomplete, new leg suppressed"
                );
                let reason = RejectionReason::PartialReversal { closed, total };
                return Ok(self.reject(signal, reason, now, shutdown).await);
            }
            Err(e) => return Ok(Outcome::Deferred(e)),
        }

        let open = |filling| OrderRequest::Deal {
            symbol: signal.symbol.clone(),
            side: signal.side,
            volume: signal.lot_size,
            price: tick.entry_price(signal.side),
            deviation: DEFAULT_DEVIATION,
            magic: policy.magic,
            comment: order_tag(&signal.strategy_id),
            filling,
            position: None,
        };
        let result = send_deal(
            &mut **session,
            &self.settings.order_retry,
            shutdown,
            "open",
            open,
        )
        .await;
        match result {
            Ok(fill) => {
                info!(
                    strategy = %signal.strategy_id,
                    symbol = %signal.symbol,
                    side = %signal.side,
                    lots = signal.lot_size,
                    ticket = fill.ticket,
                    price = fill.price,
                    decision = "executed",
                    "Order filled"
                );
                signal.mark_executed(fill.ticket, fill.price, now);
                Ok(self.settle(signal, shutdown).await)
            }
            Err(e) => Ok(Outcome::Deferred(e)),
        }
    }

    fn still_pending(&self, signal: &EnrichedSignal) -> Result<bool> {
        let key = signal.key();
        if self.held().contains_key(&key) {
            return Ok(false);
        }
        Ok(self
            .signals
            .load(signal.timestamp.date_naive())?
            .iter()
            .any(|s| s.key() == key && s.state == LifecycleState::PendingExecution))
    }

    async fn reject(
        &self,
        mut signal: EnrichedSignal,
        reason: RejectionReason,
        now: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> Outcome {
        warn!(
            strategy = %signal.strategy_id,
            symbol = %signal.symbol,
            side = %signal.side,
            decision = "rejected",
            reason = %reason,
            "Signal rejected"
        );
        signal.mark_rejected(&reason, now);
        self.settle(signal, shutdown).await
    }

    /// Persist a settled signal, retrying the write. If every attempt fails
    /// the signal is held in memory; it is settled either way.
    async fn settle(&self, signal: EnrichedSignal, shutdown: &CancellationToken) -> Outcome {
        let state = signal.state;
        let retry = self.settings.order_retry;
        let mut attempt = 1;
        loop {
            let err = match self.signals.merge(std::slice::from_ref(&signal)) {
                Ok(()) => return Outcome::Settled(state),
                Err(e) => e,
            };
            if attempt >= retry.max_attempts || shutdown.is_cancelled() {
                error!(
                    strategy = %signal.strategy_id,
                    symbol = %signal.symbol,
                    state = %state,
                    error = %err,
                    "Settled signal not saved, holding it until a later pass saves it"
                );
                self.held().insert(signal.key(), signal);
                return Outcome::Settled(state);
            }
            warn!(
                strategy = %signal.strategy_id,
                attempt,
                error = %err,
                "Saving settled signal failed, retrying"
            );
            sleep_or_cancel(shutdown, retry.delay).await;
            attempt += 1;
        }
    }

    /// Retry the saves that failed in earlier passes.
    fn save_held(&self) {
        let held: Vec<EnrichedSignal> = self.held().values().cloned().collect();
        if held.is_empty() {
            return;
        }
        match self.signals.merge(&held) {
            Ok(()) => {
                let mut unsaved = self.held();
                for signal in &held {
                    unsaved.remove(&signal.key());
                }
                info!(count = held.len(), "Held settled signals saved");
            }
            Err(e) => warn!(count = held.len(), error = %e, "Held settled signals still unsaved"),
        }
    }

    fn held(&self) -> MutexGuard<'_, HashMap<SignalKey, EnrichedSignal>> {
        self.unsaved.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Select the symbol and read its quote.
async fn market_quote(session: &mut dyn VenueSession, symbol: &str) -> Result<Tick> {
    session.symbol_info(symbol).await?;
    session.tick(symbol).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use common::{AlertRecord, FillPolicy, Position, Side};
    use paper::PaperVenue;

    const POLICIES: &str = r#"
[strategies.strategyA]
allowed_symbols = ["EURUSD", "USDJPY"]
allowed_actions = ["buy", "sell"]
magic = 1001
sizing = { mode = "fixed", lots = 0.10 }
protection = { mode = "fixed_pips", sl_pips = 20, tp_pips = 40 }

[strategies.closer]
allowed_symbols = ["EURUSD"]
allowed_actions = ["buy", "sell"]
magic = 2002
sizing = { mode = "fixed", lots = 0.10 }
protection = { mode = "fixed_pips", sl_pips = 20, tp_pips = 40 }
reversal = { mode = "close", magic_restriction = true }

[strategies.netter]
allowed_symbols = ["EURUSD"]
allowed_actions = ["buy", "sell"]
magic = 3003
sizing = { mode = "fixed", lots = 0.10 }
protection = { mode = "fixed_pips", sl_pips = 20, tp_pips = 40 }
reversal = { mode = "netting" }
"#;

    struct Harness {
        _dir: tempfile::TempDir,
        signals: Arc<SignalStore>,
        venue: PaperVenue,
        engine: ExecutionEngine,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let signals = Arc::new(SignalStore::new(dir.path()));
        let policies = Arc::new(PolicyStore::from_toml_str(POLICIES).unwrap());
        let venue = PaperVenue::with_standard_symbols(10_000.0, 0.0);
        let sessions = Arc::new(SessionBroker::new(Arc::new(venue.clone())));
        let settings = ExecutionSettings {
            execution_window: Duration::from_secs(300),
            order_retry: RetryPolicy::new(2, Duration::from_millis(1)),
        };
        let engine = ExecutionEngine::new(signals.clone(), policies, sessions, settings);
        Harness {
            _dir: dir,
            signals,
            venue,
            engine,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap()
    }

    fn pending(h: &Harness, strategy: &str, symbol: &str, side: Side, seconds_ago: i64) {
        let alert = AlertRecord {
            timestamp: now() - ChronoDuration::seconds(seconds_ago),
            symbol: symbol.into(),
            side,
            timeframe: "15".into(),
            strategy_id: strategy.into(),
            consumed: true,
        };
        let signal = EnrichedSignal::pending(&alert, 0.10, "fixed_pips", now());
        h.signals.merge(&[signal]).unwrap();
    }

    fn stored(h: &Harness) -> Vec<EnrichedSignal> {
        h.signals.load(now().date_naive()).unwrap()
    }

    fn short(ticket: u64, magic: u64) -> Position {
        Position {
            ticket,
            symbol: "EURUSD".into(),
            side: Side::Sell,
            open_price: 1.0870,
            sl: 0.0,
            tp: 0.0,
            volume: 0.3,
            opened_at: now() - ChronoDuration::minutes(10),
            magic,
            comment: "other_auto".into(),
        }
    }

    async fn pass(h: &Harness) -> ExecutionReport {
        h.engine
            .run_pass(now(), &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pending_buy_is_filled_and_stamped() {
        let h = harness();
        pending(&h, "strategyA", "EURUSD", Side::Buy, 5);

        let report = pass(&h).await;
        assert_eq!(report.executed, 1);

        let signal = &stored(&h)[0];
        assert_eq!(signal.state, LifecycleState::Executed);
        let positions = h.venue.positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(signal.order_ticket, Some(positions[0].ticket));
        assert_eq!(signal.fill_price, Some(1.08510));
        assert_eq!(signal.executed_at, Some(now()));
        assert_eq!(positions[0].volume, 0.10);
        assert_eq!(positions[0].magic, 1001);
        assert_eq!(positions[0].strategy_id(), Some("strategyA"));
    }

    #[tokio::test]
    async fn executed_signal_is_never_resubmitted() {
        let h = harness();
        pending(&h, "strategyA", "EURUSD", Side::Buy, 5);

        pass(&h).await;
        let second = pass(&h).await;

        assert_eq!(second, ExecutionReport::default());
        assert_eq!(h.venue.positions().len(), 1);
    }

    #[tokio::test]
    async fn signal_past_window_expires() {
        let h = harness();
        pending(&h, "strategyA", "EURUSD", Side::Buy, 301);

        let report = pass(&h).await;
        assert_eq!(report.rejected, 1);

        let signal = &stored(&h)[0];
        assert_eq!(signal.state, LifecycleState::Rejected);
        assert_eq!(signal.rejection_reason.as_deref(), Some("expired before execution"));
        assert!(h.venue.orders().is_empty());
    }

    #[tokio::test]
    async fn unknown_symbol_rejects_the_signal() {
        let h = harness();
        pending(&h, "strategyA", "USDJPY", Side::Buy, 5);

        pass(&h).await;

        let signal = &stored(&h)[0];
        assert_eq!(signal.state, LifecycleState::Rejected);
        assert!(signal
            .rejection_reason
            .as_deref()
            .unwrap()
            .starts_with("market data unavailable"));
    }

    #[tokio::test]
    async fn unreachable_venue_leaves_signal_pending() {
        let h = harness();
        h.venue.refuse_login("strategyA");
        pending(&h, "strategyA", "EURUSD", Side::Buy, 5);

        let report = pass(&h).await;
        assert_eq!(report.deferred, 1);
        assert_eq!(stored(&h)[0].state, LifecycleState::PendingExecution);
    }

    #[tokio::test]
    async fn exhausted_fill_policies_defer_without_position() {
        let h = harness();
        for f in FillPolicy::PRIORITY {
            h.venue.disable_filling(f);
        }
        pending(&h, "strategyA", "EURUSD", Side::Buy, 5);

        let report = pass(&h).await;
        assert_eq!(report.deferred, 1);
        assert_eq!(stored(&h)[0].state, LifecycleState::PendingExecution);
        // Two attempts, three fill policies each.
        assert_eq!(h.venue.orders().len(), 6);
        assert!(h.venue.positions().is_empty());
    }

    #[tokio::test]
    async fn close_mode_flattens_then_opens() {
        let h = harness();
        h.venue.seed_position(short(50, 2002));
        h.venue.seed_position(short(51, 9999));
        pending(&h, "closer", "EURUSD", Side::Buy, 5);

        let report = pass(&h).await;
        assert_eq!(report.executed, 1);

        let positions = h.venue.positions();
        let tickets: Vec<u64> = positions.iter().map(|p| p.ticket).collect();
        assert!(tickets.contains(&51), "foreign magic must survive");
        assert!(!tickets.contains(&50));
        assert!(positions.iter().any(|p| p.side == Side::Buy && p.magic == 2002));
    }

    #[tokio::test]
    async fn netting_close_is_the_whole_trade() {
        let h = harness();
        h.venue.seed_position(short(60, 3003));
        pending(&h, "netter", "EURUSD", Side::Buy, 5);

        let report = pass(&h).await;
        assert_eq!(report.executed, 1);
        assert!(h.venue.positions().is_empty());

        let signal = &stored(&h)[0];
        assert_eq!(signal.state, LifecycleState::Executed);
        assert!(signal.order_ticket.is_some());
    }

    #[tokio::test]
    async fn netting_without_opposite_opens_normally() {
        let h = harness();
        pending(&h, "netter", "EURUSD", Side::Sell, 5);

        pass(&h).await;

        let positions = h.venue.positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, Side::Sell);
    }

    #[tokio::test]
    async fn failed_reversal_close_suppresses_new_leg() {
        let h = harness();
        h.venue.seed_position(short(70, 2002));
        h.venue.reject_close_of(70);
        pending(&h, "closer", "EURUSD", Side::Buy, 5);

        let report = pass(&h).await;
        assert_eq!(report.rejected, 1);

        let signal = &stored(&h)[0];
        assert_eq!(signal.state, LifecycleState::Rejected);
        assert_eq!(
            signal.rejection_reason.as_deref(),
            Some("reversal incomplete: closed 0 of 1")
        );
        let positions = h.venue.positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].ticket, 70);
    }

    #[tokio::test]
    async fn concurrent_passes_submit_once() {
        let h = harness();
        pending(&h, "strategyA", "EURUSD", Side::Buy, 5);
        let token = CancellationToken::new();

        let (a, b) = tokio::join!(
            h.engine.run_pass(now(), &token),
            h.engine.run_pass(now(), &token)
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(h.venue.positions().len(), 1);
        assert_eq!(h.venue.max_concurrent_sessions("strategyA"), 1);
        assert_eq!(stored(&h)[0].state, LifecycleState::Executed);
    }

    #[tokio::test]
    async fn fill_that_cannot_be_saved_is_not_sent_again() {
        let h = harness();
        pending(&h, "strategyA", "EURUSD", Side::Buy, 5);
        // A directory where the atomic replace puts its temp file makes
        // every write of this day fail.
        let blocker = h.signals.path_for(now().date_naive()).with_extension("csv.tmp");
        std::fs::create_dir(&blocker).unwrap();

        let first = pass(&h).await;
        assert_eq!(first.executed, 1);
        assert_eq!(stored(&h)[0].state, LifecycleState::PendingExecution);

        let second = pass(&h).await;
        assert_eq!(second, ExecutionReport::default());
        assert_eq!(h.venue.orders().len(), 1);

        std::fs::remove_dir(&blocker).unwrap();
        pass(&h).await;

        let signal = &stored(&h)[0];
        assert_eq!(signal.state, LifecycleState::Executed);
        assert_eq!(signal.order_ticket, Some(h.venue.positions()[0].ticket));
        assert_eq!(h.venue.orders().len(), 1);
        assert_eq!(h.venue.positions().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_pass_does_nothing() {
        let h = harness();
        pending(&h, "strategyA", "EURUSD", Side::Buy, 5);
        let token = CancellationToken::new();
        token.cancel();

        let report = h.engine.run_pass(now(), &token).await.unwrap();
        assert_eq!(report, ExecutionReport::default());
        assert!(h.venue.orders().is_empty());
    }
}
