use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use common::{
    age, run_passes, scan_days, CancellationToken, LifecycleState, OrderRequest,
    OrderResult, PassSchedule, Position, PositionFilter, Result, RetryPolicy, SessionBroker,
    StrategySession,
};
use policy::{PolicyStore, ProtectionPolicy, StrategyPolicy};
use store::SignalStore;

use crate::cooldown::CooldownCache;
use crate::protection::{needs_update, target_levels, Levels, MarketContext};

#[derive(Debug, Clone, Copy)]
pub struct RiskSettings {
    /// Positions younger than this are left alone.
    pub min_position_age: Duration,
    /// Minimum time between two modifications of one position.
    pub cooldown: Duration,
    /// Changes of at most this many points on both levels are not sent.
    pub noop_ticks: u32,
    pub modify_retry: RetryPolicy,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            min_position_age: Duration::from_secs(30),
            cooldown: Duration::from_secs(60),
            noop_ticks: 5,
            modify_retry: RetryPolicy::new(3, Duration::from_secs(5)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiskReport {
    pub modified: usize,
    pub unchanged: usize,
    /// Too young or cooling down.
    pub skipped: usize,
    /// Could not be evaluated or modified this pass.
    pub deferred: usize,
}

/// Keeps each open position's stop-loss and take-profit in line with its
/// strategy's protection policy.
///
/// Positions are found per strategy by magic number and order tag. The
/// manager never opens or closes positions.
pub struct PositionRiskManager {
    policies: Arc<PolicyStore>,
    sessions: Arc<SessionBroker>,
    journal: Option<Arc<SignalStore>>,
    settings: RiskSettings,
    cooldowns: Mutex<CooldownCache>,
}

impl PositionRiskManager {
    pub fn new(
        policies: Arc<PolicyStore>,
        sessions: Arc<SessionBroker>,
        settings: RiskSettings,
    ) -> Self {
        Self {
            policies,
            sessions,
            journal: None,
            cooldowns: Mutex::new(CooldownCache::new(settings.cooldown)),
            settings,
        }
    }

    /// Advance executed signals to `ProtectionApplied` on their first
    /// accepted modification.
    pub fn with_journal(mut self, signals: Arc<SignalStore>) -> Self {
        self.journal = Some(signals);
        self
    }

    /// Run passes on `schedule` until shutdown.
    pub async fn run(&self, schedule: PassSchedule, shutdown: CancellationToken) {
        let token = shutdown.clone();
        run_passes("risk", schedule, shutdown, || {
            let token = &token;
            async move { self.run_pass(Utc::now(), token).await.map(|_| ()) }
        })
        .await;
    }

    pub async fn run_pass(
        &self,
        now: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> Result<RiskReport> {
        self.policies.refresh();
        let evicted = self.cooldowns().evict(now);
        if evicted > 0 {
            debug!(evicted, "Expired cooldown entries dropped");
        }

        let mut report = RiskReport::default();
        for strategy_id in self.policies.strategy_ids() {
            if shutdown.is_cancelled() {
                break;
            }
            let policy = match self.policies.policy(&strategy_id) {
                Ok(Some(policy)) if policy.enabled => policy,
                Ok(_) => continue,
                Err(e) => {
                    warn!(
                        strategy = %strategy_id,
                        error = %e,
                        "Policy unreadable, strategy skipped"
                    );
                    continue;
                }
            };
            if let Err(e) = self
                .manage_strategy(&strategy_id, &policy, now, shutdown, &mut report)
                .await
            {
                warn!(strategy = %strategy_id, error = %e, "Risk pass for strategy deferred");
            }
        }

        if report.modified > 0 || report.deferred > 0 {
            info!(
                modified = report.modified,
                unchanged = report.unchanged,
                skipped = report.skipped,
                deferred = report.deferred,
                "Risk pass complete"
            );
        }
        Ok(report)
    }

    async fn manage_strategy(
        &self,
        strategy_id: &str,
        policy: &StrategyPolicy,
        now: DateTime<Utc>,
        shutdown: &CancellationToken,
        report: &mut RiskReport,
    ) -> Result<()> {
        let identity = policy.venue.identity(strategy_id)?;
        let mut session = self.sessions.acquire(&identity).await?;
        let managed = self
            .manage_in_session(&mut session, strategy_id, policy, now, shutdown, report)
            .await;
        session.release().await;
        managed
    }

    async fn manage_in_session(
        &self,
        session: &mut StrategySession,
        strategy_id: &str,
        policy: &StrategyPolicy,
        now: DateTime<Utc>,
        shutdown: &CancellationToken,
        report: &mut RiskReport,
    ) -> Result<()> {
        let filter = PositionFilter {
            symbol: None,
            magic: Some(policy.magic),
        };
        let positions: Vec<Position> = session
            .positions_get(&filter)
            .await?
            .into_iter()
            .filter(|p| p.strategy_id() == Some(strategy_id))
            .collect();
        if positions.is_empty() {
            return Ok(());
        }

        let balance = match policy.protection {
            ProtectionPolicy::PercentBalance { .. } => session.account_info().await?.balance,
            ProtectionPolicy::FixedPips { .. } => 0.0,
        };

        for position in positions {
            if shutdown.is_cancelled() {
                break;
            }
            let key = (strategy_id.to_string(), position.ticket);
            if age(now, position.opened_at) < self.settings.min_position_age
                || self.cooldowns().is_cooling(&key, now)
            {
                report.skipped += 1;
                continue;
            }

            match self
                .manage_position(session, policy, &position, balance, shutdown)
                .await
            {
                Ok(true) => {
                    self.cooldowns().record(key, now);
                    report.modified += 1;
                    self.journal_protection(strategy_id, position.ticket, now);
                }
                Ok(false) => report.unchanged += 1,
                Err(e) => {
                    warn!(
                        strategy = %strategy_id,
                        ticket = position.ticket,
                        symbol = %position.symbol,
                        decision = "deferred",
                        error = %e,
                        "Position left as is"
                    );
                    report.deferred += 1;
                }
            }
        }
        Ok(())
    }

    /// Returns whether a modification was accepted.
    async fn manage_position(
        &self,
        session: &mut StrategySession,
        policy: &StrategyPolicy,
        position: &Position,
        balance: f64,
        shutdown: &CancellationToken,
    ) -> Result<bool> {
        let info = session.symbol_info(&position.symbol).await?;
        let tick = session.tick(&position.symbol).await?;
        let market = MarketContext {
            symbol: &info,
            tick,
            balance,
        };
        let target = target_levels(&policy.protection, position, &market)?;
        let current = Levels::of(position);
        if !needs_update(current, target, info.point, self.settings.noop_ticks) {
            debug!(
                ticket = position.ticket,
                sl = target.sl,
                tp = target.tp,
                "Levels already in place"
            );
            return Ok(false);
        }

        let request = OrderRequest::Protect {
            position: position.ticket,
            symbol: position.symbol.clone(),
            sl: target.sl,
            tp: target.tp,
            magic: policy.magic,
            comment: format!("Auto-{}", policy.protection.label()),
        };
        let retry = &self.settings.modify_retry;
        let mut attempt = 1;
        loop {
            match session
                .order_send(&request)
                .await
                .and_then(OrderResult::into_result)
            {
                Ok(_) => break,
                Err(e) => retry.next_attempt(shutdown, "modify", attempt, e).await?,
            }
            attempt += 1;
        }

        info!(
            strategy = %session.strategy_id(),
            ticket = position.ticket,
            symbol = %position.symbol,
            old_sl = current.sl,
            old_tp = current.tp,
            sl = target.sl,
            tp = target.tp,
            mode = policy.protection.label(),
            decision = "modified",
            "Protection updated"
        );
        Ok(true)
    }

    /// Best effort: a journal failure never undoes a venue modification.
    fn journal_protection(&self, strategy_id: &str, ticket: u64, now: DateTime<Utc>) {
        let Some(signals) = &self.journal else {
            return;
        };
        let result: Result<()> = scan_days(now).into_iter().try_for_each(|day| {
            let stamped: Vec<_> = signals
                .load(day)?
                .into_iter()
                .filter(|s| {
                    s.strategy_id == strategy_id
                        && s.order_ticket == Some(ticket)
                        && s.state == LifecycleState::Executed
                })
                .filter_map(|mut s| {
                    s.advance(LifecycleState::ProtectionApplied, now)
                        .then_some(s)
                })
                .collect();
            signals.merge(&stamped)
        });
        if let Err(e) = result {
            warn!(strategy = %strategy_id, ticket, error = %e, "Could not journal protection");
        }
    }

    fn cooldowns(&self) -> MutexGuard<'_, CooldownCache> {
        self.cooldowns.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Number of positions currently in cooldown.
    pub fn cooling_count(&self) -> usize {
        self.cooldowns().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use common::{order_tag, AlertRecord, EnrichedSignal, Side};
    use paper::PaperVenue;

    const POLICIES: &str = r#"
[strategies.strategyA]
allowed_symbols = ["EURUSD"]
allowed_actions = ["buy", "sell"]
magic = 1001
sizing = { mode = "fixed", lots = 0.10 }
protection = { mode = "fixed_pips", sl_pips = 20, tp_pips = 40, trailing = { activate_at_pips = 15, lock_pips = 5 } }

[strategies.gold]
allowed_symbols = ["XAUUSD"]
allowed_actions = ["buy", "sell"]
magic = 2002
sizing = { mode = "fixed", lots = 1.0 }
protection = { mode = "percent_balance", sl_percent = 1.0, tp_percent = 2.0 }

[strategies.paused]
enabled = false
allowed_symbols = ["EURUSD"]
allowed_actions = ["buy"]
magic = 3003
sizing = { mode = "fixed", lots = 0.10 }
protection = { mode = "fixed_pips", sl_pips = 20, tp_pips = 40 }
"#;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn later(secs: i64) -> DateTime<Utc> {
        now() + ChronoDuration::seconds(secs)
    }

    fn position(ticket: u64, strategy: &str, magic: u64, symbol: &str, open: f64) -> Position {
        Position {
            ticket,
            symbol: symbol.into(),
            side: Side::Buy,
            open_price: open,
            sl: 0.0,
            tp: 0.0,
            volume: 1.0,
            opened_at: now() - ChronoDuration::minutes(10),
            magic,
            comment: order_tag(strategy),
        }
    }

    fn manager(venue: &PaperVenue) -> PositionRiskManager {
        let policies = Arc::new(PolicyStore::from_toml_str(POLICIES).unwrap());
        let sessions = Arc::new(SessionBroker::new(Arc::new(venue.clone())));
        let settings = RiskSettings {
            modify_retry: RetryPolicy::new(2, Duration::from_millis(1)),
            ..RiskSettings::default()
        };
        PositionRiskManager::new(policies, sessions, settings)
    }

    async fn pass(manager: &PositionRiskManager, at: DateTime<Utc>) -> RiskReport {
        manager
            .run_pass(at, &CancellationToken::new())
            .await
            .unwrap()
    }

    fn protect_orders(venue: &PaperVenue) -> Vec<OrderRequest> {
        venue
            .orders()
            .into_iter()
            .filter(|o| matches!(o, OrderRequest::Protect { .. }))
            .collect()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[tokio::test]
    async fn fixed_pips_applied_once() {
        let venue = PaperVenue::with_standard_symbols(10_000.0, 0.0);
        venue.seed_position(position(500, "strategyA", 1001, "EURUSD", 1.08510));
        let manager = manager(&venue);

        let report = pass(&manager, now()).await;
        assert_eq!(report.modified, 1);

        let orders = protect_orders(&venue);
        assert_eq!(orders.len(), 1);
        let OrderRequest::Protect {
            position,
            sl,
            tp,
            magic,
            comment,
            ..
        } = &orders[0]
        else {
            unreachable!()
        };
        assert_eq!(*position, 500);
        assert_close(*sl, 1.08310);
        assert_close(*tp, 1.08910);
        assert_eq!(*magic, 1001);
        assert_eq!(comment, "Auto-fixed_pips");

        let held = &venue.positions()[0];
        assert_close(held.sl, 1.08310);
        assert_close(held.tp, 1.08910);
    }

    #[tokio::test]
    async fn levels_in_place_are_not_resent() {
        let venue = PaperVenue::with_standard_symbols(10_000.0, 0.0);
        venue.seed_position(position(500, "strategyA", 1001, "EURUSD", 1.08510));
        let manager = manager(&venue);

        pass(&manager, now()).await;
        let report = pass(&manager, later(61)).await;

        assert_eq!(report.unchanged, 1);
        assert_eq!(protect_orders(&venue).len(), 1);
    }

    #[tokio::test]
    async fn cooldown_blocks_changes_until_window_ends() {
        let venue = PaperVenue::with_standard_symbols(10_000.0, 0.0);
        venue.seed_position(position(500, "strategyA", 1001, "EURUSD", 1.08510));
        let manager = manager(&venue);

        pass(&manager, now()).await;
        // 20 pips in profit: trailing now wants entry + 5 pips.
        venue.set_tick("EURUSD", paper::quote(1.08710, 1.08720));

        let cooling = pass(&manager, later(30)).await;
        assert_eq!(cooling.skipped, 1);
        assert_eq!(protect_orders(&venue).len(), 1);

        let after = pass(&manager, later(60)).await;
        assert_eq!(after.modified, 1);
        assert_close(venue.positions()[0].sl, 1.08560);
    }

    #[tokio::test]
    async fn trailing_stop_survives_pullback() {
        let venue = PaperVenue::with_standard_symbols(10_000.0, 0.0);
        venue.seed_position(position(500, "strategyA", 1001, "EURUSD", 1.08510));
        venue.set_tick("EURUSD", paper::quote(1.08710, 1.08720));
        let manager = manager(&venue);

        pass(&manager, now()).await;
        assert_close(venue.positions()[0].sl, 1.08560);

        venue.set_tick("EURUSD", paper::quote(1.08520, 1.08530));
        let report = pass(&manager, later(120)).await;
        assert_eq!(report.unchanged, 1);
        assert_close(venue.positions()[0].sl, 1.08560);
    }

    #[tokio::test]
    async fn young_and_foreign_positions_are_left_alone() {
        let venue = PaperVenue::with_standard_symbols(10_000.0, 0.0);
        let mut young = position(500, "strategyA", 1001, "EURUSD", 1.08510);
        young.opened_at = now() - ChronoDuration::seconds(10);
        venue.seed_position(young);
        let mut manual = position(501, "strategyA", 1001, "EURUSD", 1.08510);
        manual.comment = "manual".into();
        venue.seed_position(manual);
        venue.seed_position(position(502, "strategyA", 9999, "EURUSD", 1.08510));
        venue.seed_position(position(503, "paused", 3003, "EURUSD", 1.08510));
        let manager = manager(&venue);

        let report = pass(&manager, now()).await;

        assert_eq!(report.skipped, 1);
        assert_eq!(report.modified, 0);
        assert!(protect_orders(&venue).is_empty());
    }

    #[tokio::test]
    async fn percent_balance_uses_account_balance() {
        let venue = PaperVenue::with_standard_symbols(10_000.0, 0.0);
        venue.seed_position(position(600, "gold", 2002, "XAUUSD", 2000.00));
        let manager = manager(&venue);

        let report = pass(&manager, now()).await;
        assert_eq!(report.modified, 1);

        let held = &venue.positions()[0];
        assert_close(held.sl, 1999.00);
        assert_close(held.tp, 2002.00);
    }

    #[tokio::test]
    async fn exhausted_retries_defer_without_cooldown() {
        let venue = PaperVenue::with_standard_symbols(10_000.0, 0.0);
        venue.seed_position(position(500, "strategyA", 1001, "EURUSD", 1.08510));
        venue.reject_next(2);
        let manager = manager(&venue);

        let report = pass(&manager, now()).await;
        assert_eq!(report.deferred, 1);
        assert_eq!(manager.cooling_count(), 0);
        assert_eq!(venue.positions()[0].sl, 0.0);

        let retry = pass(&manager, later(1)).await;
        assert_eq!(retry.modified, 1);
    }

    #[tokio::test]
    async fn rejection_then_success_within_bound() {
        let venue = PaperVenue::with_standard_symbols(10_000.0, 0.0);
        venue.seed_position(position(500, "strategyA", 1001, "EURUSD", 1.08510));
        venue.reject_next(1);
        let manager = manager(&venue);

        let report = pass(&manager, now()).await;
        assert_eq!(report.modified, 1);
        assert_eq!(protect_orders(&venue).len(), 2);
        assert_eq!(manager.cooling_count(), 1);
    }

    #[tokio::test]
    async fn stale_cooldowns_are_evicted() {
        let venue = PaperVenue::with_standard_symbols(10_000.0, 0.0);
        venue.seed_position(position(500, "strategyA", 1001, "EURUSD", 1.08510));
        let manager = manager(&venue);

        pass(&manager, now()).await;
        assert_eq!(manager.cooling_count(), 1);

        pass(&manager, later(3_600)).await;
        assert_eq!(manager.cooling_count(), 0);
    }

    #[tokio::test]
    async fn first_modification_journals_protection() {
        let dir = tempfile::tempdir().unwrap();
        let signals = Arc::new(SignalStore::new(dir.path()));
        let alert = AlertRecord {
            timestamp: now() - ChronoDuration::minutes(11),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            timeframe: "15".into(),
            strategy_id: "strategyA".into(),
            consumed: true,
        };
        let mut executed = EnrichedSignal::pending(&alert, 0.10, "fixed_pips", now());
        executed.mark_executed(500, 1.08510, now() - ChronoDuration::minutes(10));
        signals.merge(&[executed]).unwrap();

        let venue = PaperVenue::with_standard_symbols(10_000.0, 0.0);
        venue.seed_position(position(500, "strategyA", 1001, "EURUSD", 1.08510));
        let manager = manager(&venue).with_journal(signals.clone());

        pass(&manager, now()).await;

        let stored = signals.load(now().date_naive()).unwrap();
        assert_eq!(stored[0].state, LifecycleState::ProtectionApplied);
        assert_eq!(stored[0].order_ticket, Some(500));
    }
}
