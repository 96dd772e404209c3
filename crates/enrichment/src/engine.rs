use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use common::{
    age, run_passes, scan_days, AlertRecord, CancellationToken, EnrichedSignal, Error,
    PassSchedule, RejectionReason, Result, SessionBroker, SignalKey,
};
use policy::{PolicyStore, SizingPolicy, StrategyPolicy};
use store::{AlertStore, SignalStore};

use crate::sizing::{fixed_lots, percent_of_balance_lots, BalanceRisk};

/// Protection label recorded when no policy could be resolved.
const NO_PROTECTION: &str = "none";

#[derive(Debug, Clone, Copy)]
pub struct EnrichmentSettings {
    /// Alerts at least this old are rejected instead of sized.
    pub freshness: Duration,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            freshness: Duration::from_secs(60),
        }
    }
}

/// Counts of what one pass decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentReport {
    pub accepted: usize,
    pub rejected: usize,
    /// Left unconsumed for a later pass (policy fault).
    pub deferred: usize,
    /// Accepted at the fallback size because sizing failed.
    pub degraded: usize,
}

/// Turns unconsumed alerts into enriched signals.
///
/// Every alert is consumed at most once: signals are merged into the signal
/// store first, and only then are their source alerts flipped to consumed.
/// A crash between the two steps is repaired by the next pass, which finds
/// the stored signal and only flips the alert.
pub struct EnrichmentEngine {
    alerts: Arc<AlertStore>,
    signals: Arc<SignalStore>,
    policies: Arc<PolicyStore>,
    sessions: Arc<SessionBroker>,
    settings: EnrichmentSettings,
}

enum Sized {
    Exact(f64),
    Fallback(f64),
}

impl EnrichmentEngine {
    pub fn new(
        alerts: Arc<AlertStore>,
        signals: Arc<SignalStore>,
        policies: Arc<PolicyStore>,
        sessions: Arc<SessionBroker>,
        settings: EnrichmentSettings,
    ) -> Self {
        Self {
            alerts,
            signals,
            policies,
            sessions,
            settings,
        }
    }

    /// Run passes on `schedule` until shutdown.
    pub async fn run(&self, schedule: PassSchedule, shutdown: CancellationToken) {
        run_passes("enrichment", schedule, shutdown, || async move {
            self.run_pass(Utc::now()).await.map(|_| ())
        })
        .await;
    }

    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<EnrichmentReport> {
        self.policies.refresh();
        let mut report = EnrichmentReport::default();

        for day in scan_days(now) {
            let mut pending: Vec<AlertRecord> = self
                .alerts
                .load(day)?
                .into_iter()
                .filter(|a| !a.consumed)
                .collect();
            if pending.is_empty() {
                continue;
            }
            pending.sort_by_key(|a| a.timestamp);

            let stored: HashSet<SignalKey> =
                self.signals.load(day)?.iter().map(|s| s.key()).collect();
            let mut seen = HashSet::new();
            let mut enriched = Vec::new();
            let mut consumed = HashSet::new();

            for alert in pending {
                let key = alert.key();
                if !seen.insert(key.clone()) {
                    continue;
                }
                if stored.contains(&key) {
                    debug!(
                        strategy = %alert.strategy_id,
                        symbol = %alert.symbol,
                        "Alert already enriched"
                    );
                    consumed.insert(key);
                    continue;
                }
                match self.enrich(&alert, now).await {
                    Ok((signal, degraded)) => {
                        if signal.rejection_reason.is_some() {
                            report.rejected += 1;
                        } else {
                            report.accepted += 1;
                        }
                        if degraded {
                            report.degraded += 1;
                        }
                        enriched.push(signal);
                        consumed.insert(key);
                    }
                    Err(e) => {
                        warn!(
                            strategy = %alert.strategy_id,
                            symbol = %alert.symbol,
                            decision = "deferred",
                            error = %e,
                            "Alert left unconsumed"
                        );
                        report.deferred += 1;
                    }
                }
            }

            self.signals.merge(&enriched)?;
            let flipped = self.alerts.mark_consumed(day, &consumed)?;
            debug!(%day, flipped, "Alerts marked consumed");
        }

        if report != EnrichmentReport::default() {
            info!(
                accepted = report.accepted,
                rejected = report.rejected,
                deferred = report.deferred,
                degraded = report.degraded,
                "Enrichment pass complete"
            );
        }
        Ok(report)
    }

    /// Validate and size one alert. `Err` means the strategy's policy could
    /// not be read; the alert should be retried on a later pass.
    async fn enrich(
        &self,
        alert: &AlertRecord,
        now: DateTime<Utc>,
    ) -> Result<(EnrichedSignal, bool)> {
        if age(now, alert.timestamp) >= self.settings.freshness {
            return Ok((reject(alert, RejectionReason::Stale, NO_PROTECTION, now), false));
        }
        let Some(policy) = self.policies.policy(&alert.strategy_id)? else {
            return Ok((reject(alert, RejectionReason::PolicyMissing, NO_PROTECTION, now), false));
        };
        let label = policy.protection.label();

        if !policy.enabled {
            return Ok((reject(alert, RejectionReason::StrategyDisabled, label, now), false));
        }
        if !policy.allows_action(alert.side) {
            return Ok((reject(alert, RejectionReason::ActionNotPermitted, label, now), false));
        }
        if !policy.allows_symbol(&alert.symbol) {
            return Ok((reject(alert, RejectionReason::SymbolNotPermitted, label, now), false));
        }

        let (lots, degraded) = match self.size(alert, &policy).await {
            Sized::Exact(lots) => (lots, false),
            Sized::Fallback(lots) => (lots, true),
        };
        info!(
            strategy = %alert.strategy_id,
            symbol = %alert.symbol,
            side = %alert.side,
            lots,
            protection = label,
            decision = "accepted",
            "Alert enriched"
        );
        Ok((EnrichedSignal::pending(alert, lots, label, now), degraded))
    }

    async fn size(&self, alert: &AlertRecord, policy: &StrategyPolicy) -> Sized {
        match policy.sizing {
            SizingPolicy::Fixed { lots } => Sized::Exact(fixed_lots(lots)),
            SizingPolicy::PercentOfBalance {
                risk_percent,
                leverage,
                min_lot,
            } => match self
                .balance_risk_lots(alert, policy, risk_percent, leverage)
                .await
            {
                Ok(lots) => Sized::Exact(lots),
                Err(e) => {
                    warn!(
                        strategy = %alert.strategy_id,
                        symbol = %alert.symbol,
                        fallback_lots = min_lot,
                        error = %e,
                        "Sizing degraded to minimum lot"
                    );
                    Sized::Fallback(fixed_lots(min_lot))
                }
            },
        }
    }

    async fn balance_risk_lots(
        &self,
        alert: &AlertRecord,
        policy: &StrategyPolicy,
        risk_percent: f64,
        leverage: f64,
    ) -> Result<f64> {
        let identity = policy.venue.identity(&alert.strategy_id)?;
        let mut session = self.sessions.acquire(&identity).await?;
        let market = async {
            let balance = session.account_info().await?.balance;
            let info = session.symbol_info(&alert.symbol).await?;
            let tick = session.tick(&alert.symbol).await?;
            Ok::<_, Error>((balance, info, tick))
        }
        .await;
        session.release().await;
        let (balance, info, tick) = market?;

        percent_of_balance_lots(&BalanceRisk {
            balance,
            leverage,
            risk_percent,
            reference_price: tick.entry_price(alert.side),
            contract_multiplier: BalanceRisk::contract_multiplier_for(&alert.symbol),
            instrument_min_lot: info.volume_min,
        })
    }
}

fn reject(
    alert: &AlertRecord,
    reason: RejectionReason,
    protection: &str,
    now: DateTime<Utc>,
) -> EnrichedSignal {
    warn!(
        strategy = %alert.strategy_id,
        symbol = %alert.symbol,
        side = %alert.side,
        decision = "rejected",
        reason = %reason,
        "Alert rejected"
    );
    EnrichedSignal::rejected(alert, &reason, protection, now)
}
