//! Process wiring: builds the three pass components over shared stores,
//! policies and venue sessions, and runs them once or on their schedules.

use std::sync::Arc;

use chrono::Utc;
use clap::ValueEnum;
use tracing::{error, info};

use common::{
    CancellationToken, Config, PassSchedule, Result, RetryPolicy, SessionBroker, Venue, VenueMode,
};
use engine::{BridgeVenue, ExecutionEngine, ExecutionSettings};
use enrichment::{EnrichmentEngine, EnrichmentSettings};
use paper::PaperVenue;
use policy::PolicyStore;
use risk::{PositionRiskManager, RiskSettings};
use store::{AlertStore, SignalStore};

/// Which pass loop(s) to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Component {
    All,
    Enrich,
    Execute,
    Risk,
}

impl Component {
    fn includes(self, other: Component) -> bool {
        self == Component::All || self == other
    }
}

/// Settings of all three components plus their loop cadence.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub enrichment: EnrichmentSettings,
    pub execution: ExecutionSettings,
    pub risk: RiskSettings,
    pub enrich_schedule: PassSchedule,
    pub execute_schedule: PassSchedule,
    pub risk_schedule: PassSchedule,
}

impl Settings {
    pub fn from_config(cfg: &Config) -> Self {
        let schedule = |interval| PassSchedule {
            interval,
            retry_delay: cfg.loop_retry_delay,
        };
        Self {
            enrichment: EnrichmentSettings {
                freshness: cfg.alert_freshness,
            },
            execution: ExecutionSettings {
                execution_window: cfg.execution_window,
                order_retry: RetryPolicy::new(cfg.order_max_attempts, cfg.order_retry_delay),
            },
            risk: RiskSettings {
                min_position_age: cfg.min_position_age,
                cooldown: cfg.cooldown,
                noop_ticks: cfg.noop_ticks,
                modify_retry: RetryPolicy::new(cfg.modify_max_attempts, cfg.modify_retry_delay),
            },
            enrich_schedule: schedule(cfg.enrich_interval),
            execute_schedule: schedule(cfg.execute_interval),
            risk_schedule: schedule(cfg.risk_interval),
        }
    }
}

/// The venue selected by `VENUE_MODE`.
pub fn venue_from_config(cfg: &Config) -> Result<Arc<dyn Venue>> {
    match cfg.venue_mode {
        VenueMode::Paper => {
            info!(balance = cfg.paper_balance, "Paper venue selected");
            Ok(Arc::new(PaperVenue::with_standard_symbols(
                cfg.paper_balance,
                cfg.paper_slippage_bps,
            )))
        }
        VenueMode::Bridge => {
            let url = cfg.bridge_url.clone().unwrap_or_default();
            info!(url = %url, "Bridge venue selected");
            Ok(Arc::new(BridgeVenue::new(url, cfg.venue_timeout)?))
        }
    }
}

pub struct App {
    enrichment: EnrichmentEngine,
    execution: ExecutionEngine,
    risk: PositionRiskManager,
    settings: Settings,
}

impl App {
    pub fn new(
        alerts: Arc<AlertStore>,
        signals: Arc<SignalStore>,
        policies: Arc<PolicyStore>,
        venue: Arc<dyn Venue>,
        settings: Settings,
    ) -> Self {
        // One broker for every component: the per-strategy session lock
        // must be shared to mean anything.
        let sessions = Arc::new(SessionBroker::new(venue));
        Self {
            enrichment: EnrichmentEngine::new(
                alerts,
                signals.clone(),
                policies.clone(),
                sessions.clone(),
                settings.enrichment,
            ),
            execution: ExecutionEngine::new(
                signals.clone(),
                policies.clone(),
                sessions.clone(),
                settings.execution,
            ),
            risk: PositionRiskManager::new(policies, sessions, settings.risk).with_journal(signals),
            settings,
        }
    }

    pub fn from_config(cfg: &Config, policies: Arc<PolicyStore>, venue: Arc<dyn Venue>) -> Self {
        Self::new(
            Arc::new(AlertStore::new(&cfg.alerts_dir)),
            Arc::new(SignalStore::new(&cfg.signals_dir)),
            policies,
            venue,
            Settings::from_config(cfg),
        )
    }

    /// One pass of each selected component, in pipeline order. The first
    /// failing pass ends the run.
    pub async fn run_once(&self, component: Component, shutdown: &CancellationToken) -> Result<()> {
        if component.includes(Component::Enrich) {
            let report = self.enrichment.run_pass(Utc::now()).await?;
            info!(?report, "Enrichment pass done");
        }
        if component.includes(Component::Execute) {
            let report = self.execution.run_pass(Utc::now(), shutdown).await?;
            info!(?report, "Execution pass done");
        }
        if component.includes(Component::Risk) {
            let report = self.risk.run_pass(Utc::now(), shutdown).await?;
            info!(?report, "Risk pass done");
        }
        Ok(())
    }

    /// Run the selected loops side by side until shutdown.
    pub async fn run(self: Arc<Self>, component: Component, shutdown: CancellationToken) {
        let mut handles = Vec::new();
        if component.includes(Component::Enrich) {
            let (app, token) = (self.clone(), shutdown.clone());
            handles.push(tokio::spawn(async move {
                app.enrichment.run(app.settings.enrich_schedule, token).await
            }));
        }
        if component.includes(Component::Execute) {
            let (app, token) = (self.clone(), shutdown.clone());
            handles.push(tokio::spawn(async move {
                app.execution.run(app.settings.execute_schedule, token).await
            }));
        }
        if component.includes(Component::Risk) {
            let (app, token) = (self.clone(), shutdown.clone());
            handles.push(tokio::spawn(async move {
                app.risk.run(app.settings.risk_schedule, token).await
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Pass loop task ended abnormally");
            }
        }
    }
}
