use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use alertbridge::{venue_from_config, App, Component};
use common::{CancellationToken, Config};
use policy::PolicyStore;

/// Turns trade alerts into sized, protected venue positions.
#[derive(Debug, Parser)]
#[command(name = "alertbridge", version)]
struct Args {
    /// Pass loop(s) to run.
    #[arg(long, value_enum, default_value = "all")]
    component: Component,

    /// Run a single pass and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env().context("loading configuration")?;
    info!(
        venue = %cfg.venue_mode,
        component = ?args.component,
        once = args.once,
        "AlertBridge starting"
    );

    // ── Policies ──────────────────────────────────────────────────────────────
    let policies = PolicyStore::load(
        cfg.policy_path.clone(),
        cfg.policy_load_attempts,
        cfg.loop_retry_delay,
    )
    .await
    .with_context(|| format!("loading policy document {}", cfg.policy_path.display()))?;

    // ── Venue ─────────────────────────────────────────────────────────────────
    let venue = venue_from_config(&cfg).context("building venue")?;
    let app = Arc::new(App::from_config(&cfg, Arc::new(policies), venue));

    // ── Shutdown ──────────────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    if args.once {
        app.run_once(args.component, &shutdown).await?;
        info!("Single pass complete");
    } else {
        info!("All selected loops started. Waiting for shutdown signal.");
        app.run(args.component, shutdown).await;
        info!("Shutdown complete");
    }
    Ok(())
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}
