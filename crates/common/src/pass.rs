use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::retry::sleep_or_cancel;
use crate::Result;

/// Cadence of one component's pass loop.
#[derive(Debug, Clone, Copy)]
pub struct PassSchedule {
    /// Pause between two successful passes.
    pub interval: Duration,
    /// Pause after a pass that failed as a whole.
    pub retry_delay: Duration,
}

/// Drive `pass` on a fixed interval until shutdown.
///
/// A failing pass is logged and followed by `retry_delay`; the loop itself
/// never exits on an error. Shutdown is checked before every pass and
/// interrupts the sleeps between them.
pub async fn run_passes<F, Fut>(
    component: &'static str,
    schedule: PassSchedule,
    shutdown: CancellationToken,
    mut pass: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    info!(component, interval_secs = schedule.interval.as_secs_f64(), "Pass loop running");
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let pause = match pass().await {
            Ok(()) => schedule.interval,
            Err(e) => {
                error!(component, error = %e, "Pass failed");
                schedule.retry_delay
            }
        };
        if !sleep_or_cancel(&shutdown, pause).await {
            break;
        }
    }
    info!(component, "Pass loop stopped");
}
