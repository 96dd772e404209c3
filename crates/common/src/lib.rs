pub mod config;
pub mod error;
pub mod pass;
pub mod retry;
pub mod session;
pub mod types;
pub mod venue;

pub use config::{Config, VenueMode};
pub use error::{Error, Result};
pub use pass::{run_passes, PassSchedule};
pub use retry::{sleep_or_cancel, RetryPolicy};
pub use session::{SessionBroker, StrategySession};
pub use types::*;
pub use venue::*;

pub use tokio_util::sync::CancellationToken;
