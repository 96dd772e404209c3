pub mod bridge;
pub mod executor;
pub mod order;
pub mod reversal;

pub use bridge::BridgeVenue;
pub use executor::{ExecutionEngine, ExecutionReport, ExecutionSettings};
pub use order::{send_deal, send_with_fill_fallback};
pub use reversal::{close_opposites, Reversal};
