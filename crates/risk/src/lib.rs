pub mod cooldown;
pub mod manager;
pub mod protection;

pub use cooldown::{CooldownCache, PositionKey};
pub use manager::{PositionRiskManager, RiskReport, RiskSettings};
pub use protection::{needs_update, pip_value, target_levels, Levels, MarketContext};
