pub mod document;
pub mod store;

pub use document::{
    PolicyDocument, ProtectionPolicy, ReversalMode, ReversalPolicy, SizingPolicy, StrategyPolicy,
    TrailingPolicy, VenueAccount,
};
pub use store::PolicyStore;
