pub mod engine;
pub mod sizing;

pub use engine::{EnrichmentEngine, EnrichmentReport, EnrichmentSettings};
