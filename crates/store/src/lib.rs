//! Per-day durable stores shared between pass loops.
//!
//! Each UTC day has one CSV file per store. Readers tolerate a missing file
//! (no records yet) and skip malformed rows. Writers re-read the file, merge,
//! and atomically replace it, so a reader in the next pass never observes a
//! half-written file.

mod alerts;
mod file;
mod signals;

pub use alerts::AlertStore;
pub use signals::{merge_signals, SignalStore};
