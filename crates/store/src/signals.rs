use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use common::{EnrichedSignal, Error, LifecycleState, Result, SignalKey};

use crate::file::{day_file, format_ts, parse_ts, read_rows, replace_atomically, write_rows, Row};

const PREFIX: &str = "signals";
const HEADER: [&str; 13] = [
    "timestamp",
    "symbol",
    "side",
    "timeframe",
    "strategy",
    "lifecycle_state",
    "rejection_reason",
    "lot_size",
    "protection_mode",
    "order_ticket",
    "fill_price",
    "executed_at",
    "processed_at",
];

#[derive(Debug, Serialize, Deserialize)]
struct SignalRow {
    timestamp: String,
    symbol: String,
    side: String,
    timeframe: String,
    strategy: String,
    lifecycle_state: LifecycleState,
    rejection_reason: Option<String>,
    lot_size: String,
    protection_mode: String,
    order_ticket: Option<u64>,
    fill_price: Option<f64>,
    executed_at: Option<String>,
    processed_at: String,
}

impl SignalRow {
    fn from_signal(sig: &EnrichedSignal) -> Self {
        Self {
            timestamp: format_ts(sig.timestamp),
            symbol: sig.symbol.clone(),
            side: sig.side.to_string(),
            timeframe: sig.timeframe.clone(),
            strategy: sig.strategy_id.clone(),
            lifecycle_state: sig.state,
            rejection_reason: sig.rejection_reason.clone(),
            lot_size: format!("{:.2}", sig.lot_size),
            protection_mode: sig.protection_mode.clone(),
            order_ticket: sig.order_ticket,
            fill_price: sig.fill_price,
            executed_at: sig.executed_at.map(format_ts),
            processed_at: format_ts(sig.processed_at),
        }
    }

    fn into_signal(self) -> Result<EnrichedSignal> {
        Ok(EnrichedSignal {
            timestamp: parse_ts(&self.timestamp)?,
            symbol: self.symbol,
            side: self.side.parse()?,
            timeframe: self.timeframe,
            strategy_id: self.strategy,
            lot_size: self
                .lot_size
                .trim()
                .parse()
                .map_err(|_| Error::Store(format!("bad lot size '{}'", self.lot_size)))?,
            protection_mode: self.protection_mode,
            state: self.lifecycle_state,
            rejection_reason: self.rejection_reason.filter(|r| !r.is_empty()),
            order_ticket: self.order_ticket,
            fill_price: self.fill_price,
            executed_at: self.executed_at.as_deref().map(parse_ts).transpose()?,
            processed_at: parse_ts(&self.processed_at)?,
        })
    }
}

/// Enriched signals, one file per UTC day of the source alert
/// (`signals_YYYYMMDD.csv`).
///
/// There is a single write path, `merge`: it re-reads the day file, folds
/// the given records in by (timestamp, symbol, strategy) and atomically
/// replaces the file. Appending a new signal and stamping an existing one
/// are the same operation. Rows that do not decode survive the rewrite.
pub struct SignalStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl SignalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path_for(&self, day: NaiveDate) -> PathBuf {
        day_file(&self.dir, PREFIX, day)
    }

    /// Signals of `day`, duplicates already merged.
    pub fn load(&self, day: NaiveDate) -> Result<Vec<EnrichedSignal>> {
        read_signals(&self.path_for(day))
    }

    pub fn merge(&self, incoming: &[EnrichedSignal]) -> Result<()> {
        if incoming.is_empty() {
            return Ok(());
        }
        let mut by_day: BTreeMap<NaiveDate, Vec<EnrichedSignal>> = BTreeMap::new();
        for sig in incoming {
            by_day
                .entry(sig.timestamp.date_naive())
                .or_default()
                .push(sig.clone());
        }

        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        for (day, records) in by_day {
            let path = self.path_for(day);
            let mut signals = Vec::new();
            let mut unreadable = Vec::new();
            for row in read_rows(&path, SignalRow::into_signal)? {
                match row {
                    Row::Decoded(sig) => signals.push(sig),
                    raw => unreadable.push(raw),
                }
            }
            signals.extend(records);

            let rows: Vec<Row<EnrichedSignal>> = merge_signals(signals)
                .into_iter()
                .map(Row::Decoded)
                .chain(unreadable)
                .collect();
            let bytes = write_rows(&HEADER, &rows, SignalRow::from_signal)?;
            replace_atomically(&path, &bytes)?;
        }
        Ok(())
    }
}

/// Collapse duplicates on (timestamp, symbol, strategy), keeping first-seen
/// order. Of two duplicates the more advanced lifecycle state wins. A later
/// copy in the same state replaces the earlier one; `Rejected` and `Executed`
/// never replace each other.
pub fn merge_signals(records: Vec<EnrichedSignal>) -> Vec<EnrichedSignal> {
    let mut index: HashMap<SignalKey, usize> = HashMap::new();
    let mut merged: Vec<EnrichedSignal> = Vec::with_capacity(records.len());
    for sig in records {
        match index.get(&sig.key()) {
            Some(&i) => {
                let held = merged[i].state;
                if sig.state.rank() > held.rank() || sig.state == held {
                    merged[i] = sig;
                }
            }
            None => {
                index.insert(sig.key(), merged.len());
                merged.push(sig);
            }
        }
    }
    merged
}

fn read_signals(path: &Path) -> Result<Vec<EnrichedSignal>> {
    let signals = read_rows(path, SignalRow::into_signal)?
        .into_iter()
        .filter_map(Row::decoded)
        .collect();
    Ok(merge_signals(signals))
}
