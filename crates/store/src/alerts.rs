use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use common::{AlertRecord, Result, SignalKey};

use crate::file::{
    day_file, format_ts, parse_ts, parse_yes_no, read_rows, replace_atomically, write_rows,
    yes_no, Row,
};

const PREFIX: &str = "alerts";
const HEADER: [&str; 6] = ["timestamp", "symbol", "side", "timeframe", "strategy", "consumed"];

#[derive(Debug, Serialize, Deserialize)]
struct AlertRow {
    timestamp: String,
    symbol: String,
    side: String,
    timeframe: String,
    strategy: String,
    consumed: String,
}

impl AlertRow {
    fn from_record(alert: &AlertRecord) -> Self {
        Self {
            timestamp: format_ts(alert.timestamp),
            symbol: alert.symbol.clone(),
            side: alert.side.to_string(),
            timeframe: alert.timeframe.clone(),
            strategy: alert.strategy_id.clone(),
            consumed: yes_no(alert.consumed).to_string(),
        }
    }

    fn into_record(self) -> Result<AlertRecord> {
        Ok(AlertRecord {
            timestamp: parse_ts(&self.timestamp)?,
            symbol: self.symbol.trim().to_ascii_uppercase(),
            side: self.side.parse()?,
            timeframe: self.timeframe,
            strategy_id: self.strategy.trim().to_string(),
            consumed: parse_yes_no(&self.consumed)?,
        })
    }
}

/// Inbound alerts, one file per UTC day (`alerts_YYYYMMDD.csv`).
///
/// The listener appends; the enrichment pass flips `consumed`.
pub struct AlertStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl AlertStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path_for(&self, day: NaiveDate) -> PathBuf {
        day_file(&self.dir, PREFIX, day)
    }

    /// All readable alerts of `day`, in file order. Malformed rows are
    /// logged and left out.
    pub fn load(&self, day: NaiveDate) -> Result<Vec<AlertRecord>> {
        read_alerts(&self.path_for(day))
    }

    /// Append one alert, writing the header if the file is new.
    pub fn append(&self, alert: &AlertRecord) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let path = self.path_for(alert.timestamp.date_naive());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let is_new = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(is_new).from_writer(file);
        writer.serialize(AlertRow::from_record(alert))?;
        writer.flush()?;
        Ok(())
    }

    /// Set `consumed=yes` on every alert of `day` whose key is in `keys`.
    /// Returns how many rows flipped; already-consumed rows are left alone.
    /// Rows that do not decode are written back untouched.
    pub fn mark_consumed(&self, day: NaiveDate, keys: &HashSet<SignalKey>) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let path = self.path_for(day);
        let mut rows = read_rows(&path, AlertRow::into_record)?;

        let mut flipped = 0;
        for row in rows.iter_mut() {
            if let Row::Decoded(alert) = row {
                if !alert.consumed && keys.contains(&alert.key()) {
                    alert.consumed = true;
                    flipped += 1;
                }
            }
        }
        if flipped == 0 {
            return Ok(0);
        }

        let bytes = write_rows(&HEADER, &rows, AlertRow::from_record)?;
        replace_atomically(&path, &bytes)?;
        Ok(flipped)
    }
}

fn read_alerts(path: &Path) -> Result<Vec<AlertRecord>> {
    Ok(read_rows(path, AlertRow::into_record)?
        .into_iter()
        .filter_map(Row::decoded)
        .collect())
}
