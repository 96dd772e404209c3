use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use csv::ByteRecord;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use common::{Error, Result};

pub(crate) fn day_file(dir: &Path, prefix: &str, day: NaiveDate) -> PathBuf {
    dir.join(format!("{prefix}_{}.csv", day.format("%Y%m%d")))
}

/// Write `bytes` next to `path`, then rename over it.
pub(crate) fn replace_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("csv.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// One data row of a day file. Rows that do not decode are carried
/// byte-for-byte through every rewrite; the stores never delete them.
#[derive(Debug)]
pub(crate) enum Row<T> {
    Decoded(T),
    Undecodable(ByteRecord),
}

impl<T> Row<T> {
    pub(crate) fn decoded(self) -> Option<T> {
        match self {
            Row::Decoded(value) => Some(value),
            Row::Undecodable(_) => None,
        }
    }
}

/// Read every data row of `path` in file order. A missing file has no rows.
pub(crate) fn read_rows<R, T>(path: &Path, decode: impl Fn(R) -> Result<T>) -> Result<Vec<Row<T>>>
where
    R: DeserializeOwned,
{
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)?;
    let mut headers = reader.byte_headers()?.clone();
    headers.trim();

    let mut rows = Vec::new();
    let mut raw = ByteRecord::new();
    while reader.read_byte_record(&mut raw)? {
        let mut fields = raw.clone();
        fields.trim();
        let decoded = fields
            .deserialize::<R>(Some(&headers))
            .map_err(Error::from)
            .and_then(&decode);
        match decoded {
            Ok(value) => rows.push(Row::Decoded(value)),
            Err(e) => {
                warn!(
                    file = %path.display(),
                    line = raw.position().map(|p| p.line()),
                    error = %e,
                    "Undecodable row kept as-is"
                );
                rows.push(Row::Undecodable(raw.clone()));
            }
        }
    }
    Ok(rows)
}

/// `header`, then every row: decoded ones through `encode`, undecodable ones
/// verbatim.
pub(crate) fn write_rows<T, S>(
    header: &[&str],
    rows: &[Row<T>],
    encode: impl Fn(&T) -> S,
) -> Result<Vec<u8>>
where
    S: Serialize,
{
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_writer(Vec::new());
    writer.write_record(header)?;
    for row in rows {
        match row {
            Row::Decoded(value) => writer.serialize(encode(value))?,
            Row::Undecodable(raw) => writer.write_byte_record(raw)?,
        }
    }
    writer
        .into_inner()
        .map_err(|e| Error::Store(e.to_string()))
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// ISO-8601 with offset, or naive (read as UTC).
pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::Store(format!("bad timestamp '{raw}': {e}")))
}

pub(crate) fn parse_yes_no(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" => Ok(true),
        "no" | "false" | "" => Ok(false),
        other => Err(Error::Store(format!("expected yes/no, got '{other}'"))),
    }
}

pub(crate) fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn timestamps_round_trip_at_full_precision() {
        let ts = Utc
            .with_ymd_and_hms(2024, 5, 1, 9, 30, 0)
            .unwrap()
            .with_nanosecond(123_456_789)
            .unwrap();
        assert_eq!(parse_ts(&format_ts(ts)).unwrap(), ts);
    }

    #[test]
    fn naive_timestamps_are_utc() {
        let ts = parse_ts("2024-05-01T09:30:00.5").unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap()
            + chrono::Duration::milliseconds(500);
        assert_eq!(ts, expected);
    }

    #[test]
    fn yes_no_parsing() {
        assert!(parse_yes_no("YES").unwrap());
        assert!(!parse_yes_no("no").unwrap());
        assert!(parse_yes_no("yes (err:x)").is_err());
    }
}
