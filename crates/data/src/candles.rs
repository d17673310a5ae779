use chrono::NaiveDate;
use oanda_core::{fmt_time, Candle, DataError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One row of a per-day-per-instrument candle CSV file. The instrument is
/// encoded in the file name, not the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleCsvRecord {
    pub time: String,
    pub volume: i64,
    pub bid_open: Option<Decimal>,
    pub bid_high: Option<Decimal>,
    pub bid_low: Option<Decimal>,
    pub bid_close: Option<Decimal>,
    pub ask_open: Option<Decimal>,
    pub ask_high: Option<Decimal>,
    pub ask_low: Option<Decimal>,
    pub ask_close: Option<Decimal>,
    pub mid_open: Option<Decimal>,
    pub mid_high: Option<Decimal>,
    pub mid_low: Option<Decimal>,
    pub mid_close: Option<Decimal>,
}

impl From<&Candle> for CandleCsvRecord {
    fn from(candle: &Candle) -> Self {
        Self {
            time: fmt_time(&candle.time),
            volume: candle.volume,
            bid_open: candle.bid_open,
            bid_high: candle.bid_high,
            bid_low: candle.bid_low,
            bid_close: candle.bid_close,
            ask_open: candle.ask_open,
            ask_high: candle.ask_high,
            ask_low: candle.ask_low,
            ask_close: candle.ask_close,
            mid_open: candle.mid_open,
            mid_high: candle.mid_high,
            mid_low: candle.mid_low,
            mid_close: candle.mid_close,
        }
    }
}

/// `candle.<granularity>.<instrument>.<date>.csv`
pub fn candle_csv_path(dir: &Path, granularity: &str, instrument: &str, date: NaiveDate) -> PathBuf {
    dir.join(format!("candle.{granularity}.{instrument}.{date}.csv"))
}

/// Merge existing file rows with freshly fetched rows: union, sorted by
/// time, one row per timestamp with the newest fetched value winning on
/// conflict. Timestamps share one canonical RFC 3339 form, so the string
/// order is the chronological order.
pub fn merge_candle_records(
    existing: Vec<CandleCsvRecord>,
    fetched: Vec<CandleCsvRecord>,
) -> Vec<CandleCsvRecord> {
    let mut by_time: BTreeMap<String, CandleCsvRecord> = BTreeMap::new();
    for record in existing.into_iter().chain(fetched) {
        by_time.insert(record.time.clone(), record);
    }
    by_time.into_values().collect()
}

fn read_candle_csv(path: &Path) -> Result<Vec<CandleCsvRecord>, DataError> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| DataError::ParseError(format!("failed to open {}: {e}", path.display())))?;
    reader
        .deserialize()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DataError::ParseError(format!("bad candle row in {}: {e}", path.display())))
}

/// Write candles into per-day-per-instrument CSV files under `dir`. Each
/// target file is rewritten whole (merge-and-replace, not append).
pub fn write_candles_csv(
    dir: &Path,
    granularity: &str,
    candles: &[Candle],
) -> Result<(), DataError> {
    fs::create_dir_all(dir)?;

    let mut groups: BTreeMap<(NaiveDate, String), Vec<CandleCsvRecord>> = BTreeMap::new();
    for candle in candles {
        groups
            .entry((candle.time.date_naive(), candle.instrument.clone()))
            .or_default()
            .push(CandleCsvRecord::from(candle));
    }

    for ((date, instrument), fetched) in groups {
        let path = candle_csv_path(dir, granularity, &instrument, date);
        let existing = if path.is_file() {
            read_candle_csv(&path)?
        } else {
            Vec::new()
        };
        let merged = merge_candle_records(existing, fetched);
        debug!(path = %path.display(), rows = merged.len(), "rewriting candle csv");

        let mut writer = csv::Writer::from_path(&path)
            .map_err(|e| DataError::ParseError(format!("failed to create {}: {e}", path.display())))?;
        for record in &merged {
            writer
                .serialize(record)
                .map_err(|e| DataError::ParseError(e.to_string()))?;
        }
        writer.flush()?;
    }
    Ok(())
}
