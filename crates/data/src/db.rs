use oanda_core::{fmt_time, Candle, DataError, Transaction};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

/// Fixed schema, executed on first use of a database file.
pub const SCHEMA_DDL: &str = "\
CREATE TABLE IF NOT EXISTS candle (
  instrument TEXT NOT NULL,
  time TEXT NOT NULL,
  bidOpen REAL, bidHigh REAL, bidLow REAL, bidClose REAL,
  askOpen REAL, askHigh REAL, askLow REAL, askClose REAL,
  midOpen REAL, midHigh REAL, midLow REAL, midClose REAL,
  volume INTEGER,
  PRIMARY KEY (instrument, time)
);
CREATE TABLE IF NOT EXISTS transaction_history (
  id INTEGER PRIMARY KEY,
  time TEXT,
  json TEXT
);
CREATE TABLE IF NOT EXISTS pricing_stream (
  time TEXT,
  instrument TEXT,
  json TEXT
);
CREATE TABLE IF NOT EXISTS transaction_stream (
  time TEXT,
  instrument TEXT,
  json TEXT
);
";

fn db_err(e: sqlx::Error) -> DataError {
    DataError::DatabaseError(e.to_string())
}

/// Open (creating if missing) an SQLite database file and make sure the
/// schema exists.
pub async fn open_database(path: &Path) -> Result<SqlitePool, DataError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(db_err)?;
    sqlx::raw_sql(SCHEMA_DDL).execute(&pool).await.map_err(db_err)?;
    Ok(pool)
}

// ---------------------------------------------------------------------------
// Candles
// ---------------------------------------------------------------------------

/// The `(instrument, time)` pairs already present in the candle table.
pub async fn existing_candle_keys(pool: &SqlitePool) -> Result<HashSet<(String, String)>, DataError> {
    let rows = sqlx::query("SELECT instrument, time FROM candle")
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    Ok(rows
        .iter()
        .map(|r| (r.get("instrument"), r.get("time")))
        .collect())
}

fn real(value: Option<Decimal>) -> Option<f64> {
    value.and_then(|d| d.to_f64())
}

/// Insert only the candles whose key is not yet present. Returns the number
/// of inserted rows.
pub async fn insert_new_candles(pool: &SqlitePool, candles: &[Candle]) -> Result<u64, DataError> {
    let existing = existing_candle_keys(pool).await?;
    let mut count = 0u64;
    for candle in candles {
        if existing.contains(&candle.key()) {
            continue;
        }
        sqlx::query(
            "INSERT INTO candle (
                instrument, time,
                bidOpen, bidHigh, bidLow, bidClose,
                askOpen, askHigh, askLow, askClose,
                midOpen, midHigh, midLow, midClose,
                volume
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&candle.instrument)
        .bind(fmt_time(&candle.time))
        .bind(real(candle.bid_open))
        .bind(real(candle.bid_high))
        .bind(real(candle.bid_low))
        .bind(real(candle.bid_close))
        .bind(real(candle.ask_open))
        .bind(real(candle.ask_high))
        .bind(real(candle.ask_low))
        .bind(real(candle.ask_close))
        .bind(real(candle.mid_open))
        .bind(real(candle.mid_high))
        .bind(real(candle.mid_low))
        .bind(real(candle.mid_close))
        .bind(candle.volume)
        .execute(pool)
        .await
        .map_err(db_err)?;
        count += 1;
    }
    debug!(inserted = count, "candle rows inserted");
    Ok(count)
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

pub async fn existing_transaction_ids(pool: &SqlitePool) -> Result<HashSet<i64>, DataError> {
    let rows = sqlx::query("SELECT id FROM transaction_history")
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    Ok(rows.iter().map(|r| r.get::<i64, _>("id")).collect())
}

/// Append only the transactions whose id is not yet present.
pub async fn insert_new_transactions(
    pool: &SqlitePool,
    transactions: &[Transaction],
) -> Result<u64, DataError> {
    let existing = existing_transaction_ids(pool).await?;
    let mut count = 0u64;
    for txn in transactions {
        if existing.contains(&txn.id) {
            continue;
        }
        sqlx::query("INSERT INTO transaction_history (id, time, json) VALUES (?, ?, ?)")
            .bind(txn.id)
            .bind(&txn.time)
            .bind(txn.json())
            .execute(pool)
            .await
            .map_err(db_err)?;
        count += 1;
    }
    debug!(inserted = count, "transaction rows inserted");
    Ok(count)
}

/// Read the raw JSON column of the transaction history (for plotting).
pub async fn read_transaction_json(pool: &SqlitePool) -> Result<Vec<String>, DataError> {
    let rows = sqlx::query("SELECT json FROM transaction_history ORDER BY id")
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    Ok(rows.iter().map(|r| r.get("json")).collect())
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// Append one stream message row. `table` is one of the fixed
/// `<kind>_stream` names from the schema.
pub async fn insert_stream_row(
    pool: &SqlitePool,
    table: &'static str,
    time: &str,
    instrument: &str,
    json: &str,
) -> Result<(), DataError> {
    sqlx::query(&format!(
        "INSERT INTO {table} (time, instrument, json) VALUES (?, ?, ?)"
    ))
    .bind(time)
    .bind(instrument)
    .bind(json)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::fs;

    fn candle(instrument: &str, time: &str) -> Candle {
        Candle {
            instrument: instrument.to_string(),
            time: time.parse().unwrap(),
            volume: 2,
            bid_open: Some(dec!(1.07)),
            bid_high: Some(dec!(1.08)),
            bid_low: Some(dec!(1.06)),
            bid_close: Some(dec!(1.075)),
            ask_open: Some(dec!(1.071)),
            ask_high: Some(dec!(1.081)),
            ask_low: Some(dec!(1.061)),
            ask_close: Some(dec!(1.076)),
            mid_open: None,
            mid_high: None,
            mid_low: None,
            mid_close: None,
        }
    }

    fn txn(id: i64) -> Transaction {
        Transaction::from_value(json!({
            "id": id.to_string(),
            "time": "2024-05-01T00:00:00Z",
            "type": "ORDER_FILL"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_candle_insert_skips_present_keys() {
        let path = std::env::temp_dir().join("test_oanda_db_candles.sqlite3");
        let _ = fs::remove_file(&path);
        let pool = open_database(&path).await.unwrap();

        let first = vec![
            candle("EUR_USD", "2024-05-01T00:00:00Z"),
            candle("EUR_USD", "2024-05-01T00:00:05Z"),
        ];
        assert_eq!(insert_new_candles(&pool, &first).await.unwrap(), 2);

        // Overlap: one already present, one new.
        let second = vec![
            candle("EUR_USD", "2024-05-01T00:00:05Z"),
            candle("EUR_USD", "2024-05-01T00:00:10Z"),
        ];
        assert_eq!(insert_new_candles(&pool, &second).await.unwrap(), 1);
        assert_eq!(existing_candle_keys(&pool).await.unwrap().len(), 3);

        pool.close().await;
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_transaction_sync_is_idempotent() {
        let path = std::env::temp_dir().join("test_oanda_db_txns.sqlite3");
        let _ = fs::remove_file(&path);
        let pool = open_database(&path).await.unwrap();

        insert_new_transactions(&pool, &[txn(1), txn(2), txn(3)])
            .await
            .unwrap();
        let appended = insert_new_transactions(&pool, &[txn(2), txn(3), txn(4), txn(5)])
            .await
            .unwrap();
        assert_eq!(appended, 2);
        assert_eq!(
            existing_transaction_ids(&pool).await.unwrap(),
            HashSet::from([1, 2, 3, 4, 5])
        );

        pool.close().await;
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_stream_rows_append() {
        let path = std::env::temp_dir().join("test_oanda_db_stream.sqlite3");
        let _ = fs::remove_file(&path);
        let pool = open_database(&path).await.unwrap();

        insert_stream_row(&pool, "pricing_stream", "t0", "EUR_USD", "{}")
            .await
            .unwrap();
        insert_stream_row(&pool, "transaction_stream", "t1", "", "{}")
            .await
            .unwrap();

        let rows = sqlx::query("SELECT COUNT(*) AS n FROM pricing_stream")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows.get::<i64, _>("n"), 1);

        pool.close().await;
        let _ = fs::remove_file(&path);
    }
}
