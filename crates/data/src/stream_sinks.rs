use crate::delimiter_for;
use crate::queue::StreamQueue;
use async_trait::async_trait;
use oanda_core::{DataError, StreamMessage, StreamSink, StreamTarget};
use sqlx::SqlitePool;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::debug;

// ---------------------------------------------------------------------------
// CSV sink
// ---------------------------------------------------------------------------

/// Appends one `(time, instrument, json)` row per stream message. The
/// header is written only when the file is created.
pub struct CsvStreamSink {
    path: PathBuf,
    delimiter: u8,
}

impl CsvStreamSink {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            delimiter: delimiter_for(path),
        }
    }
}

#[async_trait]
impl StreamSink for CsvStreamSink {
    async fn record(&mut self, message: &StreamMessage) -> Result<(), DataError> {
        let is_new = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .from_writer(file);
        if is_new {
            writer
                .write_record(["time", "instrument", "json"])
                .map_err(|e| DataError::ParseError(e.to_string()))?;
        }
        let json = message.raw().to_string();
        writer
            .write_record([
                message.time().unwrap_or_default(),
                message.instrument().unwrap_or_default(),
                json.as_str(),
            ])
            .map_err(|e| DataError::ParseError(e.to_string()))?;
        writer.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQLite sink
// ---------------------------------------------------------------------------

/// Appends each message to the stream table matching the subscribed
/// target.
pub struct DbStreamSink {
    pool: SqlitePool,
    table: &'static str,
}

impl DbStreamSink {
    pub fn new(pool: SqlitePool, target: StreamTarget) -> Self {
        Self {
            pool,
            table: target.stream_table(),
        }
    }
}

#[async_trait]
impl StreamSink for DbStreamSink {
    async fn record(&mut self, message: &StreamMessage) -> Result<(), DataError> {
        crate::db::insert_stream_row(
            &self.pool,
            self.table,
            message.time().unwrap_or_default(),
            message.instrument().unwrap_or_default(),
            &message.raw().to_string(),
        )
        .await
    }

    async fn close(&mut self) -> Result<(), DataError> {
        self.pool.close().await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queue sink
// ---------------------------------------------------------------------------

/// Pushes raw message JSON onto bounded in-memory queues. Each session
/// starts from empty queues.
pub struct QueueSink {
    queue: StreamQueue,
}

impl QueueSink {
    pub fn new(max_length: usize) -> Self {
        Self {
            queue: StreamQueue::new(max_length),
        }
    }

    pub fn queue(&self) -> &StreamQueue {
        &self.queue
    }
}

#[async_trait]
impl StreamSink for QueueSink {
    async fn record(&mut self, message: &StreamMessage) -> Result<(), DataError> {
        let key = message.queue_key();
        self.queue.push(&key, message.raw().to_string());
        debug!(key = %key, len = self.queue.len(&key), "queued stream message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn price(instrument: &str, time: &str) -> StreamMessage {
        StreamMessage::classify(json!({
            "type": "PRICE",
            "instrument": instrument,
            "time": time,
            "bids": [{"price": "1.07", "liquidity": 1000000}]
        }))
    }

    #[tokio::test]
    async fn test_csv_sink_writes_header_once() {
        let path = std::env::temp_dir().join("test_oanda_stream_sink.csv");
        let _ = fs::remove_file(&path);

        let mut sink = CsvStreamSink::new(&path);
        sink.record(&price("EUR_USD", "t0")).await.unwrap();
        sink.record(&price("EUR_USD", "t1")).await.unwrap();

        let body = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "time,instrument,json");
        assert!(lines[1].starts_with("t0,EUR_USD,"));
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_queue_sink_routes_by_message_kind() {
        let mut sink = QueueSink::new(10);
        sink.record(&price("EUR_USD", "t0")).await.unwrap();
        sink.record(&StreamMessage::classify(json!({
            "type": "ORDER_FILL",
            "id": "42",
            "time": "t1"
        })))
        .await
        .unwrap();

        assert_eq!(sink.queue().len("EUR_USD"), 1);
        assert_eq!(sink.queue().len("transactions"), 1);
    }

    #[tokio::test]
    async fn test_db_sink_appends_to_target_table() {
        let path = std::env::temp_dir().join("test_oanda_stream_sink.sqlite3");
        let _ = fs::remove_file(&path);
        let pool = crate::db::open_database(&path).await.unwrap();

        let mut sink = DbStreamSink::new(pool.clone(), StreamTarget::Pricing);
        sink.record(&price("USD_JPY", "t0")).await.unwrap();

        let json = sqlx::query_scalar::<_, String>("SELECT json FROM pricing_stream")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(json.contains("USD_JPY"));

        sink.close().await.unwrap();
        let _ = fs::remove_file(&path);
    }
}
