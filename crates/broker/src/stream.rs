use futures_util::StreamExt;
use oanda_core::{BrokerError, DataError, StreamMessage, StreamSink, StreamTarget};
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::rest::RestClient;

/// Errors surfaced by one stream invocation. Connection-level errors are
/// subject to the ignore/idle-timeout policy; sink errors are always fatal.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Connection(#[from] BrokerError),
    #[error("sink error: {0}")]
    Sink(#[from] DataError),
}

/// Behavior knobs for the stream recorder.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub target: StreamTarget,
    pub instruments: Vec<String>,
    /// Drop heartbeats instead of treating them as accepted messages.
    pub skip_heartbeats: bool,
    pub print_json: bool,
    pub quiet: bool,
    /// Maximum wait for the next inbound chunk before the connection is
    /// considered dead.
    pub read_timeout: Duration,
    /// Maximum tolerated duration without a successfully processed message
    /// before a connection error becomes fatal.
    pub idle_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            target: StreamTarget::Pricing,
            instruments: Vec::new(),
            skip_heartbeats: true,
            print_json: false,
            quiet: false,
            read_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Connecting,
    Streaming,
    Closed,
}

/// Records one live stream into a set of sinks.
///
/// A single concrete type: connect/read/classify live here, the sinks
/// supply the persistence behavior. One call to [`run`](Self::run) is one
/// connection attempt; on a connection error the caller decides whether to
/// re-invoke (see [`idle_exceeded`](Self::idle_exceeded)). The recorder
/// never silently reconnects on its own.
pub struct StreamRecorder {
    client: RestClient,
    config: StreamConfig,
    sinks: Vec<Box<dyn StreamSink>>,
    state: StreamState,
    started_at: Instant,
    last_message_at: Option<Instant>,
}

impl std::fmt::Debug for StreamRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRecorder")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("started_at", &self.started_at)
            .field("last_message_at", &self.last_message_at)
            .finish_non_exhaustive()
    }
}

impl StreamRecorder {
    pub fn new(
        client: RestClient,
        config: StreamConfig,
        sinks: Vec<Box<dyn StreamSink>>,
    ) -> Result<Self, BrokerError> {
        if config.target == StreamTarget::Pricing && config.instruments.is_empty() {
            return Err(BrokerError::InstrumentsRequired("pricing".to_string()));
        }
        Ok(Self {
            client,
            config,
            sinks,
            state: StreamState::Connecting,
            started_at: Instant::now(),
            last_message_at: None,
        })
    }

    /// Open the stream and process messages until the server disconnects
    /// (clean end, `Ok`), the connection drops, or a sink fails.
    pub async fn run(&mut self) -> Result<(), StreamError> {
        self.state = StreamState::Connecting;
        let response = self
            .client
            .open_stream(self.config.target, &self.config.instruments)
            .await?;
        self.state = StreamState::Streaming;
        match self.config.target {
            StreamTarget::Pricing => info!("start to stream market prices"),
            StreamTarget::Transaction => info!("start to stream events for the account"),
        }

        let mut body = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let chunk = match timeout(self.config.read_timeout, body.next()).await {
                Err(_) => {
                    return Err(BrokerError::ConnectionFailed(format!(
                        "no data within {:?}",
                        self.config.read_timeout
                    ))
                    .into())
                }
                Ok(None) => {
                    return Err(
                        BrokerError::ConnectionFailed("stream closed by server".to_string()).into(),
                    )
                }
                Ok(Some(Err(e))) => return Err(BrokerError::ConnectionFailed(e.to_string()).into()),
                Ok(Some(Ok(chunk))) => chunk,
            };
            buffer.extend_from_slice(&chunk);

            // Messages are newline-delimited JSON objects.
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(line) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(error = %e, line, "unparseable stream line, skipped");
                        continue;
                    }
                };
                if value.get("disconnect").is_some() {
                    warn!(message = %value, "streaming disconnected");
                    return Ok(());
                }
                self.last_message_at = Some(Instant::now());
                self.handle(&StreamMessage::classify(value)).await?;
            }
        }
    }

    async fn handle(&mut self, message: &StreamMessage) -> Result<(), DataError> {
        if message.is_heartbeat() && self.config.skip_heartbeats {
            debug!(message = %message.raw(), "heartbeat");
            return Ok(());
        }
        // A price tick is only acceptable with a populated instrument field.
        if matches!(message, StreamMessage::Price(_)) && message.instrument().is_none() {
            warn!(message = %message.raw(), "price tick without instrument, dropped");
            return Ok(());
        }
        self.print(message);
        for sink in &mut self.sinks {
            sink.record(message).await?;
        }
        Ok(())
    }

    fn print(&self, message: &StreamMessage) {
        if self.config.quiet {
            debug!(message = %message.raw());
        } else if self.config.print_json {
            println!("{}", message.raw());
        } else if let Ok(yaml) = serde_yaml::to_string(message.raw()) {
            println!("{}", yaml.trim_end());
        }
    }

    /// Whether the idle-timeout budget is spent: time since the last
    /// successfully processed message (or since start, if none yet)
    /// exceeds the configured limit.
    pub fn idle_exceeded(&self) -> bool {
        let reference = self.last_message_at.unwrap_or(self.started_at);
        reference.elapsed() >= self.config.idle_timeout
    }

    /// Release sink resources. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.state == StreamState::Closed {
            return;
        }
        self.state = StreamState::Closed;
        for sink in &mut self.sinks {
            if let Err(e) = sink.close().await {
                warn!(error = %e, "sink close failed");
            }
        }
        info!("stream shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use oanda_core::{Config, Environment, OandaConfig, QueueConfig};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink {
        records: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StreamSink for CountingSink {
        async fn record(&mut self, _message: &StreamMessage) -> Result<(), DataError> {
            self.records.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), DataError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_recorder(
        config: StreamConfig,
    ) -> (StreamRecorder, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let records = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let sink = CountingSink {
            records: Arc::clone(&records),
            closes: Arc::clone(&closes),
        };
        let client = RestClient::new(&Config {
            oanda: OandaConfig {
                environment: Environment::Practice,
                token: "token".to_string(),
                account_id: "account".to_string(),
            },
            instruments: vec![],
            queue: QueueConfig::default(),
        })
        .unwrap();
        let recorder = StreamRecorder::new(client, config, vec![Box::new(sink)]).unwrap();
        (recorder, records, closes)
    }

    fn quiet_config() -> StreamConfig {
        StreamConfig {
            instruments: vec!["EUR_USD".to_string()],
            quiet: true,
            ..StreamConfig::default()
        }
    }

    #[test]
    fn test_pricing_requires_instruments() {
        let client = RestClient::new(&Config {
            oanda: OandaConfig {
                environment: Environment::Practice,
                token: "token".to_string(),
                account_id: "account".to_string(),
            },
            instruments: vec![],
            queue: QueueConfig::default(),
        })
        .unwrap();
        let err = StreamRecorder::new(client, StreamConfig::default(), vec![]).unwrap_err();
        assert!(matches!(err, BrokerError::InstrumentsRequired(_)));
    }

    #[tokio::test]
    async fn test_skipped_heartbeat_writes_nothing() {
        let (mut recorder, records, _) = test_recorder(quiet_config());
        let heartbeat = StreamMessage::classify(json!({"type": "HEARTBEAT", "time": "t"}));
        recorder.handle(&heartbeat).await.unwrap();
        assert_eq!(records.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_instrumentless_price_dropped() {
        let (mut recorder, records, _) = test_recorder(quiet_config());
        let tick = StreamMessage::classify(json!({"type": "PRICE", "instrument": ""}));
        recorder.handle(&tick).await.unwrap();
        assert_eq!(records.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_accepted_messages_reach_sinks() {
        let (mut recorder, records, _) = test_recorder(quiet_config());
        let tick = StreamMessage::classify(json!({"type": "PRICE", "instrument": "EUR_USD"}));
        let event = StreamMessage::classify(json!({"type": "ORDER_FILL", "id": 1}));
        recorder.handle(&tick).await.unwrap();
        recorder.handle(&event).await.unwrap();
        assert_eq!(records.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unskipped_heartbeat_is_recorded() {
        let config = StreamConfig {
            skip_heartbeats: false,
            ..quiet_config()
        };
        let (mut recorder, records, _) = test_recorder(config);
        let heartbeat = StreamMessage::classify(json!({"type": "HEARTBEAT", "time": "t"}));
        recorder.handle(&heartbeat).await.unwrap();
        assert_eq!(records.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (mut recorder, _, closes) = test_recorder(quiet_config());
        recorder.shutdown().await;
        recorder.shutdown().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idle_budget_starts_spent_free() {
        let config = StreamConfig {
            idle_timeout: Duration::from_secs(300),
            ..quiet_config()
        };
        let (recorder, _, _) = test_recorder(config);
        assert!(!recorder.idle_exceeded());
    }
}
