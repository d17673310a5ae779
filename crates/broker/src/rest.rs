use chrono::{DateTime, Utc};
use oanda_core::{BrokerError, Candle, ClosePositionRequest, Config, Position, StreamTarget, Transaction};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info};

/// Timeout for plain REST requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout for the streaming endpoint; no total timeout there,
/// the connection is expected to stay open.
const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between paginated transaction-range requests, to respect the
/// API's rate limits.
const PAGE_DELAY: Duration = Duration::from_millis(500);

/// Gateway to the OANDA v20 REST and streaming hosts. Attaches the bearer
/// token to every request and logs each response status.
pub struct RestClient {
    http: reqwest::Client,
    stream_http: reqwest::Client,
    rest_base: String,
    stream_base: String,
    token: String,
    account_id: String,
}

impl RestClient {
    pub fn new(config: &Config) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        let stream_http = reqwest::Client::builder()
            .connect_timeout(STREAM_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            http,
            stream_http,
            rest_base: config.oanda.environment.rest_url().to_string(),
            stream_base: config.oanda.environment.stream_url().to_string(),
            token: config.oanda.token.clone(),
            account_id: config.oanda.account_id.clone(),
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Send a prepared request, log the outcome, and parse the JSON body.
    /// Statuses in 100..400 are logged at debug; anything else is logged
    /// with the full body and returned as an error.
    async fn dispatch(&self, request: reqwest::RequestBuilder) -> Result<Value, BrokerError> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        if status.as_u16() < 400 {
            debug!(status = status.as_u16(), body = %body, "response");
            serde_json::from_str(&body).map_err(|e| BrokerError::ParseError(e.to_string()))
        } else {
            error!(status = status.as_u16(), body = %body, "response");
            Err(BrokerError::Api {
                status: status.as_u16(),
                body,
            })
        }
    }

    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, BrokerError> {
        let url = format!("{}{}", self.rest_base, path);
        self.dispatch(self.http.get(url).query(query)).await
    }

    async fn put<B: serde::Serialize>(&self, path: &str, body: &B) -> Result<Value, BrokerError> {
        let url = format!("{}{}", self.rest_base, path);
        self.dispatch(self.http.put(url).json(body)).await
    }

    // -----------------------------------------------------------------------
    // Candles
    // -----------------------------------------------------------------------

    /// Fetch the most recent `count` bid/ask candles for one instrument,
    /// dropping any candle the server has not marked complete (the latest
    /// period may still be open).
    pub async fn candles(
        &self,
        instrument: &str,
        granularity: &str,
        count: u32,
    ) -> Result<Vec<Candle>, BrokerError> {
        let body = self
            .get(
                &format!("/v3/instruments/{instrument}/candles"),
                &[
                    ("price", "BA".to_string()),
                    ("granularity", granularity.to_string()),
                    ("count", count.to_string()),
                ],
            )
            .await?;
        let response: CandlesResponse =
            serde_json::from_value(body).map_err(|e| BrokerError::ParseError(e.to_string()))?;
        Ok(response
            .candles
            .into_iter()
            .filter(|c| c.complete)
            .map(|c| c.flatten(&response.instrument))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Positions
    // -----------------------------------------------------------------------

    pub async fn open_positions(&self) -> Result<Vec<Position>, BrokerError> {
        let body = self
            .get(&format!("/v3/accounts/{}/openPositions", self.account_id), &[])
            .await?;
        let positions = body.get("positions").cloned().unwrap_or(Value::Array(vec![]));
        serde_json::from_value(positions).map_err(|e| BrokerError::ParseError(e.to_string()))
    }

    pub async fn close_position(
        &self,
        instrument: &str,
        request: &ClosePositionRequest,
    ) -> Result<Value, BrokerError> {
        info!(instrument, long_units = %request.long_units, short_units = %request.short_units, "closing position");
        self.put(
            &format!("/v3/accounts/{}/positions/{instrument}/close", self.account_id),
            request,
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Pricing
    // -----------------------------------------------------------------------

    pub async fn pricing(&self, instruments: &[String]) -> Result<Value, BrokerError> {
        self.get(
            &format!("/v3/accounts/{}/pricing", self.account_id),
            &[("instruments", instruments.join(","))],
        )
        .await
    }

    /// Names of all instruments tradeable on the account.
    pub async fn tradeable_instruments(&self) -> Result<Vec<String>, BrokerError> {
        let body = self
            .get(&format!("/v3/accounts/{}/instruments", self.account_id), &[])
            .await?;
        let names = body
            .get("instruments")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// List transactions in the optional time window. When the result is
    /// large the API answers with page descriptor URLs instead of inline
    /// data; each page is fetched as an id-range request with a fixed delay
    /// in between.
    pub async fn list_transactions(
        &self,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<Vec<Transaction>, BrokerError> {
        let mut query = Vec::new();
        if let Some(from) = from {
            query.push(("from", from.to_string()));
        }
        if let Some(to) = to {
            query.push(("to", to.to_string()));
        }
        let body = self
            .get(&format!("/v3/accounts/{}/transactions", self.account_id), &query)
            .await?;

        let pages: Vec<String> = body
            .get("pages")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut transactions = Vec::new();
        for page in &pages {
            tokio::time::sleep(PAGE_DELAY).await;
            let range = parse_idrange(page)?;
            transactions.extend(self.transaction_idrange(&range).await?);
        }
        Ok(transactions)
    }

    async fn transaction_idrange(&self, range: &IdRange) -> Result<Vec<Transaction>, BrokerError> {
        let body = self
            .get(
                &format!("/v3/accounts/{}/transactions/idrange", self.account_id),
                &[
                    ("from", range.from.to_string()),
                    ("to", range.to.to_string()),
                ],
            )
            .await?;
        let items = body
            .get("transactions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        items.into_iter().map(Transaction::from_value).collect()
    }

    // -----------------------------------------------------------------------
    // Streaming
    // -----------------------------------------------------------------------

    /// Open the long-lived streaming connection. Pricing streams request an
    /// initial full snapshot; transaction streams are account-wide.
    pub async fn open_stream(
        &self,
        target: StreamTarget,
        instruments: &[String],
    ) -> Result<reqwest::Response, BrokerError> {
        let path = match target {
            StreamTarget::Pricing => format!("/v3/accounts/{}/pricing/stream", self.account_id),
            StreamTarget::Transaction => {
                format!("/v3/accounts/{}/transactions/stream", self.account_id)
            }
        };
        let mut request = self
            .stream_http
            .get(format!("{}{}", self.stream_base, path))
            .bearer_auth(&self.token);
        if target == StreamTarget::Pricing {
            request = request.query(&[
                ("instruments", instruments.join(",")),
                ("snapshot", "true".to_string()),
            ]);
        }
        let response = request
            .send()
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %body, "stream connect failed");
            return Err(BrokerError::Api {
                status: status.as_u16(),
                body,
            });
        }
        debug!(status = status.as_u16(), "stream connected");
        Ok(response)
    }
}

/// A transaction id range extracted from a page descriptor URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub from: i64,
    pub to: i64,
}

/// Parse a page descriptor, an opaque URL-like string whose query encodes a
/// from/to id range, e.g.
/// `https://host/v3/accounts/x/transactions/idrange?from=6000&to=6100`.
pub fn parse_idrange(page: &str) -> Result<IdRange, BrokerError> {
    let query = page
        .split_once('?')
        .map(|(_, q)| q)
        .ok_or_else(|| BrokerError::ParseError(format!("page without query: {page}")))?;
    let mut from = None;
    let mut to = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("from", v)) => from = v.parse::<i64>().ok(),
            Some(("to", v)) => to = v.parse::<i64>().ok(),
            _ => {}
        }
    }
    match (from, to) {
        (Some(from), Some(to)) => Ok(IdRange { from, to }),
        _ => Err(BrokerError::ParseError(format!(
            "page without id range: {page}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Candle response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    instrument: String,
    candles: Vec<RawCandlestick>,
}

#[derive(Debug, Deserialize)]
struct RawCandlestick {
    complete: bool,
    #[serde(default)]
    volume: i64,
    time: DateTime<Utc>,
    bid: Option<RawOhlc>,
    ask: Option<RawOhlc>,
    mid: Option<RawOhlc>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct RawOhlc {
    o: Decimal,
    h: Decimal,
    l: Decimal,
    c: Decimal,
}

impl RawCandlestick {
    fn flatten(self, instrument: &str) -> Candle {
        Candle {
            instrument: instrument.to_string(),
            time: self.time,
            volume: self.volume,
            bid_open: self.bid.map(|p| p.o),
            bid_high: self.bid.map(|p| p.h),
            bid_low: self.bid.map(|p| p.l),
            bid_close: self.bid.map(|p| p.c),
            ask_open: self.ask.map(|p| p.o),
            ask_high: self.ask.map(|p| p.h),
            ask_low: self.ask.map(|p| p.l),
            ask_close: self.ask.map(|p| p.c),
            mid_open: self.mid.map(|p| p.o),
            mid_high: self.mid.map(|p| p.h),
            mid_low: self.mid.map(|p| p.l),
            mid_close: self.mid.map(|p| p.c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_idrange() {
        let range =
            parse_idrange("https://host/v3/accounts/x/transactions/idrange?from=6000&to=6100")
                .unwrap();
        assert_eq!(range, IdRange { from: 6000, to: 6100 });
    }

    #[test]
    fn test_parse_idrange_extra_params() {
        let range = parse_idrange("https://host/path?type=ORDER_FILL&from=1&to=2").unwrap();
        assert_eq!(range, IdRange { from: 1, to: 2 });
    }

    #[test]
    fn test_parse_idrange_rejects_malformed() {
        assert!(parse_idrange("https://host/path").is_err());
        assert!(parse_idrange("https://host/path?from=1").is_err());
    }

    #[test]
    fn test_candle_flattening_drops_incomplete() {
        let body = serde_json::json!({
            "instrument": "EUR_USD",
            "granularity": "S5",
            "candles": [
                {
                    "complete": true,
                    "volume": 3,
                    "time": "2024-05-01T00:00:00.000000000Z",
                    "bid": {"o": "1.0700", "h": "1.0702", "l": "1.0699", "c": "1.0701"},
                    "ask": {"o": "1.0702", "h": "1.0704", "l": "1.0701", "c": "1.0703"}
                },
                {
                    "complete": false,
                    "volume": 1,
                    "time": "2024-05-01T00:00:05.000000000Z",
                    "bid": {"o": "1.0701", "h": "1.0701", "l": "1.0701", "c": "1.0701"},
                    "ask": {"o": "1.0703", "h": "1.0703", "l": "1.0703", "c": "1.0703"}
                }
            ]
        });
        let response: CandlesResponse = serde_json::from_value(body).unwrap();
        let candles: Vec<Candle> = response
            .candles
            .into_iter()
            .filter(|c| c.complete)
            .map(|c| c.flatten(&response.instrument))
            .collect();

        assert_eq!(candles.len(), 1);
        let candle = &candles[0];
        assert_eq!(candle.instrument, "EUR_USD");
        assert_eq!(candle.bid_open, Some(dec!(1.0700)));
        assert_eq!(candle.ask_close, Some(dec!(1.0703)));
        // No mid component requested: stays absent rather than defaulted.
        assert_eq!(candle.mid_open, None);
    }
}
