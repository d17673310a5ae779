use oanda_core::BrokerError;
use serde_json::Value;
use std::str::FromStr;
use tracing::debug;

use crate::rest::RestClient;

/// The read-only query kinds the `info` command can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoTarget {
    Accounts,
    Account,
    Instruments,
    Orders,
    Trades,
    Positions,
    Transactions,
    Prices,
    Position,
    OrderBook,
    PositionBook,
}

impl InfoTarget {
    pub fn name(&self) -> &'static str {
        match self {
            InfoTarget::Accounts => "accounts",
            InfoTarget::Account => "account",
            InfoTarget::Instruments => "instruments",
            InfoTarget::Orders => "orders",
            InfoTarget::Trades => "trades",
            InfoTarget::Positions => "positions",
            InfoTarget::Transactions => "transactions",
            InfoTarget::Prices => "prices",
            InfoTarget::Position => "position",
            InfoTarget::OrderBook => "order_book",
            InfoTarget::PositionBook => "position_book",
        }
    }

    /// Targets that cannot be queried without at least one instrument.
    pub fn requires_instruments(&self) -> bool {
        matches!(
            self,
            InfoTarget::Prices | InfoTarget::Position | InfoTarget::OrderBook | InfoTarget::PositionBook
        )
    }
}

impl FromStr for InfoTarget {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accounts" => Ok(InfoTarget::Accounts),
            "account" => Ok(InfoTarget::Account),
            "instruments" => Ok(InfoTarget::Instruments),
            "orders" => Ok(InfoTarget::Orders),
            "trades" => Ok(InfoTarget::Trades),
            "positions" => Ok(InfoTarget::Positions),
            "transactions" => Ok(InfoTarget::Transactions),
            "prices" => Ok(InfoTarget::Prices),
            "position" => Ok(InfoTarget::Position),
            "order_book" => Ok(InfoTarget::OrderBook),
            "position_book" => Ok(InfoTarget::PositionBook),
            other => Err(BrokerError::InvalidTarget(other.to_string())),
        }
    }
}

/// Dispatch one info query and return the raw response body. Validation
/// happens up front: a per-instrument target without an instrument fails
/// before any request goes out.
pub async fn fetch_info(
    client: &RestClient,
    target: InfoTarget,
    instruments: &[String],
) -> Result<Value, BrokerError> {
    if target.requires_instruments() && instruments.is_empty() {
        return Err(BrokerError::InstrumentsRequired(target.name().to_string()));
    }
    debug!(target = target.name(), "information target");

    let account = client.account_id().to_string();
    let csv = instruments.join(",");
    match target {
        InfoTarget::Accounts => client.get("/v3/accounts", &[]).await,
        InfoTarget::Account => client.get(&format!("/v3/accounts/{account}"), &[]).await,
        InfoTarget::Instruments => {
            let query: Vec<(&str, String)> = if instruments.is_empty() {
                Vec::new()
            } else {
                vec![("instruments", csv)]
            };
            client
                .get(&format!("/v3/accounts/{account}/instruments"), &query)
                .await
        }
        InfoTarget::Orders => {
            client
                .get(&format!("/v3/accounts/{account}/pendingOrders"), &[])
                .await
        }
        InfoTarget::Trades => {
            client
                .get(&format!("/v3/accounts/{account}/openTrades"), &[])
                .await
        }
        InfoTarget::Positions => {
            client
                .get(&format!("/v3/accounts/{account}/openPositions"), &[])
                .await
        }
        InfoTarget::Transactions => {
            client
                .get(&format!("/v3/accounts/{account}/transactions"), &[])
                .await
        }
        InfoTarget::Prices => {
            client
                .get(
                    &format!("/v3/accounts/{account}/pricing"),
                    &[("instruments", csv)],
                )
                .await
        }
        InfoTarget::Position => {
            client
                .get(
                    &format!("/v3/accounts/{account}/positions/{}", instruments[0]),
                    &[],
                )
                .await
        }
        InfoTarget::OrderBook => {
            client
                .get(&format!("/v3/instruments/{}/orderBook", instruments[0]), &[])
                .await
        }
        InfoTarget::PositionBook => {
            client
                .get(
                    &format!("/v3/instruments/{}/positionBook", instruments[0]),
                    &[],
                )
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oanda_core::{Config, Environment, OandaConfig, QueueConfig};

    fn test_client() -> RestClient {
        let config = Config {
            oanda: OandaConfig {
                environment: Environment::Practice,
                token: "token".to_string(),
                account_id: "001-001-0000001-001".to_string(),
            },
            instruments: vec![],
            queue: QueueConfig::default(),
        };
        RestClient::new(&config).unwrap()
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!("position_book".parse::<InfoTarget>().unwrap(), InfoTarget::PositionBook);
        let err = "bogus".parse::<InfoTarget>().unwrap_err();
        assert!(matches!(err, BrokerError::InvalidTarget(t) if t == "bogus"));
    }

    #[tokio::test]
    async fn test_per_instrument_target_requires_instrument() {
        let client = test_client();
        let err = fetch_info(&client, InfoTarget::Position, &[]).await.unwrap_err();
        assert!(matches!(err, BrokerError::InstrumentsRequired(t) if t == "position"));

        let err = fetch_info(&client, InfoTarget::Prices, &[]).await.unwrap_err();
        assert!(matches!(err, BrokerError::InstrumentsRequired(_)));
    }
}
