use anyhow::{bail, Context, Result};
use oanda_broker::{fetch_info, InfoTarget, RestClient, StreamConfig, StreamError, StreamRecorder};
use oanda_core::{
    load_config, resolve_config_path, write_config_template, Config, SpreadRatio, StreamSink,
    StreamTarget, Transaction,
};
use oanda_data::{CsvStreamSink, DbStreamSink, QueueSink};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Pause between stream reconnect attempts so a fast-failing endpoint is
/// not hammered for the whole idle budget.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

fn load(file: Option<&Path>) -> Result<Config> {
    let path = resolve_config_path(file);
    Ok(load_config(&path)?)
}

fn print_serialized<T: Serialize>(value: &T, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print!("{}", serde_yaml::to_string(value)?);
    }
    Ok(())
}

/// Arguments take precedence over the configured instrument list.
fn pick_instruments(args: Vec<String>, config: &Config) -> Vec<String> {
    if args.is_empty() {
        config.instruments.clone()
    } else {
        args
    }
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

pub fn run_init(file: Option<&Path>) -> Result<()> {
    let path = resolve_config_path(file);
    if write_config_template(&path)? {
        println!("A configuration file was created: {}", path.display());
    } else {
        println!(
            "A configuration file already exists: {}",
            path.display()
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// info
// ---------------------------------------------------------------------------

pub async fn run_info(
    file: Option<&Path>,
    target: &str,
    instruments: Vec<String>,
    json: bool,
) -> Result<()> {
    let config = load(file)?;
    let target: InfoTarget = target.parse()?;
    let instruments = pick_instruments(instruments, &config);
    let client = RestClient::new(&config)?;
    let body = fetch_info(&client, target, &instruments).await?;
    print_serialized(&body, json)
}

// ---------------------------------------------------------------------------
// track
// ---------------------------------------------------------------------------

pub struct TrackArgs {
    pub granularity: String,
    pub count: u32,
    pub csv_dir: Option<PathBuf>,
    pub sqlite: Option<PathBuf>,
    pub json: bool,
    pub quiet: bool,
    pub instruments: Vec<String>,
}

pub async fn run_track(file: Option<&Path>, args: TrackArgs) -> Result<()> {
    let config = load(file)?;
    let instruments = pick_instruments(args.instruments, &config);
    if instruments.is_empty() {
        bail!("no instruments given and none configured");
    }
    let client = RestClient::new(&config)?;

    let mut candles = Vec::new();
    for instrument in &instruments {
        let fetched = client
            .candles(instrument, &args.granularity, args.count)
            .await
            .with_context(|| format!("candle fetch failed for {instrument}"))?;
        info!(instrument, candles = fetched.len(), "fetched candles");
        candles.extend(fetched);
    }

    if let Some(dir) = &args.csv_dir {
        oanda_data::write_candles_csv(dir, &args.granularity, &candles)?;
    }
    if let Some(db) = &args.sqlite {
        let pool = oanda_data::open_database(db).await?;
        let inserted = oanda_data::insert_new_candles(&pool, &candles).await?;
        pool.close().await;
        info!(inserted, "new candle rows");
    }
    if !args.quiet {
        print_serialized(&candles, args.json)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// transaction
// ---------------------------------------------------------------------------

pub struct TransactionArgs {
    pub from: Option<String>,
    pub to: Option<String>,
    pub csv: Option<PathBuf>,
    pub sqlite: Option<PathBuf>,
    pub pl_graph: Option<PathBuf>,
    pub json: bool,
    pub quiet: bool,
}

pub async fn run_transaction(file: Option<&Path>, args: TransactionArgs) -> Result<()> {
    let config = load(file)?;
    let client = RestClient::new(&config)?;
    let transactions = client
        .list_transactions(args.from.as_deref(), args.to.as_deref())
        .await?;
    info!(count = transactions.len(), "fetched transactions");

    if let Some(path) = &args.csv {
        let appended = oanda_data::append_transactions_csv(path, &transactions)?;
        info!(appended, path = %path.display(), "new transaction rows");
    }
    if let Some(db) = &args.sqlite {
        let pool = oanda_data::open_database(db).await?;
        let inserted = oanda_data::insert_new_transactions(&pool, &transactions).await?;
        pool.close().await;
        info!(inserted, "new transaction rows");
    }
    if let Some(graph) = &args.pl_graph {
        if transactions.is_empty() {
            println!("No transactions to plot.");
        } else {
            let rows: Vec<String> = transactions.iter().map(Transaction::json).collect();
            let points = oanda_plot::extract_pl_points(&rows);
            oanda_plot::plot_pl(&points, graph)?;
            println!("PL chart saved: {}", graph.display());
        }
    }
    if !args.quiet {
        let raw: Vec<&Value> = transactions.iter().map(|t| &t.raw).collect();
        print_serialized(&raw, args.json)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// stream
// ---------------------------------------------------------------------------

pub struct StreamArgs {
    pub target: String,
    pub timeout: u64,
    pub csv: Option<PathBuf>,
    pub sqlite: Option<PathBuf>,
    pub use_queue: bool,
    pub queue_max_len: Option<usize>,
    pub ignore_api_error: bool,
    pub json: bool,
    pub quiet: bool,
    pub instruments: Vec<String>,
}

pub async fn run_stream(file: Option<&Path>, args: StreamArgs) -> Result<()> {
    let config = load(file)?;
    let target: StreamTarget = args.target.parse()?;
    let instruments = pick_instruments(args.instruments, &config);
    let client = RestClient::new(&config)?;

    let mut sinks: Vec<Box<dyn StreamSink>> = Vec::new();
    if let Some(path) = &args.csv {
        sinks.push(Box::new(CsvStreamSink::new(path)));
    }
    if let Some(db) = &args.sqlite {
        let pool = oanda_data::open_database(db).await?;
        sinks.push(Box::new(DbStreamSink::new(pool, target)));
    }
    if args.use_queue {
        let max_len = args.queue_max_len.unwrap_or(config.queue.max_length);
        sinks.push(Box::new(QueueSink::new(max_len)));
    }

    let stream_config = StreamConfig {
        target,
        instruments,
        print_json: args.json,
        quiet: args.quiet,
        idle_timeout: Duration::from_secs(args.timeout),
        ..StreamConfig::default()
    };
    let mut recorder = StreamRecorder::new(client, stream_config, sinks)?;

    // One run() call is one connection attempt. Sink failures are always
    // fatal; connection drops are retried only with --ignore-api-error and
    // only while messages keep arriving within the idle budget.
    let result = loop {
        match recorder.run().await {
            Ok(()) => break Ok(()),
            Err(StreamError::Sink(e)) => break Err(e.into()),
            Err(StreamError::Connection(e)) => {
                if !args.ignore_api_error {
                    break Err(e.into());
                }
                if recorder.idle_exceeded() {
                    break Err(anyhow::Error::from(e).context("idle timeout exceeded"));
                }
                warn!(error = %e, "stream connection dropped, reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    };
    recorder.shutdown().await;
    result
}

// ---------------------------------------------------------------------------
// plotpl
// ---------------------------------------------------------------------------

pub async fn run_plotpl(data_path: &Path, graph_path: &Path) -> Result<()> {
    oanda_plot::read_and_plot_pl(data_path, graph_path).await?;
    println!("PL chart saved: {}", graph_path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// spread
// ---------------------------------------------------------------------------

pub async fn run_spread(
    file: Option<&Path>,
    csv: Option<&Path>,
    quiet: bool,
    instruments: Vec<String>,
) -> Result<()> {
    let config = load(file)?;
    let client = RestClient::new(&config)?;
    let mut instruments = pick_instruments(instruments, &config);
    if instruments.is_empty() {
        instruments = client.tradeable_instruments().await?;
    }
    if instruments.is_empty() {
        println!("No tradeable instruments.");
        return Ok(());
    }

    let body = client.pricing(&instruments).await?;
    let mut ratios = extract_spread_ratios(&body);
    ratios.sort_by(|a, b| a.ratio_of_spread_to_mid.cmp(&b.ratio_of_spread_to_mid));

    if let Some(path) = csv {
        let mut writer = csv::Writer::from_path(path)?;
        for ratio in &ratios {
            writer.serialize(ratio)?;
        }
        writer.flush()?;
    }
    if !quiet {
        println!(
            "{:<12} {:>12} {:>12} {:>12} {:>10} {:>12}",
            "instrument", "bid", "ask", "mid", "spread", "spread/mid"
        );
        for r in &ratios {
            println!(
                "{:<12} {:>12} {:>12} {:>12} {:>10} {:>12}",
                r.instrument,
                r.bid,
                r.ask,
                r.mid,
                r.spread,
                r.ratio_of_spread_to_mid.round_dp(8)
            );
        }
    }
    Ok(())
}

/// Top-of-book bid/ask per instrument from a pricing response. Prices with
/// an empty book are skipped.
fn extract_spread_ratios(body: &Value) -> Vec<SpreadRatio> {
    body.get("prices")
        .and_then(Value::as_array)
        .map(|prices| {
            prices
                .iter()
                .filter_map(|price| {
                    let instrument = price.get("instrument")?.as_str()?;
                    let bid = top_of_book(price, "bids")?;
                    let ask = top_of_book(price, "asks")?;
                    Some(SpreadRatio::new(instrument, bid, ask))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn top_of_book(price: &Value, side: &str) -> Option<Decimal> {
    price
        .get(side)?
        .as_array()?
        .first()?
        .get("price")?
        .as_str()?
        .parse()
        .ok()
}

// ---------------------------------------------------------------------------
// close
// ---------------------------------------------------------------------------

pub async fn run_close(file: Option<&Path>, instruments: Vec<String>) -> Result<()> {
    let config = load(file)?;
    let client = RestClient::new(&config)?;
    let positions = client.open_positions().await?;
    let targets: Vec<_> = positions
        .into_iter()
        .filter(|p| instruments.is_empty() || instruments.contains(&p.instrument))
        .collect();
    if targets.is_empty() {
        println!("No positions to close.");
        return Ok(());
    }
    for position in &targets {
        let request = oanda_core::ClosePositionRequest::for_position(position);
        let response = client
            .close_position(&position.instrument, &request)
            .await
            .with_context(|| format!("close failed for {}", position.instrument))?;
        print_serialized(&response, false)?;
    }
    println!("Closed {} position(s).", targets.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spread_ratios_skip_empty_books() {
        let body = json!({
            "prices": [
                {
                    "instrument": "EUR_USD",
                    "bids": [{"price": "1.07000", "liquidity": 1000000}],
                    "asks": [{"price": "1.07010", "liquidity": 1000000}]
                },
                {"instrument": "USD_JPY", "bids": [], "asks": []}
            ]
        });
        let ratios = extract_spread_ratios(&body);
        assert_eq!(ratios.len(), 1);
        assert_eq!(ratios[0].instrument, "EUR_USD");
        assert_eq!(ratios[0].spread.to_string(), "0.00010");
    }

    #[test]
    fn test_reconnect_attempts_are_spaced_out() {
        assert!(RECONNECT_DELAY >= Duration::from_millis(500));
    }

    #[test]
    fn test_args_override_configured_instruments() {
        let config: Config = serde_yaml::from_str(
            "oanda:\n  environment: practice\n  token: t\n  account_id: a\ninstruments:\n  - EUR_USD\n",
        )
        .unwrap();
        assert_eq!(
            pick_instruments(vec!["USD_JPY".to_string()], &config),
            vec!["USD_JPY"]
        );
        assert_eq!(pick_instruments(Vec::new(), &config), vec!["EUR_USD"]);
    }
}
