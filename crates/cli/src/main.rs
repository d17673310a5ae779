mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "oanda-cli")]
#[command(about = "Command line client for the OANDA v20 REST and streaming API")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Path to the YAML configuration file
    #[arg(short, long, env = "OANDA_YML")]
    file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration template
    Init,

    /// Print information about the account
    Info {
        /// Target (accounts, account, instruments, orders, trades, positions,
        /// transactions, prices, position, order_book, position_book)
        target: String,

        /// Instruments (e.g. "EUR_USD USD_JPY")
        instruments: Vec<String>,

        /// Print JSON instead of YAML
        #[arg(long)]
        json: bool,
    },

    /// Fetch the latest rate candles and record them
    Track {
        /// Candlestick granularity
        #[arg(short, long, default_value = "S5")]
        granularity: String,

        /// Number of candles per instrument
        #[arg(short, long, default_value = "60")]
        count: u32,

        /// Directory for per-day per-instrument CSV files
        #[arg(long)]
        csv_dir: Option<PathBuf>,

        /// SQLite database file
        #[arg(long)]
        sqlite: Option<PathBuf>,

        /// Print JSON instead of YAML
        #[arg(long)]
        json: bool,

        /// Suppress candle output
        #[arg(short, long)]
        quiet: bool,

        /// Instruments (defaults to the configured list)
        instruments: Vec<String>,
    },

    /// Fetch transactions in a time window and record them
    Transaction {
        /// Window start time (RFC3339)
        #[arg(long)]
        from: Option<String>,

        /// Window end time (RFC3339)
        #[arg(long)]
        to: Option<String>,

        /// CSV/TSV file to append to
        #[arg(long)]
        csv: Option<PathBuf>,

        /// SQLite database file
        #[arg(long)]
        sqlite: Option<PathBuf>,

        /// Render a PL chart to this path after recording
        #[arg(long)]
        pl_graph: Option<PathBuf>,

        /// Print JSON instead of YAML
        #[arg(long)]
        json: bool,

        /// Suppress transaction output
        #[arg(short, long)]
        quiet: bool,
    },

    /// Record a live price or event stream
    Stream {
        /// Stream target (pricing, transaction)
        #[arg(short, long, default_value = "pricing")]
        target: String,

        /// Seconds without any processed message before a connection error
        /// becomes fatal
        #[arg(long, default_value = "300")]
        timeout: u64,

        /// CSV/TSV file to append to
        #[arg(long)]
        csv: Option<PathBuf>,

        /// SQLite database file
        #[arg(long)]
        sqlite: Option<PathBuf>,

        /// Keep messages in bounded in-memory queues
        #[arg(long)]
        use_queue: bool,

        /// Queue cap override (defaults to the configured max_length)
        #[arg(long)]
        queue_max_len: Option<usize>,

        /// Retry on connection-level errors instead of failing
        #[arg(long)]
        ignore_api_error: bool,

        /// Print JSON instead of YAML
        #[arg(long)]
        json: bool,

        /// Suppress message output
        #[arg(short, long)]
        quiet: bool,

        /// Instruments (required for pricing; defaults to the configured list)
        instruments: Vec<String>,
    },

    /// Render a PL chart from recorded transaction history
    Plotpl {
        /// Transaction history (.csv/.tsv/.txt or .sqlite3/.sqlite/.db)
        data_path: PathBuf,

        /// Output image (.svg for vector, anything else bitmap)
        graph_path: PathBuf,
    },

    /// Print current spread-to-mid ratios per instrument
    Spread {
        /// Write the table to a CSV file as well
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Suppress the printed table
        #[arg(short, long)]
        quiet: bool,

        /// Instruments (defaults to the configured, then all tradeable ones)
        instruments: Vec<String>,
    },

    /// Close open positions
    Close {
        /// Instruments to close (defaults to all open positions)
        instruments: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Init => commands::run_init(cli.file.as_deref()),
        Commands::Info {
            target,
            instruments,
            json,
        } => commands::run_info(cli.file.as_deref(), &target, instruments, json).await,
        Commands::Track {
            granularity,
            count,
            csv_dir,
            sqlite,
            json,
            quiet,
            instruments,
        } => {
            commands::run_track(
                cli.file.as_deref(),
                commands::TrackArgs {
                    granularity,
                    count,
                    csv_dir,
                    sqlite,
                    json,
                    quiet,
                    instruments,
                },
            )
            .await
        }
        Commands::Transaction {
            from,
            to,
            csv,
            sqlite,
            pl_graph,
            json,
            quiet,
        } => {
            commands::run_transaction(
                cli.file.as_deref(),
                commands::TransactionArgs {
                    from,
                    to,
                    csv,
                    sqlite,
                    pl_graph,
                    json,
                    quiet,
                },
            )
            .await
        }
        Commands::Stream {
            target,
            timeout,
            csv,
            sqlite,
            use_queue,
            queue_max_len,
            ignore_api_error,
            json,
            quiet,
            instruments,
        } => {
            commands::run_stream(
                cli.file.as_deref(),
                commands::StreamArgs {
                    target,
                    timeout,
                    csv,
                    sqlite,
                    use_queue,
                    queue_max_len,
                    ignore_api_error,
                    json,
                    quiet,
                    instruments,
                },
            )
            .await
        }
        Commands::Plotpl {
            data_path,
            graph_path,
        } => commands::run_plotpl(&data_path, &graph_path).await,
        Commands::Spread {
            csv,
            quiet,
            instruments,
        } => commands::run_spread(cli.file.as_deref(), csv.as_deref(), quiet, instruments).await,
        Commands::Close { instruments } => {
            commands::run_close(cli.file.as_deref(), instruments).await
        }
    }
}
