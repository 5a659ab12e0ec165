//! trove-cli — watch-only command-line tools for Trove.
//!
//! Derives addresses from account xpubs, decodes addresses, follows an xpub
//! on the history backend and broadcasts signed transactions.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use trove_backend::{BackendSync, HttpBackend};
use trove_core::address::{decode_address, encode_address};
use trove_core::hdnode::{decode_xpub, derive_child, format_path};
use trove_core::types::{Transaction, TxKind};
use trove_wallet::history::build_history;
use trove_wallet::{format_amount, Branch, BranchEvent, CoinPolicy, WalletConfig};

/// Trove command-line interface.
#[derive(Parser)]
#[command(name = "trove-cli")]
#[command(version, about = "Watch-only wallet tools for Trove")]
struct Cli {
    /// Config file (default: <data dir>/trove/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive addresses from a branch xpub.
    Derive(DeriveArgs),
    /// Decode an address into its version byte and hash.
    DecodeAddress(DecodeArgs),
    /// Subscribe to a branch xpub and print its balance and history.
    Watch(WatchArgs),
    /// Broadcast a signed transaction.
    Broadcast(BroadcastArgs),
}

#[derive(Args)]
struct DeriveArgs {
    /// Branch xpub (external or change).
    xpub: String,

    /// Coin whose address version to use.
    #[arg(short, long, default_value = "Bitcoin")]
    coin: String,

    /// First address index.
    #[arg(short, long, default_value_t = 0)]
    start: u32,

    /// Number of addresses.
    #[arg(short = 'n', long, default_value_t = 10)]
    count: u32,
}

#[derive(Args)]
struct DecodeArgs {
    address: String,
}

#[derive(Args)]
struct WatchArgs {
    /// Branch xpub to follow.
    xpub: String,

    #[arg(short, long, default_value = "Bitcoin")]
    coin: String,

    /// Keep following updates until interrupted.
    #[arg(short, long)]
    follow: bool,

    /// Print history as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct BroadcastArgs {
    /// Hex-encoded signed transaction.
    raw_tx: String,

    #[arg(short, long, default_value = "Bitcoin")]
    coin: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, &cli.log_format);

    let config_path = cli.config.or_else(default_config_path);
    let config = WalletConfig::load(config_path.as_deref()).context("Failed to load config")?;

    match cli.command {
        Commands::Derive(args) => derive(&config, args),
        Commands::DecodeAddress(args) => decode(args),
        Commands::Watch(args) => watch(&config, args).await,
        Commands::Broadcast(args) => broadcast(&config, args).await,
    }
}

/// Print `count` addresses starting at `start`.
fn derive(config: &WalletConfig, args: DeriveArgs) -> Result<()> {
    let policy = coin_policy(config, &args.coin)?;
    let (version, node) = decode_xpub(&args.xpub).context("Invalid xpub")?;
    if version != policy.xpub_version {
        warn!(
            expected = policy.xpub_version,
            got = version,
            "xpub version does not match coin"
        );
    }
    let address_version = policy.address_version;
    for index in args.start..args.start.saturating_add(args.count) {
        let child = derive_child(&node, index)
            .with_context(|| format!("Failed to derive child {index}"))?;
        println!("{index:>5}  {}", encode_address(&child, address_version));
    }
    Ok(())
}

fn decode(args: DecodeArgs) -> Result<()> {
    let decoded = decode_address(&args.address).context("Invalid address")?;
    println!("Version: {}", decoded.version);
    println!("Hash160: {}", hex::encode(decoded.hash));
    Ok(())
}

/// Subscribe a branch and print what the backend reports.
async fn watch(config: &WalletConfig, args: WatchArgs) -> Result<()> {
    let backend = backend(config, &args.coin)?;
    let (_, node) = decode_xpub(&args.xpub).context("Invalid xpub")?;
    let address_version = coin_policy(config, &args.coin)?.address_version;
    let branch = Branch::new(node, address_version, backend);
    let mut events = branch.events();

    branch
        .subscribe()
        .await
        .with_context(|| format!("Failed to subscribe {}", args.xpub))?;
    print_branch(&branch, args.json)?;

    if !args.follow {
        return Ok(());
    }
    info!(xpub = %args.xpub, "following updates");
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(BranchEvent::Updated { .. }) => print_branch(&branch, args.json)?,
                Ok(BranchEvent::Failed(message)) => warn!(%message, "update failed"),
                Err(e) => bail!("Update stream closed: {e}"),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    branch.unsubscribe();
    Ok(())
}

async fn broadcast(config: &WalletConfig, args: BroadcastArgs) -> Result<()> {
    let raw = hex::decode(args.raw_tx.trim()).context("Invalid hex transaction")?;
    let backend = backend(config, &args.coin)?;
    backend.send(&raw).await.context("Broadcast failed")?;
    println!("Broadcast {} bytes to {}", raw.len(), args.coin);
    Ok(())
}

/// The branch's cached history, analysed with running balances.
fn branch_history(branch: &Branch) -> Vec<Transaction> {
    build_history([branch.transactions()])
}

fn print_branch(branch: &Branch, json: bool) -> Result<()> {
    let transactions = branch_history(branch);
    if json {
        println!("{}", serde_json::to_string_pretty(&transactions)?);
        return Ok(());
    }
    println!("\n=== {} ===", format_path(&branch.node().path));
    println!("Balance: {}", format_amount(branch.balance()));
    println!("Next address: {}", branch.address(0)?.address);
    println!("Transactions: {}", transactions.len());
    for tx in &transactions {
        println!("  {}", history_line(tx));
    }
    Ok(())
}

fn history_line(tx: &Transaction) -> String {
    let when = tx
        .timestamp
        .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "unconfirmed     ".to_string());
    let (kind, impact) = match tx.analysis {
        Some(a) => {
            let kind = match a.kind {
                TxKind::Sent => "sent",
                TxKind::SelfTransfer => "self",
                TxKind::Received => "recv",
            };
            let sign = if a.impact < 0 { "-" } else { "+" };
            (kind, format!("{sign}{}", format_amount(a.impact.unsigned_abs())))
        }
        None => ("?", String::new()),
    };
    let balance = tx
        .balance
        .map(|b| format_amount(b.max(0) as u64))
        .unwrap_or_default();
    format!("{when}  {kind:<4}  {impact:>16}  {balance:>16}  {}", tx.hash)
}

fn coin_policy<'a>(config: &'a WalletConfig, coin: &str) -> Result<&'a CoinPolicy> {
    config
        .coin(coin)
        .with_context(|| format!("Unknown coin {coin}"))
}

fn backend(config: &WalletConfig, coin: &str) -> Result<BackendSync> {
    let backend_config = coin_policy(config, coin)?.backend.clone();
    let api = HttpBackend::new(backend_config.clone()).context("Failed to build HTTP client")?;
    Ok(BackendSync::new(coin, Arc::new(api), backend_config))
}

fn default_config_path() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("trove").join("config.toml"))
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output. Any other value
/// defaults to human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true).with_writer(std::io::stderr))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use trove_core::types::TxOutput;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn address_versions_come_from_config() {
        let mut config = WalletConfig::default();
        assert_eq!(coin_policy(&config, "Bitcoin").unwrap().address_version, 0);
        assert_eq!(coin_policy(&config, "Testnet").unwrap().address_version, 111);
        assert!(coin_policy(&config, "Dogecoin").is_err());

        config.coins[0].address_version = 48;
        assert_eq!(coin_policy(&config, "Bitcoin").unwrap().address_version, 48);
    }

    fn received(hash: &str, value: u64, timestamp: i64) -> Transaction {
        Transaction {
            hash: hash.into(),
            version: 1,
            lock_time: 0,
            timestamp: Some(timestamp),
            block: None,
            inputs: Vec::new(),
            outputs: vec![TxOutput {
                script: Vec::new(),
                value,
                index: 0,
                path: Some(vec![0, 3]),
            }],
            analysis: None,
            balance: None,
        }
    }

    #[test]
    fn analysed_history_lines_show_kind_and_balance() {
        let history = build_history([vec![
            received("aa", 25_000, 1_400_000_000),
            received("bb", 5_000, 1_400_000_600),
        ]]);
        assert_eq!(history[0].hash, "bb");
        let newest = history_line(&history[0]);
        assert!(newest.contains("recv"), "{newest}");
        assert!(newest.contains("+0.00005"), "{newest}");
        assert!(newest.contains("0.0003 "), "{newest}");
        let oldest = history_line(&history[1]);
        assert!(oldest.starts_with("2014-05-13"), "{oldest}");
        assert!(oldest.contains("0.00025"), "{oldest}");
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "trove-cli",
            "derive",
            "xpub",
            "--count",
            "3",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, "json");
        match cli.command {
            Commands::Derive(args) => assert_eq!(args.count, 3),
            _ => panic!("expected derive"),
        }
    }

    #[test]
    fn unconfirmed_history_line() {
        let tx = Transaction {
            hash: "ab".into(),
            version: 1,
            lock_time: 0,
            timestamp: None,
            block: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            analysis: None,
            balance: None,
        };
        assert!(history_line(&tx).starts_with("unconfirmed"));
        assert!(history_line(&tx).ends_with("ab"));
    }
}
