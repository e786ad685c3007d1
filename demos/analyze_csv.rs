//! Analyze trades from a CSV file and print the results as JSON
//!
//! Expected columns: exchange,symbol,price,quantity,side,timestamp
//! (side is buy/sell/unknown, timestamp is RFC 3339).
//!
//!     cargo run --example analyze_csv -- --trades trades.csv --preset scalping

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use orderflow_smc::{AnalysisRequest, Dashboard, EngineConfig, Trade};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preset {
    Default,
    Scalping,
    Swing,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// CSV file of trades
    #[arg(short, long)]
    trades: PathBuf,

    /// Engine config as JSON; missing fields take defaults
    #[arg(short, long, env = "SMC_CONFIG")]
    config: Option<PathBuf>,

    /// Preset used when no config file is given
    #[arg(short, long, value_enum, default_value = "default")]
    preset: Preset,

    /// Only analyze these symbols (comma-separated)
    #[arg(short, long)]
    symbols: Option<String>,

    /// Print the full analysis instead of the summary
    #[arg(long)]
    full: bool,
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    if let Some(path) = &args.config {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        return serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()));
    }
    Ok(match args.preset {
        Preset::Default => EngineConfig::default(),
        Preset::Scalping => EngineConfig::scalping(),
        Preset::Swing => EngineConfig::swing(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("orderflow_smc=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let wanted: Option<Vec<String>> = args
        .symbols
        .as_ref()
        .map(|s| s.split(',').map(|x| x.trim().to_string()).collect());

    let mut reader = csv::Reader::from_path(&args.trades)
        .with_context(|| format!("opening {}", args.trades.display()))?;
    let mut by_symbol: BTreeMap<String, Vec<Trade>> = BTreeMap::new();
    let mut skipped = 0usize;
    for row in reader.deserialize::<Trade>() {
        match row {
            Ok(trade) => {
                if wanted.as_ref().map_or(true, |w| w.contains(&trade.symbol)) {
                    by_symbol.entry(trade.symbol.clone()).or_default().push(trade);
                }
            }
            Err(e) => {
                skipped += 1;
                if skipped <= 5 {
                    warn!("Skipping row: {}", e);
                }
            }
        }
    }
    info!(
        "Loaded {} symbols from {} ({} rows skipped)",
        by_symbol.len(),
        args.trades.display(),
        skipped
    );

    let dashboard = Dashboard::new(config);
    let requests = by_symbol
        .into_iter()
        .map(|(symbol, trades)| AnalysisRequest {
            symbol,
            trades,
            snapshots: Vec::new(),
        })
        .collect();
    let analyses = dashboard.analyze_many(requests).await;

    for analysis in &analyses {
        if args.full {
            println!("{}", serde_json::to_string_pretty(analysis.as_ref())?);
            continue;
        }
        let summary = serde_json::json!({
            "symbol": analysis.symbol,
            "as_of": analysis.as_of,
            "trades": analysis.trade_count,
            "candles": analysis.candle_count,
            "price": analysis.current_price,
            "bias": analysis.bias(),
            "confluence": analysis.confluence(),
            "quality": analysis.quality(),
            "net_delta": analysis.order_flow.net_delta,
            "poc": analysis.volume_profile.poc_price,
            "order_blocks": analysis.order_blocks.len(),
            "fair_value_gaps": analysis.fair_value_gaps.len(),
            "breaks": analysis.structure.breaks.len(),
            "zones": analysis.liquidity_zones.len(),
            "signals": analysis.signals,
            "failures": analysis.failures,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Ok(())
}
