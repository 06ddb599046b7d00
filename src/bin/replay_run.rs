//! Replay Runner CLI
//!
//! Replays JSON-lines bars (and optionally ticks) through a moving-average crossover
//! CTA strategy, one context per instrument, and prints the blotter fingerprint.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin replay_run -- \
//!   --bars data/bars_m1.jsonl \
//!   --period m1 \
//!   --fast 5 --slow 20 \
//!   --output outputs_bt --dump
//! ```
//!
//! Two runs over the same input print the same fingerprint.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tradeloom_backend::market::{Bar, BarPeriod, Tick};
use tradeloom_backend::replay::read_jsonl;
use tradeloom_backend::strategy::{cta_factory, ContextApi, CtaContext, CtaStrategy};
use tradeloom_backend::{BacktestPorter, CtaOptions};

#[derive(Parser, Debug)]
#[command(name = "replay_run")]
#[command(about = "Replay historical bars through a moving-average CTA strategy")]
struct Args {
    /// JSON-lines file of bars, ascending by time per instrument
    #[arg(long)]
    bars: PathBuf,

    /// Bar period of the file (m1, m5, d1, ...)
    #[arg(long, default_value = "m1")]
    period: String,

    /// Optional JSON-lines file of ticks
    #[arg(long)]
    ticks: Option<PathBuf>,

    /// Platform TOML config applied before feeding
    #[arg(long, env = "TRADELOOM_CONFIG")]
    config: Option<PathBuf>,

    /// Replay window start, YYYYMMDDHHMM
    #[arg(long)]
    begin: Option<u64>,

    /// Replay window end, YYYYMMDDHHMM
    #[arg(long)]
    end: Option<u64>,

    #[arg(long, default_value = "5")]
    fast: usize,

    #[arg(long, default_value = "20")]
    slow: usize,

    /// Position size of each entry
    #[arg(long, default_value = "1")]
    qty: f64,

    /// Slippage in price ticks
    #[arg(long, default_value = "0")]
    slippage: f64,

    #[arg(long, default_value = "outputs_bt")]
    output: String,

    /// Write blotter CSV files under --output
    #[arg(long, default_value = "false")]
    dump: bool,

    #[arg(long, env = "RUST_LOG")]
    log: Option<String>,
}

struct MaCross {
    code: String,
    period: BarPeriod,
    fast: usize,
    slow: usize,
    qty: f64,
}

fn mean(bars: &[Bar]) -> f64 {
    bars.iter().map(|b| b.close).sum::<f64>() / bars.len() as f64
}

impl CtaStrategy for MaCross {
    fn on_init(&mut self, ctx: &mut CtaContext) {
        // registers the main key that drives on_calc
        ctx.get_bars(&self.code, self.period, self.slow, true);
        ctx.register_index("ma", 0);
        ctx.register_index_line("ma", "fast", 0);
        ctx.register_index_line("ma", "slow", 0);
    }

    fn on_calc(&mut self, ctx: &mut CtaContext, _date: u32, _time: u32) {
        let bars = ctx.get_bars(&self.code, self.period, self.slow, true);
        if bars.len() < self.slow {
            return;
        }
        let fast = mean(&bars[bars.len() - self.fast..]);
        let slow = mean(&bars);
        ctx.set_index_value("ma", "fast", fast);
        ctx.set_index_value("ma", "slow", slow);

        let position = ctx.get_position(&self.code, false, "");
        if fast > slow && position <= 0.0 {
            ctx.enter_long(&self.code, self.qty, "ma_long", 0.0, 0.0);
        } else if fast < slow && position >= 0.0 {
            ctx.enter_short(&self.code, self.qty, "ma_short", 0.0, 0.0);
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.fast == 0 || args.fast >= args.slow {
        bail!("--fast must be positive and below --slow");
    }
    let period: BarPeriod = args
        .period
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))
        .context("parsing --period")?;

    let porter = BacktestPorter::new();
    porter.init_backtest(args.log.as_deref(), Some(&args.output));
    if let Some(config) = &args.config {
        if !porter.config_backtest(&config.to_string_lossy(), true) {
            bail!("config {} rejected", config.display());
        }
    }
    if let (Some(begin), Some(end)) = (args.begin, args.end) {
        if !porter.set_time_range(begin, end) {
            bail!("invalid replay window {} - {}", begin, end);
        }
    }

    let bars: Vec<Bar> = read_jsonl(&args.bars)?;
    let codes: BTreeSet<String> = bars.iter().map(|b| b.code.clone()).collect();
    let fed = porter.feed_raw_bars(&args.period, bars);
    if let Some(path) = &args.ticks {
        let ticks: Vec<Tick> = read_jsonl(path)?;
        porter.feed_raw_ticks(ticks);
    } else {
        porter.enable_tick(false);
    }

    let (fast, slow, qty) = (args.fast, args.slow, args.qty);
    porter.register_cta_callbacks(cta_factory(move |name: &str| MaCross {
        code: name.trim_start_matches("ma_").to_string(),
        period,
        fast,
        slow,
        qty,
    }));
    for code in &codes {
        let options = CtaOptions {
            slippage: args.slippage,
            ..CtaOptions::default()
        };
        let handle = porter.init_cta_mocker(&format!("ma_{}", code), options);
        if !handle.is_valid() {
            bail!("failed to create context for {}", code);
        }
    }

    if !porter.run_backtest(args.dump, false) {
        bail!("backtest did not start");
    }
    let report = porter.last_report().context("run produced no report")?;
    println!("instruments: {}", codes.len());
    println!("bars fed:    {}", fed);
    println!("events:      {}", report.events);
    if let Some(blotter) = porter.blotter() {
        for ctx in &blotter.contexts {
            let total = ctx.funds.last().map_or(0.0, |f| f.closed_profit + f.dynamic_profit - f.fees);
            println!("{:<24} trades {:>5}  pnl {:>12.4}", ctx.name, ctx.trades.len(), total);
        }
    }
    println!("fingerprint: {}", report.fingerprint);
    porter.release_backtest();
    Ok(())
}
