//! Tradeloom live runner
//!
//! Loads the platform config, starts every configured parser adapter and attaches a
//! quote-logging CTA context until Ctrl-C.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::path::Path;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};
use tradeloom_backend::config::PlatformConfig;
use tradeloom_backend::ingest::ConnectorRegistry;
use tradeloom_backend::live::LiveRunner;
use tradeloom_backend::market::Tick;
use tradeloom_backend::strategy::{cta_factory, ContextApi, CtaContext, CtaStrategy, Slippage};
use tradeloom_backend::telemetry;

/// Logs every quote of the instruments listed in `TRADELOOM_WATCH`.
struct QuoteLogger {
    codes: Vec<String>,
    seen: u64,
}

impl CtaStrategy for QuoteLogger {
    fn on_init(&mut self, ctx: &mut CtaContext) {
        for code in &self.codes {
            ctx.sub_ticks(code);
        }
    }

    fn on_session_begin(&mut self, ctx: &mut CtaContext, tdate: u32) {
        ctx.log_text(2, &format!("session {} open, watching {}", tdate, self.codes.join(",")));
    }

    fn on_tick(&mut self, ctx: &mut CtaContext, tick: &Tick) {
        self.seen += 1;
        ctx.log_text(
            1,
            &format!("{} {} bid {} ask {}", tick.code, tick.price, tick.bid_price, tick.ask_price),
        );
    }

    fn on_session_end(&mut self, ctx: &mut CtaContext, tdate: u32) {
        ctx.log_text(2, &format!("session {} closed after {} quotes", tdate, self.seen));
    }
}

fn load_env() {
    let _ = dotenv();
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}

fn watch_list() -> Vec<String> {
    std::env::var("TRADELOOM_WATCH")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    let config = match std::env::var("TRADELOOM_CONFIG") {
        Ok(path) => PlatformConfig::load(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => PlatformConfig::from_env(),
    };

    let profile = config.logging.profile.as_deref();
    match &config.logging.file {
        Some(file) => {
            telemetry::init_logging_to_file(profile, Path::new(file))
                .with_context(|| format!("opening log file {}", file))?;
        }
        None => {
            telemetry::init_logging(profile);
        }
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        parsers = config.parsers.len(),
        delivery = ?config.live.delivery,
        "Tradeloom live runner starting"
    );

    let runner = LiveRunner::new(config, ConnectorRegistry::with_builtins());
    let codes = watch_list();
    if codes.is_empty() {
        warn!("TRADELOOM_WATCH is empty; no instrument will reach the logging context");
    }
    runner
        .add_cta(
            "quote_logger",
            cta_factory(move |_| QuoteLogger {
                codes: codes.clone(),
                seen: 0,
            }),
            Slippage::default(),
        )
        .context("creating logging context")?;
    let adapters = runner.start().context("starting live runner")?;
    if adapters == 0 {
        warn!("No parser adapter is running");
    }

    let mut clock = interval(Duration::from_millis(100));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = clock.tick() => runner.sync_clock(),
            res = &mut shutdown => {
                if let Err(e) = res {
                    warn!(error = %e, "Ctrl-C handler failed");
                }
                break;
            }
        }
    }

    info!("Shutdown requested");
    let stats = runner.dispatcher().stats();
    info!(
        dispatched = stats.dispatched,
        unrouted = stats.unrouted,
        "Dispatcher totals"
    );
    runner.shutdown();
    Ok(())
}
