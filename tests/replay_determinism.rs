//! End-to-end backtest runs through the porter surface.
//!
//! - repeated runs over identical input produce identical blotters
//! - feed order across instruments does not change the merged stream
//! - adjustment factors rescale prices dated before their effective date
//! - hooked contexts only calc when stepped
//! - an open time range replays history dated before the epoch
//! - user data survives into the next porter over the same output directory

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tradeloom_backend::market::{Bar, BarPeriod, Tick};
use tradeloom_backend::replay::clock::{ymdhm_to_nanos, Nanos, NANOS_PER_MIN};
use tradeloom_backend::strategy::{cta_factory, ContextApi, ContextHandle, CtaContext, CtaStrategy};
use tradeloom_backend::{BacktestPorter, CtaOptions};

const CODES: [&str; 3] = ["SHFE.rb2405", "SHFE.hc2405", "DCE.i2405"];

fn base() -> Nanos {
    ymdhm_to_nanos(202401020901).unwrap()
}

fn random_bars(rng: &mut ChaCha8Rng, code: &str, days: i64) -> Vec<Bar> {
    let mut price = 3500.0;
    let mut bars = Vec::new();
    for day in 0..days {
        for minute in 0..30 {
            price += rng.gen_range(-5.0..5.0_f64).round();
            let spread = rng.gen_range(0.0..3.0_f64).round();
            bars.push(Bar {
                code: code.to_string(),
                time: base() + day * 24 * 60 * NANOS_PER_MIN + minute * NANOS_PER_MIN,
                open: price,
                high: price + spread,
                low: price - spread,
                close: price,
                volume: rng.gen_range(1.0..100.0_f64).round(),
                turnover: 0.0,
                open_interest: 0.0,
            });
        }
    }
    bars
}

/// Trades every instrument on a short/long crossover with tagged entries and
/// condition exits.
struct Crossover {
    main: String,
}

impl CtaStrategy for Crossover {
    fn on_init(&mut self, ctx: &mut CtaContext) {
        ctx.get_bars(&self.main, BarPeriod::M1, 10, true);
        for code in CODES {
            ctx.sub_bar_events(code, BarPeriod::M1);
        }
    }

    fn on_calc(&mut self, ctx: &mut CtaContext, _date: u32, _time: u32) {
        for code in CODES {
            let bars = ctx.get_bars(code, BarPeriod::M1, 10, false);
            if bars.len() < 10 {
                continue;
            }
            let slow = bars.iter().map(|b| b.close).sum::<f64>() / 10.0;
            let fast = bars[7..].iter().map(|b| b.close).sum::<f64>() / 3.0;
            let last = bars[9].close;
            let position = ctx.get_position(code, false, "");
            if fast > slow && position <= 0.0 {
                ctx.enter_long(code, 2.0, "up", 0.0, 0.0);
            } else if fast < slow && position >= 0.0 {
                ctx.enter_short(code, 1.0, "down", 0.0, 0.0);
            } else if position > 0.0 {
                ctx.exit_long(code, 1.0, "up", 0.0, last - 4.0);
            }
        }
    }
}

fn run_crossover(feed_order: &[&str], seed: u64) -> String {
    let dir = tempfile::tempdir().unwrap();
    let porter = BacktestPorter::new();
    porter.init_backtest(None, Some(&dir.path().to_string_lossy()));

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut per_code: Vec<(String, Vec<Bar>)> = CODES
        .iter()
        .map(|c| (c.to_string(), random_bars(&mut rng, c, 3)))
        .collect();
    per_code.sort_by_key(|(c, _)| feed_order.iter().position(|o| *o == c.as_str()));
    for (_, bars) in per_code {
        assert_eq!(porter.feed_raw_bars("m1", bars), 90);
    }

    porter.register_cta_callbacks(cta_factory(|_| Crossover {
        main: CODES[0].to_string(),
    }));
    let handle = porter.init_cta_mocker("xover", CtaOptions {
        slippage: 1.0,
        ..CtaOptions::default()
    });
    assert!(handle.is_valid());
    assert!(porter.run_backtest(false, false));
    let report = porter.last_report().unwrap();
    assert_eq!(report.events, 270);
    porter.release_backtest();
    report.fingerprint
}

#[test]
fn test_identical_input_identical_fingerprint() {
    let first = run_crossover(&CODES, 7);
    let second = run_crossover(&CODES, 7);
    assert_eq!(first, second);
    assert_ne!(first, run_crossover(&CODES, 8));
}

#[test]
fn test_feed_order_does_not_matter() {
    let forward = run_crossover(&CODES, 11);
    let reversed = run_crossover(&[CODES[2], CODES[1], CODES[0]], 11);
    assert_eq!(forward, reversed);
}

#[test]
fn test_rerun_on_same_porter_is_identical() {
    let porter = BacktestPorter::new();
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    for code in CODES {
        porter.feed_raw_bars("m1", random_bars(&mut rng, code, 2));
    }
    porter.register_cta_callbacks(cta_factory(|_| Crossover {
        main: CODES[0].to_string(),
    }));
    porter.init_cta_mocker("xover", CtaOptions::default());

    assert!(porter.run_backtest(false, false));
    let first = porter.last_report().unwrap();
    assert!(porter.run_backtest(false, true));
    porter.wait_backtest();
    let second = porter.last_report().unwrap();
    assert_eq!(first, second);
    assert!(!porter.blotter().unwrap().contexts[0].trades.is_empty());
}

// -----------------------------------------------------------------------------
// Adjustment factors
// -----------------------------------------------------------------------------

struct CloseLog(Arc<Mutex<Vec<(u32, f64)>>>);

impl CtaStrategy for CloseLog {
    fn on_init(&mut self, ctx: &mut CtaContext) {
        ctx.sub_bar_events("SSE.600000", BarPeriod::M1);
    }

    fn on_bar(&mut self, ctx: &mut CtaContext, _code: &str, _period: BarPeriod, bar: &Bar) {
        self.0.lock().push((ctx.get_date(), bar.close));
    }
}

fn adjusted_closes(auto_transform: bool) -> Vec<(u32, f64)> {
    let porter = BacktestPorter::new();
    let config = format!("[replay]\nauto_transform = {}\npersist_userdata = false\n", auto_transform);
    assert!(porter.config_backtest(&config, false));
    let bars = [202401080930u64, 202401091500, 202401100930, 202401110930]
        .iter()
        .map(|&t| Bar {
            code: "SSE.600000".into(),
            time: ymdhm_to_nanos(t).unwrap(),
            open: 20.0,
            high: 20.0,
            low: 20.0,
            close: 20.0,
            volume: 1.0,
            turnover: 0.0,
            open_interest: 0.0,
        })
        .collect();
    porter.feed_raw_bars("m1", bars);
    assert!(porter.feed_adj_factors("SSE.600000", &[20240110], &[2.0]));

    let closes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&closes);
    porter.register_cta_callbacks(cta_factory(move |_| CloseLog(Arc::clone(&sink))));
    porter.init_cta_mocker("adj", CtaOptions::default());
    assert!(porter.run_backtest(false, false));
    let out = closes.lock().clone();
    out
}

#[test]
fn test_split_halves_bars_before_effective_date() {
    assert_eq!(
        adjusted_closes(true),
        vec![
            (20240108, 10.0),
            (20240109, 10.0),
            (20240110, 20.0),
            (20240111, 20.0)
        ]
    );
    assert!(adjusted_closes(false).iter().all(|&(_, c)| c == 20.0));
}

#[test]
fn test_mismatched_factor_lengths_rejected() {
    let porter = BacktestPorter::new();
    assert!(!porter.feed_adj_factors("SSE.600000", &[20240110, 20240111], &[2.0]));
}

// -----------------------------------------------------------------------------
// Hooks and user data
// -----------------------------------------------------------------------------

struct Counter(Arc<Mutex<u32>>);

impl CtaStrategy for Counter {
    fn on_init(&mut self, ctx: &mut CtaContext) {
        ctx.get_bars("A.1", BarPeriod::M1, 1, true);
        let runs: u32 = ctx.load_userdata("runs", "0").parse().unwrap_or(0);
        ctx.save_userdata("runs", &(runs + 1).to_string());
    }

    fn on_calc(&mut self, _ctx: &mut CtaContext, _date: u32, _time: u32) {
        *self.0.lock() += 1;
    }
}

fn five_bars() -> Vec<Bar> {
    (0..5)
        .map(|i| Bar {
            code: "A.1".into(),
            time: base() + i * NANOS_PER_MIN,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            turnover: 0.0,
            open_interest: 0.0,
        })
        .collect()
}

#[test]
fn test_hooked_context_steps_one_calc_at_a_time() {
    let porter = BacktestPorter::new();
    let calcs = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&calcs);
    porter.register_cta_callbacks(cta_factory(move |_| Counter(Arc::clone(&sink))));
    porter.feed_raw_bars("m1", five_bars());
    let handle = porter.init_cta_mocker("hooked", CtaOptions {
        hook: true,
        ..CtaOptions::default()
    });
    assert!(porter.run_backtest(false, true));

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(*calcs.lock(), 0);
    assert!(porter.cta_step(handle));
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while *calcs.lock() < 1 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(*calcs.lock(), 1);
    // creating contexts is refused mid-run
    assert_eq!(
        porter.init_cta_mocker("late", CtaOptions::default()),
        ContextHandle::INVALID
    );

    assert!(porter.stop_backtest());
    porter.wait_backtest();
    assert!(porter.last_report().unwrap().stopped);
    assert_eq!(*calcs.lock(), 1);
}

struct Dates(Arc<Mutex<Vec<u32>>>);

impl CtaStrategy for Dates {
    fn on_init(&mut self, ctx: &mut CtaContext) {
        ctx.get_bars("A.1", BarPeriod::M1, 1, true);
    }

    fn on_calc(&mut self, _ctx: &mut CtaContext, date: u32, _time: u32) {
        self.0.lock().push(date);
    }
}

#[test]
fn test_open_range_replays_pre_epoch_history() {
    let start = ymdhm_to_nanos(196912312350).unwrap();
    let bars: Vec<Bar> = five_bars()
        .into_iter()
        .enumerate()
        .map(|(i, bar)| Bar {
            time: start + i as i64 * NANOS_PER_MIN,
            ..bar
        })
        .collect();
    let porter = BacktestPorter::new();
    let dates = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&dates);
    porter.register_cta_callbacks(cta_factory(move |_| Dates(Arc::clone(&sink))));
    porter.feed_raw_bars("m1", bars);
    porter.init_cta_mocker("old", CtaOptions::default());

    assert!(porter.run_backtest(false, false));
    assert_eq!(*dates.lock(), vec![19691231; 5]);
    // a second run rewinds to the same first event
    assert!(porter.run_backtest(false, false));
    assert_eq!(dates.lock().len(), 10);
}

#[test]
fn test_user_data_persists_across_porters() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().to_string_lossy().to_string();
    let config = format!("[replay]\noutput_dir = {:?}\npersist_userdata = true\n", output);

    for expected in ["1", "2"] {
        let porter = BacktestPorter::new();
        assert!(porter.config_backtest(&config, false));
        porter.register_cta_callbacks(cta_factory(|_| Counter(Arc::default())));
        porter.feed_raw_bars("m1", five_bars());
        let handle = porter.init_cta_mocker("keeper", CtaOptions {
            persist_data: true,
            ..CtaOptions::default()
        });
        assert!(porter.run_backtest(false, false));
        assert_eq!(porter.load_userdata(handle, "runs", ""), expected);
        porter.release_backtest();
    }
    assert!(dir.path().join("keeper").join("ud_keeper.json").exists());
}

#[test]
fn test_tick_queries_through_porter() {
    let porter = BacktestPorter::new();
    porter.register_cta_callbacks(cta_factory(|_| {
        struct Sub;
        impl CtaStrategy for Sub {
            fn on_init(&mut self, ctx: &mut CtaContext) {
                ctx.sub_ticks("A.1");
            }
        }
        Sub
    }));
    let ticks = (0..4)
        .map(|i| Tick {
            code: "A.1".into(),
            time: base() + i,
            price: 10.0 + i as f64,
            ..Default::default()
        })
        .collect();
    assert_eq!(porter.feed_raw_ticks(ticks), 4);
    let handle = porter.init_cta_mocker("ticks", CtaOptions::default());
    assert!(porter.run_backtest(false, false));

    assert_eq!(porter.get_price(handle, "A.1"), 13.0);
    let last_two: Vec<f64> = porter
        .get_ticks(handle, "A.1", 2)
        .iter()
        .map(|t| t.price)
        .collect();
    assert_eq!(last_two, vec![12.0, 13.0]);
    assert_eq!(porter.get_date(handle), 20240102);
    assert_eq!(porter.get_time(handle), 901);
}
