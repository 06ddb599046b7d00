//! Strategy callback sets.
//!
//! Strategy logic is only ever invoked through these traits; there is no polling API.
//! Each context owns one callback instance and hands it `&mut` access to the context
//! for the duration of a callback. Every method has a no-op default so strategies
//! implement only what they use.

use crate::market::{Bar, BarPeriod, OrderDetail, OrderQueue, Price, Qty, Tick, Transaction};
use crate::strategy::cta::CtaContext;
use crate::strategy::hft::HftContext;
use crate::strategy::sel::SelContext;
use std::sync::Arc;

/// Callbacks of a bar-driven CTA strategy.
#[allow(unused_variables)]
pub trait CtaStrategy: Send {
    fn on_init(&mut self, ctx: &mut CtaContext) {}

    fn on_session_begin(&mut self, ctx: &mut CtaContext, tdate: u32) {}

    fn on_session_end(&mut self, ctx: &mut CtaContext, tdate: u32) {}

    fn on_tick(&mut self, ctx: &mut CtaContext, tick: &Tick) {}

    /// A bar of a subscribed (code, period) closed.
    fn on_bar(&mut self, ctx: &mut CtaContext, code: &str, period: BarPeriod, bar: &Bar) {}

    /// Main bar closed: the strategy's decision point.
    fn on_calc(&mut self, ctx: &mut CtaContext, date: u32, time: u32) {}

    /// A limit/stop condition set during the last calc fired.
    fn on_condition_triggered(
        &mut self,
        ctx: &mut CtaContext,
        code: &str,
        target: Qty,
        price: Price,
        tag: &str,
    ) {
    }

    fn on_backtest_end(&mut self, ctx: &mut CtaContext) {}
}

/// Callbacks of a scheduled portfolio-selection strategy.
#[allow(unused_variables)]
pub trait SelStrategy: Send {
    fn on_init(&mut self, ctx: &mut SelContext) {}

    fn on_session_begin(&mut self, ctx: &mut SelContext, tdate: u32) {}

    fn on_session_end(&mut self, ctx: &mut SelContext, tdate: u32) {}

    fn on_tick(&mut self, ctx: &mut SelContext, tick: &Tick) {}

    fn on_bar(&mut self, ctx: &mut SelContext, code: &str, period: BarPeriod, bar: &Bar) {}

    /// Schedule fired.
    fn on_calc(&mut self, ctx: &mut SelContext, date: u32, time: u32) {}

    fn on_backtest_end(&mut self, ctx: &mut SelContext) {}
}

/// Callbacks of an order-level HFT strategy.
#[allow(unused_variables)]
pub trait HftStrategy: Send {
    fn on_init(&mut self, ctx: &mut HftContext) {}

    fn on_session_begin(&mut self, ctx: &mut HftContext, tdate: u32) {}

    fn on_session_end(&mut self, ctx: &mut HftContext, tdate: u32) {}

    fn on_tick(&mut self, ctx: &mut HftContext, tick: &Tick) {}

    fn on_bar(&mut self, ctx: &mut HftContext, code: &str, period: BarPeriod, bar: &Bar) {}

    /// Trading channel is usable.
    fn on_channel_ready(&mut self, ctx: &mut HftContext) {}

    fn on_channel_lost(&mut self, ctx: &mut HftContext) {}

    /// Order accepted (`success`) or refused on entry.
    fn on_entrust(
        &mut self,
        ctx: &mut HftContext,
        local_id: u32,
        code: &str,
        success: bool,
        message: &str,
        tag: &str,
    ) {
    }

    /// Order state changed.
    #[allow(clippy::too_many_arguments)]
    fn on_order(
        &mut self,
        ctx: &mut HftContext,
        local_id: u32,
        code: &str,
        is_buy: bool,
        total: Qty,
        left: Qty,
        price: Price,
        canceled: bool,
        tag: &str,
    ) {
    }

    #[allow(clippy::too_many_arguments)]
    fn on_trade(
        &mut self,
        ctx: &mut HftContext,
        local_id: u32,
        code: &str,
        is_buy: bool,
        qty: Qty,
        price: Price,
        tag: &str,
    ) {
    }

    fn on_order_queue(&mut self, ctx: &mut HftContext, queue: &OrderQueue) {}

    fn on_order_detail(&mut self, ctx: &mut HftContext, detail: &OrderDetail) {}

    fn on_transaction(&mut self, ctx: &mut HftContext, trans: &Transaction) {}

    fn on_backtest_end(&mut self, ctx: &mut HftContext) {}
}

/// Builds one callback instance per context, keyed by context name.
pub type CtaFactory = Arc<dyn Fn(&str) -> Box<dyn CtaStrategy> + Send + Sync>;
pub type SelFactory = Arc<dyn Fn(&str) -> Box<dyn SelStrategy> + Send + Sync>;
pub type HftFactory = Arc<dyn Fn(&str) -> Box<dyn HftStrategy> + Send + Sync>;

/// Box a typed constructor as a [`CtaFactory`].
pub fn cta_factory<S, F>(make: F) -> CtaFactory
where
    S: CtaStrategy + 'static,
    F: Fn(&str) -> S + Send + Sync + 'static,
{
    Arc::new(move |name: &str| -> Box<dyn CtaStrategy> { Box::new(make(name)) })
}

pub fn sel_factory<S, F>(make: F) -> SelFactory
where
    S: SelStrategy + 'static,
    F: Fn(&str) -> S + Send + Sync + 'static,
{
    Arc::new(move |name: &str| -> Box<dyn SelStrategy> { Box::new(make(name)) })
}

pub fn hft_factory<S, F>(make: F) -> HftFactory
where
    S: HftStrategy + 'static,
    F: Fn(&str) -> S + Send + Sync + 'static,
{
    Arc::new(move |name: &str| -> Box<dyn HftStrategy> { Box::new(make(name)) })
}

/// Callback sets bound before contexts are created.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    pub cta: Option<CtaFactory>,
    pub sel: Option<SelFactory>,
    pub hft: Option<HftFactory>,
}
