//! Strategy contexts: the position ledger, the CTA/SEL/HFT context variants, their
//! callback traits and the handle-based registry that owns them.

pub mod callbacks;
pub mod chart;
pub mod context;
pub mod cta;
pub mod handle;
pub mod hft;
pub mod ledger;
pub mod registry;
pub mod sel;
pub mod userdata;


pub use callbacks::{
    cta_factory, hft_factory, sel_factory, CallbackRegistry, CtaFactory, CtaStrategy, HftFactory,
    HftStrategy, SelFactory, SelStrategy,
};
pub use context::{ContextApi, ContextCore, ContextEnv, ContextKind, Slippage, StepGate};
pub use cta::{CtaContext, CtaRunner};
pub use handle::{ContextHandle, HandleTable};
pub use hft::{HftContext, HftRunner, OrderFlag};
pub use ledger::{LedgerConfig, PositionDetail, PositionLedger, ProfitFlag};
pub use registry::{ContextCell, ContextEntry, ContextRegistry};
pub use sel::{ScheduleUnit, SelContext, SelRunner, SelSchedule};
pub use userdata::UserDataStore;
