//! Market data model: events, instrument codes and subscription filters.

pub mod code;
pub mod events;
pub mod filter;

pub use code::{raw_std_code, split_std_code};
pub use events::{
    Bar, BarPeriod, Direction, EventKind, MarketEvent, OrderDetail, OrderQueue, PeriodUnit, Price,
    Qty, Side, Tick, Transaction,
};
pub use filter::SubscriptionFilter;
