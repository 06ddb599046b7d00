//! Live market data ingestion: connectors, parser adapters and the dispatcher.

pub mod adapter;
pub mod adapter_mgr;
pub mod connector;
pub mod dispatcher;

pub use adapter::{AdapterStats, ParserAdapter};
pub use adapter_mgr::ParserAdapterMgr;
pub use connector::{
    channel_feed, ChannelConnector, Connector, ConnectorRegistry, ConnectorSink,
    JsonlFileConnector, LogLevel,
};
pub use dispatcher::{
    DeliveryMode, Dispatcher, DispatcherStatsSnapshot, MarketSubscriber, PriceBoard,
    SubscriberId, TopicKind,
};
