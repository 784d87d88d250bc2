mod admin;
mod config;
mod error;
mod exchange;
mod forward;
mod pool;
mod proxy;
mod stats;
mod stream;
mod tunnel;

pub use admin::AdminRoute;
pub use config::{
    LimitsConfig, ListenConfig, PoolConfig, ProxyConfig, StatisticsConfig, TlsMitmConfig,
};
pub use error::ProxyError;
pub use exchange::{ExchangeContext, ExchangeOutcome, forward_exchange};
pub use forward::to_origin_form;
pub use pool::{
    ConnectionPool, PoolStats, PoolTarget, PooledConnection, Scheme, UpstreamStream,
    split_authority,
};
pub use proxy::Proxy;
pub use stats::{ConnectionGuard, ProxyStats, StatisticsReport, StatsSnapshot};
pub use stream::BufferedStream;
pub use tunnel::{CONNECT_ESTABLISHED, TunnelMode};
