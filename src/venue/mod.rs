//! Venue access: signed REST, user-data stream, clock sync, proxy pool, and
//! the per-user gateway that ties them together.

pub mod clock;
pub mod gateway;
pub mod proxy;
pub mod rest;
pub mod stream;
pub mod types;

pub use clock::ClockHandle;
pub use gateway::{
    with_backoff, EnvVault, ExchangeGateway, GatewayFactory, LiveGateway, LiveGatewayFactory,
    MockGateway, SecretVault,
};
pub use proxy::{ProxyFault, ProxyPool, ProxyPoolConfig};
pub use rest::{RestClient, RestConfig};
pub use stream::{StreamConfig, UserStream};
pub use types::{
    AccountInfo, ApiCredentials, Balance, Kline, OrderAck, OrderStatus, OrderUpdate, Side,
    SymbolInfo, VenueOrder,
};
