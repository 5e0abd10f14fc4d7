//! gridbroker — multi-tenant spot grid-trading engine.
//!
//! Architecture:
//!   per-user venue session (signed REST + user-data stream, proxy-bound)
//!     ──push──→ fill ingestor ──route──→ per-bot controller task
//!   reconciliation sweeps (startup / tick / manual) pull what push missed.
//!
//! Each bot is owned by exactly one controller task; everything that
//! mutates a bot travels through its command channel. The persistence
//! store keeps whole-bot documents plus rebuildable performance
//! projections and the credential audit trail.

pub mod config;
pub mod engine;
pub mod error;
pub mod store;
pub mod venue;

pub use config::EngineSettings;
pub use engine::{BotConfig, BotId, BotRecord, BotState, CreateBotRequest, GridEngine};
pub use error::{EngineError, StoreError, VenueError};
pub use store::{MemoryStore, SqliteStore, Store};
pub use venue::{
    ClockHandle, EnvVault, ExchangeGateway, GatewayFactory, LiveGatewayFactory, ProxyPool,
    ProxyPoolConfig, SecretVault,
};
