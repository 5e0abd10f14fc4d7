//! Grid engine core: per-bot state machines, fill ingestion, recovery,
//! performance projection, and the orchestrating registry.

pub mod bot;
pub mod grid;
pub mod ingestor;
pub mod messages;
pub mod oracle;
pub mod performance;
pub mod recovery;
pub mod registry;
pub mod types;

pub use bot::BotController;
pub use ingestor::{BotRoute, RouteTable};
pub use messages::{BotCommand, RecoveryOutcome};
pub use registry::{
    BotDiagnostics, BotSummary, CreateBotRequest, GridEngine, ParameterPreview, StopAllOutcome,
};
pub use types::{
    BotConfig, BotId, BotRecord, BotState, BotStatistics, DormantReason, DormantRung, GridOrder,
    OracleAdvice, PerformanceSnapshot, RecoveryEvent,
};
