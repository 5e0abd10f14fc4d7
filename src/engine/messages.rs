//! Control-plane messages for bot controller tasks.
//!
//! Every mutation of a bot flows through its single command channel: push
//! fills from the ingestor, reconciliation ticks, and user lifecycle
//! actions. The single consumer is what serializes placements per bot.

use tokio::sync::oneshot;

use crate::engine::types::BotState;
use crate::error::EngineError;
use crate::venue::types::OrderUpdate;

/// Counts reported by a recovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub restored: u32,
    pub cancelled: u32,
    pub skipped: u32,
}

/// Commands consumed by one bot controller task.
#[derive(Debug)]
pub enum BotCommand {
    /// Push event from the fill ingestor (or a reconciliation query).
    OrderUpdate(OrderUpdate),

    /// Periodic reconciliation tick. Ignored while paused.
    Reconcile,

    /// Manual or startup recovery sweep.
    Recover {
        reply: oneshot::Sender<Result<RecoveryOutcome, EngineError>>,
    },

    /// Stop placements and the tick, leave resting orders.
    Pause {
        reply: oneshot::Sender<Result<BotState, EngineError>>,
    },

    /// Re-activate a paused bot and restore coverage.
    Resume {
        reply: oneshot::Sender<Result<BotState, EngineError>>,
    },

    /// Cancel live orders best-effort and stop. The task exits afterwards.
    Stop {
        reply: oneshot::Sender<Result<BotState, EngineError>>,
    },

    /// Exit the task without touching bot state (process shutdown). Resting
    /// orders stay on the venue; the startup sweep reconciles them.
    Shutdown,
}
