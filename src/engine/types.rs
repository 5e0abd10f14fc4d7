//! Domain model for bots, grid orders, and their persisted records.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::venue::types::{OrderStatus, OrderUpdate, Side};

pub type BotId = Uuid;

/// Recovery history entries kept per bot.
pub const MAX_RECOVERY_HISTORY: usize = 50;

// ─────────────────────────────────────────────────────────
// Bot state & configuration
// ─────────────────────────────────────────────────────────

/// Bot lifecycle state. `Stopped` is terminal for trading but the record
/// and its history survive until an explicit delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotState {
    Active,
    Paused,
    Stopped,
    Error,
}

impl BotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotState::Active => "active",
            BotState::Paused => "paused",
            BotState::Stopped => "stopped",
            BotState::Error => "error",
        }
    }
}

impl std::str::FromStr for BotState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(BotState::Active),
            "paused" => Ok(BotState::Paused),
            "stopped" => Ok(BotState::Stopped),
            "error" => Ok(BotState::Error),
            other => Err(format!("unknown bot state: {other}")),
        }
    }
}

/// User-supplied grid configuration, validated once at creation. Oracle
/// proposals enter through the same validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Venue symbol, uppercase.
    pub symbol: String,
    pub upper_price: Decimal,
    pub lower_price: Decimal,
    pub grid_levels: u32,
    pub investment: Decimal,
    /// Percent profit target per rung, in (0, 50].
    pub profit_per_grid: Decimal,
    pub test_mode: bool,
    /// Whether a closed pair re-arms its rung with a fresh BUY.
    pub replenish_after_close: bool,
}

impl BotConfig {
    /// Range checks that need no symbol metadata.
    pub fn validate_ranges(&self) -> EngineResult<()> {
        if self.symbol.trim().is_empty() {
            return Err(EngineError::Validation("symbol is required".into()));
        }
        if self.lower_price <= Decimal::ZERO {
            return Err(EngineError::Validation("lower price must be positive".into()));
        }
        if self.upper_price <= self.lower_price {
            return Err(EngineError::Validation(
                "upper price must exceed lower price".into(),
            ));
        }
        if !(2..=100).contains(&self.grid_levels) {
            return Err(EngineError::Validation(
                "grid levels must be between 2 and 100".into(),
            ));
        }
        if self.investment <= Decimal::ZERO {
            return Err(EngineError::Validation("investment must be positive".into()));
        }
        if self.profit_per_grid <= Decimal::ZERO || self.profit_per_grid > Decimal::from(50) {
            return Err(EngineError::Validation(
                "profit per grid must be in (0, 50] percent".into(),
            ));
        }
        Ok(())
    }

    /// Distance between adjacent rungs.
    pub fn step_size(&self) -> Decimal {
        (self.upper_price - self.lower_price) / Decimal::from(self.grid_levels - 1)
    }

    /// Quote currency committed to each rung.
    pub fn per_rung_investment(&self) -> Decimal {
        self.investment / Decimal::from(self.grid_levels)
    }

    /// Price of rung `level` in [0, grid_levels).
    pub fn rung_price(&self, level: u32) -> Decimal {
        self.lower_price + self.step_size() * Decimal::from(level)
    }

    /// Multiplier applied to a BUY fill to get its paired SELL price.
    pub fn profit_multiplier(&self) -> Decimal {
        Decimal::ONE + self.profit_per_grid / Decimal::from(100)
    }
}

// ─────────────────────────────────────────────────────────
// Orders
// ─────────────────────────────────────────────────────────

/// A limit order owned by one bot. Pair links are ids, never references;
/// lookups go through the bot's owned collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridOrder {
    pub local_id: Uuid,
    /// Populated once the venue accepts the order.
    pub venue_order_id: Option<u64>,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Rung index in [0, grid_levels).
    pub grid_level: u32,
    pub status: OrderStatus,
    pub executed_qty: Decimal,
    pub executed_price: Option<Decimal>,
    pub commission: Decimal,
    pub commission_asset: Option<String>,
    /// For a SELL: the BUY it closes. For a replenish BUY: the SELL that
    /// freed the rung.
    pub pair_parent: Option<Uuid>,
    /// Set on a filled BUY once its counter SELL is live.
    pub has_corresponding_sell: bool,
    /// Placed by the recovery service rather than the fill path.
    pub is_recovery_order: bool,
    /// Venue event time of the fill, ms.
    pub filled_at: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GridOrder {
    pub fn new(side: Side, price: Decimal, quantity: Decimal, grid_level: u32) -> Self {
        let now = Utc::now();
        Self {
            local_id: Uuid::new_v4(),
            venue_order_id: None,
            side,
            price,
            quantity,
            grid_level,
            status: OrderStatus::New,
            executed_qty: Decimal::ZERO,
            executed_price: None,
            commission: Decimal::ZERO,
            commission_asset: None,
            pair_parent: None,
            has_corresponding_sell: false,
            is_recovery_order: false,
            filled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    /// Apply a venue update, enforcing monotonicity: a terminal order never
    /// changes again and `executed_qty` never decreases. Returns whether
    /// anything changed.
    pub fn apply_update(&mut self, update: &OrderUpdate) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if update.executed_qty < self.executed_qty {
            // Stale or reordered event; the cumulative quantity is the tell.
            return false;
        }
        let mut changed = false;
        if update.executed_qty > self.executed_qty {
            self.executed_qty = update.executed_qty;
            self.executed_price = Some(update.executed_price());
            changed = true;
        }
        if update.commission > Decimal::ZERO {
            self.commission += update.commission;
            if self.commission_asset.is_none() {
                self.commission_asset = update.commission_asset.clone();
            }
            changed = true;
        }
        if update.status != self.status {
            self.status = update.status;
            changed = true;
        }
        if changed {
            if self.status == OrderStatus::Filled && self.filled_at.is_none() {
                self.filled_at = Some(update.event_time);
            }
            self.updated_at = Utc::now();
        }
        changed
    }
}

// ─────────────────────────────────────────────────────────
// Aggregates & history
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotStatistics {
    pub total_profit: Decimal,
    pub total_trades: u64,
}

/// A rung intentionally left without a live order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DormantRung {
    pub level: u32,
    pub reason: DormantReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DormantReason {
    /// No base inventory to quote a SELL and no armed BUY placed.
    AwaitingInventory,
    /// Paired SELL could not be placed yet (quantity under venue minimum).
    PendingPair,
    /// Quote balance could not cover a replenishing BUY.
    AwaitingBalance,
    /// Price has left the configured range.
    OutOfRange,
    /// Replenishment disabled by configuration; recovery sweeps leave the
    /// rung alone.
    PolicyHold,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub at: DateTime<Utc>,
    pub restored: u32,
    pub cancelled: u32,
    pub skipped: u32,
    pub note: String,
}

/// Oracle output, kept with the bot that adopted it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleAdvice {
    pub upper_price: Decimal,
    pub lower_price: Decimal,
    pub grid_levels: u32,
    pub profit_per_grid: Decimal,
    pub reasoning: String,
}

// ─────────────────────────────────────────────────────────
// Persisted bot record
// ─────────────────────────────────────────────────────────

/// The durable document for one bot: config, live + historical orders,
/// running statistics and recovery history, all updated together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotRecord {
    pub id: BotId,
    pub owner: String,
    pub state: BotState,
    pub config: BotConfig,
    pub orders: Vec<GridOrder>,
    pub stats: BotStatistics,
    pub dormant: Vec<DormantRung>,
    pub recovery_history: Vec<RecoveryEvent>,
    pub oracle_snapshot: Option<OracleAdvice>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BotRecord {
    pub fn new(owner: &str, config: BotConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            state: BotState::Active,
            config,
            orders: Vec::new(),
            stats: BotStatistics::default(),
            dormant: Vec::new(),
            recovery_history: Vec::new(),
            oracle_snapshot: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn order_by_venue_id(&self, venue_order_id: u64) -> Option<&GridOrder> {
        self.orders
            .iter()
            .find(|o| o.venue_order_id == Some(venue_order_id))
    }

    pub fn order_by_venue_id_mut(&mut self, venue_order_id: u64) -> Option<&mut GridOrder> {
        self.orders
            .iter_mut()
            .find(|o| o.venue_order_id == Some(venue_order_id))
    }

    pub fn order_by_local_id(&self, local_id: Uuid) -> Option<&GridOrder> {
        self.orders.iter().find(|o| o.local_id == local_id)
    }

    pub fn live_orders(&self) -> impl Iterator<Item = &GridOrder> {
        self.orders.iter().filter(|o| o.is_live())
    }

    /// Whether a live order already occupies `(level, side)`.
    pub fn occupies(&self, level: u32, side: Side) -> bool {
        self.live_orders()
            .any(|o| o.grid_level == level && o.side == side)
    }

    pub fn mark_dormant(&mut self, level: u32, reason: DormantReason) {
        self.dormant.retain(|d| d.level != level);
        self.dormant.push(DormantRung { level, reason });
    }

    pub fn clear_dormant(&mut self, level: u32) {
        self.dormant.retain(|d| d.level != level);
    }

    /// Append to the bounded recovery history.
    pub fn push_recovery_event(&mut self, event: RecoveryEvent) {
        self.recovery_history.push(event);
        if self.recovery_history.len() > MAX_RECOVERY_HISTORY {
            let excess = self.recovery_history.len() - MAX_RECOVERY_HISTORY;
            self.recovery_history.drain(..excess);
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ─────────────────────────────────────────────────────────
// Performance projection record
// ─────────────────────────────────────────────────────────

/// Derived, rebuildable projection over the bot's order history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub bot_id: BotId,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_trades: u64,
    /// Fraction of closed pairs with positive net PnL, in [0, 1].
    pub win_rate: f64,
    pub best_trade: Option<Decimal>,
    pub worst_trade: Option<Decimal>,
    /// Realized PnL bucketed by UTC day (YYYY-MM-DD).
    pub profit_per_day: Vec<(String, Decimal)>,
    /// Realized PnL bucketed by rung.
    pub profit_per_level: Vec<(u32, Decimal)>,
    /// Unpaired filled SELLs surfaced as a diagnostic.
    pub unpaired_sells: u64,
    pub computed_at: DateTime<Utc>,
}

impl Default for PerformanceSnapshot {
    fn default() -> Self {
        Self {
            bot_id: Uuid::nil(),
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            total_trades: 0,
            win_rate: 0.0,
            best_trade: None,
            worst_trade: None,
            profit_per_day: Vec::new(),
            profit_per_level: Vec::new(),
            unpaired_sells: 0,
            computed_at: Utc::now(),
        }
    }
}
