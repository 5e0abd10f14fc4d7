//! Bot controller: the per-bot grid state machine and order lifecycle.
//!
//! One controller task owns each bot. Everything that mutates the bot
//! (fills, reconciliation, lifecycle commands) arrives on its command
//! channel, so placements are strictly sequential per bot while bots run
//! concurrently.
//!
//! CRITICAL: placement acks never drive fills. The order is recorded as NEW
//! once the venue accepts it; only the fill pipeline (push stream or a
//! reconciliation query) transitions it and triggers the paired order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::grid::{
    self, build_coverage_plan, paired_sell_price, paired_sell_qty, replenish_buy_price,
    required_balances, validate_config, RungAction,
};
use crate::engine::ingestor::{BotRoute, RouteTable};
use crate::engine::messages::BotCommand;
use crate::engine::performance;
use crate::engine::recovery;
use crate::engine::types::{
    BotConfig, BotRecord, BotState, DormantReason, GridOrder, OracleAdvice,
};
use crate::error::{EngineError, EngineResult, VenueError};
use crate::store::Store;
use crate::venue::gateway::{with_backoff, ExchangeGateway};
use crate::venue::types::{OrderUpdate, Side, SymbolInfo};

/// Command channel depth per bot. Overflow degrades to a pull sweep.
pub const BOT_INBOX: usize = 64;

/// Placement retries before a transient failure is deferred to the tick.
const PLACE_ATTEMPTS: u32 = 3;
const PLACE_BACKOFF: Duration = Duration::from_millis(250);

/// Quote headroom reserved for fees on top of the committed investment,
/// as a fraction (0.2%).
fn safety_fee(quote_required: Decimal) -> Decimal {
    quote_required * Decimal::new(2, 3)
}

pub struct BotController {
    pub(crate) bot: BotRecord,
    pub(crate) info: SymbolInfo,
    pub(crate) gateway: Arc<dyn ExchangeGateway>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) routes: RouteTable,
    cmd_tx: mpsc::Sender<BotCommand>,
    cmd_rx: mpsc::Receiver<BotCommand>,
    pub(crate) sweep_hint: Arc<AtomicBool>,
}

impl std::fmt::Debug for BotController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotController")
            .field("bot", &self.bot)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl BotController {
    // ─────────────────────────────────────────────────────────
    // Creation
    // ─────────────────────────────────────────────────────────

    /// Pre-flight validation, initial coverage placement, and persistence.
    /// On the first unrecoverable placement failure everything placed so
    /// far is cancelled and the record deleted.
    pub async fn create(
        owner: &str,
        mut config: BotConfig,
        oracle_snapshot: Option<OracleAdvice>,
        gateway: Arc<dyn ExchangeGateway>,
        store: Arc<dyn Store>,
        routes: RouteTable,
    ) -> EngineResult<Self> {
        config.symbol = config.symbol.trim().to_ascii_uppercase();

        let info = match gateway.symbol_info(&config.symbol).await {
            Err(VenueError::SymbolUnknown(s)) => return Err(EngineError::SymbolUnknown(s)),
            other => other?,
        };
        validate_config(&config, &info)?;

        let price = gateway.price(&config.symbol).await?;
        if price < config.lower_price || price > config.upper_price {
            return Err(EngineError::PriceRange {
                price,
                lower: config.lower_price,
                upper: config.upper_price,
            });
        }

        let account = gateway.account_info().await?;
        if !account.can_trade {
            return Err(EngineError::Venue(VenueError::Fatal(
                "account cannot trade".into(),
            )));
        }
        let free_base = account.free(&info.base_asset);
        let plan = build_coverage_plan(&config, &info, price, free_base);

        let (quote_required, base_required) = required_balances(&plan);
        let quote_free = account.free(&info.quote_asset);
        let needed = quote_required + safety_fee(quote_required);
        if quote_free < needed {
            return Err(EngineError::InsufficientBalance {
                asset: info.quote_asset.clone(),
                required: needed,
                free: quote_free,
            });
        }
        if free_base < base_required {
            return Err(EngineError::InsufficientBalance {
                asset: info.base_asset.clone(),
                required: base_required,
                free: free_base,
            });
        }

        let mut bot = BotRecord::new(owner, config);
        bot.oracle_snapshot = oracle_snapshot;
        store.insert_bot(&bot).await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(BOT_INBOX);
        let mut ctrl = Self {
            bot,
            info,
            gateway,
            store,
            routes,
            cmd_tx,
            cmd_rx,
            sweep_hint: Arc::new(AtomicBool::new(false)),
        };

        for rung in &plan {
            match &rung.action {
                RungAction::Order {
                    side,
                    price,
                    quantity,
                } => {
                    let order = GridOrder::new(*side, *price, *quantity, rung.level);
                    if let Err(e) = ctrl.place_order(order).await {
                        warn!(
                            "🤖 bot {} initial placement failed at rung {} ({e}); rolling back",
                            ctrl.bot.id, rung.level
                        );
                        ctrl.rollback_creation().await;
                        return Err(e);
                    }
                }
                RungAction::Dormant(reason) => {
                    ctrl.bot.mark_dormant(rung.level, *reason);
                }
            }
        }

        ctrl.bot.touch();
        ctrl.store.save_bot(&ctrl.bot).await?;
        info!(
            "🤖 bot {} created for {} on {}: {} orders, {} dormant rungs",
            ctrl.bot.id,
            ctrl.bot.owner,
            ctrl.bot.config.symbol,
            ctrl.bot.orders.len(),
            ctrl.bot.dormant.len()
        );
        Ok(ctrl)
    }

    async fn rollback_creation(&mut self) {
        for order in self.bot.orders.clone() {
            if let Some(venue_id) = order.venue_order_id {
                if let Err(e) = self.gateway.cancel(&self.bot.config.symbol, venue_id).await {
                    warn!("🤖 rollback cancel of {venue_id} failed: {e}");
                }
            }
        }
        self.routes.unregister_bot(self.bot.id);
        if let Err(e) = self.store.delete_bot(self.bot.id).await {
            warn!("🤖 rollback delete of bot {} failed: {e}", self.bot.id);
        }
    }

    /// Rehydrate a controller for a persisted bot (startup recovery path).
    pub async fn resume_from_store(
        bot: BotRecord,
        gateway: Arc<dyn ExchangeGateway>,
        store: Arc<dyn Store>,
        routes: RouteTable,
    ) -> EngineResult<Self> {
        let info = gateway.symbol_info(&bot.config.symbol).await?;
        let (cmd_tx, cmd_rx) = mpsc::channel(BOT_INBOX);
        let ctrl = Self {
            bot,
            info,
            gateway,
            store,
            routes,
            cmd_tx,
            cmd_rx,
            sweep_hint: Arc::new(AtomicBool::new(false)),
        };
        // Re-register routes for surviving orders so push events find us.
        for order in ctrl.bot.orders.iter().filter(|o| o.is_live()) {
            if let Some(venue_id) = order.venue_order_id {
                ctrl.routes.register(&ctrl.bot.owner, venue_id, ctrl.route());
            }
        }
        Ok(ctrl)
    }

    pub fn command_sender(&self) -> mpsc::Sender<BotCommand> {
        self.cmd_tx.clone()
    }

    pub fn bot_id(&self) -> crate::engine::types::BotId {
        self.bot.id
    }

    pub(crate) fn route(&self) -> BotRoute {
        BotRoute {
            bot_id: self.bot.id,
            tx: self.cmd_tx.clone(),
            sweep_hint: self.sweep_hint.clone(),
        }
    }

    // ─────────────────────────────────────────────────────────
    // Run loop
    // ─────────────────────────────────────────────────────────

    pub async fn run(mut self) {
        info!(
            "🤖 bot {} task started ({}, {:?})",
            self.bot.id, self.bot.config.symbol, self.bot.state
        );
        while let Some(cmd) = self.cmd_rx.recv().await {
            let keep_going = self.handle_command(cmd).await;
            if !keep_going {
                break;
            }
            // Inbox overflowed while we were busy: pull what push dropped.
            if self.sweep_hint.swap(false, Ordering::AcqRel) && self.bot.state == BotState::Active {
                if let Err(e) = recovery::reconcile_bot(&mut self).await {
                    warn!("🤖 bot {} overflow sweep failed: {e}", self.bot.id);
                }
            }
        }
        info!("🤖 bot {} task stopped", self.bot.id);
    }

    /// Returns false when the task should exit.
    pub(crate) async fn handle_command(&mut self, cmd: BotCommand) -> bool {
        match cmd {
            BotCommand::OrderUpdate(update) => {
                if let Err(e) = self.apply_order_update(&update).await {
                    warn!("🤖 bot {} update failed: {e}", self.bot.id);
                }
                true
            }
            BotCommand::Reconcile => {
                if self.bot.state == BotState::Active {
                    if let Err(e) = recovery::reconcile_bot(self).await {
                        warn!("🤖 bot {} reconcile failed: {e}", self.bot.id);
                    }
                }
                true
            }
            BotCommand::Recover { reply } => {
                let result = recovery::reconcile_bot(self).await;
                let _ = reply.send(result);
                true
            }
            BotCommand::Pause { reply } => {
                let _ = reply.send(self.pause().await);
                true
            }
            BotCommand::Resume { reply } => {
                let result = self.resume().await;
                let _ = reply.send(result);
                true
            }
            BotCommand::Stop { reply } => {
                let _ = reply.send(self.stop().await);
                false
            }
            BotCommand::Shutdown => {
                if let Err(e) = self.persist_state_only().await {
                    warn!("🤖 bot {} shutdown persist failed: {e}", self.bot.id);
                }
                false
            }
        }
    }

    // ─────────────────────────────────────────────────────────
    // Fill pipeline (authoritative path)
    // ─────────────────────────────────────────────────────────

    /// Apply a venue update to the owning order; a transition into FILLED
    /// runs the fill handler. Safe to call twice with the same event: the
    /// monotonic order state makes the second application a no-op.
    pub(crate) async fn apply_order_update(&mut self, update: &OrderUpdate) -> EngineResult<()> {
        let Some(order) = self.bot.order_by_venue_id_mut(update.venue_order_id) else {
            // Not ours; the ingestor logs unknown orders before us.
            return Ok(());
        };
        let was_filled = order.is_filled();
        let changed = order.apply_update(update);
        if !changed {
            return Ok(());
        }
        let local_id = order.local_id;
        let newly_filled = !was_filled && order.is_filled();

        if newly_filled {
            self.on_order_filled(local_id).await?;
        }

        let mark = if update.last_price > Decimal::ZERO {
            update.last_price
        } else {
            update.executed_price()
        };
        self.persist(mark).await
    }

    async fn on_order_filled(&mut self, local_id: Uuid) -> EngineResult<()> {
        let Some(filled) = self.bot.order_by_local_id(local_id).cloned() else {
            return Err(EngineError::Internal("filled order vanished".into()));
        };
        let exec_price = filled.executed_price.unwrap_or(filled.price);
        info!(
            "🔔 bot {} {:?} filled: {}@{} rung {}",
            self.bot.id, filled.side, filled.executed_qty, exec_price, filled.grid_level
        );

        match filled.side {
            Side::Buy => self.place_paired_sell(&filled).await,
            Side::Sell => self.close_pair_and_replenish(&filled).await,
        }
    }

    /// A filled BUY gets its counter SELL at the profit target, clamped
    /// into the grid and quantized to the venue filters.
    pub(crate) async fn place_paired_sell(&mut self, buy: &GridOrder) -> EngineResult<()> {
        if self.bot.state != BotState::Active {
            // Paused bots record the debt; resume or recovery settles it.
            self.bot
                .mark_dormant(buy.grid_level, DormantReason::PendingPair);
            return Ok(());
        }
        let exec_price = buy.executed_price.unwrap_or(buy.price);
        let sell_price = paired_sell_price(&self.bot.config, &self.info, exec_price);
        let Some(sell_qty) = paired_sell_qty(&self.info, buy.executed_qty) else {
            warn!(
                "🤖 bot {} rung {}: fill {} below venue minimum, pair deferred",
                self.bot.id, buy.grid_level, buy.executed_qty
            );
            self.bot
                .mark_dormant(buy.grid_level, DormantReason::PendingPair);
            return Ok(());
        };

        let mut sell = GridOrder::new(Side::Sell, sell_price, sell_qty, buy.grid_level);
        sell.pair_parent = Some(buy.local_id);
        sell.is_recovery_order = buy.is_recovery_order;

        match self.place_order(sell).await {
            Ok(()) => {
                if let Some(b) = self
                    .bot
                    .orders
                    .iter_mut()
                    .find(|o| o.local_id == buy.local_id)
                {
                    b.has_corresponding_sell = true;
                }
                self.bot.clear_dormant(buy.grid_level);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "🤖 bot {} pair SELL at rung {} failed ({e}); deferring to sweep",
                    self.bot.id, buy.grid_level
                );
                self.bot
                    .mark_dormant(buy.grid_level, DormantReason::PendingPair);
                Ok(())
            }
        }
    }

    /// A filled SELL realizes its pair's profit and optionally re-arms the
    /// rung with a fresh BUY one profit-step below.
    async fn close_pair_and_replenish(&mut self, sell: &GridOrder) -> EngineResult<()> {
        let sell_exec = sell.executed_price.unwrap_or(sell.price);

        if let Some(parent_id) = sell.pair_parent {
            if let Some(parent) = self.bot.order_by_local_id(parent_id).cloned() {
                let buy_exec = parent.executed_price.unwrap_or(parent.price);
                let qty = parent.executed_qty.min(sell.executed_qty);
                let pnl = (sell_exec - buy_exec) * qty - parent.commission - sell.commission;
                self.bot.stats.total_profit += pnl;
                self.bot.stats.total_trades += 1;
                info!(
                    "💰 bot {} pair closed at rung {}: pnl {} (total {})",
                    self.bot.id, sell.grid_level, pnl, self.bot.stats.total_profit
                );
            }
        }

        if self.bot.state != BotState::Active {
            self.bot
                .mark_dormant(sell.grid_level, DormantReason::PendingPair);
            return Ok(());
        }
        if !self.bot.config.replenish_after_close {
            self.bot
                .mark_dormant(sell.grid_level, DormantReason::PolicyHold);
            return Ok(());
        }

        // Replenish only while the market is still inside the grid.
        let current = self.gateway.price(&self.bot.config.symbol).await?;
        if current < self.bot.config.lower_price || current > self.bot.config.upper_price {
            self.bot
                .mark_dormant(sell.grid_level, DormantReason::OutOfRange);
            return Ok(());
        }

        let buy_price = replenish_buy_price(&self.bot.config, &self.info, sell_exec);
        let buy_qty = grid::quantize_down(
            self.bot.config.per_rung_investment() / buy_price,
            self.info.step_size,
        );
        if buy_qty < self.info.min_qty {
            self.bot
                .mark_dormant(sell.grid_level, DormantReason::AwaitingBalance);
            return Ok(());
        }

        let account = self.gateway.account_info().await?;
        if account.free(&self.info.quote_asset) < buy_price * buy_qty {
            self.bot
                .mark_dormant(sell.grid_level, DormantReason::AwaitingBalance);
            return Ok(());
        }

        let mut buy = GridOrder::new(Side::Buy, buy_price, buy_qty, sell.grid_level);
        buy.pair_parent = Some(sell.local_id);
        match self.place_order(buy).await {
            Ok(()) => {
                self.bot.clear_dormant(sell.grid_level);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "🤖 bot {} replenish BUY at rung {} failed ({e}); rung dormant",
                    self.bot.id, sell.grid_level
                );
                self.bot
                    .mark_dormant(sell.grid_level, DormantReason::AwaitingBalance);
                Ok(())
            }
        }
    }

    // ─────────────────────────────────────────────────────────
    // Placement
    // ─────────────────────────────────────────────────────────

    /// Place one order and record it. The single consumer task guarantees
    /// at most one placement in flight per bot.
    pub(crate) async fn place_order(&mut self, mut order: GridOrder) -> EngineResult<()> {
        let symbol = self.bot.config.symbol.clone();
        let side = order.side;
        let price = order.price;
        let qty = order.quantity;
        let gateway = self.gateway.clone();

        let ack = with_backoff(PLACE_ATTEMPTS, PLACE_BACKOFF, || {
            let symbol = symbol.clone();
            let gateway = gateway.clone();
            async move { gateway.place_limit(&symbol, side, price, qty).await }
        })
        .await?;

        order.venue_order_id = Some(ack.venue_order_id);
        self.routes
            .register(&self.bot.owner, ack.venue_order_id, self.route());
        // Recorded as NEW regardless of the ack status: fills only enter
        // through the fill pipeline so they are never double-applied.
        self.bot.orders.push(order);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────

    async fn pause(&mut self) -> EngineResult<BotState> {
        match self.bot.state {
            BotState::Active => {
                self.bot.state = BotState::Paused;
                self.persist_state_only().await?;
                info!("⏸️ bot {} paused (resting orders left in place)", self.bot.id);
                Ok(BotState::Paused)
            }
            _ => Err(EngineError::NotActive),
        }
    }

    /// Re-activate a paused, stopped, or quarantined bot. The recovery
    /// sweep restores whatever coverage the downtime cost.
    pub(crate) async fn resume(&mut self) -> EngineResult<BotState> {
        match self.bot.state {
            BotState::Active => Err(EngineError::AlreadyActive),
            BotState::Paused | BotState::Error | BotState::Stopped => {
                self.bot.state = BotState::Active;
                self.persist_state_only().await?;
                // Coverage may have drifted while we were not looking.
                let outcome = recovery::reconcile_bot(self).await?;
                info!(
                    "▶️ bot {} resumed (restored {}, cancelled {}, skipped {})",
                    self.bot.id, outcome.restored, outcome.cancelled, outcome.skipped
                );
                Ok(self.bot.state)
            }
        }
    }

    async fn stop(&mut self) -> EngineResult<BotState> {
        if self.bot.state == BotState::Stopped {
            return Err(EngineError::AlreadyStopped);
        }
        let live: Vec<u64> = self
            .bot
            .live_orders()
            .filter_map(|o| o.venue_order_id)
            .collect();
        for venue_id in live {
            // Best-effort: a failed cancel never blocks the stop; the next
            // startup sweep reconciles whatever survived.
            if let Err(e) = self.gateway.cancel(&self.bot.config.symbol, venue_id).await {
                warn!("🤖 bot {} stop: cancel {venue_id} failed: {e}", self.bot.id);
            } else if let Some(order) = self.bot.order_by_venue_id_mut(venue_id) {
                order.status = crate::venue::types::OrderStatus::Cancelled;
                order.updated_at = chrono::Utc::now();
            }
        }
        self.bot.state = BotState::Stopped;
        self.persist_state_only().await?;
        self.routes.unregister_bot(self.bot.id);
        info!("⏹️ bot {} stopped", self.bot.id);
        Ok(BotState::Stopped)
    }

    // ─────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────

    /// One save covers orders, statistics and dormant marks together, and
    /// the performance projection is refreshed against the given mark.
    pub(crate) async fn persist(&mut self, mark: Decimal) -> EngineResult<()> {
        self.bot.touch();
        self.store.save_bot(&self.bot).await?;
        let snapshot = performance::project(&self.bot, mark);
        self.store.save_performance(&snapshot).await?;
        Ok(())
    }

    pub(crate) async fn persist_state_only(&mut self) -> EngineResult<()> {
        self.bot.touch();
        self.store.save_bot(&self.bot).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::venue::gateway::MockGateway;
    use crate::venue::types::{AccountInfo, Balance, OrderStatus};
    use rust_decimal_macros::dec;

    fn symbol() -> SymbolInfo {
        SymbolInfo {
            symbol: "FOOUSDT".into(),
            base_asset: "FOO".into(),
            quote_asset: "USDT".into(),
            tick_size: dec!(0.001),
            step_size: dec!(0.01),
            min_qty: dec!(0.1),
            min_notional: dec!(5),
            price_precision: 3,
            quantity_precision: 2,
        }
    }

    fn account(quote: Decimal, base: Decimal) -> AccountInfo {
        AccountInfo {
            can_trade: true,
            balances: vec![
                Balance {
                    asset: "USDT".into(),
                    free: quote,
                    locked: dec!(0),
                },
                Balance {
                    asset: "FOO".into(),
                    free: base,
                    locked: dec!(0),
                },
            ],
        }
    }

    fn config() -> BotConfig {
        BotConfig {
            symbol: "FOOUSDT".into(),
            upper_price: dec!(11),
            lower_price: dec!(9),
            grid_levels: 11,
            investment: dec!(110),
            profit_per_grid: dec!(1),
            test_mode: false,
            replenish_after_close: true,
        }
    }

    async fn create_bot(
        gw: Arc<MockGateway>,
    ) -> (BotController, Arc<MemoryStore>, RouteTable) {
        let store = Arc::new(MemoryStore::new());
        let routes = RouteTable::new();
        let ctrl = BotController::create(
            "alice",
            config(),
            None,
            gw,
            store.clone(),
            routes.clone(),
        )
        .await
        .unwrap();
        (ctrl, store, routes)
    }

    fn fill_update(venue_id: u64, side: Side, qty: Decimal, price: Decimal) -> OrderUpdate {
        OrderUpdate {
            symbol: "FOOUSDT".into(),
            venue_order_id: venue_id,
            side,
            status: OrderStatus::Filled,
            executed_qty: qty,
            last_price: price,
            cummulative_quote_qty: price * qty,
            commission: dec!(0),
            commission_asset: None,
            event_time: 1_700_000_000_000,
        }
    }

    // Creation places the full initial coverage.
    #[tokio::test]
    async fn test_create_places_full_coverage() {
        let gw = Arc::new(MockGateway::new(symbol(), dec!(10), account(dec!(200), dec!(0))));
        let (ctrl, store, routes) = create_bot(gw.clone()).await;

        assert_eq!(ctrl.bot.state, BotState::Active);
        assert_eq!(ctrl.bot.orders.len(), 11);
        assert_eq!(gw.open_order_count().await, 11);
        assert_eq!(routes.len(), 11);

        // Rungs strictly below price quote their own level; latent rungs
        // arm BUYs at the 10.00 anchor.
        let placed = gw.placed_orders().await;
        assert!(placed.iter().all(|o| o.side == Side::Buy));
        assert_eq!(placed.iter().filter(|o| o.price == dec!(10)).count(), 6);

        let persisted = store.load_bot(ctrl.bot.id).await.unwrap();
        assert_eq!(persisted.orders.len(), 11);
    }

    #[tokio::test]
    async fn test_create_rejects_price_out_of_range() {
        let gw = Arc::new(MockGateway::new(symbol(), dec!(12), account(dec!(200), dec!(0))));
        let store = Arc::new(MemoryStore::new());
        let err = BotController::create(
            "alice",
            config(),
            None,
            gw,
            store.clone(),
            RouteTable::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::PriceRange { .. }));
        assert!(store.list_bots(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_insufficient_quote() {
        let gw = Arc::new(MockGateway::new(symbol(), dec!(10), account(dec!(50), dec!(0))));
        let err = BotController::create(
            "alice",
            config(),
            None,
            gw,
            Arc::new(MemoryStore::new()),
            RouteTable::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance { .. }));
    }

    #[tokio::test]
    async fn test_create_rolls_back_on_placement_failure() {
        let gw = Arc::new(MockGateway::new(symbol(), dec!(10), account(dec!(200), dec!(0))));
        // Three rungs go in, then the venue rejects with a fatal error.
        gw.allow_placements(3).await;
        gw.inject_place_failure(VenueError::Fatal("permission revoked".into()))
            .await;

        let store = Arc::new(MemoryStore::new());
        let routes = RouteTable::new();
        let err = BotController::create(
            "alice",
            config(),
            None,
            gw.clone(),
            store.clone(),
            routes.clone(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Venue(VenueError::Fatal(_))));

        // The three accepted orders were cancelled, the record deleted,
        // and no routes dangle.
        assert_eq!(gw.cancelled_ids().await.len(), 3);
        assert_eq!(gw.open_order_count().await, 0);
        assert!(store.list_bots(None).await.unwrap().is_empty());
        assert!(routes.is_empty());
    }

    // A BUY fill produces the paired SELL at the profit target.
    #[tokio::test]
    async fn test_buy_fill_places_paired_sell() {
        let gw = Arc::new(MockGateway::new(symbol(), dec!(10), account(dec!(200), dec!(0))));
        let (mut ctrl, _store, _routes) = create_bot(gw.clone()).await;

        // The rung-4 BUY rests at 9.80.
        let buy = ctrl
            .bot
            .orders
            .iter()
            .find(|o| o.price == dec!(9.8))
            .unwrap()
            .clone();
        let venue_id = buy.venue_order_id.unwrap();

        gw.fill_order(venue_id, dec!(9.8)).await.unwrap();
        ctrl.apply_order_update(&fill_update(venue_id, Side::Buy, dec!(1.02), dec!(9.8)))
            .await
            .unwrap();

        let sell = ctrl
            .bot
            .orders
            .iter()
            .find(|o| o.side == Side::Sell)
            .expect("paired sell placed");
        assert_eq!(sell.price, dec!(9.898));
        assert_eq!(sell.quantity, dec!(1.02));
        assert_eq!(sell.pair_parent, Some(buy.local_id));
        assert_eq!(sell.grid_level, buy.grid_level);

        let buy_after = ctrl.bot.order_by_local_id(buy.local_id).unwrap();
        assert!(buy_after.has_corresponding_sell);
        assert!(buy_after.is_filled());
    }

    // A pair close credits profit and replenishes the rung.
    #[tokio::test]
    async fn test_sell_fill_realizes_profit_and_replenishes() {
        let gw = Arc::new(MockGateway::new(symbol(), dec!(10), account(dec!(200), dec!(0))));
        let (mut ctrl, _store, _routes) = create_bot(gw.clone()).await;

        let buy_id = ctrl
            .bot
            .orders
            .iter()
            .find(|o| o.price == dec!(9.8))
            .unwrap()
            .venue_order_id
            .unwrap();
        ctrl.apply_order_update(&fill_update(buy_id, Side::Buy, dec!(1.02), dec!(9.8)))
            .await
            .unwrap();

        let sell_id = ctrl
            .bot
            .orders
            .iter()
            .find(|o| o.side == Side::Sell)
            .unwrap()
            .venue_order_id
            .unwrap();
        ctrl.apply_order_update(&fill_update(sell_id, Side::Sell, dec!(1.02), dec!(9.9)))
            .await
            .unwrap();

        // (9.90 - 9.80) * 1.02 = 0.102, no commissions in the mock.
        assert_eq!(ctrl.bot.stats.total_profit, dec!(0.102));
        assert_eq!(ctrl.bot.stats.total_trades, 1);

        // Replenish BUY at 9.90 / 1.01, quantized down to the tick.
        let replenish = ctrl
            .bot
            .orders
            .iter()
            .filter(|o| o.side == Side::Buy && o.is_live())
            .find(|o| o.price == dec!(9.801))
            .expect("replenish buy placed");
        assert_eq!(replenish.grid_level, 4);
    }

    // With replenishment disabled, a closed pair leaves its rung on policy
    // hold and sweeps do not re-quote it.
    #[tokio::test]
    async fn test_replenish_disabled_holds_rung() {
        let gw = Arc::new(MockGateway::new(symbol(), dec!(10), account(dec!(200), dec!(0))));
        let store = Arc::new(MemoryStore::new());
        let mut cfg = config();
        cfg.replenish_after_close = false;
        let mut ctrl = BotController::create(
            "alice",
            cfg,
            None,
            gw.clone(),
            store,
            RouteTable::new(),
        )
        .await
        .unwrap();

        let buy_id = ctrl
            .bot
            .orders
            .iter()
            .find(|o| o.price == dec!(9.8))
            .unwrap()
            .venue_order_id
            .unwrap();
        ctrl.apply_order_update(&fill_update(buy_id, Side::Buy, dec!(1.02), dec!(9.8)))
            .await
            .unwrap();
        let sell_id = ctrl
            .bot
            .orders
            .iter()
            .find(|o| o.side == Side::Sell)
            .unwrap()
            .venue_order_id
            .unwrap();
        gw.fill_order(sell_id, dec!(9.898)).await.unwrap();
        ctrl.apply_order_update(&fill_update(sell_id, Side::Sell, dec!(1.02), dec!(9.898)))
            .await
            .unwrap();

        assert_eq!(ctrl.bot.stats.total_trades, 1);
        // No replenish BUY; the rung is held by policy instead.
        assert!(!ctrl
            .bot
            .orders
            .iter()
            .any(|o| o.side == Side::Buy && o.is_live() && o.grid_level == 4));
        assert!(ctrl
            .bot
            .dormant
            .iter()
            .any(|d| d.level == 4 && d.reason == DormantReason::PolicyHold));

        // The sweep honors the hold: nothing re-quoted at rung 4.
        let outcome = recovery::reconcile_bot(&mut ctrl).await.unwrap();
        assert_eq!(outcome.restored, 0);
        assert!(!ctrl
            .bot
            .orders
            .iter()
            .any(|o| o.is_live() && o.grid_level == 4));
        assert!(ctrl
            .bot
            .dormant
            .iter()
            .any(|d| d.level == 4 && d.reason == DormantReason::PolicyHold));
    }

    // Invariant 5: applying the same fill twice changes nothing.
    #[tokio::test]
    async fn test_fill_idempotent() {
        let gw = Arc::new(MockGateway::new(symbol(), dec!(10), account(dec!(200), dec!(0))));
        let (mut ctrl, _store, _routes) = create_bot(gw.clone()).await;

        let buy_id = ctrl
            .bot
            .orders
            .iter()
            .find(|o| o.price == dec!(9.8))
            .unwrap()
            .venue_order_id
            .unwrap();
        let update = fill_update(buy_id, Side::Buy, dec!(1.02), dec!(9.8));
        ctrl.apply_order_update(&update).await.unwrap();
        let orders_after_first = ctrl.bot.orders.len();
        let sells_after_first = ctrl
            .bot
            .orders
            .iter()
            .filter(|o| o.side == Side::Sell)
            .count();

        ctrl.apply_order_update(&update).await.unwrap();
        assert_eq!(ctrl.bot.orders.len(), orders_after_first);
        assert_eq!(
            ctrl.bot
                .orders
                .iter()
                .filter(|o| o.side == Side::Sell)
                .count(),
            sells_after_first
        );
    }

    #[tokio::test]
    async fn test_paused_bot_defers_pairing() {
        let gw = Arc::new(MockGateway::new(symbol(), dec!(10), account(dec!(200), dec!(0))));
        let (mut ctrl, _store, _routes) = create_bot(gw.clone()).await;
        ctrl.bot.state = BotState::Paused;

        let buy = ctrl
            .bot
            .orders
            .iter()
            .find(|o| o.price == dec!(9.8))
            .unwrap()
            .clone();
        ctrl.apply_order_update(&fill_update(
            buy.venue_order_id.unwrap(),
            Side::Buy,
            dec!(1.02),
            dec!(9.8),
        ))
        .await
        .unwrap();

        // Fill recorded, but no SELL placed while paused.
        assert!(ctrl
            .bot
            .order_by_local_id(buy.local_id)
            .unwrap()
            .is_filled());
        assert!(!ctrl.bot.orders.iter().any(|o| o.side == Side::Sell));
        assert!(ctrl
            .bot
            .dormant
            .iter()
            .any(|d| d.level == buy.grid_level && d.reason == DormantReason::PendingPair));
    }

    #[tokio::test]
    async fn test_stop_cancels_live_orders() {
        let gw = Arc::new(MockGateway::new(symbol(), dec!(10), account(dec!(200), dec!(0))));
        let (mut ctrl, store, routes) = create_bot(gw.clone()).await;

        let state = ctrl.stop().await.unwrap();
        assert_eq!(state, BotState::Stopped);
        assert_eq!(gw.open_order_count().await, 0);
        assert_eq!(gw.cancelled_ids().await.len(), 11);
        assert!(routes.is_empty());

        let persisted = store.load_bot(ctrl.bot.id).await.unwrap();
        assert_eq!(persisted.state, BotState::Stopped);
        // A stopped bot keeps its history.
        assert_eq!(persisted.orders.len(), 11);

        assert!(matches!(
            ctrl.stop().await.unwrap_err(),
            EngineError::AlreadyStopped
        ));
    }

    #[tokio::test]
    async fn test_pause_then_resume_restores_pair() {
        let gw = Arc::new(MockGateway::new(symbol(), dec!(10), account(dec!(200), dec!(0))));
        let (mut ctrl, _store, _routes) = create_bot(gw.clone()).await;

        ctrl.pause().await.unwrap();
        let buy = ctrl
            .bot
            .orders
            .iter()
            .find(|o| o.price == dec!(9.8))
            .unwrap()
            .clone();
        let _ = gw.fill_order(buy.venue_order_id.unwrap(), dec!(9.8)).await;
        ctrl.apply_order_update(&fill_update(
            buy.venue_order_id.unwrap(),
            Side::Buy,
            dec!(1.02),
            dec!(9.8),
        ))
        .await
        .unwrap();
        assert!(!ctrl.bot.orders.iter().any(|o| o.side == Side::Sell));

        ctrl.resume().await.unwrap();
        // Resume sweep settles the pending pair at the actual fill price.
        let sell = ctrl
            .bot
            .orders
            .iter()
            .find(|o| o.side == Side::Sell)
            .expect("sell placed on resume");
        assert_eq!(sell.price, dec!(9.898));
        assert!(sell.is_recovery_order);
    }
}
