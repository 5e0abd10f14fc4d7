//! Grid engine: the registry of running bots and the control API consumed
//! by the external HTTP layer.
//!
//! The engine owns one controller task and one reconciliation-tick task per
//! running bot, a shared gateway per user session, and one fill-ingestor
//! task per user stream. All bot mutations are forwarded as commands; reads
//! are served straight from the persisted projections.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EngineSettings;
use crate::engine::bot::BotController;
use crate::engine::ingestor::{self, RouteTable};
use crate::engine::messages::{BotCommand, RecoveryOutcome};
use crate::engine::oracle::{self, OracleDefaults};
use crate::engine::performance;
use crate::engine::types::{
    BotConfig, BotId, BotRecord, BotState, DormantRung, GridOrder, OracleAdvice,
    PerformanceSnapshot, RecoveryEvent,
};
use crate::engine::grid::validate_config;
use crate::error::{EngineError, EngineResult, StoreError};
use crate::store::{KeyAuditAction, KeyAuditEvent, Store};
use crate::venue::clock::ClockHandle;
use crate::venue::gateway::{ExchangeGateway, GatewayFactory};
use crate::venue::proxy::ProxyPool;

/// Kline window handed to the oracle.
const ORACLE_KLINE_INTERVAL: &str = "1h";
const ORACLE_KLINE_LIMIT: u32 = 48;

// ─────────────────────────────────────────────────────────
// Public request/response shapes
// ─────────────────────────────────────────────────────────

/// Creation request. Missing grid bounds are filled by the oracle.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateBotRequest {
    pub symbol: String,
    pub investment: Decimal,
    pub upper_price: Option<Decimal>,
    pub lower_price: Option<Decimal>,
    pub grid_levels: Option<u32>,
    pub profit_per_grid: Option<Decimal>,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default = "default_true")]
    pub replenish_after_close: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct BotSummary {
    pub id: BotId,
    pub symbol: String,
    pub state: BotState,
    pub grid_levels: u32,
    pub investment: Decimal,
    pub upper_price: Decimal,
    pub lower_price: Decimal,
    pub live_orders: usize,
    pub total_profit: Decimal,
    pub total_trades: u64,
}

impl From<&BotRecord> for BotSummary {
    fn from(bot: &BotRecord) -> Self {
        Self {
            id: bot.id,
            symbol: bot.config.symbol.clone(),
            state: bot.state,
            grid_levels: bot.config.grid_levels,
            investment: bot.config.investment,
            upper_price: bot.config.upper_price,
            lower_price: bot.config.lower_price,
            live_orders: bot.live_orders().count(),
            total_profit: bot.stats.total_profit,
            total_trades: bot.stats.total_trades,
        }
    }
}

/// Oracle preview plus the verdict of the creation validator.
#[derive(Debug, Clone, Serialize)]
pub struct ParameterPreview {
    pub advice: OracleAdvice,
    pub valid: bool,
    pub validation_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BotDiagnostics {
    pub bot_id: BotId,
    pub state: BotState,
    pub running: bool,
    pub live_orders: usize,
    pub filled_orders: usize,
    pub pending_pairs: usize,
    pub dormant: Vec<DormantRung>,
    pub last_recovery: Option<RecoveryEvent>,
    pub proxy_healthy: usize,
    pub proxy_total: usize,
    pub clock_offset_ms: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StopAllOutcome {
    pub stopped: u32,
    pub failed: u32,
}

// ─────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────

struct BotHandle {
    owner: String,
    tx: mpsc::Sender<BotCommand>,
    task: JoinHandle<()>,
    tick: JoinHandle<()>,
}

pub struct GridEngine {
    settings: EngineSettings,
    store: Arc<dyn Store>,
    factory: Arc<dyn GatewayFactory>,
    routes: RouteTable,
    pool: Arc<ProxyPool>,
    clock: ClockHandle,
    bots: Mutex<HashMap<BotId, BotHandle>>,
    /// One shared session per (owner, test_mode).
    gateways: Mutex<HashMap<(String, bool), Arc<dyn ExchangeGateway>>>,
    /// Users whose fill-ingestor task is already running.
    streams: Mutex<HashMap<(String, bool), ()>>,
}

impl GridEngine {
    pub fn new(
        settings: EngineSettings,
        store: Arc<dyn Store>,
        factory: Arc<dyn GatewayFactory>,
        pool: Arc<ProxyPool>,
        clock: ClockHandle,
    ) -> Self {
        Self {
            settings,
            store,
            factory,
            routes: RouteTable::new(),
            pool,
            clock,
            bots: Mutex::new(HashMap::new()),
            gateways: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn routes(&self) -> RouteTable {
        self.routes.clone()
    }

    // ─────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────

    /// Shared per-user gateway; resolving credentials is audited.
    async fn gateway_for(
        &self,
        owner: &str,
        test_mode: bool,
    ) -> EngineResult<Arc<dyn ExchangeGateway>> {
        let key = (owner.to_string(), test_mode);
        if let Some(gw) = self.gateways.lock().await.get(&key) {
            return Ok(gw.clone());
        }
        let result = self.factory.gateway_for(owner, test_mode).await;
        let outcome = match &result {
            Ok(_) => "ok".to_string(),
            Err(e) => format!("failed: {e}"),
        };
        let audit = KeyAuditEvent::now(owner, KeyAuditAction::Used, &outcome);
        if let Err(e) = self.store.append_audit(&audit).await {
            warn!("audit append failed for {owner}: {e}");
        }
        let gw = result?;
        self.gateways.lock().await.insert(key, gw.clone());
        Ok(gw)
    }

    /// Spawn the fill-ingestor task for a user once per session.
    async fn ensure_stream(
        &self,
        owner: &str,
        test_mode: bool,
        gateway: &Arc<dyn ExchangeGateway>,
    ) -> EngineResult<()> {
        let key = (owner.to_string(), test_mode);
        let mut streams = self.streams.lock().await;
        if streams.contains_key(&key) {
            return Ok(());
        }
        let rx = gateway.user_stream().await?;
        tokio::spawn(ingestor::run_user_stream(
            owner.to_string(),
            rx,
            self.routes.clone(),
        ));
        streams.insert(key, ());
        Ok(())
    }

    async fn spawn_controller(&self, ctrl: BotController, owner: String) {
        let bot_id = ctrl.bot_id();
        let tx = ctrl.command_sender();
        let task = tokio::spawn(ctrl.run());

        let tick_tx = tx.clone();
        let interval = self.settings.reconcile_interval;
        let tick = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                // A full inbox means the bot is busy; the sweep hint path
                // already covers it.
                match tick_tx.try_send(BotCommand::Reconcile) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        });

        self.bots.lock().await.insert(
            bot_id,
            BotHandle {
                owner,
                tx,
                task,
                tick,
            },
        );
    }

    /// Bring a persisted bot back under management (startup, or lifecycle
    /// calls against bots with no running task).
    async fn revive(&self, bot: BotRecord) -> EngineResult<mpsc::Sender<BotCommand>> {
        let owner = bot.owner.clone();
        let test_mode = bot.config.test_mode;
        let gateway = self.gateway_for(&owner, test_mode).await?;
        self.ensure_stream(&owner, test_mode, &gateway).await?;
        let ctrl = BotController::resume_from_store(
            bot,
            gateway,
            self.store.clone(),
            self.routes.clone(),
        )
        .await?;
        let tx = ctrl.command_sender();
        self.spawn_controller(ctrl, owner).await;
        Ok(tx)
    }

    async fn command_sender(&self, id: BotId) -> EngineResult<Option<mpsc::Sender<BotCommand>>> {
        Ok(self.bots.lock().await.get(&id).map(|h| h.tx.clone()))
    }

    async fn load_bot_record(&self, id: BotId) -> EngineResult<BotRecord> {
        match self.store.load_bot(id).await {
            Ok(bot) => Ok(bot),
            Err(StoreError::NotFound) => Err(EngineError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    // ─────────────────────────────────────────────────────────
    // Startup / shutdown
    // ─────────────────────────────────────────────────────────

    /// Revive every persisted active bot and run its startup sweep.
    pub async fn bootstrap(&self) -> EngineResult<usize> {
        let bots = self.store.list_bots_in_state(BotState::Active).await?;
        let count = bots.len();
        info!("🚀 bootstrapping {count} active bot(s) from the store");
        for bot in bots {
            let id = bot.id;
            match self.revive(bot).await {
                Ok(tx) => {
                    let (reply, rx) = oneshot::channel();
                    let _ = tx.send(BotCommand::Recover { reply }).await;
                    match rx.await {
                        Ok(Ok(outcome)) => info!(
                            "🚀 bot {id} startup sweep: restored {}, cancelled {}, skipped {}",
                            outcome.restored, outcome.cancelled, outcome.skipped
                        ),
                        Ok(Err(e)) => warn!("🚀 bot {id} startup sweep failed: {e}"),
                        Err(_) => warn!("🚀 bot {id} startup sweep dropped"),
                    }
                }
                Err(e) => warn!("🚀 bot {id} could not be revived: {e}"),
            }
        }
        Ok(count)
    }

    /// Graceful shutdown: ask every task to exit without touching state,
    /// then cancel hard after the grace period.
    pub async fn shutdown(&self) {
        let handles: Vec<(BotId, BotHandle)> = self.bots.lock().await.drain().collect();
        info!("🛑 shutting down {} bot task(s)", handles.len());
        let grace = self.settings.shutdown_grace;
        for (id, mut handle) in handles {
            handle.tick.abort();
            let _ = handle.tx.send(BotCommand::Shutdown).await;
            match tokio::time::timeout(grace, &mut handle.task).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("🛑 bot {id} did not exit within {}s; aborting", grace.as_secs());
                    handle.task.abort();
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────
    // Control API
    // ─────────────────────────────────────────────────────────

    pub async fn create_bot(&self, owner: &str, req: CreateBotRequest) -> EngineResult<BotSummary> {
        let gateway = self.gateway_for(owner, req.test_mode).await?;
        self.ensure_stream(owner, req.test_mode, &gateway).await?;

        let (config, snapshot) = self.resolve_config(&gateway, &req).await?;
        let ctrl = BotController::create(
            owner,
            config,
            snapshot,
            gateway,
            self.store.clone(),
            self.routes.clone(),
        )
        .await?;

        let summary = BotSummary::from(&ctrl.bot);
        self.spawn_controller(ctrl, owner.to_string()).await;
        Ok(summary)
    }

    /// Fill missing grid bounds from the oracle; explicit values win.
    async fn resolve_config(
        &self,
        gateway: &Arc<dyn ExchangeGateway>,
        req: &CreateBotRequest,
    ) -> EngineResult<(BotConfig, Option<OracleAdvice>)> {
        let needs_oracle = req.upper_price.is_none()
            || req.lower_price.is_none()
            || req.grid_levels.is_none()
            || req.profit_per_grid.is_none();

        let advice = if needs_oracle {
            let symbol = req.symbol.trim().to_ascii_uppercase();
            let price = gateway.price(&symbol).await?;
            let defaults = self.oracle_defaults();
            let advice = match gateway
                .klines(&symbol, ORACLE_KLINE_INTERVAL, ORACLE_KLINE_LIMIT)
                .await
            {
                Ok(klines) => oracle::advise(&symbol, req.investment, price, &klines, &defaults),
                Err(e) => {
                    warn!("oracle klines for {symbol} failed ({e}); using fallback band");
                    oracle::fallback(&symbol, price, &defaults)
                }
            };
            Some(advice)
        } else {
            None
        };

        let config = BotConfig {
            symbol: req.symbol.trim().to_ascii_uppercase(),
            upper_price: req
                .upper_price
                .or_else(|| advice.as_ref().map(|a| a.upper_price))
                .ok_or_else(|| EngineError::Validation("upper price unresolved".into()))?,
            lower_price: req
                .lower_price
                .or_else(|| advice.as_ref().map(|a| a.lower_price))
                .ok_or_else(|| EngineError::Validation("lower price unresolved".into()))?,
            grid_levels: req
                .grid_levels
                .or_else(|| advice.as_ref().map(|a| a.grid_levels))
                .unwrap_or_default(),
            investment: req.investment,
            profit_per_grid: req
                .profit_per_grid
                .or_else(|| advice.as_ref().map(|a| a.profit_per_grid))
                .unwrap_or_default(),
            test_mode: req.test_mode,
            replenish_after_close: req.replenish_after_close,
        };
        Ok((config, advice))
    }

    fn oracle_defaults(&self) -> OracleDefaults {
        OracleDefaults {
            band_pct: Decimal::try_from(self.settings.oracle_default_band_pct)
                .unwrap_or_else(|_| Decimal::from(5)),
            grid_levels: self.settings.oracle_default_levels,
            profit_per_grid: Decimal::try_from(self.settings.oracle_default_profit_pct)
                .unwrap_or(Decimal::ONE),
        }
    }

    pub async fn start_bot(&self, id: BotId) -> EngineResult<BotState> {
        let tx = match self.command_sender(id).await? {
            Some(tx) => tx,
            None => {
                let bot = self.load_bot_record(id).await?;
                self.revive(bot).await?
            }
        };
        let (reply, rx) = oneshot::channel();
        tx.send(BotCommand::Resume { reply })
            .await
            .map_err(|_| EngineError::NotFound)?;
        rx.await.map_err(|_| EngineError::Internal("bot task dropped reply".into()))?
    }

    pub async fn pause_bot(&self, id: BotId) -> EngineResult<BotState> {
        let tx = self
            .command_sender(id)
            .await?
            .ok_or(EngineError::NotFound)?;
        let (reply, rx) = oneshot::channel();
        tx.send(BotCommand::Pause { reply })
            .await
            .map_err(|_| EngineError::NotFound)?;
        rx.await.map_err(|_| EngineError::Internal("bot task dropped reply".into()))?
    }

    pub async fn stop_bot(&self, id: BotId) -> EngineResult<BotState> {
        let handle = self.bots.lock().await.remove(&id);
        match handle {
            Some(handle) => {
                handle.tick.abort();
                let (reply, rx) = oneshot::channel();
                handle
                    .tx
                    .send(BotCommand::Stop { reply })
                    .await
                    .map_err(|_| EngineError::NotFound)?;
                rx.await
                    .map_err(|_| EngineError::Internal("bot task dropped reply".into()))?
            }
            None => {
                // Not running; flip the record if it is not already stopped.
                let mut bot = self.load_bot_record(id).await?;
                if bot.state == BotState::Stopped {
                    return Err(EngineError::AlreadyStopped);
                }
                bot.state = BotState::Stopped;
                bot.touch();
                self.store.save_bot(&bot).await?;
                Ok(BotState::Stopped)
            }
        }
    }

    pub async fn delete_bot(&self, id: BotId) -> EngineResult<()> {
        // Stop first if running; a deleted bot must leave nothing resting.
        match self.stop_bot(id).await {
            Ok(_) | Err(EngineError::AlreadyStopped) => {}
            Err(EngineError::NotFound) => return Err(EngineError::NotFound),
            Err(e) => warn!("delete: stop of {id} failed ({e}); deleting anyway"),
        }
        self.routes.unregister_bot(id);
        match self.store.delete_bot(id).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound) => Err(EngineError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn stop_all_bots(&self, owner: &str) -> EngineResult<StopAllOutcome> {
        let ids: Vec<BotId> = {
            let bots = self.bots.lock().await;
            bots.iter()
                .filter(|(_, h)| h.owner == owner)
                .map(|(id, _)| *id)
                .collect()
        };
        let mut outcome = StopAllOutcome::default();
        for id in ids {
            match self.stop_bot(id).await {
                Ok(_) => outcome.stopped += 1,
                Err(EngineError::AlreadyStopped) => {}
                Err(e) => {
                    warn!("stop-all: bot {id} failed: {e}");
                    outcome.failed += 1;
                }
            }
        }
        Ok(outcome)
    }

    pub async fn recover_bot(&self, id: BotId) -> EngineResult<RecoveryOutcome> {
        let tx = match self.command_sender(id).await? {
            Some(tx) => tx,
            None => {
                let bot = self.load_bot_record(id).await?;
                self.revive(bot).await?
            }
        };
        let (reply, rx) = oneshot::channel();
        tx.send(BotCommand::Recover { reply })
            .await
            .map_err(|_| EngineError::NotFound)?;
        rx.await.map_err(|_| EngineError::Internal("bot task dropped reply".into()))?
    }

    // ─────────────────────────────────────────────────────────
    // Read projections
    // ─────────────────────────────────────────────────────────

    pub async fn get_bot(&self, id: BotId) -> EngineResult<BotRecord> {
        self.load_bot_record(id).await
    }

    pub async fn list_bots(&self, owner: Option<&str>) -> EngineResult<Vec<BotSummary>> {
        let bots = self.store.list_bots(owner).await?;
        Ok(bots.iter().map(BotSummary::from).collect())
    }

    pub async fn get_performance(&self, id: BotId) -> EngineResult<PerformanceSnapshot> {
        match self.store.load_performance(id).await {
            Ok(snapshot) => Ok(snapshot),
            Err(StoreError::NotFound) => {
                // Never projected yet (no fills); rebuild from the record
                // using the last known execution as the mark.
                let bot = self.load_bot_record(id).await?;
                let mark = bot
                    .orders
                    .iter()
                    .filter_map(|o| o.executed_price)
                    .last()
                    .unwrap_or(bot.config.lower_price);
                Ok(performance::project(&bot, mark))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Terminal orders, newest first.
    pub async fn get_trading_history(&self, id: BotId) -> EngineResult<Vec<GridOrder>> {
        let bot = self.load_bot_record(id).await?;
        let mut orders: Vec<GridOrder> = bot
            .orders
            .into_iter()
            .filter(|o| o.status.is_terminal())
            .collect();
        orders.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(orders)
    }

    pub async fn get_diagnostics(&self, id: BotId) -> EngineResult<BotDiagnostics> {
        let bot = self.load_bot_record(id).await?;
        let running = self.bots.lock().await.contains_key(&id);
        let (proxy_healthy, proxy_total) = self.pool.health();
        Ok(BotDiagnostics {
            bot_id: bot.id,
            state: bot.state,
            running,
            live_orders: bot.live_orders().count(),
            filled_orders: bot.orders.iter().filter(|o| o.is_filled()).count(),
            pending_pairs: bot
                .orders
                .iter()
                .filter(|o| {
                    o.side == crate::venue::types::Side::Buy
                        && o.is_filled()
                        && !o.has_corresponding_sell
                })
                .count(),
            dormant: bot.dormant.clone(),
            last_recovery: bot.recovery_history.last().cloned(),
            proxy_healthy,
            proxy_total,
            clock_offset_ms: self.clock.offset_ms(),
        })
    }

    /// Oracle preview for the given symbol and investment, with the same
    /// validation a real creation would apply.
    pub async fn preview_parameters(
        &self,
        owner: &str,
        symbol: &str,
        investment: Decimal,
    ) -> EngineResult<ParameterPreview> {
        let gateway = self.gateway_for(owner, false).await?;
        let symbol = symbol.trim().to_ascii_uppercase();
        let info = gateway.symbol_info(&symbol).await?;
        let price = gateway.price(&symbol).await?;
        let defaults = self.oracle_defaults();
        let advice = match gateway
            .klines(&symbol, ORACLE_KLINE_INTERVAL, ORACLE_KLINE_LIMIT)
            .await
        {
            Ok(klines) => oracle::advise(&symbol, investment, price, &klines, &defaults),
            Err(_) => oracle::fallback(&symbol, price, &defaults),
        };

        let candidate = BotConfig {
            symbol: symbol.clone(),
            upper_price: advice.upper_price,
            lower_price: advice.lower_price,
            grid_levels: advice.grid_levels,
            investment,
            profit_per_grid: advice.profit_per_grid,
            test_mode: false,
            replenish_after_close: true,
        };
        let validation = validate_config(&candidate, &info);
        Ok(ParameterPreview {
            advice,
            valid: validation.is_ok(),
            validation_error: validation.err().map(|e| e.to_string()),
        })
    }

    pub async fn list_key_audit(&self, owner: &str, limit: u32) -> EngineResult<Vec<KeyAuditEvent>> {
        Ok(self.store.list_audit(owner, limit).await?)
    }

    /// Proxies due for a health probe, and the probe result sink. The main
    /// loop drives this with a real `exchangeInfo` call per proxy.
    pub fn proxy_pool(&self) -> Arc<ProxyPool> {
        self.pool.clone()
    }
}
