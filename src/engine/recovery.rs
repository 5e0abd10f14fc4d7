//! Reconciliation / recovery sweeps.
//!
//! Runs at startup for every active bot, on the periodic tick, and on
//! manual trigger. The sweep aligns the persisted order set with venue
//! truth, settles anything the push stream missed through the normal fill
//! path, re-anchors loss-making recovery SELLs on actual executed prices,
//! and restores missing coverage subject to balances.
//!
//! The sweep runs inside the bot's own task, so it never races a push fill.

use std::collections::HashMap;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::engine::bot::BotController;
use crate::engine::grid::{build_coverage_plan, paired_sell_price, paired_sell_qty, RungAction};
use crate::engine::messages::RecoveryOutcome;
use crate::engine::types::{BotState, DormantReason, GridOrder, RecoveryEvent};
use crate::error::{EngineError, EngineResult, VenueError};
use crate::venue::types::{OrderUpdate, Side, VenueOrder};

/// One full reconciliation pass over a bot. Must be called from the bot's
/// command loop.
pub async fn reconcile_bot(ctrl: &mut BotController) -> EngineResult<RecoveryOutcome> {
    match ctrl.bot.state {
        BotState::Stopped | BotState::Paused => return Err(EngineError::NotActive),
        BotState::Active | BotState::Error => {}
    }

    let symbol = ctrl.bot.config.symbol.clone();
    let open = ctrl.gateway.open_orders(&symbol).await?;
    let account = ctrl.gateway.account_info().await?;
    let current = ctrl.gateway.price(&symbol).await?;

    let mut outcome = RecoveryOutcome::default();
    let mut balance_starved = false;

    // ── 1. Resolve local live orders against venue truth ──
    let open_by_id: HashMap<u64, VenueOrder> =
        open.into_iter().map(|o| (o.venue_order_id, o)).collect();
    let local_live: Vec<u64> = ctrl
        .bot
        .live_orders()
        .filter_map(|o| o.venue_order_id)
        .collect();

    for venue_id in local_live {
        match open_by_id.get(&venue_id) {
            Some(vo) => {
                // Still resting; sync any partial progress we missed.
                let local_exec = ctrl
                    .bot
                    .order_by_venue_id(venue_id)
                    .map(|o| o.executed_qty)
                    .unwrap_or_default();
                if vo.executed_qty > local_exec {
                    ctrl.apply_order_update(&synthetic_update(vo)).await?;
                }
            }
            None => {
                // Gone from the open set: learn its terminal status.
                match ctrl.gateway.query_order(&symbol, venue_id).await {
                    Ok(vo) => {
                        let was_cancelled = !matches!(
                            vo.status,
                            crate::venue::types::OrderStatus::Filled
                        );
                        ctrl.apply_order_update(&synthetic_update(&vo)).await?;
                        if was_cancelled {
                            outcome.cancelled += 1;
                        }
                    }
                    Err(VenueError::NotFound) => {
                        // The venue has no memory of it; expire locally so
                        // the rung can be restored below.
                        if let Some(order) = ctrl.bot.order_by_venue_id_mut(venue_id) {
                            order.status = crate::venue::types::OrderStatus::Expired;
                            order.updated_at = Utc::now();
                        }
                        outcome.cancelled += 1;
                    }
                    Err(e) => {
                        warn!("🧭 bot {} query {venue_id} failed: {e}", ctrl.bot.id);
                        outcome.skipped += 1;
                    }
                }
            }
        }
    }

    // Re-evaluate every dormant rung this sweep; only policy holds survive.
    ctrl.bot
        .dormant
        .retain(|d| d.reason == DormantReason::PolicyHold);

    // ── 2. Re-anchor SELLs priced below their pair's break-even ──
    let sell_ids: Vec<u64> = ctrl
        .bot
        .live_orders()
        .filter(|o| o.side == Side::Sell)
        .filter_map(|o| o.venue_order_id)
        .collect();
    for venue_id in sell_ids {
        let Some(sell) = ctrl.bot.order_by_venue_id(venue_id).cloned() else {
            continue;
        };
        let Some(reference) = reference_buy_price(ctrl, &sell) else {
            continue;
        };
        // Never grid-level math here: the floor comes from the actual
        // executed price of the BUY this SELL must out-earn.
        let floor = paired_sell_price(&ctrl.bot.config, &ctrl.info, reference);
        if sell.price >= floor {
            continue;
        }
        info!(
            "🧭 bot {} re-anchoring SELL {} from {} to {} (buy exec {})",
            ctrl.bot.id, venue_id, sell.price, floor, reference
        );
        if let Err(e) = ctrl.gateway.cancel(&symbol, venue_id).await {
            warn!("🧭 bot {} re-anchor cancel failed: {e}", ctrl.bot.id);
            outcome.skipped += 1;
            continue;
        }
        if let Some(order) = ctrl.bot.order_by_venue_id_mut(venue_id) {
            order.status = crate::venue::types::OrderStatus::Cancelled;
            order.updated_at = Utc::now();
        }
        outcome.cancelled += 1;

        let mut replacement = GridOrder::new(Side::Sell, floor, sell.quantity, sell.grid_level);
        replacement.pair_parent = sell.pair_parent;
        replacement.is_recovery_order = true;
        match ctrl.place_order(replacement).await {
            Ok(()) => outcome.restored += 1,
            Err(e) => {
                warn!("🧭 bot {} re-anchor placement failed: {e}", ctrl.bot.id);
                ctrl.bot
                    .mark_dormant(sell.grid_level, DormantReason::PendingPair);
                outcome.skipped += 1;
            }
        }
    }

    // ── 3. Settle filled BUYs still waiting for their pair ──
    let pending: Vec<uuid::Uuid> = ctrl
        .bot
        .orders
        .iter()
        .filter(|o| {
            o.side == Side::Buy
                && o.is_filled()
                && !o.has_corresponding_sell
                && !ctrl.bot.occupies(o.grid_level, Side::Sell)
        })
        .map(|o| o.local_id)
        .collect();
    for buy_id in pending {
        let Some(buy) = ctrl.bot.order_by_local_id(buy_id).cloned() else {
            continue;
        };
        let exec = buy.executed_price.unwrap_or(buy.price);
        let price = paired_sell_price(&ctrl.bot.config, &ctrl.info, exec);
        let Some(qty) = paired_sell_qty(&ctrl.info, buy.executed_qty) else {
            ctrl.bot
                .mark_dormant(buy.grid_level, DormantReason::PendingPair);
            outcome.skipped += 1;
            continue;
        };
        let mut sell = GridOrder::new(Side::Sell, price, qty, buy.grid_level);
        sell.pair_parent = Some(buy.local_id);
        sell.is_recovery_order = true;
        match ctrl.place_order(sell).await {
            Ok(()) => {
                if let Some(b) = ctrl.bot.orders.iter_mut().find(|o| o.local_id == buy_id) {
                    b.has_corresponding_sell = true;
                }
                ctrl.bot.clear_dormant(buy.grid_level);
                outcome.restored += 1;
            }
            Err(e) => {
                warn!("🧭 bot {} pending-pair SELL failed: {e}", ctrl.bot.id);
                ctrl.bot
                    .mark_dormant(buy.grid_level, DormantReason::PendingPair);
                outcome.skipped += 1;
            }
        }
    }

    // ── 4. Restore missing coverage per the plan ──
    let free_base = account.free(&ctrl.info.base_asset);
    let mut quote_budget = account.free(&ctrl.info.quote_asset);
    let plan = build_coverage_plan(&ctrl.bot.config, &ctrl.info, current, free_base);

    for rung in &plan {
        let covered = ctrl
            .bot
            .live_orders()
            .any(|o| o.grid_level == rung.level);
        if covered {
            continue;
        }
        if ctrl
            .bot
            .dormant
            .iter()
            .any(|d| d.level == rung.level)
        {
            continue;
        }
        // A rung whose filled BUY still awaits its pair is owned by step 3.
        if ctrl
            .bot
            .orders
            .iter()
            .any(|o| o.grid_level == rung.level && o.is_filled() && o.side == Side::Buy && !o.has_corresponding_sell)
        {
            continue;
        }

        match &rung.action {
            RungAction::Order {
                side,
                price,
                quantity,
            } => {
                if *side == Side::Buy {
                    let cost = *price * *quantity;
                    if cost > quote_budget {
                        ctrl.bot
                            .mark_dormant(rung.level, DormantReason::AwaitingBalance);
                        outcome.skipped += 1;
                        balance_starved = true;
                        continue;
                    }
                    quote_budget -= cost;
                }
                let mut order = GridOrder::new(*side, *price, *quantity, rung.level);
                order.is_recovery_order = true;
                match ctrl.place_order(order).await {
                    Ok(()) => outcome.restored += 1,
                    Err(EngineError::Venue(VenueError::InsufficientFunds(_))) => {
                        ctrl.bot
                            .mark_dormant(rung.level, DormantReason::AwaitingBalance);
                        outcome.skipped += 1;
                        balance_starved = true;
                    }
                    Err(e) => {
                        warn!(
                            "🧭 bot {} restore at rung {} failed: {e}",
                            ctrl.bot.id, rung.level
                        );
                        outcome.skipped += 1;
                    }
                }
            }
            RungAction::Dormant(reason) => {
                ctrl.bot.mark_dormant(rung.level, *reason);
                outcome.skipped += 1;
            }
        }
    }

    // ── 5. Record the sweep ──
    let note = if balance_starved {
        "coverage unsupported by balances".to_string()
    } else {
        format!("sweep at price {current}")
    };
    ctrl.bot.push_recovery_event(RecoveryEvent {
        at: Utc::now(),
        restored: outcome.restored,
        cancelled: outcome.cancelled,
        skipped: outcome.skipped,
        note,
    });

    if balance_starved {
        warn!(
            "🧭 bot {} cannot maintain coverage; quarantined in error state",
            ctrl.bot.id
        );
        ctrl.bot.state = BotState::Error;
    } else if ctrl.bot.state == BotState::Error {
        // A clean sweep clears the quarantine.
        ctrl.bot.state = BotState::Active;
    }

    ctrl.persist(current).await?;
    Ok(outcome)
}

/// The executed price this SELL must out-earn: its parent BUY when linked,
/// otherwise the most recent filled BUY at the same rung.
fn reference_buy_price(ctrl: &BotController, sell: &GridOrder) -> Option<Decimal> {
    if let Some(parent_id) = sell.pair_parent {
        if let Some(parent) = ctrl.bot.order_by_local_id(parent_id) {
            if parent.side == Side::Buy && parent.is_filled() {
                return Some(parent.executed_price.unwrap_or(parent.price));
            }
        }
    }
    ctrl.bot
        .orders
        .iter()
        .filter(|o| o.side == Side::Buy && o.is_filled() && o.grid_level == sell.grid_level)
        .max_by_key(|o| o.filled_at.unwrap_or(0))
        .map(|o| o.executed_price.unwrap_or(o.price))
}

fn synthetic_update(vo: &VenueOrder) -> OrderUpdate {
    OrderUpdate {
        symbol: vo.symbol.clone(),
        venue_order_id: vo.venue_order_id,
        side: vo.side,
        status: vo.status,
        executed_qty: vo.executed_qty,
        last_price: vo.executed_price(),
        cummulative_quote_qty: vo.cummulative_quote_qty,
        // Commissions only travel on push events; the sweep cannot see them.
        commission: Decimal::ZERO,
        commission_asset: None,
        event_time: vo.update_time,
    }
}
