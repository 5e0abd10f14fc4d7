//! Performance projection: deterministic pairing of filled orders and the
//! PnL snapshot derived from them.
//!
//! Pairing rules, applied in order:
//!   1. explicit parent link (SELL → its BUY),
//!   2. FIFO among the rest: earliest unpaired SELL at or after the BUY's
//!      fill time with a higher executed price,
//!   3. leftovers value as unrealized at the current mark.
//!
//! The projection reads only the order history, so replaying the same
//! history always reproduces the same snapshot.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::engine::types::{BotRecord, PerformanceSnapshot};
use crate::venue::types::Side;

#[derive(Debug, Clone)]
struct FilledOrder {
    local_id: Uuid,
    side: Side,
    exec_price: Decimal,
    exec_qty: Decimal,
    commission: Decimal,
    pair_parent: Option<Uuid>,
    grid_level: u32,
    filled_at: i64,
}

#[derive(Debug, Clone)]
struct ClosedPair {
    pnl: Decimal,
    grid_level: u32,
    closed_at: i64,
}

/// Rebuild the performance snapshot from the bot's order history at the
/// given mark price.
pub fn project(bot: &BotRecord, mark: Decimal) -> PerformanceSnapshot {
    let mut fills: Vec<FilledOrder> = bot
        .orders
        .iter()
        .filter(|o| o.is_filled() && o.executed_qty > Decimal::ZERO)
        .map(|o| FilledOrder {
            local_id: o.local_id,
            side: o.side,
            exec_price: o.executed_price.unwrap_or(o.price),
            exec_qty: o.executed_qty,
            commission: o.commission,
            pair_parent: o.pair_parent,
            grid_level: o.grid_level,
            filled_at: o.filled_at.unwrap_or(0),
        })
        .collect();
    // Stable order: fill time, then id, so replays agree.
    fills.sort_by(|a, b| {
        a.filled_at
            .cmp(&b.filled_at)
            .then_with(|| a.local_id.cmp(&b.local_id))
    });

    let buys: Vec<FilledOrder> = fills.iter().filter(|f| f.side == Side::Buy).cloned().collect();
    let sells: Vec<FilledOrder> = fills.iter().filter(|f| f.side == Side::Sell).cloned().collect();

    let mut paired_buys: Vec<Uuid> = Vec::new();
    let mut paired_sells: Vec<Uuid> = Vec::new();
    let mut pairs: Vec<ClosedPair> = Vec::new();

    // Rule 1: explicit parent links.
    for sell in &sells {
        let Some(parent_id) = sell.pair_parent else {
            continue;
        };
        let Some(buy) = buys.iter().find(|b| b.local_id == parent_id) else {
            continue;
        };
        if paired_buys.contains(&buy.local_id) {
            continue;
        }
        pairs.push(close_pair(buy, sell));
        paired_buys.push(buy.local_id);
        paired_sells.push(sell.local_id);
    }

    // Rule 2: FIFO among the unpaired remainder.
    for buy in &buys {
        if paired_buys.contains(&buy.local_id) {
            continue;
        }
        let candidate = sells.iter().find(|s| {
            !paired_sells.contains(&s.local_id)
                && s.filled_at >= buy.filled_at
                && s.exec_price > buy.exec_price
        });
        if let Some(sell) = candidate {
            pairs.push(close_pair(buy, sell));
            paired_buys.push(buy.local_id);
            paired_sells.push(sell.local_id);
        }
    }

    // Rule 3: leftovers.
    let mut unrealized = Decimal::ZERO;
    for buy in &buys {
        if !paired_buys.contains(&buy.local_id) {
            unrealized += (mark - buy.exec_price) * buy.exec_qty - buy.commission;
        }
    }
    let mut unpaired_sells = 0u64;
    for sell in &sells {
        if !paired_sells.contains(&sell.local_id) {
            // Short inventory: value it against the mark and flag it.
            unrealized += (sell.exec_price - mark) * sell.exec_qty - sell.commission;
            unpaired_sells += 1;
        }
    }

    let realized: Decimal = pairs.iter().map(|p| p.pnl).sum();
    let wins = pairs.iter().filter(|p| p.pnl > Decimal::ZERO).count();
    let win_rate = if pairs.is_empty() {
        0.0
    } else {
        wins as f64 / pairs.len() as f64
    };

    let mut profit_per_day: Vec<(String, Decimal)> = Vec::new();
    let mut profit_per_level: Vec<(u32, Decimal)> = Vec::new();
    for pair in &pairs {
        let day = day_bucket(pair.closed_at);
        match profit_per_day.iter_mut().find(|(d, _)| *d == day) {
            Some((_, total)) => *total += pair.pnl,
            None => profit_per_day.push((day, pair.pnl)),
        }
        match profit_per_level.iter_mut().find(|(l, _)| *l == pair.grid_level) {
            Some((_, total)) => *total += pair.pnl,
            None => profit_per_level.push((pair.grid_level, pair.pnl)),
        }
    }
    profit_per_day.sort_by(|a, b| a.0.cmp(&b.0));
    profit_per_level.sort_by_key(|(l, _)| *l);

    PerformanceSnapshot {
        bot_id: bot.id,
        realized_pnl: realized,
        unrealized_pnl: unrealized,
        total_trades: pairs.len() as u64,
        win_rate,
        best_trade: pairs.iter().map(|p| p.pnl).max(),
        worst_trade: pairs.iter().map(|p| p.pnl).min(),
        profit_per_day,
        profit_per_level,
        unpaired_sells,
        computed_at: Utc::now(),
    }
}

fn close_pair(buy: &FilledOrder, sell: &FilledOrder) -> ClosedPair {
    let qty = buy.exec_qty.min(sell.exec_qty);
    ClosedPair {
        pnl: (sell.exec_price - buy.exec_price) * qty - buy.commission - sell.commission,
        grid_level: buy.grid_level,
        closed_at: sell.filled_at,
    }
}

fn day_bucket(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_else(Utc::now)
        .format("%Y-%m-%d")
        .to_string()
}
