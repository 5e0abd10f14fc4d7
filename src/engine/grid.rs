//! Grid math: rung pricing, venue-filter quantization, and the coverage
//! plan that decides which side (if any) each rung should quote.
//!
//! Everything here is pure; the bot controller and the recovery sweep both
//! call into it so their views of "what should be live" cannot drift apart.

use rust_decimal::Decimal;

use crate::engine::types::{BotConfig, DormantReason};
use crate::error::{EngineError, EngineResult};
use crate::venue::types::{Side, SymbolInfo};

// ─────────────────────────────────────────────────────────
// Quantization
// ─────────────────────────────────────────────────────────

/// Largest multiple of `increment` not exceeding `value`.
pub fn quantize_down(value: Decimal, increment: Decimal) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    (value / increment).floor() * increment
}

/// Smallest multiple of `increment` not below `value`.
pub fn quantize_up(value: Decimal, increment: Decimal) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    (value / increment).ceil() * increment
}

// ─────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────

/// Full creation-time validation: range checks plus the venue's filters.
/// Oracle proposals pass through here unchanged.
pub fn validate_config(cfg: &BotConfig, info: &SymbolInfo) -> EngineResult<()> {
    cfg.validate_ranges()?;

    let step = cfg.step_size();
    if step < info.tick_size {
        return Err(EngineError::Validation(format!(
            "grid step {step} is finer than the symbol tick {}; use fewer levels or a wider range",
            info.tick_size
        )));
    }

    let per_rung = cfg.per_rung_investment();
    if per_rung < info.min_notional {
        return Err(EngineError::Validation(format!(
            "per-rung investment {per_rung} is below the venue minimum notional {}",
            info.min_notional
        )));
    }

    // The smallest quantity the grid will ever quote sits at the top rung.
    let min_rung_qty = quantize_down(per_rung / cfg.upper_price, info.step_size);
    if min_rung_qty < info.min_qty {
        return Err(EngineError::Validation(format!(
            "per-rung quantity {min_rung_qty} at the top rung is below the venue minimum {}",
            info.min_qty
        )));
    }

    Ok(())
}

// ─────────────────────────────────────────────────────────
// Coverage plan
// ─────────────────────────────────────────────────────────

/// What one rung should be doing right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RungAction {
    Order {
        side: Side,
        price: Decimal,
        quantity: Decimal,
    },
    Dormant(DormantReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRung {
    pub level: u32,
    pub action: RungAction,
}

/// Build the coverage plan for the current price and base inventory.
///
/// Rungs at or below the current price quote a BUY at the rung price. Rungs
/// above quote a SELL only while free base inventory covers them (allocated
/// bottom-up); a rung that cannot quote a SELL is seeded latent: an armed
/// BUY at the anchor rung (highest rung at or below current price), owned
/// by the original level so no two live orders ever share (level, side).
pub fn build_coverage_plan(
    cfg: &BotConfig,
    info: &SymbolInfo,
    current_price: Decimal,
    free_base: Decimal,
) -> Vec<PlannedRung> {
    let per_rung = cfg.per_rung_investment();
    let anchor = anchor_price(cfg, info, current_price);
    let mut base_left = free_base;
    let mut plan = Vec::with_capacity(cfg.grid_levels as usize);

    for level in 0..cfg.grid_levels {
        let price = rung_price_quantized(cfg, info, level);
        let action = if price <= current_price {
            let qty = quantize_down(per_rung / price, info.step_size);
            if qty < info.min_qty {
                RungAction::Dormant(DormantReason::AwaitingBalance)
            } else {
                RungAction::Order {
                    side: Side::Buy,
                    price,
                    quantity: qty,
                }
            }
        } else {
            let qty = quantize_down(per_rung / price, info.step_size);
            if qty >= info.min_qty && base_left >= qty {
                base_left -= qty;
                RungAction::Order {
                    side: Side::Sell,
                    price,
                    quantity: qty,
                }
            } else {
                match anchor {
                    Some(anchor_px) => {
                        let armed_qty = quantize_down(per_rung / anchor_px, info.step_size);
                        if armed_qty < info.min_qty {
                            RungAction::Dormant(DormantReason::AwaitingInventory)
                        } else {
                            RungAction::Order {
                                side: Side::Buy,
                                price: anchor_px,
                                quantity: armed_qty,
                            }
                        }
                    }
                    None => RungAction::Dormant(DormantReason::OutOfRange),
                }
            }
        };
        plan.push(PlannedRung { level, action });
    }
    plan
}

/// Quote and base currency required to place every order in the plan.
pub fn required_balances(plan: &[PlannedRung]) -> (Decimal, Decimal) {
    let mut quote = Decimal::ZERO;
    let mut base = Decimal::ZERO;
    for rung in plan {
        if let RungAction::Order {
            side,
            price,
            quantity,
        } = &rung.action
        {
            match side {
                Side::Buy => quote += *price * *quantity,
                Side::Sell => base += *quantity,
            }
        }
    }
    (quote, base)
}

/// Rung price aligned to the venue tick.
pub fn rung_price_quantized(cfg: &BotConfig, info: &SymbolInfo, level: u32) -> Decimal {
    quantize_down(cfg.rung_price(level), info.tick_size)
}

/// Highest rung price at or below the current price, if any.
fn anchor_price(cfg: &BotConfig, info: &SymbolInfo, current_price: Decimal) -> Option<Decimal> {
    (0..cfg.grid_levels)
        .map(|level| rung_price_quantized(cfg, info, level))
        .filter(|p| *p <= current_price)
        .max()
}

// ─────────────────────────────────────────────────────────
// Fill-path pricing
// ─────────────────────────────────────────────────────────

/// Price for the SELL that closes a filled BUY: executed price plus the
/// per-grid profit, clamped into the configured range, then quantized up to
/// the tick so the profit target is never rounded away.
pub fn paired_sell_price(cfg: &BotConfig, info: &SymbolInfo, buy_exec_price: Decimal) -> Decimal {
    let raw = buy_exec_price * cfg.profit_multiplier();
    let clamped = raw.clamp(cfg.lower_price, cfg.upper_price);
    quantize_up(clamped, info.tick_size)
}

/// Quantity for the paired SELL. `None` when the executed quantity rounds
/// below the venue minimum (the rung then waits as pending-pair).
pub fn paired_sell_qty(info: &SymbolInfo, buy_exec_qty: Decimal) -> Option<Decimal> {
    let qty = quantize_down(buy_exec_qty, info.step_size);
    (qty >= info.min_qty).then_some(qty)
}

/// Price for the replenishing BUY after a pair closes: the SELL price
/// discounted by the profit step, quantized down to the tick.
pub fn replenish_buy_price(cfg: &BotConfig, info: &SymbolInfo, sell_price: Decimal) -> Decimal {
    quantize_down(sell_price / cfg.profit_multiplier(), info.tick_size)
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn test_quantize_directions() {
        assert_eq!(quantize_down(dec!(1.028), dec!(0.01)), dec!(1.02));
        assert_eq!(quantize_up(dec!(9.8981), dec!(0.001)), dec!(9.899));
        assert_eq!(quantize_up(dec!(9.898), dec!(0.001)), dec!(9.898));
        assert_eq!(quantize_down(dec!(5), dec!(0)), dec!(5));
    }

    #[test]
    fn test_validate_config_against_filters() {
        assert!(validate_config(&config(), &symbol()).is_ok());

        // 2000 levels of range 2 would need steps below the tick.
        let mut fine = config();
        fine.grid_levels = 100;
        fine.upper_price = dec!(9.05);
        assert!(validate_config(&fine, &symbol()).is_err());

        // Per-rung notional under the venue floor.
        let mut poor = config();
        poor.investment = dec!(20);
        assert!(validate_config(&poor, &symbol()).is_err());
    }

    #[test]
    fn test_coverage_plan_rungs_below_price_are_buys() {
        // Price 10.000, rungs at 9.00, 9.20, ... 11.00.
        let plan = build_coverage_plan(&config(), &symbol(), dec!(10), Decimal::ZERO);
        assert_eq!(plan.len(), 11);

        for rung in &plan[..6] {
            match &rung.action {
                RungAction::Order { side, price, .. } => {
                    assert_eq!(*side, Side::Buy);
                    assert_eq!(*price, config().rung_price(rung.level));
                }
                other => panic!("rung {} unexpected: {other:?}", rung.level),
            }
        }
    }

    #[test]
    fn test_coverage_plan_latent_rungs_arm_buys_at_anchor() {
        // No base inventory: rungs above 10.00 cannot sell, so they arm
        // BUYs at the anchor rung (10.00), each owned by its level.
        let plan = build_coverage_plan(&config(), &symbol(), dec!(10), Decimal::ZERO);
        for rung in &plan[6..] {
            match &rung.action {
                RungAction::Order { side, price, quantity } => {
                    assert_eq!(*side, Side::Buy);
                    assert_eq!(*price, dec!(10));
                    assert_eq!(*quantity, dec!(1)); // 10 USDT / 10.00
                }
                other => panic!("rung {} unexpected: {other:?}", rung.level),
            }
        }
        // Whole investment committed, within rounding.
        let (quote, base) = required_balances(&plan);
        assert_eq!(base, Decimal::ZERO);
        assert!(quote <= dec!(110));
        assert!(quote >= dec!(105));
    }

    #[test]
    fn test_coverage_plan_sells_with_inventory() {
        // Enough base for two sell rungs, allocated bottom-up.
        let plan = build_coverage_plan(&config(), &symbol(), dec!(10), dec!(2.0));
        let sells: Vec<_> = plan
            .iter()
            .filter(|r| {
                matches!(
                    r.action,
                    RungAction::Order {
                        side: Side::Sell,
                        ..
                    }
                )
            })
            .collect();
        assert_eq!(sells.len(), 2);
        assert_eq!(sells[0].level, 6);
        assert_eq!(sells[1].level, 7);
    }

    #[test]
    fn test_paired_sell_price_from_execution() {
        // BUY filled at 9.80 → SELL at 9.80 * 1.01 = 9.898.
        let px = paired_sell_price(&config(), &symbol(), dec!(9.80));
        assert_eq!(px, dec!(9.898));
        // Quantity 1.020408 quantizes down to 1.02.
        assert_eq!(paired_sell_qty(&symbol(), dec!(1.020408)), Some(dec!(1.02)));
    }

    #[test]
    fn test_paired_sell_price_clamped_to_range() {
        let px = paired_sell_price(&config(), &symbol(), dec!(10.95));
        assert_eq!(px, dec!(11));
    }

    #[test]
    fn test_paired_sell_qty_below_minimum() {
        assert_eq!(paired_sell_qty(&symbol(), dec!(0.09)), None);
    }

    #[test]
    fn test_replenish_buy_price_from_sell() {
        // SELL filled at 9.90 → replenish BUY near 9.90 / 1.01 ≈ 9.802.
        let px = replenish_buy_price(&config(), &symbol(), dec!(9.90));
        assert_eq!(px, dec!(9.801));
    }

    #[test]
    fn test_plan_is_deterministic() {
        let a = build_coverage_plan(&config(), &symbol(), dec!(10), dec!(1.5));
        let b = build_coverage_plan(&config(), &symbol(), dec!(10), dec!(1.5));
        assert_eq!(a, b);
    }
}
