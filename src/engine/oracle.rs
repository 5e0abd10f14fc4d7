//! Parameter oracle: advises grid extents from recent market data.
//!
//! Purely advisory. The controller validates whatever comes out of here
//! exactly like user input, and any failure degrades to the deterministic
//! fallback band so bot creation never blocks on the oracle.

use rust_decimal::Decimal;

use crate::engine::types::OracleAdvice;
use crate::venue::types::Kline;

#[derive(Debug, Clone)]
pub struct OracleDefaults {
    /// Half-width of the fallback band, percent of current price.
    pub band_pct: Decimal,
    pub grid_levels: u32,
    pub profit_per_grid: Decimal,
}

impl Default for OracleDefaults {
    fn default() -> Self {
        Self {
            band_pct: Decimal::from(5),
            grid_levels: 10,
            profit_per_grid: Decimal::ONE,
        }
    }
}

/// Advise grid parameters from recent klines. Falls back to the default
/// band when the window is empty or degenerate.
pub fn advise(
    symbol: &str,
    investment: Decimal,
    current_price: Decimal,
    klines: &[Kline],
    defaults: &OracleDefaults,
) -> OracleAdvice {
    if klines.len() < 2 || current_price <= Decimal::ZERO {
        return fallback(symbol, current_price, defaults);
    }

    let high = klines.iter().map(|k| k.high).max().unwrap_or(current_price);
    let low = klines.iter().map(|k| k.low).min().unwrap_or(current_price);
    if low <= Decimal::ZERO || high <= low {
        return fallback(symbol, current_price, defaults);
    }

    // Range observed over the window, padded by a quarter on each side so
    // the grid survives a continuation of the recent move.
    let span = high - low;
    let pad = span / Decimal::from(4);
    let lower = (low - pad).max(current_price / Decimal::from(2));
    let upper = high + pad;

    // Volatility proxy: average absolute close-to-close move, as a
    // fraction of price. Busier windows get wider per-rung profit.
    let mut move_sum = Decimal::ZERO;
    for pair in klines.windows(2) {
        let prev = pair[0].close;
        if prev > Decimal::ZERO {
            let delta = pair[1].close - prev;
            move_sum += delta.abs() / prev;
        }
    }
    let avg_move_pct = move_sum / Decimal::from((klines.len() - 1) as i64) * Decimal::from(100);
    let profit = avg_move_pct
        .max(defaults.profit_per_grid / Decimal::from(2))
        .min(defaults.profit_per_grid * Decimal::from(3));

    // Rung count: keep per-rung notional meaningful for the investment.
    let levels = defaults
        .grid_levels
        .max(4)
        .min(estimate_levels(investment));

    OracleAdvice {
        upper_price: upper,
        lower_price: lower,
        grid_levels: levels,
        profit_per_grid: profit.round_dp(2),
        reasoning: format!(
            "{symbol}: window low {low} / high {high}, padded band [{lower}, {upper}], \
             avg move {:.2}% per candle",
            avg_move_pct
        ),
    }
}

/// Deterministic fallback: symmetric band around the current price.
pub fn fallback(symbol: &str, current_price: Decimal, defaults: &OracleDefaults) -> OracleAdvice {
    let band = current_price * defaults.band_pct / Decimal::from(100);
    OracleAdvice {
        upper_price: current_price + band,
        lower_price: (current_price - band).max(current_price / Decimal::from(100)),
        grid_levels: defaults.grid_levels,
        profit_per_grid: defaults.profit_per_grid,
        reasoning: format!(
            "{symbol}: fallback ±{}% band around {current_price}",
            defaults.band_pct
        ),
    }
}

fn estimate_levels(investment: Decimal) -> u32 {
    use rust_decimal::prelude::ToPrimitive;
    // One rung per ~25 quote units, clamped into the configurable range.
    let raw = (investment / Decimal::from(25))
        .floor()
        .to_u32()
        .unwrap_or(2);
    raw.clamp(4, 40)
}
