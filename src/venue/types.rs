//! Venue-facing data model shared by the REST client, the user-data stream
//! and the engine on top.

use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Wire representation used by the venue.
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// Venue order status. Transitions are monotonic toward the terminal set;
/// an order never leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Parse the venue's status string. Unknown strings map to `Expired`
    /// (terminal, never resurrects the order).
    pub fn from_wire(s: &str) -> Self {
        match s {
            "NEW" | "PENDING_NEW" => OrderStatus::New,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" | "CANCELLED" | "PENDING_CANCEL" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            _ => OrderStatus::Expired,
        }
    }
}

/// Trading filters and asset metadata for one symbol. Cached with a TTL by
/// the gateway; refreshed on any LOT_SIZE / PRICE_FILTER rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    /// Smallest price increment.
    pub tick_size: Decimal,
    /// Smallest quantity increment.
    pub step_size: Decimal,
    pub min_qty: Decimal,
    /// Floor on price * quantity in quote currency.
    pub min_notional: Decimal,
    pub price_precision: u32,
    pub quantity_precision: u32,
}

/// One asset balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

/// Spot account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub can_trade: bool,
    pub balances: Vec<Balance>,
}

impl AccountInfo {
    /// Free balance for an asset, zero when absent.
    pub fn free(&self, asset: &str) -> Decimal {
        self.balances
            .iter()
            .find(|b| b.asset == asset)
            .map(|b| b.free)
            .unwrap_or_default()
    }
}

/// One OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Acknowledgement returned by order placement.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub venue_order_id: u64,
    pub status: OrderStatus,
    /// Cumulative executed quantity at ack time (marketable limits can fill
    /// immediately).
    pub executed_qty: Decimal,
}

/// An order as reported by the venue (query / open-orders).
#[derive(Debug, Clone)]
pub struct VenueOrder {
    pub venue_order_id: u64,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub orig_qty: Decimal,
    pub executed_qty: Decimal,
    /// Cumulative quote spent/received; executed price = quote / qty.
    pub cummulative_quote_qty: Decimal,
    pub status: OrderStatus,
    pub update_time: i64,
}

impl VenueOrder {
    /// Average executed price, falling back to the limit price when the
    /// venue reports no quote volume.
    pub fn executed_price(&self) -> Decimal {
        if self.executed_qty > Decimal::ZERO && self.cummulative_quote_qty > Decimal::ZERO {
            self.cummulative_quote_qty / self.executed_qty
        } else {
            self.price
        }
    }
}

/// One push notification from the user-data stream.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub symbol: String,
    pub venue_order_id: u64,
    pub side: Side,
    pub status: OrderStatus,
    /// Cumulative filled quantity (monotonic).
    pub executed_qty: Decimal,
    /// Price of the last execution in this event.
    pub last_price: Decimal,
    /// Cumulative quote volume.
    pub cummulative_quote_qty: Decimal,
    pub commission: Decimal,
    pub commission_asset: Option<String>,
    pub event_time: i64,
}

impl OrderUpdate {
    /// Average executed price over the order's lifetime.
    pub fn executed_price(&self) -> Decimal {
        if self.executed_qty > Decimal::ZERO && self.cummulative_quote_qty > Decimal::ZERO {
            self.cummulative_quote_qty / self.executed_qty
        } else {
            self.last_price
        }
    }
}

/// Exchange credentials for one user. The secret only leaves the vault for
/// the lifetime of a single signed request.
#[derive(Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: SecretString,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &format!("{}…", &self.api_key[..4.min(self.api_key.len())]))
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}
