//! Error taxonomy for the engine.
//!
//! Venue-facing failures, engine/control-plane failures, and persistence
//! failures are separate enums so callers can match on exactly the classes
//! they can handle. Errors are values, never control flow.

use rust_decimal::Decimal;
use thiserror::Error;

/// Failures surfaced by the exchange gateway.
#[derive(Debug, Clone, Error)]
pub enum VenueError {
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("quantity violates LOT_SIZE: {0}")]
    LotSize(String),

    #[error("order below MIN_NOTIONAL: {0}")]
    MinNotional(String),

    #[error("price violates PRICE_FILTER: {0}")]
    PriceFilter(String),

    /// Local timestamp fell outside the venue's recv window. The gateway
    /// resyncs the clock and retries once before surfacing this.
    #[error("request timestamp outside recv window")]
    TimestampSkew,

    #[error("venue rate limit hit (retry after {retry_after_ms}ms)")]
    RateLimit { retry_after_ms: u64 },

    /// HTTP 451 or equivalent. The bound proxy must be reported and rotated.
    #[error("venue refused request from this egress region")]
    RegionBlock,

    /// Connectivity failure on the bound proxy (DNS, refused, timeout).
    #[error("proxy connection failure: {0}")]
    ProxyFailure(String),

    #[error("order or symbol not found on venue")]
    NotFound,

    #[error("unknown symbol: {0}")]
    SymbolUnknown(String),

    #[error("transient venue failure: {0}")]
    Transient(String),

    /// Signature rejected, permission revoked, symbol delisted. Not retryable.
    #[error("fatal venue failure: {0}")]
    Fatal(String),
}

impl VenueError {
    /// Whether the caller may retry after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VenueError::RateLimit { .. }
                | VenueError::Transient(_)
                | VenueError::TimestampSkew
                | VenueError::ProxyFailure(_)
                | VenueError::RegionBlock
        )
    }

    /// Whether the failure implicates the bound proxy rather than the request.
    pub fn is_proxy_fault(&self) -> bool {
        matches!(
            self,
            VenueError::RegionBlock | VenueError::ProxyFailure(_) | VenueError::RateLimit { .. }
        )
    }
}

/// Persistence failures. The store stays untouched on error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("serialization failure: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("database failure: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Control-plane and bot-lifecycle failures surfaced to API callers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("current price {price} outside grid [{lower}, {upper}]")]
    PriceRange {
        price: Decimal,
        lower: Decimal,
        upper: Decimal,
    },

    #[error("insufficient {asset} balance: need {required}, free {free}")]
    InsufficientBalance {
        asset: String,
        required: Decimal,
        free: Decimal,
    },

    #[error("unknown symbol: {0}")]
    SymbolUnknown(String),

    #[error("bot not found")]
    NotFound,

    #[error("bot is already active")]
    AlreadyActive,

    #[error("bot is already stopped")]
    AlreadyStopped,

    #[error("bot is not active")]
    NotActive,

    #[error(transparent)]
    Venue(#[from] VenueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invariant breach inside the engine. The bot is quarantined in `error`.
    #[error("internal engine failure: {0}")]
    Internal(String),
}

pub type VenueResult<T> = Result<T, VenueError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(VenueError::TimestampSkew.is_retryable());
        assert!(VenueError::RateLimit { retry_after_ms: 100 }.is_retryable());
        assert!(VenueError::Transient("502".into()).is_retryable());
        assert!(!VenueError::Fatal("signature rejected".into()).is_retryable());
        assert!(!VenueError::LotSize("qty too small".into()).is_retryable());
    }

    #[test]
    fn test_proxy_fault_classes() {
        assert!(VenueError::RegionBlock.is_proxy_fault());
        assert!(VenueError::ProxyFailure("dns".into()).is_proxy_fault());
        assert!(!VenueError::TimestampSkew.is_proxy_fault());
    }
}
