//! Signed REST access to the venue.
//!
//! Requests are HMAC-SHA256 signed over the canonical query string
//! (including `timestamp` and `recvWindow`), with the API key in a header.
//! A TIMESTAMP_SKEW rejection triggers a synchronous clock resync and one
//! automatic retry. Calls from one client share an ordered gate so rate
//! limits reported by the venue push back on everything behind it.

use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{VenueError, VenueResult};
use crate::venue::clock::ClockHandle;
use crate::venue::types::{
    AccountInfo, ApiCredentials, Balance, Kline, OrderAck, OrderStatus, Side, SymbolInfo,
    VenueOrder,
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    pub recv_window_ms: u64,
    pub timeout: Duration,
}

/// One user's REST session, bound to at most one egress proxy.
pub struct RestClient {
    cfg: RestConfig,
    creds: ApiCredentials,
    clock: ClockHandle,
    http: reqwest::Client,
    proxy_url: Option<String>,
    /// FIFO gate: earliest instant the next request may go out.
    gate: Mutex<Instant>,
}

impl RestClient {
    pub fn new(
        cfg: RestConfig,
        creds: ApiCredentials,
        clock: ClockHandle,
        proxy_url: Option<String>,
    ) -> VenueResult<Self> {
        let mut builder = reqwest::Client::builder().timeout(cfg.timeout);
        if let Some(url) = &proxy_url {
            let proxy = reqwest::Proxy::all(url)
                .map_err(|e| VenueError::ProxyFailure(format!("bad proxy url: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| VenueError::Transient(format!("http client build: {e}")))?;
        Ok(Self {
            cfg,
            creds,
            clock,
            http,
            proxy_url,
            gate: Mutex::new(Instant::now()),
        })
    }

    pub fn proxy_url(&self) -> Option<&str> {
        self.proxy_url.as_deref()
    }

    // ─────────────────────────────────────────────────────────
    // Signing
    // ─────────────────────────────────────────────────────────

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.creds.api_secret.expose_secret().as_bytes())
            .expect("hmac accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn canonical_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    // ─────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &str,
        api_key_header: bool,
    ) -> VenueResult<Value> {
        // Honor the gate set by earlier rate-limit responses, FIFO.
        {
            let mut gate = self.gate.lock().await;
            let now = Instant::now();
            if *gate > now {
                tokio::time::sleep(*gate - now).await;
            }
            *gate = Instant::now();
        }

        let url = if query.is_empty() {
            format!("{}{}", self.cfg.base_url, path)
        } else {
            format!("{}{}?{}", self.cfg.base_url, path, query)
        };

        let mut req = self.http.request(method, &url);
        if api_key_header {
            req = req.header("X-MBX-APIKEY", &self.creds.api_key);
        }

        let resp = req.send().await.map_err(classify_transport_error)?;
        let status = resp.status();
        let retry_after = resp
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = resp
            .text()
            .await
            .map_err(|e| VenueError::Transient(format!("body read: {e}")))?;

        if status.is_success() {
            if body.is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&body)
                .map_err(|e| VenueError::Transient(format!("malformed venue response: {e}")));
        }

        let err = map_http_error(status, retry_after, &body);
        if let VenueError::RateLimit { retry_after_ms } = &err {
            let mut gate = self.gate.lock().await;
            *gate = Instant::now() + Duration::from_millis(*retry_after_ms);
        }
        Err(err)
    }

    /// Signed request with the skew-resync-and-retry discipline.
    async fn send_signed(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&'static str, String)>,
    ) -> VenueResult<Value> {
        params.push(("recvWindow", self.cfg.recv_window_ms.to_string()));
        for attempt in 0..2 {
            let mut attempt_params = params.clone();
            attempt_params.push(("timestamp", self.clock.venue_now_ms().to_string()));
            let query = Self::canonical_query(&attempt_params);
            let signature = self.sign(&query);
            let full = format!("{query}&signature={signature}");
            match self.send(method.clone(), path, &full, true).await {
                Err(VenueError::TimestampSkew) if attempt == 0 => {
                    warn!("🕒 timestamp skew on {path}; resyncing clock and retrying once");
                    let server = self.server_time().await?;
                    self.clock.observe_server_time(server);
                }
                // A second skew in a row degrades to a transient failure.
                Err(VenueError::TimestampSkew) => {
                    return Err(VenueError::Transient(
                        "timestamp skew persisted after resync".into(),
                    ))
                }
                other => return other,
            }
        }
        Err(VenueError::Transient("signed request retries exhausted".into()))
    }

    // ─────────────────────────────────────────────────────────
    // Public endpoints
    // ─────────────────────────────────────────────────────────

    pub async fn server_time(&self) -> VenueResult<i64> {
        let v = self.send(Method::GET, "/api/v3/time", "", false).await?;
        v.get("serverTime")
            .and_then(Value::as_i64)
            .ok_or_else(|| VenueError::Transient("serverTime missing".into()))
    }

    pub async fn exchange_info(&self, symbol: &str) -> VenueResult<SymbolInfo> {
        let query = format!("symbol={symbol}");
        let v = match self.send(Method::GET, "/api/v3/exchangeInfo", &query, false).await {
            // The venue answers 400 with -1121 for unknown symbols.
            Err(VenueError::SymbolUnknown(_)) => {
                return Err(VenueError::SymbolUnknown(symbol.to_string()))
            }
            other => other?,
        };
        let entry = v
            .get("symbols")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .ok_or_else(|| VenueError::SymbolUnknown(symbol.to_string()))?;
        parse_symbol_info(entry)
    }

    /// Cheap unauthenticated call used as the proxy health probe.
    pub async fn ping(&self) -> VenueResult<()> {
        self.send(Method::GET, "/api/v3/ping", "", false).await?;
        Ok(())
    }

    pub async fn ticker_price(&self, symbol: &str) -> VenueResult<Decimal> {
        let query = format!("symbol={symbol}");
        let v = self
            .send(Method::GET, "/api/v3/ticker/price", &query, false)
            .await?;
        dec_field(&v, "price")
    }

    pub async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> VenueResult<Vec<Kline>> {
        let query = format!("symbol={symbol}&interval={interval}&limit={limit}");
        let v = self.send(Method::GET, "/api/v3/klines", &query, false).await?;
        let rows = v
            .as_array()
            .ok_or_else(|| VenueError::Transient("klines: expected array".into()))?;
        rows.iter().map(parse_kline).collect()
    }

    // ─────────────────────────────────────────────────────────
    // Signed endpoints
    // ─────────────────────────────────────────────────────────

    pub async fn account(&self) -> VenueResult<AccountInfo> {
        let v = self.send_signed(Method::GET, "/api/v3/account", vec![]).await?;
        let balances = v
            .get("balances")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|b| {
                        Some(Balance {
                            asset: b.get("asset")?.as_str()?.to_string(),
                            free: dec_field(b, "free").ok()?,
                            locked: dec_field(b, "locked").ok()?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(AccountInfo {
            can_trade: v.get("canTrade").and_then(Value::as_bool).unwrap_or(false),
            balances,
        })
    }

    pub async fn place_limit(
        &self,
        symbol: &str,
        side: Side,
        price: Decimal,
        quantity: Decimal,
    ) -> VenueResult<OrderAck> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", format_decimal(quantity)),
            ("price", format_decimal(price)),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        let v = self.send_signed(Method::POST, "/api/v3/order", params).await?;
        let order_id = v
            .get("orderId")
            .and_then(Value::as_u64)
            .ok_or_else(|| VenueError::Transient("orderId missing in ack".into()))?;
        let status = v
            .get("status")
            .and_then(Value::as_str)
            .map(OrderStatus::from_wire)
            .unwrap_or(OrderStatus::New);
        let executed_qty = dec_field(&v, "executedQty").unwrap_or_default();
        debug!("📤 placed {side:?} {symbol} {quantity}@{price} → id={order_id} {status:?}");
        Ok(OrderAck {
            venue_order_id: order_id,
            status,
            executed_qty,
        })
    }

    /// Idempotent: an already-gone order maps NOT_FOUND to success.
    pub async fn cancel(&self, symbol: &str, venue_order_id: u64) -> VenueResult<()> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", venue_order_id.to_string()),
        ];
        match self.send_signed(Method::DELETE, "/api/v3/order", params).await {
            Ok(_) => Ok(()),
            Err(VenueError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn query_order(&self, symbol: &str, venue_order_id: u64) -> VenueResult<VenueOrder> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", venue_order_id.to_string()),
        ];
        let v = self.send_signed(Method::GET, "/api/v3/order", params).await?;
        parse_venue_order(&v)
    }

    pub async fn open_orders(&self, symbol: &str) -> VenueResult<Vec<VenueOrder>> {
        let params = vec![("symbol", symbol.to_string())];
        let v = self.send_signed(Method::GET, "/api/v3/openOrders", params).await?;
        let rows = v
            .as_array()
            .ok_or_else(|| VenueError::Transient("openOrders: expected array".into()))?;
        rows.iter().map(parse_venue_order).collect()
    }

    // ─────────────────────────────────────────────────────────
    // User-data stream listen key
    // ─────────────────────────────────────────────────────────

    pub async fn create_listen_key(&self) -> VenueResult<String> {
        let v = self
            .send(Method::POST, "/api/v3/userDataStream", "", true)
            .await?;
        v.get("listenKey")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| VenueError::Transient("listenKey missing".into()))
    }

    pub async fn keepalive_listen_key(&self, key: &str) -> VenueResult<()> {
        let query = format!("listenKey={key}");
        self.send(Method::PUT, "/api/v3/userDataStream", &query, true)
            .await?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Parsing & error mapping
// ─────────────────────────────────────────────────────────

fn classify_transport_error(e: reqwest::Error) -> VenueError {
    if e.is_timeout() {
        VenueError::ProxyFailure("timeout".into())
    } else if e.is_connect() {
        VenueError::ProxyFailure(format!("connect refused: {e}"))
    } else {
        VenueError::Transient(e.to_string())
    }
}

fn map_http_error(status: StatusCode, retry_after: Option<u64>, body: &str) -> VenueError {
    if status == StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS {
        return VenueError::RegionBlock;
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        return VenueError::RateLimit {
            retry_after_ms: retry_after.map(|s| s * 1_000).unwrap_or(1_000),
        };
    }
    if status.is_server_error() {
        return VenueError::Transient(format!("venue {status}"));
    }

    let (code, msg) = parse_venue_error(body);
    match code {
        -1021 => VenueError::TimestampSkew,
        -1121 => VenueError::SymbolUnknown(msg),
        -2011 | -2013 => VenueError::NotFound,
        -1013 | -2010 => classify_rejection(code, &msg),
        -1022 | -2014 | -2015 => VenueError::Fatal(format!("{code}: {msg}")),
        _ => VenueError::Fatal(format!("{code}: {msg}")),
    }
}

/// Filter and balance rejections arrive as -1013/-2010 with the reason only
/// in the message text.
fn classify_rejection(code: i64, msg: &str) -> VenueError {
    let upper = msg.to_ascii_uppercase();
    if upper.contains("LOT_SIZE") {
        VenueError::LotSize(msg.to_string())
    } else if upper.contains("NOTIONAL") {
        VenueError::MinNotional(msg.to_string())
    } else if upper.contains("PRICE_FILTER") {
        VenueError::PriceFilter(msg.to_string())
    } else if upper.contains("INSUFFICIENT") {
        VenueError::InsufficientFunds(msg.to_string())
    } else {
        VenueError::Fatal(format!("{code}: {msg}"))
    }
}

fn parse_venue_error(body: &str) -> (i64, String) {
    match serde_json::from_str::<Value>(body) {
        Ok(v) => (
            v.get("code").and_then(Value::as_i64).unwrap_or(0),
            v.get("msg")
                .and_then(Value::as_str)
                .unwrap_or(body)
                .to_string(),
        ),
        Err(_) => (0, body.to_string()),
    }
}

fn dec_field(v: &Value, field: &str) -> VenueResult<Decimal> {
    let raw = v
        .get(field)
        .ok_or_else(|| VenueError::Transient(format!("{field} missing")))?;
    parse_decimal_value(raw)
        .ok_or_else(|| VenueError::Transient(format!("{field}: bad decimal")))
}

/// The venue encodes decimals as strings; tolerate raw numbers too.
fn parse_decimal_value(v: &Value) -> Option<Decimal> {
    if let Some(s) = v.as_str() {
        return s.parse().ok();
    }
    if let Some(f) = v.as_f64() {
        return Decimal::try_from(f).ok();
    }
    None
}

/// Render a decimal without trailing zeros, matching the venue's filters.
pub fn format_decimal(d: Decimal) -> String {
    d.normalize().to_string()
}

fn parse_symbol_info(entry: &Value) -> VenueResult<SymbolInfo> {
    let symbol = entry
        .get("symbol")
        .and_then(Value::as_str)
        .ok_or_else(|| VenueError::Transient("symbol missing".into()))?
        .to_string();
    let base_asset = entry
        .get("baseAsset")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let quote_asset = entry
        .get("quoteAsset")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut tick_size = Decimal::new(1, 8);
    let mut step_size = Decimal::new(1, 8);
    let mut min_qty = Decimal::ZERO;
    let mut min_notional = Decimal::ZERO;

    if let Some(filters) = entry.get("filters").and_then(Value::as_array) {
        for f in filters {
            match f.get("filterType").and_then(Value::as_str) {
                Some("PRICE_FILTER") => {
                    if let Ok(t) = dec_field(f, "tickSize") {
                        tick_size = t;
                    }
                }
                Some("LOT_SIZE") => {
                    if let Ok(s) = dec_field(f, "stepSize") {
                        step_size = s;
                    }
                    if let Ok(q) = dec_field(f, "minQty") {
                        min_qty = q;
                    }
                }
                Some("NOTIONAL") | Some("MIN_NOTIONAL") => {
                    if let Ok(n) = dec_field(f, "minNotional") {
                        min_notional = n;
                    }
                }
                _ => {}
            }
        }
    }

    Ok(SymbolInfo {
        symbol,
        base_asset,
        quote_asset,
        price_precision: tick_size.normalize().scale(),
        quantity_precision: step_size.normalize().scale(),
        tick_size,
        step_size,
        min_qty,
        min_notional,
    })
}

fn parse_kline(row: &Value) -> VenueResult<Kline> {
    let cols = row
        .as_array()
        .filter(|a| a.len() >= 6)
        .ok_or_else(|| VenueError::Transient("kline row too short".into()))?;
    let dec = |i: usize| {
        parse_decimal_value(&cols[i])
            .ok_or_else(|| VenueError::Transient(format!("kline col {i}: bad decimal")))
    };
    Ok(Kline {
        open_time: cols[0].as_i64().unwrap_or(0),
        open: dec(1)?,
        high: dec(2)?,
        low: dec(3)?,
        close: dec(4)?,
        volume: dec(5)?,
    })
}

fn parse_venue_order(v: &Value) -> VenueResult<VenueOrder> {
    let side = v
        .get("side")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| VenueError::Transient("order side missing".into()))?;
    Ok(VenueOrder {
        venue_order_id: v
            .get("orderId")
            .and_then(Value::as_u64)
            .ok_or_else(|| VenueError::Transient("orderId missing".into()))?,
        symbol: v
            .get("symbol")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        side,
        price: dec_field(v, "price")?,
        orig_qty: dec_field(v, "origQty")?,
        executed_qty: dec_field(v, "executedQty").unwrap_or_default(),
        cummulative_quote_qty: dec_field(v, "cummulativeQuoteQty").unwrap_or_default(),
        status: v
            .get("status")
            .and_then(Value::as_str)
            .map(OrderStatus::from_wire)
            .unwrap_or(OrderStatus::New),
        update_time: v
            .get("updateTime")
            .or_else(|| v.get("transactTime"))
            .and_then(Value::as_i64)
            .unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn client() -> RestClient {
        RestClient::new(
            RestConfig {
                base_url: "https://venue.test".into(),
                recv_window_ms: 5_000,
                timeout: Duration::from_secs(10),
            },
            ApiCredentials {
                api_key: "key".into(),
                api_secret: "secret".to_string().into(),
            },
            ClockHandle::new(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_signature_matches_reference_vector() {
        // Known vector from the venue's API docs (secret "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j").
        let c = RestClient::new(
            RestConfig {
                base_url: "https://venue.test".into(),
                recv_window_ms: 5_000,
                timeout: Duration::from_secs(10),
            },
            ApiCredentials {
                api_key: "key".into(),
                api_secret: "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j"
                    .to_string()
                    .into(),
            },
            ClockHandle::new(),
            None,
        )
        .unwrap();
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            c.sign(query),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_canonical_query_preserves_order() {
        let q = RestClient::canonical_query(&[
            ("symbol", "FOOUSDT".into()),
            ("side", "BUY".into()),
        ]);
        assert_eq!(q, "symbol=FOOUSDT&side=BUY");
    }

    #[test]
    fn test_error_mapping_timestamp_skew() {
        let e = map_http_error(
            StatusCode::BAD_REQUEST,
            None,
            r#"{"code":-1021,"msg":"Timestamp for this request is outside of the recvWindow."}"#,
        );
        assert!(matches!(e, VenueError::TimestampSkew));
    }

    #[test]
    fn test_error_mapping_filters_and_balance() {
        let lot = map_http_error(
            StatusCode::BAD_REQUEST,
            None,
            r#"{"code":-1013,"msg":"Filter failure: LOT_SIZE"}"#,
        );
        assert!(matches!(lot, VenueError::LotSize(_)));

        let notional = map_http_error(
            StatusCode::BAD_REQUEST,
            None,
            r#"{"code":-1013,"msg":"Filter failure: NOTIONAL"}"#,
        );
        assert!(matches!(notional, VenueError::MinNotional(_)));

        let funds = map_http_error(
            StatusCode::BAD_REQUEST,
            None,
            r#"{"code":-2010,"msg":"Account has insufficient balance for requested action."}"#,
        );
        assert!(matches!(funds, VenueError::InsufficientFunds(_)));
    }

    #[test]
    fn test_error_mapping_region_and_rate() {
        assert!(matches!(
            map_http_error(StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS, None, ""),
            VenueError::RegionBlock
        ));
        match map_http_error(StatusCode::TOO_MANY_REQUESTS, Some(3), "") {
            VenueError::RateLimit { retry_after_ms } => assert_eq!(retry_after_ms, 3_000),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_error_mapping_not_found_and_fatal() {
        assert!(matches!(
            map_http_error(
                StatusCode::BAD_REQUEST,
                None,
                r#"{"code":-2013,"msg":"Order does not exist."}"#
            ),
            VenueError::NotFound
        ));
        assert!(matches!(
            map_http_error(
                StatusCode::UNAUTHORIZED,
                None,
                r#"{"code":-2015,"msg":"Invalid API-key, IP, or permissions for action."}"#
            ),
            VenueError::Fatal(_)
        ));
    }

    #[test]
    fn test_parse_symbol_info_filters() {
        let entry = json!({
            "symbol": "FOOUSDT",
            "baseAsset": "FOO",
            "quoteAsset": "USDT",
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.001"},
                {"filterType": "LOT_SIZE", "stepSize": "0.01", "minQty": "0.1"},
                {"filterType": "NOTIONAL", "minNotional": "5"}
            ]
        });
        let info = parse_symbol_info(&entry).unwrap();
        assert_eq!(info.tick_size, dec!(0.001));
        assert_eq!(info.step_size, dec!(0.01));
        assert_eq!(info.min_qty, dec!(0.1));
        assert_eq!(info.min_notional, dec!(5));
        assert_eq!(info.price_precision, 3);
        assert_eq!(info.quantity_precision, 2);
    }

    #[test]
    fn test_parse_kline_row() {
        let row = json!([1700000000000i64, "9.5", "10.5", "9.1", "10.0", "1234.5", 1700000059999i64]);
        let k = parse_kline(&row).unwrap();
        assert_eq!(k.close, dec!(10.0));
        assert_eq!(k.volume, dec!(1234.5));
    }

    #[test]
    fn test_format_decimal_strips_trailing_zeros() {
        assert_eq!(format_decimal(dec!(1.0200)), "1.02");
        assert_eq!(format_decimal(dec!(10.000)), "10");
    }

    #[test]
    fn test_parse_venue_order() {
        let v = json!({
            "orderId": 42u64,
            "symbol": "FOOUSDT",
            "side": "SELL",
            "price": "9.898",
            "origQty": "1.02",
            "executedQty": "1.02",
            "cummulativeQuoteQty": "10.098",
            "status": "FILLED",
            "updateTime": 1700000000123i64
        });
        let o = parse_venue_order(&v).unwrap();
        assert_eq!(o.side, Side::Sell);
        assert_eq!(o.status, OrderStatus::Filled);
        assert_eq!(o.executed_price(), dec!(9.9));
        let _ = client(); // constructor smoke
    }
}
