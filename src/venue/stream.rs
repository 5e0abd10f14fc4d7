//! User-data stream listener.
//!
//! One task per user: obtains a listen key over REST, connects the WS,
//! keeps the key alive on a timer, and forwards `executionReport` events as
//! normalized `OrderUpdate`s. The stream is best-effort; the reconciliation
//! sweep is the authority for anything missed here.
//!
//! Reconnects use jittered exponential backoff and always mint a fresh
//! listen key (the old one may have expired with the connection).

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::venue::rest::RestClient;
use crate::venue::types::{OrderStatus, OrderUpdate};

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WS endpoint base, e.g. `wss://stream.example.com:9443`.
    pub ws_base_url: String,
    /// Listen-key keepalive cadence.
    pub keepalive_interval: Duration,
    pub connect_timeout: Duration,
}

/// Long-lived stream task for one user session.
pub struct UserStream {
    cfg: StreamConfig,
    rest: Arc<RestClient>,
    update_tx: mpsc::Sender<OrderUpdate>,
}

impl UserStream {
    pub fn new(cfg: StreamConfig, rest: Arc<RestClient>, update_tx: mpsc::Sender<OrderUpdate>) -> Self {
        Self { cfg, rest, update_tx }
    }

    /// Main loop: runs until the receiving side goes away.
    pub async fn run(self) {
        info!("📡 user stream task started ({})", self.cfg.ws_base_url);
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.connect_and_listen().await {
                Ok(()) => {
                    info!("📡 user stream closed, reconnecting");
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    warn!("📡 user stream error: {e:#}");
                }
            }
            if self.update_tx.is_closed() {
                info!("📡 update channel closed, stream task exiting");
                return;
            }
            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
            tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
            backoff = (backoff * 2).min(Duration::from_secs(60));
        }
    }

    async fn connect_and_listen(&self) -> anyhow::Result<()> {
        let key = self.rest.create_listen_key().await?;
        let url = format!("{}/ws/{}", self.cfg.ws_base_url, key);

        let (ws, _resp) = tokio::time::timeout(self.cfg.connect_timeout, connect_async(&url))
            .await
            .map_err(|_| anyhow::anyhow!("ws connect timeout"))??;
        info!("📡 user stream connected");
        let (_write, mut read) = ws.split();

        let mut keepalive = tokio::time::interval(self.cfg.keepalive_interval);
        keepalive.reset(); // first tick should wait a full interval

        loop {
            tokio::select! {
                _ = keepalive.tick() => {
                    if let Err(e) = self.rest.keepalive_listen_key(&key).await {
                        warn!("📡 listen-key keepalive failed: {e}; reconnecting with fresh key");
                        return Ok(());
                    }
                    debug!("📡 listen key refreshed");
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(value) = serde_json::from_str::<Value>(&text) {
                                if let Some(update) = parse_execution_report(&value) {
                                    if self.update_tx.send(update).await.is_err() {
                                        return Ok(());
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("📡 user stream closed by venue");
                            return Ok(());
                        }
                        Some(Ok(_)) => {} // ping/pong handled by tungstenite
                        Some(Err(e)) => anyhow::bail!("ws read: {e}"),
                    }
                }
            }
        }
    }
}

/// Parse an `executionReport` payload. Non-report events return `None`.
pub fn parse_execution_report(v: &Value) -> Option<OrderUpdate> {
    if v.get("e").and_then(Value::as_str) != Some("executionReport") {
        return None;
    }
    let side = v.get("S").and_then(Value::as_str)?.parse().ok()?;
    Some(OrderUpdate {
        symbol: v.get("s").and_then(Value::as_str)?.to_string(),
        venue_order_id: v.get("i").and_then(Value::as_u64)?,
        side,
        status: OrderStatus::from_wire(v.get("X").and_then(Value::as_str)?),
        executed_qty: dec(v.get("z"))?,
        last_price: dec(v.get("L")).unwrap_or_default(),
        cummulative_quote_qty: dec(v.get("Z")).unwrap_or_default(),
        commission: dec(v.get("n")).unwrap_or_default(),
        commission_asset: v.get("N").and_then(Value::as_str).map(String::from),
        event_time: v.get("E").and_then(Value::as_i64).unwrap_or(0),
    })
}

fn dec(v: Option<&Value>) -> Option<rust_decimal::Decimal> {
    let v = v?;
    if let Some(s) = v.as_str() {
        return s.parse().ok();
    }
    v.as_f64().and_then(|f| rust_decimal::Decimal::try_from(f).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_parse_execution_report_fill() {
        let v = json!({
            "e": "executionReport",
            "E": 1700000000500i64,
            "s": "FOOUSDT",
            "S": "BUY",
            "i": 4293153u64,
            "X": "FILLED",
            "l": "1.020408",
            "z": "1.020408",
            "L": "9.80",
            "Z": "9.99999840",
            "n": "0.001",
            "N": "FOO"
        });
        let u = parse_execution_report(&v).unwrap();
        assert_eq!(u.venue_order_id, 4293153);
        assert_eq!(u.status, OrderStatus::Filled);
        assert_eq!(u.executed_qty, dec!(1.020408));
        assert_eq!(u.last_price, dec!(9.80));
        assert_eq!(u.commission_asset.as_deref(), Some("FOO"));
        assert_eq!(u.event_time, 1700000000500);
    }

    #[test]
    fn test_non_report_events_ignored() {
        assert!(parse_execution_report(&json!({"e": "outboundAccountPosition"})).is_none());
        assert!(parse_execution_report(&json!({"result": null, "id": 1})).is_none());
    }

    #[test]
    fn test_partial_fill_status() {
        let v = json!({
            "e": "executionReport",
            "E": 1i64, "s": "FOOUSDT", "S": "SELL", "i": 7u64,
            "X": "PARTIALLY_FILLED",
            "z": "0.5", "L": "9.9", "Z": "4.95", "n": "0", "N": null
        });
        let u = parse_execution_report(&v).unwrap();
        assert_eq!(u.status, OrderStatus::PartiallyFilled);
        assert!(u.commission_asset.is_none());
    }
}
