//! Fill ingestor: consumes each user's push stream and dispatches order
//! updates to the owning bot's command channel.
//!
//! Ordering: one consumer task per user stream pushes events in arrival
//! order into per-bot channels, so events for the same venue order are
//! applied in order while different bots proceed in parallel.
//!
//! Backpressure: a full bot channel never drops the event silently; the
//! bot's sweep hint is raised instead, and the next loop iteration runs a
//! reconciliation sweep (pull replaces push).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::messages::BotCommand;
use crate::engine::types::BotId;
use crate::venue::types::OrderUpdate;

/// Route for one venue order: which bot consumes its events.
#[derive(Clone)]
pub struct BotRoute {
    pub bot_id: BotId,
    pub tx: mpsc::Sender<BotCommand>,
    /// Raised when the channel overflows; the bot controller drains it and
    /// runs a reconciliation sweep.
    pub sweep_hint: Arc<AtomicBool>,
}

/// Process-wide index `(owner, venue order id) → bot route`, maintained by
/// bot controllers as they place orders.
#[derive(Clone, Default)]
pub struct RouteTable {
    inner: Arc<RwLock<HashMap<(String, u64), BotRoute>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, owner: &str, venue_order_id: u64, route: BotRoute) {
        self.inner
            .write()
            .expect("route table lock")
            .insert((owner.to_string(), venue_order_id), route);
    }

    pub fn lookup(&self, owner: &str, venue_order_id: u64) -> Option<BotRoute> {
        self.inner
            .read()
            .expect("route table lock")
            .get(&(owner.to_string(), venue_order_id))
            .cloned()
    }

    /// Drop every route owned by a bot (on stop/delete).
    pub fn unregister_bot(&self, bot_id: BotId) {
        self.inner
            .write()
            .expect("route table lock")
            .retain(|_, route| route.bot_id != bot_id);
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("route table lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Consumes one user's stream until it ends. Spawned once per user session
/// by the engine.
pub async fn run_user_stream(
    owner: String,
    mut updates: mpsc::Receiver<OrderUpdate>,
    routes: RouteTable,
) {
    info!("📨 fill ingestor started for user {owner}");
    while let Some(update) = updates.recv().await {
        dispatch(&owner, update, &routes);
    }
    info!("📨 fill ingestor for user {owner} stopped (stream ended)");
}

/// Route a single update. Unknown orders are logged and discarded; the
/// reconciliation sweep owns anything the push path misses.
pub fn dispatch(owner: &str, update: OrderUpdate, routes: &RouteTable) {
    let Some(route) = routes.lookup(owner, update.venue_order_id) else {
        debug!(
            "📨 no bot for {owner}/{} ({:?}); dropping push event",
            update.venue_order_id, update.status
        );
        return;
    };

    match route.tx.try_send(BotCommand::OrderUpdate(update)) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            route.sweep_hint.store(true, Ordering::Release);
            warn!(
                "📨 bot {} inbox full; raised sweep hint instead of dropping",
                route.bot_id
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("📨 bot {} gone; event discarded", route.bot_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::types::{OrderStatus, Side};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn update(id: u64) -> OrderUpdate {
        OrderUpdate {
            symbol: "FOOUSDT".into(),
            venue_order_id: id,
            side: Side::Buy,
            status: OrderStatus::Filled,
            executed_qty: dec!(1),
            last_price: dec!(9.8),
            cummulative_quote_qty: dec!(9.8),
            commission: dec!(0),
            commission_asset: None,
            event_time: 1,
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_owner() {
        let routes = RouteTable::new();
        let (tx, mut rx) = mpsc::channel(4);
        let bot_id = Uuid::new_v4();
        routes.register(
            "alice",
            7,
            BotRoute {
                bot_id,
                tx,
                sweep_hint: Arc::new(AtomicBool::new(false)),
            },
        );

        dispatch("alice", update(7), &routes);
        match rx.recv().await {
            Some(BotCommand::OrderUpdate(u)) => assert_eq!(u.venue_order_id, 7),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_same_id_other_user_dropped() {
        let routes = RouteTable::new();
        let (tx, mut rx) = mpsc::channel(4);
        routes.register(
            "alice",
            7,
            BotRoute {
                bot_id: Uuid::new_v4(),
                tx,
                sweep_hint: Arc::new(AtomicBool::new(false)),
            },
        );

        dispatch("bob", update(7), &routes);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_overflow_raises_sweep_hint() {
        let routes = RouteTable::new();
        let (tx, _rx) = mpsc::channel(1);
        let hint = Arc::new(AtomicBool::new(false));
        routes.register(
            "alice",
            7,
            BotRoute {
                bot_id: Uuid::new_v4(),
                tx,
                sweep_hint: hint.clone(),
            },
        );

        dispatch("alice", update(7), &routes); // fills the buffer
        dispatch("alice", update(7), &routes); // overflows
        assert!(hint.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_unregister_bot_clears_routes() {
        let routes = RouteTable::new();
        let (tx, _rx) = mpsc::channel(1);
        let bot_id = Uuid::new_v4();
        for venue_id in [1, 2, 3] {
            routes.register(
                "alice",
                venue_id,
                BotRoute {
                    bot_id,
                    tx: tx.clone(),
                    sweep_hint: Arc::new(AtomicBool::new(false)),
                },
            );
        }
        assert_eq!(routes.len(), 3);
        routes.unregister_bot(bot_id);
        assert!(routes.is_empty());
    }
}
