//! Egress proxy pool.
//!
//! Each active user is sticky-assigned to one healthy proxy. A proxy that
//! fails with a region-block, connectivity, or rate-limit signal is placed
//! into cooldown (30 s doubling to 5 min) and the user is reassigned to the
//! next healthy proxy round-robin. A cooled-down proxy rejoins rotation only
//! after its cooldown elapses AND a synthetic probe against the venue's
//! exchange-info endpoint succeeds.
//!
//! All operations are constant time under one mutex.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::VenueError;

/// Failure kinds that implicate the proxy itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyFault {
    RegionBlock,
    ConnectRefused,
    DnsFail,
    Timeout,
    RateLimit,
}

impl ProxyFault {
    /// Classify a venue error; `None` means the proxy is not at fault.
    pub fn classify(err: &VenueError) -> Option<Self> {
        match err {
            VenueError::RegionBlock => Some(ProxyFault::RegionBlock),
            VenueError::RateLimit { .. } => Some(ProxyFault::RateLimit),
            VenueError::ProxyFailure(msg) => {
                let m = msg.to_ascii_lowercase();
                if m.contains("dns") {
                    Some(ProxyFault::DnsFail)
                } else if m.contains("refused") {
                    Some(ProxyFault::ConnectRefused)
                } else {
                    Some(ProxyFault::Timeout)
                }
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Healthy,
    /// Cooling down until the stored deadline.
    CoolingDown(Instant),
    /// Cooldown elapsed; waiting for a successful probe.
    AwaitingProbe,
}

#[derive(Debug)]
struct Slot {
    url: String,
    state: SlotState,
    /// Consecutive fault count, drives the cooldown backoff.
    faults: u32,
}

#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    pub cooldown_base: Duration,
    pub cooldown_max: Duration,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            cooldown_base: Duration::from_secs(30),
            cooldown_max: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    slots: Vec<Slot>,
    /// user id → slot index (sticky).
    assignments: HashMap<String, usize>,
    rr_cursor: usize,
}

/// Process-wide pool. Cheap to clone behind an `Arc` by the caller.
pub struct ProxyPool {
    cfg: ProxyPoolConfig,
    inner: Mutex<Inner>,
}

impl ProxyPool {
    pub fn new(urls: Vec<String>, cfg: ProxyPoolConfig) -> Self {
        let slots = urls
            .into_iter()
            .map(|url| Slot {
                url,
                state: SlotState::Healthy,
                faults: 0,
            })
            .collect();
        Self {
            cfg,
            inner: Mutex::new(Inner {
                slots,
                ..Inner::default()
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("proxy pool lock").slots.is_empty()
    }

    /// Sticky acquire. Returns `None` when the pool is configured but no
    /// proxy is currently healthy; callers fail fast rather than wait.
    /// An empty pool also returns `None` (direct connection).
    pub fn acquire(&self, user: &str) -> Option<String> {
        let mut inner = self.inner.lock().expect("proxy pool lock");
        if inner.slots.is_empty() {
            return None;
        }

        if let Some(&idx) = inner.assignments.get(user) {
            if inner.slots[idx].state == SlotState::Healthy {
                return Some(inner.slots[idx].url.clone());
            }
            inner.assignments.remove(user);
        }

        let n = inner.slots.len();
        let start = inner.rr_cursor;
        for step in 0..n {
            let idx = (start + step) % n;
            if inner.slots[idx].state == SlotState::Healthy {
                inner.rr_cursor = (idx + 1) % n;
                inner.assignments.insert(user.to_string(), idx);
                return Some(inner.slots[idx].url.clone());
            }
        }
        None
    }

    /// Report a proxy fault observed while `user` was bound to `proxy_url`.
    /// The slot enters cooldown and the user loses the assignment.
    pub fn report(&self, user: &str, proxy_url: &str, fault: ProxyFault) {
        let mut inner = self.inner.lock().expect("proxy pool lock");
        let Some(idx) = inner.slots.iter().position(|s| s.url == proxy_url) else {
            return;
        };
        let backoff = {
            let slot = &mut inner.slots[idx];
            slot.faults = slot.faults.saturating_add(1);
            let exp = self
                .cfg
                .cooldown_base
                .saturating_mul(1u32 << (slot.faults - 1).min(8));
            let backoff = exp.min(self.cfg.cooldown_max);
            slot.state = SlotState::CoolingDown(Instant::now() + backoff);
            backoff
        };
        inner.assignments.remove(user);
        warn!(
            "🛡️ proxy {proxy_url} cooled down {}s after {fault:?} (user {user} reassigned)",
            backoff.as_secs()
        );
    }

    pub fn release(&self, user: &str) {
        self.inner
            .lock()
            .expect("proxy pool lock")
            .assignments
            .remove(user);
    }

    /// Proxies whose cooldown has elapsed and now need a synthetic probe.
    /// Marks them `AwaitingProbe` so each is handed out once.
    pub fn due_probes(&self) -> Vec<String> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("proxy pool lock");
        let mut due = Vec::new();
        for slot in &mut inner.slots {
            if let SlotState::CoolingDown(until) = slot.state {
                if now >= until {
                    slot.state = SlotState::AwaitingProbe;
                    due.push(slot.url.clone());
                }
            }
        }
        due
    }

    /// Outcome of a synthetic probe. Success restores the slot to rotation;
    /// failure re-enters cooldown with the backoff doubled.
    pub fn record_probe(&self, proxy_url: &str, healthy: bool) {
        let mut inner = self.inner.lock().expect("proxy pool lock");
        let Some(slot) = inner.slots.iter_mut().find(|s| s.url == proxy_url) else {
            return;
        };
        if healthy {
            slot.state = SlotState::Healthy;
            slot.faults = 0;
            info!("🛡️ proxy {proxy_url} back in rotation");
        } else {
            slot.faults = slot.faults.saturating_add(1);
            let exp = self
                .cfg
                .cooldown_base
                .saturating_mul(1u32 << (slot.faults - 1).min(8));
            let backoff = exp.min(self.cfg.cooldown_max);
            slot.state = SlotState::CoolingDown(Instant::now() + backoff);
            warn!(
                "🛡️ proxy {proxy_url} failed probe, cooling another {}s",
                backoff.as_secs()
            );
        }
    }

    /// (healthy, total) counts for diagnostics.
    pub fn health(&self) -> (usize, usize) {
        let inner = self.inner.lock().expect("proxy pool lock");
        let healthy = inner
            .slots
            .iter()
            .filter(|s| s.state == SlotState::Healthy)
            .count();
        (healthy, inner.slots.len())
    }
}
