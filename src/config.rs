//! Engine configuration, loaded once from the environment at startup.

use std::time::Duration;

/// Process-wide settings. Everything has a default so the engine boots in a
/// development environment with nothing but credentials set.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// SQLite database path.
    pub database_path: String,

    /// Live venue endpoints.
    pub rest_base_url: String,
    pub ws_base_url: String,

    /// Test-mode venue endpoints (used by bots created with `test_mode`).
    pub testnet_rest_base_url: String,
    pub testnet_ws_base_url: String,

    /// Ordered egress proxy URLs. Empty means direct connection.
    pub proxy_urls: Vec<String>,

    /// Clock resync cadence.
    pub clock_sync_interval: Duration,

    /// Per-bot reconciliation tick cadence.
    pub reconcile_interval: Duration,

    /// Listen-key keepalive cadence.
    pub listen_key_refresh: Duration,

    /// Signed-request recv window in milliseconds.
    pub recv_window_ms: u64,

    /// Timeout applied to every outbound venue call.
    pub request_timeout: Duration,

    /// Shutdown grace period before BC tasks are aborted.
    pub shutdown_grace: Duration,

    /// Oracle fallback: band half-width percent around current price.
    pub oracle_default_band_pct: f64,
    /// Oracle fallback: rung count.
    pub oracle_default_levels: u32,
    /// Oracle fallback: profit per grid percent.
    pub oracle_default_profit_pct: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            database_path: "gridbroker.db".into(),
            rest_base_url: "https://api.binance.com".into(),
            ws_base_url: "wss://stream.binance.com:9443".into(),
            testnet_rest_base_url: "https://testnet.binance.vision".into(),
            testnet_ws_base_url: "wss://stream.testnet.binance.vision".into(),
            proxy_urls: Vec::new(),
            clock_sync_interval: Duration::from_secs(300),
            reconcile_interval: Duration::from_secs(60),
            listen_key_refresh: Duration::from_secs(30 * 60),
            recv_window_ms: 5_000,
            request_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
            oracle_default_band_pct: 5.0,
            oracle_default_levels: 10,
            oracle_default_profit_pct: 1.0,
        }
    }
}

impl EngineSettings {
    /// Load overrides from environment variables (if set).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("GRID_DATABASE_PATH") {
            cfg.database_path = v;
        }
        if let Ok(v) = std::env::var("GRID_REST_BASE_URL") {
            cfg.rest_base_url = v;
        }
        if let Ok(v) = std::env::var("GRID_WS_BASE_URL") {
            cfg.ws_base_url = v;
        }
        if let Ok(v) = std::env::var("GRID_TESTNET_REST_BASE_URL") {
            cfg.testnet_rest_base_url = v;
        }
        if let Ok(v) = std::env::var("GRID_TESTNET_WS_BASE_URL") {
            cfg.testnet_ws_base_url = v;
        }
        if let Ok(v) = std::env::var("GRID_PROXY_URLS") {
            cfg.proxy_urls = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(v) = std::env::var("GRID_CLOCK_SYNC_SECS") {
            if let Ok(s) = v.parse() {
                cfg.clock_sync_interval = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("GRID_RECONCILE_SECS") {
            if let Ok(s) = v.parse() {
                cfg.reconcile_interval = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("GRID_LISTEN_KEY_REFRESH_SECS") {
            if let Ok(s) = v.parse() {
                cfg.listen_key_refresh = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("GRID_RECV_WINDOW_MS") {
            if let Ok(ms) = v.parse() {
                cfg.recv_window_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("GRID_REQUEST_TIMEOUT_SECS") {
            if let Ok(s) = v.parse() {
                cfg.request_timeout = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("GRID_SHUTDOWN_GRACE_SECS") {
            if let Ok(s) = v.parse() {
                cfg.shutdown_grace = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("GRID_ORACLE_BAND_PCT") {
            if let Ok(f) = v.parse() {
                cfg.oracle_default_band_pct = f;
            }
        }
        if let Ok(v) = std::env::var("GRID_ORACLE_LEVELS") {
            if let Ok(n) = v.parse() {
                cfg.oracle_default_levels = n;
            }
        }
        if let Ok(v) = std::env::var("GRID_ORACLE_PROFIT_PCT") {
            if let Ok(f) = v.parse() {
                cfg.oracle_default_profit_pct = f;
            }
        }
        cfg
    }

    /// REST base for a bot, honoring test mode.
    pub fn rest_base(&self, test_mode: bool) -> &str {
        if test_mode {
            &self.testnet_rest_base_url
        } else {
            &self.rest_base_url
        }
    }

    /// WS base for a bot, honoring test mode.
    pub fn ws_base(&self, test_mode: bool) -> &str {
        if test_mode {
            &self.testnet_ws_base_url
        } else {
            &self.ws_base_url
        }
    }
}
