//! Engine entrypoint: wires settings, store, clock, proxy pool and the
//! gateway factory together, revives persisted bots, and runs until SIGINT.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gridbroker::venue::rest::{RestClient, RestConfig};
use gridbroker::venue::types::ApiCredentials;
use gridbroker::{
    ClockHandle, EngineSettings, EnvVault, GridEngine, LiveGatewayFactory, ProxyPool,
    ProxyPoolConfig, SqliteStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = EngineSettings::from_env();
    info!(
        "🚀 gridbroker starting | venue {} | db {} | {} prox{}",
        settings.rest_base_url,
        settings.database_path,
        settings.proxy_urls.len(),
        if settings.proxy_urls.len() == 1 { "y" } else { "ies" },
    );

    let store = Arc::new(SqliteStore::open(&settings.database_path)?);
    let clock = ClockHandle::new();
    let pool = Arc::new(ProxyPool::new(
        settings.proxy_urls.clone(),
        ProxyPoolConfig::default(),
    ));

    // Unauthenticated client for server time and proxy probes.
    let public_rest = Arc::new(RestClient::new(
        RestConfig {
            base_url: settings.rest_base_url.clone(),
            recv_window_ms: settings.recv_window_ms,
            timeout: settings.request_timeout,
        },
        ApiCredentials {
            api_key: String::new(),
            api_secret: String::new().into(),
        },
        clock.clone(),
        None,
    )?);

    // Initial clock sync before any signed request goes out.
    match public_rest.server_time().await {
        Ok(server_ms) => clock.observe_server_time(server_ms),
        Err(e) => warn!("🕒 initial clock sync failed: {e}"),
    }
    {
        let clock = clock.clone();
        let rest = public_rest.clone();
        let interval = settings.clock_sync_interval;
        tokio::spawn(async move {
            gridbroker::venue::clock::run_resync_loop(clock, interval, move || {
                let rest = rest.clone();
                async move { rest.server_time().await }
            })
            .await;
        });
    }

    // Probe cooled-down proxies back into rotation.
    {
        let pool = pool.clone();
        let settings_probe = settings.clone();
        let clock_probe = clock.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                for proxy_url in pool.due_probes() {
                    let healthy = RestClient::new(
                        RestConfig {
                            base_url: settings_probe.rest_base_url.clone(),
                            recv_window_ms: settings_probe.recv_window_ms,
                            timeout: settings_probe.request_timeout,
                        },
                        ApiCredentials {
                            api_key: String::new(),
                            api_secret: String::new().into(),
                        },
                        clock_probe.clone(),
                        Some(proxy_url.clone()),
                    );
                    let ok = match healthy {
                        Ok(client) => client.ping().await.is_ok(),
                        Err(_) => false,
                    };
                    pool.record_probe(&proxy_url, ok);
                }
            }
        });
    }

    let factory = Arc::new(LiveGatewayFactory {
        settings: settings.clone(),
        vault: Arc::new(EnvVault),
        pool: pool.clone(),
        clock: clock.clone(),
    });

    let engine = Arc::new(GridEngine::new(
        settings.clone(),
        store,
        factory,
        pool,
        clock,
    ));
    let revived = engine.bootstrap().await?;
    info!("🚀 engine up with {revived} bot(s) under management");

    tokio::signal::ctrl_c().await?;
    info!("🛑 SIGINT received; draining bot tasks");
    engine.shutdown().await;
    info!("🛑 gridbroker stopped");
    Ok(())
}
