use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use sandwich::config::{AgentMode, Config, LocalConfig, RelayConfig};
use sandwich::core::observability;
use sandwich::ip_feed::RangeFeed;
use sandwich::ip_range::SharedRangeTable;
use sandwich::local_proxy::LocalAgent;
use sandwich::logging;
use sandwich::remote_proxy::RemoteProxy;

const DEFAULT_CONFIG_PATH: &str = "sandwich.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SANDWICH_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&path).with_context(|| format!("loading {}", path))?;
    logging::init(config.log_level);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    let cancel = CancellationToken::new();

    let agent = async {
        match config.mode {
            AgentMode::Local => run_local(&config.local, listener, cancel.clone()).await,
            AgentMode::Relay => run_relay(&config.relay, listener).await,
        }
    };

    tokio::select! {
        res = agent => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            cancel.cancel();
        }
    }
    Ok(())
}

async fn run_local(config: &LocalConfig, listener: TcpListener, cancel: CancellationToken) -> anyhow::Result<()> {
    let LocalAgent { proxy, table, feed } = LocalAgent::from_config(config)?;
    tokio::spawn(refresh_loop(feed, table, config.refresh_interval(), cancel));
    proxy.run(listener).await?;
    Ok(())
}

async fn run_relay(config: &RelayConfig, listener: TcpListener) -> anyhow::Result<()> {
    let proxy = Arc::new(RemoteProxy::from_config(config)?);
    proxy.run(listener, None).await?;
    Ok(())
}

/// Refreshes the public range table on every tick, the first one immediately.
async fn refresh_loop(feed: RangeFeed, table: Arc<SharedRangeTable>, every: std::time::Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match feed.refresh(&table, &cancel).await {
                    Ok(_) => {}
                    Err(e) => {
                        observability::record_error(e.class());
                        tracing::warn!(ranges = table.len(), "ip range refresh failed, keeping current table: {}", e);
                    }
                }
                let snapshot = observability::snapshot();
                tracing::info!(
                    active = snapshot.active_connections(),
                    direct = snapshot.direct_routes,
                    relay = snapshot.relay_routes,
                    camouflage = snapshot.camouflage_served,
                    doh_escalations = snapshot.doh_escalations,
                    "traffic summary"
                );
            }
        }
    }
}
