use anyhow::Context;
use onvif_state_adapter::models::AdapterMessage;
use onvif_state_adapter::onvif::{SoapConnector, SubnetProbe};
use onvif_state_adapter::store::SqliteStore;
use onvif_state_adapter::{Adapter, AdapterConfig};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = AdapterConfig::resolve_path(std::env::args().nth(1));
    let config = AdapterConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.adapter.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = SqliteStore::open(&config.adapter.database_path, &config.adapter.namespace)
        .with_context(|| format!("failed to open {}", config.adapter.database_path.display()))?;
    let connector = SoapConnector::new(config.onvif.clone());
    let probe = SubnetProbe::new(&config.discovery);
    let adapter = Adapter::new(config, Arc::new(store), Arc::new(connector), Arc::new(probe));

    // Host messages arrive as one JSON object per line on stdin
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<AdapterMessage>(&line) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "ignoring malformed message"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to read stdin");
                    break;
                }
            }
        }
    });

    adapter
        .run(rx, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
        })
        .await?;
    Ok(())
}
