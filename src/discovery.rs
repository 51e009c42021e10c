use crate::error::Result;
use crate::models::DiscoveryRecord;
use crate::onvif::DeviceProbe;
use crate::registry::{DeviceRegistry, Outcome};
use crate::session::SessionPool;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Probe, keep the video transmitters, reconcile each against the registry.
/// A device found at a new address loses its open session.
pub struct DiscoveryLoop {
    probe: Arc<dyn DeviceProbe>,
    registry: Arc<DeviceRegistry>,
    sessions: Arc<SessionPool>,
    running: Mutex<()>,
}

impl DiscoveryLoop {
    pub fn new(probe: Arc<dyn DeviceProbe>, registry: Arc<DeviceRegistry>, sessions: Arc<SessionPool>) -> Self {
        Self {
            probe,
            registry,
            sessions,
            running: Mutex::new(()),
        }
    }

    /// One discovery pass. Returns the camera records that were reconciled;
    /// a pass requested while another is running returns nothing.
    pub async fn auto_discover(&self) -> Result<Vec<DiscoveryRecord>> {
        let Ok(_guard) = self.running.try_lock() else {
            debug!("discovery already running");
            return Ok(Vec::new());
        };

        let records = self.probe.probe().await?;
        let total = records.len();
        let cameras: Vec<DiscoveryRecord> = records
            .into_iter()
            .filter(|r| r.is_network_video_transmitter())
            .collect();
        if cameras.len() < total {
            debug!(ignored = total - cameras.len(), "ignoring non-camera devices");
        }

        let mut reconciled = Vec::with_capacity(cameras.len());
        for record in cameras {
            match self.registry.reconcile_record(&record).await {
                Ok(found) => {
                    if found.outcome == Outcome::Moved && self.sessions.is_connected(&found.key).await {
                        info!(device = %found.key, ip = %record.address, "device moved, dropping session");
                        self.sessions.forget(&found.key).await;
                    }
                    self.report_unconfigured(&found.key).await;
                    reconciled.push(record);
                }
                Err(e) => warn!(ip = %record.address, urn = ?record.urn, error = %e, "failed to reconcile device"),
            }
        }

        info!(found = total, cameras = reconciled.len(), "discovery finished");
        Ok(reconciled)
    }

    async fn report_unconfigured(&self, key: &str) {
        match self.registry.load(key).await {
            Ok(device) if !device.has_credentials() => {
                info!(device = key, ip = %device.ip, "device unconfigured, waiting for credentials")
            }
            Ok(_) => {}
            Err(e) => warn!(device = key, error = %e, "failed to read device record"),
        }
    }
}
