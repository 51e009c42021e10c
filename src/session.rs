use crate::error::Result;
use crate::models::{Device, DeviceKey};
use crate::onvif::{ConnectParams, OnvifConnector, OnvifDevice};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Open device sessions keyed by device key.
pub struct SessionPool {
    connector: Arc<dyn OnvifConnector>,
    sessions: RwLock<HashMap<DeviceKey, Arc<dyn OnvifDevice>>>,
}

impl SessionPool {
    pub fn new(connector: Arc<dyn OnvifConnector>) -> Self {
        Self {
            connector,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Always opens a fresh session and replaces any cached one.
    pub async fn connect(&self, key: &str, device: &Device) -> Result<Arc<dyn OnvifDevice>> {
        let params = ConnectParams::for_device(device);
        let session = self.connector.connect(&params).await?;
        self.sessions
            .write()
            .await
            .insert(key.to_string(), session.clone());
        Ok(session)
    }

    pub async fn get_or_connect(&self, key: &str, device: &Device) -> Result<Arc<dyn OnvifDevice>> {
        if let Some(session) = self.sessions.read().await.get(key) {
            return Ok(session.clone());
        }
        debug!(device = key, ip = %device.ip, "no open session, connecting");
        self.connect(key, device).await
    }

    pub async fn forget(&self, key: &str) {
        self.sessions.write().await.remove(key);
    }

    pub async fn is_connected(&self, key: &str) -> bool {
        self.sessions.read().await.contains_key(key)
    }
}
