//! ONVIF protocol client seam.
//!
//! The orchestration code only sees the traits below. [`SoapConnector`] and
//! [`SubnetProbe`] are the SOAP-over-HTTP and WS-Discovery implementations.

pub mod client;
pub mod parse;
pub mod probe;
pub mod soap;

#[cfg(test)]
pub(crate) mod fake;

use crate::error::Result;
use crate::models::{
    AudioOutput, CapabilitySnapshot, Device, DiscoveryRecord, EventCapabilities, LogType,
    NetworkInterface, NetworkProtocol, Preset, PtzConfiguration, PtzStatus, PtzVector,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use client::SoapConnector;
pub use probe::SubnetProbe;

pub const DEFAULT_SERVICE_PATH: &str = "/onvif/device_service";

/// Everything needed to open a session with a device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectParams {
    pub ip: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Device service path, e.g. `/onvif/device_service`
    pub path: Option<String>,
}

impl ConnectParams {
    /// Port and path come from the stored service URL when it parses,
    /// otherwise from the record's own port.
    pub fn for_device(device: &Device) -> Self {
        let service = url::Url::parse(&device.service).ok();
        let port = service
            .as_ref()
            .and_then(|u| u.port())
            .or(device.port);
        let path = service
            .as_ref()
            .map(|u| u.path().to_string())
            .filter(|p| p.len() > 1);
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

        ConnectParams {
            ip: device.ip.clone(),
            port,
            user: non_empty(&device.user),
            password: non_empty(&device.password),
            path,
        }
    }
}

#[async_trait]
pub trait OnvifConnector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn OnvifDevice>>;
}

/// A connected device. Every call is one request/response exchange.
#[async_trait]
pub trait OnvifDevice: Send + Sync {
    fn address(&self) -> &str;

    /// Device information, profiles with their URIs, PTZ service presence.
    async fn snapshot(&self) -> Result<CapabilitySnapshot>;

    // core
    async fn system_reboot(&self) -> Result<String>;
    async fn get_system_log(&self, log_type: LogType) -> Result<String>;
    async fn get_network_interfaces(&self) -> Result<Vec<NetworkInterface>>;
    async fn get_network_protocols(&self) -> Result<Vec<NetworkProtocol>>;

    // media / events
    async fn get_audio_outputs(&self) -> Result<Vec<AudioOutput>>;
    async fn get_event_capabilities(&self) -> Result<EventCapabilities>;

    // ptz
    async fn get_ptz_configurations(&self) -> Result<Vec<PtzConfiguration>>;
    async fn get_ptz_status(&self, profile_token: &str) -> Result<PtzStatus>;
    async fn get_presets(&self, profile_token: &str) -> Result<Vec<Preset>>;
    /// Store the current position. Without `preset_token` a new preset is
    /// created; returns the token the device assigned.
    async fn set_preset(
        &self,
        profile_token: &str,
        preset_name: Option<&str>,
        preset_token: Option<&str>,
    ) -> Result<String>;
    async fn remove_preset(&self, profile_token: &str, preset_token: &str) -> Result<()>;
    async fn goto_preset(&self, profile_token: &str, preset_token: &str, speed: &PtzVector) -> Result<()>;
    async fn absolute_move(&self, profile_token: &str, position: &PtzVector, speed: &PtzVector) -> Result<()>;
    async fn relative_move(&self, profile_token: &str, translation: &PtzVector, speed: &PtzVector) -> Result<()>;
    async fn continuous_move(&self, profile_token: &str, velocity: &PtzVector, timeout: Duration) -> Result<()>;
    async fn stop(&self, profile_token: &str) -> Result<()>;
}

#[async_trait]
pub trait DeviceProbe: Send + Sync {
    async fn probe(&self) -> Result<Vec<DiscoveryRecord>>;
}
