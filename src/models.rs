use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Storage key of a device: the first segment of every id under it.
pub type DeviceKey = String;

/// Marker every camera advertises in its WS-Discovery types.
pub const NVT_TYPE: &str = "NetworkVideoTransmitter";

/// Persisted device record, stored as the `native` part of the device object.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Device {
    pub urn: Option<String>,
    pub ip: String,
    pub port: Option<u16>,
    pub service: String,
    pub user: String,
    pub password: String,
    pub hardware: Option<String>,
    pub location: Option<String>,
    pub types: Vec<String>,
    pub scopes: Vec<String>,
    // refreshed on every successful connect
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    pub serial_number: Option<String>,
    pub hardware_id: Option<String>,
    pub profile_s: Option<bool>,
}

impl Device {
    pub fn from_discovery(record: &DiscoveryRecord) -> Self {
        Device {
            urn: record.urn.clone(),
            ip: record.address.clone(),
            service: record.service.clone(),
            hardware: record.hardware.clone(),
            location: record.location.clone(),
            types: record.types.clone(),
            scopes: record.scopes.clone(),
            ..Default::default()
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.user.is_empty() && !self.password.is_empty()
    }
}

/// One answer of a WS-Discovery probe.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct DiscoveryRecord {
    pub urn: Option<String>,
    pub name: Option<String>,
    pub address: String,
    /// First advertised XAddr
    pub service: String,
    pub hardware: Option<String>,
    pub location: Option<String>,
    pub types: Vec<String>,
    pub scopes: Vec<String>,
}

impl DiscoveryRecord {
    pub fn is_network_video_transmitter(&self) -> bool {
        self.types.iter().any(|t| t.contains(NVT_TYPE))
    }

    /// Trailing part of the urn after the last `-`, usually the serial number.
    pub fn urn_serial(&self) -> Option<&str> {
        self.urn
            .as_deref()
            .and_then(|urn| urn.rsplit('-').next())
            .filter(|s| !s.is_empty())
    }
}

// --- Capability snapshot ---

/// Everything read from a device right after connecting.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct CapabilitySnapshot {
    pub address: String,
    pub device_information: DeviceInformation,
    pub profiles: Vec<Profile>,
    /// Token of the profile the device reports as its default
    pub default_profile_token: Option<String>,
    pub ptz: Option<PtzService>,
}

impl CapabilitySnapshot {
    /// PTZ is mirrored only when the device has a PTZ service and some
    /// profile carries a PTZ configuration. The default profile wins.
    pub fn ptz_profile_token(&self) -> Option<&str> {
        self.ptz.as_ref()?;
        self.default_index()
            .map(|i| &self.profiles[i])
            .filter(|p| p.has_ptz())
            .or_else(|| self.profiles.iter().find(|p| p.has_ptz()))
            .map(|p| p.token.as_str())
    }

    /// Position of the one default profile: the first carrying the reported
    /// token, else the first profile.
    pub fn default_index(&self) -> Option<usize> {
        if self.profiles.is_empty() {
            return None;
        }
        let reported = self.default_profile_token.as_deref();
        Some(
            self.profiles
                .iter()
                .position(|p| Some(p.token.as_str()) == reported)
                .unwrap_or(0),
        )
    }

    pub fn is_default(&self, index: usize) -> bool {
        self.default_index() == Some(index)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct DeviceInformation {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    pub serial_number: Option<String>,
    pub hardware_id: Option<String>,
    /// Scope-reported display name
    pub name: Option<String>,
    pub profile_s: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PtzService {
    pub xaddr: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Profile {
    pub name: String,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_source_configuration: Option<VideoSourceConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_source_configuration: Option<AudioSourceConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_encoder_configuration: Option<VideoEncoderConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_encoder_configuration: Option<AudioEncoderConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptz_configuration: Option<PtzConfigurationRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_uri: Option<MediaUri>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_uri: Option<MediaUri>,
}

impl Profile {
    pub fn has_ptz(&self) -> bool {
        self.ptz_configuration.is_some()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct VideoSourceConfiguration {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq)]
pub struct Bounds {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct AudioSourceConfiguration {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_count: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct VideoEncoderConfiguration {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h264: Option<H264Configuration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_control: Option<RateControl>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multicast: Option<Multicast>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_timeout: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct H264Configuration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gov_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h264_profile: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct RateControl {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate_limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_interval: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate_limit: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Multicast {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_start: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct AudioEncoderConfiguration {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multicast: Option<Multicast>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_timeout: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PtzConfigurationRef {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_timeout: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct MediaUri {
    pub uri: String,
    pub invalid_after_connect: bool,
    pub invalid_after_reboot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

// --- PTZ ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq)]
pub struct PtzVector {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct AxisRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PtzConfiguration {
    pub token: String,
    pub name: Option<String>,
    pub node_token: Option<String>,
    pub default_speed: Option<PtzVector>,
    pub default_timeout: Option<String>,
    pub pan_range: Option<AxisRange>,
    pub tilt_range: Option<AxisRange>,
    pub zoom_range: Option<AxisRange>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PtzPosition {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PtzStatus {
    pub position: Option<PtzPosition>,
    pub move_status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Preset {
    pub token: String,
    pub name: String,
}

/// Which reference frame `start_movement` uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveReference {
    Absolute,
    Relative,
}

impl MoveReference {
    pub fn from_state(value: Option<f64>) -> Self {
        match value {
            Some(v) if v.round() as i64 == 1 => MoveReference::Relative,
            _ => MoveReference::Absolute,
        }
    }
}

// --- Network / events / audio ---

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct NetworkInterface {
    pub token: String,
    pub name: Option<String>,
    pub enabled: bool,
    pub hw_address: Option<String>,
    pub ipv4: Option<Ipv4Settings>,
    pub ipv6: Option<Ipv6Settings>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Ipv4Settings {
    pub enabled: Option<bool>,
    pub manual: Option<String>,
    pub from_dhcp: Option<String>,
    pub link_local: Option<String>,
    pub dhcp: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Ipv6Settings {
    pub enabled: Option<bool>,
    /// DHCPv6 mode: Auto, Stateful, Stateless or Off
    pub dhcp: Option<String>,
    pub manual: Option<String>,
    pub from_dhcp: Option<String>,
    pub link_local: Option<String>,
    pub accept_router_advert: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct NetworkProtocol {
    pub name: String,
    pub enabled: bool,
    pub port: Vec<u16>,
}

/// Event service capabilities; only the reported flags are set.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct EventCapabilities {
    pub properties: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct AudioOutput {
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    System,
    Access,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::System => "System",
            LogType::Access => "Access",
        }
    }

    pub fn state_id(&self) -> &'static str {
        match self {
            LogType::System => "systemlog",
            LogType::Access => "accesslog",
        }
    }
}

// --- Inbound messages ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "command", content = "message", rename_all = "camelCase")]
pub enum AdapterMessage {
    AddDevice(AddDeviceRequest),
    UpdateDevice(BTreeMap<DeviceKey, UpdateDeviceRequest>),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AddDeviceRequest {
    pub ip: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct UpdateDeviceRequest {
    pub name: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
}
