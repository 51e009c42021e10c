//! In-process doubles for the ONVIF seam.

use super::{ConnectParams, DeviceProbe, OnvifConnector, OnvifDevice};
use crate::error::{AdapterError, Result};
use crate::models::{
    AudioOutput, AxisRange, CapabilitySnapshot, DeviceInformation, DiscoveryRecord,
    EventCapabilities, LogType, MediaUri, NetworkInterface, NetworkProtocol, Preset, Profile,
    PtzConfiguration, PtzConfigurationRef, PtzService, PtzStatus, PtzVector,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Reboot,
    SystemLog(LogType),
    AbsoluteMove { profile: String, position: PtzVector, speed: PtzVector },
    RelativeMove { profile: String, translation: PtzVector, speed: PtzVector },
    ContinuousMove { profile: String, velocity: PtzVector, timeout: Duration },
    Stop { profile: String },
    GotoPreset { preset: String, speed: PtzVector },
    SetPreset { name: Option<String>, token: Option<String> },
    RemovePreset { preset: String },
}

pub struct FakeDevice {
    pub address: String,
    pub snapshot: Mutex<CapabilitySnapshot>,
    pub ptz_configurations: Mutex<Vec<PtzConfiguration>>,
    pub presets: Mutex<Vec<Preset>>,
    pub status: Mutex<PtzStatus>,
    pub interfaces: Mutex<Vec<NetworkInterface>>,
    pub protocols: Mutex<Vec<NetworkProtocol>>,
    pub audio_outputs: Mutex<Vec<AudioOutput>>,
    pub events: Mutex<EventCapabilities>,
    unsupported: Mutex<HashSet<&'static str>>,
    faulty: Mutex<HashSet<&'static str>>,
    calls: Mutex<Vec<Call>>,
    next_preset: Mutex<u32>,
}

impl FakeDevice {
    pub fn new(snapshot: CapabilitySnapshot) -> Self {
        Self {
            address: snapshot.address.clone(),
            snapshot: Mutex::new(snapshot),
            ptz_configurations: Mutex::new(Vec::new()),
            presets: Mutex::new(Vec::new()),
            status: Mutex::new(PtzStatus::default()),
            interfaces: Mutex::new(Vec::new()),
            protocols: Mutex::new(Vec::new()),
            audio_outputs: Mutex::new(Vec::new()),
            events: Mutex::new(EventCapabilities::default()),
            unsupported: Mutex::new(HashSet::new()),
            faulty: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            next_preset: Mutex::new(100),
        }
    }

    /// A camera with one PTZ-capable profile `p0` and a second plain one.
    pub fn ptz_camera(address: &str) -> Self {
        let device = Self::new(ptz_snapshot(address));
        *device.ptz_configurations.lock().unwrap() = vec![PtzConfiguration {
            token: "ptz_0".to_string(),
            default_speed: Some(PtzVector { x: 0.5, y: 0.5, z: 0.5 }),
            pan_range: Some(AxisRange { min: -1.0, max: 1.0 }),
            tilt_range: Some(AxisRange { min: -1.0, max: 1.0 }),
            zoom_range: Some(AxisRange { min: 0.0, max: 1.0 }),
            ..Default::default()
        }];
        device
    }

    pub fn plain_camera(address: &str) -> Self {
        Self::new(plain_snapshot(address))
    }

    /// Make `op` answer like a device that does not implement it.
    pub fn unsupported(self, op: &'static str) -> Self {
        self.unsupported.lock().unwrap().insert(op);
        self
    }

    /// Make `op` fail with a protocol fault.
    pub fn faulty(self, op: &'static str) -> Self {
        self.faulty.lock().unwrap().insert(op);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn check(&self, op: &'static str) -> Result<()> {
        if self.unsupported.lock().unwrap().contains(op) {
            return Err(AdapterError::UnsupportedOperation(op.to_string()));
        }
        if self.faulty.lock().unwrap().contains(op) {
            return Err(AdapterError::ProtocolFault(format!("{} timed out", op)));
        }
        Ok(())
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

pub fn plain_snapshot(address: &str) -> CapabilitySnapshot {
    CapabilitySnapshot {
        address: address.to_string(),
        device_information: DeviceInformation {
            manufacturer: Some("Acme".to_string()),
            model: Some("Cam 2000".to_string()),
            firmware_version: Some("1.0.4".to_string()),
            serial_number: Some("SN123".to_string()),
            hardware_id: Some("HW1".to_string()),
            name: Some("Acme Cam".to_string()),
            profile_s: Some(true),
        },
        profiles: vec![Profile {
            name: "main".to_string(),
            token: "p0".to_string(),
            stream_uri: Some(MediaUri {
                uri: format!("rtsp://{}/main", address),
                ..Default::default()
            }),
            ..Default::default()
        }],
        default_profile_token: Some("p0".to_string()),
        ptz: None,
    }
}

pub fn ptz_snapshot(address: &str) -> CapabilitySnapshot {
    let mut snapshot = plain_snapshot(address);
    snapshot.profiles[0].ptz_configuration = Some(PtzConfigurationRef {
        token: "ptz_0".to_string(),
        ..Default::default()
    });
    snapshot.profiles.push(Profile {
        name: "sub".to_string(),
        token: "p1".to_string(),
        ..Default::default()
    });
    snapshot.ptz = Some(PtzService {
        xaddr: format!("http://{}/onvif/ptz_service", address),
    });
    snapshot
}

#[async_trait]
impl OnvifDevice for FakeDevice {
    fn address(&self) -> &str {
        &self.address
    }

    async fn snapshot(&self) -> Result<CapabilitySnapshot> {
        self.check("snapshot")?;
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn system_reboot(&self) -> Result<String> {
        self.check("system_reboot")?;
        self.record(Call::Reboot);
        Ok("Rebooting in 30 seconds".to_string())
    }

    async fn get_system_log(&self, log_type: LogType) -> Result<String> {
        self.check("get_system_log")?;
        self.record(Call::SystemLog(log_type));
        Ok(format!("{} log line", log_type.as_str()))
    }

    async fn get_network_interfaces(&self) -> Result<Vec<NetworkInterface>> {
        self.check("get_network_interfaces")?;
        Ok(self.interfaces.lock().unwrap().clone())
    }

    async fn get_network_protocols(&self) -> Result<Vec<NetworkProtocol>> {
        self.check("get_network_protocols")?;
        Ok(self.protocols.lock().unwrap().clone())
    }

    async fn get_audio_outputs(&self) -> Result<Vec<AudioOutput>> {
        self.check("get_audio_outputs")?;
        Ok(self.audio_outputs.lock().unwrap().clone())
    }

    async fn get_event_capabilities(&self) -> Result<EventCapabilities> {
        self.check("get_event_capabilities")?;
        Ok(self.events.lock().unwrap().clone())
    }

    async fn get_ptz_configurations(&self) -> Result<Vec<PtzConfiguration>> {
        self.check("get_ptz_configurations")?;
        Ok(self.ptz_configurations.lock().unwrap().clone())
    }

    async fn get_ptz_status(&self, _profile_token: &str) -> Result<PtzStatus> {
        self.check("get_ptz_status")?;
        Ok(self.status.lock().unwrap().clone())
    }

    async fn get_presets(&self, _profile_token: &str) -> Result<Vec<Preset>> {
        self.check("get_presets")?;
        Ok(self.presets.lock().unwrap().clone())
    }

    async fn set_preset(
        &self,
        _profile_token: &str,
        preset_name: Option<&str>,
        preset_token: Option<&str>,
    ) -> Result<String> {
        self.check("set_preset")?;
        self.record(Call::SetPreset {
            name: preset_name.map(str::to_string),
            token: preset_token.map(str::to_string),
        });
        if let Some(token) = preset_token {
            return Ok(token.to_string());
        }
        let mut next = self.next_preset.lock().unwrap();
        *next += 1;
        let token = next.to_string();
        self.presets.lock().unwrap().push(Preset {
            token: token.clone(),
            name: preset_name.map(str::to_string).unwrap_or_else(|| token.clone()),
        });
        Ok(token)
    }

    async fn remove_preset(&self, _profile_token: &str, preset_token: &str) -> Result<()> {
        self.check("remove_preset")?;
        self.record(Call::RemovePreset { preset: preset_token.to_string() });
        self.presets.lock().unwrap().retain(|p| p.token != preset_token);
        Ok(())
    }

    async fn goto_preset(&self, _profile_token: &str, preset_token: &str, speed: &PtzVector) -> Result<()> {
        self.check("goto_preset")?;
        self.record(Call::GotoPreset { preset: preset_token.to_string(), speed: *speed });
        Ok(())
    }

    async fn absolute_move(&self, profile_token: &str, position: &PtzVector, speed: &PtzVector) -> Result<()> {
        self.check("absolute_move")?;
        self.record(Call::AbsoluteMove {
            profile: profile_token.to_string(),
            position: *position,
            speed: *speed,
        });
        Ok(())
    }

    async fn relative_move(&self, profile_token: &str, translation: &PtzVector, speed: &PtzVector) -> Result<()> {
        self.check("relative_move")?;
        self.record(Call::RelativeMove {
            profile: profile_token.to_string(),
            translation: *translation,
            speed: *speed,
        });
        Ok(())
    }

    async fn continuous_move(&self, profile_token: &str, velocity: &PtzVector, timeout: Duration) -> Result<()> {
        self.check("continuous_move")?;
        self.record(Call::ContinuousMove {
            profile: profile_token.to_string(),
            velocity: *velocity,
            timeout,
        });
        Ok(())
    }

    async fn stop(&self, profile_token: &str) -> Result<()> {
        self.check("stop")?;
        self.record(Call::Stop { profile: profile_token.to_string() });
        Ok(())
    }
}

/// Hands out registered [`FakeDevice`]s by ip; unknown ips are unreachable.
#[derive(Default)]
pub struct FakeConnector {
    devices: Mutex<BTreeMap<String, Arc<FakeDevice>>>,
    connects: Mutex<Vec<ConnectParams>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, device: FakeDevice) -> Self {
        self.add(Arc::new(device));
        self
    }

    pub fn add(&self, device: Arc<FakeDevice>) {
        self.devices.lock().unwrap().insert(device.address.clone(), device);
    }

    pub fn device(&self, ip: &str) -> Arc<FakeDevice> {
        self.devices.lock().unwrap()[ip].clone()
    }

    pub fn connects(&self) -> Vec<ConnectParams> {
        self.connects.lock().unwrap().clone()
    }
}

#[async_trait]
impl OnvifConnector for FakeConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn OnvifDevice>> {
        self.connects.lock().unwrap().push(params.clone());
        let device = self.devices.lock().unwrap().get(&params.ip).cloned();
        match device {
            Some(device) => Ok(device),
            None => Err(AdapterError::ProtocolFault(format!("{} unreachable", params.ip))),
        }
    }
}

#[derive(Default)]
pub struct FakeProbe {
    pub records: Mutex<Vec<DiscoveryRecord>>,
    pub fail: Mutex<bool>,
}

impl FakeProbe {
    pub fn new(records: Vec<DiscoveryRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            fail: Mutex::new(false),
        }
    }
}

#[async_trait]
impl DeviceProbe for FakeProbe {
    async fn probe(&self) -> Result<Vec<DiscoveryRecord>> {
        if *self.fail.lock().unwrap() {
            return Err(AdapterError::ProtocolFault("socket closed".to_string()));
        }
        Ok(self.records.lock().unwrap().clone())
    }
}

pub fn nvt_record(urn: &str, name: &str, address: &str) -> DiscoveryRecord {
    DiscoveryRecord {
        urn: Some(urn.to_string()),
        name: Some(name.to_string()),
        address: address.to_string(),
        service: format!("http://{}/onvif/device_service", address),
        types: vec!["dn:NetworkVideoTransmitter".to_string(), "tds:Device".to_string()],
        scopes: vec![format!("onvif://www.onvif.org/name/{}", name)],
        ..Default::default()
    }
}
