//! Routes user writes on the tree to device operations.
//!
//! [`Dispatcher::dispatch`] is a sink: every failure ends up in the log and
//! nothing is returned to the caller.

use crate::discovery::DiscoveryLoop;
use crate::error::{AdapterError, Result};
use crate::mirror::{CapabilityMirror, DEFAULT_SPEED};
use crate::models::{LogType, MoveReference, PtzVector};
use crate::onvif::OnvifDevice;
use crate::path::{self, Command, PresetPath};
use crate::registry::DeviceRegistry;
use crate::session::SessionPool;
use crate::store::{State, StateStore};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Dispatcher {
    store: Arc<dyn StateStore>,
    registry: Arc<DeviceRegistry>,
    mirror: Arc<CapabilityMirror>,
    sessions: Arc<SessionPool>,
    discovery: Arc<DiscoveryLoop>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<DeviceRegistry>,
        mirror: Arc<CapabilityMirror>,
        sessions: Arc<SessionPool>,
        discovery: Arc<DiscoveryLoop>,
    ) -> Self {
        Self {
            store,
            registry,
            mirror,
            sessions,
            discovery,
        }
    }

    pub async fn dispatch(&self, id: &str, state: &State) {
        if state.ack {
            return;
        }
        let Some(command) = Command::parse(id) else {
            debug!(id, "write without command");
            return;
        };

        let device = command.device().unwrap_or("-").to_string();
        let op = command.name();
        debug!(device = %device, op, "dispatching");
        match self.execute(&command).await {
            Ok(()) => debug!(device = %device, op, "command done"),
            Err(e) => {
                if matches!(e, AdapterError::ProtocolFault(_)) {
                    if let Some(key) = command.device() {
                        self.sessions.forget(key).await;
                    }
                }
                warn!(device = %device, op, error = %e, "command failed");
            }
        }
    }

    async fn execute(&self, command: &Command) -> Result<()> {
        let key = match command {
            Command::Discover => return self.discover().await,
            other => other.device().unwrap_or_default(),
        };

        let record = self.registry.load(key).await?;
        let session = self.sessions.get_or_connect(key, &record).await?;
        let device = session.as_ref();

        match command {
            Command::Discover => Ok(()),
            Command::Reboot { .. } => {
                let message = device.system_reboot().await?;
                info!(device = key, message = %message, "reboot requested");
                Ok(())
            }
            Command::GetLogs { .. } => {
                self.get_logs(key, device).await;
                Ok(())
            }
            Command::StopMovement { .. } => {
                let profile = self.ptz_profile(key).await?;
                device.stop(&profile).await
            }
            Command::StartMovement { .. } => {
                let profile = self.ptz_profile(key).await?;
                let ptz = path::device_node(key, path::PTZ);
                let target = self.vector(&ptz, 0.0).await?;
                let speed = self.speed(key).await?;
                let reference = self.number(&path::join(&[&ptz, "reference"])).await?;
                match MoveReference::from_state(reference) {
                    MoveReference::Absolute => device.absolute_move(&profile, &target, &speed).await,
                    MoveReference::Relative => device.relative_move(&profile, &target, &speed).await,
                }
            }
            Command::ContinuousMovement { .. } => {
                let profile = self.ptz_profile(key).await?;
                let speed = self.speed(key).await?;
                device.continuous_move(&profile, &speed, Duration::ZERO).await
            }
            Command::GotoPreset { key: preset, .. } => {
                let Some((token, _)) = self.preset(key, preset).await? else {
                    return Ok(());
                };
                let profile = self.ptz_profile(key).await?;
                let speed = self.speed(key).await?;
                device.goto_preset(&profile, &token, &speed).await
            }
            Command::DeletePreset { key: preset, .. } => {
                let Some((token, _)) = self.preset(key, preset).await? else {
                    return Ok(());
                };
                let profile = self.ptz_profile(key).await?;
                device.remove_preset(&profile, &token).await?;

                let node = PresetPath::node_id(key, preset);
                for id in [path::join(&[&node, "delete"]), path::join(&[&node, "update"]), node.clone()] {
                    self.store.delete_object(&id).await?;
                }
                info!(device = key, preset = %preset, "preset deleted");
                Ok(())
            }
            Command::UpdatePreset { key: preset, .. } => {
                let Some((token, name)) = self.preset(key, preset).await? else {
                    return Ok(());
                };
                let profile = self.ptz_profile(key).await?;
                device.set_preset(&profile, Some(&name), Some(&token)).await?;
                info!(device = key, preset = %preset, "preset updated");
                Ok(())
            }
            Command::NewPreset { .. } => {
                let name = self
                    .store
                    .get_state(&PresetPath::new_name_id(key))
                    .await?
                    .and_then(|s| s.as_str().map(|n| n.trim().to_string()))
                    .filter(|n| !n.is_empty());
                let Some(name) = name else {
                    warn!(device = key, "new preset needs a name");
                    return Ok(());
                };
                let profile = self.ptz_profile(key).await?;
                let token = device.set_preset(&profile, Some(&name), None).await?;
                info!(device = key, preset = %name, token = %token, "preset created");
                self.mirror.refresh_presets(key, &profile, device).await
            }
        }
    }

    async fn discover(&self) -> Result<()> {
        let found = self.discovery.auto_discover().await?;
        info!(cameras = found.len(), "discovery requested from tree");
        self.store.set_state(path::DISCOVER, Value::Bool(false), true).await
    }

    /// Both log queries run; a failing one leaves its node untouched.
    async fn get_logs(&self, key: &str, device: &dyn OnvifDevice) {
        for log_type in [LogType::System, LogType::Access] {
            let id = path::join(&[key, "logs", log_type.state_id()]);
            let result = match device.get_system_log(log_type).await {
                Ok(log) => self.store.set_state(&id, Value::String(log), true).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(device = key, op = "get_system_log", log = log_type.as_str(), error = %e, "log retrieval failed");
            }
        }
    }

    async fn number(&self, id: &str) -> Result<Option<f64>> {
        Ok(self.store.get_state(id).await?.and_then(|s| s.as_f64()))
    }

    /// `{x, y, z}` from the states below `base`; missing axes take `fallback`.
    async fn vector(&self, base: &str, fallback: f64) -> Result<PtzVector> {
        let x = self.number(&path::join(&[base, "x"])).await?;
        let y = self.number(&path::join(&[base, "y"])).await?;
        let z = self.number(&path::join(&[base, "z"])).await?;
        Ok(PtzVector {
            x: x.unwrap_or(fallback),
            y: y.unwrap_or(fallback),
            z: z.unwrap_or(fallback),
        })
    }

    async fn speed(&self, key: &str) -> Result<PtzVector> {
        self.vector(&path::join(&[key, path::PTZ, "speed"]), DEFAULT_SPEED).await
    }

    async fn ptz_profile(&self, key: &str) -> Result<String> {
        self.store
            .get_object(&path::device_node(key, path::PTZ))
            .await?
            .and_then(|obj| {
                obj.native
                    .get("default_profile_token")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .ok_or_else(|| AdapterError::UnsupportedOperation(format!("{} has no PTZ profile", key)))
    }

    /// Token and name stored on a preset node.
    async fn preset(&self, key: &str, preset: &str) -> Result<Option<(String, String)>> {
        let node = self.store.get_object(&PresetPath::node_id(key, preset)).await?;
        let found = node.and_then(|obj| {
            let token = obj.native.get("token")?.as_str()?.to_string();
            let name = obj
                .native
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(preset)
                .to_string();
            Some((token, name))
        });
        if found.is_none() {
            warn!(device = key, preset, "unknown preset");
        }
        Ok(found)
    }
}
