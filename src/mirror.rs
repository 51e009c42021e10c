//! Capability mirror.
//!
//! Turns what a connected device reports into nodes under its key. Device
//! facts are written with `set_object` and acknowledged states, so a re-run
//! overwrites them in place. Setpoints the user controls (axis targets,
//! speeds, the move reference and the new-preset name) are only created
//! when absent and get their default value once.
//!
//! Every pull is settled on its own: an unsupported answer is logged at
//! debug level, any other failure as a warning, and neither stops the rest.

use crate::error::{AdapterError, Result};
use crate::models::{
    AxisRange, CapabilitySnapshot, MediaUri, NetworkInterface, PtzConfiguration,
};
use crate::onvif::OnvifDevice;
use crate::path::{self, preset_key, sanitize_segment, unique_preset_key, PresetPath};
use crate::store::{ObjectDescriptor, StateStore, ValueType};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_SPEED: f64 = 0.5;

fn to_native<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| AdapterError::StoreUnavailable(e.to_string()))
}

fn settle(device: &str, op: &str, result: Result<()>) {
    match result {
        Ok(()) => debug!(device, op, "mirrored"),
        Err(e) if e.is_unsupported() => debug!(device, op, "not supported by device"),
        Err(e) => warn!(device, op, error = %e, "capability pull failed"),
    }
}

pub struct CapabilityMirror {
    store: Arc<dyn StateStore>,
}

impl CapabilityMirror {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn mirror(&self, key: &str, snapshot: &CapabilitySnapshot, device: &dyn OnvifDevice) -> Result<()> {
        self.write_profiles(key, snapshot).await?;

        let ptz = async {
            match snapshot.ptz_profile_token() {
                Some(token) => self.mirror_ptz(key, token, device).await,
                None => debug!(device = key, "no PTZ-capable profile"),
            }
        };

        let (_, interfaces, protocols, events, audio) = futures::join!(
            ptz,
            self.pull_network_interfaces(key, device),
            self.pull_network_protocols(key, device),
            self.pull_event_capabilities(key, device),
            self.pull_audio_outputs(key, device),
        );
        settle(key, "get_network_interfaces", interfaces);
        settle(key, "get_network_protocols", protocols);
        settle(key, "get_event_capabilities", events);
        settle(key, "get_audio_outputs", audio);

        info!(device = key, profiles = snapshot.profiles.len(), "capabilities mirrored");
        Ok(())
    }

    /// Read-only node with an acknowledged value.
    async fn fact(&self, id: &str, obj: ObjectDescriptor, val: Value) -> Result<()> {
        self.store.set_object(id, obj).await?;
        self.store.set_state(id, val, true).await
    }

    /// User-controlled node; its default is written only on creation.
    async fn setpoint(&self, id: &str, obj: ObjectDescriptor) -> Result<bool> {
        let def = obj.common.def.clone();
        let created = self.store.set_object_not_exists(id, obj).await?;
        if created {
            if let Some(def) = def {
                self.store.set_state(id, def, true).await?;
            }
        }
        Ok(created)
    }

    // --- profiles ---

    async fn write_profiles(&self, key: &str, snapshot: &CapabilitySnapshot) -> Result<()> {
        if snapshot.profiles.is_empty() {
            return Ok(());
        }
        let profiles = path::device_node(key, "profiles");
        self.store
            .set_object(&profiles, ObjectDescriptor::channel("Profiles"))
            .await?;

        for (index, profile) in snapshot.profiles.iter().enumerate() {
            let id = path::join(&[&profiles, &index.to_string()]);
            let mut native = to_native(profile)?;
            if let Value::Object(fields) = &mut native {
                fields.insert("default".to_string(), Value::Bool(snapshot.is_default(index)));
            }
            self.store
                .set_object(&id, ObjectDescriptor::channel(profile.name.clone()).with_native(native))
                .await?;
            self.write_media_uri(&id, "stream_uri", "Stream URI", profile.stream_uri.as_ref())
                .await?;
            self.write_media_uri(&id, "snapshot_uri", "Snapshot URI", profile.snapshot_uri.as_ref())
                .await?;
        }
        Ok(())
    }

    async fn write_media_uri(&self, profile_id: &str, leaf: &str, name: &str, uri: Option<&MediaUri>) -> Result<()> {
        let Some(uri) = uri else {
            return Ok(());
        };
        let obj = ObjectDescriptor::indicator(name, ValueType::String, "text.url").with_native(json!({
            "invalid_after_connect": uri.invalid_after_connect,
            "invalid_after_reboot": uri.invalid_after_reboot,
            "timeout": uri.timeout,
        }));
        self.fact(&path::join(&[profile_id, leaf]), obj, Value::String(uri.uri.clone()))
            .await
    }

    // --- ptz ---

    async fn mirror_ptz(&self, key: &str, profile_token: &str, device: &dyn OnvifDevice) {
        if let Err(e) = self.write_ptz_controls(key, profile_token).await {
            warn!(device = key, error = %e, "failed to write PTZ controls");
            return;
        }
        let configurations = self.pull_ptz_configurations(key, device).await;
        settle(key, "get_configurations", configurations);
        settle(key, "get_presets", self.refresh_presets(key, profile_token, device).await);
        settle(key, "get_status", self.pull_ptz_status(key, profile_token, device).await);
    }

    async fn write_ptz_controls(&self, key: &str, profile_token: &str) -> Result<()> {
        let ptz = path::device_node(key, path::PTZ);
        let at = |rest: &str| path::join(&[&ptz, rest]);

        self.store
            .set_object(
                &ptz,
                ObjectDescriptor::channel("PTZ").with_native(json!({ "default_profile_token": profile_token })),
            )
            .await?;

        self.setpoint(
            &at("z"),
            ObjectDescriptor::setpoint("Zoom", ValueType::Number, "level.zoom")
                .with_range(Some(0.0), None)
                .with_default(json!(0)),
        )
        .await?;
        self.setpoint(
            &at("reference"),
            ObjectDescriptor::setpoint("Movement reference", ValueType::Number, "state")
                .with_states(&[(0, "absolute"), (1, "relative")])
                .with_default(json!(0)),
        )
        .await?;

        self.store
            .set_object(&at("speed"), ObjectDescriptor::channel("Speed"))
            .await?;
        for axis in ["x", "y", "z"] {
            self.setpoint(
                &at(&format!("speed.{}", axis)),
                ObjectDescriptor::setpoint(format!("Speed for {}", axis), ValueType::Number, "level.speed")
                    .with_range(Some(0.0), Some(1.0))
                    .with_default(json!(DEFAULT_SPEED)),
            )
            .await?;
        }

        for (leaf, name) in [
            ("stop_movement", "Stop movement"),
            ("start_movement", "Start movement"),
            ("continuous_movement", "Continuous movement"),
        ] {
            self.store.set_object(&at(leaf), ObjectDescriptor::button(name)).await?;
        }

        self.store
            .set_object(&at(path::PRESETS), ObjectDescriptor::channel("Presets"))
            .await?;
        self.store
            .set_object(&PresetPath::new_trigger_id(key), ObjectDescriptor::button("New preset"))
            .await?;
        self.setpoint(
            &PresetPath::new_name_id(key),
            ObjectDescriptor::setpoint("New preset name", ValueType::String, "text").with_default(json!("")),
        )
        .await?;
        Ok(())
    }

    async fn pull_ptz_configurations(&self, key: &str, device: &dyn OnvifDevice) -> Result<()> {
        let configurations = device.get_ptz_configurations().await?;
        let Some(conf) = configurations.first() else {
            return Ok(());
        };
        self.write_axis_ranges(key, conf).await
    }

    async fn write_axis_ranges(&self, key: &str, conf: &PtzConfiguration) -> Result<()> {
        let axes = [
            ("x", "Pan", "level.pan", conf.pan_range),
            ("y", "Tilt", "level.tilt", conf.tilt_range),
            ("z", "Zoom", "level.zoom", conf.zoom_range),
        ];
        for (axis, name, role, range) in axes {
            let Some(AxisRange { min, max }) = range else {
                continue;
            };
            let id = path::join(&[key, path::PTZ, axis]);
            let def = if (min..=max).contains(&0.0) { 0.0 } else { min };
            let obj = ObjectDescriptor::setpoint(name, ValueType::Number, role)
                .with_range(Some(min), Some(max))
                .with_default(json!(def));
            if !self.setpoint(&id, obj).await? {
                // existing setpoint: refresh the bounds, keep the value
                self.store
                    .extend_object(&id, json!({ "common": { "min": min, "max": max } }))
                    .await?;
            }
        }
        Ok(())
    }

    /// Pull the preset list and write one node per preset, in device order.
    pub async fn refresh_presets(&self, key: &str, profile_token: &str, device: &dyn OnvifDevice) -> Result<()> {
        let presets = device.get_presets(profile_token).await?;
        let mut taken = HashSet::new();
        for preset in &presets {
            if preset_key(&preset.name).is_empty() {
                debug!(device = key, token = %preset.token, "skipping preset without name");
                continue;
            }
            let preset_key = unique_preset_key(&preset.name, &preset.token, &taken);
            taken.insert(preset_key.clone());
            let id = PresetPath::node_id(key, &preset_key);
            self.store
                .set_object(
                    &id,
                    ObjectDescriptor::button(preset.name.clone())
                        .with_native(json!({ "token": preset.token, "name": preset.name })),
                )
                .await?;
            self.store
                .set_object(&path::join(&[&id, "delete"]), ObjectDescriptor::button(format!("Delete {}", preset.name)))
                .await?;
            self.store
                .set_object(&path::join(&[&id, "update"]), ObjectDescriptor::button(format!("Update {}", preset.name)))
                .await?;
        }
        debug!(device = key, count = presets.len(), "presets mirrored");
        Ok(())
    }

    async fn pull_ptz_status(&self, key: &str, profile_token: &str, device: &dyn OnvifDevice) -> Result<()> {
        let status = device.get_ptz_status(profile_token).await?;
        let Some(position) = status.position else {
            return Ok(());
        };
        let base = path::join(&[key, path::PTZ, "position"]);
        self.store
            .set_object(&base, ObjectDescriptor::channel("Position"))
            .await?;
        for (axis, value) in [("x", position.x), ("y", position.y), ("z", position.z)] {
            if let Some(value) = value {
                self.fact(
                    &path::join(&[&base, axis]),
                    ObjectDescriptor::indicator(format!("Position {}", axis), ValueType::Number, "value"),
                    json!(value),
                )
                .await?;
            }
        }
        Ok(())
    }

    // --- network ---

    async fn pull_network_interfaces(&self, key: &str, device: &dyn OnvifDevice) -> Result<()> {
        let interfaces = device.get_network_interfaces().await?;
        if interfaces.is_empty() {
            return Ok(());
        }
        let network = path::device_node(key, "network");
        self.store
            .set_object(&network, ObjectDescriptor::channel("Network"))
            .await?;
        for iface in &interfaces {
            self.write_interface(&network, iface).await?;
        }
        Ok(())
    }

    async fn write_interface(&self, network: &str, iface: &NetworkInterface) -> Result<()> {
        let id = path::join(&[network, &sanitize_segment(&iface.token)]);
        self.store
            .set_object(
                &id,
                ObjectDescriptor::channel(iface.name.clone().unwrap_or_else(|| iface.token.clone())).with_native(
                    json!({ "token": iface.token, "name": iface.name, "hw_address": iface.hw_address }),
                ),
            )
            .await?;

        let flag = |v: Option<bool>| v.map(|b| (Value::Bool(b), ValueType::Boolean, "indicator"));
        let text = |v: &Option<String>| v.clone().map(|s| (Value::String(s), ValueType::String, "info.ip"));

        let v4 = iface.ipv4.as_ref();
        let v6 = iface.ipv6.as_ref();
        let states = [
            ("enabled", Some((Value::Bool(iface.enabled), ValueType::Boolean, "indicator"))),
            ("ipv4_enabled", v4.and_then(|c| flag(c.enabled))),
            ("ipv4_dhcp_enabled", v4.and_then(|c| flag(c.dhcp))),
            ("ipv4_manual", v4.and_then(|c| text(&c.manual))),
            ("ipv4_dhcp", v4.and_then(|c| text(&c.from_dhcp))),
            ("ipv4_link_local", v4.and_then(|c| text(&c.link_local))),
            ("ipv6_enabled", v6.and_then(|c| flag(c.enabled))),
            ("ipv6_dhcp", v6.and_then(|c| c.dhcp.clone().map(|m| (Value::String(m), ValueType::String, "text")))),
            ("ipv6_manual", v6.and_then(|c| text(&c.manual))),
            ("ipv6_dhcp_address", v6.and_then(|c| text(&c.from_dhcp))),
            ("ipv6_link_local", v6.and_then(|c| text(&c.link_local))),
            ("ipv6_router_advert", v6.and_then(|c| flag(c.accept_router_advert))),
        ];
        for (leaf, reported) in states {
            if let Some((val, value_type, role)) = reported {
                self.fact(&path::join(&[&id, leaf]), ObjectDescriptor::indicator(leaf, value_type, role), val)
                    .await?;
            }
        }
        Ok(())
    }

    async fn pull_network_protocols(&self, key: &str, device: &dyn OnvifDevice) -> Result<()> {
        let protocols = device.get_network_protocols().await?;
        if protocols.is_empty() {
            return Ok(());
        }
        let base = path::join(&[key, "network", "protocols"]);
        self.store
            .set_object(&base, ObjectDescriptor::channel("Protocols"))
            .await?;
        for protocol in &protocols {
            let id = path::join(&[&base, &sanitize_segment(&protocol.name)]);
            self.store
                .set_object(
                    &id,
                    ObjectDescriptor::channel(protocol.name.clone()).with_native(to_native(protocol)?),
                )
                .await?;
            self.fact(
                &path::join(&[&id, "enabled"]),
                ObjectDescriptor::indicator("enabled", ValueType::Boolean, "indicator"),
                Value::Bool(protocol.enabled),
            )
            .await?;
            if let Some(port) = protocol.port.first() {
                self.fact(
                    &path::join(&[&id, "port"]),
                    ObjectDescriptor::indicator("port", ValueType::Number, "value"),
                    json!(port),
                )
                .await?;
            }
        }
        Ok(())
    }

    // --- events / audio ---

    async fn pull_event_capabilities(&self, key: &str, device: &dyn OnvifDevice) -> Result<()> {
        let capabilities = device.get_event_capabilities().await?;
        if capabilities.properties.is_empty() {
            return Ok(());
        }
        let base = path::device_node(key, "events");
        self.store
            .set_object(&base, ObjectDescriptor::channel("Events"))
            .await?;
        for (name, value) in &capabilities.properties {
            let value_type = match value {
                Value::Bool(_) => ValueType::Boolean,
                Value::Number(_) => ValueType::Number,
                _ => ValueType::String,
            };
            self.fact(
                &path::join(&[&base, &sanitize_segment(name)]),
                ObjectDescriptor::indicator(name.clone(), value_type, "state"),
                value.clone(),
            )
            .await?;
        }
        Ok(())
    }

    async fn pull_audio_outputs(&self, key: &str, device: &dyn OnvifDevice) -> Result<()> {
        let outputs = device.get_audio_outputs().await?;
        if outputs.is_empty() {
            return Ok(());
        }
        let base = path::device_node(key, "audio_outputs");
        self.store
            .set_object(&base, ObjectDescriptor::channel("Audio outputs"))
            .await?;
        for output in &outputs {
            self.store
                .set_object(
                    &path::join(&[&base, &sanitize_segment(&output.token)]),
                    ObjectDescriptor::channel(output.token.clone()).with_native(json!({ "token": output.token })),
                )
                .await?;
        }
        Ok(())
    }
}
