//! State store seam.
//!
//! The host platform keeps a hierarchical, dot-addressed tree of objects
//! (device / channel / state descriptors with typed metadata) and a value per
//! state. Ids handed to a [`StateStore`] are relative to the adapter namespace.

pub mod memory;
pub mod sqlite;

use crate::error::{AdapterError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Device,
    Channel,
    #[default]
    State,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Device => "device",
            ObjectKind::Channel => "channel",
            ObjectKind::State => "state",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Boolean,
    Number,
    String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Common {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<ValueType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub def: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub states: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectDescriptor {
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    pub common: Common,
    pub native: Value,
}

impl ObjectDescriptor {
    fn new(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            common: Common {
                name: name.into(),
                ..Default::default()
            },
            native: Value::Object(Default::default()),
        }
    }

    pub fn device(name: impl Into<String>, native: Value) -> Self {
        Self::new(ObjectKind::Device, name)
            .with_role("camera")
            .with_native(native)
    }

    pub fn channel(name: impl Into<String>) -> Self {
        Self::new(ObjectKind::Channel, name)
    }

    /// Read-only state reporting a device fact.
    pub fn indicator(name: impl Into<String>, value_type: ValueType, role: &str) -> Self {
        let mut obj = Self::new(ObjectKind::State, name).with_role(role);
        obj.common.value_type = Some(value_type);
        obj.common.read = Some(true);
        obj.common.write = Some(false);
        obj
    }

    /// Writable state holding a user setpoint.
    pub fn setpoint(name: impl Into<String>, value_type: ValueType, role: &str) -> Self {
        let mut obj = Self::new(ObjectKind::State, name).with_role(role);
        obj.common.value_type = Some(value_type);
        obj.common.read = Some(true);
        obj.common.write = Some(true);
        obj
    }

    /// Write-only boolean trigger.
    pub fn button(name: impl Into<String>) -> Self {
        let mut obj = Self::new(ObjectKind::State, name).with_role("button");
        obj.common.value_type = Some(ValueType::Boolean);
        obj.common.read = Some(false);
        obj.common.write = Some(true);
        obj
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.common.role = Some(role.to_string());
        self
    }

    pub fn with_native(mut self, native: Value) -> Self {
        self.native = native;
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.common.min = min;
        self.common.max = max;
        self
    }

    pub fn with_default(mut self, def: Value) -> Self {
        self.common.def = Some(def);
        self
    }

    pub fn with_states(mut self, states: &[(i64, &str)]) -> Self {
        self.common.states = Some(
            states
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }

    /// Typed view of the `native` part.
    pub fn native_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.native.clone())
            .map_err(|e| AdapterError::StoreUnavailable(format!("malformed native data: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub val: Value,
    pub ack: bool,
    /// Milliseconds since the epoch
    pub ts: i64,
}

impl State {
    pub fn new(val: Value, ack: bool) -> Self {
        Self {
            val,
            ack,
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.val.as_f64()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.val.as_str()
    }
}

/// Published on every `set_state`.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub id: String,
    pub state: State,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_object(&self, id: &str) -> Result<Option<ObjectDescriptor>>;

    /// Create or replace.
    async fn set_object(&self, id: &str, obj: ObjectDescriptor) -> Result<()>;

    /// Create only when absent; returns whether the object was created.
    async fn set_object_not_exists(&self, id: &str, obj: ObjectDescriptor) -> Result<bool>;

    /// Merge `partial` (same JSON shape as a descriptor) into the object,
    /// creating it when absent.
    async fn extend_object(&self, id: &str, partial: Value) -> Result<()>;

    /// Remove the object and its state.
    async fn delete_object(&self, id: &str) -> Result<()>;

    async fn get_state(&self, id: &str) -> Result<Option<State>>;

    async fn set_state(&self, id: &str, val: Value, ack: bool) -> Result<()>;

    /// Objects whose id starts with `prefix`, optionally of one kind, ordered by id.
    async fn list_objects(
        &self,
        prefix: &str,
        kind: Option<ObjectKind>,
    ) -> Result<Vec<(String, ObjectDescriptor)>>;

    fn subscribe(&self) -> broadcast::Receiver<StateChange>;
}

/// Key-wise recursive merge of JSON objects; non-object values replace.
pub fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value)
                    }
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Apply an `extend_object` patch to an optional existing descriptor.
pub(crate) fn extended(existing: Option<&ObjectDescriptor>, partial: &Value) -> Result<ObjectDescriptor> {
    let mut merged = match existing {
        Some(obj) => serde_json::to_value(obj)
            .map_err(|e| AdapterError::StoreUnavailable(e.to_string()))?,
        None => Value::Object(Default::default()),
    };
    merge_json(&mut merged, partial);
    serde_json::from_value(merged)
        .map_err(|e| AdapterError::StoreUnavailable(format!("invalid object patch: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_json_nested() {
        let mut target = json!({"common": {"name": "Cam", "role": "camera"}, "native": {"ip": "10.0.0.2"}});
        merge_json(
            &mut target,
            &json!({"common": {"name": "Front door"}, "native": {"user": "admin"}}),
        );
        assert_eq!(
            target,
            json!({"common": {"name": "Front door", "role": "camera"}, "native": {"ip": "10.0.0.2", "user": "admin"}})
        );
    }

    #[test]
    fn test_extended_creates_missing_object() {
        let obj = extended(None, &json!({"type": "channel", "common": {"name": "PTZ"}})).unwrap();
        assert_eq!(obj.kind, ObjectKind::Channel);
        assert_eq!(obj.common.name, "PTZ");
    }

    #[test]
    fn test_descriptor_serializes_platform_shape() {
        let obj = ObjectDescriptor::setpoint("Speed for x", ValueType::Number, "state")
            .with_default(json!(0.5));
        let value = serde_json::to_value(&obj).unwrap();
        assert_eq!(value["type"], "state");
        assert_eq!(value["common"]["type"], "number");
        assert_eq!(value["common"]["def"], 0.5);
        assert!(value["common"].get("min").is_none());
    }
}
