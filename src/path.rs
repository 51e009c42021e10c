//! State-tree addressing.
//!
//! Device-reported names become path segments through [`sanitize_segment`].
//! Inbound writes are routed by [`Command::parse`], the single place that
//! interprets a written id.

use crate::models::DeviceKey;
use std::collections::HashSet;

pub const DISCOVER: &str = "discover";
pub const SYSTEM_REBOOT: &str = "system.reboot";
pub const LOGS_GETLOGS: &str = "logs.getlogs";
pub const PTZ: &str = "ptz";
pub const PRESETS: &str = "presets";
pub const NEW_PRESET: &str = "new";
pub const NEW_PRESET_NAME: &str = "name";

/// `parts` joined with `.`.
pub fn join(parts: &[&str]) -> String {
    parts.join(".")
}

/// Id of a node below a device.
pub fn device_node(device: &str, rest: &str) -> String {
    format!("{}.{}", device, rest)
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_segment(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Storage key of a preset. Keys of the form `new`, `new_`, `new__`, ...
/// get one more `_` so no preset can land on the new-preset trigger.
pub fn preset_key(name: &str) -> String {
    let key = sanitize_segment(name);
    let reserved = key
        .strip_prefix(NEW_PRESET)
        .map_or(false, |rest| rest.chars().all(|c| c == '_'));
    if reserved {
        format!("{}_", key)
    } else {
        key
    }
}

/// Key for a preset whose plain key is already used by another preset of
/// the same list: the sanitised token is appended, then `_` until free.
pub fn unique_preset_key(name: &str, token: &str, taken: &HashSet<String>) -> String {
    let mut key = preset_key(name);
    if taken.contains(&key) {
        key = format!("{}_{}", key, sanitize_segment(token));
        while taken.contains(&key) {
            key.push('_');
        }
    }
    key
}

/// First segment of an id.
pub fn device_of(id: &str) -> Option<&str> {
    id.split('.').next().filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetAction {
    Goto,
    Delete,
    Update,
}

/// Position of a node inside `<dev>.ptz.presets`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresetPath {
    Root,
    NewTrigger,
    NewName,
    PresetAction { key: String, action: PresetAction },
}

impl PresetPath {
    /// Parse the segments following `presets`.
    pub fn parse(segments: &[&str]) -> Option<Self> {
        match segments {
            [] => Some(PresetPath::Root),
            [NEW_PRESET] => Some(PresetPath::NewTrigger),
            [NEW_PRESET, NEW_PRESET_NAME] => Some(PresetPath::NewName),
            [key] => Some(PresetPath::PresetAction {
                key: key.to_string(),
                action: PresetAction::Goto,
            }),
            [key, "delete"] => Some(PresetPath::PresetAction {
                key: key.to_string(),
                action: PresetAction::Delete,
            }),
            [key, "update"] => Some(PresetPath::PresetAction {
                key: key.to_string(),
                action: PresetAction::Update,
            }),
            _ => None,
        }
    }

    pub fn node_id(device: &str, key: &str) -> String {
        join(&[device, PTZ, PRESETS, key])
    }

    pub fn new_trigger_id(device: &str) -> String {
        join(&[device, PTZ, PRESETS, NEW_PRESET])
    }

    pub fn new_name_id(device: &str) -> String {
        join(&[device, PTZ, PRESETS, NEW_PRESET, NEW_PRESET_NAME])
    }
}

/// A write on the tree that maps to one outbound operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Discover,
    Reboot { device: DeviceKey },
    GetLogs { device: DeviceKey },
    StopMovement { device: DeviceKey },
    StartMovement { device: DeviceKey },
    ContinuousMovement { device: DeviceKey },
    GotoPreset { device: DeviceKey, key: String },
    DeletePreset { device: DeviceKey, key: String },
    UpdatePreset { device: DeviceKey, key: String },
    NewPreset { device: DeviceKey },
}

impl Command {
    /// Route a written id. Setpoints, read-only nodes and unknown ids yield `None`.
    pub fn parse(id: &str) -> Option<Command> {
        let segments: Vec<&str> = id.split('.').collect();
        let (device, rest) = match segments.as_slice() {
            [DISCOVER] => return Some(Command::Discover),
            [device, rest @ ..] if !device.is_empty() => (device.to_string(), rest),
            _ => return None,
        };

        match rest {
            ["system", "reboot"] => Some(Command::Reboot { device }),
            ["logs", "getlogs"] => Some(Command::GetLogs { device }),
            [PTZ, "stop_movement"] => Some(Command::StopMovement { device }),
            [PTZ, "start_movement"] => Some(Command::StartMovement { device }),
            [PTZ, "continuous_movement"] => Some(Command::ContinuousMovement { device }),
            [PTZ, PRESETS, tail @ ..] => match PresetPath::parse(tail)? {
                PresetPath::NewTrigger => Some(Command::NewPreset { device }),
                PresetPath::PresetAction { key, action } => Some(match action {
                    PresetAction::Goto => Command::GotoPreset { device, key },
                    PresetAction::Delete => Command::DeletePreset { device, key },
                    PresetAction::Update => Command::UpdatePreset { device, key },
                }),
                PresetPath::Root | PresetPath::NewName => None,
            },
            _ => None,
        }
    }

    pub fn device(&self) -> Option<&str> {
        match self {
            Command::Discover => None,
            Command::Reboot { device }
            | Command::GetLogs { device }
            | Command::StopMovement { device }
            | Command::StartMovement { device }
            | Command::ContinuousMovement { device }
            | Command::GotoPreset { device, .. }
            | Command::DeletePreset { device, .. }
            | Command::UpdatePreset { device, .. }
            | Command::NewPreset { device } => Some(device),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Discover => "discover",
            Command::Reboot { .. } => "reboot",
            Command::GetLogs { .. } => "getlogs",
            Command::StopMovement { .. } => "stop_movement",
            Command::StartMovement { .. } => "start_movement",
            Command::ContinuousMovement { .. } => "continuous_movement",
            Command::GotoPreset { .. } => "goto_preset",
            Command::DeletePreset { .. } => "delete_preset",
            Command::UpdatePreset { .. } => "update_preset",
            Command::NewPreset { .. } => "new_preset",
        }
    }
}
