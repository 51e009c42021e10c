//! SOAP response parsing.
//!
//! Elements are matched by local name so the namespace prefixes cameras
//! pick (`tt:`, `trt:`, none at all) do not matter.

use crate::error::{AdapterError, Result};
use crate::models::{
    AudioEncoderConfiguration, AudioOutput, AudioSourceConfiguration, AxisRange, Bounds,
    DeviceInformation, EventCapabilities, H264Configuration, Ipv4Settings, Ipv6Settings, MediaUri,
    Multicast, NetworkInterface, NetworkProtocol, Preset, Profile, PtzConfiguration,
    PtzConfigurationRef, PtzPosition, PtzStatus, PtzVector, RateControl, Resolution,
    VideoEncoderConfiguration, VideoSourceConfiguration,
};
use roxmltree::{Document, Node};
use serde_json::Value;
use std::str::FromStr;

type XmlNode<'a, 'i> = Node<'a, 'i>;

fn child<'a, 'i>(node: XmlNode<'a, 'i>, name: &str) -> Option<XmlNode<'a, 'i>> {
    node.children().find(|n| n.has_tag_name(name))
}

/// Follow a chain of direct children.
fn path<'a, 'i>(node: XmlNode<'a, 'i>, names: &[&str]) -> Option<XmlNode<'a, 'i>> {
    names.iter().try_fold(node, |n, name| child(n, name))
}

fn text(node: XmlNode, names: &[&str]) -> Option<String> {
    path(node, names)
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn number<T: FromStr>(node: XmlNode, names: &[&str]) -> Option<T> {
    text(node, names).and_then(|t| t.parse().ok())
}

fn boolean(node: XmlNode, names: &[&str]) -> Option<bool> {
    text(node, names).and_then(|t| parse_bool(&t))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn attr_f64(node: Option<XmlNode>, name: &str) -> Option<f64> {
    node.and_then(|n| n.attribute(name)).and_then(|v| v.parse().ok())
}

fn token(node: XmlNode) -> String {
    node.attribute("token").unwrap_or_default().to_string()
}

/// The first element named `name` anywhere in the document.
fn response<'a, 'i>(doc: &'a Document<'i>, name: &str) -> Result<XmlNode<'a, 'i>> {
    doc.descendants()
        .find(|n| n.has_tag_name(name))
        .ok_or_else(|| AdapterError::ProtocolFault(format!("response has no {} element", name)))
}

// --- device ---

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceAddresses {
    pub media: Option<String>,
    pub ptz: Option<String>,
    pub events: Option<String>,
}

pub fn parse_capabilities(xml: &str) -> Result<ServiceAddresses> {
    let doc = Document::parse(xml)?;
    let caps = response(&doc, "Capabilities")?;
    Ok(ServiceAddresses {
        media: text(caps, &["Media", "XAddr"]),
        ptz: text(caps, &["PTZ", "XAddr"]),
        events: text(caps, &["Events", "XAddr"]),
    })
}

pub fn parse_device_information(xml: &str) -> Result<DeviceInformation> {
    let doc = Document::parse(xml)?;
    let info = response(&doc, "GetDeviceInformationResponse")?;
    Ok(DeviceInformation {
        manufacturer: text(info, &["Manufacturer"]),
        model: text(info, &["Model"]),
        firmware_version: text(info, &["FirmwareVersion"]),
        serial_number: text(info, &["SerialNumber"]),
        hardware_id: text(info, &["HardwareId"]),
        name: None,
        profile_s: None,
    })
}

/// Scope URIs from `GetScopesResponse`.
pub fn parse_scopes(xml: &str) -> Result<Vec<String>> {
    let doc = Document::parse(xml)?;
    let res = response(&doc, "GetScopesResponse")?;
    Ok(res
        .children()
        .filter(|n| n.has_tag_name("Scopes"))
        .filter_map(|n| text(n, &["ScopeItem"]))
        .collect())
}

pub fn parse_system_reboot(xml: &str) -> Result<String> {
    let doc = Document::parse(xml)?;
    let res = response(&doc, "SystemRebootResponse")?;
    Ok(text(res, &["Message"]).unwrap_or_default())
}

pub fn parse_system_log(xml: &str) -> Result<String> {
    let doc = Document::parse(xml)?;
    let res = response(&doc, "GetSystemLogResponse")?;
    Ok(text(res, &["SystemLog", "String"]).unwrap_or_default())
}

pub fn parse_network_interfaces(xml: &str) -> Result<Vec<NetworkInterface>> {
    let doc = Document::parse(xml)?;
    let res = response(&doc, "GetNetworkInterfacesResponse")?;
    Ok(res
        .children()
        .filter(|n| n.has_tag_name("NetworkInterfaces"))
        .map(|iface| NetworkInterface {
            token: token(iface),
            name: text(iface, &["Info", "Name"]),
            enabled: boolean(iface, &["Enabled"]).unwrap_or(false),
            hw_address: text(iface, &["Info", "HwAddress"]),
            ipv4: child(iface, "IPv4").map(|v4| Ipv4Settings {
                enabled: boolean(v4, &["Enabled"]),
                manual: text(v4, &["Config", "Manual", "Address"]),
                from_dhcp: text(v4, &["Config", "FromDHCP", "Address"]),
                link_local: text(v4, &["Config", "LinkLocal", "Address"]),
                dhcp: boolean(v4, &["Config", "DHCP"]),
            }),
            ipv6: child(iface, "IPv6").map(|v6| Ipv6Settings {
                enabled: boolean(v6, &["Enabled"]),
                dhcp: text(v6, &["Config", "DHCP"]),
                manual: text(v6, &["Config", "Manual", "Address"]),
                from_dhcp: text(v6, &["Config", "FromDHCP", "Address"]),
                link_local: text(v6, &["Config", "LinkLocal", "Address"]),
                accept_router_advert: boolean(v6, &["Config", "AcceptRouterAdvert"]),
            }),
        })
        .collect())
}

pub fn parse_network_protocols(xml: &str) -> Result<Vec<NetworkProtocol>> {
    let doc = Document::parse(xml)?;
    let res = response(&doc, "GetNetworkProtocolsResponse")?;
    Ok(res
        .children()
        .filter(|n| n.has_tag_name("NetworkProtocols"))
        .filter_map(|proto| {
            Some(NetworkProtocol {
                name: text(proto, &["Name"])?,
                enabled: boolean(proto, &["Enabled"]).unwrap_or(false),
                port: proto
                    .children()
                    .filter(|n| n.has_tag_name("Port"))
                    .filter_map(|n| n.text().and_then(|t| t.trim().parse().ok()))
                    .collect(),
            })
        })
        .collect())
}

// --- media ---

fn parse_multicast(node: Option<XmlNode>) -> Option<Multicast> {
    let m = node?;
    Some(Multicast {
        ipv4: text(m, &["Address", "IPv4Address"]),
        port: number(m, &["Port"]),
        ttl: number(m, &["TTL"]),
        auto_start: boolean(m, &["AutoStart"]),
    })
}

fn parse_profile(node: XmlNode) -> Profile {
    let video_source_configuration = child(node, "VideoSourceConfiguration").map(|c| {
        let bounds = child(c, "Bounds");
        VideoSourceConfiguration {
            token: token(c),
            name: text(c, &["Name"]),
            use_count: number(c, &["UseCount"]),
            bounds: bounds.map(|b| Bounds {
                x: b.attribute("x").and_then(|v| v.parse().ok()).unwrap_or(0),
                y: b.attribute("y").and_then(|v| v.parse().ok()).unwrap_or(0),
                width: b.attribute("width").and_then(|v| v.parse().ok()).unwrap_or(0),
                height: b.attribute("height").and_then(|v| v.parse().ok()).unwrap_or(0),
            }),
        }
    });

    let audio_source_configuration = child(node, "AudioSourceConfiguration").map(|c| AudioSourceConfiguration {
        token: token(c),
        name: text(c, &["Name"]),
        use_count: number(c, &["UseCount"]),
    });

    let video_encoder_configuration = child(node, "VideoEncoderConfiguration").map(|c| VideoEncoderConfiguration {
        token: token(c),
        name: text(c, &["Name"]),
        use_count: number(c, &["UseCount"]),
        encoding: text(c, &["Encoding"]),
        quality: number(c, &["Quality"]),
        resolution: child(c, "Resolution").and_then(|r| {
            Some(Resolution {
                width: number(r, &["Width"])?,
                height: number(r, &["Height"])?,
            })
        }),
        h264: child(c, "H264").map(|h| H264Configuration {
            gov_length: number(h, &["GovLength"]),
            h264_profile: text(h, &["H264Profile"]),
        }),
        rate_control: child(c, "RateControl").map(|r| RateControl {
            frame_rate_limit: number(r, &["FrameRateLimit"]),
            encoding_interval: number(r, &["EncodingInterval"]),
            bitrate_limit: number(r, &["BitrateLimit"]),
        }),
        multicast: parse_multicast(child(c, "Multicast")),
        session_timeout: text(c, &["SessionTimeout"]),
    });

    let audio_encoder_configuration = child(node, "AudioEncoderConfiguration").map(|c| AudioEncoderConfiguration {
        token: token(c),
        name: text(c, &["Name"]),
        use_count: number(c, &["UseCount"]),
        encoding: text(c, &["Encoding"]),
        bitrate: number(c, &["Bitrate"]),
        sample_rate: number(c, &["SampleRate"]),
        multicast: parse_multicast(child(c, "Multicast")),
        session_timeout: text(c, &["SessionTimeout"]),
    });

    let ptz_configuration = child(node, "PTZConfiguration").map(|c| PtzConfigurationRef {
        token: token(c),
        name: text(c, &["Name"]),
        use_count: number(c, &["UseCount"]),
        session_timeout: text(c, &["DefaultPTZTimeout"]),
    });

    Profile {
        name: text(node, &["Name"]).unwrap_or_else(|| token(node)),
        token: token(node),
        video_source_configuration,
        audio_source_configuration,
        video_encoder_configuration,
        audio_encoder_configuration,
        ptz_configuration,
        stream_uri: None,
        snapshot_uri: None,
    }
}

pub fn parse_profiles(xml: &str) -> Result<Vec<Profile>> {
    let doc = Document::parse(xml)?;
    let res = response(&doc, "GetProfilesResponse")?;
    Ok(res
        .children()
        .filter(|n| n.has_tag_name("Profiles"))
        .map(parse_profile)
        .collect())
}

pub fn parse_media_uri(xml: &str) -> Result<MediaUri> {
    let doc = Document::parse(xml)?;
    let media_uri = response(&doc, "MediaUri")?;
    Ok(MediaUri {
        uri: text(media_uri, &["Uri"])
            .ok_or_else(|| AdapterError::ProtocolFault("MediaUri without Uri".to_string()))?,
        invalid_after_connect: boolean(media_uri, &["InvalidAfterConnect"]).unwrap_or(false),
        invalid_after_reboot: boolean(media_uri, &["InvalidAfterReboot"]).unwrap_or(false),
        timeout: text(media_uri, &["Timeout"]),
    })
}

pub fn parse_audio_outputs(xml: &str) -> Result<Vec<AudioOutput>> {
    let doc = Document::parse(xml)?;
    let res = response(&doc, "GetAudioOutputsResponse")?;
    Ok(res
        .children()
        .filter(|n| n.has_tag_name("AudioOutputs"))
        .map(|n| AudioOutput { token: token(n) })
        .collect())
}

// --- events ---

pub fn parse_event_capabilities(xml: &str) -> Result<EventCapabilities> {
    let doc = Document::parse(xml)?;
    let res = response(&doc, "GetServiceCapabilitiesResponse")?;
    let caps = child(res, "Capabilities")
        .ok_or_else(|| AdapterError::ProtocolFault("no Capabilities element".to_string()))?;

    let properties = caps
        .attributes()
        .map(|a| {
            let value = parse_bool(a.value())
                .map(Value::Bool)
                .or_else(|| a.value().parse::<u64>().ok().map(Value::from))
                .unwrap_or_else(|| Value::String(a.value().to_string()));
            (a.name().to_string(), value)
        })
        .collect();
    Ok(EventCapabilities { properties })
}

// --- ptz ---

fn parse_range(node: Option<XmlNode>) -> Option<AxisRange> {
    let n = node?;
    Some(AxisRange {
        min: number(n, &["Min"])?,
        max: number(n, &["Max"])?,
    })
}

pub fn parse_ptz_configurations(xml: &str) -> Result<Vec<PtzConfiguration>> {
    let doc = Document::parse(xml)?;
    let res = response(&doc, "GetConfigurationsResponse")?;
    Ok(res
        .children()
        .filter(|n| n.has_tag_name("PTZConfiguration"))
        .map(|c| {
            let speed = child(c, "DefaultPTZSpeed");
            let pan_tilt_range = path(c, &["PanTiltLimits", "Range"]);
            let zoom_range = path(c, &["ZoomLimits", "Range"]);
            PtzConfiguration {
                token: token(c),
                name: text(c, &["Name"]),
                node_token: text(c, &["NodeToken"]),
                default_speed: speed.map(|s| PtzVector {
                    x: attr_f64(child(s, "PanTilt"), "x").unwrap_or(0.0),
                    y: attr_f64(child(s, "PanTilt"), "y").unwrap_or(0.0),
                    z: attr_f64(child(s, "Zoom"), "x").unwrap_or(0.0),
                }),
                default_timeout: text(c, &["DefaultPTZTimeout"]),
                pan_range: pan_tilt_range.and_then(|r| parse_range(child(r, "XRange"))),
                tilt_range: pan_tilt_range.and_then(|r| parse_range(child(r, "YRange"))),
                zoom_range: zoom_range.and_then(|r| parse_range(child(r, "XRange"))),
            }
        })
        .collect())
}

pub fn parse_ptz_status(xml: &str) -> Result<PtzStatus> {
    let doc = Document::parse(xml)?;
    let status = response(&doc, "PTZStatus")?;
    let position = child(status, "Position").map(|p| PtzPosition {
        x: attr_f64(child(p, "PanTilt"), "x"),
        y: attr_f64(child(p, "PanTilt"), "y"),
        z: attr_f64(child(p, "Zoom"), "x"),
    });
    Ok(PtzStatus {
        position,
        move_status: text(status, &["MoveStatus", "PanTilt"]),
    })
}

pub fn parse_presets(xml: &str) -> Result<Vec<Preset>> {
    let doc = Document::parse(xml)?;
    let res = response(&doc, "GetPresetsResponse")?;
    Ok(res
        .children()
        .filter(|n| n.has_tag_name("Preset"))
        .map(|p| Preset {
            token: token(p),
            name: text(p, &["Name"]).unwrap_or_else(|| token(p)),
        })
        .collect())
}

pub fn parse_set_preset(xml: &str) -> Result<String> {
    let doc = Document::parse(xml)?;
    let res = response(&doc, "SetPresetResponse")?;
    text(res, &["PresetToken"])
        .ok_or_else(|| AdapterError::ProtocolFault("SetPresetResponse without PresetToken".to_string()))
}
