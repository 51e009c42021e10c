use super::parse::{self, ServiceAddresses};
use super::soap::{xml_escape, SoapTransport, NS_DEVICE, NS_EVENTS, NS_MEDIA, NS_PTZ, NS_SCHEMA};
use super::{ConnectParams, OnvifConnector, OnvifDevice, DEFAULT_SERVICE_PATH};
use crate::config::OnvifConfig;
use crate::error::{AdapterError, Result};
use crate::models::{
    AudioOutput, CapabilitySnapshot, DeviceInformation, EventCapabilities, LogType, MediaUri,
    NetworkInterface, NetworkProtocol, Preset, Profile, PtzConfiguration, PtzService, PtzStatus,
    PtzVector,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Opens SOAP sessions against the device service.
pub struct SoapConnector {
    config: OnvifConfig,
}

impl SoapConnector {
    pub fn new(config: OnvifConfig) -> Self {
        Self { config }
    }

    fn device_url(&self, params: &ConnectParams) -> String {
        let port = params.port.unwrap_or(self.config.default_port);
        let path = params.path.as_deref().unwrap_or(DEFAULT_SERVICE_PATH);
        format!("http://{}:{}{}", params.ip, port, path)
    }
}

#[async_trait]
impl OnvifConnector for SoapConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn OnvifDevice>> {
        let device_url = self.device_url(params);
        let transport = SoapTransport::new(&self.config, params.user.as_deref(), params.password.as_deref())?;

        let xml = transport
            .call(
                &device_url,
                NS_DEVICE,
                "GetCapabilities",
                &format!(r#"<GetCapabilities xmlns="{}"><Category>All</Category></GetCapabilities>"#, NS_DEVICE),
            )
            .await?;
        let services = parse::parse_capabilities(&xml)?;
        info!(url = %device_url, ptz = services.ptz.is_some(), "connected");

        Ok(Arc::new(SoapDevice {
            address: params.ip.clone(),
            device_url,
            services,
            transport,
        }))
    }
}

pub struct SoapDevice {
    address: String,
    device_url: String,
    services: ServiceAddresses,
    transport: SoapTransport,
}

fn vector_xml(tag: &str, v: &PtzVector) -> String {
    format!(
        r#"<{tag}><PanTilt xmlns="{ns}" x="{x}" y="{y}"/><Zoom xmlns="{ns}" x="{z}"/></{tag}>"#,
        tag = tag,
        ns = NS_SCHEMA,
        x = v.x,
        y = v.y,
        z = v.z
    )
}

/// xs:duration for a PTZ timeout.
fn iso_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("PT{}S", d.as_secs())
    } else {
        format!("PT{}.{:03}S", d.as_secs(), d.subsec_millis())
    }
}

impl SoapDevice {
    fn media_url(&self) -> &str {
        self.services.media.as_deref().unwrap_or(&self.device_url)
    }

    fn ptz_url(&self) -> Result<&str> {
        self.services
            .ptz
            .as_deref()
            .ok_or_else(|| AdapterError::UnsupportedOperation("device has no PTZ service".to_string()))
    }

    async fn device_call(&self, action: &str, inner: &str) -> Result<String> {
        let body = format!(r#"<{a} xmlns="{ns}">{inner}</{a}>"#, a = action, ns = NS_DEVICE, inner = inner);
        self.transport.call(&self.device_url, NS_DEVICE, action, &body).await
    }

    async fn media_call(&self, action: &str, inner: &str) -> Result<String> {
        let body = format!(r#"<{a} xmlns="{ns}">{inner}</{a}>"#, a = action, ns = NS_MEDIA, inner = inner);
        self.transport.call(self.media_url(), NS_MEDIA, action, &body).await
    }

    async fn ptz_call(&self, action: &str, inner: &str) -> Result<String> {
        let url = self.ptz_url()?;
        let body = format!(r#"<{a} xmlns="{ns}">{inner}</{a}>"#, a = action, ns = NS_PTZ, inner = inner);
        self.transport.call(url, NS_PTZ, action, &body).await
    }

    async fn device_information(&self) -> Result<DeviceInformation> {
        let xml = self.device_call("GetDeviceInformation", "").await?;
        let mut info = parse::parse_device_information(&xml)?;

        // scopes are optional decoration
        match self.device_call("GetScopes", "").await.and_then(|xml| parse::parse_scopes(&xml)) {
            Ok(scopes) => {
                info.name = scopes
                    .iter()
                    .find_map(|s| s.split("/name/").nth(1))
                    .map(|n| urlencoding::decode(n).map(|d| d.into_owned()).unwrap_or_else(|_| n.to_string()));
                info.profile_s = Some(scopes.iter().any(|s| s.ends_with("Profile/Streaming")));
            }
            Err(e) => debug!(address = %self.address, error = %e, "GetScopes failed"),
        }
        Ok(info)
    }

    async fn media_uri(&self, action: &str, inner: &str) -> Option<MediaUri> {
        match self.media_call(action, inner).await.and_then(|xml| parse::parse_media_uri(&xml)) {
            Ok(uri) => Some(uri),
            Err(e) => {
                debug!(address = %self.address, action, error = %e, "media URI unavailable");
                None
            }
        }
    }

    async fn with_uris(&self, mut profile: Profile) -> Profile {
        let token = format!("<ProfileToken>{}</ProfileToken>", xml_escape(&profile.token));
        let stream_setup = format!(
            r#"<StreamSetup><Stream xmlns="{ns}">RTP-Unicast</Stream><Transport xmlns="{ns}"><Protocol>RTSP</Protocol></Transport></StreamSetup>{token}"#,
            ns = NS_SCHEMA,
            token = token
        );
        profile.stream_uri = self.media_uri("GetStreamUri", &stream_setup).await;
        profile.snapshot_uri = self.media_uri("GetSnapshotUri", &token).await;
        profile
    }
}

#[async_trait]
impl OnvifDevice for SoapDevice {
    fn address(&self) -> &str {
        &self.address
    }

    async fn snapshot(&self) -> Result<CapabilitySnapshot> {
        let device_information = self.device_information().await?;
        let xml = self.media_call("GetProfiles", "").await?;

        let mut profiles = Vec::new();
        for profile in parse::parse_profiles(&xml)? {
            profiles.push(self.with_uris(profile).await);
        }
        let default_profile_token = profiles.first().map(|p| p.token.clone());

        Ok(CapabilitySnapshot {
            address: self.address.clone(),
            device_information,
            profiles,
            default_profile_token,
            ptz: self.services.ptz.clone().map(|xaddr| PtzService { xaddr }),
        })
    }

    async fn system_reboot(&self) -> Result<String> {
        let xml = self.device_call("SystemReboot", "").await?;
        parse::parse_system_reboot(&xml)
    }

    async fn get_system_log(&self, log_type: LogType) -> Result<String> {
        let inner = format!("<LogType>{}</LogType>", log_type.as_str());
        let xml = self.device_call("GetSystemLog", &inner).await?;
        parse::parse_system_log(&xml)
    }

    async fn get_network_interfaces(&self) -> Result<Vec<NetworkInterface>> {
        let xml = self.device_call("GetNetworkInterfaces", "").await?;
        parse::parse_network_interfaces(&xml)
    }

    async fn get_network_protocols(&self) -> Result<Vec<NetworkProtocol>> {
        let xml = self.device_call("GetNetworkProtocols", "").await?;
        parse::parse_network_protocols(&xml)
    }

    async fn get_audio_outputs(&self) -> Result<Vec<AudioOutput>> {
        let xml = self.media_call("GetAudioOutputs", "").await?;
        parse::parse_audio_outputs(&xml)
    }

    async fn get_event_capabilities(&self) -> Result<EventCapabilities> {
        let url = self
            .services
            .events
            .as_deref()
            .ok_or_else(|| AdapterError::UnsupportedOperation("device has no event service".to_string()))?;
        let body = format!(r#"<GetServiceCapabilities xmlns="{}"/>"#, NS_EVENTS);
        let xml = self.transport.call(url, NS_EVENTS, "GetServiceCapabilities", &body).await?;
        parse::parse_event_capabilities(&xml)
    }

    async fn get_ptz_configurations(&self) -> Result<Vec<PtzConfiguration>> {
        let xml = self.ptz_call("GetConfigurations", "").await?;
        parse::parse_ptz_configurations(&xml)
    }

    async fn get_ptz_status(&self, profile_token: &str) -> Result<PtzStatus> {
        let inner = format!("<ProfileToken>{}</ProfileToken>", xml_escape(profile_token));
        let xml = self.ptz_call("GetStatus", &inner).await?;
        parse::parse_ptz_status(&xml)
    }

    async fn get_presets(&self, profile_token: &str) -> Result<Vec<Preset>> {
        let inner = format!("<ProfileToken>{}</ProfileToken>", xml_escape(profile_token));
        let xml = self.ptz_call("GetPresets", &inner).await?;
        parse::parse_presets(&xml)
    }

    async fn set_preset(
        &self,
        profile_token: &str,
        preset_name: Option<&str>,
        preset_token: Option<&str>,
    ) -> Result<String> {
        let mut inner = format!("<ProfileToken>{}</ProfileToken>", xml_escape(profile_token));
        if let Some(name) = preset_name {
            inner.push_str(&format!("<PresetName>{}</PresetName>", xml_escape(name)));
        }
        if let Some(token) = preset_token {
            inner.push_str(&format!("<PresetToken>{}</PresetToken>", xml_escape(token)));
        }
        let xml = self.ptz_call("SetPreset", &inner).await?;
        parse::parse_set_preset(&xml)
    }

    async fn remove_preset(&self, profile_token: &str, preset_token: &str) -> Result<()> {
        let inner = format!(
            "<ProfileToken>{}</ProfileToken><PresetToken>{}</PresetToken>",
            xml_escape(profile_token),
            xml_escape(preset_token)
        );
        self.ptz_call("RemovePreset", &inner).await.map(|_| ())
    }

    async fn goto_preset(&self, profile_token: &str, preset_token: &str, speed: &PtzVector) -> Result<()> {
        let inner = format!(
            "<ProfileToken>{}</ProfileToken><PresetToken>{}</PresetToken>{}",
            xml_escape(profile_token),
            xml_escape(preset_token),
            vector_xml("Speed", speed)
        );
        self.ptz_call("GotoPreset", &inner).await.map(|_| ())
    }

    async fn absolute_move(&self, profile_token: &str, position: &PtzVector, speed: &PtzVector) -> Result<()> {
        let inner = format!(
            "<ProfileToken>{}</ProfileToken>{}{}",
            xml_escape(profile_token),
            vector_xml("Position", position),
            vector_xml("Speed", speed)
        );
        self.ptz_call("AbsoluteMove", &inner).await.map(|_| ())
    }

    async fn relative_move(&self, profile_token: &str, translation: &PtzVector, speed: &PtzVector) -> Result<()> {
        let inner = format!(
            "<ProfileToken>{}</ProfileToken>{}{}",
            xml_escape(profile_token),
            vector_xml("Translation", translation),
            vector_xml("Speed", speed)
        );
        self.ptz_call("RelativeMove", &inner).await.map(|_| ())
    }

    async fn continuous_move(&self, profile_token: &str, velocity: &PtzVector, timeout: Duration) -> Result<()> {
        let mut inner = format!(
            "<ProfileToken>{}</ProfileToken>{}",
            xml_escape(profile_token),
            vector_xml("Velocity", velocity)
        );
        if !timeout.is_zero() {
            inner.push_str(&format!("<Timeout>{}</Timeout>", iso_duration(timeout)));
        }
        self.ptz_call("ContinuousMove", &inner).await.map(|_| ())
    }

    async fn stop(&self, profile_token: &str) -> Result<()> {
        let inner = format!(
            "<ProfileToken>{}</ProfileToken><PanTilt>true</PanTilt><Zoom>true</Zoom>",
            xml_escape(profile_token)
        );
        self.ptz_call("Stop", &inner).await.map(|_| ())
    }
}
