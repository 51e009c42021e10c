use super::DeviceProbe;
use crate::config::DiscoveryConfig;
use crate::error::{AdapterError, Result};
use crate::models::DiscoveryRecord;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use local_ip_address::local_ip;
use roxmltree::Document;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info};
use uuid::Uuid;

const WS_DISCOVERY_PORT: u16 = 3702;

/// WS-Discovery by unicast probe to every host of the local /24.
pub struct SubnetProbe {
    timeout: Duration,
    concurrency: usize,
}

impl SubnetProbe {
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self {
            timeout: config.probe_timeout(),
            concurrency: config.concurrency.max(1),
        }
    }
}

#[async_trait]
impl DeviceProbe for SubnetProbe {
    async fn probe(&self) -> Result<Vec<DiscoveryRecord>> {
        let local = local_ip()
            .map_err(|e| AdapterError::ProtocolFault(format!("failed to get local IP: {}", e)))?;
        let ipv4 = match local {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => {
                return Err(AdapterError::UnsupportedOperation(
                    "subnet probe needs an IPv4 interface".to_string(),
                ))
            }
        };

        let [a, b, c, _] = ipv4.octets();
        info!(subnet = %format!("{}.{}.{}.0/24", a, b, c), "probing for ONVIF devices");

        let timeout = self.timeout;
        let probes = (1..=254u8).map(|host| {
            let ip = format!("{}.{}.{}.{}", a, b, c, host);
            async move { probe_ip(&ip, timeout).await }
        });

        let answers = stream::iter(probes)
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut records: Vec<DiscoveryRecord> = Vec::new();
        for record in answers.into_iter().flatten() {
            let duplicate = records.iter().any(|r| match (&r.urn, &record.urn) {
                (Some(known), Some(urn)) => known == urn,
                _ => r.address == record.address,
            });
            if !duplicate {
                records.push(record);
            }
        }

        info!(count = records.len(), "probe finished");
        Ok(records)
    }
}

fn probe_message() -> String {
    format!(
        r###"<?xml version="1.0" encoding="UTF-8"?>
<Envelope xmlns="http://www.w3.org/2003/05/soap-envelope" xmlns:dn="http://www.onvif.org/ver10/network/wsdl">
    <Header>
        <wsa:MessageID xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing">urn:uuid:{}</wsa:MessageID>
        <wsa:To xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing">urn:schemas-xmlsoap-org:ws:2005:04:discovery</wsa:To>
        <wsa:Action xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing">http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe</wsa:Action>
    </Header>
    <Body>
        <Probe xmlns="http://schemas.xmlsoap.org/ws/2005/04/discovery">
            <Types>dn:NetworkVideoTransmitter</Types>
            <Scopes />
        </Probe>
    </Body>
</Envelope>"###,
        Uuid::new_v4()
    )
}

async fn probe_ip(ip: &str, timeout: Duration) -> Option<DiscoveryRecord> {
    let target: SocketAddr = format!("{}:{}", ip, WS_DISCOVERY_PORT).parse().ok()?;
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.send_to(probe_message().as_bytes(), target).await.ok()?;

    let mut buf = [0u8; 8192];
    let (len, _src) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
        .await
        .ok()?
        .ok()?;
    let xml = std::str::from_utf8(&buf[..len]).ok()?;

    let record = parse_probe_match(xml, ip);
    if record.is_none() {
        debug!(ip, "unparseable probe answer");
    }
    record
}

/// Turn a `ProbeMatches` answer into a record. `ip` is the probed host.
pub fn parse_probe_match(xml: &str, ip: &str) -> Option<DiscoveryRecord> {
    let doc = Document::parse(xml).ok()?;
    let probe_match = doc.descendants().find(|n| n.has_tag_name("ProbeMatch"))?;
    let text_of = |name: &str| {
        probe_match
            .descendants()
            .find(|n| n.has_tag_name(name))
            .and_then(|n| n.text())
            .unwrap_or("")
            .trim()
            .to_string()
    };

    let urn = Some(text_of("Address")).filter(|s| !s.is_empty());
    let service = text_of("XAddrs").split_whitespace().next()?.to_string();
    let types: Vec<String> = text_of("Types").split_whitespace().map(str::to_string).collect();
    let scopes: Vec<String> = text_of("Scopes").split_whitespace().map(str::to_string).collect();

    let mut name = None;
    let mut hardware = None;
    let mut location = None;
    for scope in &scopes {
        let decoded = urlencoding::decode(scope).map(|s| s.into_owned()).unwrap_or_else(|_| scope.clone());
        let value_after = |marker: &str| decoded.split(marker).nth(1).map(str::to_string);
        if let Some(v) = value_after("/name/") {
            name = Some(v);
        } else if let Some(v) = value_after("/hardware/") {
            hardware = Some(v);
        } else if let Some(v) = value_after("/location/") {
            location = Some(v);
        }
    }

    // Cameras behind NAT announce an address that differs from the probed
    // one; trust the service URL host.
    let address = url::Url::parse(&service)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| ip.to_string());

    Some(DiscoveryRecord {
        urn,
        name,
        address,
        service,
        hardware,
        location,
        types,
        scopes,
    })
}
