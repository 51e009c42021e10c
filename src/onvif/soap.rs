use crate::config::OnvifConfig;
use crate::error::{AdapterError, Result};
use base64::prelude::*;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use roxmltree::Document;
use sha1::{Digest, Sha1};
use tracing::debug;

pub const NS_DEVICE: &str = "http://www.onvif.org/ver10/device/wsdl";
pub const NS_MEDIA: &str = "http://www.onvif.org/ver10/media/wsdl";
pub const NS_PTZ: &str = "http://www.onvif.org/ver20/ptz/wsdl";
pub const NS_EVENTS: &str = "http://www.onvif.org/ver10/events/wsdl";
pub const NS_SCHEMA: &str = "http://www.onvif.org/ver10/schema";

/// Fault codes meaning "this device does not implement that".
const UNSUPPORTED_MARKERS: &[&str] = &["NotSupported", "NoSuchService", "Not Implemented"];

fn generate_security_header(user: &str, pass: &str) -> String {
    let nonce_raw: [u8; 16] = rand::random();
    let nonce = BASE64_STANDARD.encode(nonce_raw);
    let created = Utc::now().format("%Y-%m-%dT%H:%M:%S.000Z").to_string();

    let mut hasher = Sha1::new();
    hasher.update(nonce_raw);
    hasher.update(created.as_bytes());
    hasher.update(pass.as_bytes());
    let password_digest = BASE64_STANDARD.encode(hasher.finalize());

    format!(
        r###"<wsse:Security xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd" xmlns:wsu="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd">
      <wsse:UsernameToken>
        <wsse:Username>{}</wsse:Username>
        <wsse:Password Type="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest">{}</wsse:Password>
        <wsse:Nonce EncodingType="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary">{}</wsse:Nonce>
        <wsu:Created>{}</wsu:Created>
      </wsse:UsernameToken>
    </wsse:Security>"###,
        xml_escape(user),
        password_digest,
        nonce,
        created
    )
}

pub fn build_soap_envelope(user: &str, pass: &str, body_content: &str) -> String {
    let security_header = if !user.is_empty() {
        generate_security_header(user, pass)
    } else {
        String::new()
    };

    format!(
        r###"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">
  <s:Header>
    {}
  </s:Header>
  <s:Body xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:xsd="http://www.w3.org/2001/XMLSchema">
    {}
  </s:Body>
</s:Envelope>"###,
        security_header, body_content
    )
}

pub fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Inspect a response body for a SOAP fault and classify it.
pub fn classify_fault(xml: &str) -> Option<AdapterError> {
    let doc = Document::parse(xml).ok()?;
    let fault = doc.descendants().find(|n| n.has_tag_name("Fault"))?;

    let values: Vec<&str> = fault
        .descendants()
        .filter(|n| n.is_element())
        .filter(|n| matches!(n.tag_name().name(), "Value" | "Text" | "faultcode" | "faultstring"))
        .filter_map(|n| n.text())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    let summary = if values.is_empty() {
        "SOAP fault".to_string()
    } else {
        values.join(" / ")
    };

    if UNSUPPORTED_MARKERS.iter().any(|m| summary.contains(m)) {
        Some(AdapterError::UnsupportedOperation(summary))
    } else {
        Some(AdapterError::ProtocolFault(summary))
    }
}

/// Authenticated SOAP caller bound to one device.
#[derive(Clone)]
pub struct SoapTransport {
    client: Client,
    user: String,
    pass: String,
}

impl SoapTransport {
    pub fn new(config: &OnvifConfig, user: Option<&str>, pass: Option<&str>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        Ok(Self {
            client,
            user: user.unwrap_or_default().to_string(),
            pass: pass.unwrap_or_default().to_string(),
        })
    }

    /// POST `body` to `url` under `namespace`/`action`; returns the response XML.
    pub async fn call(&self, url: &str, namespace: &str, action: &str, body: &str) -> Result<String> {
        let envelope = build_soap_envelope(&self.user, &self.pass, body);
        self.send(url, namespace, action, envelope).await
    }

    async fn send(&self, url: &str, namespace: &str, action: &str, envelope: String) -> Result<String> {
        debug!(url, action, "SOAP request");
        let res = self
            .client
            .post(url)
            .header(
                "Content-Type",
                format!("application/soap+xml; charset=utf-8; action=\"{}/{}\"", namespace, action),
            )
            .body(envelope)
            .send()
            .await
            .map_err(|e| AdapterError::ProtocolFault(format!("{} failed: {}", action, e)))?;

        let status = res.status();
        let text = res.text().await?;

        if let Some(fault) = classify_fault(&text) {
            return Err(fault);
        }
        if status == StatusCode::NOT_IMPLEMENTED {
            return Err(AdapterError::UnsupportedOperation(format!("{} returned {}", action, status)));
        }
        if !status.is_success() {
            return Err(AdapterError::ProtocolFault(format!("{} failed with status {}", action, status)));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACTION_NOT_SUPPORTED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<SOAP-ENV:Envelope xmlns:SOAP-ENV="http://www.w3.org/2003/05/soap-envelope" xmlns:ter="http://www.onvif.org/ver10/error">
  <SOAP-ENV:Body>
    <SOAP-ENV:Fault>
      <SOAP-ENV:Code>
        <SOAP-ENV:Value>SOAP-ENV:Receiver</SOAP-ENV:Value>
        <SOAP-ENV:Subcode><SOAP-ENV:Value>ter:ActionNotSupported</SOAP-ENV:Value></SOAP-ENV:Subcode>
      </SOAP-ENV:Code>
      <SOAP-ENV:Reason><SOAP-ENV:Text xml:lang="en">Optional Action Not Implemented</SOAP-ENV:Text></SOAP-ENV:Reason>
    </SOAP-ENV:Fault>
  </SOAP-ENV:Body>
</SOAP-ENV:Envelope>"#;

    const NOT_AUTHORIZED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope">
  <env:Body>
    <env:Fault>
      <env:Code>
        <env:Value>env:Sender</env:Value>
        <env:Subcode><env:Value>ter:NotAuthorized</env:Value></env:Subcode>
      </env:Code>
      <env:Reason><env:Text xml:lang="en">Sender not Authorized</env:Text></env:Reason>
    </env:Fault>
  </env:Body>
</env:Envelope>"#;

    #[test]
    fn test_action_not_supported_is_unsupported() {
        let err = classify_fault(ACTION_NOT_SUPPORTED).unwrap();
        assert!(err.is_unsupported(), "{:?}", err);
    }

    #[test]
    fn test_other_faults_are_protocol_faults() {
        let err = classify_fault(NOT_AUTHORIZED).unwrap();
        match err {
            AdapterError::ProtocolFault(msg) => assert!(msg.contains("NotAuthorized")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_plain_response_is_not_a_fault() {
        let ok = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><tds:SystemRebootResponse xmlns:tds="http://www.onvif.org/ver10/device/wsdl"><tds:Message>Rebooting</tds:Message></tds:SystemRebootResponse></s:Body></s:Envelope>"#;
        assert!(classify_fault(ok).is_none());
    }

    #[test]
    fn test_envelope_has_security_only_with_user() {
        let anonymous = build_soap_envelope("", "", "<GetProfiles/>");
        assert!(!anonymous.contains("UsernameToken"));

        let secured = build_soap_envelope("admin", "pw", "<GetProfiles/>");
        assert!(secured.contains("<wsse:Username>admin</wsse:Username>"));
        assert!(secured.contains("PasswordDigest"));
    }
}
