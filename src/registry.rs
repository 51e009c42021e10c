use crate::error::{AdapterError, Result};
use crate::models::{Device, DeviceInformation, DeviceKey, DiscoveryRecord, UpdateDeviceRequest};
use crate::path::{self, sanitize_segment};
use crate::store::{ObjectDescriptor, ObjectKind, StateStore, ValueType};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a reconcile did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    /// Address or service URL changed; open sessions point at the old one
    Moved,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub key: DeviceKey,
    pub outcome: Outcome,
}

/// Owns the device records: one per urn (or per ip when there is no urn),
/// stored at the root of the tree under a collision-free key.
pub struct DeviceRegistry {
    store: Arc<dyn StateStore>,
}

fn to_native<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| AdapterError::StoreUnavailable(e.to_string()))
}

/// The stored service URL moved to the edited ip and port, so the next
/// connect uses them. `None` when there is nothing to rewrite.
fn relocated_service(service: &str, update: &UpdateDeviceRequest) -> Option<String> {
    let ip = update.ip.as_deref().map(str::trim).filter(|ip| !ip.is_empty());
    if ip.is_none() && update.port.is_none() {
        return None;
    }
    let mut url = match url::Url::parse(service) {
        Ok(url) => url,
        Err(_) => {
            debug!(service, "no service URL to relocate");
            return None;
        }
    };
    if let Some(ip) = ip {
        if url.set_host(Some(ip)).is_err() {
            warn!(ip, "edited ip is not a valid host");
            return None;
        }
    }
    if let Some(port) = update.port {
        if url.set_port(Some(port)).is_err() {
            return None;
        }
    }
    let relocated = url.to_string();
    (relocated != service).then_some(relocated)
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// All device records, in key order. Records that no longer decode are
    /// skipped.
    pub async fn devices(&self) -> Result<Vec<(DeviceKey, Device)>> {
        let objects = self.store.list_objects("", Some(ObjectKind::Device)).await?;
        Ok(objects
            .into_iter()
            .filter(|(id, _)| !id.contains('.'))
            .filter_map(|(id, obj)| match obj.native_as::<Device>() {
                Ok(device) => Some((id, device)),
                Err(e) => {
                    warn!(device = %id, error = %e, "skipping unreadable device record");
                    None
                }
            })
            .collect())
    }

    pub async fn find_by_urn(&self, urn: &str) -> Result<Option<(DeviceKey, Device)>> {
        Ok(self
            .devices()
            .await?
            .into_iter()
            .find(|(_, d)| d.urn.as_deref() == Some(urn)))
    }

    pub async fn find_by_ip(&self, ip: &str) -> Result<Option<(DeviceKey, Device)>> {
        Ok(self.devices().await?.into_iter().find(|(_, d)| d.ip == ip))
    }

    pub async fn load(&self, key: &str) -> Result<Device> {
        match self.store.get_object(key).await? {
            Some(obj) if obj.kind == ObjectKind::Device => obj.native_as(),
            _ => Err(AdapterError::DeviceNotFound(key.to_string())),
        }
    }

    /// Storage key for a display name: the sanitized name itself when free,
    /// else `name_NNN` one above the highest suffix in use.
    pub async fn allocate_key(&self, name: &str) -> Result<DeviceKey> {
        let mut base = sanitize_segment(name);
        if base.is_empty() {
            return Err(AdapterError::InvalidDescriptor(format!("unusable device name {:?}", name)));
        }
        if base == path::DISCOVER {
            base.push_str("_device");
        }

        let pattern = Regex::new(&format!(r"^{}(?:_(\d{{3}}))?$", regex::escape(&base)))
            .map_err(|e| AdapterError::InvalidDescriptor(e.to_string()))?;

        let highest = self
            .store
            .list_objects("", None)
            .await?
            .iter()
            .filter(|(id, _)| !id.contains('.'))
            .filter_map(|(id, _)| pattern.captures(id))
            .map(|caps| {
                caps.get(1)
                    .and_then(|m| m.as_str().parse::<u32>().ok())
                    .unwrap_or(0)
            })
            .max();

        Ok(match highest {
            None => base,
            Some(n) => format!("{}_{:03}", base, n + 1),
        })
    }

    /// Match a probed device against the known ones, updating it in place
    /// when its descriptor moved, or create it.
    pub async fn reconcile(&self, record: &DiscoveryRecord) -> Result<DeviceKey> {
        self.reconcile_record(record).await.map(|r| r.key)
    }

    /// [`reconcile`](Self::reconcile), also reporting what changed.
    ///
    /// A urn miss falls back to a device at the same ip that has no urn yet
    /// (typically one added by hand), which then adopts the urn.
    pub async fn reconcile_record(&self, record: &DiscoveryRecord) -> Result<Reconciled> {
        if record.address.trim().is_empty() {
            return Err(AdapterError::InvalidDescriptor("discovery record without address".to_string()));
        }
        let display_name = record
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .or_else(|| record.urn_serial())
            .map(str::to_string);

        let existing = match &record.urn {
            Some(urn) => match self.find_by_urn(urn).await? {
                Some(found) => Some(found),
                None => self
                    .find_by_ip(&record.address)
                    .await?
                    .filter(|(_, device)| device.urn.is_none()),
            },
            None => self.find_by_ip(&record.address).await?,
        };

        if let Some((key, device)) = existing {
            let outcome = self.refresh_descriptor(&key, &device, record).await?;
            return Ok(Reconciled { key, outcome });
        }

        let name = display_name.ok_or_else(|| {
            AdapterError::InvalidDescriptor(format!("record from {} has neither urn nor name", record.address))
        })?;
        let key = self.allocate_key(&name).await?;
        self.create(&key, &name, &Device::from_discovery(record)).await?;
        info!(device = %key, ip = %record.address, "new device discovered");
        Ok(Reconciled {
            key,
            outcome: Outcome::Created,
        })
    }

    async fn refresh_descriptor(&self, key: &str, device: &Device, record: &DiscoveryRecord) -> Result<Outcome> {
        // a urn is adopted, never replaced
        let urn = device.urn.as_ref().or(record.urn.as_ref());
        let moved = device.ip != record.address || device.service != record.service;
        let unchanged = !moved
            && device.urn.as_ref() == urn
            && device.location == record.location
            && device.types == record.types
            && device.scopes == record.scopes;
        if unchanged {
            debug!(device = %key, "discovery record unchanged");
            return Ok(Outcome::Unchanged);
        }

        self.store
            .extend_object(
                key,
                json!({
                    "native": {
                        "urn": urn,
                        "ip": record.address,
                        "service": record.service,
                        "location": record.location,
                        "types": record.types,
                        "scopes": record.scopes,
                    }
                }),
            )
            .await?;
        info!(device = %key, ip = %record.address, moved, "device descriptor updated");
        Ok(if moved { Outcome::Moved } else { Outcome::Updated })
    }

    /// Persist a new device record and its standing child nodes.
    pub async fn create(&self, key: &str, name: &str, device: &Device) -> Result<()> {
        self.store
            .set_object(key, ObjectDescriptor::device(name, to_native(device)?))
            .await?;

        let system = path::device_node(key, "system");
        let logs = path::device_node(key, "logs");
        let children = [
            (system.clone(), ObjectDescriptor::channel("System")),
            (path::device_node(key, path::SYSTEM_REBOOT), ObjectDescriptor::button("Reboot")),
            (logs.clone(), ObjectDescriptor::channel("Logs")),
            (path::device_node(key, path::LOGS_GETLOGS), ObjectDescriptor::button("Get logs")),
            (
                path::join(&[&logs, "systemlog"]),
                ObjectDescriptor::indicator("System log", ValueType::String, "text"),
            ),
            (
                path::join(&[&logs, "accesslog"]),
                ObjectDescriptor::indicator("Access log", ValueType::String, "text"),
            ),
        ];
        for (id, obj) in children {
            self.store.set_object_not_exists(&id, obj).await?;
        }
        Ok(())
    }

    /// Register a device added by hand. A device already known at that ip
    /// gets the new credentials instead.
    pub async fn register_manual(&self, name: &str, device: &Device) -> Result<DeviceKey> {
        let existing = match &device.urn {
            Some(urn) => self.find_by_urn(urn).await?,
            None => None,
        };
        let existing = match existing {
            Some(found) => Some(found),
            None => self.find_by_ip(&device.ip).await?,
        };

        if let Some((key, _)) = existing {
            self.store
                .extend_object(
                    &key,
                    json!({
                        "native": {
                            "user": device.user,
                            "password": device.password,
                            "port": device.port,
                            "service": device.service,
                        }
                    }),
                )
                .await?;
            info!(device = %key, "manual add matched a known device");
            return Ok(key);
        }

        let key = self.allocate_key(name).await?;
        self.create(&key, name, device).await?;
        info!(device = %key, ip = %device.ip, "device added");
        Ok(key)
    }

    /// Cache what the device reported about itself on connect.
    pub async fn update_main_info(&self, key: &str, info: &DeviceInformation, port: Option<u16>) -> Result<()> {
        let mut native = Map::new();
        let fields = [
            ("manufacturer", &info.manufacturer),
            ("model", &info.model),
            ("firmware_version", &info.firmware_version),
            ("serial_number", &info.serial_number),
            ("hardware_id", &info.hardware_id),
        ];
        for (field, value) in fields {
            if let Some(v) = value {
                native.insert(field.to_string(), Value::String(v.clone()));
            }
        }
        if let Some(profile_s) = info.profile_s {
            native.insert("profile_s".to_string(), Value::Bool(profile_s));
        }
        if let Some(port) = port {
            native.insert("port".to_string(), Value::from(port));
        }
        if native.is_empty() {
            return Ok(());
        }
        self.store.extend_object(key, json!({ "native": native })).await
    }

    /// Apply a user edit; returns the updated record.
    pub async fn apply_update(&self, key: &str, update: &UpdateDeviceRequest) -> Result<Device> {
        let current = self.load(key).await?;

        let mut patch = Map::new();
        if let Some(name) = update.name.as_deref().filter(|n| !n.trim().is_empty()) {
            patch.insert("common".to_string(), json!({ "name": name.trim() }));
        }

        let mut native = Map::new();
        if let Some(user) = &update.user {
            native.insert("user".to_string(), Value::String(user.clone()));
        }
        if let Some(password) = &update.password {
            native.insert("password".to_string(), Value::String(password.clone()));
        }
        if let Some(ip) = update.ip.as_deref().filter(|ip| !ip.trim().is_empty()) {
            native.insert("ip".to_string(), Value::String(ip.trim().to_string()));
        }
        if let Some(port) = update.port {
            native.insert("port".to_string(), Value::from(port));
        }
        if let Some(service) = relocated_service(&current.service, update) {
            native.insert("service".to_string(), Value::String(service));
        }
        if !native.is_empty() {
            patch.insert("native".to_string(), Value::Object(native));
        }

        if !patch.is_empty() {
            self.store.extend_object(key, Value::Object(patch)).await?;
            info!(device = %key, "device settings updated");
        }
        self.load(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onvif::fake::nvt_record;
    use crate::store::MemoryStore;

    fn registry() -> (Arc<MemoryStore>, DeviceRegistry) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), DeviceRegistry::new(store))
    }

    #[tokio::test]
    async fn test_same_name_different_urn_gets_suffixes() {
        let (_, registry) = registry();
        let a = registry.reconcile(&nvt_record("urn:uuid:1", "Cam", "10.0.0.1")).await.unwrap();
        let b = registry.reconcile(&nvt_record("urn:uuid:2", "Cam", "10.0.0.2")).await.unwrap();
        let c = registry.reconcile(&nvt_record("urn:uuid:3", "Cam", "10.0.0.3")).await.unwrap();
        assert_eq!((a.as_str(), b.as_str(), c.as_str()), ("Cam", "Cam_001", "Cam_002"));
    }

    #[tokio::test]
    async fn test_suffix_continues_above_highest() {
        let (store, registry) = registry();
        store
            .set_object("Cam_004", ObjectDescriptor::device("Cam", json!({"ip": "10.0.0.9"})))
            .await
            .unwrap();
        assert_eq!(registry.allocate_key("Cam").await.unwrap(), "Cam_005");
        assert_eq!(registry.allocate_key("Other cam").await.unwrap(), "Other_cam");
        assert_eq!(registry.allocate_key("discover").await.unwrap(), "discover_device");
    }

    #[tokio::test]
    async fn test_known_urn_with_same_fields_writes_nothing() {
        let (store, registry) = registry();
        let record = nvt_record("urn:uuid:123", "CamA", "10.0.0.5");
        registry.reconcile(&record).await.unwrap();
        let before = store.mutation_count();

        let key = registry.reconcile(&record).await.unwrap();
        assert_eq!(key, "CamA");
        assert_eq!(store.mutation_count(), before);
    }

    #[tokio::test]
    async fn test_changed_service_updates_in_place() {
        let (store, registry) = registry();
        let mut record = nvt_record("urn:uuid:123", "CamA", "10.0.0.5");
        let key = registry.reconcile(&record).await.unwrap();
        assert_eq!(key, "CamA");
        let device = registry.load("CamA").await.unwrap();
        assert!(device.user.is_empty() && device.password.is_empty());
        assert!(store.get_object("CamA.system.reboot").await.unwrap().is_some());
        assert!(store.get_object("CamA.logs.accesslog").await.unwrap().is_some());

        record.service = "http://10.0.0.5:8080/onvif/device_service".to_string();
        let again = registry.reconcile(&record).await.unwrap();
        assert_eq!(again, "CamA");
        assert_eq!(registry.devices().await.unwrap().len(), 1);
        assert_eq!(registry.load("CamA").await.unwrap().service, record.service);
    }

    #[tokio::test]
    async fn test_discovery_adopts_manually_added_device_at_same_ip() {
        let (_, registry) = registry();
        let manual = Device {
            ip: "10.0.0.20".to_string(),
            port: Some(8000),
            service: "http://10.0.0.20:8000/onvif/device_service".to_string(),
            user: "admin".to_string(),
            password: "pw".to_string(),
            ..Default::default()
        };
        registry.register_manual("Acme Cam", &manual).await.unwrap();

        let mut record = nvt_record("urn:uuid:20", "Yard", "10.0.0.20");
        record.service = manual.service.clone();
        let reconciled = registry.reconcile_record(&record).await.unwrap();
        assert_eq!(reconciled, Reconciled { key: "Acme_Cam".to_string(), outcome: Outcome::Updated });

        let devices = registry.devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].1.urn.as_deref(), Some("urn:uuid:20"));
        assert!(devices[0].1.has_credentials());
    }

    #[tokio::test]
    async fn test_ip_reused_by_another_urn_is_a_new_device() {
        let (_, registry) = registry();
        registry.reconcile(&nvt_record("urn:uuid:1", "Old", "10.0.0.30")).await.unwrap();
        let reconciled = registry
            .reconcile_record(&nvt_record("urn:uuid:2", "New", "10.0.0.30"))
            .await
            .unwrap();
        assert_eq!(reconciled.outcome, Outcome::Created);
        assert_eq!(registry.devices().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_new_address_is_reported_as_moved() {
        let (_, registry) = registry();
        let mut record = nvt_record("urn:uuid:5", "CamA", "10.0.0.5");
        registry.reconcile(&record).await.unwrap();

        record.address = "10.0.0.55".to_string();
        record.service = "http://10.0.0.55/onvif/device_service".to_string();
        let moved = registry.reconcile_record(&record).await.unwrap();
        assert_eq!(moved.outcome, Outcome::Moved);

        record.scopes = vec!["onvif://www.onvif.org/location/yard".to_string()];
        assert_eq!(registry.reconcile_record(&record).await.unwrap().outcome, Outcome::Updated);
        assert_eq!(registry.reconcile_record(&record).await.unwrap().outcome, Outcome::Unchanged);
    }

    #[tokio::test]
    async fn test_port_edit_rewrites_service_url() {
        let (_, registry) = registry();
        let mut record = nvt_record("urn:uuid:6", "CamB", "10.0.0.6");
        record.service = "http://10.0.0.6:8080/onvif/device_service".to_string();
        registry.reconcile(&record).await.unwrap();

        let update = UpdateDeviceRequest {
            port: Some(9000),
            user: Some("admin".to_string()),
            password: Some("pw".to_string()),
            ..Default::default()
        };
        let device = registry.apply_update("CamB", &update).await.unwrap();
        assert_eq!(device.service, "http://10.0.0.6:9000/onvif/device_service");
        let params = crate::onvif::ConnectParams::for_device(&device);
        assert_eq!(params.port, Some(9000));

        let moved = UpdateDeviceRequest {
            ip: Some("10.0.0.60".to_string()),
            ..Default::default()
        };
        let device = registry.apply_update("CamB", &moved).await.unwrap();
        assert_eq!(device.ip, "10.0.0.60");
        assert_eq!(device.service, "http://10.0.0.60:9000/onvif/device_service");
    }

    #[tokio::test]
    async fn test_record_without_urn_or_name_is_invalid() {
        let (_, registry) = registry();
        let record = DiscoveryRecord {
            address: "10.0.0.7".to_string(),
            ..Default::default()
        };
        let err = registry.reconcile(&record).await.unwrap_err();
        assert!(matches!(err, AdapterError::InvalidDescriptor(_)));
    }

    #[tokio::test]
    async fn test_nameless_record_falls_back_to_urn_serial() {
        let (_, registry) = registry();
        let mut record = nvt_record("urn:uuid:4d454930-0000-1000-8000-bcbac2a1b2c3", "", "10.0.0.8");
        record.name = None;
        assert_eq!(registry.reconcile(&record).await.unwrap(), "bcbac2a1b2c3");
    }

    #[tokio::test]
    async fn test_load_unknown_device() {
        let (_, registry) = registry();
        let err = registry.load("Nope").await.unwrap_err();
        assert!(matches!(err, AdapterError::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn test_apply_update_sets_credentials_and_name() {
        let (store, registry) = registry();
        registry.reconcile(&nvt_record("urn:uuid:9", "Gate", "10.0.0.9")).await.unwrap();

        let update = UpdateDeviceRequest {
            name: Some("Front gate".to_string()),
            user: Some("admin".to_string()),
            password: Some("pw".to_string()),
            ..Default::default()
        };
        let device = registry.apply_update("Gate", &update).await.unwrap();
        assert!(device.has_credentials());
        assert_eq!(device.ip, "10.0.0.9");
        let obj = store.get_object("Gate").await.unwrap().unwrap();
        assert_eq!(obj.common.name, "Front gate");
    }

    #[tokio::test]
    async fn test_main_info_refresh_keeps_identity() {
        let (_, registry) = registry();
        registry.reconcile(&nvt_record("urn:uuid:9", "Gate", "10.0.0.9")).await.unwrap();
        let info = DeviceInformation {
            manufacturer: Some("Acme".to_string()),
            serial_number: Some("SN1".to_string()),
            profile_s: Some(true),
            ..Default::default()
        };
        registry.update_main_info("Gate", &info, Some(8000)).await.unwrap();

        let device = registry.load("Gate").await.unwrap();
        assert_eq!(device.manufacturer.as_deref(), Some("Acme"));
        assert_eq!(device.port, Some(8000));
        assert_eq!(device.urn.as_deref(), Some("urn:uuid:9"));
    }
}
