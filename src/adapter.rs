//! Adapter lifecycle and event loop.

use crate::config::AdapterConfig;
use crate::discovery::DiscoveryLoop;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::mirror::CapabilityMirror;
use crate::models::{AddDeviceRequest, AdapterMessage, Device, DeviceKey, UpdateDeviceRequest};
use crate::onvif::{ConnectParams, DeviceProbe, OnvifConnector, OnvifDevice, DEFAULT_SERVICE_PATH};
use crate::path;
use crate::registry::DeviceRegistry;
use crate::scheduler::DiscoveryScheduler;
use crate::session::SessionPool;
use crate::store::{ObjectDescriptor, StateStore};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct Adapter {
    config: AdapterConfig,
    store: Arc<dyn StateStore>,
    connector: Arc<dyn OnvifConnector>,
    registry: Arc<DeviceRegistry>,
    mirror: Arc<CapabilityMirror>,
    sessions: Arc<SessionPool>,
    discovery: Arc<DiscoveryLoop>,
    dispatcher: Arc<Dispatcher>,
    // one connect-and-sync at a time per device
    sync_locks: Mutex<HashMap<DeviceKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl Adapter {
    pub fn new(
        config: AdapterConfig,
        store: Arc<dyn StateStore>,
        connector: Arc<dyn OnvifConnector>,
        probe: Arc<dyn DeviceProbe>,
    ) -> Arc<Self> {
        let registry = Arc::new(DeviceRegistry::new(store.clone()));
        let mirror = Arc::new(CapabilityMirror::new(store.clone()));
        let sessions = Arc::new(SessionPool::new(connector.clone()));
        let discovery = Arc::new(DiscoveryLoop::new(probe, registry.clone(), sessions.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            registry.clone(),
            mirror.clone(),
            sessions.clone(),
            discovery.clone(),
        ));

        Arc::new(Self {
            config,
            store,
            connector,
            registry,
            mirror,
            sessions,
            discovery,
            dispatcher,
            sync_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Startup: root discover button, optional discovery pass, then connect
    /// every device that has credentials.
    pub async fn on_ready(self: &Arc<Self>) -> Result<()> {
        self.store
            .set_object(path::DISCOVER, ObjectDescriptor::button("Discover devices"))
            .await?;
        self.store
            .set_state(path::DISCOVER, Value::Bool(false), true)
            .await?;

        if self.config.discovery.enabled && self.config.discovery.on_startup {
            if let Err(e) = self.discovery.auto_discover().await {
                warn!(error = %e, "startup discovery failed");
            }
        }
        self.connect_all().await
    }

    /// Discovery pass followed by connecting whatever is configured but not
    /// yet connected. Used by the periodic schedule.
    pub async fn discover_and_connect(self: &Arc<Self>) {
        if let Err(e) = self.discovery.auto_discover().await {
            warn!(error = %e, "scheduled discovery failed");
            return;
        }
        if let Err(e) = self.connect_all().await {
            warn!(error = %e, "failed to connect discovered devices");
        }
    }

    /// Connect and sync every configured device without an open session,
    /// each as its own task.
    pub async fn connect_all(self: &Arc<Self>) -> Result<()> {
        let mut tasks = Vec::new();
        for (key, device) in self.registry.devices().await? {
            if !device.has_credentials() {
                info!(device = %key, ip = %device.ip, "skipping unconfigured device");
                continue;
            }
            if self.sessions.is_connected(&key).await {
                continue;
            }
            let adapter = self.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = adapter.connect_and_sync(&key).await {
                    warn!(device = %key, error = %e, "connect failed");
                }
            }));
        }
        for task in futures::future::join_all(tasks).await {
            if let Err(e) = task {
                error!(error = %e, "connect task panicked");
            }
        }
        Ok(())
    }

    fn sync_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.sync_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Open a fresh session, refresh the device's main info and mirror its
    /// capabilities. The session stays open only when the whole sync
    /// succeeded, so a failed device is retried by the next `connect_all`.
    pub async fn connect_and_sync(&self, key: &str) -> Result<()> {
        let lock = self.sync_lock(key);
        let _serialized = lock.lock().await;

        let device = self.registry.load(key).await?;
        let session = self.sessions.connect(key, &device).await?;
        if let Err(e) = self.sync(key, &device, session.as_ref()).await {
            self.sessions.forget(key).await;
            return Err(e);
        }
        info!(device = key, ip = %device.ip, "device synchronized");
        Ok(())
    }

    async fn sync(&self, key: &str, device: &Device, session: &dyn OnvifDevice) -> Result<()> {
        let snapshot = session.snapshot().await?;
        self.registry
            .update_main_info(key, &snapshot.device_information, ConnectParams::for_device(device).port)
            .await?;
        self.mirror.mirror(key, &snapshot, session).await
    }

    pub async fn handle_message(self: &Arc<Self>, message: AdapterMessage) -> Result<()> {
        match message {
            AdapterMessage::AddDevice(request) => self.add_device(&request).await.map(|_| ()),
            AdapterMessage::UpdateDevice(updates) => {
                self.update_devices(&updates).await;
                Ok(())
            }
        }
    }

    /// Connect to a device by address, register it under the name it reports
    /// and sync it.
    pub async fn add_device(&self, request: &AddDeviceRequest) -> Result<DeviceKey> {
        let port = request.port.unwrap_or(self.config.onvif.default_port);
        let device = Device {
            ip: request.ip.trim().to_string(),
            port: Some(port),
            service: format!("http://{}:{}{}", request.ip.trim(), port, DEFAULT_SERVICE_PATH),
            user: request.user.clone().unwrap_or_default(),
            password: request.password.clone().unwrap_or_default(),
            ..Default::default()
        };

        let session = self.connector.connect(&ConnectParams::for_device(&device)).await?;
        let info = session.snapshot().await?.device_information;
        let name = info
            .name
            .clone()
            .or(info.serial_number.clone())
            .unwrap_or_else(|| device.ip.clone());

        let key = self.registry.register_manual(&name, &device).await?;
        self.sessions.forget(&key).await;
        self.connect_and_sync(&key).await?;
        Ok(key)
    }

    /// Apply each edit; devices that end up with credentials are reconnected.
    /// A failing device does not stop the others.
    pub async fn update_devices(&self, updates: &BTreeMap<DeviceKey, UpdateDeviceRequest>) {
        for (key, update) in updates {
            let device = match self.registry.apply_update(key, update).await {
                Ok(device) => device,
                Err(e) => {
                    warn!(device = %key, error = %e, "update rejected");
                    continue;
                }
            };
            self.sessions.forget(key).await;
            if !device.has_credentials() {
                debug!(device = %key, "still unconfigured after update");
                continue;
            }
            if let Err(e) = self.connect_and_sync(key).await {
                warn!(device = %key, error = %e, "connect after update failed");
            }
        }
    }

    /// Event loop: dispatch user writes, handle inbound messages, run the
    /// discovery schedule, until `shutdown` resolves.
    pub async fn run(
        self: Arc<Self>,
        mut messages: mpsc::Receiver<AdapterMessage>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let mut changes = self.store.subscribe();
        let scheduler = self.start_schedule().await;

        self.on_ready().await?;
        info!(namespace = %self.config.adapter.namespace, "adapter ready");

        tokio::pin!(shutdown);
        let mut messages_open = true;
        loop {
            tokio::select! {
                change = changes.recv() => match change {
                    Ok(change) if !change.state.ack => {
                        let dispatcher = self.dispatcher.clone();
                        tokio::spawn(async move {
                            dispatcher.dispatch(&change.id, &change.state).await;
                        });
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "state changes dropped"),
                    Err(RecvError::Closed) => break,
                },
                message = messages.recv(), if messages_open => match message {
                    Some(message) => {
                        let adapter = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = adapter.handle_message(message).await {
                                warn!(error = %e, "message failed");
                            }
                        });
                    }
                    None => {
                        debug!("message channel closed");
                        messages_open = false;
                    }
                },
                _ = &mut shutdown => break,
            }
        }

        if let Some(scheduler) = scheduler {
            if let Err(e) = scheduler.shutdown().await {
                warn!(error = %e, "scheduler did not stop cleanly");
            }
        }
        info!("adapter stopped");
        Ok(())
    }

    async fn start_schedule(self: &Arc<Self>) -> Option<DiscoveryScheduler> {
        let cron = self.config.discovery.periodic()?.to_string();
        let scheduler = match DiscoveryScheduler::new().await {
            Ok(scheduler) => scheduler,
            Err(e) => {
                warn!(error = %e, "periodic discovery unavailable");
                return None;
            }
        };
        let adapter = Arc::downgrade(self);
        let scheduled = scheduler
            .schedule(&cron, move || {
                let adapter = adapter.clone();
                async move {
                    if let Some(adapter) = adapter.upgrade() {
                        adapter.discover_and_connect().await;
                    }
                }
            })
            .await;
        match scheduled {
            Ok(_) => Some(scheduler),
            Err(e) => {
                warn!(error = %e, "periodic discovery disabled");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onvif::fake::{nvt_record, Call, FakeConnector, FakeDevice, FakeProbe};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn config() -> AdapterConfig {
        let mut config = AdapterConfig::default();
        config.discovery.schedule = String::new();
        config
    }

    fn adapter(
        connector: FakeConnector,
        records: Vec<crate::models::DiscoveryRecord>,
    ) -> (Arc<MemoryStore>, Arc<FakeConnector>, Arc<Adapter>) {
        let store = Arc::new(MemoryStore::new());
        let connector = Arc::new(connector);
        let adapter = Adapter::new(config(), store.clone(), connector.clone(), Arc::new(FakeProbe::new(records)));
        (store, connector, adapter)
    }

    #[tokio::test]
    async fn test_ready_connects_only_configured_devices() {
        let connector = FakeConnector::new()
            .with(FakeDevice::ptz_camera("10.0.0.5"))
            .with(FakeDevice::plain_camera("10.0.0.6"));
        let (store, connector, adapter) = adapter(
            connector,
            vec![nvt_record("urn:uuid:5", "CamA", "10.0.0.5"), nvt_record("urn:uuid:6", "CamB", "10.0.0.6")],
        );
        // CamA was configured in an earlier run
        adapter
            .registry()
            .create(
                "CamA",
                "CamA",
                &Device {
                    urn: Some("urn:uuid:5".into()),
                    ip: "10.0.0.5".into(),
                    user: "admin".into(),
                    password: "pw".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        adapter.on_ready().await.unwrap();

        assert!(store.get_object("discover").await.unwrap().is_some());
        assert!(store.get_object("CamB").await.unwrap().is_some());
        assert!(store.get_object("CamA.ptz.presets.new").await.unwrap().is_some());
        assert!(store.get_object("CamB.profiles.0").await.unwrap().is_none());
        let ips: Vec<String> = connector.connects().into_iter().map(|p| p.ip).collect();
        assert_eq!(ips, vec!["10.0.0.5".to_string()]);

        let device = adapter.registry().load("CamA").await.unwrap();
        assert_eq!(device.manufacturer.as_deref(), Some("Acme"));
    }

    #[tokio::test]
    async fn test_add_device_uses_reported_name() {
        let (store, _, adapter) = adapter(FakeConnector::new().with(FakeDevice::plain_camera("10.0.0.20")), Vec::new());
        let request = AddDeviceRequest {
            ip: "10.0.0.20".into(),
            port: Some(8000),
            user: Some("admin".into()),
            password: Some("pw".into()),
        };

        let key = adapter.add_device(&request).await.unwrap();
        assert_eq!(key, "Acme_Cam");
        let device = adapter.registry().load(&key).await.unwrap();
        assert_eq!(device.service, "http://10.0.0.20:8000/onvif/device_service");
        assert!(device.has_credentials());
        assert!(store.get_object("Acme_Cam.profiles.0.stream_uri").await.unwrap().is_some());
        assert!(store.get_object("Acme_Cam.system.reboot").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_add_unreachable_device_fails() {
        let (store, _, adapter) = adapter(FakeConnector::new(), Vec::new());
        let request = AddDeviceRequest {
            ip: "10.0.0.30".into(),
            ..Default::default()
        };
        assert!(adapter.add_device(&request).await.is_err());
        assert!(store.object_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_with_credentials_connects() {
        let (store, connector, adapter) = adapter(
            FakeConnector::new().with(FakeDevice::plain_camera("10.0.0.6")),
            vec![nvt_record("urn:uuid:6", "CamB", "10.0.0.6")],
        );
        adapter.on_ready().await.unwrap();
        assert!(connector.connects().is_empty());

        let raw = r#"{"command":"updateDevice","message":{"CamB":{"name":"Back yard","user":"admin","password":"pw"},"Ghost":{"user":"x"}}}"#;
        let message: AdapterMessage = serde_json::from_str(raw).unwrap();
        adapter.handle_message(message).await.unwrap();

        assert_eq!(connector.connects().len(), 1);
        assert!(store.get_object("CamB.profiles.0").await.unwrap().is_some());
        assert_eq!(store.get_object("CamB").await.unwrap().unwrap().common.name, "Back yard");
    }

    #[tokio::test]
    async fn test_failed_sync_is_retried_on_next_pass() {
        let (store, connector, adapter) = adapter(
            FakeConnector::new().with(FakeDevice::plain_camera("10.0.0.5").faulty("snapshot")),
            Vec::new(),
        );
        adapter
            .registry()
            .create(
                "CamA",
                "CamA",
                &Device {
                    ip: "10.0.0.5".into(),
                    user: "admin".into(),
                    password: "pw".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        adapter.connect_all().await.unwrap();
        assert!(store.get_object("CamA.profiles.0").await.unwrap().is_none());

        // the camera answers again
        connector.add(Arc::new(FakeDevice::plain_camera("10.0.0.5")));
        adapter.discover_and_connect().await;

        assert_eq!(connector.connects().len(), 2);
        assert!(store.get_object("CamA.profiles.0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_discovering_a_manually_added_camera_keeps_one_device() {
        let (_, _, adapter) = adapter(
            FakeConnector::new().with(FakeDevice::plain_camera("10.0.0.20")),
            vec![nvt_record("urn:uuid:20", "Yard", "10.0.0.20")],
        );
        let request = AddDeviceRequest {
            ip: "10.0.0.20".into(),
            port: Some(8000),
            user: Some("admin".into()),
            password: Some("pw".into()),
        };
        adapter.add_device(&request).await.unwrap();
        adapter.on_ready().await.unwrap();

        let devices = adapter.registry().devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].0, "Acme_Cam");
        assert_eq!(devices[0].1.urn.as_deref(), Some("urn:uuid:20"));
        assert!(devices[0].1.has_credentials());
    }

    #[tokio::test]
    async fn test_port_edit_is_used_for_the_next_connect() {
        let mut record = nvt_record("urn:uuid:6", "CamB", "10.0.0.6");
        record.service = "http://10.0.0.6:8080/onvif/device_service".to_string();
        let (_, connector, adapter) = adapter(FakeConnector::new().with(FakeDevice::plain_camera("10.0.0.6")), vec![record]);
        adapter.on_ready().await.unwrap();

        let mut updates = BTreeMap::new();
        updates.insert(
            "CamB".to_string(),
            UpdateDeviceRequest {
                port: Some(9000),
                user: Some("admin".into()),
                password: Some("pw".into()),
                ..Default::default()
            },
        );
        adapter.update_devices(&updates).await;

        let ports: Vec<Option<u16>> = connector.connects().into_iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![Some(9000)]);
        assert_eq!(adapter.registry().load("CamB").await.unwrap().port, Some(9000));
    }

    #[tokio::test]
    async fn test_run_dispatches_user_writes() {
        let (store, connector, adapter) = adapter(
            FakeConnector::new().with(FakeDevice::ptz_camera("10.0.0.5")),
            vec![nvt_record("urn:uuid:5", "CamA", "10.0.0.5")],
        );
        let (_tx, rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(adapter.clone().run(rx, async move {
            let _ = stop_rx.await;
        }));

        // wait for startup discovery to register CamA
        let mut ready = false;
        for _ in 0..100 {
            if store.get_object("CamA.system.reboot").await.unwrap().is_some() {
                ready = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ready);

        store.set_state("CamA.system.reboot", json!(true), false).await.unwrap();
        let mut rebooted = false;
        for _ in 0..100 {
            if connector.device("10.0.0.5").calls().contains(&Call::Reboot) {
                rebooted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(rebooted);

        stop_tx.send(()).unwrap();
        running.await.unwrap().unwrap();
    }
}
