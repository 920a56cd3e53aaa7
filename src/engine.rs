use crate::config_store::{ConfigStore, ConfigStoreError};
use crate::discovery;
use crate::domain::events::EngineEvent;
use crate::domain::tally::{TallyMap, TallyState};
use crate::model::{DeviceModel, SetParamError};
use crate::paramspec::MotionKind;
use crate::session::{self, CommandQueue, ConnectionState, DeviceEndpoint, SessionConfig, SessionHandle};
use crate::tally::command_port::{self, CommandPortError};
use crate::tally::router::{self, check_valid, RouterMsg, TallyMapError, TallyTarget};
use crate::tally::umd::{self, UmdError};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Launch-time tunables, resolved by the config layer in `app_config`.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub umd_bind_addr: String,
    pub command_port_bind_addr: String,
    pub event_channel_size: usize,
    pub shutdown_grace: Duration,
    pub session: SessionConfig,
    /// Skip the network browser entirely (tests and headless setups).
    pub enable_discovery: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            umd_bind_addr: "0.0.0.0:60000".to_string(),
            command_port_bind_addr: "0.0.0.0:1234".to_string(),
            event_channel_size: 64,
            shutdown_grace: Duration::from_secs(2),
            session: SessionConfig::default(),
            enable_discovery: true,
        }
    }
}

struct DeviceEntry {
    model: Arc<RwLock<DeviceModel>>,
    session: SessionHandle,
}

type DeviceMap = Arc<RwLock<HashMap<String, DeviceEntry>>>;

/// Applies routed tally to whichever device currently owns the index.
struct DeviceTallyTarget {
    store: Arc<ConfigStore>,
    devices: DeviceMap,
}

#[async_trait]
impl TallyTarget for DeviceTallyTarget {
    async fn apply_tally(&self, device_index: u32, state: TallyState) {
        let Some(id) = self.store.device_id_at_index(device_index).await else {
            debug!(device_index, "No device at tally index");
            return;
        };
        let devices = self.devices.read().await;
        if let Some(entry) = devices.get(&id) {
            entry.model.write().await.set_tally(state).await;
        }
    }
}

struct EngineInner {
    settings: EngineSettings,
    store: Arc<ConfigStore>,
    devices: DeviceMap,
    events_tx: mpsc::Sender<EngineEvent>,
    router_tx: mpsc::Sender<RouterMsg>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Top level component: owns discovery, the config store binding, the tally
/// plumbing and one session plus model per active device.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Bring every component up. Listener bind failures are fatal here; a
    /// discovery failure is fatal only when no seed config exists.
    #[instrument(skip_all)]
    pub async fn open(settings: EngineSettings, store: Arc<ConfigStore>) -> Result<Engine, EngineError> {
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(settings.event_channel_size);
        let devices: DeviceMap = Arc::new(RwLock::new(HashMap::new()));
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let target = Arc::new(DeviceTallyTarget { store: Arc::clone(&store), devices: Arc::clone(&devices) });
        let router = router::spawn(store.tally_maps().await, target, cancel.child_token());
        let router_tx = router.sender();

        let umd_addr = store.umd_bind_addr().await.unwrap_or_else(|| settings.umd_bind_addr.clone());
        umd::spawn(&umd_addr, router.sender(), cancel.child_token()).await?;

        let port_addr = store
            .command_port_bind_addr()
            .await
            .unwrap_or_else(|| settings.command_port_bind_addr.clone());
        command_port::spawn(&port_addr, router.vector(), router.sender(), cancel.child_token()).await?;

        if settings.enable_discovery {
            match discovery::spawn(events_tx.clone(), cancel.child_token()) {
                Ok(handle) => tasks.push(handle),
                Err(e) => {
                    if store.list().await.is_empty() {
                        return Err(EngineError::Discovery(e));
                    }
                    warn!("⚠️ Discovery unavailable, running from stored config only: {}", e);
                }
            }
        }

        let inner = Arc::new(EngineInner {
            settings,
            store,
            devices,
            events_tx,
            router_tx,
            cancel,
            tasks: Mutex::new(tasks),
        });

        let loop_inner = Arc::clone(&inner);
        inner.tasks.lock().await.push(tokio::spawn(event_loop(loop_inner, events_rx)));

        let engine = Engine { inner };
        engine.connect_always_connected().await;
        info!("🔥 Engine open");
        Ok(engine)
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.inner.store
    }

    /// Event inbox; discovery and sessions feed it, tests can too.
    pub fn events(&self) -> mpsc::Sender<EngineEvent> {
        self.inner.events_tx.clone()
    }

    pub async fn model(&self, id: &str) -> Option<Arc<RwLock<DeviceModel>>> {
        self.inner.devices.read().await.get(id).map(|entry| Arc::clone(&entry.model))
    }

    pub async fn connection_state(&self, id: &str) -> Option<ConnectionState> {
        self.inner.devices.read().await.get(id).map(|entry| entry.session.state())
    }

    pub async fn connect_device(&self, id: &str) {
        let _ = self.inner.events_tx.send(EngineEvent::ConnectRequest { id: id.to_string() }).await;
    }

    pub async fn disconnect_device(&self, id: &str) {
        let _ = self.inner.events_tx.send(EngineEvent::DisconnectRequest { id: id.to_string() }).await;
    }

    pub async fn reconnect_device(&self, id: &str) {
        let _ = self.inner.events_tx.send(EngineEvent::ReconnectRequest { id: id.to_string() }).await;
    }

    pub async fn drive_motion(&self, id: &str, kind: MotionKind, speed: i8) {
        let devices = self.inner.devices.read().await;
        if let Some(entry) = devices.get(id) {
            entry.session.drive_motion(kind, speed);
        }
    }

    pub async fn release_motion(&self, id: &str, kind: MotionKind) {
        let devices = self.inner.devices.read().await;
        if let Some(entry) = devices.get(id) {
            entry.session.release_motion(kind);
        }
    }

    /// Recall a stored zoom preset (A/B/C) on the given device.
    pub async fn recall_zoom_preset(&self, id: &str, slot: &str) -> Result<(), EngineError> {
        let devices = self.inner.devices.read().await;
        if let Some(entry) = devices.get(id) {
            entry.model.write().await.recall_zoom_preset(slot).await?;
        }
        Ok(())
    }

    /// Move a device to a new index, swapping with any occupant, and keep
    /// the affected models in step.
    pub async fn set_device_index(&self, id: &str, index: u32) -> Result<(), EngineError> {
        let occupant = self.inner.store.device_id_at_index(index).await;
        let previous = self.inner.store.get(id).await.and_then(|d| d.record.device_index);
        self.inner.store.set_index(id, index).await?;

        let devices = self.inner.devices.read().await;
        if let Some(entry) = devices.get(id) {
            entry.model.write().await.set_device_index(index);
        }
        if let (Some(other), Some(previous)) = (occupant, previous) {
            if other != id {
                if let Some(entry) = devices.get(&other) {
                    entry.model.write().await.set_device_index(previous);
                }
            }
        }
        Ok(())
    }

    /// Validate and install a tally map, persisting it with the config.
    pub async fn set_tally_map(&self, device_index: u32, map: TallyMap) -> Result<(), EngineError> {
        let known = self.inner.store.device_id_at_index(device_index).await.is_some();
        check_valid(device_index, &map, known)?;
        self.inner.store.set_tally_map(device_index, map).await?;
        let _ = self.inner.router_tx.send(RouterMsg::MapChanged { device_index, map }).await;
        Ok(())
    }

    async fn connect_always_connected(&self) {
        for device in self.inner.store.list().await {
            if device.record.always_connect {
                let _ = self
                    .inner
                    .events_tx
                    .send(EngineEvent::ConnectRequest { id: device.record.id.clone() })
                    .await;
            }
        }
    }

    /// Cancel everything, give sessions a bounded grace period to finish
    /// in parallel, then flush the config document.
    #[instrument(skip_all)]
    pub async fn shutdown(&self) {
        info!("Engine closing...");
        self.inner.cancel.cancel();

        let entries: Vec<DeviceEntry> = {
            let mut devices = self.inner.devices.write().await;
            devices.drain().map(|(_, entry)| entry).collect()
        };
        let joins = entries.into_iter().map(|entry| entry.session.join());
        if timeout(self.inner.settings.shutdown_grace, join_all(joins)).await.is_err() {
            warn!("⚠️ Sessions did not finish within the shutdown grace period");
        }

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().await.drain(..).collect();
        if timeout(self.inner.settings.shutdown_grace, join_all(tasks)).await.is_err() {
            warn!("⚠️ Background tasks did not finish within the shutdown grace period");
        }

        if let Err(e) = self.inner.store.flush().await {
            warn!("⚠️ Could not flush config on shutdown: {}", e);
        }
        info!("✅ Engine closed");
    }
}

/// Single ordered stream of everything that changes device lifecycles.
#[instrument(skip_all)]
async fn event_loop(inner: Arc<EngineInner>, mut events_rx: mpsc::Receiver<EngineEvent>) {
    loop {
        let event = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            event = events_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        debug!("🔵 Engine event: {:?}", event);
        match event {
            EngineEvent::DeviceSeen(seen) => {
                let config = match inner.store.merge_discovered(&seen).await {
                    Ok(config) => config,
                    Err(e) => {
                        warn!(device_id = %seen.id, "⚠️ Discovery rejected: {}", e);
                        continue;
                    }
                };
                inner.store.mark_online(&seen.id, true).await;
                if config.record.device_index.is_none() {
                    if let Err(e) = inner.store.assign_index(&seen.id).await {
                        warn!(device_id = %seen.id, "⚠️ Could not assign index: {}", e);
                    }
                }
                if config.record.always_connect {
                    ensure_session(&inner, &seen.id).await;
                }
            }
            EngineEvent::DeviceLost { id } => {
                // The session stays up and rides its backoff; only the
                // online flag changes.
                inner.store.mark_online(&id, false).await;
            }
            EngineEvent::ConnectRequest { id } => {
                ensure_session(&inner, &id).await;
            }
            EngineEvent::DisconnectRequest { id } => {
                let devices = inner.devices.read().await;
                if let Some(entry) = devices.get(&id) {
                    entry.session.close().await;
                }
            }
            EngineEvent::ReconnectRequest { id } => {
                let reconnected = {
                    let devices = inner.devices.read().await;
                    match devices.get(&id) {
                        Some(entry) => {
                            entry.session.reconnect().await;
                            true
                        }
                        None => false,
                    }
                };
                if !reconnected {
                    ensure_session(&inner, &id).await;
                }
            }
            EngineEvent::SessionState { id, state } => {
                inner.store.mark_active(&id, state == ConnectionState::Connected).await;
            }
        }
    }
    debug!("Engine event loop ended");
}

/// Create the model and session for a device, or nudge an existing session
/// to reconnect. The model is created once and survives reconnects.
async fn ensure_session(inner: &Arc<EngineInner>, id: &str) {
    {
        let devices = inner.devices.read().await;
        if let Some(entry) = devices.get(id) {
            if entry.session.state() != ConnectionState::Connected {
                entry.session.reconnect().await;
            }
            return;
        }
    }
    let Some(config) = inner.store.get(id).await else {
        warn!(device_id = id, "⚠️ Connect requested for unknown device");
        return;
    };
    let record = config.record;
    let index = record.device_index.unwrap_or(0);

    let queue = CommandQueue::new(16);
    let model = Arc::new(RwLock::new(DeviceModel::new(id, index, queue.sink())));
    let endpoint = DeviceEndpoint {
        hostaddr: record.hostaddr,
        hostport: record.hostport,
        auth_user: record.auth_user.unwrap_or_default(),
        auth_pass: record.auth_pass.unwrap_or_default(),
    };
    let session = match session::spawn(
        id.to_string(),
        endpoint,
        Arc::clone(&model),
        queue,
        inner.settings.session.clone(),
        inner.events_tx.clone(),
        inner.cancel.child_token(),
    ) {
        Ok(session) => session,
        Err(e) => {
            warn!(device_id = id, "⚠️ Could not start session: {}", e);
            return;
        }
    };
    info!(device_id = id, "🎥 Session started");
    inner.devices.write().await.insert(id.to_string(), DeviceEntry { model, session });
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Discovery(#[from] discovery::DiscoveryError),
    #[error(transparent)]
    Umd(#[from] UmdError),
    #[error(transparent)]
    CommandPort(#[from] CommandPortError),
    #[error(transparent)]
    Store(#[from] ConfigStoreError),
    #[error(transparent)]
    TallyMap(#[from] TallyMapError),
    #[error(transparent)]
    Param(#[from] SetParamError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::DiscoveredDevice;
    use crate::domain::tally::{TallyKey, TallySource, TallyType};
    use pretty_assertions::assert_eq;

    fn seen(serial: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            id: format!("GY-HC500-{}", serial),
            model_name: "GY-HC500".to_string(),
            serial_number: serial.to_string(),
            name: format!("hc500-{}", serial),
            hostaddr: "127.0.0.1".to_string(),
            hostport: 80,
        }
    }

    async fn engine() -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::open(&dir.path().join("config.json")).await.unwrap());
        let settings = EngineSettings {
            umd_bind_addr: "127.0.0.1:0".to_string(),
            command_port_bind_addr: "127.0.0.1:0".to_string(),
            enable_discovery: false,
            ..EngineSettings::default()
        };
        let engine = Engine::open(settings, store).await.unwrap();
        (engine, dir)
    }

    async fn index_of(engine: &Engine, serial: &str) -> Option<u32> {
        engine.store().get(&format!("GY-HC500-{}", serial)).await.and_then(|d| d.record.device_index)
    }

    async fn wait_for_index(engine: &Engine, serial: &str) -> u32 {
        timeout(Duration::from_secs(2), async {
            loop {
                if let Some(index) = index_of(engine, serial).await {
                    return index;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("index assigned")
    }

    #[tokio::test]
    async fn discovery_assigns_compact_indices_and_fills_holes() {
        let (engine, _dir) = engine().await;
        let events = engine.events();

        for serial in ["000A", "000B", "000C"] {
            events.send(EngineEvent::DeviceSeen(seen(serial))).await.unwrap();
        }
        assert_eq!(wait_for_index(&engine, "000A").await, 0);
        assert_eq!(wait_for_index(&engine, "000B").await, 1);
        assert_eq!(wait_for_index(&engine, "000C").await, 2);

        engine.store().remove("GY-HC500-000B").await.unwrap();
        assert_eq!(index_of(&engine, "000C").await, Some(2));

        events.send(EngineEvent::DeviceSeen(seen("000D"))).await.unwrap();
        assert_eq!(wait_for_index(&engine, "000D").await, 1);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn device_lost_marks_offline_without_dropping_the_record() {
        let (engine, _dir) = engine().await;
        let events = engine.events();

        events.send(EngineEvent::DeviceSeen(seen("000A"))).await.unwrap();
        wait_for_index(&engine, "000A").await;

        events.send(EngineEvent::DeviceLost { id: "GY-HC500-000A".to_string() }).await.unwrap();
        timeout(Duration::from_secs(2), async {
            loop {
                let config = engine.store().get("GY-HC500-000A").await.unwrap();
                if !config.online {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("device marked offline");

        assert!(engine.store().get("GY-HC500-000A").await.is_some());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn tally_maps_are_validated_before_they_are_installed() {
        let (engine, _dir) = engine().await;
        let events = engine.events();
        events.send(EngineEvent::DeviceSeen(seen("000A"))).await.unwrap();
        wait_for_index(&engine, "000A").await;

        let source = TallySource { key: TallyKey::new(0, 3), tally_type: TallyType::RhTally };
        let valid = TallyMap { program: Some(source), preview: None };
        engine.set_tally_map(0, valid).await.unwrap();

        let unknown_device = engine.set_tally_map(7, valid).await;
        assert!(matches!(unknown_device, Err(EngineError::TallyMap(TallyMapError::UnknownDevice { .. }))));

        let same_source = TallyMap { program: Some(source), preview: Some(source) };
        let identical = engine.set_tally_map(0, same_source).await;
        assert!(matches!(identical, Err(EngineError::TallyMap(TallyMapError::SourcesIdentical))));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn index_reassignment_swaps_with_the_occupant() {
        let (engine, _dir) = engine().await;
        let events = engine.events();
        for serial in ["000A", "000B"] {
            events.send(EngineEvent::DeviceSeen(seen(serial))).await.unwrap();
        }
        wait_for_index(&engine, "000B").await;

        engine.set_device_index("GY-HC500-000B", 0).await.unwrap();

        assert_eq!(index_of(&engine, "000A").await, Some(1));
        assert_eq!(index_of(&engine, "000B").await, Some(0));
        engine.shutdown().await;
    }
}
