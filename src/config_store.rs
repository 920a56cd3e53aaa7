use crate::domain::events::DiscoveredDevice;
use crate::domain::tally::TallyMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

const EVENT_CHANNEL_SIZE: usize = 64;

/// Persisted, user-editable fields of one device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub display_name: String,
    pub hostaddr: String,
    pub hostport: u16,
    pub auth_user: Option<String>,
    pub auth_pass: Option<String>,
    pub device_index: Option<u32>,
    pub always_connect: bool,
}

/// A device record plus its derived runtime flags.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceConfig {
    pub record: DeviceRecord,
    pub online: bool,
    pub active: bool,
    pub stored_in_config: bool,
}

/// Partial update applied through [`ConfigStore::upsert`]. `None` leaves a
/// field untouched; the double options clear credentials explicitly.
#[derive(Clone, Debug, Default)]
pub struct DevicePatch {
    pub display_name: Option<String>,
    pub hostaddr: Option<String>,
    pub hostport: Option<u16>,
    pub auth_user: Option<Option<String>>,
    pub auth_pass: Option<Option<String>>,
    pub always_connect: Option<bool>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StoreEvent {
    DeviceAdded { id: String },
    PropertiesUpdated { id: String, changed: Vec<&'static str> },
    DeviceRemoved { id: String },
}

/// The single on-disk document. Field order is fixed by this struct so the
/// serialized form is stable across rewrites.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    devices: BTreeMap<String, DeviceRecord>,
    #[serde(default)]
    tally_maps: BTreeMap<u32, TallyMap>,
    #[serde(default)]
    umd_bind_addr: Option<String>,
    #[serde(default)]
    command_port_bind_addr: Option<String>,
    #[serde(default)]
    midi_input_port: Option<String>,
    #[serde(default)]
    midi_output_port: Option<String>,
}

#[derive(Debug)]
struct StoreInner {
    devices: BTreeMap<String, DeviceConfig>,
    /// Snapshot captured when a record was first seen; the diff against it
    /// drives the UI's per-field "edited" indicator.
    baselines: HashMap<String, DeviceRecord>,
    tally_maps: BTreeMap<u32, TallyMap>,
    umd_bind_addr: Option<String>,
    command_port_bind_addr: Option<String>,
    midi_input_port: Option<String>,
    midi_output_port: Option<String>,
    last_written: Option<String>,
}

/// Durable map of known devices plus the interface settings that persist
/// alongside them. One document, rewritten atomically; writes that do not
/// change the serialized form are suppressed.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    inner: Mutex<StoreInner>,
    events: broadcast::Sender<StoreEvent>,
}

impl ConfigStore {
    /// Load the document at `path`, or start empty when none exists yet.
    /// A present but unreadable document is an error: silently discarding
    /// user configuration is worse than refusing to start.
    #[instrument]
    pub async fn open(path: &Path) -> Result<Self, ConfigStoreError> {
        let document = match fs::read_to_string(path).await {
            Ok(text) => {
                serde_json::from_str::<ConfigDocument>(&text).map_err(|e| ConfigStoreError::Unreadable {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigDocument::default(),
            Err(e) => {
                return Err(ConfigStoreError::Unreadable { path: path.to_path_buf(), reason: e.to_string() })
            }
        };
        info!("📁 Config loaded, {} device(s) known", document.devices.len());

        let mut devices = BTreeMap::new();
        let mut baselines = HashMap::new();
        for (id, record) in document.devices {
            baselines.insert(id.clone(), record.clone());
            devices.insert(
                id,
                DeviceConfig { record, online: false, active: false, stored_in_config: true },
            );
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Ok(ConfigStore {
            path: path.to_path_buf(),
            inner: Mutex::new(StoreInner {
                devices,
                baselines,
                tally_maps: document.tally_maps,
                umd_bind_addr: document.umd_bind_addr,
                command_port_bind_addr: document.command_port_bind_addr,
                midi_input_port: document.midi_input_port,
                midi_output_port: document.midi_output_port,
                last_written: None,
            }),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub async fn list(&self) -> Vec<DeviceConfig> {
        self.inner.lock().await.devices.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<DeviceConfig> {
        self.inner.lock().await.devices.get(id).cloned()
    }

    /// Merge a discovery announcement. Unknown ids become ephemeral records
    /// (gone at process exit unless confirmed); known ids get their network
    /// fields refreshed without touching user edits.
    pub async fn merge_discovered(&self, seen: &DiscoveredDevice) -> Result<DeviceConfig, ConfigStoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.devices.get_mut(&seen.id) {
            if existing.online && existing.record.hostaddr != seen.hostaddr {
                // Two live devices advertising the same model+serial cannot
                // be told apart; refuse rather than guess.
                return Err(ConfigStoreError::DuplicateDeviceId { id: seen.id.clone() });
            }
            let mut changed = Vec::new();
            if existing.record.hostaddr != seen.hostaddr {
                existing.record.hostaddr = seen.hostaddr.clone();
                changed.push("hostaddr");
            }
            if existing.record.hostport != seen.hostport {
                existing.record.hostport = seen.hostport;
                changed.push("hostport");
            }
            let snapshot = existing.clone();
            if !changed.is_empty() {
                let _ = self.events.send(StoreEvent::PropertiesUpdated { id: seen.id.clone(), changed });
                self.save(&mut inner).await?;
            }
            return Ok(snapshot);
        }

        let record = DeviceRecord {
            id: seen.id.clone(),
            display_name: seen.name.clone(),
            hostaddr: seen.hostaddr.clone(),
            hostport: seen.hostport,
            auth_user: None,
            auth_pass: None,
            device_index: None,
            always_connect: false,
        };
        inner.baselines.insert(seen.id.clone(), record.clone());
        let config = DeviceConfig { record, online: false, active: false, stored_in_config: false };
        inner.devices.insert(seen.id.clone(), config.clone());
        let _ = self.events.send(StoreEvent::DeviceAdded { id: seen.id.clone() });
        Ok(config)
    }

    /// Apply a partial update. Emits `PropertiesUpdated` with the changed
    /// field names and persists when anything stored actually changed.
    pub async fn upsert(&self, id: &str, patch: DevicePatch) -> Result<DeviceConfig, ConfigStoreError> {
        if let Some(port) = patch.hostport {
            if port == 0 {
                return Err(ConfigStoreError::Validation { reason: "host port must be non-zero".to_string() });
            }
        }
        if let Some(name) = &patch.display_name {
            if name.is_empty() {
                return Err(ConfigStoreError::Validation { reason: "display name must not be empty".to_string() });
            }
        }

        let mut inner = self.inner.lock().await;
        let device = inner
            .devices
            .get_mut(id)
            .ok_or_else(|| ConfigStoreError::UnknownDevice { id: id.to_string() })?;

        let mut changed: Vec<&'static str> = Vec::new();
        let record = &mut device.record;
        if let Some(value) = patch.display_name {
            if record.display_name != value {
                record.display_name = value;
                changed.push("display_name");
            }
        }
        if let Some(value) = patch.hostaddr {
            if record.hostaddr != value {
                record.hostaddr = value;
                changed.push("hostaddr");
            }
        }
        if let Some(value) = patch.hostport {
            if record.hostport != value {
                record.hostport = value;
                changed.push("hostport");
            }
        }
        if let Some(value) = patch.auth_user {
            if record.auth_user != value {
                record.auth_user = value;
                changed.push("auth_user");
            }
        }
        if let Some(value) = patch.auth_pass {
            if record.auth_pass != value {
                record.auth_pass = value;
                changed.push("auth_pass");
            }
        }
        if let Some(value) = patch.always_connect {
            if record.always_connect != value {
                record.always_connect = value;
                changed.push("always_connect");
            }
        }

        let snapshot = device.clone();
        if !changed.is_empty() {
            let _ = self
                .events
                .send(StoreEvent::PropertiesUpdated { id: id.to_string(), changed });
            self.save(&mut inner).await?;
        }
        Ok(snapshot)
    }

    /// Fields currently differing from the captured baseline.
    pub async fn edited_fields(&self, id: &str) -> Vec<&'static str> {
        let inner = self.inner.lock().await;
        let (Some(device), Some(baseline)) = (inner.devices.get(id), inner.baselines.get(id)) else {
            return Vec::new();
        };
        let record = &device.record;
        let mut edited = Vec::new();
        if record.display_name != baseline.display_name {
            edited.push("display_name");
        }
        if record.hostaddr != baseline.hostaddr {
            edited.push("hostaddr");
        }
        if record.hostport != baseline.hostport {
            edited.push("hostport");
        }
        if record.auth_user != baseline.auth_user {
            edited.push("auth_user");
        }
        if record.auth_pass != baseline.auth_pass {
            edited.push("auth_pass");
        }
        if record.device_index != baseline.device_index {
            edited.push("device_index");
        }
        if record.always_connect != baseline.always_connect {
            edited.push("always_connect");
        }
        edited
    }

    /// Confirm an ephemeral record: it becomes part of the document and
    /// survives restarts.
    pub async fn persist(&self, id: &str) -> Result<(), ConfigStoreError> {
        let mut inner = self.inner.lock().await;
        let device = inner
            .devices
            .get_mut(id)
            .ok_or_else(|| ConfigStoreError::UnknownDevice { id: id.to_string() })?;
        if device.stored_in_config {
            return Ok(());
        }
        device.stored_in_config = true;
        self.save(&mut inner).await
    }

    pub async fn remove(&self, id: &str) -> Result<(), ConfigStoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .devices
            .remove(id)
            .ok_or_else(|| ConfigStoreError::UnknownDevice { id: id.to_string() })?;
        inner.baselines.remove(id);
        let _ = self.events.send(StoreEvent::DeviceRemoved { id: id.to_string() });
        self.save(&mut inner).await
    }

    pub async fn mark_online(&self, id: &str, online: bool) {
        let mut inner = self.inner.lock().await;
        if let Some(device) = inner.devices.get_mut(id) {
            device.online = online;
        }
    }

    pub async fn mark_active(&self, id: &str, active: bool) {
        let mut inner = self.inner.lock().await;
        if let Some(device) = inner.devices.get_mut(id) {
            device.active = active;
        }
    }

    /// Assign the smallest unused index to a device that has none yet.
    pub async fn assign_index(&self, id: &str) -> Result<u32, ConfigStoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(index) = inner.devices.get(id).and_then(|d| d.record.device_index) {
            return Ok(index);
        }
        let index = smallest_unused_index(&inner.devices);
        let device = inner
            .devices
            .get_mut(id)
            .ok_or_else(|| ConfigStoreError::UnknownDevice { id: id.to_string() })?;
        device.record.device_index = Some(index);
        debug!(device_id = id, index, "🔢 Assigned device index");
        assert_unique_indices(&inner.devices);
        let _ = self
            .events
            .send(StoreEvent::PropertiesUpdated { id: id.to_string(), changed: vec!["device_index"] });
        self.save(&mut inner).await?;
        Ok(index)
    }

    /// Move a device to a specific index. When another device occupies it,
    /// the two swap; observers hear about both in one pass.
    pub async fn set_index(&self, id: &str, index: u32) -> Result<(), ConfigStoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.devices.contains_key(id) {
            return Err(ConfigStoreError::UnknownDevice { id: id.to_string() });
        }
        let current = inner.devices.get(id).and_then(|d| d.record.device_index);
        if current == Some(index) {
            return Ok(());
        }

        let occupant = inner
            .devices
            .iter()
            .find(|(other, d)| other.as_str() != id && d.record.device_index == Some(index))
            .map(|(other, _)| other.clone());

        if let Some(other) = &occupant {
            let device = inner.devices.get_mut(other).expect("occupant looked up above");
            device.record.device_index = current;
        }
        let device = inner.devices.get_mut(id).expect("device checked above");
        device.record.device_index = Some(index);
        assert_unique_indices(&inner.devices);

        let _ = self
            .events
            .send(StoreEvent::PropertiesUpdated { id: id.to_string(), changed: vec!["device_index"] });
        if let Some(other) = occupant {
            let _ = self
                .events
                .send(StoreEvent::PropertiesUpdated { id: other, changed: vec!["device_index"] });
        }
        self.save(&mut inner).await
    }

    pub async fn device_id_at_index(&self, index: u32) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .devices
            .iter()
            .find(|(_, d)| d.record.device_index == Some(index))
            .map(|(id, _)| id.clone())
    }

    pub async fn tally_maps(&self) -> BTreeMap<u32, TallyMap> {
        self.inner.lock().await.tally_maps.clone()
    }

    pub async fn set_tally_map(&self, device_index: u32, map: TallyMap) -> Result<(), ConfigStoreError> {
        let mut inner = self.inner.lock().await;
        inner.tally_maps.insert(device_index, map);
        self.save(&mut inner).await
    }

    pub async fn umd_bind_addr(&self) -> Option<String> {
        self.inner.lock().await.umd_bind_addr.clone()
    }

    pub async fn command_port_bind_addr(&self) -> Option<String> {
        self.inner.lock().await.command_port_bind_addr.clone()
    }

    pub async fn set_bind_addrs(
        &self,
        umd: Option<String>,
        command_port: Option<String>,
    ) -> Result<(), ConfigStoreError> {
        let mut inner = self.inner.lock().await;
        inner.umd_bind_addr = umd;
        inner.command_port_bind_addr = command_port;
        self.save(&mut inner).await
    }

    /// Write the document out unconditionally (used at shutdown).
    pub async fn flush(&self) -> Result<(), ConfigStoreError> {
        let mut inner = self.inner.lock().await;
        self.save(&mut inner).await
    }

    /// Serialize and atomically replace the document. Skipped when the
    /// rendered form matches the last write.
    async fn save(&self, inner: &mut StoreInner) -> Result<(), ConfigStoreError> {
        let document = ConfigDocument {
            devices: inner
                .devices
                .iter()
                .filter(|(_, d)| d.stored_in_config)
                .map(|(id, d)| (id.clone(), d.record.clone()))
                .collect(),
            tally_maps: inner.tally_maps.clone(),
            umd_bind_addr: inner.umd_bind_addr.clone(),
            command_port_bind_addr: inner.command_port_bind_addr.clone(),
            midi_input_port: inner.midi_input_port.clone(),
            midi_output_port: inner.midi_output_port.clone(),
        };
        let rendered = serde_json::to_string_pretty(&document).map_err(|e| ConfigStoreError::Serialize {
            reason: e.to_string(),
        })?;
        if inner.last_written.as_deref() == Some(rendered.as_str()) {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| ConfigStoreError::Io { reason: e.to_string() })?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &rendered).await.map_err(|e| ConfigStoreError::Io { reason: e.to_string() })?;
        fs::rename(&tmp, &self.path).await.map_err(|e| ConfigStoreError::Io { reason: e.to_string() })?;
        inner.last_written = Some(rendered);
        debug!("💾 Config written");
        Ok(())
    }
}

fn smallest_unused_index(devices: &BTreeMap<String, DeviceConfig>) -> u32 {
    let mut index = 0;
    loop {
        if !devices.values().any(|d| d.record.device_index == Some(index)) {
            return index;
        }
        index += 1;
    }
}

/// Duplicate assigned indices are a programmer error; fail fast.
fn assert_unique_indices(devices: &BTreeMap<String, DeviceConfig>) {
    let mut seen = std::collections::HashSet::new();
    for device in devices.values() {
        if let Some(index) = device.record.device_index {
            assert!(seen.insert(index), "duplicate device index {} after reassignment", index);
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigStoreError {
    #[error("config at {path} is unreadable: {reason}")]
    Unreadable { path: PathBuf, reason: String },
    #[error("unknown device '{id}'")]
    UnknownDevice { id: String },
    #[error("two devices announce the same id '{id}'")]
    DuplicateDeviceId { id: String },
    #[error("invalid value: {reason}")]
    Validation { reason: String },
    #[error("could not serialize config: {reason}")]
    Serialize { reason: String },
    #[error("config write failed: {reason}")]
    Io { reason: String },
}
