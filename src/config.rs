//! Persistent configuration store.
//!
//! A single JSON document carries the known devices, the tally maps, the
//! UMD and command-port bind addresses and the MIDI port selections. The
//! document is rewritten atomically (temp file + rename) whenever its
//! serialized form changes; writes that would not alter the file are
//! suppressed.
//!
//! Device records exist in two flavors: stored records, which survive a
//! restart, and ephemeral records created from discovery, which disappear
//! when the process exits. Only stored records are serialized.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::tally::TallyMap;

pub const DEFAULT_UMD_BIND: &str = "0.0.0.0:65000";
pub const DEFAULT_COMMAND_BIND: &str = "0.0.0.0:9923";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O operation failed")]
    Io(#[from] std::io::Error),
    #[error("Cannot parse config document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("No such device '{0}'")]
    NoSuchDevice(String),
    #[error("{0}")]
    Validation(String),
}

/// One camera as the user sees it in the device list.
///
/// The first eight fields are user-editable; `online`, `active` and
/// `stored_in_config` are derived at runtime and never serialized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceConfig {
    pub id: String,
    pub display_name: String,
    pub host: String,
    pub port: u16,
    pub auth_user: String,
    pub auth_pass: String,
    pub device_index: Option<u32>,
    pub always_connect: bool,
    #[serde(skip)]
    pub online: bool,
    #[serde(skip)]
    pub active: bool,
    #[serde(skip)]
    pub stored_in_config: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: String::new(),
            display_name: String::new(),
            host: String::new(),
            port: 80,
            auth_user: String::new(),
            auth_pass: String::new(),
            device_index: None,
            always_connect: false,
            online: false,
            active: false,
            stored_in_config: false,
        }
    }
}

impl DeviceConfig {
    pub fn new(id: &str) -> Self {
        DeviceConfig {
            id: id.to_string(),
            display_name: id.to_string(),
            ..Default::default()
        }
    }
}

/// Partial update for a device record. `None` fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct DevicePatch {
    pub display_name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub auth_user: Option<String>,
    pub auth_pass: Option<String>,
    pub device_index: Option<u32>,
    pub always_connect: Option<bool>,
}

/// The on-disk document. Human-editable; unknown keys are ignored.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigDocument {
    pub devices: HashMap<String, DeviceConfig>,
    pub tally_maps: HashMap<u32, TallyMap>,
    pub umd_bind: Option<String>,
    pub command_bind: Option<String>,
    pub midi_in_port: Option<String>,
    pub midi_out_port: Option<String>,
}

#[derive(Clone, Debug)]
pub enum ConfigEvent {
    PropertiesUpdated {
        id: String,
        fields: Vec<&'static str>,
    },
    Removed {
        id: String,
    },
}

pub struct ConfigStore {
    path: PathBuf,
    devices: HashMap<String, DeviceConfig>,
    /// Snapshot each record is diffed against to drive the "edited" marker.
    baseline: HashMap<String, DeviceConfig>,
    pub tally_maps: HashMap<u32, TallyMap>,
    pub umd_bind: String,
    pub command_bind: String,
    pub midi_in_port: Option<String>,
    pub midi_out_port: Option<String>,
    last_serialized: Option<String>,
    update_tx: tokio::sync::broadcast::Sender<ConfigEvent>,
}

/// Default config location, e.g. `~/.config/jvclink/config.json`.
pub fn default_config_path() -> PathBuf {
    match directories::ProjectDirs::from("org", "jvclink", "jvclink") {
        Some(dirs) => dirs.config_dir().join("config.json"),
        None => PathBuf::from("jvclink-config.json"),
    }
}

impl ConfigStore {
    fn new(path: PathBuf) -> Self {
        let (update_tx, _) = tokio::sync::broadcast::channel(32);
        ConfigStore {
            path,
            devices: HashMap::new(),
            baseline: HashMap::new(),
            tally_maps: HashMap::new(),
            umd_bind: DEFAULT_UMD_BIND.to_string(),
            command_bind: DEFAULT_COMMAND_BIND.to_string(),
            midi_in_port: None,
            midi_out_port: None,
            last_serialized: None,
            update_tx,
        }
    }

    /// Load the document from `path`. A missing file yields an empty store;
    /// an unreadable or unparseable file is an error so the launcher can
    /// exit non-zero.
    fn load(path: PathBuf) -> Result<Self, ConfigError> {
        let mut store = Self::new(path);
        if !store.path.exists() {
            log::info!("No config file at {}, starting empty", store.path.display());
            return Ok(store);
        }
        let text = fs::read_to_string(&store.path)?;
        let doc: ConfigDocument = serde_json::from_str(&text)?;

        for (id, mut device) in doc.devices {
            device.id = id.clone();
            device.stored_in_config = true;
            store.baseline.insert(id.clone(), device.clone());
            store.devices.insert(id, device);
        }
        store.tally_maps = doc.tally_maps;
        if let Some(umd_bind) = doc.umd_bind {
            store.umd_bind = umd_bind;
        }
        if let Some(command_bind) = doc.command_bind {
            store.command_bind = command_bind;
        }
        store.midi_in_port = doc.midi_in_port;
        store.midi_out_port = doc.midi_out_port;
        store.last_serialized = Some(store.serialize_document()?);

        log::info!(
            "Loaded {} device(s), {} tally map(s) from {}",
            store.devices.len(),
            store.tally_maps.len(),
            store.path.display()
        );
        Ok(store)
    }

    fn document(&self) -> ConfigDocument {
        ConfigDocument {
            devices: self
                .devices
                .iter()
                .filter(|(_, d)| d.stored_in_config)
                .map(|(id, d)| (id.clone(), d.clone()))
                .collect(),
            tally_maps: self.tally_maps.clone(),
            umd_bind: Some(self.umd_bind.clone()),
            command_bind: Some(self.command_bind.clone()),
            midi_in_port: self.midi_in_port.clone(),
            midi_out_port: self.midi_out_port.clone(),
        }
    }

    fn serialize_document(&self) -> Result<String, ConfigError> {
        let mut text = serde_json::to_string_pretty(&self.document())?;
        text.push('\n');
        Ok(text)
    }

    /// Atomically rewrite the document. Suppressed when the serialized form
    /// is unchanged.
    fn save(&mut self) -> Result<(), ConfigError> {
        let text = self.serialize_document()?;
        if self.last_serialized.as_deref() == Some(text.as_str()) {
            log::trace!("Config unchanged, write suppressed");
            return Ok(());
        }

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(text.as_bytes())?;
            file.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.last_serialized = Some(text);
        log::debug!("Config written to {}", self.path.display());
        Ok(())
    }

    fn apply_patch(device: &mut DeviceConfig, patch: &DevicePatch) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if let Some(v) = &patch.display_name {
            if &device.display_name != v {
                device.display_name = v.clone();
                changed.push("displayName");
            }
        }
        if let Some(v) = &patch.host {
            if &device.host != v {
                device.host = v.clone();
                changed.push("host");
            }
        }
        if let Some(v) = patch.port {
            if device.port != v {
                device.port = v;
                changed.push("port");
            }
        }
        if let Some(v) = &patch.auth_user {
            if &device.auth_user != v {
                device.auth_user = v.clone();
                changed.push("authUser");
            }
        }
        if let Some(v) = &patch.auth_pass {
            if &device.auth_pass != v {
                device.auth_pass = v.clone();
                changed.push("authPass");
            }
        }
        if let Some(v) = patch.device_index {
            if device.device_index != Some(v) {
                device.device_index = Some(v);
                changed.push("deviceIndex");
            }
        }
        if let Some(v) = patch.always_connect {
            if device.always_connect != v {
                device.always_connect = v;
                changed.push("alwaysConnect");
            }
        }
        changed
    }
}

/// Shared handle to the config store. Readers see a consistent snapshot;
/// writers are serialized by the lock.
#[derive(Clone)]
pub struct SharedConfig {
    store: Arc<RwLock<ConfigStore>>,
}

impl SharedConfig {
    pub fn open(path: PathBuf) -> Result<Self, ConfigError> {
        Ok(SharedConfig {
            store: Arc::new(RwLock::new(ConfigStore::load(path)?)),
        })
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ConfigEvent> {
        self.store.read().unwrap().update_tx.subscribe()
    }

    pub fn list(&self) -> Vec<DeviceConfig> {
        let store = self.store.read().unwrap();
        let mut devices: Vec<DeviceConfig> = store.devices.values().cloned().collect();
        devices.sort_by_key(|d| (d.device_index, d.id.clone()));
        devices
    }

    pub fn get(&self, id: &str) -> Option<DeviceConfig> {
        self.store.read().unwrap().devices.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.store.read().unwrap().devices.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().unwrap().devices.is_empty()
    }

    /// Apply a partial update, creating an ephemeral record when the id is
    /// unknown. Fires `properties-updated` with the changed field names and
    /// persists when the record is stored.
    pub fn upsert(&self, id: &str, patch: &DevicePatch) -> Result<Vec<&'static str>, ConfigError> {
        if id.is_empty() {
            return Err(ConfigError::Validation("Device id must not be empty".into()));
        }
        if patch.port == Some(0) {
            return Err(ConfigError::Validation("Port number must be non-zero".into()));
        }

        let (changed, stored) = {
            let mut store = self.store.write().unwrap();
            let device = store
                .devices
                .entry(id.to_string())
                .or_insert_with(|| DeviceConfig::new(id));
            let changed = ConfigStore::apply_patch(device, patch);
            let stored = device.stored_in_config;
            if stored && !changed.is_empty() {
                store.save()?;
            }
            (changed, stored)
        };

        if !changed.is_empty() {
            log::debug!("{}: updated {:?} (stored: {})", id, changed, stored);
            self.notify(ConfigEvent::PropertiesUpdated {
                id: id.to_string(),
                fields: changed.clone(),
            });
        }
        Ok(changed)
    }

    /// Promote an ephemeral record to a stored one and persist it. The edit
    /// baseline is reset so the record shows as unedited afterwards.
    pub fn confirm(&self, id: &str) -> Result<(), ConfigError> {
        {
            let mut store = self.store.write().unwrap();
            let device = store
                .devices
                .get_mut(id)
                .ok_or_else(|| ConfigError::NoSuchDevice(id.to_string()))?;
            device.stored_in_config = true;
            let snapshot = device.clone();
            store.baseline.insert(id.to_string(), snapshot);
            store.save()?;
        }
        self.notify(ConfigEvent::PropertiesUpdated {
            id: id.to_string(),
            fields: vec!["storedInConfig"],
        });
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<(), ConfigError> {
        {
            let mut store = self.store.write().unwrap();
            if store.devices.remove(id).is_none() {
                return Err(ConfigError::NoSuchDevice(id.to_string()));
            }
            store.baseline.remove(id);
            store.save()?;
        }
        self.notify(ConfigEvent::Removed { id: id.to_string() });
        Ok(())
    }

    pub fn mark_online(&self, id: &str, online: bool) {
        self.mark(id, "online", |d| {
            let changed = d.online != online;
            d.online = online;
            changed
        });
    }

    pub fn mark_active(&self, id: &str, active: bool) {
        self.mark(id, "active", |d| {
            let changed = d.active != active;
            d.active = active;
            changed
        });
    }

    fn notify(&self, event: ConfigEvent) {
        let tx = self.store.read().unwrap().update_tx.clone();
        let _ = tx.send(event);
    }

    fn mark<F: FnOnce(&mut DeviceConfig) -> bool>(&self, id: &str, field: &'static str, f: F) {
        let changed = {
            let mut store = self.store.write().unwrap();
            match store.devices.get_mut(id) {
                Some(device) => f(device),
                None => false,
            }
        };
        if changed {
            self.notify(ConfigEvent::PropertiesUpdated {
                id: id.to_string(),
                fields: vec![field],
            });
        }
    }

    /// Field names whose current value differs from the captured baseline.
    pub fn edited_fields(&self, id: &str) -> BTreeSet<&'static str> {
        let store = self.store.read().unwrap();
        let mut edited = BTreeSet::new();
        let (device, base) = match (store.devices.get(id), store.baseline.get(id)) {
            (Some(d), Some(b)) => (d, b),
            // No baseline: everything on a fresh ephemeral record counts as unedited
            _ => return edited,
        };
        if device.display_name != base.display_name {
            edited.insert("displayName");
        }
        if device.host != base.host {
            edited.insert("host");
        }
        if device.port != base.port {
            edited.insert("port");
        }
        if device.auth_user != base.auth_user {
            edited.insert("authUser");
        }
        if device.auth_pass != base.auth_pass {
            edited.insert("authPass");
        }
        if device.device_index != base.device_index {
            edited.insert("deviceIndex");
        }
        if device.always_connect != base.always_connect {
            edited.insert("alwaysConnect");
        }
        edited
    }

    pub fn tally_map(&self, device_index: u32) -> Option<TallyMap> {
        self.store.read().unwrap().tally_maps.get(&device_index).cloned()
    }

    pub fn tally_maps(&self) -> HashMap<u32, TallyMap> {
        self.store.read().unwrap().tally_maps.clone()
    }

    pub fn set_tally_map(&self, device_index: u32, map: TallyMap) -> Result<(), ConfigError> {
        let mut store = self.store.write().unwrap();
        if map.is_empty() {
            store.tally_maps.remove(&device_index);
        } else {
            store.tally_maps.insert(device_index, map);
        }
        store.save()
    }

    pub fn umd_bind(&self) -> String {
        self.store.read().unwrap().umd_bind.clone()
    }

    pub fn command_bind(&self) -> String {
        self.store.read().unwrap().command_bind.clone()
    }

    pub fn set_binds(&self, umd_bind: Option<String>, command_bind: Option<String>) -> Result<(), ConfigError> {
        let mut store = self.store.write().unwrap();
        if let Some(umd_bind) = umd_bind {
            store.umd_bind = umd_bind;
        }
        if let Some(command_bind) = command_bind {
            store.command_bind = command_bind;
        }
        store.save()
    }

    /// Final write on shutdown.
    pub fn flush(&self) -> Result<(), ConfigError> {
        self.store.write().unwrap().save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> SharedConfig {
        SharedConfig::open(dir.path().join("config.json")).unwrap()
    }

    #[test]
    fn upsert_then_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let config = open_store(&dir);

        let patch = DevicePatch {
            display_name: Some("Cam left".to_string()),
            host: Some("10.0.0.5".to_string()),
            auth_user: Some("jvc".to_string()),
            ..Default::default()
        };
        let changed = config.upsert("GY-HC500-1234", &patch).unwrap();
        assert_eq!(changed, vec!["displayName", "host", "authUser"]);

        let device = config.get("GY-HC500-1234").unwrap();
        assert_eq!(device.display_name, "Cam left");
        assert_eq!(device.host, "10.0.0.5");
        assert_eq!(device.port, 80);
        assert!(!device.stored_in_config);

        // A no-op patch reports no changes
        let changed = config.upsert("GY-HC500-1234", &patch).unwrap();
        assert!(changed.is_empty());
    }

    #[test]
    fn ephemeral_records_are_not_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        {
            let config = SharedConfig::open(path.clone()).unwrap();
            config
                .upsert("GY-HC500-1", &DevicePatch::default())
                .unwrap();
            config
                .upsert("GY-HC900-2", &DevicePatch::default())
                .unwrap();
            config.confirm("GY-HC900-2").unwrap();
        }
        let config = SharedConfig::open(path).unwrap();
        assert!(config.get("GY-HC500-1").is_none());
        let stored = config.get("GY-HC900-2").unwrap();
        assert!(stored.stored_in_config);
    }

    #[test]
    fn unchanged_write_is_suppressed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let config = SharedConfig::open(path.clone()).unwrap();
        config.upsert("a", &DevicePatch::default()).unwrap();
        config.confirm("a").unwrap();

        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        // Derived-state flips do not touch the file
        config.mark_online("a", true);
        config.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), mtime);
    }

    #[test]
    fn edited_fields_diff_against_baseline() {
        let dir = TempDir::new().unwrap();
        let config = open_store(&dir);
        config.upsert("a", &DevicePatch::default()).unwrap();
        config.confirm("a").unwrap();
        assert!(config.edited_fields("a").is_empty());

        config
            .upsert(
                "a",
                &DevicePatch {
                    host: Some("10.1.1.1".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let edited = config.edited_fields("a");
        assert_eq!(edited.into_iter().collect::<Vec<_>>(), vec!["host"]);

        // Confirm resets the baseline
        config.confirm("a").unwrap();
        assert!(config.edited_fields("a").is_empty());
    }

    #[test]
    fn validation_rejects_bad_input() {
        let dir = TempDir::new().unwrap();
        let config = open_store(&dir);
        assert!(matches!(
            config.upsert("", &DevicePatch::default()),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            config.upsert(
                "a",
                &DevicePatch {
                    port: Some(0),
                    ..Default::default()
                }
            ),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn tally_maps_round_trip() {
        use crate::tally::{TallyKey, TallySource, TallyType};
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        {
            let config = SharedConfig::open(path.clone()).unwrap();
            let map = TallyMap {
                program_source: Some(TallySource {
                    key: TallyKey { screen: 0, index: 3 },
                    tally_type: TallyType::Rh,
                }),
                preview_source: None,
            };
            config.set_tally_map(0, map).unwrap();
        }
        let config = SharedConfig::open(path).unwrap();
        let map = config.tally_map(0).unwrap();
        assert_eq!(map.program_source.unwrap().key.index, 3);
    }
}
