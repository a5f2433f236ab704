//! Device registry and per-device runtime state.
//!
//! [`SharedDevices`] is the engine's registry of currently-known cameras:
//! configured ones seeded at startup plus everything discovery announces.
//! It owns the display-index invariant: at any moment the assigned indices
//! across known devices are distinct, and new assignments take the smallest
//! unused value so the set stays compact from 0.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

pub mod model;
pub mod session;

use model::{ParamError, ParameterModel};
use session::{DeviceHandle, PreviewFetcher};

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("I/O operation failed")]
    Io(#[from] std::io::Error),
    #[error("HTTP request failed: {0}")]
    Http(String),
    #[error("Authentication rejected by camera")]
    Auth,
    #[error("Parameter group not supported by camera")]
    Capability,
    #[error("Timeout")]
    Timeout,
    #[error("Shutdown")]
    Shutdown,
    #[error("Command queue full")]
    Busy,
    #[error("{0}")]
    Param(#[from] ParamError),
    #[error("{0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("No such device '{0}'")]
    NoSuchDevice(String),
    #[error("Device '{0}' has no open session")]
    NotConnected(String),
    #[error("Cannot parse JSON: {0}")]
    ParseJson(String),
    #[error("Duplicate device id '{0}' announced by {1}")]
    DuplicateId(String, String),
    #[error("Discovery failed: {0}")]
    Discovery(String),
    #[error("Cannot bind '{0}': {1}")]
    Bind(String, std::io::Error),
}

/// Stable device id derived from the advertised model and serial.
pub fn device_id(model: &str, serial: &str) -> String {
    format!("{}-{}", model, serial)
}

/// Runtime state of one known camera. The parameter model is created here
/// and retained for the life of the entry, across session reconnects, so
/// observers keep a stable reference.
#[derive(Clone)]
pub struct DeviceInfo {
    pub id: String,
    pub model_name: String,
    pub serial: String,
    pub device_index: Option<u32>,
    pub model: ParameterModel,
    /// Present while a session subsystem is running for this camera.
    pub handle: Option<DeviceHandle>,
    pub preview: Option<Arc<PreviewFetcher>>,
}

impl DeviceInfo {
    fn new(id: &str, model_name: &str, serial: &str) -> Self {
        DeviceInfo {
            id: id.to_string(),
            model_name: model_name.to_string(),
            serial: serial.to_string(),
            device_index: None,
            model: ParameterModel::new(id),
            handle: None,
            preview: None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum DeviceEvent {
    Added { id: String },
    Removed { id: String },
    /// One atomic notification per reassignment, however many entries moved.
    IndicesChanged { changes: Vec<(String, Option<u32>)> },
}

struct Devices {
    info: HashMap<String, DeviceInfo>,
    event_tx: tokio::sync::broadcast::Sender<DeviceEvent>,
}

impl Devices {
    /// Duplicate assigned indices mean a broken reassignment; that is a
    /// programmer error and fails fast.
    fn assert_unique_indices(&self) {
        let mut seen = std::collections::HashSet::new();
        for info in self.info.values() {
            if let Some(index) = info.device_index {
                assert!(
                    seen.insert(index),
                    "duplicate device index {} after reassignment",
                    index
                );
            }
        }
    }

    fn smallest_unused_index(&self) -> u32 {
        let used: std::collections::HashSet<u32> =
            self.info.values().filter_map(|i| i.device_index).collect();
        (0..).find(|i| !used.contains(i)).unwrap()
    }
}

#[derive(Clone)]
pub struct SharedDevices {
    devices: Arc<RwLock<Devices>>,
}

impl SharedDevices {
    pub fn new() -> Self {
        let (event_tx, _) = tokio::sync::broadcast::channel(32);
        SharedDevices {
            devices: Arc::new(RwLock::new(Devices {
                info: HashMap::new(),
                event_tx,
            })),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DeviceEvent> {
        self.devices.read().unwrap().event_tx.subscribe()
    }

    /// Register a camera if it is not already known; returns whether the
    /// entry is new. The parameter model is created here exactly once.
    pub fn ensure(&self, id: &str, model_name: &str, serial: &str) -> bool {
        let is_new = {
            let mut devices = self.devices.write().unwrap();
            if devices.info.contains_key(id) {
                false
            } else {
                devices.info.insert(id.to_string(), DeviceInfo::new(id, model_name, serial));
                true
            }
        };
        if is_new {
            log::info!("Added device '{}' ({} / {})", id, model_name, serial);
            self.notify(DeviceEvent::Added { id: id.to_string() });
        }
        is_new
    }

    pub fn get(&self, id: &str) -> Option<DeviceInfo> {
        self.devices.read().unwrap().info.get(id).cloned()
    }

    pub fn list(&self) -> Vec<DeviceInfo> {
        let devices = self.devices.read().unwrap();
        let mut list: Vec<DeviceInfo> = devices.info.values().cloned().collect();
        list.sort_by_key(|d| (d.device_index, d.id.clone()));
        list
    }

    pub fn by_index(&self, index: u32) -> Option<DeviceInfo> {
        let devices = self.devices.read().unwrap();
        devices
            .info
            .values()
            .find(|d| d.device_index == Some(index))
            .cloned()
    }

    pub fn contains_index(&self, index: u32) -> bool {
        self.by_index(index).is_some()
    }

    pub fn index_of(&self, id: &str) -> Option<u32> {
        self.devices.read().unwrap().info.get(id).and_then(|d| d.device_index)
    }

    /// Give an unindexed device the smallest unused index. Returns the
    /// assigned index, or the existing one when the device already has one.
    pub fn assign_index(&self, id: &str) -> Result<u32, DeviceError> {
        let (index, changed) = {
            let mut devices = self.devices.write().unwrap();
            let Some(info) = devices.info.get(id) else {
                return Err(DeviceError::NoSuchDevice(id.to_string()));
            };
            if let Some(index) = info.device_index {
                (index, false)
            } else {
                let index = devices.smallest_unused_index();
                devices.info.get_mut(id).unwrap().device_index = Some(index);
                devices.assert_unique_indices();
                (index, true)
            }
        };
        if changed {
            log::info!("{}: assigned device index {}", id, index);
            self.notify(DeviceEvent::IndicesChanged {
                changes: vec![(id.to_string(), Some(index))],
            });
        }
        Ok(index)
    }

    /// Move a device to a specific index. If another device occupies it the
    /// two swap indices; all observers get a single atomic notification.
    pub fn set_index(&self, id: &str, index: u32) -> Result<(), DeviceError> {
        let changes = {
            let mut devices = self.devices.write().unwrap();
            if !devices.info.contains_key(id) {
                return Err(DeviceError::NoSuchDevice(id.to_string()));
            }
            let old = devices.info.get(id).unwrap().device_index;
            if old == Some(index) {
                return Ok(());
            }
            let occupant = devices
                .info
                .values()
                .find(|d| d.device_index == Some(index) && d.id != id)
                .map(|d| d.id.clone());

            let mut changes = Vec::new();
            if let Some(occupant) = occupant {
                devices.info.get_mut(&occupant).unwrap().device_index = old;
                changes.push((occupant, old));
            }
            devices.info.get_mut(id).unwrap().device_index = Some(index);
            changes.push((id.to_string(), Some(index)));
            devices.assert_unique_indices();
            changes
        };
        log::info!("Index reassignment: {:?}", changes);
        self.notify(DeviceEvent::IndicesChanged { changes });
        Ok(())
    }

    /// Close the holes left by removals: every assigned index is remapped
    /// onto the compact range 0..n preserving the existing order.
    pub fn compact_indices(&self) {
        let changes = {
            let mut devices = self.devices.write().unwrap();
            let mut indexed: Vec<(String, u32)> = devices
                .info
                .values()
                .filter_map(|d| d.device_index.map(|i| (d.id.clone(), i)))
                .collect();
            indexed.sort_by_key(|(_, i)| *i);

            let mut changes = Vec::new();
            for (target, (id, old)) in indexed.into_iter().enumerate() {
                let target = target as u32;
                if target != old {
                    devices.info.get_mut(&id).unwrap().device_index = Some(target);
                    changes.push((id, Some(target)));
                }
            }
            devices.assert_unique_indices();
            changes
        };
        if !changes.is_empty() {
            log::info!("Compacted device indices: {:?}", changes);
            self.notify(DeviceEvent::IndicesChanged { changes });
        }
    }

    pub fn set_handle(&self, id: &str, handle: Option<DeviceHandle>, preview: Option<Arc<PreviewFetcher>>) {
        let mut devices = self.devices.write().unwrap();
        if let Some(info) = devices.info.get_mut(id) {
            info.handle = handle;
            info.preview = preview;
        }
    }

    pub fn remove(&self, id: &str) -> Result<(), DeviceError> {
        {
            let mut devices = self.devices.write().unwrap();
            if devices.info.remove(id).is_none() {
                return Err(DeviceError::NoSuchDevice(id.to_string()));
            }
        }
        log::info!("Removed device '{}'", id);
        self.notify(DeviceEvent::Removed { id: id.to_string() });
        Ok(())
    }

    fn notify(&self, event: DeviceEvent) {
        let tx = self.devices.read().unwrap().event_tx.clone();
        let _ = tx.send(event);
    }
}

impl Default for SharedDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_order_assigns_compact_indices() {
        let devices = SharedDevices::new();
        for id in ["A", "B", "C"] {
            devices.ensure(id, "GY-HC500", id);
            devices.assign_index(id).unwrap();
        }
        assert_eq!(devices.index_of("A"), Some(0));
        assert_eq!(devices.index_of("B"), Some(1));
        assert_eq!(devices.index_of("C"), Some(2));

        // Removal leaves a hole
        devices.remove("B").unwrap();
        assert_eq!(devices.index_of("A"), Some(0));
        assert_eq!(devices.index_of("C"), Some(2));

        // The next discovery fills it
        devices.ensure("D", "GY-HC900", "D");
        assert_eq!(devices.assign_index("D").unwrap(), 1);
    }

    #[test]
    fn set_index_swaps_with_occupant() {
        let devices = SharedDevices::new();
        for id in ["A", "B"] {
            devices.ensure(id, "GY-HC500", id);
            devices.assign_index(id).unwrap();
        }
        let mut rx = devices.subscribe();

        devices.set_index("A", 1).unwrap();
        assert_eq!(devices.index_of("A"), Some(1));
        assert_eq!(devices.index_of("B"), Some(0));

        // One atomic event carrying both moves
        let event = loop {
            match rx.try_recv().unwrap() {
                DeviceEvent::IndicesChanged { changes } => break changes,
                _ => continue,
            }
        };
        assert_eq!(event.len(), 2);
    }

    #[test]
    fn compact_fills_holes_preserving_order() {
        let devices = SharedDevices::new();
        for id in ["A", "B", "C"] {
            devices.ensure(id, "GY-HC500", id);
            devices.assign_index(id).unwrap();
        }
        devices.remove("A").unwrap();
        devices.compact_indices();
        assert_eq!(devices.index_of("B"), Some(0));
        assert_eq!(devices.index_of("C"), Some(1));
    }

    #[test]
    fn ensure_is_idempotent_and_model_is_stable() {
        let devices = SharedDevices::new();
        assert!(devices.ensure("A", "GY-HC500", "123"));
        devices
            .get("A")
            .unwrap()
            .model
            .apply_remote(crate::spec::ParamGroup::Battery, &serde_json::json!({"Level": 42}));
        assert!(!devices.ensure("A", "GY-HC500", "123"));
        // The model instance survived the second ensure
        assert_eq!(
            devices.get("A").unwrap().model.current_value("battery.level"),
            Some(model::ParamValue::Int(42))
        );
    }

    #[test]
    fn by_index_resolves_devices() {
        let devices = SharedDevices::new();
        devices.ensure("A", "GY-HC500", "1");
        devices.assign_index("A").unwrap();
        assert_eq!(devices.by_index(0).unwrap().id, "A");
        assert!(devices.by_index(1).is_none());
    }
}
