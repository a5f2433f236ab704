//! Engine supervisor.
//!
//! Owns the component registry: config store, device registry, discovery,
//! tally plumbing and the command port. Bridges discovery events into the
//! config store and into per-device session subsystems, assigns display
//! indices, and exposes the operations an external surface (GUI, MIDI
//! binding) needs: connect/disconnect/reconnect, index reassignment, tally
//! map updates and direct tally writes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};

use crate::command_port::{CommandPortServer, SharedTallyState};
use crate::config::{default_config_path, DevicePatch, SharedConfig};
use crate::device::model::ParamValue;
use crate::device::session::{
    ConnectionState, DeviceSession, PreviewFetcher, SessionCommand, SessionConfig,
};
use crate::device::{DeviceError, SharedDevices};
use crate::locator::{DiscoveryEvent, Locator};
use crate::tally::router::{RouterMessage, TallyRouter};
use crate::tally::umd::UmdListener;
use crate::tally::TallyMap;
use crate::Cli;

const DISCOVERY_CHANNEL_DEPTH: usize = 16;
const UMD_CHANNEL_DEPTH: usize = 64;
const ROUTER_CHANNEL_DEPTH: usize = 16;

#[derive(Clone)]
pub struct Engine {
    args: Cli,
    config: SharedConfig,
    devices: SharedDevices,
    tally_state: SharedTallyState,
    router_tx: mpsc::Sender<RouterMessage>,
}

impl Engine {
    /// Build the engine and start every long-lived component as a child
    /// subsystem. Fatal errors here (unreadable config, bind failures
    /// surfaced by the subsystems) end the process with a non-zero exit.
    pub async fn new(subsys: &SubsystemHandle, args: Cli) -> Result<Self, DeviceError> {
        let config_path = args.config.clone().unwrap_or_else(default_config_path);
        let config = SharedConfig::open(config_path)?;

        let devices = SharedDevices::new();
        let tally_state = SharedTallyState::new();

        let (discovery_tx, discovery_rx) = mpsc::channel(DISCOVERY_CHANNEL_DEPTH);
        let (umd_tx, umd_rx) = mpsc::channel(UMD_CHANNEL_DEPTH);
        let (router_tx, router_rx) = mpsc::channel(ROUTER_CHANNEL_DEPTH);

        let engine = Engine {
            args,
            config: config.clone(),
            devices: devices.clone(),
            tally_state: tally_state.clone(),
            router_tx,
        };

        // Seed the registry from the stored config so index assignment
        // sees every currently-known device from the start.
        for device in config.list() {
            let (model, serial) = device
                .id
                .rsplit_once('-')
                .map(|(m, s)| (m.to_string(), s.to_string()))
                .unwrap_or_else(|| (device.id.clone(), String::new()));
            devices.ensure(&device.id, &model, &serial);
            if let Some(index) = device.device_index {
                devices.set_index(&device.id, index)?;
            }
        }

        let umd_bind = engine
            .args
            .umd_bind
            .clone()
            .unwrap_or_else(|| config.umd_bind());
        let command_bind = engine
            .args
            .command_bind
            .clone()
            .unwrap_or_else(|| config.command_bind());

        let umd_listener = UmdListener::new(umd_bind, umd_tx);
        subsys.start(SubsystemBuilder::new("UMD", |s| umd_listener.run(s)));

        let router = TallyRouter::new(
            devices.clone(),
            tally_state.clone(),
            config.tally_maps(),
            umd_rx,
            router_rx,
        );
        subsys.start(SubsystemBuilder::new("TallyRouter", |s| router.run(s)));

        let command_server = CommandPortServer::new(command_bind, tally_state.clone());
        subsys.start(SubsystemBuilder::new("CommandPort", |s| command_server.run(s)));

        if engine.args.no_discovery {
            log::info!("Discovery disabled, using configured devices only");
        } else {
            let locator = Locator::new(discovery_tx, config.is_empty());
            subsys.start(SubsystemBuilder::new("Locator", |s| locator.run(s)));
        }

        let run_engine = engine.clone();
        subsys.start(SubsystemBuilder::new("Engine", move |s| {
            run_engine.run(s, discovery_rx)
        }));

        Ok(engine)
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn devices(&self) -> &SharedDevices {
        &self.devices
    }

    pub fn tally_state(&self) -> &SharedTallyState {
        &self.tally_state
    }

    /// Main loop: bring up always-connect sessions, then react to
    /// discovery. On shutdown the config store is flushed after the
    /// sessions were cancelled in parallel by the supervisor.
    async fn run(
        self,
        subsys: SubsystemHandle,
        mut discovery_rx: mpsc::Receiver<DiscoveryEvent>,
    ) -> Result<(), DeviceError> {
        for device in self.config.list() {
            if device.always_connect && !device.host.is_empty() {
                if let Err(e) = self.connect(&subsys, &device.id).await {
                    log::warn!("{}: cannot open session: {}", device.id, e);
                }
            }
        }

        loop {
            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    if let Err(e) = self.config.flush() {
                        log::error!("Cannot flush config on shutdown: {}", e);
                    }
                    return Ok(());
                },
                event = discovery_rx.recv() => {
                    match event {
                        None => return Ok(()),
                        Some(DiscoveryEvent::Seen { id, model, serial, host, port }) => {
                            match self.register_seen(&id, &model, &serial, &host, port) {
                                Ok(true) => {
                                    if let Err(e) = self.connect(&subsys, &id).await {
                                        log::warn!("{}: cannot open session: {}", id, e);
                                    }
                                }
                                Ok(false) => {}
                                Err(e) => log::error!("{}", e),
                            }
                        }
                        Some(DiscoveryEvent::Lost { id }) => {
                            // Keep any session alive through its backoff
                            log::info!("{}: discovery lost", id);
                            self.config.mark_online(&id, false);
                        }
                    }
                },
            }
        }
    }

    /// Merge one discovery announcement with the config store and assign a
    /// display index. Returns whether a session should be opened.
    fn register_seen(
        &self,
        id: &str,
        model: &str,
        serial: &str,
        host: &str,
        port: u16,
    ) -> Result<bool, DeviceError> {
        if let Some(existing) = self.config.get(id) {
            if existing.online && !existing.host.is_empty() && existing.host != host {
                return Err(DeviceError::DuplicateId(
                    id.to_string(),
                    format!("{}:{} (configured at {})", host, port, existing.host),
                ));
            }
        }

        self.devices.ensure(id, model, serial);
        self.config.upsert(
            id,
            &DevicePatch {
                host: Some(host.to_string()),
                port: Some(port),
                ..Default::default()
            },
        )?;

        // A configured index wins; otherwise hand out the smallest unused
        // one and remember it.
        match self.config.get(id).and_then(|d| d.device_index) {
            Some(index) => self.devices.set_index(id, index)?,
            None => {
                let index = self.devices.assign_index(id)?;
                self.config.upsert(
                    id,
                    &DevicePatch {
                        device_index: Some(index),
                        ..Default::default()
                    },
                )?;
            }
        }
        self.config.mark_online(id, true);

        let device = self
            .config
            .get(id)
            .ok_or_else(|| DeviceError::NoSuchDevice(id.to_string()))?;
        let has_session = self.devices.get(id).map(|d| d.handle.is_some()).unwrap_or(false);
        Ok(device.always_connect && !has_session)
    }

    /// Open a session for a device, or wake an idle one.
    pub async fn connect(&self, subsys: &SubsystemHandle, id: &str) -> Result<(), DeviceError> {
        let device = self
            .config
            .get(id)
            .ok_or_else(|| DeviceError::NoSuchDevice(id.to_string()))?;
        if device.host.is_empty() {
            return Err(DeviceError::Http("no host configured".to_string()));
        }
        let info = self
            .devices
            .get(id)
            .ok_or_else(|| DeviceError::NoSuchDevice(id.to_string()))?;

        if let Some(handle) = &info.handle {
            return handle.send(SessionCommand::Open).await;
        }

        let session_config =
            SessionConfig::from_device(&device, Duration::from_millis(self.args.poll_interval));
        let preview = Arc::new(PreviewFetcher::new(&session_config));
        let (session, handle) = DeviceSession::new(session_config, info.model.clone());
        self.devices
            .set_handle(id, Some(handle.clone()), Some(preview));

        let session_name = format!("{} session", id);
        subsys.start(SubsystemBuilder::new(session_name, move |s| session.run(s)));

        // Mirror the session state into the config store's active flag
        let config = self.config.clone();
        let id_owned = id.to_string();
        let mut state_rx = handle.state_changes();
        let watcher_name = format!("{} state", id);
        subsys.start(SubsystemBuilder::new(watcher_name, move |s| async move {
            loop {
                tokio::select! { biased;
                    _ = s.on_shutdown_requested() => {
                        return Ok::<(), DeviceError>(());
                    },
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            config.mark_active(&id_owned, false);
                            return Ok(());
                        }
                        let state = *state_rx.borrow();
                        config.mark_active(&id_owned, state == ConnectionState::Connected);
                    },
                }
            }
        }));

        Ok(())
    }

    pub async fn disconnect(&self, id: &str) -> Result<(), DeviceError> {
        self.send_to_session(id, SessionCommand::Close).await
    }

    /// Explicit user reconnect; the only way out of the `failed` state.
    pub async fn reconnect(&self, id: &str) -> Result<(), DeviceError> {
        self.send_to_session(id, SessionCommand::Reconnect).await
    }

    async fn send_to_session(&self, id: &str, command: SessionCommand) -> Result<(), DeviceError> {
        let info = self
            .devices
            .get(id)
            .ok_or_else(|| DeviceError::NoSuchDevice(id.to_string()))?;
        match &info.handle {
            Some(handle) => handle.send(command).await,
            None => Err(DeviceError::NotConnected(id.to_string())),
        }
    }

    /// Write one parameter on a device, as a local writer with arbitration.
    pub async fn set_parameter(
        &self,
        id: &str,
        name: &'static str,
        value: ParamValue,
    ) -> Result<(), DeviceError> {
        let info = self
            .devices
            .get(id)
            .ok_or_else(|| DeviceError::NoSuchDevice(id.to_string()))?;
        info.model.begin_write(name, value)?;
        match &info.handle {
            Some(handle) => handle.send(SessionCommand::Write { name }).await,
            None => {
                info.model.write_failed(name, "not connected");
                Err(DeviceError::NotConnected(id.to_string()))
            }
        }
    }

    /// Move a device to a display index, swapping with any occupant, and
    /// persist the result for every stored record that moved.
    pub fn set_device_index(&self, id: &str, index: u32) -> Result<(), DeviceError> {
        self.devices.set_index(id, index)?;
        for device in self.devices.list() {
            if let Some(index) = device.device_index {
                if self.config.contains(&device.id) {
                    self.config.upsert(
                        &device.id,
                        &DevicePatch {
                            device_index: Some(index),
                            ..Default::default()
                        },
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Validate and install a tally map for a device index.
    pub async fn set_tally_map(&self, device_index: u32, map: TallyMap) -> Result<(), DeviceError> {
        if let Err(e) = map.check_valid(device_index, self.devices.contains_index(device_index)) {
            return Err(DeviceError::Config(crate::config::ConfigError::Validation(
                e.to_string(),
            )));
        }
        self.config.set_tally_map(device_index, map.clone())?;
        self.router_tx
            .send(RouterMessage::SetMap { device_index, map })
            .await
            .map_err(|_| DeviceError::Shutdown)
    }

    /// Direct Program/Preview write, bypassing the UMD source mapping.
    pub async fn set_tally_direct(
        &self,
        device_index: u32,
        program: Option<bool>,
        preview: Option<bool>,
    ) -> Result<(), DeviceError> {
        self.router_tx
            .send(RouterMessage::Direct {
                device_index,
                program,
                preview,
            })
            .await
            .map_err(|_| DeviceError::Shutdown)
    }
}
