//! Tally router.
//!
//! A single task that fans tally state in from two independent sources,
//! the UMD listener and direct writes (the command-port side of the
//! engine), and out to two sinks: the Tally parameter of the mapped
//! device's model and the command port's Program/Preview vector. Running
//! as one task gives a total order over the inputs, so when both sources
//! target the same device in the same tick the later message wins.

use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_graceful_shutdown::SubsystemHandle;

use super::umd::TallyUpdate;
use super::{TallyMap, MAX_TALLY};
use crate::command_port::{SharedTallyState, TallyKind};
use crate::device::model::ParamValue;
use crate::device::{DeviceError, SharedDevices};

#[derive(Clone, Debug)]
pub enum RouterMessage {
    /// Install or replace the tally map of one device index.
    SetMap { device_index: u32, map: TallyMap },
    ClearMap { device_index: u32 },
    /// Direct Program/Preview write bypassing the source mapping.
    Direct {
        device_index: u32,
        program: Option<bool>,
        preview: Option<bool>,
    },
}

pub struct TallyRouter {
    devices: SharedDevices,
    tally_state: SharedTallyState,
    maps: HashMap<u32, TallyMap>,
    umd_rx: mpsc::Receiver<TallyUpdate>,
    msg_rx: mpsc::Receiver<RouterMessage>,
}

impl TallyRouter {
    pub fn new(
        devices: SharedDevices,
        tally_state: SharedTallyState,
        maps: HashMap<u32, TallyMap>,
        umd_rx: mpsc::Receiver<TallyUpdate>,
        msg_rx: mpsc::Receiver<RouterMessage>,
    ) -> Self {
        TallyRouter {
            devices,
            tally_state,
            maps,
            umd_rx,
            msg_rx,
        }
    }

    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<(), DeviceError> {
        log::debug!("Tally router starting with {} map(s)", self.maps.len());
        loop {
            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    return Ok(());
                },
                message = self.msg_rx.recv() => {
                    match message {
                        None => return Ok(()),
                        Some(message) => self.handle_message(message),
                    }
                },
                update = self.umd_rx.recv() => {
                    match update {
                        None => return Ok(()),
                        Some(update) => self.handle_umd(&update),
                    }
                },
            }
        }
    }

    fn handle_message(&mut self, message: RouterMessage) {
        match message {
            RouterMessage::SetMap { device_index, map } => {
                log::info!("Device index {}: tally map updated", device_index);
                self.maps.insert(device_index, map);
            }
            RouterMessage::ClearMap { device_index } => {
                log::info!("Device index {}: tally map cleared", device_index);
                self.maps.remove(&device_index);
            }
            RouterMessage::Direct {
                device_index,
                program,
                preview,
            } => {
                self.write_tally(device_index, program, preview);
            }
        }
    }

    fn handle_umd(&mut self, update: &TallyUpdate) {
        // Several device indices may subscribe to the same source
        let mut writes: Vec<(u32, Option<bool>, Option<bool>)> = Vec::new();
        for (device_index, map) in &self.maps {
            let mut program = None;
            let mut preview = None;
            if let Some(source) = map.program_source {
                if source.key == update.key {
                    program = Some(update.fields.is_on(source.tally_type));
                }
            }
            if let Some(source) = map.preview_source {
                if source.key == update.key {
                    preview = Some(update.fields.is_on(source.tally_type));
                }
            }
            if program.is_some() || preview.is_some() {
                writes.push((*device_index, program, preview));
            }
        }
        for (device_index, program, preview) in writes {
            self.write_tally(device_index, program, preview);
        }
    }

    /// Apply Program/Preview booleans to a device, acting as a local
    /// writer on its parameter model, and mirror them into the command
    /// port vector.
    fn write_tally(&self, device_index: u32, program: Option<bool>, preview: Option<bool>) {
        if device_index >= MAX_TALLY as u32 {
            log::warn!("Tally write for index {} outside range 0..{}", device_index, MAX_TALLY);
            return;
        }
        let lamps = [
            ("tally.program", TallyKind::Program, program),
            ("tally.preview", TallyKind::Preview, preview),
        ];
        for (name, kind, value) in lamps {
            let Some(value) = value else {
                continue;
            };
            self.tally_state.set(kind, device_index as u16, value);

            let Some(info) = self.devices.by_index(device_index) else {
                log::trace!("No device at index {}, vector-only tally", device_index);
                continue;
            };
            // Suppress writes the camera already agrees with
            let state = info.model.get(name);
            if let Some(state) = &state {
                if !state.dirty && state.current == Some(ParamValue::Bool(value)) {
                    continue;
                }
            }
            match info.model.begin_write(name, ParamValue::Bool(value)) {
                Ok(()) => match &info.handle {
                    Some(handle) => {
                        if let Err(e) = handle.try_send(crate::device::session::SessionCommand::Write { name }) {
                            log::debug!("{}: tally write not queued: {}", info.id, e);
                            info.model.write_failed(name, "session queue full");
                        }
                    }
                    // No session: keep the local mirror consistent
                    None => info.model.write_succeeded(name),
                },
                Err(e) => {
                    log::debug!("{}: tally write rejected: {}", info.id, e);
                }
            }
        }
    }
}
