//! UMD tally listener.
//!
//! Binds a UDP socket and parses TSL UMD v5.0 frames. Each frame carries a
//! screen index and one or more display messages; a display message is
//! `INDEX u16le, CONTROL u16le, LENGTH u16le, TEXT[LENGTH]` with the
//! control word packing rh/txt/lh tally values (2 bits each, off / red /
//! green / amber) and brightness. The listener keeps a
//! `(screen, index) -> fields` table and only emits an update when a field
//! actually changed. Malformed frames are counted and dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_graceful_shutdown::SubsystemHandle;

use super::{TallyColor, TallyKey, UmdFields, MAX_TALLY};
use crate::device::DeviceError;

const RECV_BUFFER_LEN: usize = 2048;

/// Control word bit 15 marks a control-data message instead of text.
const CONTROL_DATA_FLAG: u16 = 0x8000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("Frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("Length mismatch: header says {header_len} bytes, frame has {actual_len}")]
    LengthMismatch { header_len: usize, actual_len: usize },
    #[error("Unsupported UMD protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("Truncated display message at offset {0}")]
    Truncated(usize),
    #[error("Frame carries no display message")]
    Empty,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UmdDisplay {
    pub index: u16,
    pub brightness: u8,
    pub fields: UmdFields,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UmdFrame {
    pub screen: u16,
    pub displays: Vec<UmdDisplay>,
}

/// Parse one TSL v5 frame from a datagram.
pub fn parse_frame(buf: &[u8]) -> Result<UmdFrame, FrameError> {
    if buf.len() < 6 {
        return Err(FrameError::TooShort {
            expected: 6,
            actual: buf.len(),
        });
    }
    let pbc = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    if pbc + 2 != buf.len() {
        return Err(FrameError::LengthMismatch {
            header_len: pbc + 2,
            actual_len: buf.len(),
        });
    }
    let version = buf[2];
    if version != 0 {
        return Err(FrameError::UnsupportedVersion(version));
    }
    let _flags = buf[3];
    let screen = u16::from_le_bytes([buf[4], buf[5]]);

    let mut displays = Vec::new();
    let mut offset = 6;
    while offset < buf.len() {
        if offset + 6 > buf.len() {
            return Err(FrameError::Truncated(offset));
        }
        let index = u16::from_le_bytes([buf[offset], buf[offset + 1]]);
        let control = u16::from_le_bytes([buf[offset + 2], buf[offset + 3]]);
        let text_len = u16::from_le_bytes([buf[offset + 4], buf[offset + 5]]) as usize;
        offset += 6;
        if offset + text_len > buf.len() {
            return Err(FrameError::Truncated(offset));
        }
        let text = if control & CONTROL_DATA_FLAG == 0 {
            String::from_utf8_lossy(&buf[offset..offset + text_len])
                .trim_end_matches(['\0', ' '])
                .to_string()
        } else {
            // Control data payload; no text for this display
            String::new()
        };
        offset += text_len;

        displays.push(UmdDisplay {
            index,
            brightness: ((control >> 6) & 0x03) as u8,
            fields: UmdFields {
                rh: TallyColor::from_wire(control),
                txt: TallyColor::from_wire(control >> 2),
                lh: TallyColor::from_wire(control >> 4),
                text,
            },
        });
    }
    if displays.is_empty() {
        return Err(FrameError::Empty);
    }
    Ok(UmdFrame { screen, displays })
}

/// Emitted whenever a display entry's fields change.
#[derive(Clone, Debug, PartialEq)]
pub struct TallyUpdate {
    pub key: TallyKey,
    pub fields: UmdFields,
}

/// The `(screen, index) -> fields` table with change detection.
#[derive(Default)]
pub struct UmdTable {
    entries: HashMap<TallyKey, UmdFields>,
}

impl UmdTable {
    pub fn new() -> Self {
        UmdTable::default()
    }

    /// Fold one display message in; `Some` only when a field changed.
    /// Indices outside the declared range are rejected.
    pub fn apply(&mut self, screen: u16, display: &UmdDisplay) -> Option<TallyUpdate> {
        if display.index >= MAX_TALLY {
            return None;
        }
        let key = TallyKey {
            screen,
            index: display.index,
        };
        let changed = self.entries.get(&key) != Some(&display.fields);
        if !changed {
            return None;
        }
        self.entries.insert(key, display.fields.clone());
        Some(TallyUpdate {
            key,
            fields: display.fields.clone(),
        })
    }

    pub fn get(&self, key: &TallyKey) -> Option<&UmdFields> {
        self.entries.get(key)
    }
}

pub struct UmdListener {
    bind: String,
    tx: mpsc::Sender<TallyUpdate>,
    table: UmdTable,
    malformed: Arc<AtomicU64>,
}

impl UmdListener {
    pub fn new(bind: String, tx: mpsc::Sender<TallyUpdate>) -> Self {
        UmdListener {
            bind,
            tx,
            table: UmdTable::new(),
            malformed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of dropped malformed frames, for diagnostics.
    pub fn malformed_counter(&self) -> Arc<AtomicU64> {
        self.malformed.clone()
    }

    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<(), DeviceError> {
        let socket = UdpSocket::bind(&self.bind)
            .await
            .map_err(|e| DeviceError::Bind(self.bind.clone(), e))?;
        log::info!("UMD listener on {}", self.bind);

        let mut buf = [0u8; RECV_BUFFER_LEN];
        loop {
            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    return Ok(());
                },
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => {
                            self.process_datagram(&buf[..len], &from.to_string()).await;
                        }
                        Err(e) => {
                            // Transient on some platforms (e.g. ICMP bounce)
                            log::warn!("UMD socket error: {}", e);
                        }
                    }
                },
            }
        }
    }

    async fn process_datagram(&mut self, datagram: &[u8], from: &str) {
        let frame = match parse_frame(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                let count = self.malformed.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("{}: malformed UMD frame ({}), {} dropped so far", from, e, count);
                return;
            }
        };
        log::trace!(
            "{}: UMD screen {} with {} display(s)",
            from,
            frame.screen,
            frame.displays.len()
        );
        for display in &frame.displays {
            if display.index >= MAX_TALLY {
                log::debug!(
                    "{}: display index {} outside range 0..{}, dropped",
                    from,
                    display.index,
                    MAX_TALLY
                );
                continue;
            }
            if let Some(update) = self.table.apply(frame.screen, display) {
                log::debug!(
                    "tally {}: rh {} txt {} lh {} text '{}'",
                    update.key,
                    update.fields.rh,
                    update.fields.txt,
                    update.fields.lh,
                    update.fields.text
                );
                if self.tx.send(update).await.is_err() {
                    return;
                }
            }
        }
    }
}
