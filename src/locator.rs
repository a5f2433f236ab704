//
// The locator finds cameras by browsing the local network for the JVC
// Connected Cam HTTP service. It never talks HTTP itself; it only turns
// resolved announcements into discovery events for the engine.
//
// Losing the mDNS daemon is fatal at startup only when the config has no
// seed devices; otherwise the engine keeps running with "no new
// discoveries".
//

use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_graceful_shutdown::SubsystemHandle;

use crate::device::DeviceError;

/// DNS-SD service type advertised by JVC Connected Cam camcorders.
pub const SERVICE_TYPE: &str = "_jvc-connectedcam-http._tcp.local.";

/// Repeat announcements for one service within this window are dropped.
const DEDUP_WINDOW: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq)]
pub enum DiscoveryEvent {
    Seen {
        id: String,
        model: String,
        serial: String,
        host: String,
        port: u16,
    },
    Lost {
        id: String,
    },
}

struct SeenService {
    id: String,
    endpoint: String,
    last_announce: Instant,
}

pub struct Locator {
    tx: mpsc::Sender<DiscoveryEvent>,
    /// Whether a dead browser is fatal (no seed config present).
    required: bool,
}

impl Locator {
    pub fn new(tx: mpsc::Sender<DiscoveryEvent>, required: bool) -> Self {
        Locator { tx, required }
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), DeviceError> {
        let daemon = match ServiceDaemon::new() {
            Ok(daemon) => daemon,
            Err(e) => return self.degrade(subsys, e.to_string()).await,
        };
        let events = match daemon.browse(SERVICE_TYPE) {
            Ok(events) => events,
            Err(e) => {
                let _ = daemon.shutdown();
                return self.degrade(subsys, e.to_string()).await;
            }
        };
        log::info!("Browsing for {}", SERVICE_TYPE);

        // Keyed by mDNS fullname so withdrawals resolve back to device ids
        let mut seen: HashMap<String, SeenService> = HashMap::new();

        loop {
            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    let _ = daemon.shutdown();
                    return Ok(());
                },
                event = events.recv_async() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(e) => {
                            log::error!("mDNS receiver closed: {}", e);
                            let _ = daemon.shutdown();
                            return self.degrade(subsys, e.to_string()).await;
                        }
                    };
                    self.process_event(event, &mut seen).await;
                },
            }
        }
    }

    async fn process_event(&self, event: ServiceEvent, seen: &mut HashMap<String, SeenService>) {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let fullname = info.get_fullname().to_string();

                let (model, serial) = match identity_from_txt(&info) {
                    Some(identity) => identity,
                    None => {
                        log::warn!("{}: announcement without model/serial, ignored", fullname);
                        return;
                    }
                };
                let id = crate::device::device_id(&model, &serial);

                let host = match best_address(&info) {
                    Some(host) => host,
                    None => {
                        log::warn!("{}: announcement without address, ignored", fullname);
                        return;
                    }
                };
                let port = info.get_port();
                let endpoint = format!("{}:{}", host, port);

                if let Some(previous) = seen.get(&fullname) {
                    if previous.last_announce.elapsed() < DEDUP_WINDOW {
                        log::trace!("{}: duplicate announcement dropped", fullname);
                        return;
                    }
                }
                // The same id from another endpoint violates the uniqueness
                // requirement on model+serial; first claimant wins.
                if let Some(claimant) = seen
                    .values()
                    .find(|s| s.id == id && s.endpoint != endpoint)
                {
                    log::error!(
                        "{}",
                        DeviceError::DuplicateId(id.clone(), format!("{} (already at {})", endpoint, claimant.endpoint))
                    );
                    return;
                }

                seen.insert(
                    fullname.clone(),
                    SeenService {
                        id: id.clone(),
                        endpoint,
                        last_announce: Instant::now(),
                    },
                );

                log::debug!("{}: seen at {}:{}", id, host, port);
                let _ = self
                    .tx
                    .send(DiscoveryEvent::Seen {
                        id,
                        model,
                        serial,
                        host,
                        port,
                    })
                    .await;
            }
            ServiceEvent::ServiceRemoved(_ty, fullname) => {
                if let Some(service) = seen.remove(&fullname) {
                    log::debug!("{}: withdrawn", service.id);
                    let _ = self.tx.send(DiscoveryEvent::Lost { id: service.id }).await;
                }
            }
            ServiceEvent::SearchStarted(ty) => {
                log::trace!("mDNS search started for {}", ty);
            }
            _ => {}
        }
    }

    /// No browser available: fatal when discovery is required, otherwise
    /// stay alive doing nothing so shutdown ordering is undisturbed.
    async fn degrade(self, subsys: SubsystemHandle, reason: String) -> Result<(), DeviceError> {
        if self.required {
            log::error!("Cannot start discovery and no devices configured: {}", reason);
            subsys.request_shutdown();
            return Err(DeviceError::Discovery(reason));
        }
        log::error!("Discovery unavailable ({}), continuing with configured devices only", reason);
        subsys.on_shutdown_requested().await;
        Ok(())
    }
}

fn identity_from_txt(info: &mdns_sd::ServiceInfo) -> Option<(String, String)> {
    let model = info.get_property_val_str("model");
    let serial = info.get_property_val_str("serial");
    match (model, serial) {
        (Some(model), Some(serial)) => Some((model.to_string(), serial.to_string())),
        _ => {
            // Some firmware revisions only carry the identity in the
            // instance name, e.g. "GY-HC500-12345678._jvc-...".
            let instance = info.get_fullname().split('.').next()?;
            let (model, serial) = instance.rsplit_once('-')?;
            if model.is_empty() || serial.is_empty() {
                None
            } else {
                Some((model.to_string(), serial.to_string()))
            }
        }
    }
}

/// Prefer an IPv4 address; cameras announce link-local v6 as well.
fn best_address(info: &mdns_sd::ServiceInfo) -> Option<String> {
    let mut addresses: Vec<String> = info.get_addresses().iter().map(|a| a.to_string()).collect();
    addresses.sort();
    addresses
        .iter()
        .find(|a| !a.contains(':'))
        .or_else(|| addresses.first())
        .cloned()
}
