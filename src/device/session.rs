//! Per-camera HTTP session.
//!
//! One `DeviceSession` owns a single camera's control lifecycle: the
//! authenticated HTTP client, the poll loop, the command queue and the
//! reconnect policy. The session runs as its own subsystem; the parameter
//! model outlives it across reconnects.
//!
//! ## State machine
//!
//! ```text
//! unknown → scheduling → attempting → connected
//!                ▲            │  ▲        │
//!                │            ▼  │        ├── transient ──▶ sleeping ─(backoff)─▶ attempting
//!   user reconnect        sleeping        ├── auth fatal ─▶ failed   ─(user)────▶ scheduling
//!                │                        └── user close ─▶ disconnect ─(user)─▶ scheduling
//! ```
//!
//! Backoff is exponential from 1 s, doubled per failure, capped at 60 s
//! and jittered; any successful poll resets it to base.

use once_cell::sync::Lazy;
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tokio_graceful_shutdown::SubsystemHandle;

use super::model::{ParamError, ParamValue, ParameterModel};
use super::DeviceError;
use crate::config::DeviceConfig;
use crate::spec::{self, ParamGroup, ParamSpec, MOTION_MAX_SPEED};

/// How many attempts a queued write gets before it is failed out.
pub const COMMAND_RETRIES: u32 = 3;

/// Refresh cadence for continuous motion commands.
pub const MOTION_HEARTBEAT: Duration = Duration::from_millis(80);

/// Preview fetches for one device are rate-capped to this interval.
pub const PREVIEW_MIN_INTERVAL: Duration = Duration::from_millis(500);

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const COMMAND_CHANNEL_DEPTH: usize = 32;

/// One HTTP client for the whole process; sessions add basic auth per
/// request so credentials are never cached past an auth failure.
static HTTP: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .user_agent(concat!("jvclink/", env!("CARGO_PKG_VERSION")))
        .timeout(HTTP_TIMEOUT)
        .build()
        .expect("Cannot build HTTP client")
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Unknown,
    Scheduling,
    Attempting,
    Connected,
    Sleeping,
    Failed,
    Disconnect,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Unknown => "unknown",
            ConnectionState::Scheduling => "scheduling",
            ConnectionState::Attempting => "attempting",
            ConnectionState::Connected => "connected",
            ConnectionState::Sleeping => "sleeping",
            ConnectionState::Failed => "failed",
            ConnectionState::Disconnect => "disconnect",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Backoff { next: BACKOFF_BASE }
    }

    fn reset(&mut self) {
        self.next = BACKOFF_BASE;
    }

    /// Current delay with jitter; doubles the base for the next failure.
    fn delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (self.next * 2).min(BACKOFF_CAP);
        let jitter_cap = (base.as_millis() as u64 / 4).max(1);
        base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_cap))
    }
}

#[derive(Clone, Debug)]
pub enum SessionCommand {
    /// Push the pending value of a parameter to the camera.
    Write { name: &'static str },
    /// Begin continuous motion; sign of `speed` selects the direction.
    MotionStart { name: &'static str, speed: i32 },
    /// Release: send one stop and cancel pending heartbeats.
    MotionStop { name: &'static str },
    Open,
    Close,
    Reconnect,
}

/// Cheap handle to a running session: command queue plus state watch.
#[derive(Clone, Debug)]
pub struct DeviceHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl DeviceHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub async fn send(&self, command: SessionCommand) -> Result<(), DeviceError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| DeviceError::Shutdown)
    }

    /// Non-blocking enqueue, for writers that must not suspend (the tally
    /// router refreshes its state on the next event anyway).
    pub fn try_send(&self, command: SessionCommand) -> Result<(), DeviceError> {
        use tokio::sync::mpsc::error::TrySendError;
        self.cmd_tx.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => DeviceError::Busy,
            TrySendError::Closed(_) => DeviceError::Shutdown,
        })
    }
}

/// The connection half of a device's configuration, snapshotted at session
/// creation time.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub auth_user: String,
    pub auth_pass: String,
    pub poll_interval: Duration,
}

impl SessionConfig {
    pub fn from_device(device: &DeviceConfig, poll_interval: Duration) -> Self {
        SessionConfig {
            id: device.id.clone(),
            host: device.host.clone(),
            port: device.port,
            auth_user: device.auth_user.clone(),
            auth_pass: device.auth_pass.clone(),
            poll_interval,
        }
    }

    fn command_url(&self, command_query: &str) -> String {
        // Template queries are "Command?rest"; fold them into one query string
        format!(
            "http://{}:{}{}?Command={}",
            self.host,
            self.port,
            spec::API_BASE,
            command_query.replacen('?', "&", 1)
        )
    }

    pub fn preview_url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, spec::PREVIEW_PATH)
    }
}

struct ActiveMotion {
    name: &'static str,
    query: String,
    stop_query: String,
}

pub struct DeviceSession {
    key: String,
    config: SessionConfig,
    model: ParameterModel,
    state_tx: watch::Sender<ConnectionState>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    /// Groups this camera reported 404 for; probed once per session.
    disabled_groups: HashSet<ParamGroup>,
    backoff: Backoff,
    motion: Option<ActiveMotion>,
}

impl DeviceSession {
    pub fn new(config: SessionConfig, model: ParameterModel) -> (Self, DeviceHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Unknown);
        let session = DeviceSession {
            key: config.id.clone(),
            config,
            model,
            state_tx,
            cmd_rx,
            disabled_groups: HashSet::new(),
            backoff: Backoff::new(),
            motion: None,
        };
        let handle = DeviceHandle { cmd_tx, state_rx };
        (session, handle)
    }

    fn set_state(&self, state: ConnectionState) {
        let old = *self.state_tx.borrow();
        if old != state {
            log::info!("{}: {} -> {}", self.key, old, state);
        }
        self.state_tx.send_replace(state);
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Main session loop; one per camera, run as a subsystem.
    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<(), DeviceError> {
        log::debug!("{}: session starting for {}:{}", self.key, self.config.host, self.config.port);
        self.set_state(ConnectionState::Scheduling);
        let cancellation = subsys.create_cancellation_token();

        loop {
            if cancellation.is_cancelled() {
                return Ok(());
            }
            match self.state() {
                ConnectionState::Unknown | ConnectionState::Scheduling => {
                    self.set_state(ConnectionState::Attempting);
                }
                ConnectionState::Attempting => match self.poll_once().await {
                    Ok(()) => {
                        self.backoff.reset();
                        self.set_state(ConnectionState::Connected);
                    }
                    Err(DeviceError::Auth) => {
                        log::error!("{}: authentication rejected, user action required", self.key);
                        self.set_state(ConnectionState::Failed);
                    }
                    Err(e) => {
                        log::warn!("{}: connect failed: {}", self.key, e);
                        self.set_state(ConnectionState::Sleeping);
                    }
                },
                ConnectionState::Connected => {
                    let next = self.run_connected(&subsys).await;
                    self.model.mark_stale();
                    match next {
                        Some(state) => self.set_state(state),
                        None => return Ok(()),
                    }
                }
                ConnectionState::Sleeping => {
                    let delay = self.backoff.delay();
                    log::debug!("{}: sleeping {:?} before retry", self.key, delay);
                    let deadline = tokio::time::Instant::now() + delay;
                    while self.state() == ConnectionState::Sleeping {
                        tokio::select! { biased;
                            _ = subsys.on_shutdown_requested() => {
                                return Ok(());
                            },
                            command = self.cmd_rx.recv() => {
                                match command {
                                    None => return Ok(()),
                                    Some(command) => self.handle_idle_command(command).await,
                                }
                            },
                            _ = tokio::time::sleep_until(deadline) => {
                                self.set_state(ConnectionState::Attempting);
                            },
                        }
                    }
                }
                ConnectionState::Failed | ConnectionState::Disconnect => {
                    tokio::select! { biased;
                        _ = subsys.on_shutdown_requested() => {
                            return Ok(());
                        },
                        command = self.cmd_rx.recv() => {
                            match command {
                                None => return Ok(()),
                                Some(command) => self.handle_idle_command(command).await,
                            }
                        },
                    }
                }
            }
        }
    }

    /// Connected steady state: poll ticks, command queue, motion heartbeat.
    /// Returns the next state, or `None` on shutdown.
    async fn run_connected(&mut self, subsys: &SubsystemHandle) -> Option<ConnectionState> {
        let mut poll = interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat = interval(MOTION_HEARTBEAT);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    return None;
                },
                command = self.cmd_rx.recv() => {
                    match command {
                        None => return None,
                        Some(command) => {
                            if let Some(next) = self.handle_command(command).await {
                                return Some(next);
                            }
                        }
                    }
                },
                _ = heartbeat.tick(), if self.motion.is_some() => {
                    if let Some(next) = self.motion_heartbeat().await {
                        return Some(next);
                    }
                },
                _ = poll.tick() => {
                    match self.poll_once().await {
                        Ok(()) => {
                            self.backoff.reset();
                        }
                        Err(DeviceError::Auth) => {
                            log::error!("{}: authentication rejected mid-session", self.key);
                            return Some(ConnectionState::Failed);
                        }
                        Err(e) => {
                            log::warn!("{}: poll failed: {}", self.key, e);
                            return Some(ConnectionState::Sleeping);
                        }
                    }
                },
            }
        }
    }

    /// Batched GET per enabled group; a 404 disables the group for the
    /// session lifetime without raising a user error.
    async fn poll_once(&mut self) -> Result<(), DeviceError> {
        for group_spec in spec::REGISTRY {
            if self.disabled_groups.contains(&group_spec.group) {
                continue;
            }
            match self.get_json(group_spec.poll_command).await {
                Ok(response) => {
                    let data = response_data(&response);
                    let bad = self.model.apply_remote(group_spec.group, data);
                    if bad > 0 {
                        log::debug!("{}: {} unparseable field(s) in {}", self.key, bad, group_spec.poll_command);
                    }
                }
                Err(DeviceError::Capability) => {
                    log::info!("{}: group {} not supported, disabling", self.key, group_spec.group);
                    self.disabled_groups.insert(group_spec.group);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Returns the next state when the session must leave `connected`.
    async fn handle_command(&mut self, command: SessionCommand) -> Option<ConnectionState> {
        match command {
            SessionCommand::Write { name } => match self.execute_write(name).await {
                Ok(()) => None,
                Err(DeviceError::Auth) => Some(ConnectionState::Failed),
                Err(_) => Some(ConnectionState::Sleeping),
            },
            SessionCommand::MotionStart { name, speed } => match self.motion_start(name, speed).await {
                Ok(()) => None,
                Err(DeviceError::Auth) => Some(ConnectionState::Failed),
                Err(DeviceError::Param(e)) => {
                    log::warn!("{}: motion rejected: {}", self.key, e);
                    None
                }
                Err(_) => Some(ConnectionState::Sleeping),
            },
            SessionCommand::MotionStop { name } => match self.motion_stop(name).await {
                Ok(()) => None,
                Err(DeviceError::Auth) => Some(ConnectionState::Failed),
                Err(_) => Some(ConnectionState::Sleeping),
            },
            SessionCommand::Open => None,
            SessionCommand::Close => {
                // Best effort stop of any held motion before going idle
                if let Some(motion) = self.motion.take() {
                    let _ = self.get_json(&motion.stop_query).await;
                }
                Some(ConnectionState::Disconnect)
            }
            SessionCommand::Reconnect => Some(ConnectionState::Scheduling),
        }
    }

    async fn handle_idle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Open | SessionCommand::Reconnect => {
                self.backoff.reset();
                self.set_state(ConnectionState::Scheduling);
            }
            SessionCommand::Close => {
                self.set_state(ConnectionState::Disconnect);
            }
            SessionCommand::Write { name } => {
                self.model.write_failed(name, "not connected");
            }
            SessionCommand::MotionStart { .. } | SessionCommand::MotionStop { .. } => {}
        }
    }

    /// One queued write, single in flight, retried up to [`COMMAND_RETRIES`].
    /// The command response is routed like a poll so the model converges
    /// without awaiting the next poll tick.
    async fn execute_write(&mut self, name: &'static str) -> Result<(), DeviceError> {
        let Some(value) = self.model.pending_value(name) else {
            // Write already resolved (e.g. superseded); nothing to send
            return Ok(());
        };
        let Some((group_spec, param_spec)) = spec::lookup(name) else {
            self.model.write_failed(name, "unknown parameter");
            return Ok(());
        };
        let query = match encode_write(param_spec, &value, self.model.last_remote_value(name)) {
            Ok(query) => query,
            Err(e) => {
                self.model.write_failed(name, &e.to_string());
                return Ok(());
            }
        };

        let mut last_error = DeviceError::Timeout;
        for attempt in 1..=COMMAND_RETRIES {
            match self.get_json(&query).await {
                Ok(response) => {
                    self.model.write_succeeded(name);
                    let data = response_data(&response);
                    self.model.apply_remote(group_spec.group, data);
                    return Ok(());
                }
                Err(DeviceError::Auth) => {
                    self.model.write_failed(name, "authentication rejected");
                    return Err(DeviceError::Auth);
                }
                Err(e) => {
                    log::warn!("{}: write {} attempt {}/{} failed: {}", self.key, name, attempt, COMMAND_RETRIES, e);
                    last_error = e;
                }
            }
        }
        self.model.write_failed(name, &last_error.to_string());
        Err(last_error)
    }

    async fn motion_start(&mut self, name: &'static str, speed: i32) -> Result<(), DeviceError> {
        let Some((_, param_spec)) = spec::lookup(name) else {
            return Err(DeviceError::Param(ParamError::NotSupported(name.to_string())));
        };
        let Some(motion_spec) = param_spec.motion else {
            return Err(DeviceError::Param(ParamError::ReadOnly(param_spec.name)));
        };
        if speed == 0 || speed.abs() > MOTION_MAX_SPEED {
            return Err(DeviceError::Param(ParamError::Invalid(param_spec.name, speed.to_string())));
        }
        if let Some(guard) = param_spec.auto_guard {
            if self
                .model
                .current_value(guard)
                .as_ref()
                .and_then(|v| v.as_choice())
                == Some("Auto")
            {
                return Err(DeviceError::Param(ParamError::AutoMode(param_spec.name, guard)));
            }
        }

        let kind = if speed > 0 { motion_spec.pos } else { motion_spec.neg };
        let query = motion_spec
            .template
            .replace("{kind}", kind)
            .replace("{speed}", &speed.abs().to_string());

        self.get_json(&query).await?;
        log::debug!("{}: motion {} speed {} started", self.key, name, speed);
        self.motion = Some(ActiveMotion {
            name,
            query,
            stop_query: motion_spec.stop.to_string(),
        });
        Ok(())
    }

    /// Release: one stop command, pending heartbeats cancelled.
    async fn motion_stop(&mut self, name: &'static str) -> Result<(), DeviceError> {
        let Some(motion) = self.motion.take() else {
            return Ok(());
        };
        if motion.name != name {
            // Stop for a motion that was already superseded
            self.motion = Some(motion);
            return Ok(());
        }
        let response = self.get_json(&motion.stop_query).await?;
        log::debug!("{}: motion {} stopped", self.key, name);
        if let Some((group_spec, _)) = spec::lookup(name) {
            self.model.apply_remote(group_spec.group, response_data(&response));
        }
        Ok(())
    }

    /// Refresh the held motion command.
    async fn motion_heartbeat(&mut self) -> Option<ConnectionState> {
        let query = self.motion.as_ref().map(|m| m.query.clone())?;
        match self.get_json(&query).await {
            Ok(_) => None,
            Err(DeviceError::Auth) => Some(ConnectionState::Failed),
            Err(e) => {
                log::warn!("{}: motion heartbeat failed: {}", self.key, e);
                self.motion = None;
                Some(ConnectionState::Sleeping)
            }
        }
    }

    async fn get_json(&self, command_query: &str) -> Result<serde_json::Value, DeviceError> {
        let url = self.config.command_url(command_query);
        log::trace!("{}: GET {}", self.key, url);
        let response = HTTP
            .get(&url)
            .basic_auth(&self.config.auth_user, Some(&self.config.auth_pass))
            .send()
            .await
            .map_err(map_reqwest)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(DeviceError::Auth);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DeviceError::Capability);
        }
        if !status.is_success() {
            return Err(DeviceError::Http(status.to_string()));
        }
        response
            .json()
            .await
            .map_err(|e| DeviceError::ParseJson(e.to_string()))
    }
}

fn map_reqwest(e: reqwest::Error) -> DeviceError {
    if e.is_timeout() {
        DeviceError::Timeout
    } else {
        DeviceError::Http(e.to_string())
    }
}

/// The `Data` object of a camera response; tolerates a bare object.
fn response_data(response: &serde_json::Value) -> &serde_json::Value {
    response
        .get("Response")
        .and_then(|r| r.get("Data"))
        .unwrap_or(response)
}

/// Encode a pending write as a command query per the registry descriptor.
/// Absolute sets fill `{value}`; relative controls derive direction and
/// magnitude from the last remote reading.
fn encode_write(
    param_spec: &ParamSpec,
    value: &ParamValue,
    last_remote: Option<ParamValue>,
) -> Result<String, ParamError> {
    if let Some(set) = &param_spec.set {
        return Ok(set.template.replace("{value}", &value.encode_wire()));
    }
    if let Some(step) = &param_spec.step {
        let target = value
            .as_int()
            .ok_or_else(|| ParamError::Invalid(param_spec.name, value.encode_wire()))?;
        let from = last_remote
            .as_ref()
            .and_then(|v| v.as_int())
            .ok_or_else(|| ParamError::Invalid(param_spec.name, "no reference value".to_string()))?;
        let delta = target - from;
        if delta == 0 {
            // Nothing to move; encode a zero step towards open
            return Ok(step
                .template
                .replace("{kind}", step.inc)
                .replace("{step}", "0"));
        }
        let kind = if delta > 0 { step.inc } else { step.dec };
        return Ok(step
            .template
            .replace("{kind}", kind)
            .replace("{step}", &delta.abs().to_string()));
    }
    Err(ParamError::ReadOnly(param_spec.name))
}

/// Throttled still-image fetch. The URL itself is opaque to the engine.
/// Concurrent fetches for the same device coalesce behind one lock; fetches
/// within [`PREVIEW_MIN_INTERVAL`] are served from the last payload.
pub struct PreviewFetcher {
    url: String,
    auth_user: String,
    auth_pass: String,
    state: tokio::sync::Mutex<PreviewState>,
}

#[derive(Default)]
struct PreviewState {
    last_fetch: Option<Instant>,
    payload: Vec<u8>,
}

impl PreviewFetcher {
    pub fn new(config: &SessionConfig) -> Self {
        PreviewFetcher {
            url: config.preview_url(),
            auth_user: config.auth_user.clone(),
            auth_pass: config.auth_pass.clone(),
            state: tokio::sync::Mutex::new(PreviewState::default()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn fetch(&self) -> Result<Vec<u8>, DeviceError> {
        let mut state = self.state.lock().await;
        if let Some(last) = state.last_fetch {
            if last.elapsed() < PREVIEW_MIN_INTERVAL && !state.payload.is_empty() {
                return Ok(state.payload.clone());
            }
        }
        let response = HTTP
            .get(&self.url)
            .basic_auth(&self.auth_user, Some(&self.auth_pass))
            .send()
            .await
            .map_err(map_reqwest)?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(DeviceError::Auth);
        }
        let bytes = response.bytes().await.map_err(map_reqwest)?;
        state.payload = bytes.to_vec();
        state.last_fetch = Some(Instant::now());
        Ok(state.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

    fn iris_pos() -> &'static ParamSpec {
        spec::lookup("iris.pos").unwrap().1
    }

    fn test_config(host: &str, port: u16, poll_interval: Duration) -> SessionConfig {
        SessionConfig {
            id: "cam".to_string(),
            host: host.to_string(),
            port,
            auth_user: "jvc".to_string(),
            auth_pass: "secret".to_string(),
            poll_interval,
        }
    }

    /// Minimal camera stand-in: answers every request with `status` and
    /// records the request paths in arrival order.
    async fn spawn_camera_stub(status: u16) -> (std::net::SocketAddr, Arc<Mutex<Vec<String>>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let recorded = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut request = Vec::new();
                let mut buf = [0u8; 2048];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            request.extend_from_slice(&buf[..n]);
                            if request.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                let head = String::from_utf8_lossy(&request);
                let path = head.split_whitespace().nth(1).unwrap_or("").to_string();
                recorded.lock().unwrap().push(path);

                let response = if status == 200 {
                    let body = r#"{"Response":{"Data":{}}}"#;
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    )
                } else {
                    format!(
                        "HTTP/1.1 {} Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        status
                    )
                };
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        (addr, hits)
    }

    /// Run a session under a toplevel so it gets a real subsystem handle.
    fn run_session(
        session: DeviceSession,
    ) -> (tokio::sync::oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
        let join = tokio::spawn(async move {
            let _ = Toplevel::new(move |s| async move {
                s.start(SubsystemBuilder::new("session", |h| session.run(h)));
                let _ = stop_rx.await;
                s.request_shutdown();
            })
            .handle_shutdown_requests(Duration::from_millis(500))
            .await;
        });
        (stop_tx, join)
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn auth_failure_is_sticky() {
        let (addr, hits) = spawn_camera_stub(401).await;
        let config = test_config(&addr.ip().to_string(), addr.port(), Duration::from_millis(50));
        let model = ParameterModel::new("cam");
        let (session, handle) = DeviceSession::new(config, model);
        let mut state_rx = handle.state_changes();
        let (stop_tx, join) = run_session(session);

        state_rx
            .wait_for(|s| *s == ConnectionState::Failed)
            .await
            .unwrap();
        assert_eq!(hits.lock().unwrap().len(), 1);

        // Failed is sticky: no backoff retry happens on its own
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(handle.state(), ConnectionState::Failed);
        assert_eq!(hits.lock().unwrap().len(), 1);

        // An explicit reconnect runs a fresh connect cycle, which fails
        // against the same credentials and lands in failed again
        handle.send(SessionCommand::Reconnect).await.unwrap();
        let tries = hits.clone();
        wait_until("reconnect attempt", move || tries.lock().unwrap().len() >= 2).await;
        state_rx
            .wait_for(|s| *s == ConnectionState::Failed)
            .await
            .unwrap();
        assert_eq!(hits.lock().unwrap().len(), 2);

        let _ = stop_tx.send(());
        join.await.unwrap();
    }

    #[tokio::test]
    async fn only_reconnect_or_open_leaves_failed() {
        let config = test_config("192.0.2.1", 80, Duration::from_millis(500));
        let (mut session, _handle) = DeviceSession::new(config, ParameterModel::new("cam"));
        session.set_state(ConnectionState::Failed);

        // Writes and motion are rejected without touching the state
        session
            .handle_idle_command(SessionCommand::Write { name: "iris.pos" })
            .await;
        assert_eq!(session.state(), ConnectionState::Failed);
        session
            .handle_idle_command(SessionCommand::MotionStart { name: "zoom.pos", speed: 2 })
            .await;
        assert_eq!(session.state(), ConnectionState::Failed);
        session.handle_idle_command(SessionCommand::Close).await;
        assert_eq!(session.state(), ConnectionState::Disconnect);

        session.set_state(ConnectionState::Failed);
        session.handle_idle_command(SessionCommand::Reconnect).await;
        assert_eq!(session.state(), ConnectionState::Scheduling);

        session.set_state(ConnectionState::Disconnect);
        session.handle_idle_command(SessionCommand::Open).await;
        assert_eq!(session.state(), ConnectionState::Scheduling);
    }

    #[tokio::test]
    async fn motion_release_sends_one_stop_and_cancels_heartbeats() {
        let (addr, hits) = spawn_camera_stub(200).await;
        // Slow polls so the motion traffic dominates the recording
        let config = test_config(&addr.ip().to_string(), addr.port(), Duration::from_secs(1));
        let model = ParameterModel::new("cam");
        let (session, handle) = DeviceSession::new(config, model);
        let mut state_rx = handle.state_changes();
        let (stop_tx, join) = run_session(session);

        state_rx
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        handle
            .send(SessionCommand::MotionStart { name: "zoom.pos", speed: 4 })
            .await
            .unwrap();

        // Initial command plus at least one heartbeat refresh
        let moving = hits.clone();
        wait_until("motion heartbeats", move || {
            moving
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.contains("Kind=ZoomTele"))
                .count()
                >= 2
        })
        .await;

        let released = Instant::now();
        handle
            .send(SessionCommand::MotionStop { name: "zoom.pos" })
            .await
            .unwrap();
        let stopped = hits.clone();
        wait_until("stop command", move || {
            stopped.lock().unwrap().iter().any(|p| p.contains("Kind=ZoomStop"))
        })
        .await;
        // The stop was not deferred to a poll or heartbeat boundary
        assert!(released.elapsed() < Duration::from_millis(500));

        // Heartbeats are cancelled: no motion traffic after the stop
        tokio::time::sleep(Duration::from_millis(300)).await;
        let snapshot = hits.lock().unwrap().clone();
        assert_eq!(
            snapshot.iter().filter(|p| p.contains("Kind=ZoomStop")).count(),
            1
        );
        let stop_at = snapshot
            .iter()
            .position(|p| p.contains("Kind=ZoomStop"))
            .unwrap();
        assert!(snapshot[stop_at + 1..]
            .iter()
            .all(|p| !p.contains("Kind=ZoomTele")));
        assert_eq!(handle.state(), ConnectionState::Connected);

        let _ = stop_tx.send(());
        join.await.unwrap();
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new();
        let mut bases = Vec::new();
        for _ in 0..8 {
            bases.push(backoff.delay());
        }
        // First delay is within [1s, 1.25s]
        assert!(bases[0] >= Duration::from_secs(1));
        assert!(bases[0] < Duration::from_millis(1350));
        // Monotone growth until the cap
        assert!(bases[5] >= Duration::from_secs(32));
        // Capped at 60s + jitter
        assert!(bases[7] < Duration::from_secs(76));

        backoff.reset();
        assert!(backoff.delay() < Duration::from_millis(1350));
    }

    #[test]
    fn command_url_folds_template_query() {
        let config = SessionConfig {
            id: "cam".into(),
            host: "10.0.0.7".into(),
            port: 80,
            auth_user: "jvc".into(),
            auth_pass: "secret".into(),
            poll_interval: Duration::from_millis(500),
        };
        assert_eq!(
            config.command_url("GetCamStatus"),
            "http://10.0.0.7:80/cgi-bin/api.cgi?Command=GetCamStatus"
        );
        assert_eq!(
            config.command_url("SetWebButtonEvent?Kind=IrisOpen&StepValue=5"),
            "http://10.0.0.7:80/cgi-bin/api.cgi?Command=SetWebButtonEvent&Kind=IrisOpen&StepValue=5"
        );
    }

    #[test]
    fn encode_absolute_write() {
        let (_, param) = spec::lookup("paint.red").unwrap();
        let query = encode_write(param, &ParamValue::Int(-5), None).unwrap();
        assert_eq!(query, "SetWebSliderEvent?Kind=WhPaintR&Position=-5");
    }

    #[test]
    fn encode_step_write_derives_direction() {
        let param = iris_pos();
        let query = encode_write(param, &ParamValue::Int(100), Some(ParamValue::Int(80))).unwrap();
        assert_eq!(query, "SetWebButtonEvent?Kind=IrisOpen&StepValue=20");

        let query = encode_write(param, &ParamValue::Int(60), Some(ParamValue::Int(80))).unwrap();
        assert_eq!(query, "SetWebButtonEvent?Kind=IrisClose&StepValue=20");
    }

    #[test]
    fn encode_step_write_needs_reference() {
        let param = iris_pos();
        assert!(encode_write(param, &ParamValue::Int(100), None).is_err());
    }

    #[test]
    fn response_data_tolerates_bare_objects() {
        let wrapped = serde_json::json!({"Response": {"Data": {"IrisPos": 1}}});
        assert_eq!(response_data(&wrapped).get("IrisPos").unwrap(), 1);
        let bare = serde_json::json!({"IrisPos": 2});
        assert_eq!(response_data(&bare).get("IrisPos").unwrap(), 2);
    }

    #[test]
    fn bool_write_encodes_zero_one() {
        let (_, param) = spec::lookup("tally.program").unwrap();
        let query = encode_write(param, &ParamValue::Bool(true), None).unwrap();
        assert_eq!(query, "SetStudioTally?Kind=Program&State=1");
    }
}
