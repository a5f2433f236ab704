//! TCP command port for third-party control processors.
//!
//! Line-oriented protocol: each logical message sits between `<` and `>`,
//! LF-terminated on the way out; bytes between frames are ignored. Frames
//! are searched for keywords in order and the first match wins;
//! unrecognized frames are discarded without a response, which is what the
//! upstream controllers expect.
//!
//! The server holds the current Program/Preview tally vector (MAX = 32
//! entries each, indexed by device index) and serves at most one client;
//! further connections are rejected until the client disconnects, while
//! the listener itself stays bound.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_graceful_shutdown::SubsystemHandle;

use crate::device::DeviceError;
use crate::tally::MAX_TALLY;

const SCAN_BUFFER_CAP: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TallyKind {
    Program,
    Preview,
}

impl TallyKind {
    fn keyword(&self) -> &'static str {
        match self {
            TallyKind::Program => "TALLY.PGM",
            TallyKind::Preview => "TALLY.PVW",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TallyChange {
    pub kind: TallyKind,
    pub index: u16,
    pub value: bool,
}

#[derive(Default)]
struct TallyVector {
    program: [bool; MAX_TALLY as usize],
    preview: [bool; MAX_TALLY as usize],
}

/// The tally vector shared between the router (writer) and the command
/// port server (reader + push source).
#[derive(Clone)]
pub struct SharedTallyState {
    vector: Arc<RwLock<TallyVector>>,
    change_tx: tokio::sync::broadcast::Sender<TallyChange>,
}

impl SharedTallyState {
    pub fn new() -> Self {
        let (change_tx, _) = tokio::sync::broadcast::channel(64);
        SharedTallyState {
            vector: Arc::new(RwLock::new(TallyVector::default())),
            change_tx,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TallyChange> {
        self.change_tx.subscribe()
    }

    /// Set one entry; pushes a change to subscribers only when it flips.
    pub fn set(&self, kind: TallyKind, index: u16, value: bool) -> bool {
        if index >= MAX_TALLY {
            return false;
        }
        let changed = {
            let mut vector = self.vector.write().unwrap();
            let slot = match kind {
                TallyKind::Program => &mut vector.program[index as usize],
                TallyKind::Preview => &mut vector.preview[index as usize],
            };
            let changed = *slot != value;
            *slot = value;
            changed
        };
        if changed {
            let _ = self.change_tx.send(TallyChange { kind, index, value });
        }
        changed
    }

    pub fn get(&self, kind: TallyKind, index: u16) -> bool {
        if index >= MAX_TALLY {
            return false;
        }
        let vector = self.vector.read().unwrap();
        match kind {
            TallyKind::Program => vector.program[index as usize],
            TallyKind::Preview => vector.preview[index as usize],
        }
    }

    pub fn snapshot(&self, kind: TallyKind) -> [bool; MAX_TALLY as usize] {
        let vector = self.vector.read().unwrap();
        match kind {
            TallyKind::Program => vector.program,
            TallyKind::Preview => vector.preview,
        }
    }
}

impl Default for SharedTallyState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Ping,
    Dump(TallyKind),
    Query(TallyKind, u16),
    UpdateTime(u64),
    UpdateUnsolicited(bool),
}

/// Extract `<...>` frame contents from a byte stream, tolerating split
/// frames and arbitrary junk between them.
#[derive(Default)]
pub struct FrameScanner {
    buf: Vec<u8>,
}

impl FrameScanner {
    pub fn new() -> Self {
        FrameScanner::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            let Some(start) = self.buf.iter().position(|&b| b == b'<') else {
                // No frame start in sight, drop the junk
                self.buf.clear();
                break;
            };
            let Some(end) = self.buf[start..].iter().position(|&b| b == b'>') else {
                // Incomplete frame; keep from '<' onward for the next read
                self.buf.drain(..start);
                if self.buf.len() > SCAN_BUFFER_CAP {
                    log::debug!("Command frame larger than {} bytes, discarded", SCAN_BUFFER_CAP);
                    self.buf.clear();
                }
                break;
            };
            let end = start + end;
            let content = String::from_utf8_lossy(&self.buf[start + 1..end]).to_string();
            self.buf.drain(..=end);
            frames.push(content);
        }
        frames
    }
}

/// Keyword scan in fixed order; the first hit wins. Anything else is
/// silently discarded, including the undocumented write form
/// `TALLY.PGM:n=v`.
pub fn parse_request(frame: &str) -> Option<Request> {
    if frame.contains("PING?") {
        return Some(Request::Ping);
    }
    if frame.contains("TALLY.PGM?") {
        return Some(Request::Dump(TallyKind::Program));
    }
    if frame.contains("TALLY.PVW?") {
        return Some(Request::Dump(TallyKind::Preview));
    }
    for (keyword, kind) in [
        ("TALLY.PGM:", TallyKind::Program),
        ("TALLY.PVW:", TallyKind::Preview),
    ] {
        if let Some(position) = frame.find(keyword) {
            let rest = &frame[position + keyword.len()..];
            let Some(question) = rest.find('?') else {
                return None;
            };
            let index = rest[..question].trim().parse::<u16>().ok()?;
            return Some(Request::Query(kind, index));
        }
    }
    if let Some(position) = frame.find("UPDATE.TIME=") {
        let rest = &frame[position + "UPDATE.TIME=".len()..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        return digits.parse::<u64>().ok().map(Request::UpdateTime);
    }
    if let Some(position) = frame.find("UPDATE.UNSOLICITED=") {
        let rest = &frame[position + "UPDATE.UNSOLICITED=".len()..];
        return match rest.chars().next() {
            Some('1') => Some(Request::UpdateUnsolicited(true)),
            Some('0') => Some(Request::UpdateUnsolicited(false)),
            _ => None,
        };
    }
    None
}

fn tally_line(kind: TallyKind, index: u16, value: bool) -> String {
    format!("<{}:{}={}>\n", kind.keyword(), index, value as u8)
}

pub struct CommandPortServer {
    bind: String,
    tally: SharedTallyState,
}

impl CommandPortServer {
    pub fn new(bind: String, tally: SharedTallyState) -> Self {
        CommandPortServer { bind, tally }
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), DeviceError> {
        let listener = TcpListener::bind(&self.bind)
            .await
            .map_err(|e| DeviceError::Bind(self.bind.clone(), e))?;
        log::info!("Command port on {}", self.bind);
        self.serve(subsys, listener).await
    }

    /// Accept loop on an already-bound listener.
    pub async fn serve(self, subsys: SubsystemHandle, listener: TcpListener) -> Result<(), DeviceError> {
        loop {
            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    return Ok(());
                },
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            log::info!("Command client connected from {}", peer);
                            self.serve_client(&subsys, &listener, stream).await;
                            log::info!("Command client {} disconnected", peer);
                        }
                        Err(e) => {
                            log::warn!("Command port accept failed: {}", e);
                        }
                    }
                },
            }
        }
    }

    /// One client at a time. While serving, further accepts are drained
    /// and dropped so the listener stays bound but busy.
    async fn serve_client(
        &self,
        subsys: &SubsystemHandle,
        listener: &TcpListener,
        mut stream: TcpStream,
    ) {
        let mut scanner = FrameScanner::new();
        let mut change_rx = self.tally.subscribe();
        let mut unsolicited = true;
        let mut push_period: Option<Duration> = None;
        let mut push_timer = tokio::time::interval(Duration::from_secs(3600));
        let mut buf = [0u8; 1024];

        loop {
            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    return;
                },
                rejected = listener.accept() => {
                    if let Ok((_, peer)) = rejected {
                        log::warn!("Rejecting second command client from {}", peer);
                    }
                },
                read = stream.read(&mut buf) => {
                    let len = match read {
                        Ok(0) => return,
                        Ok(len) => len,
                        Err(e) => {
                            log::debug!("Command client read error: {}", e);
                            return;
                        }
                    };
                    for frame in scanner.push(&buf[..len]) {
                        let Some(request) = parse_request(&frame) else {
                            log::debug!("Unrecognized command frame '{}' discarded", frame);
                            continue;
                        };
                        let is_time_update = matches!(request, Request::UpdateTime(_));
                        let reply = self.respond(&request, &mut unsolicited, &mut push_period);
                        if is_time_update {
                            if let Some(period) = push_period {
                                push_timer = tokio::time::interval(period);
                                push_timer.reset();
                            }
                        }
                        if !reply.is_empty() && stream.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                },
                change = change_rx.recv() => {
                    match change {
                        Ok(change) if unsolicited => {
                            let line = tally_line(change.kind, change.index, change.value);
                            if stream.write_all(line.as_bytes()).await.is_err() {
                                return;
                            }
                        }
                        _ => {}
                    }
                },
                _ = push_timer.tick(), if push_period.is_some() => {
                    let mut dump = String::new();
                    for kind in [TallyKind::Program, TallyKind::Preview] {
                        dump.push_str(&self.dump(kind));
                    }
                    if stream.write_all(dump.as_bytes()).await.is_err() {
                        return;
                    }
                },
            }
        }
    }

    fn dump(&self, kind: TallyKind) -> String {
        let snapshot = self.tally.snapshot(kind);
        let mut out = String::new();
        for (index, value) in snapshot.iter().enumerate() {
            out.push_str(&tally_line(kind, index as u16, *value));
        }
        out
    }

    fn respond(
        &self,
        request: &Request,
        unsolicited: &mut bool,
        push_period: &mut Option<Duration>,
    ) -> String {
        match request {
            Request::Ping => "<PONG>\n".to_string(),
            Request::Dump(kind) => self.dump(*kind),
            Request::Query(kind, index) => {
                if *index >= MAX_TALLY {
                    // Out-of-range query: discarded like an unknown frame
                    return String::new();
                }
                tally_line(*kind, *index, self.tally.get(*kind, *index))
            }
            Request::UpdateTime(ms) => {
                *push_period = if *ms > 0 {
                    Some(Duration::from_millis(*ms))
                } else {
                    None
                };
                format!("<UPDATE.TIME={}>\n", ms)
            }
            Request::UpdateUnsolicited(value) => {
                *unsolicited = *value;
                format!("<UPDATE.UNSOLICITED={}>\n", *value as u8)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanner_extracts_bracketed_frames() {
        let mut scanner = FrameScanner::new();
        assert_eq!(scanner.push(b"junk<PING?>trailing"), vec!["PING?"]);
        // Split across reads
        assert!(scanner.push(b"<TALLY.").is_empty());
        assert_eq!(scanner.push(b"PGM?>"), vec!["TALLY.PGM?"]);
        // Multiple frames in one read
        assert_eq!(scanner.push(b"<A><B>"), vec!["A", "B"]);
    }

    #[test]
    fn scanner_discards_unbracketed_bytes() {
        let mut scanner = FrameScanner::new();
        assert!(scanner.push(b"PING?\n").is_empty());
        assert!(scanner.push(b">>>garbage").is_empty());
        assert_eq!(scanner.push(b"<PING?>"), vec!["PING?"]);
    }

    #[test]
    fn grammar_round_trip() {
        assert_eq!(parse_request("PING?"), Some(Request::Ping));
        assert_eq!(parse_request("TALLY.PGM?"), Some(Request::Dump(TallyKind::Program)));
        assert_eq!(parse_request("TALLY.PVW?"), Some(Request::Dump(TallyKind::Preview)));
        assert_eq!(
            parse_request("TALLY.PGM:7?"),
            Some(Request::Query(TallyKind::Program, 7))
        );
        assert_eq!(
            parse_request("TALLY.PVW:31?"),
            Some(Request::Query(TallyKind::Preview, 31))
        );
        assert_eq!(parse_request("UPDATE.TIME=250"), Some(Request::UpdateTime(250)));
        assert_eq!(parse_request("UPDATE.TIME=0"), Some(Request::UpdateTime(0)));
        assert_eq!(
            parse_request("UPDATE.UNSOLICITED=1"),
            Some(Request::UpdateUnsolicited(true))
        );
        assert_eq!(
            parse_request("UPDATE.UNSOLICITED=0"),
            Some(Request::UpdateUnsolicited(false))
        );
    }

    #[test]
    fn first_keyword_match_wins() {
        // Tolerant parse: keywords anywhere in the frame body
        assert_eq!(parse_request("xxPING?yy"), Some(Request::Ping));
        // PING? beats everything else in scan order
        assert_eq!(parse_request("TALLY.PGM? PING?"), Some(Request::Ping));
    }

    #[test]
    fn unknown_frames_are_discarded() {
        assert_eq!(parse_request(""), None);
        assert_eq!(parse_request("HELLO"), None);
        // The undocumented write verb stays unimplemented
        assert_eq!(parse_request("TALLY.PGM:3=1"), None);
        assert_eq!(parse_request("TALLY.PGM:x?"), None);
    }

    #[test]
    fn vector_set_reports_changes_once() {
        let state = SharedTallyState::new();
        let mut rx = state.subscribe();

        assert!(state.set(TallyKind::Program, 0, true));
        assert!(!state.set(TallyKind::Program, 0, true));
        assert!(state.set(TallyKind::Program, 0, false));

        assert_eq!(
            rx.try_recv().unwrap(),
            TallyChange { kind: TallyKind::Program, index: 0, value: true }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            TallyChange { kind: TallyKind::Program, index: 0, value: false }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn vector_rejects_out_of_range() {
        let state = SharedTallyState::new();
        assert!(!state.set(TallyKind::Program, MAX_TALLY, true));
        assert!(!state.get(TallyKind::Program, MAX_TALLY));
    }

    #[test]
    fn dump_covers_all_indices() {
        let state = SharedTallyState::new();
        state.set(TallyKind::Program, 3, true);
        let server = CommandPortServer::new("unused".to_string(), state);
        let dump = server.dump(TallyKind::Program);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), MAX_TALLY as usize);
        assert_eq!(lines[0], "<TALLY.PGM:0=0>");
        assert_eq!(lines[3], "<TALLY.PGM:3=1>");
        assert_eq!(lines[31], "<TALLY.PGM:31=0>");
    }

    /// One controller session against a live server: liveness, full dump,
    /// unsolicited pushes, silencing them, and querying past the silence.
    #[tokio::test]
    async fn controller_session_round_trip() {
        use std::time::Duration;
        use tokio::io::{AsyncBufReadExt, BufReader};
        use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

        let state = SharedTallyState::new();
        state.set(TallyKind::Program, 3, true);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = CommandPortServer::new(addr.to_string(), state.clone());

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let toplevel = tokio::spawn(async move {
            let _ = Toplevel::new(move |s| async move {
                s.start(SubsystemBuilder::new("CommandPort", move |h| server.serve(h, listener)));
                let _ = stop_rx.await;
                s.request_shutdown();
            })
            .handle_shutdown_requests(Duration::from_millis(500))
            .await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        // Liveness
        write_half.write_all(b"<PING?>").await.unwrap();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "<PONG>\n");

        // Full program dump, one line per index
        write_half.write_all(b"<TALLY.PGM?>").await.unwrap();
        let mut dump = Vec::new();
        for _ in 0..MAX_TALLY {
            line.clear();
            reader.read_line(&mut line).await.unwrap();
            dump.push(line.trim_end().to_string());
        }
        assert_eq!(dump.len(), 32);
        assert_eq!(dump[0], "<TALLY.PGM:0=0>");
        assert_eq!(dump[3], "<TALLY.PGM:3=1>");
        assert_eq!(dump[31], "<TALLY.PGM:31=0>");

        // Unsolicited pushes are on by default
        state.set(TallyKind::Preview, 1, true);
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "<TALLY.PVW:1=1>\n");

        // Silence them; the setting is echoed back
        write_half.write_all(b"<UPDATE.UNSOLICITED=0>").await.unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "<UPDATE.UNSOLICITED=0>\n");

        // An external change must not be pushed now
        state.set(TallyKind::Program, 0, true);
        line.clear();
        let silent =
            tokio::time::timeout(Duration::from_millis(200), reader.read_line(&mut line)).await;
        assert!(silent.is_err(), "unexpected push after UPDATE.UNSOLICITED=0");

        // A query still answers with the updated value
        write_half.write_all(b"<TALLY.PGM:0?>").await.unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "<TALLY.PGM:0=1>\n");

        let _ = stop_tx.send(());
        toplevel.await.unwrap();
    }

    #[test]
    fn responses_echo_update_settings() {
        let server = CommandPortServer::new("unused".to_string(), SharedTallyState::new());
        let mut unsolicited = true;
        let mut period = None;

        let reply = server.respond(&Request::UpdateUnsolicited(false), &mut unsolicited, &mut period);
        assert_eq!(reply, "<UPDATE.UNSOLICITED=0>\n");
        assert!(!unsolicited);

        let reply = server.respond(&Request::UpdateTime(500), &mut unsolicited, &mut period);
        assert_eq!(reply, "<UPDATE.TIME=500>\n");
        assert_eq!(period, Some(Duration::from_millis(500)));

        let reply = server.respond(&Request::UpdateTime(0), &mut unsolicited, &mut period);
        assert_eq!(reply, "<UPDATE.TIME=0>\n");
        assert_eq!(period, None);

        // Out-of-range query yields silence
        let reply = server.respond(&Request::Query(TallyKind::Program, 99), &mut unsolicited, &mut period);
        assert!(reply.is_empty());

        let reply = server.respond(&Request::Ping, &mut unsolicited, &mut period);
        assert_eq!(reply, "<PONG>\n");
    }
}
