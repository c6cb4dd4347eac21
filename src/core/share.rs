// Sharing relay: one lazily started thread multiplexes many consumers
// onto a single record source. Sessions are carried over a unix domain
// socket with length-prefixed JSON frames, so the handle below is plain
// data a worker process can consume at startup.
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam::channel::{Receiver, Select, Sender, unbounded};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::core::source::RecordSource;
use crate::core::trunk::Whence;

/// One operation sent from a proxy to the relay.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub enum ShareRequest {
    Read,
    Write(Vec<u8>),
    Seek(i64, Whence),
    Pread(u64),
    Size,
    Tell,
    SetEpoch(u64),
    Flush,
    Close,
    /// Proxy teardown; the relay drops the session without replying.
    Exit,
}

/// Relay replies collapse to three categories at the wire edge: success
/// (with or without a payload), end-of-stream, and fault. The fault
/// keeps the local error kind so proxies rehydrate the taxonomy.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub enum ShareResponse {
    Done,
    Bytes(Vec<u8>),
    Offset(u64),
    EndOfStream,
    Fault { kind: ErrorKind, message: String },
}

struct ShareSession {
    respond: Sender<ShareResponse>,
    requests: Receiver<ShareRequest>,
}

/// Bridge-side endpoints for an exported session, parked until a
/// connection claims the serial id.
struct SessionEndpoints {
    requests: Sender<ShareRequest>,
    responses: Receiver<ShareResponse>,
}

struct RelayState {
    sessions: BTreeMap<u64, ShareSession>,
    pending: BTreeMap<u64, SessionEndpoints>,
    next_serial: u64,
    running: bool,
    shutdown: bool,
}

static SOCKET_SEQ: AtomicU64 = AtomicU64::new(0);

fn relay_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!(
        "trunkrow-relay-{}-{}.sock",
        std::process::id(),
        SOCKET_SEQ.fetch_add(1, Ordering::Relaxed)
    ))
}

/// Owner-side relay. Owns the record source for its lifetime; every
/// serviced call goes through the same mutex, which is the single source
/// of serialization truth for direct and proxied access alike.
pub struct ShareRelay {
    source: Arc<Mutex<Box<dyn RecordSource>>>,
    state: Arc<Mutex<RelayState>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    socket_path: PathBuf,
}

impl ShareRelay {
    /// Binds the relay's session socket and starts accepting claims.
    pub fn new(source: impl RecordSource + 'static) -> Result<Self, Error> {
        let socket_path = relay_socket_path();
        let _ = fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("could not bind relay socket")
                .with_path(socket_path.as_path())
                .with_source(err)
        })?;
        let (wake_tx, wake_rx) = unbounded();
        let state = Arc::new(Mutex::new(RelayState {
            sessions: BTreeMap::new(),
            pending: BTreeMap::new(),
            next_serial: 0,
            running: false,
            shutdown: false,
        }));
        let accept_state = state.clone();
        thread::spawn(move || accept_main(listener, accept_state));
        Ok(Self {
            source: Arc::new(Mutex::new(Box::new(source))),
            state,
            wake_tx,
            wake_rx,
            socket_path,
        })
    }

    /// Registers a new session and hands back its descriptor: the socket
    /// path plus a serial id, plain data that survives serialization. The
    /// relay thread is spawned lazily on the first live session and picks
    /// up the new channels immediately via the wake channel.
    pub fn export(&self) -> ShareHandle {
        let (request_tx, request_rx) = unbounded();
        let (response_tx, response_rx) = unbounded();

        let serial_id = {
            let mut state = lock_state(&self.state);
            state.next_serial += 1;
            let serial_id = state.next_serial;
            state.sessions.insert(
                serial_id,
                ShareSession {
                    respond: response_tx,
                    requests: request_rx,
                },
            );
            state.pending.insert(
                serial_id,
                SessionEndpoints {
                    requests: request_tx,
                    responses: response_rx,
                },
            );
            if !state.running {
                state.running = true;
                let source = self.source.clone();
                let relay_state = self.state.clone();
                let wake_rx = self.wake_rx.clone();
                thread::spawn(move || relay_main(source, relay_state, wake_rx));
            }
            serial_id
        };
        let _ = self.wake_tx.send(());
        debug!(serial_id, "share session registered");

        ShareHandle {
            serial_id,
            socket_path: self.socket_path.clone(),
        }
    }

    /// Number of live sessions.
    pub fn clients(&self) -> usize {
        lock_state(&self.state).sessions.len()
    }

    /// Whether the relay thread is currently alive.
    pub fn is_running(&self) -> bool {
        lock_state(&self.state).running
    }
}

impl Drop for ShareRelay {
    fn drop(&mut self) {
        lock_state(&self.state).shutdown = true;
        // Nudge the accept loop so it observes the flag.
        let _ = UnixStream::connect(&self.socket_path);
        let _ = fs::remove_file(&self.socket_path);
    }
}

/// Plain descriptor for one session: the relay's socket path plus a
/// serial id. Each handle claims exactly one connection; the claim is
/// first come, first served.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ShareHandle {
    serial_id: u64,
    socket_path: PathBuf,
}

impl ShareHandle {
    pub fn serial_id(&self) -> u64 {
        self.serial_id
    }

    pub fn connect(self) -> Result<ShareProxy, Error> {
        let mut stream = UnixStream::connect(&self.socket_path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("could not reach the share relay")
                .with_path(self.socket_path.as_path())
                .with_source(err)
        })?;
        stream
            .write_all(&self.serial_id.to_le_bytes())
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("session claim failed")
                    .with_source(err)
            })?;
        Ok(ShareProxy {
            serial_id: self.serial_id,
            stream,
        })
    }
}

/// Worker-side stand-in for the shared source. Every method is one
/// blocking request/response exchange, so a single proxy's operations
/// are processed strictly in send order.
pub struct ShareProxy {
    serial_id: u64,
    stream: UnixStream,
}

impl ShareProxy {
    pub fn serial_id(&self) -> u64 {
        self.serial_id
    }

    pub fn read(&mut self) -> Result<Option<Vec<u8>>, Error> {
        match self.call(ShareRequest::Read)? {
            ShareResponse::Bytes(record) => Ok(Some(record)),
            ShareResponse::EndOfStream => Ok(None),
            response => Err(unexpected(response)),
        }
    }

    pub fn write(&mut self, record: &[u8]) -> Result<(), Error> {
        match self.call(ShareRequest::Write(record.to_vec()))? {
            ShareResponse::Done => Ok(()),
            response => Err(unexpected(response)),
        }
    }

    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, Error> {
        match self.call(ShareRequest::Seek(offset, whence))? {
            ShareResponse::Offset(position) => Ok(position),
            response => Err(unexpected(response)),
        }
    }

    pub fn pread(&mut self, n: u64) -> Result<Vec<u8>, Error> {
        match self.call(ShareRequest::Pread(n))? {
            ShareResponse::Bytes(record) => Ok(record),
            response => Err(unexpected(response)),
        }
    }

    pub fn size(&mut self) -> Result<u64, Error> {
        match self.call(ShareRequest::Size)? {
            ShareResponse::Offset(size) => Ok(size),
            response => Err(unexpected(response)),
        }
    }

    pub fn tell(&mut self) -> Result<u64, Error> {
        match self.call(ShareRequest::Tell)? {
            ShareResponse::Offset(position) => Ok(position),
            response => Err(unexpected(response)),
        }
    }

    pub fn set_epoch(&mut self, epoch: u64) -> Result<(), Error> {
        match self.call(ShareRequest::SetEpoch(epoch))? {
            ShareResponse::Done => Ok(()),
            response => Err(unexpected(response)),
        }
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        match self.call(ShareRequest::Flush)? {
            ShareResponse::Done => Ok(()),
            response => Err(unexpected(response)),
        }
    }

    pub fn close(&mut self) -> Result<(), Error> {
        match self.call(ShareRequest::Close)? {
            ShareResponse::Done => Ok(()),
            response => Err(unexpected(response)),
        }
    }

    fn call(&mut self, request: ShareRequest) -> Result<ShareResponse, Error> {
        write_frame(&mut self.stream, &request)?;
        match read_frame(&mut self.stream)? {
            None => Err(relay_gone()),
            Some(ShareResponse::Fault { kind, message }) => {
                Err(Error::new(kind).with_message(message))
            }
            Some(response) => Ok(response),
        }
    }
}

impl Drop for ShareProxy {
    fn drop(&mut self) {
        let _ = write_frame(&mut self.stream, &ShareRequest::Exit);
        debug!(serial_id = self.serial_id, "share proxy exited");
    }
}

fn accept_main(listener: UnixListener, state: Arc<Mutex<RelayState>>) {
    loop {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(_) => break,
        };
        if lock_state(&state).shutdown {
            break;
        }
        let bridge_state = state.clone();
        thread::spawn(move || bridge_main(stream, bridge_state));
    }
    debug!("share listener stopped");
}

/// Pumps one claimed connection: socket frames in, relay responses out.
/// Dropping the request sender on any exit path is what tells the relay
/// the session is gone.
fn bridge_main(mut stream: UnixStream, state: Arc<Mutex<RelayState>>) {
    let mut raw = [0u8; 8];
    if stream.read_exact(&mut raw).is_err() {
        return;
    }
    let serial_id = u64::from_le_bytes(raw);
    let endpoints = lock_state(&state).pending.remove(&serial_id);
    let Some(SessionEndpoints { requests, responses }) = endpoints else {
        debug!(serial_id, "rejected unknown or already claimed session");
        return;
    };
    debug!(serial_id, "share session connected");

    loop {
        let request: ShareRequest = match read_frame(&mut stream) {
            Ok(Some(request)) => request,
            // Socket EOF and garbage frames both end the session.
            Ok(None) | Err(_) => return,
        };
        let exit = request == ShareRequest::Exit;
        if requests.send(request).is_err() {
            return;
        }
        if exit {
            return;
        }
        let response = match responses.recv() {
            Ok(response) => response,
            Err(_) => return,
        };
        if write_frame(&mut stream, &response).is_err() {
            return;
        }
    }
}

fn relay_main(
    source: Arc<Mutex<Box<dyn RecordSource>>>,
    state: Arc<Mutex<RelayState>>,
    wake_rx: Receiver<()>,
) {
    debug!("share relay started");
    loop {
        let (serials, receivers) = {
            let mut state = lock_state(&state);
            if state.sessions.is_empty() {
                state.running = false;
                break;
            }
            let serials: Vec<u64> = state.sessions.keys().copied().collect();
            let receivers: Vec<Receiver<ShareRequest>> = state
                .sessions
                .values()
                .map(|session| session.requests.clone())
                .collect();
            (serials, receivers)
        };

        let mut select = Select::new();
        select.recv(&wake_rx);
        for receiver in &receivers {
            select.recv(receiver);
        }
        let oper = select.select();
        let index = oper.index();
        if index == 0 {
            // A disconnected wake channel means the relay owner is gone.
            if oper.recv(&wake_rx).is_err() {
                lock_state(&state).running = false;
                break;
            }
            // Registration changed; rebuild the select set.
            continue;
        }

        let serial_id = serials[index - 1];
        match oper.recv(&receivers[index - 1]) {
            // Channel EOF counts as an implicit exit so a killed worker
            // cannot leak its session.
            Err(_) => drop_session(&state, serial_id, "disconnected"),
            Ok(ShareRequest::Exit) => drop_session(&state, serial_id, "exited"),
            Ok(request) => {
                let response = service(&source, request);
                let respond = lock_state(&state)
                    .sessions
                    .get(&serial_id)
                    .map(|session| session.respond.clone());
                if let Some(respond) = respond {
                    let _ = respond.send(response);
                }
            }
        }
    }
    debug!("share relay stopped");
}

fn service(source: &Mutex<Box<dyn RecordSource>>, request: ShareRequest) -> ShareResponse {
    let mut source = source
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let outcome = match request {
        ShareRequest::Read => match source.read() {
            Ok(Some(record)) => Ok(ShareResponse::Bytes(record)),
            Ok(None) => Ok(ShareResponse::EndOfStream),
            Err(err) => Err(err),
        },
        ShareRequest::Write(record) => source.write(&record).map(|_| ShareResponse::Done),
        ShareRequest::Seek(offset, whence) => {
            source.seek(offset, whence).map(ShareResponse::Offset)
        }
        ShareRequest::Pread(n) => source.pread(n).map(ShareResponse::Bytes),
        ShareRequest::Size => Ok(ShareResponse::Offset(source.size())),
        ShareRequest::Tell => Ok(ShareResponse::Offset(source.tell())),
        ShareRequest::SetEpoch(epoch) => source.set_epoch(epoch).map(|_| ShareResponse::Done),
        ShareRequest::Flush => source.flush().map(|_| ShareResponse::Done),
        ShareRequest::Close => source.close().map(|_| ShareResponse::Done),
        // Handled by the relay loop before dispatch.
        ShareRequest::Exit => Ok(ShareResponse::Done),
    };
    outcome.unwrap_or_else(|err| ShareResponse::Fault {
        kind: err.kind(),
        message: err.to_string(),
    })
}

fn drop_session(state: &Mutex<RelayState>, serial_id: u64, reason: &str) {
    let mut state = lock_state(state);
    state.sessions.remove(&serial_id);
    debug!(serial_id, reason, "share session dropped");
}

fn lock_state(state: &Mutex<RelayState>) -> std::sync::MutexGuard<'_, RelayState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_frame<T: Serialize>(stream: &mut UnixStream, frame: &T) -> Result<(), Error> {
    let payload = serde_json::to_vec(frame).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("frame serialization failed")
            .with_source(err)
    })?;
    stream
        .write_all(&(payload.len() as u32).to_le_bytes())
        .and_then(|_| stream.write_all(&payload))
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("share session write failed")
                .with_source(err)
        })
}

/// Reads one length-prefixed frame; `Ok(None)` on a clean EOF between
/// frames.
fn read_frame<T: DeserializeOwned>(stream: &mut UnixStream) -> Result<Option<T>, Error> {
    let mut len = [0u8; 4];
    match stream.read_exact(&mut len) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => {
            return Err(Error::new(ErrorKind::Io)
                .with_message("share session read failed")
                .with_source(err));
        }
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
    stream.read_exact(&mut payload).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("share session read failed")
            .with_source(err)
    })?;
    serde_json::from_slice(&payload).map(Some).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("malformed share frame")
            .with_source(err)
    })
}

fn relay_gone() -> Error {
    Error::new(ErrorKind::Io).with_message("share relay is gone")
}

fn unexpected(response: ShareResponse) -> Error {
    Error::new(ErrorKind::Internal)
        .with_message(format!("unexpected relay response {response:?}"))
}
