//! # shoal-sim: In-memory drive simulator
//!
//! A [`SimDrive`] listens on an ephemeral localhost port and speaks the
//! `shoal-wire` protocol against an in-memory key/value store with the
//! drive's version-precondition semantics. Drives can be stopped and
//! restarted to exercise reconnect and quorum-degradation paths.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use shoal_types::{ClusterLimits, DriveStatus, StatusCode};
use shoal_wire::{
    DriveCapacity, DriveLog, EnvelopeDecoder, GetLogType, Record, Request, RequestPayload,
    Response, ResponsePayload, WriteMode,
};
use tracing::{debug, trace, warn};

/// Default per-shard value limit; deliberately small so tests exercise
/// striping and cache eviction without large buffers.
pub const DEFAULT_MAX_VALUE_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
struct StoredRecord {
    record: Record,
}

struct DriveState {
    store: Mutex<HashMap<Vec<u8>, StoredRecord>>,
    limits: ClusterLimits,
    nominal_capacity: u64,
    running: AtomicBool,
    /// Live client sockets, kept so `stop()` can sever them.
    conns: Mutex<Vec<TcpStream>>,
}

/// One simulated drive on a fixed localhost port.
pub struct SimDrive {
    state: Arc<DriveState>,
    addr: SocketAddr,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SimDrive {
    /// Binds to an ephemeral port and starts serving.
    pub fn start() -> std::io::Result<Self> {
        Self::with_limits(ClusterLimits {
            max_key_size: 4096,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            max_version_size: 4096,
        })
    }

    /// Binds with custom drive limits.
    pub fn with_limits(limits: ClusterLimits) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let state = Arc::new(DriveState {
            store: Mutex::new(HashMap::new()),
            limits,
            nominal_capacity: 1024 * 1024 * 1024,
            running: AtomicBool::new(true),
            conns: Mutex::new(Vec::new()),
        });

        let drive = Self {
            state: Arc::clone(&state),
            addr,
            accept_thread: Mutex::new(None),
        };
        drive.spawn_accept_loop(listener);
        Ok(drive)
    }

    /// The address clients connect to. Stable across stop/start cycles.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops serving: severs live connections and refuses new ones.
    pub fn stop(&self) {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Unblock the accept loop.
        let _ = TcpStream::connect(self.addr);
        if let Some(thread) = self
            .accept_thread
            .lock()
            .expect("accept thread handle poisoned")
            .take()
        {
            let _ = thread.join();
        }
        let mut conns = self.state.conns.lock().expect("conn list poisoned");
        for conn in conns.drain(..) {
            let _ = conn.shutdown(Shutdown::Both);
        }
        debug!(addr = %self.addr, "sim drive stopped");
    }

    /// Resumes serving on the same port. The store survives the outage.
    pub fn restart(&self) -> std::io::Result<()> {
        if self.state.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listener = TcpListener::bind(self.addr)?;
        self.spawn_accept_loop(listener);
        debug!(addr = %self.addr, "sim drive restarted");
        Ok(())
    }

    /// Number of keys currently stored.
    pub fn key_count(&self) -> usize {
        self.state.store.lock().expect("sim store poisoned").len()
    }

    /// Direct store access for assertions.
    pub fn raw_record(&self, key: &[u8]) -> Option<Record> {
        self.state
            .store
            .lock()
            .expect("sim store poisoned")
            .get(key)
            .map(|s| s.record.clone())
    }

    fn spawn_accept_loop(&self, listener: TcpListener) {
        let state = Arc::clone(&self.state);
        let thread = std::thread::Builder::new()
            .name("shoal-sim-accept".to_owned())
            .spawn(move || accept_loop(listener, state))
            .expect("spawn sim accept thread");
        *self
            .accept_thread
            .lock()
            .expect("accept thread handle poisoned") = Some(thread);
    }
}

impl Drop for SimDrive {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, state: Arc<DriveState>) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "sim accept failed");
                return;
            }
        };
        if !state.running.load(Ordering::SeqCst) {
            // The wake-up connection used by stop().
            return;
        }

        trace!(%peer, "sim drive accepted connection");
        if let Ok(clone) = stream.try_clone() {
            state.conns.lock().expect("conn list poisoned").push(clone);
        }
        let conn_state = Arc::clone(&state);
        let _ = std::thread::Builder::new()
            .name("shoal-sim-conn".to_owned())
            .spawn(move || serve_connection(stream, conn_state));
    }
}

fn serve_connection(mut stream: TcpStream, state: Arc<DriveState>) {
    let mut decoder = EnvelopeDecoder::new();
    let mut chunk = [0_u8; 64 * 1024];

    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => n,
            Err(_) => return,
        };
        decoder.feed(&chunk[..n]);

        loop {
            let payload = match decoder.next_payload() {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "sim drive received garbage, closing");
                    return;
                }
            };
            let request = match Request::from_payload(&payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "sim drive failed to decode request");
                    return;
                }
            };

            let response = handle_request(&state, request);
            let wire = match response.to_wire() {
                Ok(wire) => wire,
                Err(e) => {
                    warn!(error = %e, "sim drive failed to encode response");
                    return;
                }
            };
            if stream.write_all(&wire).is_err() {
                return;
            }
        }
    }
}

fn handle_request(state: &DriveState, request: Request) -> Response {
    let id = request.id;
    match request.payload {
        RequestPayload::Noop => Response::new(id, DriveStatus::ok(), ResponsePayload::None),

        RequestPayload::Get { key } => {
            let store = state.store.lock().expect("sim store poisoned");
            match store.get(&key) {
                Some(stored) => Response::new(
                    id,
                    DriveStatus::ok(),
                    ResponsePayload::Record(stored.record.clone()),
                ),
                None => Response::error(id, not_found(&key)),
            }
        }

        RequestPayload::GetVersion { key } => {
            let store = state.store.lock().expect("sim store poisoned");
            match store.get(&key) {
                Some(stored) => Response::new(
                    id,
                    DriveStatus::ok(),
                    ResponsePayload::Version(stored.record.version.clone()),
                ),
                None => Response::error(id, not_found(&key)),
            }
        }

        RequestPayload::Put {
            key,
            prior_version,
            mode,
            record,
            persist: _,
        } => {
            let mut store = state.store.lock().expect("sim store poisoned");
            if mode == WriteMode::RequireSameVersion {
                let stored_version = store.get(&key).map(|s| s.record.version.as_slice());
                if !version_matches(stored_version, &prior_version) {
                    return Response::error(
                        id,
                        DriveStatus::new(StatusCode::VersionMismatch, "version mismatch on put"),
                    );
                }
            }
            store.insert(key, StoredRecord { record });
            Response::new(id, DriveStatus::ok(), ResponsePayload::None)
        }

        RequestPayload::Delete {
            key,
            prior_version,
            mode,
            persist: _,
        } => {
            let mut store = state.store.lock().expect("sim store poisoned");
            match store.get(&key) {
                None => Response::error(id, not_found(&key)),
                Some(stored) => {
                    if mode == WriteMode::RequireSameVersion
                        && !version_matches(Some(stored.record.version.as_slice()), &prior_version)
                    {
                        return Response::error(
                            id,
                            DriveStatus::new(
                                StatusCode::VersionMismatch,
                                "version mismatch on delete",
                            ),
                        );
                    }
                    store.remove(&key);
                    Response::new(id, DriveStatus::ok(), ResponsePayload::None)
                }
            }
        }

        RequestPayload::GetKeyRange {
            start,
            end,
            start_inclusive,
            end_inclusive,
            reverse,
            max_returned,
        } => {
            let store = state.store.lock().expect("sim store poisoned");
            let mut keys: Vec<Vec<u8>> = store
                .keys()
                .filter(|k| {
                    let after_start = if start_inclusive {
                        k.as_slice() >= start.as_slice()
                    } else {
                        k.as_slice() > start.as_slice()
                    };
                    let before_end = if end_inclusive {
                        k.as_slice() <= end.as_slice()
                    } else {
                        k.as_slice() < end.as_slice()
                    };
                    after_start && before_end
                })
                .cloned()
                .collect();
            keys.sort();
            if reverse {
                keys.reverse();
            }
            keys.truncate(max_returned as usize);
            Response::new(id, DriveStatus::ok(), ResponsePayload::Keys(keys))
        }

        RequestPayload::GetLog { types } => {
            let mut log = DriveLog::default();
            if types.contains(&GetLogType::Limits) {
                log.limits = state.limits;
            }
            if types.contains(&GetLogType::Capacities) {
                let used: u64 = state
                    .store
                    .lock()
                    .expect("sim store poisoned")
                    .values()
                    .map(|s| s.record.value.len() as u64)
                    .sum();
                log.capacity = DriveCapacity {
                    nominal_capacity_in_bytes: state.nominal_capacity,
                    portion_full: used as f64 / state.nominal_capacity as f64,
                };
            }
            Response::new(id, DriveStatus::ok(), ResponsePayload::Log(log))
        }
    }
}

fn not_found(key: &[u8]) -> DriveStatus {
    DriveStatus::new(
        StatusCode::NotFound,
        format!("no record for key {}", String::from_utf8_lossy(key)),
    )
}

/// Kinetic precondition: an empty prior version matches only a missing
/// key; otherwise the stored version must match byte for byte.
fn version_matches(stored: Option<&[u8]>, prior: &[u8]) -> bool {
    match stored {
        None => prior.is_empty(),
        Some(stored) => stored == prior,
    }
}
