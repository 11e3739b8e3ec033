//! Multiplexed non-blocking connection to a single drive.
//!
//! Many threads may submit requests concurrently; responses are matched
//! back to their callbacks by request id. All socket I/O is non-blocking:
//! submission attempts an immediate flush and the watcher drains the rest
//! on readiness events.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Registry, Token};
use shoal_types::{DriveStatus, StatusCode};
use shoal_wire::{EnvelopeDecoder, Request, RequestPayload, Response, ResponsePayload};
use tracing::{debug, trace, warn};

use crate::error::{DriveError, DriveResult};
use crate::watcher::{socket_interest, SocketWatcher};

/// Identifies one in-flight request on a channel.
pub type HandlerKey = u64;

/// Result delivered to an operation callback.
#[derive(Debug)]
pub struct OpResult {
    pub status: DriveStatus,
    pub payload: ResponsePayload,
}

impl OpResult {
    /// A client-side result with no payload.
    pub fn client(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: DriveStatus::new(code, message),
            payload: ResponsePayload::None,
        }
    }
}

/// Callback invoked exactly once when a request completes, fails or is
/// cancelled by connection teardown.
pub type OpCallback = Box<dyn FnOnce(OpResult) + Send + 'static>;

/// Read chunk size for draining the socket.
const READ_CHUNK: usize = 64 * 1024;

struct SocketState {
    stream: TcpStream,
    write_buffer: Vec<u8>,
    decoder: EnvelopeDecoder,
}

/// A live, multiplexed connection to one drive.
pub struct DriveChannel {
    socket: Mutex<SocketState>,
    pending: Mutex<HashMap<u64, OpCallback>>,
    next_id: AtomicU64,
    broken: AtomicBool,
    token: OnceLock<Token>,
    watcher: Arc<SocketWatcher>,
    peer: SocketAddr,
}

impl std::fmt::Debug for DriveChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveChannel")
            .field("peer", &self.peer)
            .field("broken", &self.broken.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DriveChannel {
    /// Connects to `addr` and subscribes the socket to the watcher.
    pub fn connect(
        watcher: &Arc<SocketWatcher>,
        addr: SocketAddr,
        timeout: Duration,
    ) -> DriveResult<Arc<Self>> {
        let stream = std::net::TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let stream = TcpStream::from_std(stream);

        let channel = Arc::new(Self {
            socket: Mutex::new(SocketState {
                stream,
                write_buffer: Vec::new(),
                decoder: EnvelopeDecoder::new(),
            }),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            broken: AtomicBool::new(false),
            token: OnceLock::new(),
            watcher: Arc::clone(watcher),
            peer: addr,
        });

        let token = watcher.subscribe(&channel)?;
        channel
            .token
            .set(token)
            .expect("token set once at connect");
        debug!(peer = %addr, token = token.0, "drive channel connected");
        Ok(channel)
    }

    /// Registers the underlying stream with the poll registry.
    ///
    /// Called by the watcher during subscription.
    pub(crate) fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        let mut socket = self.socket.lock().expect("channel socket poisoned");
        registry.register(&mut socket.stream, token, socket_interest())
    }

    /// Submits a request; the callback fires when the response arrives or
    /// the connection dies.
    pub fn submit(&self, payload: RequestPayload, callback: OpCallback) -> DriveResult<HandlerKey> {
        if self.broken.load(Ordering::Acquire) {
            return Err(DriveError::NotConnected(self.peer.to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let wire = Request::new(id, payload).to_wire()?;

        self.pending
            .lock()
            .expect("channel pending map poisoned")
            .insert(id, callback);

        let flush_result = {
            let mut socket = self.socket.lock().expect("channel socket poisoned");
            socket.write_buffer.extend_from_slice(&wire);
            try_flush(&mut socket)
        };

        if let Err(e) = flush_result {
            warn!(peer = %self.peer, error = %e, "write failed, tearing down channel");
            self.fail_connection();
            return Err(DriveError::NotConnected(self.peer.to_string()));
        }

        trace!(peer = %self.peer, id, "request submitted");
        Ok(id)
    }

    /// Forgets an in-flight request. Its callback is dropped uninvoked.
    pub fn cancel(&self, key: HandlerKey) {
        self.pending
            .lock()
            .expect("channel pending map poisoned")
            .remove(&key);
    }

    /// True once a fatal socket error has been observed.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Readiness dispatch from the watcher thread.
    pub(crate) fn on_ready(&self, readable: bool, writable: bool) {
        if self.broken.load(Ordering::Acquire) {
            return;
        }

        if writable {
            let result = {
                let mut socket = self.socket.lock().expect("channel socket poisoned");
                try_flush(&mut socket)
            };
            if let Err(e) = result {
                warn!(peer = %self.peer, error = %e, "flush failed on writable event");
                self.fail_connection();
                return;
            }
        }

        if readable {
            match self.drain_socket() {
                Ok(responses) => {
                    for response in responses {
                        self.complete(response);
                    }
                }
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "read failed, tearing down channel");
                    self.fail_connection();
                }
            }
        }
    }

    /// Reads everything available and decodes complete responses.
    fn drain_socket(&self) -> DriveResult<Vec<Response>> {
        let mut responses = Vec::new();
        let mut socket = self.socket.lock().expect("channel socket poisoned");
        let mut chunk = [0_u8; READ_CHUNK];

        loop {
            match socket.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(DriveError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by drive",
                    )));
                }
                Ok(n) => socket.decoder.feed(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(DriveError::Io(e)),
            }
        }

        while let Some(payload) = socket.decoder.next_payload()? {
            responses.push(Response::from_payload(&payload)?);
        }
        Ok(responses)
    }

    /// Routes a decoded response to its pending callback.
    fn complete(&self, response: Response) {
        let callback = self
            .pending
            .lock()
            .expect("channel pending map poisoned")
            .remove(&response.id);

        match callback {
            Some(callback) => {
                trace!(peer = %self.peer, id = response.id, code = %response.status.code, "response");
                callback(OpResult {
                    status: response.status,
                    payload: response.payload,
                });
            }
            // Cancelled (e.g. after an operation timeout); drop silently.
            None => trace!(peer = %self.peer, id = response.id, "response for cancelled request"),
        }
    }

    /// Marks the channel broken, detaches it from the watcher and fails
    /// every pending request.
    pub(crate) fn fail_connection(&self) {
        if self.broken.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(token) = self.token.get() {
            self.watcher.unsubscribe(*token);
            let mut socket = self.socket.lock().expect("channel socket poisoned");
            if let Err(e) = self.watcher.registry().deregister(&mut socket.stream) {
                // The fd may already be gone; nothing left to detach.
                trace!(peer = %self.peer, error = %e, "deregister failed");
            }
        }

        let pending: Vec<OpCallback> = {
            let mut pending = self.pending.lock().expect("channel pending map poisoned");
            pending.drain().map(|(_, cb)| cb).collect()
        };
        debug!(peer = %self.peer, dropped = pending.len(), "channel failed");
        for callback in pending {
            callback(OpResult::client(
                StatusCode::ConnectionError,
                format!("connection to {} lost", self.peer),
            ));
        }
    }
}

impl Drop for DriveChannel {
    fn drop(&mut self) {
        // Deregistration must precede closing the fd.
        if !self.broken.load(Ordering::Acquire) {
            if let Some(token) = self.token.get() {
                self.watcher.unsubscribe(*token);
                if let Ok(mut socket) = self.socket.lock() {
                    let _ = self.watcher.registry().deregister(&mut socket.stream);
                }
            }
        }
    }
}

/// Writes as much of the buffered output as the socket accepts.
fn try_flush(socket: &mut SocketState) -> io::Result<()> {
    while !socket.write_buffer.is_empty() {
        match socket.stream.write(&socket.write_buffer) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "drive socket refused bytes",
                ))
            }
            Ok(n) => {
                socket.write_buffer.drain(..n);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
