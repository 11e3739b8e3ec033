//! Shared socket readiness loop.
//!
//! A single long-lived thread owns a `mio::Poll` and dispatches readiness
//! events to the owning [`DriveChannel`](crate::DriveChannel) of each
//! registered socket. The watcher holds only weak back references: it
//! never owns a connection.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, trace, warn};

use crate::channel::DriveChannel;

/// Token reserved for the shutdown waker.
const WAKER_TOKEN: Token = Token(0);

/// Maximum events to process per poll iteration.
const MAX_EVENTS: usize = 128;

/// Shared readiness loop for all drive connections in the process.
///
/// `subscribe` and `unsubscribe` are safe to call from any thread. The
/// poll thread is joined on drop.
pub struct SocketWatcher {
    registry: Registry,
    waker: Waker,
    shared: Arc<WatcherShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct WatcherShared {
    /// Registered sockets, keyed by their poll token.
    channels: Mutex<HashMap<Token, Weak<DriveChannel>>>,
    /// Next token to hand out. Token 0 is the waker.
    next_token: AtomicUsize,
    shutdown: AtomicBool,
}

impl SocketWatcher {
    /// Creates the watcher and spawns its poll thread.
    pub fn new() -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::new(WatcherShared {
            channels: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(1),
            shutdown: AtomicBool::new(false),
        });

        let loop_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("shoal-watcher".to_owned())
            .spawn(move || event_loop(poll, loop_shared))?;

        Ok(Arc::new(Self {
            registry,
            waker,
            shared,
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// Registers a channel's socket for readiness events.
    ///
    /// The channel must hold its socket; the watcher records only a weak
    /// back reference and dispatches by token.
    pub fn subscribe(&self, channel: &Arc<DriveChannel>) -> io::Result<Token> {
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        self.shared
            .channels
            .lock()
            .expect("watcher channel map poisoned")
            .insert(token, Arc::downgrade(channel));

        if let Err(e) = channel.register(&self.registry, token) {
            self.shared
                .channels
                .lock()
                .expect("watcher channel map poisoned")
                .remove(&token);
            return Err(e);
        }
        debug!(token = token.0, "subscribed drive socket");
        Ok(token)
    }

    /// Removes a token from dispatch.
    ///
    /// The caller deregisters the socket itself (it owns the stream);
    /// this must happen before the socket is closed.
    pub fn unsubscribe(&self, token: Token) {
        self.shared
            .channels
            .lock()
            .expect("watcher channel map poisoned")
            .remove(&token);
        trace!(token = token.0, "unsubscribed drive socket");
    }

    /// The poll registry, used by channels to deregister their streams.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Drop for SocketWatcher {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake watcher for shutdown");
        }
        if let Some(thread) = self
            .thread
            .lock()
            .expect("watcher thread handle poisoned")
            .take()
        {
            let _ = thread.join();
        }
    }
}

fn event_loop(mut poll: Poll, shared: Arc<WatcherShared>) {
    let mut events = Events::with_capacity(MAX_EVENTS);

    debug!("socket watcher event loop started");
    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(error = %e, "watcher poll failed, exiting");
            return;
        }

        if shared.shutdown.load(Ordering::SeqCst) {
            debug!("socket watcher shutting down");
            return;
        }

        for event in &events {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }

            // Copy the weak ref out so the map lock is not held while the
            // channel pumps its socket.
            let channel = shared
                .channels
                .lock()
                .expect("watcher channel map poisoned")
                .get(&token)
                .cloned();

            match channel.and_then(|weak| weak.upgrade()) {
                Some(channel) => {
                    channel.on_ready(
                        event.is_readable() || event.is_read_closed(),
                        event.is_writable(),
                    );
                }
                None => {
                    // Owner is gone; drop the stale entry.
                    shared
                        .channels
                        .lock()
                        .expect("watcher channel map poisoned")
                        .remove(&token);
                }
            }
        }
    }
}

/// Interest registered for every drive socket.
pub(crate) fn socket_interest() -> Interest {
    Interest::READABLE | Interest::WRITABLE
}
