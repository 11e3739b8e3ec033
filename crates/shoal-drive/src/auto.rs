//! Self-healing wrapper around one drive's TCP session.
//!
//! `channel()` never blocks: while unhealthy it schedules at most one
//! rate-limited background reconnect and fails the call, so cluster
//! fan-outs degrade immediately instead of stalling on a dead drive.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use shoal_wire::RequestPayload;
use tracing::{debug, info, warn};

use crate::channel::{DriveChannel, OpResult};
use crate::error::{DriveError, DriveResult};
use crate::watcher::SocketWatcher;

/// TCP connect timeout for a single endpoint attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the reconnect probe waits for its Noop round-trip.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Network identity and credentials of one drive endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    pub user_id: Option<String>,
    pub secret: Option<String>,
}

impl ConnectionOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user_id: None,
            secret: None,
        }
    }

    fn resolve(&self) -> DriveResult<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                DriveError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("{}:{} did not resolve", self.host, self.port),
                ))
            })
    }
}

struct ConnState {
    channel: Option<Arc<DriveChannel>>,
    healthy: bool,
    last_attempt: Option<Instant>,
    reconnect_running: bool,
}

struct ConnInner {
    options: (ConnectionOptions, ConnectionOptions),
    watcher: Arc<SocketWatcher>,
    ratelimit: Duration,
    state: Mutex<ConnState>,
}

/// Rate-limited, self-healing connection to one drive.
///
/// Invariants: healthy implies a live subscribed channel; at most one
/// reconnect is in flight at any time.
pub struct AutoConnection {
    inner: Arc<ConnInner>,
}

impl AutoConnection {
    /// Creates an unconnected instance; the first `channel()` call kicks
    /// off connection establishment.
    pub fn new(
        options: (ConnectionOptions, ConnectionOptions),
        watcher: Arc<SocketWatcher>,
        min_reconnect_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(ConnInner {
                options,
                watcher,
                ratelimit: min_reconnect_interval,
                state: Mutex::new(ConnState {
                    channel: None,
                    healthy: false,
                    last_attempt: None,
                    reconnect_running: false,
                }),
            }),
        })
    }

    /// Stable human-readable identity of this drive.
    pub fn name(&self) -> String {
        self.inner.name()
    }

    /// Returns the live channel, or fails fast while scheduling at most
    /// one rate-limited background reconnect.
    pub fn channel(&self) -> DriveResult<Arc<DriveChannel>> {
        let mut state = self.inner.state.lock().expect("connection state poisoned");

        if state.healthy {
            if let Some(channel) = &state.channel {
                if !channel.is_broken() {
                    return Ok(Arc::clone(channel));
                }
            }
            // The watcher observed a socket error since we last looked.
            ConnInner::teardown_locked(&mut state);
        }

        let rate_limited = state
            .last_attempt
            .is_some_and(|at| at.elapsed() < self.inner.ratelimit);
        if !state.reconnect_running && !rate_limited {
            state.reconnect_running = true;
            state.last_attempt = Some(Instant::now());
            let inner = Arc::clone(&self.inner);
            if let Err(e) = std::thread::Builder::new()
                .name("shoal-reconnect".to_owned())
                .spawn(move || inner.reconnect())
            {
                warn!(drive = %self.name(), error = %e, "failed to spawn reconnect");
                state.reconnect_running = false;
            }
        }

        Err(DriveError::NotConnected(self.inner.name()))
    }

    /// Marks the connection unhealthy and detaches the channel.
    ///
    /// Must be called whenever an I/O error is observed on the handle.
    pub fn set_error(&self) {
        self.inner.set_error();
    }
}

impl Drop for AutoConnection {
    fn drop(&mut self) {
        self.inner.set_error();
    }
}

impl ConnInner {
    fn name(&self) -> String {
        format!(
            "({}:{} and {}:{})",
            self.options.0.host, self.options.0.port, self.options.1.host, self.options.1.port
        )
    }

    fn set_error(&self) {
        let channel = {
            let mut state = self.state.lock().expect("connection state poisoned");
            Self::teardown_locked(&mut state)
        };
        // Fail pending requests outside the state lock.
        if let Some(channel) = channel {
            info!(drive = %self.name(), "connection marked unhealthy");
            channel.fail_connection();
        }
    }

    fn teardown_locked(state: &mut ConnState) -> Option<Arc<DriveChannel>> {
        state.healthy = false;
        state.channel.take()
    }

    /// Background reconnect: randomized primary with fallback, verified
    /// by a Noop round-trip before the healthy swap.
    fn reconnect(self: Arc<Self>) {
        // The randomized order spreads clients across the two endpoints
        // when one of them is degraded.
        let (first, second) = if rand::thread_rng().gen_bool(0.5) {
            (&self.options.0, &self.options.1)
        } else {
            (&self.options.1, &self.options.0)
        };

        let outcome = Self::establish(&self.watcher, first).or_else(|e| {
            debug!(drive = %self.name(), error = %e, "primary endpoint failed, trying secondary");
            Self::establish(&self.watcher, second)
        });

        let mut state = self.state.lock().expect("connection state poisoned");
        state.reconnect_running = false;
        state.last_attempt = Some(Instant::now());
        match outcome {
            Ok(channel) => {
                info!(drive = %self.name(), "reconnected");
                state.channel = Some(channel);
                state.healthy = true;
            }
            Err(e) => {
                warn!(drive = %self.name(), error = %e, "reconnect failed");
            }
        }
    }

    fn establish(
        watcher: &Arc<SocketWatcher>,
        options: &ConnectionOptions,
    ) -> DriveResult<Arc<DriveChannel>> {
        let addr = options.resolve()?;
        let channel = DriveChannel::connect(watcher, addr, CONNECT_TIMEOUT)?;

        // A Noop round-trip guards against half-open connects: the drive
        // must actually answer before the channel is declared healthy.
        let (tx, rx) = mpsc::channel::<OpResult>();
        channel.submit(
            RequestPayload::Noop,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;

        match rx.recv_timeout(PROBE_TIMEOUT) {
            Ok(result) if result.status.is_ok() => Ok(channel),
            Ok(result) => Err(DriveError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("probe rejected: {}", result.status),
            ))),
            Err(_) => {
                channel.fail_connection();
                Err(DriveError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "probe timed out",
                )))
            }
        }
    }
}
