//! # shoal-drive: Per-drive connection plumbing
//!
//! One [`SocketWatcher`] thread drives readiness for every drive
//! connection in the process. Each drive is wrapped in an
//! [`AutoConnection`] that hands out a multiplexed [`DriveChannel`] while
//! healthy and heals itself in the background while not.
//!
//! Uses mio's poll-based readiness directly - no async runtime.

mod auto;
mod channel;
mod error;
mod watcher;

pub use auto::{AutoConnection, ConnectionOptions};
pub use channel::{DriveChannel, HandlerKey, OpCallback, OpResult};
pub use error::{DriveError, DriveResult};
pub use watcher::SocketWatcher;
