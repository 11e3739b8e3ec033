//! # shoal: File I/O over a fleet of erasure-coded network drives
//!
//! The public library surface: JSON configuration from the environment,
//! a process-wide [`Library`] container owning the cluster map and the
//! shared data cache, and [`FileIo`] objects addressed as
//! `kinetic://{clusterID}/{name}`.
//!
//! ```no_run
//! use shoal::Library;
//!
//! let library = Library::instance().expect("configuration loads");
//! let file = library.make_file_io("kinetic://cluster-a/report.log").unwrap();
//! file.write(0, b"hello drives").unwrap();
//! file.flush().unwrap();
//! ```

mod cluster_map;
mod config;
mod error;
mod file_io;
mod library;

pub use cluster_map::ClusterMap;
pub use config::{ClusterInfo, Config, LibrarySettings};
pub use error::{ShoalError, ShoalResult};
pub use file_io::FileIo;
pub use library::Library;

#[cfg(test)]
mod tests;
