//! JSON configuration, read from three environment variables.
//!
//! Each variable holds either a JSON document directly or the path to a
//! file containing one:
//!
//! - `SHOAL_DRIVE_LOCATION`: endpoints per drive, keyed by wwn
//! - `SHOAL_DRIVE_SECURITY`: credentials per drive, merged in by wwn
//! - `SHOAL_CLUSTER_DEFINITION`: library settings and cluster layouts

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use shoal_drive::ConnectionOptions;
use tracing::warn;

use crate::error::{ShoalError, ShoalResult};

/// Environment variable for the drive location document.
pub const ENV_DRIVE_LOCATION: &str = "SHOAL_DRIVE_LOCATION";
/// Environment variable for the drive security document.
pub const ENV_DRIVE_SECURITY: &str = "SHOAL_DRIVE_SECURITY";
/// Environment variable for the cluster definition document.
pub const ENV_CLUSTER_DEFINITION: &str = "SHOAL_CLUSTER_DEFINITION";

// ============================================================================
// JSON models
// ============================================================================

#[derive(Debug, Deserialize)]
struct DriveLocationJson {
    wwn: String,
    inet4: Vec<Inet4Json>,
}

#[derive(Debug, Deserialize)]
struct Inet4Json {
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct DriveSecurityJson {
    wwn: String,
    #[serde(rename = "userId")]
    user_id: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct ClusterDefinitionJson {
    configuration: SettingsJson,
    clusters: Vec<ClusterJson>,
}

#[derive(Debug, Deserialize)]
struct SettingsJson {
    #[serde(rename = "cacheCapacity")]
    cache_capacity: u64,
    #[serde(rename = "cacheTargetSize", default)]
    cache_target_size: Option<u64>,
    #[serde(rename = "readaheadWindow")]
    readahead_window: usize,
    #[serde(rename = "maxBackgroundIoThreads")]
    max_background_io_threads: usize,
    #[serde(rename = "maxBackgroundIoQueue")]
    max_background_io_queue: usize,
}

#[derive(Debug, Deserialize)]
struct ClusterJson {
    #[serde(rename = "clusterID")]
    cluster_id: String,
    #[serde(rename = "numData")]
    num_data: usize,
    #[serde(rename = "numParity")]
    num_parity: usize,
    #[serde(rename = "chunkSizeKB", default)]
    #[allow(dead_code)]
    chunk_size_kb: u64,
    #[serde(rename = "minReconnectInterval")]
    min_reconnect_interval: u64,
    #[serde(rename = "timeout")]
    timeout: u64,
    drives: Vec<DriveRefJson>,
}

#[derive(Debug, Deserialize)]
struct DriveRefJson {
    wwn: String,
}

// ============================================================================
// Resolved configuration
// ============================================================================

/// Library-wide cache and pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibrarySettings {
    pub cache_target_size: u64,
    pub cache_capacity: u64,
    pub readahead_window: usize,
    pub background_io_threads: usize,
    pub background_io_queue_depth: usize,
}

/// One cluster's layout and timing parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub num_data: usize,
    pub num_parity: usize,
    pub min_reconnect_interval: Duration,
    pub operation_timeout: Duration,
    /// wwns of the member drives, in stripe placement order.
    pub drives: Vec<String>,
}

/// Fully resolved configuration: settings, clusters and drive endpoints
/// with credentials merged in.
#[derive(Debug, Clone)]
pub struct Config {
    pub settings: LibrarySettings,
    pub clusters: HashMap<String, ClusterInfo>,
    pub drives: HashMap<String, (ConnectionOptions, ConnectionOptions)>,
}

impl Config {
    /// Loads the configuration from the three environment variables.
    pub fn from_env() -> ShoalResult<Self> {
        let locations = env_document(ENV_DRIVE_LOCATION)?;
        let security = env_document(ENV_DRIVE_SECURITY)?;
        let definition = env_document(ENV_CLUSTER_DEFINITION)?;
        Self::from_json(&locations, &security, &definition)
    }

    /// Parses and cross-links the three JSON documents.
    pub fn from_json(locations: &str, security: &str, definition: &str) -> ShoalResult<Self> {
        let locations: Vec<DriveLocationJson> = serde_json::from_str(locations)
            .map_err(|e| ShoalError::Config(format!("drive location document: {e}")))?;
        let security: Vec<DriveSecurityJson> = serde_json::from_str(security)
            .map_err(|e| ShoalError::Config(format!("drive security document: {e}")))?;
        let definition: ClusterDefinitionJson = serde_json::from_str(definition)
            .map_err(|e| ShoalError::Config(format!("cluster definition document: {e}")))?;

        let credentials: HashMap<String, DriveSecurityJson> = security
            .into_iter()
            .map(|s| (s.wwn.clone(), s))
            .collect();

        let mut drives = HashMap::new();
        for location in locations {
            if location.inet4.is_empty() {
                return Err(ShoalError::Config(format!(
                    "drive {} has no endpoints",
                    location.wwn
                )));
            }
            // A drive with a single interface is dialed on it for both
            // the primary and the fallback slot.
            let primary = &location.inet4[0];
            let secondary = location.inet4.get(1).unwrap_or(primary);
            let mut first = ConnectionOptions::new(primary.host.clone(), primary.port);
            let mut second = ConnectionOptions::new(secondary.host.clone(), secondary.port);
            if let Some(creds) = credentials.get(&location.wwn) {
                first.user_id = Some(creds.user_id.clone());
                first.secret = Some(creds.key.clone());
                second.user_id = Some(creds.user_id.clone());
                second.secret = Some(creds.key.clone());
            } else {
                warn!(wwn = %location.wwn, "no security entry for drive");
            }
            drives.insert(location.wwn, (first, second));
        }

        let settings = LibrarySettings {
            cache_target_size: definition
                .configuration
                .cache_target_size
                .unwrap_or(definition.configuration.cache_capacity * 7 / 10),
            cache_capacity: definition.configuration.cache_capacity,
            readahead_window: definition.configuration.readahead_window,
            background_io_threads: definition.configuration.max_background_io_threads,
            background_io_queue_depth: definition.configuration.max_background_io_queue,
        };

        let mut clusters = HashMap::new();
        for cluster in definition.clusters {
            for drive in &cluster.drives {
                if !drives.contains_key(&drive.wwn) {
                    return Err(ShoalError::Config(format!(
                        "cluster {} references unknown drive {}",
                        cluster.cluster_id, drive.wwn
                    )));
                }
            }
            clusters.insert(
                cluster.cluster_id,
                ClusterInfo {
                    num_data: cluster.num_data,
                    num_parity: cluster.num_parity,
                    min_reconnect_interval: Duration::from_secs(cluster.min_reconnect_interval),
                    operation_timeout: Duration::from_secs(cluster.timeout),
                    drives: cluster.drives.into_iter().map(|d| d.wwn).collect(),
                },
            );
        }

        Ok(Self {
            settings,
            clusters,
            drives,
        })
    }
}

/// Reads an environment variable holding a JSON document or the path to
/// one.
fn env_document(variable: &str) -> ShoalResult<String> {
    let value = std::env::var(variable)
        .map_err(|_| ShoalError::Config(format!("environment variable {variable} not set")))?;

    let trimmed = value.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(value);
    }
    std::fs::read_to_string(&value).map_err(|e| {
        ShoalError::Config(format!("{variable} points at unreadable file {value}: {e}"))
    })
}
