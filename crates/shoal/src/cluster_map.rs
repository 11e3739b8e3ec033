//! Access to cluster instances built from the loaded configuration.
//!
//! Cluster objects are built lazily on first use and cached; codec
//! instances are shared between clusters of the same stripe geometry.
//! One socket watcher serves every connection in the process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use shoal_cluster::{Cluster, ErasureCluster, ReedSolomonCodec, StripeCodec};
use shoal_drive::{ConnectionOptions, SocketWatcher};
use tracing::info;

use crate::config::ClusterInfo;
use crate::error::{ShoalError, ShoalResult};

struct MapInner {
    cluster_info: HashMap<String, ClusterInfo>,
    drive_info: HashMap<String, (ConnectionOptions, ConnectionOptions)>,
    clusters: HashMap<String, Arc<ErasureCluster>>,
    codecs: HashMap<(usize, usize), Arc<ReedSolomonCodec>>,
}

/// Thread-safe map from cluster id to a live cluster instance.
pub struct ClusterMap {
    watcher: Arc<SocketWatcher>,
    inner: Mutex<MapInner>,
}

impl ClusterMap {
    pub fn new() -> ShoalResult<Self> {
        Ok(Self {
            watcher: SocketWatcher::new()?,
            inner: Mutex::new(MapInner {
                cluster_info: HashMap::new(),
                drive_info: HashMap::new(),
                clusters: HashMap::new(),
                codecs: HashMap::new(),
            }),
        })
    }

    /// Replaces the configuration. Live cluster instances are dropped;
    /// they are rebuilt on demand from the new definitions.
    pub fn reset(
        &self,
        cluster_info: HashMap<String, ClusterInfo>,
        drive_info: HashMap<String, (ConnectionOptions, ConnectionOptions)>,
    ) {
        let mut inner = self.inner.lock().expect("cluster map poisoned");
        inner.cluster_info = cluster_info;
        inner.drive_info = drive_info;
        inner.clusters.clear();
        info!("cluster map reconfigured");
    }

    /// Returns the cluster for `id`, building it on first use.
    pub fn cluster(&self, id: &str) -> ShoalResult<Arc<dyn Cluster>> {
        let mut inner = self.inner.lock().expect("cluster map poisoned");
        if let Some(cluster) = inner.clusters.get(id) {
            return Ok(Arc::clone(cluster) as Arc<dyn Cluster>);
        }

        let info = inner
            .cluster_info
            .get(id)
            .ok_or_else(|| ShoalError::UnknownCluster(id.to_owned()))?
            .clone();

        let endpoints = info
            .drives
            .iter()
            .map(|wwn| {
                inner.drive_info.get(wwn).cloned().ok_or_else(|| {
                    ShoalError::Config(format!("cluster {id} references unknown drive {wwn}"))
                })
            })
            .collect::<ShoalResult<Vec<_>>>()?;

        let geometry = (info.num_data, info.num_parity);
        let codec: Arc<dyn StripeCodec> = match inner.codecs.get(&geometry) {
            Some(codec) => Arc::clone(codec) as Arc<dyn StripeCodec>,
            None => {
                let codec = Arc::new(
                    ReedSolomonCodec::new(info.num_data, info.num_parity)
                        .map_err(|e| ShoalError::Config(e.to_string()))?,
                );
                inner.codecs.insert(geometry, Arc::clone(&codec));
                codec
            }
        };

        let cluster = Arc::new(ErasureCluster::new(
            id,
            endpoints,
            info.num_data,
            info.num_parity,
            info.min_reconnect_interval,
            info.operation_timeout,
            codec,
            Arc::clone(&self.watcher),
        )?);
        inner.clusters.insert(id.to_owned(), Arc::clone(&cluster));
        info!(cluster = id, "cluster instance created");
        Ok(cluster)
    }
}
