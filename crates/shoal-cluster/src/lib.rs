//! # shoal-cluster: Erasure-coded cluster facade
//!
//! Turns one logical key/value operation into a parallel fan-out across
//! `n_data + n_parity` drives: values are striped with Reed-Solomon
//! parity, reads impose a version quorum and reconstruct missing shards,
//! writes carry optimistic-concurrency version preconditions.

mod cluster;
mod codec;
mod error;

pub use cluster::{drive_indices, Cluster, ErasureCluster};
pub use codec::{ReedSolomonCodec, StripeCodec};
pub use error::{ClusterError, ClusterResult};
