//! Pluggable stripe redundancy codec.
//!
//! A stripe is `n_data + n_parity` equally sized shard slots; `None`
//! marks a missing shard. Computing parity for a fresh stripe and
//! reconstructing lost shards of a damaged one are the same operation:
//! fill every `None` from the shards that are present.

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::{ClusterError, ClusterResult};

/// Fills missing shards of a stripe from the present ones.
pub trait StripeCodec: Send + Sync {
    /// Number of data shards per stripe.
    fn n_data(&self) -> usize;

    /// Number of parity shards per stripe.
    fn n_parity(&self) -> usize;

    /// Fills every `None` slot in `stripe`.
    ///
    /// Fails when fewer than `n_data` shards are present, when present
    /// shards have differing lengths, or when the stripe has the wrong
    /// slot count.
    fn compute(&self, stripe: &mut [Option<Vec<u8>>]) -> ClusterResult<()>;
}

/// Reed-Solomon codec over GF(2^8).
pub struct ReedSolomonCodec {
    rs: ReedSolomon,
    n_data: usize,
    n_parity: usize,
}

impl ReedSolomonCodec {
    pub fn new(n_data: usize, n_parity: usize) -> ClusterResult<Self> {
        let rs = ReedSolomon::new(n_data, n_parity).map_err(|e| {
            ClusterError::InvalidArgument(format!(
                "unsupported stripe geometry {n_data}+{n_parity}: {e}"
            ))
        })?;
        Ok(Self {
            rs,
            n_data,
            n_parity,
        })
    }
}

impl StripeCodec for ReedSolomonCodec {
    fn n_data(&self) -> usize {
        self.n_data
    }

    fn n_parity(&self) -> usize {
        self.n_parity
    }

    fn compute(&self, stripe: &mut [Option<Vec<u8>>]) -> ClusterResult<()> {
        if stripe.len() != self.n_data + self.n_parity {
            return Err(ClusterError::InvalidArgument(format!(
                "stripe has {} slots, geometry is {}+{}",
                stripe.len(),
                self.n_data,
                self.n_parity
            )));
        }

        let present = stripe.iter().filter(|s| s.is_some()).count();
        if present < self.n_data {
            return Err(ClusterError::Io(format!(
                "only {present} of {} shards present, need {}",
                stripe.len(),
                self.n_data
            )));
        }

        let mut lengths = stripe.iter().flatten().map(Vec::len);
        if let Some(first) = lengths.next() {
            if lengths.any(|len| len != first) {
                return Err(ClusterError::InvalidArgument(
                    "stripe shards have differing lengths".to_owned(),
                ));
            }
        }

        self.rs
            .reconstruct(stripe)
            .map_err(|e| ClusterError::Internal(format!("stripe reconstruction failed: {e}")))
    }
}
