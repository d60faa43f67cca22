//! DHT configuration

use crate::{DhtError, Result};
use kadroute_core::DEFAULT_ID_LENGTH;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Node identifier length in bytes
    pub id_length: usize,
    /// K parameter (nodes per bucket)
    pub bucket_size: usize,
    /// Replacement candidates kept per full bucket
    pub replacement_cache_size: usize,
    /// Consecutive liveness failures before a node is evicted
    pub eviction_threshold: u32,
    /// Ask queried peers to ping us back before trusting our report
    pub pingback: bool,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Buckets older than this are refreshed
    pub refresh_interval_secs: u64,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            id_length: DEFAULT_ID_LENGTH,
            bucket_size: 20,
            replacement_cache_size: 5,
            eviction_threshold: 3,
            pingback: true,
            request_timeout_secs: 10,
            refresh_interval_secs: 3600,
        }
    }
}

impl DhtConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id_length == 0 {
            return Err(DhtError::Config("id_length must be positive".to_string()));
        }
        if self.bucket_size == 0 {
            return Err(DhtError::Config("bucket_size must be positive".to_string()));
        }
        if self.eviction_threshold == 0 {
            return Err(DhtError::Config(
                "eviction_threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Identifier length in bits
    pub fn id_bits(&self) -> usize {
        self.id_length * 8
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}
