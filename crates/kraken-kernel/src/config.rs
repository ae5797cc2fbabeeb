//! [`KernelConfig`] – table capacities and bounded waits.
//!
//! Every field has a default matching the stock firmware, so an empty
//! `[kernel]` table (or none at all) yields a working kernel.

use std::time::Duration;

use kraken_middleware::BusConfig;
use kraken_types::KernelError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Capacity of the service table.
    pub max_services: usize,
    /// Longest accepted service name, in bytes.
    pub name_max_len: usize,
    /// Bounded wait on the registry lock for lifecycle operations and
    /// caller permission checks.
    pub registry_lock_timeout_ms: u64,
    /// Bounded wait on the registry lock for `has_permission`.
    pub permission_lock_timeout_ms: u64,
    pub bus: BusConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_services: 16,
            name_max_len: 31,
            registry_lock_timeout_ms: 1000,
            permission_lock_timeout_ms: 100,
            bus: BusConfig::default(),
        }
    }
}

impl KernelConfig {
    pub fn registry_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.registry_lock_timeout_ms)
    }

    pub fn permission_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.permission_lock_timeout_ms)
    }

    pub(crate) fn validate_registry(&self) -> Result<(), KernelError> {
        if self.max_services == 0 {
            return Err(KernelError::InvalidArgument(
                "max_services must be at least 1".into(),
            ));
        }
        if self.name_max_len == 0 {
            return Err(KernelError::InvalidArgument(
                "name_max_len must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
