//! Channel configuration.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default buffer capacity in text units.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Largest capacity the 32-bit size word can describe.
pub const MAX_CAPACITY: usize = u32::MAX as usize;

/// Configuration for a [`Channel`](crate::Channel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Chunk size: how many text units the shared buffer holds.
    pub capacity: usize,
    /// Driver spins before each `yield_now` while polling (0 = never yield).
    pub spin_before_yield: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            spin_before_yield: 0,
        }
    }
}

impl ChannelConfig {
    /// Set the buffer capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Let the polling driver yield its time slice every `spins` iterations.
    ///
    /// Yielding is not a blocking wait: the thread stays runnable.
    pub fn with_spin_before_yield(mut self, spins: u32) -> Self {
        self.spin_before_yield = spins;
        self
    }

    /// Check the configuration before a channel is built from it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.capacity > MAX_CAPACITY {
            return Err(ConfigError::CapacityTooLarge {
                capacity: self.capacity,
                max: MAX_CAPACITY,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ChannelConfig::default();
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.spin_before_yield, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = ChannelConfig::default().with_capacity(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroCapacity));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ChannelConfig = serde_json::from_str(r#"{"capacity": 16}"#).unwrap();
        assert_eq!(config.capacity, 16);
        assert_eq!(config.spin_before_yield, 0);
    }
}
