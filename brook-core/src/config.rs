//! Runtime configuration for the streaming graph.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, Result};

/// Floor applied wherever a logarithm is taken.
///
/// Matches the single-precision machine epsilon of the decoding engine.
pub const EPSILON: f32 = 1.192_092_9e-7;

/// Maximum resend attempts for a single wire-protocol frame.
pub const SOCKET_RETRY: usize = 10;

/// Shared runtime knobs, passed explicitly at graph construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Seconds a blocked read may wait before the stage aborts.
    pub timeout_secs: u64,

    /// Cooperative-yield granularity in seconds.
    pub timescale_secs: f64,

    /// Maximum number of bytes drained from a socket after a bad frame.
    pub max_socket_buffer_size: usize,

    /// Bounded capacity of every queue in the graph.
    pub capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 1800,
            timescale_secs: 0.01,
            max_socket_buffer_size: 10_000,
            capacity: 4096,
        }
    }
}

impl RuntimeConfig {
    /// Validate every knob, returning the config unchanged on success.
    pub fn validated(self) -> Result<Self> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout {
                value: self.timeout_secs,
            }
            .into());
        }
        if !(self.timescale_secs > 0.0 && self.timescale_secs < 1.0) {
            return Err(ConfigError::InvalidTimescale {
                value: self.timescale_secs,
            }
            .into());
        }
        if self.max_socket_buffer_size <= 4 {
            return Err(ConfigError::InvalidSocketBuffer {
                value: self.max_socket_buffer_size,
            }
            .into());
        }
        if self.capacity == 0 {
            return Err(ConfigError::InvalidCapacity.into());
        }
        Ok(self)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn timescale(&self) -> Duration {
        Duration::from_secs_f64(self.timescale_secs)
    }
}

/// Stream metadata attached to a queue by an audio source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Sampling rate in Hz.
    pub rate: u32,
    /// Channel count.
    pub channels: u16,
    /// Sample width in bytes.
    pub width: u16,
    /// Total duration in seconds, if known up front.
    pub duration: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = RuntimeConfig::default().validated().unwrap();
        assert_eq!(cfg.timeout_secs, 1800);
        assert!((cfg.timescale_secs - 0.01).abs() < 1e-12);
        assert_eq!(cfg.max_socket_buffer_size, 10_000);
    }

    #[test]
    fn test_bad_timescale_rejected() {
        let cfg = RuntimeConfig {
            timescale_secs: 1.5,
            ..Default::default()
        };
        assert!(cfg.validated().is_err());
    }

    #[test]
    fn test_small_socket_buffer_rejected() {
        let cfg = RuntimeConfig {
            max_socket_buffer_size: 4,
            ..Default::default()
        };
        assert!(cfg.validated().is_err());
    }
}
