//! Runtime tunables.
//!
//! The data-plane core takes no environment variables; everything it reads
//! at runtime comes from one [`Params`] struct, loaded from a TOML file by
//! the management side and handed to [`Runtime::new`] unchanged.
//!
//! Every field has a serde default so an empty file is a valid
//! configuration, and unknown fields are rejected to catch typos early.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors from loading or validating a parameter file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Parameter file not found or unreadable.
    #[error("cannot read parameter file: {source}")]
    Io {
        /// Underlying IO error.
        #[from]
        source: std::io::Error,
    },

    /// TOML parsing failed (includes unknown fields).
    #[error("failed to parse parameters: {0}")]
    Parse(String),

    /// Semantic validation failed.
    #[error("invalid parameter: {0}")]
    Validation(String),
}

/// Which event facility the waiter uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaiterKind {
    /// Linux epoll, one-shot disarm per event.
    Epoll,
    /// Portable poll(2) fallback, pollfd set rebuilt per loop.
    Poll,
}

impl Default for WaiterKind {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        WaiterKind::Epoll
    }

    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        WaiterKind::Poll
    }
}

/// Runtime tunables consumed by the data-plane core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Params {
    /// Total bytes of the ring-log chunk.
    pub vsl_space: usize,

    /// Maximum payload bytes per log record. Longer payloads are silently
    /// truncated (with a counter).
    pub vsl_reclen: usize,

    /// Per-worker log flush buffer size in bytes.
    pub vsl_buffer: usize,

    /// Record tags suppressed from the ring, by name.
    pub vsl_mask: Vec<String>,

    /// Cumulative write timeout towards a backend, seconds.
    pub send_timeout: f64,

    /// Backend connect timeout, seconds.
    pub connect_timeout: f64,

    /// Timeout for the first response byte, seconds.
    pub first_byte_timeout: f64,

    /// Timeout between response bytes, seconds.
    pub between_bytes_timeout: f64,

    /// Keepalive deadline for idle pooled connections, seconds.
    pub backend_idle_timeout: f64,

    /// Expiry thread idle interval, seconds.
    pub expiry_sleep: f64,

    /// Grace applied when neither object nor session set one, seconds.
    pub default_grace: f64,

    /// Cooling interval for deleted backends and freed arena ranges.
    pub cool_duration: f64,

    /// Event facility for the waiter.
    pub waiter_type: WaiterKind,

    /// Per-pool connection ceiling; 0 means unlimited.
    pub max_pool_conns: u32,

    /// Default health probe period, seconds.
    pub probe_interval: f64,

    /// Probe result window size (results remembered per backend).
    pub probe_window: u32,

    /// Good results within the window required for healthy.
    pub probe_threshold: u32,

    /// Default shard director rampup duration, seconds.
    pub shard_rampup: f64,

    /// Per-request scratch workspace size in bytes.
    pub workspace_session: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            vsl_space: 1024 * 1024,
            vsl_reclen: 255,
            vsl_buffer: 4096,
            vsl_mask: Vec::new(),
            send_timeout: 600.0,
            connect_timeout: 3.5,
            first_byte_timeout: 60.0,
            between_bytes_timeout: 60.0,
            backend_idle_timeout: 60.0,
            expiry_sleep: 1.0,
            default_grace: 10.0,
            cool_duration: crate::consts::DEFAULT_COOL_DURATION,
            waiter_type: WaiterKind::default(),
            max_pool_conns: 0,
            probe_interval: 5.0,
            probe_window: 8,
            probe_threshold: 3,
            shard_rampup: 0.0,
            workspace_session: 64 * 1024,
        }
    }
}

impl Params {
    /// Load parameters from a TOML file and validate them.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let params: Params =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    /// Validate semantic constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        use crate::consts::{VSL_LEN_MASK, VSL_SEGMENTS};

        // The ring needs room for the head plus at least a handful of
        // records per segment.
        let min_space = (VSL_SEGMENTS as usize) * 64 * 4;
        if self.vsl_space < min_space {
            return Err(ConfigError::Validation(format!(
                "vsl_space {} below minimum {}",
                self.vsl_space, min_space
            )));
        }
        if self.vsl_reclen == 0 || self.vsl_reclen > VSL_LEN_MASK as usize {
            return Err(ConfigError::Validation(format!(
                "vsl_reclen {} outside 1..={}",
                self.vsl_reclen, VSL_LEN_MASK
            )));
        }
        if self.vsl_buffer < self.vsl_reclen + 16 {
            return Err(ConfigError::Validation(format!(
                "vsl_buffer {} cannot hold one record of vsl_reclen {}",
                self.vsl_buffer, self.vsl_reclen
            )));
        }
        for t in [
            self.send_timeout,
            self.connect_timeout,
            self.first_byte_timeout,
            self.between_bytes_timeout,
            self.backend_idle_timeout,
            self.expiry_sleep,
            self.default_grace,
            self.cool_duration,
            self.probe_interval,
            self.shard_rampup,
        ] {
            if !t.is_finite() || t < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "timeouts must be finite and non-negative, got {t}"
                )));
            }
        }
        if self.probe_window == 0 || self.probe_window > 64 {
            return Err(ConfigError::Validation(format!(
                "probe_window {} outside 1..=64",
                self.probe_window
            )));
        }
        if self.probe_threshold > self.probe_window {
            return Err(ConfigError::Validation(format!(
                "probe_threshold {} exceeds probe_window {}",
                self.probe_threshold, self.probe_window
            )));
        }
        if self.workspace_session < 4096 {
            return Err(ConfigError::Validation(format!(
                "workspace_session {} below 4096",
                self.workspace_session
            )));
        }
        Ok(())
    }
}
