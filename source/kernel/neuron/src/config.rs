// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel tunables with TOML loading on std builds
//! OWNERS: @kernel-team
//! PUBLIC API: KernelConfig (default/validate/from_toml_str/load), ConfigError
//! DEPENDS_ON: serde + toml (feature "std")
//! INVARIANTS: A validated config never has a zero limit; unknown keys are rejected
//!
//! Example:
//! ```toml
//! max_processes = 32
//! max_shares = 32
//! memory_pages = 512
//! tick_hz = 1000
//! event_queue_depth = 64
//! ```

use core::fmt;

/// Kernel limits and timer frequency.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(serde::Deserialize))]
#[cfg_attr(feature = "std", serde(default, deny_unknown_fields))]
pub struct KernelConfig {
    /// Maximum number of live processes.
    pub max_processes: usize,
    /// Maximum shares a single process may take part in.
    pub max_shares: usize,
    /// Physical page budget for shares.
    pub memory_pages: usize,
    /// Timer ticks per second.
    pub tick_hz: u32,
    /// Kernel events buffered per process before new ones are dropped.
    pub event_queue_depth: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_processes: 64,
            max_shares: 32,
            memory_pages: 1024,
            tick_hz: 1000,
            event_queue_depth: 64,
        }
    }
}

/// Errors raised while loading or validating a [`KernelConfig`].
#[derive(Debug)]
pub enum ConfigError {
    /// A limit is zero.
    Invalid(&'static str),
    /// The file could not be read.
    #[cfg(feature = "std")]
    Io {
        /// Location of the config file.
        path: std::path::PathBuf,
        /// Underlying operating system error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[cfg(feature = "std")]
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(field) => write!(f, "invalid kernel config: {field} must be non-zero"),
            #[cfg(feature = "std")]
            Self::Io { path, source } => write!(f, "failed to read {}: {source}", path.display()),
            #[cfg(feature = "std")]
            Self::Parse(err) => write!(f, "failed to parse kernel config: {err}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

impl KernelConfig {
    /// Checks that every limit is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.max_processes, "max_processes"),
            (self.max_shares, "max_shares"),
            (self.memory_pages, "memory_pages"),
            (self.tick_hz as usize, "tick_hz"),
            (self.event_queue_depth, "event_queue_depth"),
        ];
        match checks.iter().find(|(value, _)| *value == 0) {
            Some(&(_, field)) => Err(ConfigError::Invalid(field)),
            None => Ok(()),
        }
    }

    /// Parses and validates a TOML document; missing keys take their defaults.
    #[cfg(feature = "std")]
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file.
    #[cfg(feature = "std")]
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&raw)
    }
}
