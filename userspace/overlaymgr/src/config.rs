// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Overlay manager configuration loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::idmap::DEFAULT_RESOURCE_CACHE_DIR;

/// Errors raised while loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File being read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid configuration TOML.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// File being parsed.
        path: PathBuf,
        /// Underlying TOML failure.
        #[source]
        source: toml::de::Error,
    },
}

/// Where idmaps live and where the overlay table is kept.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OverlayConfig {
    /// Directory holding one idmap per overlay.
    pub resource_cache_dir: PathBuf,
    /// Persisted overlay table; `None` keeps the table in memory only.
    pub state_file: Option<PathBuf>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            resource_cache_dir: PathBuf::from(DEFAULT_RESOURCE_CACHE_DIR),
            state_file: None,
        }
    }
}

impl OverlayConfig {
    /// Reads and parses the TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        toml::from_str(&data).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Parses an in-memory document.
    pub fn from_toml_str(data: &str) -> Result<Self, ConfigError> {
        toml::from_str(data)
            .map_err(|source| ConfigError::Parse { path: PathBuf::from("<inline>"), source })
    }
}
