// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Warehouse configuration
//!
//! Settings live under a top-level `warehouse` section of a YAML file:
//!
//! ```yaml
//! warehouse:
//!   min_backend_version: v2.0.0
//!   blob_prefix: archive
//!   transfer:
//!     chunk_size: 8388608
//!     multipart_threshold: 16777216
//!     concurrency: 4
//!     max_attempts: 3
//!   retry:
//!     max_attempts: 5
//!     min_delay_ms: 50
//!     max_delay_ms: 2000
//!   registry:
//!     page_size: 100
//!     upsert_attempts: 8
//! ```
//!
//! Every field is optional; missing ones take the defaults shown above.

use crate::error::{Result, WarehouseError};
use diagnostics::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Oldest index backend this crate can operate against
pub const MIN_BACKEND_VERSION: &str = "v2.0.0";

/// Environment variable naming the settings file read by [`WarehouseConfig::load`]
pub const CONFIG_ENV_VAR: &str = "WAREHOUSE_CONFIG_FILE";

pub const DEFAULT_CONFIG_FILE: &str = "settings.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WarehouseConfig {
    pub min_backend_version: String,
    /// Prepended to blob paths: `{prefix}/blobs/{fp[0..2]}/{fp}`
    pub blob_prefix: Option<String>,
    pub transfer: TransferConfig,
    pub retry: RetryConfig,
    pub registry: RegistryConfig,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            min_backend_version: MIN_BACKEND_VERSION.to_string(),
            blob_prefix: None,
            transfer: TransferConfig::default(),
            retry: RetryConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

/// Chunked transfer of large payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    /// Size of every part except the last. S3-compatible stores need at least 5 MiB.
    pub chunk_size: usize,
    /// Payloads larger than this use multi-part upload and ranged download
    pub multipart_threshold: usize,
    /// Parts in flight at once
    pub concurrency: usize,
    /// Attempts per part or range before the transfer fails
    pub max_attempts: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8 * 1024 * 1024,
            multipart_threshold: 16 * 1024 * 1024,
            concurrency: 4,
            max_attempts: 3,
        }
    }
}

/// Backoff for transient backend failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay_ms: 50,
            max_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Entries fetched per backend scan while paging a prefix query
    pub page_size: usize,
    /// Compare-and-swap rounds before an upsert gives up on a contended key
    pub upsert_attempts: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            upsert_attempts: 8,
        }
    }
}

#[derive(Deserialize)]
struct SettingsFile {
    #[serde(default)]
    warehouse: WarehouseConfig,
}

impl WarehouseConfig {
    /// Parse the `warehouse` section of a YAML settings document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let settings: SettingsFile = serde_yaml_ng::from_str(yaml)?;
        settings.warehouse.validate()?;
        Ok(settings.warehouse)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            WarehouseError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Load from `$WAREHOUSE_CONFIG_FILE`, or `settings.yaml` in the working directory
    ///
    /// An explicitly named file must exist. A missing default file yields defaults.
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::from_file(PathBuf::from(path)),
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)
                } else {
                    log_debug!("no {file} found, using default configuration", file: DEFAULT_CONFIG_FILE);
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let _ = self.min_version()?;
        let positive = [
            ("transfer.chunk_size", self.transfer.chunk_size),
            ("transfer.multipart_threshold", self.transfer.multipart_threshold),
            ("transfer.concurrency", self.transfer.concurrency),
            ("transfer.max_attempts", self.transfer.max_attempts),
            ("retry.max_attempts", self.retry.max_attempts),
            ("registry.page_size", self.registry.page_size),
            ("registry.upsert_attempts", self.registry.upsert_attempts),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(WarehouseError::Config(format!("{name} must be positive")));
        }
        if self.retry.min_delay_ms > self.retry.max_delay_ms {
            return Err(WarehouseError::Config(
                "retry.min_delay_ms exceeds retry.max_delay_ms".into(),
            ));
        }
        if let Some(prefix) = &self.blob_prefix {
            if prefix.is_empty() || prefix.starts_with('/') || prefix.ends_with('/') {
                return Err(WarehouseError::Config(format!(
                    "blob_prefix '{prefix}' must be a relative path without surrounding slashes"
                )));
            }
        }
        Ok(())
    }

    pub fn min_version(&self) -> Result<BackendVersion> {
        self.min_backend_version
            .parse()
            .map_err(WarehouseError::Config)
    }
}

/// Loosely parsed dotted version (`v2.0.0`, `2.1`, `3.0.1-rc1`)
///
/// Comparison is numeric per component; trailing zero components are ignored,
/// so `2.0` equals `v2.0.0`. A pre-release sorts below its release and build
/// metadata after `+` is ignored.
#[derive(Debug, Clone, Eq)]
pub struct BackendVersion {
    text: String,
    components: Vec<u64>,
    /// `rc1` in `3.0.1-rc1`; sorts below the release it precedes
    pre_release: Option<String>,
}

impl BackendVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            text: format!("v{major}.{minor}.{patch}"),
            components: vec![major, minor, patch],
            pre_release: None,
        }
    }

    fn significant(&self) -> &[u64] {
        let len = self
            .components
            .iter()
            .rposition(|c| *c != 0)
            .map_or(0, |i| i + 1);
        &self.components[..len]
    }
}

impl FromStr for BackendVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let text = s.trim();
        let body = text.strip_prefix(['v', 'V']).unwrap_or(text);
        let invalid = || format!("'{s}' is not a dotted version number");
        // build metadata never affects ordering
        let body = body.split_once('+').map_or(body, |(version, _)| version);
        let (numbers, pre_release) = match body.split_once('-') {
            Some((numbers, pre)) if !pre.is_empty() => (numbers, Some(pre.to_string())),
            Some(_) => return Err(invalid()),
            None => (body, None),
        };
        let components = numbers
            .split('.')
            .map(|part| {
                if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                    return Err(invalid());
                }
                part.parse::<u64>().map_err(|_| invalid())
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            text: text.to_string(),
            components,
            pre_release,
        })
    }
}

impl PartialEq for BackendVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for BackendVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.significant()
            .cmp(other.significant())
            .then_with(|| match (&self.pre_release, &other.pre_release) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for BackendVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BackendVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
