//! Engine settings.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `USBCLONE_*` environment variables (for example
//! `USBCLONE_PARTITION_HASH_TIMEOUT_SECS=600`).
use crate::compression::Compression;
use crate::error::Result;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// The configuration file read when the caller does not name one.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/usbclone.toml";

/// Tunables shared by every operation of a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Budget for hashing a reconstructed image. `None` waits forever.
    #[serde(default)]
    pub image_hash_timeout_secs: Option<u64>,

    /// Budget for hashing a live partition or device. `None` waits forever.
    #[serde(default)]
    pub partition_hash_timeout_secs: Option<u64>,

    /// How long to wait for the kernel to show a freshly written table.
    #[serde(default = "default_layout_timeout_secs")]
    pub layout_timeout_secs: u64,

    /// How long to wait for partitions in "use existing" mode.
    #[serde(default = "default_existing_layout_timeout_secs")]
    pub existing_layout_timeout_secs: u64,

    #[serde(default = "default_partition_poll_interval_ms")]
    pub partition_poll_interval_ms: u64,

    /// Interval after which a silent tool still gets a spinner update.
    #[serde(default = "default_progress_refresh_ms")]
    pub progress_refresh_ms: u64,

    /// Compression applied to new backups. `None` stores raw streams.
    #[serde(default = "default_compression")]
    pub compression: Option<Compression>,

    /// Volume size for split backups, in MiB. Zero disables splitting.
    #[serde(default = "default_split_size_mb")]
    pub split_size_mb: u64,

    /// MiB zeroed at each end of the device by a quick erase.
    #[serde(default = "default_quick_wipe_mib")]
    pub quick_wipe_mib: u64,
}

fn default_layout_timeout_secs() -> u64 {
    10
}

fn default_existing_layout_timeout_secs() -> u64 {
    5
}

fn default_partition_poll_interval_ms() -> u64 {
    500
}

fn default_progress_refresh_ms() -> u64 {
    1000
}

fn default_compression() -> Option<Compression> {
    Some(Compression::Gzip)
}

fn default_split_size_mb() -> u64 {
    4096
}

fn default_quick_wipe_mib() -> u64 {
    32
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            image_hash_timeout_secs: None,
            partition_hash_timeout_secs: None,
            layout_timeout_secs: default_layout_timeout_secs(),
            existing_layout_timeout_secs: default_existing_layout_timeout_secs(),
            partition_poll_interval_ms: default_partition_poll_interval_ms(),
            progress_refresh_ms: default_progress_refresh_ms(),
            compression: default_compression(),
            split_size_mb: default_split_size_mb(),
            quick_wipe_mib: default_quick_wipe_mib(),
        }
    }
}

impl Settings {
    /// Loads settings from `path` (if it exists) and the environment.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] when the file or an environment
    /// variable holds a value of the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("USBCLONE_"))
            .extract()
            .map_err(Box::new)?;
        Ok(settings)
    }

    pub fn image_hash_timeout(&self) -> Option<Duration> {
        self.image_hash_timeout_secs.map(Duration::from_secs)
    }

    pub fn partition_hash_timeout(&self) -> Option<Duration> {
        self.partition_hash_timeout_secs.map(Duration::from_secs)
    }

    pub fn layout_timeout(&self) -> Duration {
        Duration::from_secs(self.layout_timeout_secs)
    }

    pub fn existing_layout_timeout(&self) -> Duration {
        Duration::from_secs(self.existing_layout_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.partition_poll_interval_ms.max(1))
    }

    pub fn progress_refresh(&self) -> Duration {
        Duration::from_millis(self.progress_refresh_ms.max(1))
    }

    /// Volume size in MiB, or `None` when splitting is disabled.
    pub fn split_size(&self) -> Option<u64> {
        (self.split_size_mb > 0).then_some(self.split_size_mb)
    }
}
