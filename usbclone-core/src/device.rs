//! Typed drive and partition descriptions, plus the resolver seam.
//!
//! Engine code never inspects raw `lsblk` output. It receives [`Drive`]
//! values from a [`DeviceResolver`], which the front-end supplies (normally
//! [`crate::platform::LsblkResolver`]).
use crate::error::Result;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static PARTITION_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:p)?(\d+)$").expect("static regex"));

/// A whole block device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Drive {
    /// Kernel name, e.g. `sda` or `mmcblk0`.
    pub name: String,
    pub size_bytes: u64,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub removable: bool,
    pub mountpoint: Option<PathBuf>,
    /// Child partitions in kernel order.
    pub partitions: Vec<Partition>,
}

/// A partition of a [`Drive`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Partition {
    /// Kernel name, e.g. `sda1` or `mmcblk0p2`.
    pub name: String,
    pub size_bytes: u64,
    pub fstype: Option<String>,
    pub label: Option<String>,
    pub partlabel: Option<String>,
    pub mountpoint: Option<PathBuf>,
}

impl Drive {
    /// The `/dev` node of this drive.
    pub fn node(&self) -> PathBuf {
        device_node(&self.name)
    }

    /// Every mountpoint held by the drive or one of its partitions.
    pub fn mountpoints(&self) -> Vec<&Path> {
        self.mountpoint
            .iter()
            .chain(self.partitions.iter().filter_map(|p| p.mountpoint.as_ref()))
            .map(PathBuf::as_path)
            .collect()
    }

    pub fn partition(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    /// `sda 7.5GB` style label, trimming a redundant `.0`.
    pub fn label(&self) -> String {
        let size = human_size(self.size_bytes).replace(".0", "");
        format!("{} {}", self.name, size)
    }
}

impl fmt::Display for Drive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = [self.vendor.as_deref(), self.model.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let mount_info = match self.mountpoints().first() {
            Some(mp) => format!("[Mounted at {}]", mp.display()),
            None => "[Not mounted]".to_string(),
        };
        write!(
            f,
            "{:<15} {:>8} {:<24} {}",
            self.node().display(),
            human_size(self.size_bytes),
            description,
            mount_info
        )
    }
}

impl Partition {
    pub fn node(&self) -> PathBuf {
        device_node(&self.name)
    }

    /// The partition number taken from the trailing digits of the name.
    pub fn number(&self) -> Option<u32> {
        partition_number(&self.name)
    }

    /// A short name for progress titles: the label if set, else the kernel name.
    pub fn display_name(&self) -> &str {
        self.label
            .as_deref()
            .or(self.partlabel.as_deref())
            .filter(|l| !l.trim().is_empty())
            .unwrap_or(&self.name)
    }

    /// `"<size> <FS>"`, used as the progress subtitle.
    pub fn summary(&self) -> String {
        match self.fstype.as_deref() {
            Some(fs) => format!("{} {}", human_size(self.size_bytes), friendly_fstype(fs)),
            None => human_size(self.size_bytes),
        }
    }
}

/// Looks up drives and prepares them for writing.
///
/// The engine only ever calls through this trait, so tests substitute a
/// mock and front-ends may substitute their own discovery.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceResolver: Send + Sync {
    /// Looks up a whole drive by kernel name. `Ok(None)` if it is absent.
    fn device_by_name(&self, name: &str) -> Result<Option<Drive>>;

    /// Unmounts the drive and all of its partitions. Returns `false` if any
    /// mountpoint is still active afterwards.
    fn unmount(&self, drive: &Drive) -> bool;

    /// Maps a kernel name to its device node.
    fn resolve_node(&self, name: &str) -> PathBuf {
        device_node(name)
    }
}

/// `/dev/<name>`, leaving absolute paths untouched.
pub fn device_node(name: &str) -> PathBuf {
    if name.starts_with('/') {
        PathBuf::from(name)
    } else {
        Path::new("/dev").join(name)
    }
}

/// Extracts the partition number from names like `sda2` or `nvme0n1p3`.
pub fn partition_number(name: &str) -> Option<u32> {
    let name = name.rsplit('/').next().unwrap_or(name);
    PARTITION_NUMBER
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Builds the partition name for `number` on `disk`, inserting the `p`
/// separator when the disk name ends in a digit (`mmcblk0p1`, `nvme0n1p1`).
pub fn partition_name(disk: &str, number: u32) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{disk}p{number}")
    } else {
        format!("{disk}{number}")
    }
}

/// 1024-based size with one decimal place, e.g. `7.5GB`.
pub fn human_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            return format!("{size:.1}{unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1}PB")
}

/// Upper-case filesystem label for display (`vfat` shows as `FAT32`).
pub fn friendly_fstype(fstype: &str) -> String {
    match fstype.to_ascii_lowercase().as_str() {
        "vfat" | "fat32" => "FAT32".to_string(),
        "fat16" => "FAT16".to_string(),
        "ntfs" | "ntfs3" => "NTFS".to_string(),
        other => other.to_ascii_uppercase(),
    }
}
