//! Partition-table files stored alongside a disk image.
//!
//! An image directory can hold the same layout in several dialects
//! (`sda-pt.sf`, `sda-pt.parted`, `sda-pt.sgdisk`, `sda-mbr`, ...). Each
//! file becomes a [`DiskLayoutOp`], and [`select_layout_ops`] ranks them so
//! the most faithful dialect is tried first.
pub mod binary;
pub mod parted;
pub mod scale;
pub mod sfdisk;
pub mod size;

use crate::error::Result;
use parted::PartedLayout;
use sfdisk::SfdiskDump;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Bytes inspected when deciding whether a layout file is binary.
const BINARY_PROBE_LEN: usize = 1024;

/// The dialect of a layout file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LayoutKind {
    /// The `disk` file. Clonezilla stores the source device name in it.
    Disk,
    /// A bare `sfdisk` file.
    Sfdisk,
    PtSf,
    PtSgdisk,
    PtParted,
    PtPartedCompact,
    ChsSf,
    Mbr,
    HiddenDataAfterMbr,
    Gpt,
}

/// Layout dialects from most to least preferred.
pub const LAYOUT_PRIORITY: [LayoutKind; 10] = [
    LayoutKind::PtSgdisk,
    LayoutKind::Gpt,
    LayoutKind::PtParted,
    LayoutKind::PtPartedCompact,
    LayoutKind::PtSf,
    LayoutKind::ChsSf,
    LayoutKind::Mbr,
    LayoutKind::HiddenDataAfterMbr,
    LayoutKind::Sfdisk,
    LayoutKind::Disk,
];

/// Suffixes of per-device layout files, longest first so that
/// `-hidden-data-after-mbr` is never read as `-mbr`.
const SUFFIXES: [(&str, LayoutKind); 8] = [
    ("-hidden-data-after-mbr", LayoutKind::HiddenDataAfterMbr),
    ("-pt.parted.compact", LayoutKind::PtPartedCompact),
    ("-pt.sgdisk", LayoutKind::PtSgdisk),
    ("-pt.parted", LayoutKind::PtParted),
    ("-chs.sf", LayoutKind::ChsSf),
    ("-pt.sf", LayoutKind::PtSf),
    ("-mbr", LayoutKind::Mbr),
    ("-gpt", LayoutKind::Gpt),
];

impl LayoutKind {
    pub fn name(self) -> &'static str {
        match self {
            LayoutKind::Disk => "disk",
            LayoutKind::Sfdisk => "sfdisk",
            LayoutKind::PtSf => "pt.sf",
            LayoutKind::PtSgdisk => "pt.sgdisk",
            LayoutKind::PtParted => "pt.parted",
            LayoutKind::PtPartedCompact => "pt.parted.compact",
            LayoutKind::ChsSf => "chs.sf",
            LayoutKind::Mbr => "mbr",
            LayoutKind::HiddenDataAfterMbr => "hidden-data-after-mbr",
            LayoutKind::Gpt => "gpt",
        }
    }

    /// Rank in [`LAYOUT_PRIORITY`]; lower is preferred.
    pub fn priority(self) -> usize {
        LAYOUT_PRIORITY
            .iter()
            .position(|&k| k == self)
            .unwrap_or(LAYOUT_PRIORITY.len())
    }

    /// Whether the file is raw sectors rather than a script.
    pub fn is_raw(self) -> bool {
        matches!(
            self,
            LayoutKind::PtSgdisk | LayoutKind::Gpt | LayoutKind::Mbr | LayoutKind::HiddenDataAfterMbr
        )
    }
}

impl fmt::Display for LayoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Classifies a layout file by name, returning the kind and the device
/// stem (`sda` for `sda-pt.sf`, empty for `disk` and `sfdisk`).
pub fn classify(file_name: &str) -> Option<(LayoutKind, &str)> {
    match file_name {
        "disk" => return Some((LayoutKind::Disk, "")),
        "sfdisk" => return Some((LayoutKind::Sfdisk, "")),
        _ => {}
    }
    SUFFIXES.iter().find_map(|&(suffix, kind)| {
        file_name
            .strip_suffix(suffix)
            .filter(|device| !device.is_empty())
            .map(|device| (kind, device))
    })
}

/// One layout file read from an image directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskLayoutOp {
    pub kind: LayoutKind,
    pub path: PathBuf,
    /// Decoded text, or `None` for binary files.
    pub contents: Option<String>,
    pub size_bytes: u64,
}

impl DiskLayoutOp {
    /// Reads `path` as a layout file of `kind`. A NUL byte near the start
    /// marks the file as binary.
    pub fn read(kind: LayoutKind, path: &Path) -> io::Result<Self> {
        let data = fs::read(path)?;
        let probe = &data[..data.len().min(BINARY_PROBE_LEN)];
        let contents = if probe.contains(&0) {
            None
        } else {
            Some(String::from_utf8_lossy(&data).into_owned())
        };
        Ok(DiskLayoutOp {
            kind,
            path: path.to_path_buf(),
            contents,
            size_bytes: data.len() as u64,
        })
    }

    /// The file name of the op's source.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// The source device the file was saved from, taken from its name.
    pub fn device(&self) -> Option<String> {
        let name = self.file_name();
        classify(&name)
            .map(|(_, device)| device.to_string())
            .filter(|d| !d.is_empty())
    }
}

/// Reads every recognized layout file in `dir`, in file-name order.
pub fn collect_layout_ops(dir: &Path) -> io::Result<Vec<DiskLayoutOp>> {
    let mut entries: Vec<(String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            entries.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    entries.sort();

    let mut ops = Vec::new();
    for (name, path) in entries {
        if let Some((kind, _)) = classify(&name) {
            debug!(file = %name, %kind, "Found layout file");
            ops.push(DiskLayoutOp::read(kind, &path)?);
        }
    }
    Ok(ops)
}

/// Orders `ops` by [`LAYOUT_PRIORITY`], keeping file-name order within a
/// kind. Selecting an already selected list returns it unchanged.
pub fn select_layout_ops(mut ops: Vec<DiskLayoutOp>) -> Vec<DiskLayoutOp> {
    ops.sort_by_key(|op| op.kind.priority());
    ops
}

/// Builds one sfdisk op that stretches the saved layout over
/// `target_bytes`, from the first op that can be scaled.
///
/// sfdisk dumps are rewritten in place; parted layouts are converted. The
/// result keeps the source path for diagnostics. `None` when no op can be
/// scaled or the target is not larger than the source.
///
/// # Errors
///
/// Returns [`crate::Error::Layout`] when scaling would push a partition
/// past the end of the target.
pub fn build_scaled_layout(ops: &[DiskLayoutOp], target_bytes: u64) -> Result<Option<DiskLayoutOp>> {
    for op in ops {
        let Some(text) = op.contents.as_deref() else {
            continue;
        };
        let scaled = match op.kind {
            LayoutKind::Disk | LayoutKind::Sfdisk | LayoutKind::PtSf => {
                SfdiskDump::parse(text).scaled(target_bytes)?
            }
            LayoutKind::PtParted => match op.device() {
                Some(device) => PartedLayout::parse(text).scaled(&device, target_bytes)?,
                None => None,
            },
            _ => None,
        };
        if let Some(contents) = scaled {
            info!(source = %op.path.display(), kind = %op.kind, target_bytes, "Built scaled layout");
            return Ok(Some(DiskLayoutOp {
                kind: LayoutKind::Sfdisk,
                path: op.path.clone(),
                size_bytes: contents.len() as u64,
                contents: Some(contents),
            }));
        }
    }
    Ok(None)
}
