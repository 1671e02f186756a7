//! Turns an image directory into an immutable [`RestorePlan`].
//!
//! Building a plan only reads the directory. Nothing is written and no
//! layout is applied; the plan carries the selected layout ops for the
//! partition-mode logic to apply later.
use super::read_parts;
use super::volumes::{ImageFamily, extract_partclone_fstype, find_volumes, has_unrecognized_image_files};
use crate::command::partclone_tool;
use crate::compression::Compression;
use crate::error::{Error, Result};
use crate::table::size::estimate_required_size;
use crate::table::{DiskLayoutOp, collect_layout_ops, select_layout_ops};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The program that writes a partition's data back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreTool {
    Partclone,
    Dd,
}

impl fmt::Display for RestoreTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestoreTool::Partclone => "partclone",
            RestoreTool::Dd => "dd",
        })
    }
}

/// How to restore one saved partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionRestoreOp {
    /// Partition name as saved, e.g. `sda1`.
    pub partition: String,
    /// Data files in stream order.
    pub volumes: Vec<PathBuf>,
    pub tool: RestoreTool,
    /// Filesystem recorded in a partclone image name.
    pub fstype: Option<String>,
    pub compression: Option<Compression>,
}

impl PartitionRestoreOp {
    pub fn compressed(&self) -> bool {
        self.compression.is_some()
    }
}

/// Everything needed to restore an image, resolved up front.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestorePlan {
    image_dir: PathBuf,
    parts: Vec<String>,
    layout_ops: Vec<DiskLayoutOp>,
    partition_ops: Vec<PartitionRestoreOp>,
}

impl RestorePlan {
    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Layout ops in priority order.
    pub fn layout_ops(&self) -> &[DiskLayoutOp] {
        &self.layout_ops
    }

    /// One op per entry of [`RestorePlan::parts`], in the same order.
    pub fn partition_ops(&self) -> &[PartitionRestoreOp] {
        &self.partition_ops
    }

    /// The smallest target the saved layout fits on, if any layout file
    /// records a geometry.
    pub fn required_size(&self) -> Result<Option<u64>> {
        estimate_required_size(&self.layout_ops, Some(&self.image_dir))
    }
}

/// Builds the plan for `image_dir`, choosing partclone only where the
/// matching partclone tool is installed.
pub fn build_plan(image_dir: &Path) -> Result<RestorePlan> {
    build_plan_with(image_dir, |fstype| partclone_tool(fstype).is_some())
}

/// Builds the plan with a custom check for partclone availability.
///
/// # Errors
///
/// [`Error::ImageFormat`] when the `parts` file is missing or empty, when
/// a partition has no data files, or when its files follow neither naming
/// convention.
pub fn build_plan_with<F>(image_dir: &Path, partclone_available: F) -> Result<RestorePlan>
where
    F: Fn(&str) -> bool,
{
    let parts = read_parts(image_dir)?;
    let layout_ops = select_layout_ops(collect_layout_ops(image_dir)?);

    let mut partition_ops = Vec::with_capacity(parts.len());
    for part in &parts {
        let op = partition_restore_op(image_dir, part, &partclone_available)?.ok_or_else(|| {
            Error::ImageFormat(format!("image data missing for {part}"))
        })?;
        debug!(
            partition = %op.partition,
            tool = %op.tool,
            volumes = op.volumes.len(),
            compressed = op.compressed(),
            "Planned partition restore"
        );
        partition_ops.push(op);
    }
    info!(
        image = %image_dir.display(),
        partitions = parts.len(),
        layout_files = layout_ops.len(),
        "Built restore plan"
    );
    Ok(RestorePlan {
        image_dir: image_dir.to_path_buf(),
        parts,
        layout_ops,
        partition_ops,
    })
}

/// Resolves the data files and tool for one partition.
///
/// partclone volumes win when they are the only data, or when a partclone
/// tool for their filesystem is available; otherwise dd volumes are used.
pub fn partition_restore_op<F>(
    image_dir: &Path,
    part: &str,
    partclone_available: F,
) -> Result<Option<PartitionRestoreOp>>
where
    F: Fn(&str) -> bool,
{
    let partclone = find_volumes(image_dir, part, ImageFamily::Partclone)?;
    let dd = find_volumes(image_dir, part, ImageFamily::Dd)?;

    if let Some(first) = partclone.first() {
        let name = first
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let fstype = extract_partclone_fstype(part, &name);
        let usable = fstype
            .as_deref()
            .is_some_and(|fs| partclone_available(&fs.to_ascii_lowercase()));
        if dd.is_empty() || usable {
            return Ok(Some(PartitionRestoreOp {
                partition: part.to_string(),
                compression: Compression::detect(&partclone),
                volumes: partclone,
                tool: RestoreTool::Partclone,
                fstype,
            }));
        }
    }

    if !dd.is_empty() {
        return Ok(Some(PartitionRestoreOp {
            partition: part.to_string(),
            compression: Compression::detect(&dd),
            volumes: dd,
            tool: RestoreTool::Dd,
            fstype: None,
        }));
    }

    if has_unrecognized_image_files(image_dir, part)? {
        return Err(Error::ImageFormat(format!(
            "image set does not match partclone/dd naming convention for partition {part}"
        )));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::LayoutKind;
    use std::fs;

    fn image(files: &[&str], parts: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("parts"), parts).unwrap();
        for name in files {
            fs::write(dir.path().join(name), b"data").unwrap();
        }
        dir
    }

    #[test]
    fn plans_partclone_and_dd_partitions() {
        let dir = image(
            &["sda1.ext4-ptcl-img.gz.aa", "sda2.dd-img", "sda-pt.sf"],
            "sda1 sda2\n",
        );
        let plan = build_plan_with(dir.path(), |_| false).unwrap();
        assert_eq!(plan.parts(), ["sda1", "sda2"]);
        assert_eq!(plan.partition_ops().len(), plan.parts().len());

        let first = &plan.partition_ops()[0];
        assert_eq!(first.tool, RestoreTool::Partclone);
        assert_eq!(first.fstype.as_deref(), Some("ext4"));
        assert!(first.compressed());
        assert_eq!(first.compression, Some(Compression::Gzip));

        let second = &plan.partition_ops()[1];
        assert_eq!(second.tool, RestoreTool::Dd);
        assert_eq!(second.fstype, None);
        assert!(!second.compressed());

        assert_eq!(plan.layout_ops().len(), 1);
        assert_eq!(plan.layout_ops()[0].kind, LayoutKind::PtSf);
    }

    #[test]
    fn dd_wins_when_partclone_tool_is_missing() {
        let dir = image(&["sda1.ntfs-ptcl-img.zst", "sda1.dd-img.zst"], "sda1");
        let plan = build_plan_with(dir.path(), |_| false).unwrap();
        assert_eq!(plan.partition_ops()[0].tool, RestoreTool::Dd);

        let plan = build_plan_with(dir.path(), |fs| fs == "ntfs").unwrap();
        let op = &plan.partition_ops()[0];
        assert_eq!(op.tool, RestoreTool::Partclone);
        assert_eq!(op.compression, Some(Compression::Zstd));
    }

    #[test]
    fn missing_data_is_reported_per_partition() {
        let dir = image(&["sda1.dd-img"], "sda1 sda2");
        let err = build_plan_with(dir.path(), |_| true).unwrap_err();
        assert!(matches!(err, Error::ImageFormat(ref m) if m == "image data missing for sda2"));
    }

    #[test]
    fn foreign_naming_is_a_format_error() {
        let dir = image(&["sda1.ext4.ptclimg.gz"], "sda1");
        let err = build_plan_with(dir.path(), |_| true).unwrap_err();
        assert!(err.to_string().contains("naming convention for partition sda1"));
    }

    #[test]
    fn required_size_comes_from_layout() {
        let dir = image(&["sda1.dd-img"], "sda1");
        fs::write(
            dir.path().join("sda-pt.sf"),
            "label: dos\n/dev/sda1 : start=2048, size=2048\n",
        )
        .unwrap();
        let plan = build_plan_with(dir.path(), |_| true).unwrap();
        assert_eq!(plan.required_size().unwrap(), Some(4096 * 512));
    }
}
