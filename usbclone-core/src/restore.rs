//! Writes a Clonezilla image back onto a drive.
//!
//! The main entry point is the [`run`] function, which executes the full restore
//! process:
//! 1.  Checks for root and unmounts the target drive.
//! 2.  Validates the target size against the size the image's layout implies.
//! 3.  Writes the partition table according to the [`PartitionMode`] and waits
//!     for the kernel to show the partitions.
//! 4.  Streams every partition through
//!     `cat | [decompressor] | partclone.<fs> -r` (or `dd`) onto its target.
//!
//! [`run_iso`] writes a plain `.iso` file onto the whole drive instead.
use crate::command::{Pipeline, Stage, StageCommand, find_first, partclone_program, partclone_tool};
use crate::context::OperationContext;
use crate::device::{DeviceResolver, Drive, friendly_fstype, human_size};
use crate::error::{Error, Result};
use crate::image::plan::{PartitionRestoreOp, RestorePlan, RestoreTool};
use crate::partition_mode::{LayoutBackend, PartitionMode, apply_layout, apply_post_layout, wait_for_partitions};
use crate::platform;
use crate::progress::Progress;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Block size `dd` writes raw partition images with.
const DD_BLOCK_SIZE: &str = "bs=4M";

/// Builds the pipeline restoring `op` onto `target`.
///
/// # Errors
///
/// [`Error::ToolMissing`] when `cat`, the decompressor, or the restore tool
/// is not installed.
pub fn restore_pipeline(op: &PartitionRestoreOp, target: &Path) -> Result<Pipeline> {
    if op.volumes.is_empty() {
        return Err(Error::ImageFormat(format!(
            "image data missing for {}",
            op.partition
        )));
    }
    let mut pipeline =
        Pipeline::new().stage(StageCommand::tool(Stage::Stream, "cat")?.args(&op.volumes));

    if let Some(compression) = op.compression {
        pipeline = pipeline.stage(
            StageCommand::new(Stage::Decompress, find_first(compression.programs())?)
                .args(compression.decompress_args()),
        );
    }

    let writer = match op.tool {
        RestoreTool::Partclone => {
            let fstype = op.fstype.as_deref().unwrap_or_default();
            let program = partclone_tool(fstype).ok_or_else(|| {
                Error::ToolMissing(
                    partclone_program(fstype)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("partclone for filesystem '{fstype}'")),
                )
            })?;
            StageCommand::new(Stage::Restore, program)
                .args(["-r", "-s", "-", "-o"])
                .arg(target)
                .arg("-F")
        }
        RestoreTool::Dd => StageCommand::tool(Stage::Restore, "dd")?
            .arg(format!("of={}", target.display()))
            .args([DD_BLOCK_SIZE, "status=progress", "conv=fsync"]),
    };
    Ok(pipeline.stage(writer).monitor(Stage::Restore))
}

/// Restores `plan` onto the drive named `target`.
///
/// # Errors
///
/// [`Error::PermissionDenied`] when not running as root, plus every error
/// of the steps above. A failure leaves the target partially written.
pub fn run(
    ctx: &OperationContext,
    resolver: &dyn DeviceResolver,
    backend: &dyn LayoutBackend,
    plan: &RestorePlan,
    target: &str,
    mode: PartitionMode,
) -> Result<()> {
    platform::require_root()?;
    restore_to(ctx, resolver, backend, plan, target, mode)
}

fn restore_to(
    ctx: &OperationContext,
    resolver: &dyn DeviceResolver,
    backend: &dyn LayoutBackend,
    plan: &RestorePlan,
    target: &str,
    mode: PartitionMode,
) -> Result<()> {
    let _guard = ctx.span().enter();
    let drive = resolver
        .device_by_name(target)?
        .ok_or_else(|| Error::DeviceNotFound(target.to_string()))?;
    let node = resolver.resolve_node(&drive.name);
    info!(image = %plan.image_dir().display(), target = %node.display(), %mode, "Starting restore");

    ctx.status(["Preparing media...", "Unmounting target"]);
    if !resolver.unmount(&drive) {
        return Err(Error::UnmountFailed(drive.name.clone()));
    }

    ctx.status(["Preparing media...", "Checking target size"]);
    check_target_size(plan, &drive, &node)?;

    let expected = plan.parts().len();
    let post = apply_layout(ctx, resolver, backend, mode, plan.layout_ops(), &drive, expected)?;

    ctx.status(["Preparing media...", "Waiting for partitions"]);
    let timeout = match mode {
        PartitionMode::K => ctx.settings().existing_layout_timeout(),
        _ => ctx.settings().layout_timeout(),
    };
    let (_, targets) = wait_for_partitions(ctx, resolver, &drive.name, plan.parts(), timeout)?;
    apply_post_layout(ctx, backend, &post, &node)?;

    let total = plan.partition_ops().len();
    for (index, op) in plan.partition_ops().iter().enumerate() {
        let part = targets.get(&op.partition).ok_or_else(|| {
            Error::PartitionMapping(format!("missing target partition for {}", op.partition))
        })?;
        let part_node = resolver.resolve_node(&part.name);
        let title = format!("{} ({}/{})", part.display_name(), index + 1, total);
        let subtitle = match op.fstype.as_deref() {
            Some(fs) => format!("{} {}", human_size(part.size_bytes), friendly_fstype(fs)),
            None => human_size(part.size_bytes),
        };
        info!(
            partition = %op.partition,
            target = %part_node.display(),
            tool = %op.tool,
            volumes = op.volumes.len(),
            "Restoring partition"
        );

        ctx.set_scale(index as f64 / total as f64, 1.0 / total as f64);
        let total_bytes = (part.size_bytes > 0).then_some(part.size_bytes);
        restore_pipeline(op, &part_node)?.run(ctx, &title, Some(subtitle), total_bytes)?;
    }

    ctx.reset_scale();
    ctx.emit(Progress::new(vec!["Finalizing...".to_string()], Some(1.0)));
    info!(target = %node.display(), partitions = total, "Restore complete");
    Ok(())
}

/// Fails with [`Error::SizeInsufficient`] when the layout needs more space
/// than the target has. Unknown sizes only warn.
fn check_target_size(plan: &RestorePlan, drive: &Drive, node: &Path) -> Result<()> {
    let required = plan.required_size()?;
    let available = if drive.size_bytes > 0 {
        Some(drive.size_bytes)
    } else {
        platform::block_device_size(node)
    };
    match (required, available) {
        (Some(required), Some(target)) if target < required => {
            Err(Error::SizeInsufficient { required, target })
        }
        (Some(_), Some(_)) => Ok(()),
        _ => {
            warn!(?required, ?available, "Unable to determine size information; skipping size check");
            Ok(())
        }
    }
}

/// The `dd` pipeline writing `iso` onto the whole device `target`.
pub fn iso_pipeline(iso: &Path, target: &Path) -> Result<Pipeline> {
    Ok(Pipeline::new().stage(
        StageCommand::tool(Stage::Restore, "dd")?
            .arg(format!("if={}", iso.display()))
            .arg(format!("of={}", target.display()))
            .args([DD_BLOCK_SIZE, "status=progress", "conv=fsync"]),
    ))
}

/// Writes the `.iso` file `iso` byte for byte onto the drive named
/// `target`, returning the bytes written.
///
/// # Errors
///
/// [`Error::PermissionDenied`] when not running as root,
/// [`Error::ImageFormat`] when `iso` is not a file,
/// [`Error::SizeInsufficient`] when the drive is smaller than the file,
/// plus any failure of the `dd` write.
pub fn run_iso(ctx: &OperationContext, resolver: &dyn DeviceResolver, iso: &Path, target: &str) -> Result<u64> {
    platform::require_root()?;
    restore_iso_to(ctx, resolver, iso, target)
}

fn restore_iso_to(ctx: &OperationContext, resolver: &dyn DeviceResolver, iso: &Path, target: &str) -> Result<u64> {
    let _guard = ctx.span().enter();
    if !iso.is_file() {
        return Err(Error::ImageFormat(format!("ISO file not found: {}", iso.display())));
    }
    let iso_size = fs::metadata(iso)?.len();
    let drive = resolver
        .device_by_name(target)?
        .ok_or_else(|| Error::DeviceNotFound(target.to_string()))?;
    let node = resolver.resolve_node(&drive.name);
    info!(iso = %iso.display(), target = %node.display(), bytes = iso_size, "Starting ISO restore");

    ctx.status(["Preparing media...", "Unmounting target"]);
    if !resolver.unmount(&drive) {
        return Err(Error::UnmountFailed(drive.name.clone()));
    }

    let available = if drive.size_bytes > 0 {
        Some(drive.size_bytes)
    } else {
        platform::block_device_size(&node)
    };
    match available {
        Some(size) if size < iso_size => {
            return Err(Error::SizeInsufficient {
                required: iso_size,
                target: size,
            });
        }
        Some(_) => {}
        None => warn!(target = %node.display(), "Unable to determine target size; skipping size check"),
    }

    let title = format!(
        "Writing {}",
        iso.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    );
    iso_pipeline(iso, &node)?.run(ctx, &title, Some(drive.label()), Some(iso_size))?;

    ctx.emit(Progress::new(vec!["Finalizing...".to_string()], Some(1.0)));
    info!(target = %node.display(), bytes = iso_size, "ISO restore complete");
    Ok(iso_size)
}
