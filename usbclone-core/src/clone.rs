//! Device-to-device copies.
//!
//! Three modes are offered:
//! - [`CloneMode::Smart`] replicates the partition table, then copies each
//!   partition with `partclone.<fs> -b` where a tool exists, else `dd`.
//! - [`CloneMode::Exact`] copies the whole device with one `dd`.
//! - [`CloneMode::Verify`] is a smart clone followed by a SHA256 comparison.
use crate::command::{Pipeline, Stage, StageCommand, partclone_tool};
use crate::context::OperationContext;
use crate::device::{DeviceResolver, Drive, Partition};
use crate::error::{Error, Result};
use crate::partition_mode::{LayoutBackend, LayoutCommand, wait_for_count};
use crate::platform;
use crate::progress::Progress;
use crate::table::LayoutKind;
use crate::table::sfdisk::SfdiskDump;
use crate::verify::{VerifyReport, verify_devices};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

/// How a clone copies data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CloneMode {
    #[default]
    Smart,
    Exact,
    Verify,
}

impl FromStr for CloneMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "smart" => Ok(CloneMode::Smart),
            "exact" | "raw" => Ok(CloneMode::Exact),
            "verify" => Ok(CloneMode::Verify),
            other => Err(Error::Layout(format!("unsupported clone mode: {other}"))),
        }
    }
}

impl fmt::Display for CloneMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloneMode::Smart => "smart",
            CloneMode::Exact => "exact",
            CloneMode::Verify => "verify",
        })
    }
}

/// A validated clone request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloneJob {
    source: Drive,
    target: Drive,
    mode: CloneMode,
    job_id: String,
}

impl CloneJob {
    /// # Errors
    ///
    /// [`Error::SameDevice`] when both drives resolve to one node,
    /// [`Error::NotRemovable`] when the target is a fixed drive, and
    /// [`Error::SizeInsufficient`] when the target is known to be smaller
    /// than the source.
    pub fn new(source: Drive, target: Drive, mode: CloneMode, job_id: impl Into<String>) -> Result<Self> {
        if source.node() == target.node() {
            return Err(Error::SameDevice(source.node()));
        }
        if !target.removable {
            return Err(Error::NotRemovable(target.name));
        }
        if source.size_bytes > 0 && target.size_bytes > 0 && target.size_bytes < source.size_bytes {
            return Err(Error::SizeInsufficient {
                required: source.size_bytes,
                target: target.size_bytes,
            });
        }
        Ok(Self {
            source,
            target,
            mode,
            job_id: job_id.into(),
        })
    }

    pub fn source(&self) -> &Drive {
        &self.source
    }

    pub fn target(&self) -> &Drive {
        &self.target
    }

    pub fn mode(&self) -> CloneMode {
        self.mode
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

/// Pairs each source partition with a target partition.
///
/// Partitions pair by number first. A source partition left without a
/// match takes the target partition at the same position, but only if no
/// other source partition claimed it by number.
///
/// # Errors
///
/// [`Error::PartitionMapping`] naming the first source partition that has
/// no counterpart.
pub fn pair_partitions(source: &Drive, target: &Drive) -> Result<Vec<(Partition, Partition)>> {
    let numbered: Vec<Option<usize>> = source
        .partitions
        .iter()
        .map(|src| {
            let number = src.number()?;
            target.partitions.iter().position(|dst| dst.number() == Some(number))
        })
        .collect();
    let claimed: HashSet<usize> = numbered.iter().flatten().copied().collect();

    let mut pairs = Vec::with_capacity(source.partitions.len());
    for (index, (src, matched)) in source.partitions.iter().zip(&numbered).enumerate() {
        let dst = match matched {
            Some(i) => &target.partitions[*i],
            None => match target.partitions.get(index).filter(|_| !claimed.contains(&index)) {
                Some(dst) => {
                    warn!(source = %src.name, target = %dst.name, "No partition with the same number; pairing by position");
                    dst
                }
                None => {
                    return Err(Error::PartitionMapping(format!(
                        "unable to map {} to a target partition",
                        src.name
                    )));
                }
            },
        };
        pairs.push((src.clone(), dst.clone()));
    }
    Ok(pairs)
}

/// The command that copies the table described by `dump` from
/// `source_node` onto `target_node`.
///
/// GPT tables are replicated with fresh GUIDs; DOS tables are replayed
/// from the dump.
pub fn replication_command(dump: &str, source_node: &Path, target_node: &Path) -> Result<LayoutCommand> {
    let parsed = SfdiskDump::parse(dump);
    let label = parsed
        .label
        .as_deref()
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| Error::Layout("unable to detect partition table label".to_string()))?;
    match label.as_str() {
        "gpt" => Ok(LayoutCommand {
            kind: LayoutKind::PtSgdisk,
            program: "sgdisk",
            args: vec![
                format!("--replicate={}", target_node.display()).into(),
                "--randomize-guids".into(),
                source_node.as_os_str().to_owned(),
            ],
            input: None,
        }),
        "dos" | "mbr" | "msdos" => Ok(LayoutCommand {
            kind: LayoutKind::Sfdisk,
            program: "sfdisk",
            args: vec![target_node.as_os_str().to_owned()],
            input: Some(dump.to_string()),
        }),
        other => Err(Error::Layout(format!("unsupported partition table label: {other}"))),
    }
}

fn dd_copy(source: &Path, target: &Path) -> Result<Pipeline> {
    Ok(Pipeline::new().stage(
        StageCommand::tool(Stage::Copy, "dd")?
            .arg(format!("if={}", source.display()))
            .arg(format!("of={}", target.display()))
            .args(["bs=4M", "status=progress", "conv=fsync"]),
    ))
}

/// The pipeline copying one partition: `partclone.<fs> -b` when the
/// filesystem has an installed tool, else `dd`.
pub fn partition_copy(src: &Partition, source: &Path, target: &Path) -> Result<Pipeline> {
    match src.fstype.as_deref().and_then(partclone_tool) {
        Some(tool) => Ok(Pipeline::new().stage(
            StageCommand::new(Stage::Copy, tool)
                .args(["-b", "-s"])
                .arg(source)
                .arg("-o")
                .arg(target),
        )),
        None => dd_copy(source, target),
    }
}

/// Runs `job`. Verify mode returns the comparison report.
///
/// # Errors
///
/// [`Error::PermissionDenied`] when not running as root, plus any failure
/// of the table copy, the data copy, or the verification.
pub fn run(
    ctx: &OperationContext,
    resolver: &dyn DeviceResolver,
    backend: &dyn LayoutBackend,
    job: &CloneJob,
) -> Result<Option<VerifyReport>> {
    platform::require_root()?;
    clone_with(ctx, resolver, backend, job)
}

fn clone_with(
    ctx: &OperationContext,
    resolver: &dyn DeviceResolver,
    backend: &dyn LayoutBackend,
    job: &CloneJob,
) -> Result<Option<VerifyReport>> {
    let _guard = ctx.span().enter();
    let source = resolver
        .device_by_name(&job.source.name)?
        .unwrap_or_else(|| job.source.clone());
    let target = resolver
        .device_by_name(&job.target.name)?
        .ok_or_else(|| Error::DeviceNotFound(job.target.name.clone()))?;
    let source_node = resolver.resolve_node(&source.name);
    let target_node = resolver.resolve_node(&target.name);
    info!(
        job = job.job_id(),
        source = %source_node.display(),
        target = %target_node.display(),
        mode = %job.mode,
        "Starting clone"
    );

    ctx.status(["CLONING", "Unmounting target"]);
    if !resolver.unmount(&target) {
        return Err(Error::UnmountFailed(target.name.clone()));
    }

    if job.mode == CloneMode::Exact || source.partitions.is_empty() {
        let total = (source.size_bytes > 0).then_some(source.size_bytes);
        dd_copy(&source_node, &target_node)?.monitor(Stage::Copy).run(
            ctx,
            "CLONING",
            Some(source.label()),
            total,
        )?;
        ctx.status(["CLONING", "Complete"]);
        info!(source = %source_node.display(), target = %target_node.display(), "Raw clone complete");
        return finish(ctx, resolver, job, &source, &target);
    }

    ctx.status(["CLONING", "Copy table"]);
    let dump = backend.dump_table(&source_node)?;
    let command = replication_command(&dump, &source_node, &target_node)?;
    info!(command = %command, "Replicating partition table");
    backend.apply(&command)?;
    backend.reread(&target_node);
    backend.settle();

    let expected = source.partitions.len();
    let observed = wait_for_count(ctx, resolver, &target.name, expected, ctx.settings().layout_timeout())?;
    if observed < expected {
        return Err(Error::PartitionCountMismatch {
            expected,
            observed,
            attempts: vec![format!("{}: expected {expected}, saw {observed}", command.kind)],
        });
    }
    let target = resolver
        .device_by_name(&target.name)?
        .ok_or_else(|| Error::DeviceNotFound(target.name.clone()))?;

    let pairs = pair_partitions(&source, &target)?;
    let total = pairs.len();
    for (index, (src, dst)) in pairs.iter().enumerate() {
        let src_node = resolver.resolve_node(&src.name);
        let dst_node = resolver.resolve_node(&dst.name);
        let title = format!("{} ({}/{})", src.display_name(), index + 1, total);
        info!(source = %src_node.display(), target = %dst_node.display(), "Copying partition");

        ctx.set_scale(index as f64 / total as f64, 1.0 / total as f64);
        let size = (src.size_bytes > 0).then_some(src.size_bytes);
        partition_copy(src, &src_node, &dst_node)?
            .monitor(Stage::Copy)
            .run(ctx, &title, Some(src.summary()), size)?;
    }
    ctx.reset_scale();
    ctx.emit(Progress::new(vec!["CLONING".to_string(), "Complete".to_string()], Some(1.0)));
    info!(source = %source_node.display(), target = %target_node.display(), "Smart clone complete");
    finish(ctx, resolver, job, &source, &target)
}

fn finish(
    ctx: &OperationContext,
    resolver: &dyn DeviceResolver,
    job: &CloneJob,
    source: &Drive,
    target: &Drive,
) -> Result<Option<VerifyReport>> {
    if job.mode != CloneMode::Verify {
        return Ok(None);
    }
    ctx.status(["VERIFY", "Starting..."]);
    let report = verify_devices(ctx, resolver, source, target)?;
    ctx.status(["VERIFY", "Complete"]);
    Ok(Some(report))
}
