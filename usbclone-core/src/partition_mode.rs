//! Applying a saved layout to the target before partition data is written.
//!
//! The four modes follow Clonezilla's `-k` options:
//!
//! - `k0`: write the saved table, trying each layout file in priority order
//!   until the kernel shows the expected number of partitions.
//! - `k`: keep the target's existing table; it must already have enough
//!   partitions.
//! - `k1`: write the saved table scaled proportionally to the target size.
//! - `k2`: write nothing; partitions are expected to exist already.
//!
//! `hidden-data-after-mbr` is never part of the table itself and is always
//! written after the partitions have appeared.
use crate::command::{Stage, StageCommand, run_checked};
use crate::context::OperationContext;
use crate::device::{Drive, DeviceResolver, Partition, partition_number};
use crate::error::{Error, Result};
use crate::table::binary::has_gpt_signature;
use crate::table::parted::{expand_compact, is_print_output};
use crate::table::sfdisk::looks_like_script;
use crate::table::{DiskLayoutOp, LayoutKind, build_scaled_layout};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How the target's partition table is prepared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PartitionMode {
    #[default]
    K0,
    K,
    K1,
    K2,
}

impl FromStr for PartitionMode {
    type Err = Error;

    /// Accepts `k0`, `-k1`, `K2` and so on.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().trim_start_matches('-').to_ascii_lowercase().as_str() {
            "" | "k0" => Ok(PartitionMode::K0),
            "k" => Ok(PartitionMode::K),
            "k1" => Ok(PartitionMode::K1),
            "k2" => Ok(PartitionMode::K2),
            other => Err(Error::Layout(format!("unsupported partition mode: {other}"))),
        }
    }
}

impl fmt::Display for PartitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PartitionMode::K0 => "k0",
            PartitionMode::K => "k",
            PartitionMode::K1 => "k1",
            PartitionMode::K2 => "k2",
        })
    }
}

/// A layout write, described by tool name so the caller decides how to run it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayoutCommand {
    pub kind: LayoutKind,
    pub program: &'static str,
    pub args: Vec<OsString>,
    /// Script fed on stdin.
    pub input: Option<String>,
}

impl fmt::Display for LayoutCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Whether a layout op can be written to the target.
///
/// [`prepare`] has three outcomes. `Ok(Applicable)` carries the command to
/// run. `Ok(NotApplicable)` means the file is the wrong dialect and the
/// next candidate should be tried. `Err(Error::Layout)` means the file was
/// meant for this step but is broken, and restore stops.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Applicability {
    Applicable(LayoutCommand),
    /// The file is not something the tool can replay; try the next one.
    NotApplicable(String),
}

fn script_of(op: &DiskLayoutOp) -> Result<&str> {
    op.contents
        .as_deref()
        .ok_or_else(|| Error::Layout(format!("{} data missing or unreadable", op.kind)))
}

fn dd_args(op: &DiskLayoutOp, target_node: &Path, seek: Option<u64>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        format!("if={}", op.path.display()).into(),
        format!("of={}", target_node.display()).into(),
        "bs=1".into(),
    ];
    if let Some(seek) = seek {
        args.push(format!("seek={seek}").into());
    }
    args.push(format!("count={}", op.size_bytes).into());
    args.push("conv=fsync".into());
    args
}

/// Decides how (and whether) `op` can be written to `target_node`.
///
/// # Errors
///
/// [`Error::Layout`] when a script op has no readable text or a raw op is
/// empty; I/O errors when a binary backup cannot be read.
pub fn prepare(op: &DiskLayoutOp, target_node: &Path) -> Result<Applicability> {
    let node: OsString = target_node.as_os_str().to_owned();
    let command = |program, args: Vec<OsString>, input: Option<String>| {
        Applicability::Applicable(LayoutCommand {
            kind: op.kind,
            program,
            args,
            input,
        })
    };
    let prepared = match op.kind {
        LayoutKind::Disk | LayoutKind::Sfdisk | LayoutKind::PtSf | LayoutKind::ChsSf => {
            let script = script_of(op)?;
            if !looks_like_script(script) {
                return Ok(Applicability::NotApplicable(
                    "does not look like sfdisk input".to_string(),
                ));
            }
            command("sfdisk", vec!["--force".into(), node], Some(script.to_string()))
        }
        LayoutKind::PtParted | LayoutKind::PtPartedCompact => {
            let mut script = script_of(op)?.to_string();
            if op.kind == LayoutKind::PtPartedCompact {
                script = expand_compact(&script)?;
            }
            if is_print_output(&script) {
                return Ok(Applicability::NotApplicable(
                    "parted print output, not a script".to_string(),
                ));
            }
            command("parted", vec!["-s".into(), node], Some(script))
        }
        LayoutKind::Mbr | LayoutKind::HiddenDataAfterMbr => {
            if op.size_bytes == 0 {
                return Err(Error::Layout(format!("{} file is empty", op.kind)));
            }
            let seek = (op.kind == LayoutKind::HiddenDataAfterMbr).then_some(512);
            command("dd", dd_args(op, target_node, seek), None)
        }
        LayoutKind::PtSgdisk | LayoutKind::Gpt => {
            if !has_gpt_signature(&fs::read(&op.path)?) {
                return Ok(Applicability::NotApplicable(
                    "no GPT header in backup".to_string(),
                ));
            }
            let load: OsString = format!("--load-backup={}", op.path.display()).into();
            command("sgdisk", vec![load, node], None)
        }
    };
    Ok(prepared)
}

/// The side-effecting half of layout application.
#[cfg_attr(test, mockall::automock)]
pub trait LayoutBackend: Send + Sync {
    /// Runs a prepared layout write.
    fn apply(&self, command: &LayoutCommand) -> Result<()>;

    /// Reads the current table of `node` as an sfdisk dump.
    fn dump_table(&self, node: &Path) -> Result<String>;

    /// Asks the kernel to re-read the partition table of `target_node`.
    fn reread(&self, target_node: &Path);

    /// Waits for udev to finish processing events.
    fn settle(&self);
}

/// Runs layout commands with the system's tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLayoutBackend;

impl LayoutBackend for SystemLayoutBackend {
    fn apply(&self, command: &LayoutCommand) -> Result<()> {
        let cmd = StageCommand::tool(Stage::Layout, command.program)?.args(command.args.iter());
        run_checked(&cmd, command.input.as_deref())?;
        Ok(())
    }

    fn dump_table(&self, node: &Path) -> Result<String> {
        let cmd = StageCommand::tool(Stage::Probe, "sfdisk")?.arg("--dump").arg(node);
        run_checked(&cmd, None)
    }

    fn reread(&self, target_node: &Path) {
        let attempt = StageCommand::tool(Stage::Layout, "partprobe")
            .map(|c| c.arg(target_node))
            .or_else(|_| {
                StageCommand::tool(Stage::Layout, "blockdev").map(|c| c.arg("--rereadpt").arg(target_node))
            });
        match attempt {
            Ok(cmd) => {
                if let Err(e) = run_checked(&cmd, None) {
                    debug!(error = %e, "Partition table re-read reported an error");
                }
            }
            Err(e) => warn!(error = %e, "No tool to re-read the partition table"),
        }
    }

    fn settle(&self) {
        if let Ok(cmd) = StageCommand::tool(Stage::Layout, "udevadm") {
            if let Err(e) = run_checked(&cmd.arg("settle"), None) {
                debug!(error = %e, "udevadm settle failed");
            }
        }
    }
}

/// The layout ops `mode` will try, before splitting off post-layout data.
pub fn layout_ops_for_mode(
    mode: PartitionMode,
    ops: &[DiskLayoutOp],
    target_bytes: u64,
) -> Result<Vec<DiskLayoutOp>> {
    match mode {
        PartitionMode::K | PartitionMode::K2 => Ok(Vec::new()),
        PartitionMode::K0 => Ok(ops.to_vec()),
        PartitionMode::K1 => match build_scaled_layout(ops, target_bytes)? {
            Some(scaled) => Ok(vec![scaled]),
            None => {
                info!("Layout cannot be scaled to the target; using saved layout");
                Ok(ops.to_vec())
            }
        },
    }
}

/// Splits `hidden-data-after-mbr` ops off the rest.
pub fn split_post_layout(ops: Vec<DiskLayoutOp>) -> (Vec<DiskLayoutOp>, Vec<DiskLayoutOp>) {
    ops.into_iter()
        .partition(|op| op.kind != LayoutKind::HiddenDataAfterMbr)
}

/// Polls `name` until it shows at least `expected` partitions or `timeout`
/// passes, and returns the last count seen. Always polls at least once.
///
/// # Errors
///
/// [`Error::DeviceNotFound`] if the device never showed up, and
/// [`Error::Cancelled`] if the job was cancelled while waiting.
pub fn wait_for_count(
    ctx: &OperationContext,
    resolver: &dyn DeviceResolver,
    name: &str,
    expected: usize,
    timeout: Duration,
) -> Result<usize> {
    let deadline = Instant::now() + timeout;
    let mut last = None;
    loop {
        if ctx.process_groups().is_terminated() {
            return Err(Error::Cancelled);
        }
        if let Some(drive) = resolver.device_by_name(name)? {
            let count = drive.partitions.len();
            last = Some(count);
            if count >= expected {
                return Ok(count);
            }
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(ctx.settings().poll_interval());
    }
    last.ok_or_else(|| Error::DeviceNotFound(name.to_string()))
}

/// Pairs saved partition names with the target's partitions by number.
/// Names without a number, or with no matching target, are left out.
pub fn map_target_partitions(parts: &[String], target: &Drive) -> HashMap<String, Partition> {
    let by_number: HashMap<u32, &Partition> = target
        .partitions
        .iter()
        .filter_map(|p| Some((p.number()?, p)))
        .collect();
    parts
        .iter()
        .filter_map(|part| {
            let number = partition_number(part)?;
            by_number.get(&number).map(|p| (part.clone(), (*p).clone()))
        })
        .collect()
}

/// Polls until every saved partition has a counterpart on the target.
///
/// # Errors
///
/// [`Error::Layout`] naming the missing partitions on timeout.
pub fn wait_for_partitions(
    ctx: &OperationContext,
    resolver: &dyn DeviceResolver,
    name: &str,
    parts: &[String],
    timeout: Duration,
) -> Result<(Drive, HashMap<String, Partition>)> {
    let deadline = Instant::now() + timeout;
    let mut missing: Vec<String> = parts.to_vec();
    let mut seen = false;
    loop {
        if ctx.process_groups().is_terminated() {
            return Err(Error::Cancelled);
        }
        if let Some(drive) = resolver.device_by_name(name)? {
            seen = true;
            let mapping = map_target_partitions(parts, &drive);
            missing = parts
                .iter()
                .filter(|p| !mapping.contains_key(*p))
                .cloned()
                .collect();
            if missing.is_empty() {
                return Ok((drive, mapping));
            }
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(ctx.settings().poll_interval());
    }
    if !seen {
        return Err(Error::DeviceNotFound(name.to_string()));
    }
    Err(Error::Layout(format!(
        "timed out waiting for partitions to appear: {}",
        missing.join(", ")
    )))
}

/// Writes the partition table to `target` according to `mode`.
///
/// Candidates are tried in order. A candidate that cannot be replayed is
/// skipped; a candidate that fails to run aborts. After each write the
/// table is re-read and the partition count polled; the first candidate
/// that yields `expected` partitions wins.
///
/// # Errors
///
/// [`Error::PartitionCountMismatch`] listing every attempt when no
/// candidate produced enough partitions, or when `k` finds too few.
///
/// Returns the `hidden-data-after-mbr` ops held back for
/// [`apply_post_layout`].
pub fn apply_layout(
    ctx: &OperationContext,
    resolver: &dyn DeviceResolver,
    backend: &dyn LayoutBackend,
    mode: PartitionMode,
    ops: &[DiskLayoutOp],
    target: &Drive,
    expected: usize,
) -> Result<Vec<DiskLayoutOp>> {
    let settings = ctx.settings();
    if mode == PartitionMode::K {
        ctx.status(["Preparing media...", "Checking existing partition layout"]);
        let observed = wait_for_count(
            ctx,
            resolver,
            &target.name,
            expected,
            settings.existing_layout_timeout(),
        )?;
        if observed < expected {
            return Err(Error::PartitionCountMismatch {
                expected,
                observed,
                attempts: vec!["existing layout (k)".to_string()],
            });
        }
        return Ok(Vec::new());
    }

    let candidates = layout_ops_for_mode(mode, ops, target.size_bytes)?;
    let (candidates, post) = split_post_layout(candidates);
    if candidates.is_empty() {
        return Ok(post);
    }
    let node = resolver.resolve_node(&target.name);

    ctx.status(["Preparing media...", "Applying partition layout"]);
    let mut attempts = Vec::new();
    let mut observed = 0;
    for op in &candidates {
        let command = match prepare(op, &node)? {
            Applicability::Applicable(command) => command,
            Applicability::NotApplicable(reason) => {
                debug!(file = %op.path.display(), kind = %op.kind, %reason, "Skipping layout file");
                attempts.push(format!("{}: skipped ({reason})", op.kind));
                continue;
            }
        };
        info!(kind = %op.kind, command = %command, "Applying partition layout");
        backend.apply(&command)?;
        backend.reread(&node);
        ctx.status(["Preparing media...", "Waiting for udev to settle"]);
        backend.settle();
        ctx.status(["Preparing media...", "Waiting for partitions"]);
        observed = wait_for_count(ctx, resolver, &target.name, expected, settings.layout_timeout())?;
        if observed >= expected {
            return Ok(post);
        }
        warn!(kind = %op.kind, expected, observed, "Partition count mismatch after layout");
        attempts.push(format!("{}: expected {expected}, saw {observed}", op.kind));
    }
    Err(Error::PartitionCountMismatch {
        expected,
        observed,
        attempts,
    })
}

/// Writes `hidden-data-after-mbr` ops once the table is in place.
pub fn apply_post_layout(
    ctx: &OperationContext,
    backend: &dyn LayoutBackend,
    ops: &[DiskLayoutOp],
    target_node: &Path,
) -> Result<()> {
    let post: Vec<&DiskLayoutOp> = ops
        .iter()
        .filter(|op| op.kind == LayoutKind::HiddenDataAfterMbr)
        .collect();
    if post.is_empty() {
        return Ok(());
    }
    ctx.status(["Preparing media...", "Applying post-layout updates"]);
    for op in post {
        match prepare(op, target_node)? {
            Applicability::Applicable(command) => backend.apply(&command)?,
            Applicability::NotApplicable(reason) => {
                warn!(file = %op.path.display(), %reason, "Skipping post-layout file");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::device::MockDeviceResolver;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_ctx() -> OperationContext {
        OperationContext::silent(Settings {
            layout_timeout_secs: 0,
            existing_layout_timeout_secs: 0,
            partition_poll_interval_ms: 1,
            ..Settings::default()
        })
    }

    fn text_op(kind: LayoutKind, name: &str, text: &str) -> DiskLayoutOp {
        DiskLayoutOp {
            kind,
            path: PathBuf::from(name),
            contents: Some(text.to_string()),
            size_bytes: text.len() as u64,
        }
    }

    fn drive(name: &str, parts: usize) -> Drive {
        Drive {
            name: name.to_string(),
            size_bytes: 1 << 30,
            partitions: (1..=parts)
                .map(|n| Partition {
                    name: format!("{name}{n}"),
                    size_bytes: 1 << 20,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    /// A resolver whose partition count switches to `after` once `applied`
    /// is non-zero.
    fn resolver(applied: Arc<AtomicUsize>, before: usize, after: usize) -> MockDeviceResolver {
        let mut resolver = MockDeviceResolver::new();
        resolver.expect_resolve_node().returning(|n| PathBuf::from(format!("/dev/{n}")));
        resolver.expect_device_by_name().returning(move |n| {
            let count = if applied.load(Ordering::SeqCst) > 0 { after } else { before };
            Ok(Some(drive(n, count)))
        });
        resolver
    }

    #[test]
    fn parses_modes() {
        assert_eq!("-k1".parse::<PartitionMode>().unwrap(), PartitionMode::K1);
        assert_eq!("K".parse::<PartitionMode>().unwrap(), PartitionMode::K);
        assert_eq!("".parse::<PartitionMode>().unwrap(), PartitionMode::K0);
        assert!("k9".parse::<PartitionMode>().is_err());
        assert_eq!(PartitionMode::K2.to_string(), "k2");
    }

    #[test]
    fn prepare_classifies_ops() {
        let node = Path::new("/dev/sdb");
        let sf = text_op(LayoutKind::PtSf, "sda-pt.sf", "label: dos\n/dev/sda1 : start=2048, size=10\n");
        match prepare(&sf, node).unwrap() {
            Applicability::Applicable(cmd) => {
                assert_eq!(cmd.to_string(), "sfdisk --force /dev/sdb");
                assert!(cmd.input.unwrap().starts_with("label: dos"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let disk = text_op(LayoutKind::Disk, "disk", "sda\n");
        assert!(matches!(prepare(&disk, node).unwrap(), Applicability::NotApplicable(_)));

        let print = text_op(LayoutKind::PtParted, "sda-pt.parted", "Model: USB\nPartition Table: gpt\n");
        assert!(matches!(prepare(&print, node).unwrap(), Applicability::NotApplicable(_)));

        let compact = text_op(LayoutKind::PtPartedCompact, "sda-pt.parted.compact", "mklabel gpt;mkpart p 34s 99s");
        match prepare(&compact, node).unwrap() {
            Applicability::Applicable(cmd) => {
                assert_eq!(cmd.program, "parted");
                assert_eq!(cmd.input.as_deref(), Some("mklabel gpt\nmkpart p 34s 99s\n"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let binary = DiskLayoutOp {
            kind: LayoutKind::ChsSf,
            path: PathBuf::from("sda-chs.sf"),
            contents: None,
            size_bytes: 10,
        };
        assert!(matches!(prepare(&binary, node), Err(Error::Layout(_))));
    }

    #[test]
    fn prepare_raw_ops() {
        let dir = tempfile::tempdir().unwrap();
        let hidden = dir.path().join("sda-hidden-data-after-mbr");
        fs::write(&hidden, vec![0u8; 1024]).unwrap();
        let op = DiskLayoutOp::read(LayoutKind::HiddenDataAfterMbr, &hidden).unwrap();
        let Applicability::Applicable(cmd) = prepare(&op, Path::new("/dev/sdb")).unwrap() else {
            panic!("hidden data should be applicable");
        };
        let args: Vec<String> = cmd.args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(cmd.program, "dd");
        assert!(args.contains(&"seek=512".to_string()));
        assert!(args.contains(&"count=1024".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("conv=fsync"));

        let sgdisk = dir.path().join("sda-pt.sgdisk");
        fs::write(&sgdisk, vec![0u8; 2048]).unwrap();
        let op = DiskLayoutOp::read(LayoutKind::PtSgdisk, &sgdisk).unwrap();
        assert!(matches!(
            prepare(&op, Path::new("/dev/sdb")).unwrap(),
            Applicability::NotApplicable(_)
        ));
    }

    #[test]
    fn k0_falls_through_to_first_working_candidate() {
        let ctx = fast_ctx();
        let applied = Arc::new(AtomicUsize::new(0));
        let resolver = resolver(applied.clone(), 0, 2);
        let ops = vec![
            text_op(LayoutKind::PtParted, "sda-pt.parted", "Model: x\nNumber  Start\n"),
            text_op(LayoutKind::PtSf, "sda-pt.sf", "label: dos\n/dev/sda1 : start=1, size=1\n"),
        ];
        let mut backend = MockLayoutBackend::new();
        let counter = applied.clone();
        backend
            .expect_apply()
            .times(1)
            .withf(|cmd| cmd.kind == LayoutKind::PtSf)
            .returning(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        backend.expect_reread().times(1).return_const(());
        backend.expect_settle().times(1).return_const(());

        apply_layout(&ctx, &resolver, &backend, PartitionMode::K0, &ops, &drive("sdb", 0), 2).unwrap();
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn k0_reports_every_attempt() {
        let ctx = fast_ctx();
        let resolver = resolver(Arc::new(AtomicUsize::new(0)), 1, 1);
        let ops = vec![
            text_op(LayoutKind::PtParted, "sda-pt.parted", "Model: x\n"),
            text_op(LayoutKind::PtSf, "sda-pt.sf", "label: dos\n"),
        ];
        let mut backend = MockLayoutBackend::new();
        backend.expect_apply().returning(|_| Ok(()));
        backend.expect_reread().return_const(());
        backend.expect_settle().return_const(());

        let err = apply_layout(&ctx, &resolver, &backend, PartitionMode::K0, &ops, &drive("sdb", 1), 2)
            .unwrap_err();
        match err {
            Error::PartitionCountMismatch { expected, observed, attempts } => {
                assert_eq!((expected, observed), (2, 1));
                assert_eq!(attempts.len(), 2);
                assert!(attempts[0].starts_with("pt.parted: skipped"));
                assert_eq!(attempts[1], "pt.sf: expected 2, saw 1");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn k_never_writes_and_requires_partitions() {
        let ctx = fast_ctx();
        let ops = vec![text_op(LayoutKind::PtSf, "sda-pt.sf", "label: dos\n")];
        let backend = MockLayoutBackend::new();

        let ready = resolver(Arc::new(AtomicUsize::new(0)), 3, 3);
        apply_layout(&ctx, &ready, &backend, PartitionMode::K, &ops, &drive("sdb", 3), 2).unwrap();

        let short = resolver(Arc::new(AtomicUsize::new(0)), 1, 1);
        let err = apply_layout(&ctx, &short, &backend, PartitionMode::K, &ops, &drive("sdb", 1), 2)
            .unwrap_err();
        assert!(matches!(err, Error::PartitionCountMismatch { observed: 1, .. }));
    }

    #[test]
    fn k2_applies_nothing() {
        let ctx = fast_ctx();
        let resolver = MockDeviceResolver::new();
        let backend = MockLayoutBackend::new();
        let ops = vec![text_op(LayoutKind::PtSf, "sda-pt.sf", "label: dos\n")];
        apply_layout(&ctx, &resolver, &backend, PartitionMode::K2, &ops, &drive("sdb", 0), 2).unwrap();
    }

    #[test]
    fn k1_applies_scaled_layout_only() {
        let ctx = fast_ctx();
        let applied = Arc::new(AtomicUsize::new(0));
        let resolver = resolver(applied.clone(), 0, 1);
        let ops = vec![text_op(
            LayoutKind::PtSf,
            "sda-pt.sf",
            "label: dos\nunit: sectors\n/dev/sda1 : start=2048, size=2048\n",
        )];
        let mut backend = MockLayoutBackend::new();
        let counter = applied.clone();
        backend
            .expect_apply()
            .times(1)
            .withf(|cmd| {
                cmd.kind == LayoutKind::Sfdisk
                    && cmd
                        .input
                        .as_deref()
                        .is_some_and(|s| s.contains("start=2048, size=2095104"))
            })
            .returning(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        backend.expect_reread().return_const(());
        backend.expect_settle().return_const(());

        // drive() reports 1 GiB: 2_097_152 sectors.
        apply_layout(&ctx, &resolver, &backend, PartitionMode::K1, &ops, &drive("sdb", 0), 1).unwrap();
    }

    #[test]
    fn hidden_data_is_applied_after_layout() {
        let ctx = fast_ctx();
        let dir = tempfile::tempdir().unwrap();
        let hidden = dir.path().join("sda-hidden-data-after-mbr");
        fs::write(&hidden, vec![7u8; 4096]).unwrap();
        let ops = vec![
            DiskLayoutOp::read(LayoutKind::HiddenDataAfterMbr, &hidden).unwrap(),
            text_op(LayoutKind::PtSf, "sda-pt.sf", "label: dos\n"),
        ];
        let (main, post) = split_post_layout(ops.clone());
        assert_eq!(main.len(), 1);
        assert_eq!(post.len(), 1);

        let mut backend = MockLayoutBackend::new();
        backend
            .expect_apply()
            .times(1)
            .withf(|cmd| cmd.kind == LayoutKind::HiddenDataAfterMbr)
            .returning(|_| Ok(()));
        apply_post_layout(&ctx, &backend, &ops, Path::new("/dev/sdb")).unwrap();
    }

    #[test]
    fn maps_partitions_by_number() {
        let target = Drive {
            name: "mmcblk0".into(),
            partitions: vec![
                Partition { name: "mmcblk0p2".into(), ..Default::default() },
                Partition { name: "mmcblk0p1".into(), ..Default::default() },
            ],
            ..Default::default()
        };
        let parts = vec!["sda1".to_string(), "sda2".to_string(), "sda3".to_string()];
        let mapping = map_target_partitions(&parts, &target);
        assert_eq!(mapping["sda1"].name, "mmcblk0p1");
        assert_eq!(mapping["sda2"].name, "mmcblk0p2");
        assert!(!mapping.contains_key("sda3"));
    }

    #[test]
    fn wait_for_partitions_names_missing() {
        let ctx = fast_ctx();
        let resolver = resolver(Arc::new(AtomicUsize::new(0)), 1, 1);
        let parts = vec!["sda1".to_string(), "sda2".to_string()];
        let err = wait_for_partitions(&ctx, &resolver, "sdb", &parts, Duration::ZERO).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Partition layout error: timed out waiting for partitions to appear: sda2"
        );

        let mut absent = MockDeviceResolver::new();
        absent.expect_device_by_name().returning(|_| Ok(None));
        let err = wait_for_count(&ctx, &absent, "sdz", 1, Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(ref n) if n == "sdz"));
    }
}
