//! SHA256 comparisons between images, partitions and whole devices.
//!
//! Image data is hashed in process: the volumes are concatenated and fed
//! through the matching decoder. Live partitions are hashed from a `dd`
//! stream, limited to the image's byte count so a larger target partition
//! still compares equal. Each side runs under its own timeout from
//! [`Settings`](crate::config::Settings).
use crate::clone::pair_partitions;
use crate::command::{Output, Pipeline, Stage, StageCommand};
use crate::compression::Compression;
use crate::context::OperationContext;
use crate::device::{DeviceResolver, Drive};
use crate::error::{Error, Result};
use crate::image::plan::{RestorePlan, RestoreTool};
use crate::partition_mode::map_target_partitions;
use crate::progress::{ProgressTracker, Sample};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

/// Bytes hashed between two progress events.
const PROGRESS_STEP: u64 = 16 * 1024 * 1024;

/// A finished hash and the number of bytes it covers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashOutput {
    /// Lowercase hex SHA256.
    pub digest: String,
    pub bytes: u64,
}

/// What a verification pass compared.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Partitions (or devices) whose hashes matched.
    pub verified: Vec<String>,
    /// Partitions saved as partclone images. The partclone stream is not a
    /// byte copy of the partition, so these cannot be compared.
    pub skipped: Vec<String>,
}

impl VerifyReport {
    /// Whether every partition was compared.
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

enum HashEvent {
    Progress(u64),
    Done(io::Result<HashOutput>),
}

enum Waited {
    Done(io::Result<HashOutput>),
    TimedOut(Duration),
    Cancelled,
}

/// Hashes everything `reader` yields, stopping with
/// [`io::ErrorKind::Interrupted`] once `stop` is set.
pub fn hash_reader<R: Read>(
    mut reader: R,
    stop: &AtomicBool,
    mut on_progress: impl FnMut(u64),
) -> io::Result<HashOutput> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut bytes: u64 = 0;
    let mut reported: u64 = 0;
    loop {
        if stop.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "hashing stopped"));
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        bytes += n as u64;
        if bytes - reported >= PROGRESS_STEP {
            reported = bytes;
            on_progress(bytes);
        }
    }
    Ok(HashOutput {
        digest: hex(&hasher.finalize()),
        bytes,
    })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn spawn_hasher<R>(reader: R, stop: Arc<AtomicBool>) -> Receiver<HashEvent>
where
    R: FnOnce(&Sender<HashEvent>, &AtomicBool) -> io::Result<HashOutput> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = reader(&tx, &stop);
        let _ = tx.send(HashEvent::Done(result));
    });
    rx
}

/// Publishes progress until the hasher finishes, the deadline passes, or
/// the job is cancelled.
fn await_hash(
    ctx: &OperationContext,
    events: &Receiver<HashEvent>,
    tracker: &mut ProgressTracker,
    timeout: Option<Duration>,
) -> Waited {
    let deadline = timeout.map(|t| (Instant::now() + t, t));
    let refresh = ctx.settings().progress_refresh();
    ctx.emit(tracker.initial());
    loop {
        if let Some((at, budget)) = deadline
            && Instant::now() >= at
        {
            return Waited::TimedOut(budget);
        }
        if ctx.process_groups().is_terminated() {
            return Waited::Cancelled;
        }
        let wait = match deadline {
            Some((at, _)) => refresh.min(at.saturating_duration_since(Instant::now())),
            None => refresh,
        };
        match events.recv_timeout(wait) {
            Ok(HashEvent::Progress(bytes)) => {
                let sample = Sample {
                    bytes: Some(bytes),
                    ..Sample::default()
                };
                ctx.emit(tracker.observe(sample, Instant::now()));
            }
            Ok(HashEvent::Done(result)) => return Waited::Done(result),
            Err(RecvTimeoutError::Timeout) => ctx.emit(tracker.tick()),
            Err(RecvTimeoutError::Disconnected) => {
                return Waited::Done(Err(io::Error::other("hash worker exited")));
            }
        }
    }
}

/// Hashes the decompressed contents of an image's volumes.
///
/// # Errors
///
/// [`Error::HashTimeout`] when the configured image budget runs out, and
/// [`Error::Io`] when a volume cannot be read or decoded.
pub fn image_sha256(
    ctx: &OperationContext,
    volumes: &[PathBuf],
    compression: Option<Compression>,
    title: &str,
) -> Result<HashOutput> {
    if volumes.is_empty() {
        return Err(Error::ImageFormat("no image files to hash".to_string()));
    }
    let files = volumes
        .iter()
        .map(File::open)
        .collect::<io::Result<Vec<File>>>()?;
    debug!(volumes = volumes.len(), ?compression, "Hashing image");

    let stop = Arc::new(AtomicBool::new(false));
    let events = spawn_hasher(
        move |tx: &Sender<HashEvent>, stop: &AtomicBool| {
            let stream = files
                .into_iter()
                .fold(Box::new(io::empty()) as Box<dyn Read + Send>, |acc, file| {
                    Box::new(acc.chain(file))
                });
            let reader: Box<dyn Read> = match compression {
                Some(compression) => compression.decoder(stream)?,
                None => stream,
            };
            hash_reader(reader, stop, |n| {
                let _ = tx.send(HashEvent::Progress(n));
            })
        },
        stop.clone(),
    );

    let mut tracker = ProgressTracker::new(title, Some("image".to_string()), None);
    match await_hash(ctx, &events, &mut tracker, ctx.settings().image_hash_timeout()) {
        Waited::Done(result) => Ok(result?),
        Waited::TimedOut(timeout) => {
            stop.store(true, Ordering::SeqCst);
            Err(Error::HashTimeout {
                target: volumes[0].display().to_string(),
                timeout,
            })
        }
        Waited::Cancelled => {
            stop.store(true, Ordering::SeqCst);
            Err(Error::Cancelled)
        }
    }
}

/// Hashes a device node, limited to `limit` bytes when given.
///
/// # Errors
///
/// [`Error::HashTimeout`] when the configured partition budget runs out;
/// the `dd` process group is killed first. [`Error::CommandFailed`] when
/// `dd` cannot read the node.
pub fn partition_sha256(
    ctx: &OperationContext,
    node: &Path,
    limit: Option<u64>,
    title: &str,
) -> Result<HashOutput> {
    let mut dd = StageCommand::tool(Stage::Hash, "dd")?
        .arg(format!("if={}", node.display()))
        .args(["bs=4M", "status=none"]);
    if let Some(limit) = limit {
        dd = dd.arg(format!("count={limit}")).arg("iflag=count_bytes");
    }
    let mut running = Pipeline::new()
        .stage(dd)
        .stdout(Output::Piped)
        .spawn(ctx.process_groups())?;
    let stdout = running
        .take_stdout()
        .ok_or_else(|| io::Error::other("dd output unavailable"))?;

    let stop = Arc::new(AtomicBool::new(false));
    let events = spawn_hasher(
        move |tx: &Sender<HashEvent>, stop: &AtomicBool| {
            hash_reader(stdout, stop, |n| {
                let _ = tx.send(HashEvent::Progress(n));
            })
        },
        stop.clone(),
    );

    let mut tracker = ProgressTracker::new(title, Some(node.display().to_string()), limit);
    match await_hash(ctx, &events, &mut tracker, ctx.settings().partition_hash_timeout()) {
        Waited::Done(result) => {
            running.wait()?;
            Ok(result?)
        }
        Waited::TimedOut(timeout) => {
            stop.store(true, Ordering::SeqCst);
            running.kill();
            warn!(node = %node.display(), timeout_secs = timeout.as_secs(), "Partition hash timed out");
            Err(Error::HashTimeout {
                target: node.display().to_string(),
                timeout,
            })
        }
        Waited::Cancelled => {
            stop.store(true, Ordering::SeqCst);
            running.kill();
            Err(Error::Cancelled)
        }
    }
}

/// Compares every raw partition image of `plan` with the partition of the
/// same number on `device`.
///
/// partclone images are listed in [`VerifyReport::skipped`].
///
/// # Errors
///
/// Stops at the first mismatch ([`Error::HashMismatch`]) or hashing error.
/// [`Error::NothingVerified`] when every partition had to be skipped.
pub fn verify_image(
    ctx: &OperationContext,
    resolver: &dyn DeviceResolver,
    plan: &RestorePlan,
    device: &str,
) -> Result<VerifyReport> {
    let drive = resolver
        .device_by_name(device)?
        .ok_or_else(|| Error::DeviceNotFound(device.to_string()))?;
    if !resolver.unmount(&drive) {
        return Err(Error::UnmountFailed(drive.name.clone()));
    }
    let targets = map_target_partitions(plan.parts(), &drive);

    let mut report = VerifyReport::default();
    let total = plan.partition_ops().len();
    for (index, op) in plan.partition_ops().iter().enumerate() {
        if op.tool == RestoreTool::Partclone {
            warn!(partition = %op.partition, "partclone image cannot be compared byte for byte; skipping");
            report.skipped.push(op.partition.clone());
            continue;
        }
        let part = targets.get(&op.partition).ok_or_else(|| {
            Error::PartitionMapping(format!("missing target partition for {}", op.partition))
        })?;
        let node = resolver.resolve_node(&part.name);
        let step = format!("V {}/{}", index + 1, total);

        ctx.set_scale(index as f64 / total as f64, 0.5 / total as f64);
        let image = image_sha256(ctx, &op.volumes, op.compression, &format!("{step} IMG"))?;
        ctx.set_scale((index as f64 + 0.5) / total as f64, 0.5 / total as f64);
        let live = partition_sha256(ctx, &node, Some(image.bytes), &format!("{step} DST"))?;

        if image.digest != live.digest {
            error!(partition = %op.partition, image = %image.digest, device = %live.digest, "Verify mismatch");
            return Err(Error::HashMismatch {
                partition: op.partition.clone(),
            });
        }
        info!(partition = %op.partition, digest = %image.digest, bytes = image.bytes, "Partition verified");
        report.verified.push(op.partition.clone());
    }
    ctx.reset_scale();
    if report.verified.is_empty() && !report.skipped.is_empty() {
        error!(skipped = ?report.skipped, "No partition could be verified");
        return Err(Error::NothingVerified {
            skipped: report.skipped,
        });
    }
    Ok(report)
}

/// Compares an `.iso` file with the first bytes of the drive named
/// `device` it was written to.
///
/// # Errors
///
/// [`Error::HashMismatch`] naming the drive when the bytes differ, or any
/// hashing error.
pub fn verify_iso(
    ctx: &OperationContext,
    resolver: &dyn DeviceResolver,
    iso: &Path,
    device: &str,
) -> Result<VerifyReport> {
    let drive = resolver
        .device_by_name(device)?
        .ok_or_else(|| Error::DeviceNotFound(device.to_string()))?;
    let node = resolver.resolve_node(&drive.name);

    ctx.set_scale(0.0, 0.5);
    let image = image_sha256(ctx, &[iso.to_path_buf()], None, "V ISO")?;
    ctx.set_scale(0.5, 0.5);
    let live = partition_sha256(ctx, &node, Some(image.bytes), "V DST")?;
    ctx.reset_scale();
    if image.digest != live.digest {
        error!(iso = %iso.display(), device = %node.display(), "Verify mismatch");
        return Err(Error::HashMismatch {
            partition: drive.name,
        });
    }
    info!(iso = %iso.display(), digest = %image.digest, "ISO verified");
    Ok(VerifyReport {
        verified: vec![drive.name],
        skipped: Vec::new(),
    })
}

/// Compares `source` with `target` partition by partition, or as whole
/// devices when the source has no partitions.
///
/// # Errors
///
/// Stops at the first mismatch ([`Error::HashMismatch`]) or hashing error.
pub fn verify_devices(
    ctx: &OperationContext,
    resolver: &dyn DeviceResolver,
    source: &Drive,
    target: &Drive,
) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    if source.partitions.is_empty() {
        let limit = (source.size_bytes > 0).then_some(source.size_bytes);
        compare_nodes(
            ctx,
            &resolver.resolve_node(&source.name),
            &resolver.resolve_node(&target.name),
            limit,
            &source.name,
            "VERIFY",
        )?;
        report.verified.push(source.name.clone());
        ctx.reset_scale();
        return Ok(report);
    }

    let pairs = pair_partitions(source, target)?;
    let total = pairs.len();
    for (index, (src, dst)) in pairs.iter().enumerate() {
        ctx.set_scale(index as f64 / total as f64, 1.0 / total as f64);
        let limit = (src.size_bytes > 0).then_some(src.size_bytes);
        compare_nodes(
            ctx,
            &resolver.resolve_node(&src.name),
            &resolver.resolve_node(&dst.name),
            limit,
            &src.name,
            &format!("V {}/{}", index + 1, total),
        )?;
        report.verified.push(src.name.clone());
    }
    ctx.reset_scale();
    info!(partitions = report.verified.len(), "Verify complete: all partitions match");
    Ok(report)
}

fn compare_nodes(
    ctx: &OperationContext,
    source: &Path,
    target: &Path,
    limit: Option<u64>,
    name: &str,
    step: &str,
) -> Result<()> {
    info!(source = %source.display(), target = %target.display(), "Verifying");
    let src = partition_sha256(ctx, source, limit, &format!("{step} SRC"))?;
    let dst = partition_sha256(ctx, target, limit, &format!("{step} DST"))?;
    if src.digest != dst.digest {
        error!(source = %source.display(), target = %target.display(), "Verify mismatch");
        return Err(Error::HashMismatch {
            partition: name.to_string(),
        });
    }
    Ok(())
}
