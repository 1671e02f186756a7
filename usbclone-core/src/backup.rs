//! Saves a drive as a Clonezilla image directory.
//!
//! The main entry point is the [`run`] function, which:
//! 1.  Unmounts the source drive.
//! 2.  Saves the partition table in every dialect a restore may need
//!     (`pt.sf`, `pt.parted`, `pt.sgdisk`, the MBR sector and, for DOS
//!     tables, the data hidden between the MBR and the first partition).
//! 3.  Writes the `parts` and `disk` metadata files.
//! 4.  Streams every partition through
//!     `partclone.<fs> -c | [compressor] | [split]` (or `dd`) into the image.
//!
//! A failed backup removes the partially written image directory.
use crate::command::{Output, Pipeline, Stage, StageCommand, find_first, partclone_tool, run_checked};
use crate::compression::Compression;
use crate::config::Settings;
use crate::context::OperationContext;
use crate::device::{DeviceResolver, Partition};
use crate::error::{Error, Result};
use crate::image::plan::build_plan;
use crate::partition_mode::LayoutBackend;
use crate::platform;
use crate::progress::Progress;
use crate::table::sfdisk::SfdiskDump;
use crate::verify::{VerifyReport, verify_image};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const MBR_SIZE: u64 = 512;

/// What to back up and how to store it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupOptions {
    /// Partition names to save. `None` saves every partition.
    pub partitions: Option<Vec<String>>,
    pub compression: Option<Compression>,
    /// Volume size in MiB. `None` writes one file per partition.
    pub split_size_mb: Option<u64>,
}

impl BackupOptions {
    /// Every partition, with the configured compression and volume size.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            partitions: None,
            compression: settings.compression,
            split_size_mb: settings.split_size(),
        }
    }
}

/// A finished backup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupResult {
    pub image_dir: PathBuf,
    pub partitions: Vec<String>,
    /// Bytes of partition data written, after compression.
    pub total_bytes: u64,
    pub compression: Option<Compression>,
    pub elapsed: Duration,
}

/// Backs up the drive named `source` into `image_dir`.
///
/// # Errors
///
/// [`Error::PermissionDenied`] when not running as root,
/// [`Error::ImageFormat`] when `image_dir` already holds files, and any
/// failure of the table dump or a partition pipeline.
pub fn run(
    ctx: &OperationContext,
    resolver: &dyn DeviceResolver,
    backend: &dyn LayoutBackend,
    source: &str,
    image_dir: &Path,
    options: &BackupOptions,
) -> Result<BackupResult> {
    platform::require_root()?;
    backup_to(ctx, resolver, backend, source, image_dir, options)
}

fn backup_to(
    ctx: &OperationContext,
    resolver: &dyn DeviceResolver,
    backend: &dyn LayoutBackend,
    source: &str,
    image_dir: &Path,
    options: &BackupOptions,
) -> Result<BackupResult> {
    let _guard = ctx.span().enter();
    let started = Instant::now();
    if let Some(compression) = options.compression {
        find_first(compression.programs())?;
    }

    let drive = resolver
        .device_by_name(source)?
        .ok_or_else(|| Error::DeviceNotFound(source.to_string()))?;
    let node = resolver.resolve_node(&drive.name);
    if !resolver.unmount(&drive) {
        error!(device = %drive.name, "Failed to unmount device; aborting backup");
        return Err(Error::UnmountFailed(drive.name.clone()));
    }

    let partitions = select_partitions(&drive.partitions, options.partitions.as_deref())?;
    if dir_has_entries(image_dir)? {
        return Err(Error::ImageFormat(format!(
            "image folder is not empty: {}",
            image_dir.display()
        )));
    }
    fs::create_dir_all(image_dir)?;
    info!(
        device = %node.display(),
        image = %image_dir.display(),
        partitions = partitions.len(),
        compression = ?options.compression,
        "Starting backup"
    );

    let written = write_image(ctx, resolver, backend, &drive.name, &node, &partitions, image_dir, options);
    let total_bytes = match written {
        Ok(total) => total,
        Err(e) => {
            error!(error = %e, "Backup failed");
            cleanup_partial_backup(image_dir);
            return Err(e);
        }
    };

    ctx.reset_scale();
    ctx.emit(Progress::new(vec!["Backup complete".to_string()], Some(1.0)));
    let result = BackupResult {
        image_dir: image_dir.to_path_buf(),
        partitions: partitions.iter().map(|p| p.name.clone()).collect(),
        total_bytes,
        compression: options.compression,
        elapsed: started.elapsed(),
    };
    info!(
        image = %image_dir.display(),
        bytes = result.total_bytes,
        elapsed_secs = result.elapsed.as_secs(),
        "Backup complete"
    );
    Ok(result)
}

fn select_partitions(all: &[Partition], wanted: Option<&[String]>) -> Result<Vec<Partition>> {
    let selected: Vec<Partition> = match wanted {
        None => all.to_vec(),
        Some(names) => {
            let missing: Vec<&str> = names
                .iter()
                .filter(|name| !all.iter().any(|p| &p.name == *name))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(Error::PartitionMapping(format!(
                    "partitions not found: {}",
                    missing.join(", ")
                )));
            }
            all.iter()
                .filter(|p| names.contains(&p.name))
                .cloned()
                .collect()
        }
    };
    if selected.is_empty() {
        return Err(Error::PartitionMapping("no partitions to back up".to_string()));
    }
    Ok(selected)
}

fn dir_has_entries(dir: &Path) -> Result<bool> {
    if !dir.exists() {
        return Ok(false);
    }
    Ok(fs::read_dir(dir)?.next().is_some())
}

/// Removes a partially written image directory.
pub fn cleanup_partial_backup(image_dir: &Path) {
    if !image_dir.is_dir() {
        return;
    }
    match fs::remove_dir_all(image_dir) {
        Ok(()) => info!(image = %image_dir.display(), "Cleaned up partial backup"),
        Err(e) => error!(image = %image_dir.display(), error = %e, "Failed to clean up partial backup"),
    }
}

#[allow(clippy::too_many_arguments)]
fn write_image(
    ctx: &OperationContext,
    resolver: &dyn DeviceResolver,
    backend: &dyn LayoutBackend,
    device: &str,
    node: &Path,
    partitions: &[Partition],
    image_dir: &Path,
    options: &BackupOptions,
) -> Result<u64> {
    ctx.emit(Progress::new(vec!["Saving partition table...".to_string()], Some(0.0)));
    save_partition_tables(backend, device, node, image_dir)?;

    let names: Vec<&str> = partitions.iter().map(|p| p.name.as_str()).collect();
    fs::write(image_dir.join("parts"), format!("{}\n", names.join(" ")))?;
    fs::write(image_dir.join("disk"), format!("{device}\n"))?;

    let total = partitions.len();
    let mut written = 0;
    for (index, part) in partitions.iter().enumerate() {
        ctx.set_scale(index as f64 / total as f64, 1.0 / total as f64);
        let title = format!("{} ({}/{})", part.display_name(), index + 1, total);
        let part_node = resolver.resolve_node(&part.name);
        let files = backup_partition(ctx, part, &part_node, image_dir, options, &title)?;
        for file in &files {
            written += fs::metadata(file)?.len();
        }
        debug!(partition = %part.name, files = files.len(), "Partition saved");
    }
    Ok(written)
}

/// Writes `<dev>-pt.sf` (required) and the best-effort dialects.
fn save_partition_tables(
    backend: &dyn LayoutBackend,
    device: &str,
    node: &Path,
    image_dir: &Path,
) -> Result<()> {
    let dump = backend.dump_table(node)?;
    fs::write(image_dir.join(format!("{device}-pt.sf")), &dump)?;
    let table = SfdiskDump::parse(&dump);

    let parted = StageCommand::tool(Stage::Probe, "parted").and_then(|cmd| {
        run_checked(
            &cmd.args(["-m", "-s"]).arg(node).args(["unit", "s", "print"]),
            None,
        )
    });
    match parted {
        Ok(text) => fs::write(image_dir.join(format!("{device}-pt.parted")), text)?,
        Err(e) => warn!(error = %e, "Failed to save parted partition table"),
    }

    if table.is_gpt() {
        let backup = image_dir.join(format!("{device}-pt.sgdisk"));
        let saved = StageCommand::tool(Stage::Probe, "sgdisk").and_then(|cmd| {
            run_checked(
                &cmd.arg(format!("--backup={}", backup.display())).arg(node),
                None,
            )
        });
        if let Err(e) = saved {
            warn!(error = %e, "Failed to save sgdisk partition table");
        }
    }

    let mut device_file = File::open(node)?;
    let mbr = read_range(&mut device_file, 0, MBR_SIZE)?;
    fs::write(image_dir.join(format!("{device}-mbr")), mbr)?;

    if table.label.as_deref() == Some("dos") {
        if let Some(len) = hidden_data_len(&table) {
            let hidden = read_range(&mut device_file, MBR_SIZE, len)?;
            fs::write(image_dir.join(format!("{device}-hidden-data-after-mbr")), hidden)?;
        }
    }
    Ok(())
}

/// Bytes between the MBR sector and the first partition.
fn hidden_data_len(table: &SfdiskDump) -> Option<u64> {
    let first = table.entries.iter().filter_map(|e| e.start()).min()?;
    let len = first.checked_sub(1)?.checked_mul(table.sector_size)?;
    (len > 0).then_some(len)
}

fn read_range(file: &mut File, offset: u64, len: u64) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.take(len).read_to_end(&mut buf)?;
    Ok(buf)
}

/// The image file name for a partition, before any split suffix.
pub fn image_file_name(partition: &str, fstype: Option<&str>, compression: Option<Compression>) -> String {
    let base = match fstype {
        Some(fs) => format!("{partition}.{fs}-ptcl-img"),
        None => format!("{partition}.dd-img"),
    };
    match compression {
        Some(c) => format!("{base}.{}", c.extension()),
        None => base,
    }
}

/// Builds the pipeline saving one partition to `base` (a path inside the
/// image directory). With splitting the pipeline writes `base.aa`,
/// `base.ab` and so on; otherwise it writes `base` itself.
pub fn backup_pipeline(
    part_node: &Path,
    partclone: Option<PathBuf>,
    base: &Path,
    options: &BackupOptions,
) -> Result<Pipeline> {
    let capture = match partclone {
        Some(tool) => StageCommand::new(Stage::Capture, tool)
            .args(["-c", "-s"])
            .arg(part_node)
            .args(["-o", "-"]),
        None => StageCommand::tool(Stage::Capture, "dd")?
            .arg(format!("if={}", part_node.display()))
            .args(["bs=64K", "status=progress"]),
    };
    let mut pipeline = Pipeline::new().stage(capture);
    if let Some(compression) = options.compression {
        pipeline = pipeline.stage(
            StageCommand::new(Stage::Compress, find_first(compression.programs())?)
                .args(compression.compress_args()),
        );
    }
    pipeline = match options.split_size_mb {
        Some(mb) => pipeline.stage(
            StageCommand::tool(Stage::Split, "split")?
                .args(["-b".to_string(), format!("{mb}M"), "-".to_string()])
                .arg(format!("{}.", base.display())),
        ),
        None => pipeline.stdout(Output::File(File::create(base)?)),
    };
    Ok(pipeline.monitor(Stage::Capture))
}

fn backup_partition(
    ctx: &OperationContext,
    part: &Partition,
    part_node: &Path,
    image_dir: &Path,
    options: &BackupOptions,
    title: &str,
) -> Result<Vec<PathBuf>> {
    let fstype = part.fstype.as_deref().map(str::to_ascii_lowercase);
    let partclone = fstype.as_deref().and_then(partclone_tool);
    let name = image_file_name(
        &part.name,
        partclone.as_ref().and(fstype.as_deref()),
        options.compression,
    );
    let base = image_dir.join(&name);
    info!(
        partition = %part.name,
        node = %part_node.display(),
        tool = if partclone.is_some() { "partclone" } else { "dd" },
        file = %name,
        "Backing up partition"
    );

    let total = (part.size_bytes > 0).then_some(part.size_bytes);
    backup_pipeline(part_node, partclone, &base, options)?.run(ctx, title, Some(part.summary()), total)?;

    let mut files: Vec<PathBuf> = fs::read_dir(image_dir)?
        .flatten()
        .filter(|e| {
            let file = e.file_name().to_string_lossy().into_owned();
            file == name || file.starts_with(&format!("{name}."))
        })
        .map(|e| e.path())
        .collect();
    files.sort();
    Ok(files)
}

/// Checks a fresh image against the drive it was taken from.
///
/// # Errors
///
/// As [`verify_image`].
pub fn verify_backup(
    ctx: &OperationContext,
    resolver: &dyn DeviceResolver,
    source: &str,
    image_dir: &Path,
) -> Result<VerifyReport> {
    let plan = build_plan(image_dir)?;
    verify_image(ctx, resolver, &plan, source)
}
