mod job;
mod logging;
mod terminal;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use std::path::{Path, PathBuf};
use usbclone_core::backup::{self, BackupOptions};
use usbclone_core::clone::{self, CloneJob, CloneMode};
use usbclone_core::compression::Compression;
use usbclone_core::config::Settings;
use usbclone_core::context::ProcessGroups;
use usbclone_core::device::{DeviceResolver, Drive, human_size};
use usbclone_core::erase::{self, EraseMode};
use usbclone_core::image::plan::build_plan;
use usbclone_core::image::{self, ClonezillaImage};
use usbclone_core::partition_mode::{PartitionMode, SystemLayoutBackend};
use usbclone_core::platform::{self, LsblkResolver};
use usbclone_core::restore;
use usbclone_core::verify::{VerifyReport, verify_image, verify_iso};

use crate::logging::LogConfig;
use crate::terminal::TermRestorer;

#[derive(Parser)]
#[command(name = "usbclone")]
#[command(about = "Clone, back up, restore and verify removable disks", version)]
struct Cli {
    /// Settings file (default: /etc/usbclone.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available removable devices
    List,
    /// List the images in a repository
    Images {
        /// Repository folder. Searched on mounted removable drives if omitted.
        repo: Option<PathBuf>,
    },
    /// Show what an image contains and how much space it needs
    Inspect {
        #[arg(required = true)]
        image: PathBuf,
    },
    /// Restore an image folder, or write an .iso file, onto a device
    Restore {
        #[arg(required = true)]
        image: PathBuf,

        /// Target device, e.g. sdb. Prompted for if omitted.
        #[arg(short, long)]
        target: Option<String>,

        /// Partition table mode: k0 (image table), k (keep target table),
        /// k1 (scale proportionally) or k2 (skip table)
        #[arg(short, long, default_value = "k0")]
        mode: PartitionMode,

        /// Verify raw partitions against the image afterwards
        #[arg(long)]
        verify: bool,

        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Back up a device into a new image folder
    Backup {
        /// Image folder to create
        #[arg(required = true)]
        output: PathBuf,

        /// Source device, e.g. sdb. Prompted for if omitted.
        #[arg(short, long)]
        source: Option<String>,

        /// Only these partitions (comma separated)
        #[arg(short, long, value_delimiter = ',')]
        partitions: Vec<String>,

        /// gzip, zstd or xz (default from settings)
        #[arg(short, long, conflicts_with = "no_compress")]
        compression: Option<Compression>,

        /// Store partitions uncompressed
        #[arg(long)]
        no_compress: bool,

        /// Volume size in MiB, 0 for a single file (default from settings)
        #[arg(long)]
        split_mb: Option<u64>,

        /// Verify raw partitions against the image afterwards
        #[arg(long)]
        verify: bool,

        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Copy one device onto another
    Clone {
        /// Source device. Prompted for if omitted.
        #[arg(short, long)]
        source: Option<String>,

        /// Target device. Prompted for if omitted.
        #[arg(short, long)]
        target: Option<String>,

        /// smart (table + used blocks), exact (whole device) or verify
        /// (smart, then compare hashes)
        #[arg(short, long, default_value = "smart")]
        mode: CloneMode,

        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Wipe a removable device
    Erase {
        /// Device to erase, e.g. sdb. Prompted for if omitted.
        #[arg(short, long)]
        device: Option<String>,

        /// quick (signatures and both ends), zero (whole device), secure
        /// (shred) or discard (TRIM)
        #[arg(short, long, default_value = "quick")]
        mode: EraseMode,

        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Compare an image with the device it was restored to or taken from
    Verify {
        #[arg(required = true)]
        image: PathBuf,

        /// Device to compare. Prompted for if omitted.
        #[arg(short, long)]
        device: Option<String>,
    },
}

/// Presents an interactive menu for the user to select a drive.
fn select_drive(drives: &[Drive], prompt: &str) -> Result<Drive> {
    if drives.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = drives.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(drives[selection].clone())
}

/// Resolves a drive given on the command line, or asks for one.
fn pick_drive(resolver: &LsblkResolver, name: Option<&str>, prompt: &str) -> Result<Drive> {
    match name {
        Some(name) => resolver
            .device_by_name(name)?
            .ok_or_else(|| anyhow!("Device '{name}' not found.")),
        None => select_drive(&platform::list_removable_drives(resolver)?, prompt),
    }
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

/// Prints what was compared. Fails when any partition was left out.
fn print_report(report: &VerifyReport) -> Result<()> {
    for name in &report.verified {
        println!("  {} {}", style("✔").green(), name);
    }
    for name in &report.skipped {
        println!("  {} {} (partclone image, not compared)", style("-").yellow(), name);
    }
    if report.is_complete() {
        Ok(())
    } else {
        Err(anyhow!(
            "verification incomplete: {} not compared",
            report.skipped.join(", ")
        ))
    }
}

fn print_image(image: &ClonezillaImage) -> Result<()> {
    let plan = build_plan(&image.path)?;
    println!("Image:      {}", style(&image.name).cyan());
    println!("Path:       {}", image.path.display());
    println!("Partitions: {}", image.parts.join(" "));
    match &image.partition_table {
        Some(table) => println!("Table:      {}", table.display()),
        None => println!("Table:      (none)"),
    }
    match plan.required_size()? {
        Some(bytes) => println!("Needs:      {}", human_size(bytes)),
        None => println!("Needs:      (unknown)"),
    }
    println!("On disk:    {}", human_size(image.size_on_disk()?));
    println!();
    println!("  {:<12} {:<10} {:<8} {:<6} VOLUMES", "PARTITION", "TOOL", "FS", "COMP");
    println!("  {:-<12} {:-<10} {:-<8} {:-<6} {:-<7}", "", "", "", "", "");
    for op in plan.partition_ops() {
        println!(
            "  {:<12} {:<10} {:<8} {:<6} {}",
            op.partition,
            op.tool.to_string(),
            op.fstype.as_deref().unwrap_or("-"),
            op.compression.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
            op.volumes.len()
        );
    }
    Ok(())
}

fn list_images(repo: &Path) {
    let dirs = image::list_image_dirs(repo);
    let isos = image::list_iso_files(repo);
    if dirs.is_empty() && isos.is_empty() {
        println!("No images found in {}.", repo.display());
        return;
    }
    println!("Images in {}:", style(repo.display()).cyan());
    for dir in dirs {
        match ClonezillaImage::load(&dir) {
            Ok(img) => {
                let size = img.size_on_disk().map(human_size).unwrap_or_else(|_| "?".into());
                println!("  {:<32} {:>9}  {}", img.name, size, img.parts.join(" "));
            }
            Err(e) => println!("  {:<32} {}", dir.display(), style(e).red()),
        }
    }
    for iso in isos {
        let name = iso.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let size = std::fs::metadata(&iso).map(|m| human_size(m.len())).unwrap_or_else(|_| "?".into());
        println!("  {:<32} {:>9}  {}", name, size, style("ISO").yellow());
    }
}

fn main() -> Result<()> {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let cli = Cli::parse();
    logging::init(LogConfig {
        json: cli.json_logs,
        verbose: cli.verbose,
    });
    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;

    // Ctrl+C kills the running pipeline; the job then fails on its own.
    let groups = ProcessGroups::new();
    let handler_groups = groups.clone();
    ctrlc::set_handler(move || {
        eprintln!("\n{} cancelling...", style("Interrupted:").yellow().bold());
        handler_groups.terminate_all();
    })?;

    let resolver = LsblkResolver::new();

    match cli.command {
        Commands::List => {
            let drives = platform::list_removable_drives(&resolver)?;
            if drives.is_empty() {
                println!("No removable devices found.");
                return Ok(());
            }

            println!("Found {} removable devices:", drives.len());
            println!(
                "\n  {:<15} {:>8} {:<24} {}",
                "DEVICE", "SIZE", "MODEL", "LOCATION"
            );
            println!("  {:-<15} {:-<8} {:-<24} {:-<20}", "", "", "", "");
            for drive in drives {
                println!("  {drive}");
                for part in &drive.partitions {
                    println!("    {:<13} {}", part.name, part.summary());
                }
            }
        }
        Commands::Images { repo } => match repo {
            Some(repo) => list_images(&repo),
            None => {
                let repos: Vec<PathBuf> = platform::list_removable_drives(&resolver)?
                    .iter()
                    .filter_map(image::find_image_repository)
                    .collect();
                if repos.is_empty() {
                    println!("No image repository found on mounted removable drives.");
                }
                for repo in repos {
                    list_images(&repo);
                }
            }
        },
        Commands::Inspect { image } => {
            let image = ClonezillaImage::load(&image)
                .with_context(|| format!("failed to read image {}", image.display()))?;
            print_image(&image)?;
        }
        Commands::Restore {
            image,
            target,
            verify,
            yes,
            ..
        } if image::is_iso_file(&image) => {
            let drive = pick_drive(&resolver, target.as_deref(), "Select the target device to WRITE the ISO to")?;
            println!(
                "{} This will erase all data on '{}' ({}).",
                style("WARNING:").red().bold(),
                drive.name,
                human_size(drive.size_bytes),
            );
            println!("  Device: {}", style(drive.node().display()).cyan());
            println!("  ISO:    {}", style(image.display()).cyan());
            println!();

            if !confirm_operation("Are you sure you want to proceed?", yes)? {
                println!("Restore cancelled.");
                return Ok(());
            }
            println!();

            let target = drive.name.clone();
            let iso = image.clone();
            let (written, report) = job::run("restore-iso", settings, &groups, move |ctx| {
                let written = restore::run_iso(ctx, &resolver, &iso, &target)?;
                let report = if verify {
                    Some(verify_iso(ctx, &resolver, &iso, &target)?)
                } else {
                    None
                };
                Ok((written, report))
            })?;

            println!(
                "\n✨ Wrote {} ({}) to {}.",
                style(image.display()).cyan(),
                human_size(written),
                style(drive.node().display()).cyan()
            );
            if let Some(report) = report {
                print_report(&report)?;
            }
        }
        Commands::Restore {
            image,
            target,
            mode,
            verify,
            yes,
        } => {
            let plan = build_plan(&image)
                .with_context(|| format!("failed to read image {}", image.display()))?;
            let drive = pick_drive(&resolver, target.as_deref(), "Select the target device to RESTORE to")?;

            println!(
                "{} This will erase all data on '{}' ({}).",
                style("WARNING:").red().bold(),
                drive.name,
                human_size(drive.size_bytes),
            );
            println!("  Device: {}", style(drive.node().display()).cyan());
            println!("  Image:  {}", style(image.display()).cyan());
            println!("  Mode:   {}", style(mode).cyan());
            println!();

            if !confirm_operation("Are you sure you want to proceed?", yes)? {
                println!("Restore cancelled.");
                return Ok(());
            }
            println!();

            let target = drive.name.clone();
            let report = job::run("restore", settings, &groups, move |ctx| {
                restore::run(ctx, &resolver, &SystemLayoutBackend, &plan, &target, mode)?;
                if verify {
                    verify_image(ctx, &resolver, &plan, &target).map(Some)
                } else {
                    Ok(None)
                }
            })?;

            println!(
                "\n✨ Successfully restored {} to {}.",
                style(image.display()).cyan(),
                style(drive.node().display()).cyan()
            );
            if let Some(report) = report {
                print_report(&report)?;
            }
        }
        Commands::Backup {
            output,
            source,
            partitions,
            compression,
            no_compress,
            split_mb,
            verify,
            yes,
        } => {
            let drive = pick_drive(&resolver, source.as_deref(), "Select the source device to BACK UP")?;
            let mut options = BackupOptions::from_settings(&settings);
            if !partitions.is_empty() {
                options.partitions = Some(partitions);
            }
            if no_compress {
                options.compression = None;
            } else if compression.is_some() {
                options.compression = compression;
            }
            if let Some(mb) = split_mb {
                options.split_size_mb = (mb > 0).then_some(mb);
            }

            println!(
                "This will back up '{}' ({}).",
                drive.name,
                human_size(drive.size_bytes)
            );
            println!("  Device: {}", style(drive.node().display()).cyan());
            println!("  Output: {}", style(output.display()).cyan());
            match options.compression {
                Some(c) => println!("  Compression: {}", style(c).cyan()),
                None => println!("  Compression: {}", style("none").cyan()),
            }
            println!();

            if !confirm_operation("Are you sure you want to proceed?", yes)? {
                println!("Backup cancelled.");
                return Ok(());
            }
            println!();

            let source = drive.name.clone();
            let image_dir = output.clone();
            let (result, report) = job::run("backup", settings, &groups, move |ctx| {
                let result = backup::run(ctx, &resolver, &SystemLayoutBackend, &source, &image_dir, &options)?;
                let report = if verify {
                    Some(backup::verify_backup(ctx, &resolver, &source, &image_dir)?)
                } else {
                    None
                };
                Ok((result, report))
            })?;

            println!(
                "\n✨ Saved {} partition(s) from {} to {} ({} in {}s).",
                result.partitions.len(),
                style(drive.node().display()).cyan(),
                style(result.image_dir.display()).cyan(),
                human_size(result.total_bytes),
                result.elapsed.as_secs()
            );
            if let Some(report) = report {
                print_report(&report)?;
            }
        }
        Commands::Clone {
            source,
            target,
            mode,
            yes,
        } => {
            let source = pick_drive(&resolver, source.as_deref(), "Select the SOURCE device")?;
            let target = pick_drive(&resolver, target.as_deref(), "Select the TARGET device")?;
            let clone_job = CloneJob::new(source, target, mode, "clone")?;

            println!(
                "{} This will erase all data on '{}' ({}).",
                style("WARNING:").red().bold(),
                clone_job.target().name,
                human_size(clone_job.target().size_bytes),
            );
            println!("  Source: {}", style(clone_job.source().node().display()).cyan());
            println!("  Target: {}", style(clone_job.target().node().display()).cyan());
            println!("  Mode:   {}", style(mode).cyan());
            println!();

            if !confirm_operation("Are you sure you want to proceed?", yes)? {
                println!("Clone cancelled.");
                return Ok(());
            }
            println!();

            let (source_node, target_node) = (clone_job.source().node(), clone_job.target().node());
            let report = job::run("clone", settings, &groups, move |ctx| {
                clone::run(ctx, &resolver, &SystemLayoutBackend, &clone_job)
            })?;

            println!(
                "\n✨ Successfully cloned {} to {}.",
                style(source_node.display()).cyan(),
                style(target_node.display()).cyan()
            );
            if let Some(report) = report {
                print_report(&report)?;
            }
        }
        Commands::Erase { device, mode, yes } => {
            let drive = pick_drive(&resolver, device.as_deref(), "Select the device to ERASE")?;
            println!(
                "{} This will destroy all data on '{}' ({}).",
                style("WARNING:").red().bold(),
                drive.name,
                human_size(drive.size_bytes),
            );
            println!("  Device: {}", style(drive.node().display()).cyan());
            println!("  Mode:   {}", style(mode).cyan());
            println!();

            if !confirm_operation("Are you sure you want to proceed?", yes)? {
                println!("Erase cancelled.");
                return Ok(());
            }
            println!();

            let name = drive.name.clone();
            job::run("erase", settings, &groups, move |ctx| {
                erase::run(ctx, &resolver, &name, mode)
            })?;
            println!("\n✨ Erased {}.", style(drive.node().display()).cyan());
        }
        Commands::Verify { image, device } => {
            let plan = build_plan(&image)
                .with_context(|| format!("failed to read image {}", image.display()))?;
            let drive = pick_drive(&resolver, device.as_deref(), "Select the device to VERIFY")?;
            let device = drive.name.clone();
            let report = job::run("verify", settings, &groups, move |ctx| {
                verify_image(ctx, &resolver, &plan, &device)
            })?;

            print_report(&report)?;
            println!(
                "\n✨ {} matches {}.",
                style(drive.node().display()).cyan(),
                style(image.display()).cyan()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn restore_arguments() {
        let cli = Cli::try_parse_from(["usbclone", "restore", "/img", "-t", "sdb", "-m", "k1", "-y"]).unwrap();
        match cli.command {
            Commands::Restore { target, mode, yes, verify, .. } => {
                assert_eq!(target.as_deref(), Some("sdb"));
                assert_eq!(mode, PartitionMode::K1);
                assert!(yes);
                assert!(!verify);
            }
            _ => panic!("expected restore"),
        }
    }

    #[test]
    fn backup_arguments() {
        let cli = Cli::try_parse_from([
            "usbclone", "backup", "/img", "-s", "sdb", "-p", "sdb1,sdb2", "-c", "zstd", "--split-mb", "0",
        ])
        .unwrap();
        match cli.command {
            Commands::Backup {
                partitions,
                compression,
                split_mb,
                ..
            } => {
                assert_eq!(partitions, ["sdb1", "sdb2"]);
                assert_eq!(compression, Some(Compression::Zstd));
                assert_eq!(split_mb, Some(0));
            }
            _ => panic!("expected backup"),
        }
        assert!(Cli::try_parse_from(["usbclone", "backup", "/img", "-c", "gzip", "--no-compress"]).is_err());
    }

    #[test]
    fn skipped_partitions_fail_the_report() {
        let complete = VerifyReport {
            verified: vec!["sdb1".into()],
            skipped: vec![],
        };
        assert!(print_report(&complete).is_ok());

        let partial = VerifyReport {
            verified: vec!["sdb1".into()],
            skipped: vec!["sdb2".into()],
        };
        let err = print_report(&partial).unwrap_err();
        assert!(err.to_string().contains("sdb2 not compared"));
    }

    #[test]
    fn erase_arguments() {
        let cli = Cli::try_parse_from(["usbclone", "erase", "-d", "sdb", "-m", "zero", "-y"]).unwrap();
        match cli.command {
            Commands::Erase { device, mode, yes } => {
                assert_eq!(device.as_deref(), Some("sdb"));
                assert_eq!(mode, EraseMode::Zero);
                assert!(yes);
            }
            _ => panic!("expected erase"),
        }
        let cli = Cli::try_parse_from(["usbclone", "erase"]).unwrap();
        assert!(matches!(cli.command, Commands::Erase { mode: EraseMode::Quick, .. }));
        assert!(Cli::try_parse_from(["usbclone", "erase", "-m", "melt"]).is_err());
    }

    #[test]
    fn clone_modes_parse() {
        let cli = Cli::try_parse_from(["usbclone", "clone", "-m", "raw"]).unwrap();
        assert!(matches!(cli.command, Commands::Clone { mode: CloneMode::Exact, .. }));
        assert!(Cli::try_parse_from(["usbclone", "clone", "-m", "bogus"]).is_err());
    }
}
