//! The core, UI-agnostic library for the `usbclone` disk cloning utility.
//!
//! `usbclone-core` is designed to be used as a library by any front-end. It
//! reads and writes Clonezilla image directories, rewrites partition tables
//! for differently sized targets, streams partition data through the
//! external `partclone`/`dd` tools and verifies the result with SHA256.
//!
//! The library is structured into several key modules:
//! - [`device`] and [`platform`]: typed drives and partitions, the
//!   [`device::DeviceResolver`] seam, and its `lsblk`-backed implementation.
//! - [`image`] and [`table`]: reading image directories and partition tables.
//! - [`partition_mode`]: how a restore (re)writes the target's table.
//! - [`mod@restore`], [`mod@backup`], [`mod@clone`], [`erase`] and
//!   [`verify`]: the operations themselves. [`mod@restore`] also writes
//!   plain `.iso` files onto whole devices.
//! - [`command`] and [`context`]: the pipeline runner and the per-job
//!   context carrying progress, settings and cancellation.
//!
//! Every operation is blocking and reports progress through the
//! [`context::OperationContext`] it is given, so callers run jobs on a
//! worker thread and display progress in any way they choose.
//!
//! ## Example: Restoring an Image with Progress Reporting
//!
//! ```rust,no_run
//! use usbclone_core::config::Settings;
//! use usbclone_core::context::OperationContext;
//! use usbclone_core::image::plan::build_plan;
//! use usbclone_core::partition_mode::{PartitionMode, SystemLayoutBackend};
//! use usbclone_core::platform::LsblkResolver;
//! use usbclone_core::restore;
//! use std::path::Path;
//!
//! fn main() -> usbclone_core::Result<()> {
//!     let settings = Settings::load(None)?;
//!     let plan = build_plan(Path::new("/media/usb/clonezilla/2024-01-01-img"))?;
//!
//!     // A real app would forward these snapshots to a progress bar.
//!     let ctx = OperationContext::new("job-1", "restore", settings, |progress| {
//!         println!("{:?} {:?}", progress.lines, progress.ratio);
//!     });
//!
//!     restore::run(
//!         &ctx,
//!         &LsblkResolver::new(),
//!         &SystemLayoutBackend,
//!         &plan,
//!         "sdb",
//!         PartitionMode::K1,
//!     )?;
//!
//!     println!("Restore complete!");
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod clone;
pub mod command;
pub mod compression;
pub mod config;
pub mod context;
pub mod device;
pub mod erase;
pub mod error;
pub mod image;
pub mod partition_mode;
pub mod platform;
pub mod progress;
pub mod restore;
pub mod table;
pub mod verify;

pub use error::{Error, Result};
