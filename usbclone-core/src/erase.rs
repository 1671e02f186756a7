//! Wipes a removable drive.
//!
//! Four modes are offered:
//! - [`EraseMode::Quick`] removes filesystem signatures with `wipefs -a`,
//!   then zeroes the first and last `quick_wipe_mib` MiB, where the
//!   partition tables live.
//! - [`EraseMode::Zero`] overwrites the whole device with zeros.
//! - [`EraseMode::Secure`] runs one random `shred` pass followed by zeros.
//! - [`EraseMode::Discard`] discards every block with `blkdiscard`.
use crate::command::{Pipeline, Stage, StageCommand};
use crate::context::OperationContext;
use crate::device::DeviceResolver;
use crate::error::{Error, Result};
use crate::platform;
use crate::progress::Progress;
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

const MIB: u64 = 1024 * 1024;

/// How a drive is wiped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EraseMode {
    #[default]
    Quick,
    Zero,
    Secure,
    Discard,
}

impl FromStr for EraseMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(EraseMode::Quick),
            "zero" | "full" => Ok(EraseMode::Zero),
            "secure" | "shred" => Ok(EraseMode::Secure),
            "discard" | "trim" => Ok(EraseMode::Discard),
            other => Err(Error::Layout(format!("unsupported erase mode: {other}"))),
        }
    }
}

impl fmt::Display for EraseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EraseMode::Quick => "quick",
            EraseMode::Zero => "zero",
            EraseMode::Secure => "secure",
            EraseMode::Discard => "discard",
        })
    }
}

/// One command of an erase and the bytes it is expected to write.
#[derive(Debug)]
pub struct EraseStep {
    pub command: StageCommand,
    pub total: Option<u64>,
}

fn zero_fill(node: &Path) -> Result<StageCommand> {
    Ok(StageCommand::tool(Stage::Erase, "dd")?
        .arg("if=/dev/zero")
        .arg(format!("of={}", node.display())))
}

/// The commands wiping `node` in `mode`.
///
/// `size_bytes` is the device size, `None` when unknown. A quick erase of a
/// device of unknown size only clears its start.
///
/// # Errors
///
/// [`Error::ToolMissing`] when a required program is not installed, and
/// an I/O error when a zero fill is asked for on a device of unknown size.
pub fn erase_steps(
    mode: EraseMode,
    node: &Path,
    size_bytes: Option<u64>,
    quick_wipe_mib: u64,
) -> Result<Vec<EraseStep>> {
    match mode {
        EraseMode::Quick => {
            let size_mib = size_bytes.map(|b| b / MIB).filter(|&mib| mib > 0);
            let wipe_mib = match size_mib {
                Some(size_mib) => quick_wipe_mib.min(size_mib),
                None => quick_wipe_mib,
            };
            let wipe_bytes = Some(wipe_mib * MIB);
            let head = zero_fill(node)?
                .arg("bs=1M")
                .arg(format!("count={wipe_mib}"))
                .args(["status=progress", "conv=fsync"]);
            let mut steps = vec![
                EraseStep {
                    command: StageCommand::tool(Stage::Erase, "wipefs")?.arg("-a").arg(node),
                    total: None,
                },
                EraseStep {
                    command: head,
                    total: wipe_bytes,
                },
            ];
            if let Some(size_mib) = size_mib
                && size_mib > wipe_mib
            {
                let tail = zero_fill(node)?
                    .arg("bs=1M")
                    .arg(format!("count={wipe_mib}"))
                    .arg(format!("seek={}", size_mib - wipe_mib))
                    .args(["status=progress", "conv=fsync"]);
                steps.push(EraseStep {
                    command: tail,
                    total: wipe_bytes,
                });
            }
            Ok(steps)
        }
        EraseMode::Zero => {
            let size = size_bytes.ok_or_else(|| {
                io::Error::other(format!("cannot determine the size of {}", node.display()))
            })?;
            let command = zero_fill(node)?
                .arg("bs=4M")
                .arg(format!("count={size}"))
                .arg("iflag=count_bytes")
                .args(["status=progress", "conv=fsync"]);
            Ok(vec![EraseStep {
                command,
                total: Some(size),
            }])
        }
        EraseMode::Secure => Ok(vec![EraseStep {
            command: StageCommand::tool(Stage::Erase, "shred")?
                .args(["-v", "-n", "1", "-z"])
                .arg(node),
            total: None,
        }]),
        EraseMode::Discard => Ok(vec![EraseStep {
            command: StageCommand::tool(Stage::Erase, "blkdiscard")?.arg(node),
            total: None,
        }]),
    }
}

/// Wipes the drive named `device`.
///
/// # Errors
///
/// [`Error::PermissionDenied`] when not running as root,
/// [`Error::NotRemovable`] for a fixed drive, [`Error::UnmountFailed`] when
/// the drive stays mounted, plus any failure of the erase commands.
pub fn run(ctx: &OperationContext, resolver: &dyn DeviceResolver, device: &str, mode: EraseMode) -> Result<()> {
    platform::require_root()?;
    erase_with(ctx, resolver, device, mode)
}

fn erase_with(ctx: &OperationContext, resolver: &dyn DeviceResolver, device: &str, mode: EraseMode) -> Result<()> {
    let _guard = ctx.span().enter();
    let drive = resolver
        .device_by_name(device)?
        .ok_or_else(|| Error::DeviceNotFound(device.to_string()))?;
    if !drive.removable {
        return Err(Error::NotRemovable(drive.name));
    }
    let node = resolver.resolve_node(&drive.name);

    ctx.status(["ERASING", "Unmounting target"]);
    if !resolver.unmount(&drive) {
        return Err(Error::UnmountFailed(drive.name.clone()));
    }

    let size = if drive.size_bytes > 0 {
        Some(drive.size_bytes)
    } else {
        platform::block_device_size(&node)
    };
    if size.is_none() {
        warn!(device = %node.display(), "Unable to determine device size");
    }
    let steps = erase_steps(mode, &node, size, ctx.settings().quick_wipe_mib)?;
    info!(device = %node.display(), %mode, steps = steps.len(), "Starting erase");

    let subtitle = format!("{} - Mode {}", drive.label(), mode.to_string().to_uppercase());
    let total = steps.len();
    for (index, step) in steps.into_iter().enumerate() {
        ctx.set_scale(index as f64 / total as f64, 1.0 / total as f64);
        info!(command = %step.command, "Running erase step");
        Pipeline::new()
            .stage(step.command)
            .run(ctx, "ERASING", Some(subtitle.clone()), step.total)?;
    }
    ctx.reset_scale();
    ctx.emit(Progress::new(vec!["ERASING".to_string(), "Complete".to_string()], Some(1.0)));
    info!(device = %node.display(), %mode, "Erase complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::find_tool;
    use crate::config::Settings;
    use crate::device::{Drive, MockDeviceResolver};
    use std::fs;
    use std::path::PathBuf;

    fn args(step: &EraseStep) -> Vec<String> {
        step.command
            .get_args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn stick(size: u64) -> Drive {
        Drive {
            name: "sdx".into(),
            size_bytes: size,
            removable: true,
            ..Default::default()
        }
    }

    #[test]
    fn modes_parse() {
        assert_eq!("Quick".parse::<EraseMode>().unwrap(), EraseMode::Quick);
        assert_eq!("trim".parse::<EraseMode>().unwrap(), EraseMode::Discard);
        assert!("fast".parse::<EraseMode>().is_err());
        assert_eq!(EraseMode::Secure.to_string(), "secure");
    }

    #[test]
    fn quick_erase_clears_both_ends() {
        if find_tool("wipefs").is_err() {
            return;
        }
        let node = Path::new("/dev/sdx");
        let steps = erase_steps(EraseMode::Quick, node, Some(100 * MIB), 32).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(args(&steps[0]), ["-a", "/dev/sdx"]);
        assert!(args(&steps[1]).contains(&"count=32".to_string()));
        assert!(!args(&steps[1]).iter().any(|a| a.starts_with("seek=")));
        assert!(args(&steps[2]).contains(&"seek=68".to_string()));
        assert_eq!(steps[2].total, Some(32 * MIB));

        let small = erase_steps(EraseMode::Quick, node, Some(10 * MIB), 32).unwrap();
        assert_eq!(small.len(), 2);
        assert!(args(&small[1]).contains(&"count=10".to_string()));

        let unknown = erase_steps(EraseMode::Quick, node, None, 32).unwrap();
        assert_eq!(unknown.len(), 2);
    }

    #[test]
    fn zero_fill_is_bounded_by_device_size() {
        let node = Path::new("/dev/sdx");
        let steps = erase_steps(EraseMode::Zero, node, Some(4096), 32).unwrap();
        let args = args(&steps[0]);
        assert!(args.contains(&"count=4096".to_string()));
        assert!(args.contains(&"iflag=count_bytes".to_string()));
        assert!(erase_steps(EraseMode::Zero, node, None, 32).is_err());
    }

    fn resolver_into(dir: PathBuf, drive: Drive) -> MockDeviceResolver {
        let mut resolver = MockDeviceResolver::new();
        resolver
            .expect_device_by_name()
            .returning(move |_| Ok(Some(drive.clone())));
        resolver.expect_unmount().returning(|_| true);
        resolver.expect_resolve_node().returning(move |name| dir.join(name));
        resolver
    }

    #[test]
    fn zero_erase_overwrites_every_byte() {
        let nodes = tempfile::tempdir().unwrap();
        let node = nodes.path().join("sdx");
        fs::write(&node, vec![0xa5u8; 3 * 4096]).unwrap();
        let resolver = resolver_into(nodes.path().to_path_buf(), stick(3 * 4096));

        let ctx = OperationContext::silent(Settings {
            progress_refresh_ms: 10,
            ..Settings::default()
        });
        erase_with(&ctx, &resolver, "sdx", EraseMode::Zero).unwrap();
        assert_eq!(fs::read(&node).unwrap(), vec![0u8; 3 * 4096]);
    }

    #[test]
    fn fixed_drive_is_never_erased() {
        let mut resolver = MockDeviceResolver::new();
        resolver.expect_device_by_name().returning(|_| {
            Ok(Some(Drive {
                removable: false,
                ..stick(1 << 30)
            }))
        });
        // No unmount expectation: touching the drive would panic.
        let ctx = OperationContext::silent(Settings::default());
        let err = erase_with(&ctx, &resolver, "sdx", EraseMode::Quick).unwrap_err();
        assert!(matches!(err, Error::NotRemovable(ref name) if name == "sdx"));
    }

    #[test]
    fn busy_drive_is_not_erased() {
        let mut resolver = MockDeviceResolver::new();
        resolver
            .expect_device_by_name()
            .returning(|_| Ok(Some(stick(1 << 30))));
        resolver
            .expect_resolve_node()
            .returning(|name| PathBuf::from("/nonexistent").join(name));
        resolver.expect_unmount().times(1).returning(|_| false);
        let ctx = OperationContext::silent(Settings::default());
        let err = erase_with(&ctx, &resolver, "sdx", EraseMode::Zero).unwrap_err();
        assert!(matches!(err, Error::UnmountFailed(ref name) if name == "sdx"));
    }
}
