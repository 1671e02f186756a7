use crate::command::{Stage, StageCommand, run_checked};
use crate::device::{Drive, DeviceResolver, Partition};
use crate::error::{Error, Result};
use nix::ioctl_read;
use serde::Deserialize;
use serde_json::Value;
use std::fs::{self, File};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

ioctl_read!(blkgetsize64, 0x12, 114, u64);

const LSBLK_COLUMNS: &str = "NAME,SIZE,TYPE,FSTYPE,LABEL,PARTLABEL,MOUNTPOINT,VENDOR,MODEL,RM,TRAN";

/// Mountpoints that mark the drive the system runs from.
const ROOT_MOUNTPOINTS: [&str; 3] = ["/", "/boot", "/boot/firmware"];

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

/// One `lsblk -J` node. Column types differ between util-linux releases
/// (`size` and `rm` are strings on older ones), so loosely typed columns
/// stay as [`Value`].
#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    size: Option<Value>,
    fstype: Option<String>,
    label: Option<String>,
    partlabel: Option<String>,
    mountpoint: Option<String>,
    vendor: Option<String>,
    model: Option<String>,
    rm: Option<Value>,
    tran: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

fn value_u64(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn value_flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_u64() == Some(1),
        Some(Value::String(s)) => matches!(s.trim(), "1" | "true"),
        _ => false,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl LsblkDevice {
    fn into_partition(self) -> Partition {
        Partition {
            size_bytes: value_u64(self.size.as_ref()),
            fstype: non_empty(self.fstype),
            label: non_empty(self.label),
            partlabel: non_empty(self.partlabel),
            mountpoint: non_empty(self.mountpoint).map(PathBuf::from),
            name: self.name,
        }
    }

    fn into_drive(self) -> Drive {
        let removable = value_flag(self.rm.as_ref()) || self.tran.as_deref() == Some("usb");
        let partitions = self
            .children
            .into_iter()
            .filter(|c| c.kind.as_deref() == Some("part"))
            .map(LsblkDevice::into_partition)
            .collect();
        Drive {
            size_bytes: value_u64(self.size.as_ref()),
            vendor: non_empty(self.vendor),
            model: non_empty(self.model),
            mountpoint: non_empty(self.mountpoint).map(PathBuf::from),
            removable,
            partitions,
            name: self.name,
        }
    }
}

/// Parses `lsblk -J -b` output into whole drives. Nodes that are not of
/// type `disk` are dropped, and only `part` children count as partitions.
pub fn parse_lsblk(json: &str) -> Result<Vec<Drive>> {
    let output: LsblkOutput = serde_json::from_str(json)?;
    Ok(output
        .blockdevices
        .into_iter()
        .filter(|d| d.kind.as_deref() == Some("disk"))
        .map(LsblkDevice::into_drive)
        .collect())
}

/// A [`DeviceResolver`] backed by `lsblk` and `umount`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LsblkResolver;

impl LsblkResolver {
    pub fn new() -> Self {
        Self
    }

    /// Every whole drive the kernel currently reports.
    pub fn drives(&self) -> Result<Vec<Drive>> {
        let cmd = StageCommand::tool(Stage::Probe, "lsblk")?.args(["-J", "-b", "-o", LSBLK_COLUMNS]);
        let drives = parse_lsblk(&run_checked(&cmd, None)?)?;
        debug!(
            drives = %drives.iter().map(|d| d.name.as_str()).collect::<Vec<_>>().join(", "),
            "lsblk listing"
        );
        Ok(drives)
    }
}

impl DeviceResolver for LsblkResolver {
    fn device_by_name(&self, name: &str) -> Result<Option<Drive>> {
        let name = name.strip_prefix("/dev/").unwrap_or(name);
        Ok(self
            .drives()?
            .into_iter()
            .find(|d| d.name == name)
            .map(with_sys_removable))
    }

    fn unmount(&self, drive: &Drive) -> bool {
        let mountpoints = drive.mountpoints();
        if mountpoints.is_empty() {
            return true;
        }
        for mountpoint in &mountpoints {
            let umount = StageCommand::tool(Stage::Probe, "umount")
                .and_then(|cmd| run_checked(&cmd.arg(mountpoint), None));
            match umount {
                Ok(_) => info!(mountpoint = %mountpoint.display(), "Unmounted"),
                Err(e) => warn!(mountpoint = %mountpoint.display(), error = %e, "umount failed"),
            }
        }

        let mounts = fs::read_to_string("/proc/mounts").unwrap_or_default();
        let still_mounted: Vec<String> = mountpoints
            .iter()
            .filter(|mp| is_mounted(&mounts, mp))
            .map(|mp| mp.display().to_string())
            .collect();
        if still_mounted.is_empty() {
            true
        } else {
            warn!(device = %drive.name, mountpoints = %still_mounted.join(", "), "Mountpoints still active");
            false
        }
    }
}

/// Whether `mountpoint` appears as a mount target in `/proc/mounts` text.
fn is_mounted(mounts: &str, mountpoint: &Path) -> bool {
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|target| Path::new(&target.replace("\\040", " ")) == mountpoint)
}

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Marks `drive` removable when `/sys/block/<device>/removable` says so,
/// even if lsblk did not.
fn with_sys_removable(mut drive: Drive) -> Drive {
    if !drive.removable {
        drive.removable = read_sys_file(&drive.name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false);
    }
    drive
}

/// Finds the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
fn get_parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            return PathBuf::from(&path_str[..index]);
        }
    }

    path.to_path_buf()
}

/// The drive holding `/`, as seen by sysinfo.
fn system_disk() -> Option<PathBuf> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| get_parent_device_path(&PathBuf::from("/dev/").join(disk.name())))
}

fn is_system_drive(drive: &Drive, system_disk: Option<&Path>) -> bool {
    system_disk == Some(drive.node().as_path())
        || drive
            .mountpoints()
            .iter()
            .any(|mp| ROOT_MOUNTPOINTS.iter().any(|root| *mp == Path::new(root)))
}

/// Keeps the drives a user may safely clone to or from.
///
/// The filtering logic is as follows:
/// 1.  Exclude the drive the system runs from.
/// 2.  Skip loop devices and drives reporting a size of zero (empty card
///     readers).
/// 3.  Keep drives flagged removable by lsblk (or attached over USB), or by
///     `/sys/block/<device>/removable`.
fn filter_removable(drives: Vec<Drive>, system_disk: Option<&Path>) -> Vec<Drive> {
    drives
        .into_iter()
        .filter(|d| !d.name.starts_with("loop") && d.size_bytes > 0)
        .filter(|d| !is_system_drive(d, system_disk))
        .map(with_sys_removable)
        .filter(|d| d.removable)
        .collect()
}

/// Scans for removable drives, excluding the system drive.
pub fn list_removable_drives(resolver: &LsblkResolver) -> Result<Vec<Drive>> {
    let system_disk = system_disk();
    if system_disk.is_none() {
        warn!("Could not determine the system drive; relying on mountpoints");
    }
    Ok(filter_removable(resolver.drives()?, system_disk.as_deref()))
}

/// Size of a block device (or regular file) in bytes. `None` if it cannot
/// be determined.
pub fn block_device_size(node: &Path) -> Option<u64> {
    let file = File::open(node).ok()?;
    let metadata = file.metadata().ok()?;
    if metadata.is_file() {
        return Some(metadata.len());
    }
    let mut size_bytes: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer.
    match unsafe { blkgetsize64(file.as_raw_fd(), &mut size_bytes) } {
        Ok(_) => Some(size_bytes),
        Err(e) => {
            debug!(node = %node.display(), error = %e, "BLKGETSIZE64 failed");
            None
        }
    }
}

/// Fails with [`Error::PermissionDenied`] unless running as root.
pub fn require_root() -> Result<()> {
    if nix::unistd::geteuid().is_root() {
        Ok(())
    } else {
        Err(Error::PermissionDenied(
            "raw disk access requires root; re-run with sudo".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSBLK_NEW: &str = r#"{
       "blockdevices": [
          {"name":"sda", "size":500107862016, "type":"disk", "fstype":null, "label":null, "partlabel":null,
           "mountpoint":null, "vendor":"ATA     ", "model":"Samsung SSD", "rm":false, "tran":"sata",
           "children": [
              {"name":"sda1", "size":536870912, "type":"part", "fstype":"vfat", "label":null, "partlabel":"EFI",
               "mountpoint":"/boot", "vendor":null, "model":null, "rm":false, "tran":null},
              {"name":"sda2", "size":499570991104, "type":"part", "fstype":"ext4", "label":"root", "partlabel":null,
               "mountpoint":"/", "vendor":null, "model":null, "rm":false, "tran":null}
           ]
          },
          {"name":"sdb", "size":15931539456, "type":"disk", "fstype":null, "label":null, "partlabel":null,
           "mountpoint":null, "vendor":"SanDisk ", "model":"Cruzer", "rm":true, "tran":"usb",
           "children": [
              {"name":"sdb1", "size":15930490880, "type":"part", "fstype":"exfat", "label":"STICK", "partlabel":null,
               "mountpoint":"/media/STICK", "vendor":null, "model":null, "rm":true, "tran":null},
              {"name":"sdb1_crypt", "size":15930490880, "type":"crypt", "fstype":null, "label":null, "partlabel":null,
               "mountpoint":null, "vendor":null, "model":null, "rm":false, "tran":null}
           ]
          },
          {"name":"loop0", "size":0, "type":"loop", "rm":false}
       ]
    }"#;

    const LSBLK_OLD: &str = r#"{"blockdevices": [
        {"name":"mmcblk0", "size":"31914983424", "type":"disk", "rm":"0", "tran":null,
         "children": [{"name":"mmcblk0p1", "size":"268435456", "type":"part", "fstype":"vfat", "label":"", "mountpoint":null}]}
    ]}"#;

    #[test]
    fn parses_current_lsblk_json() {
        let drives = parse_lsblk(LSBLK_NEW).unwrap();
        assert_eq!(drives.len(), 2);
        let stick = &drives[1];
        assert_eq!(stick.name, "sdb");
        assert_eq!(stick.size_bytes, 15931539456);
        assert_eq!(stick.vendor.as_deref(), Some("SanDisk"));
        assert!(stick.removable);
        assert_eq!(stick.partitions.len(), 1);
        assert_eq!(stick.partitions[0].label.as_deref(), Some("STICK"));
        assert_eq!(stick.mountpoints(), [Path::new("/media/STICK")]);
    }

    #[test]
    fn parses_string_typed_columns() {
        let drives = parse_lsblk(LSBLK_OLD).unwrap();
        assert_eq!(drives[0].size_bytes, 31914983424);
        assert!(!drives[0].removable);
        assert_eq!(drives[0].partitions[0].size_bytes, 268435456);
        assert_eq!(drives[0].partitions[0].label, None);
    }

    #[test]
    fn invalid_json_is_a_listing_error() {
        assert!(matches!(parse_lsblk("lsblk: oops"), Err(Error::DeviceListing(_))));
    }

    #[test]
    fn system_drive_is_never_offered() {
        let drives = parse_lsblk(LSBLK_NEW).unwrap();
        let kept = filter_removable(drives.clone(), None);
        assert_eq!(kept.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(), ["sdb"]);

        let kept = filter_removable(drives, Some(Path::new("/dev/sdb")));
        assert!(kept.is_empty());
    }

    #[test]
    fn boot_mountpoints_mark_a_removable_drive_as_system() {
        let mut stick = parse_lsblk(LSBLK_NEW).unwrap().remove(1);
        assert!(!is_system_drive(&stick, None));

        stick.partitions[0].mountpoint = Some(PathBuf::from("/boot/firmware"));
        assert!(is_system_drive(&stick, None));
        assert!(filter_removable(vec![stick], None).is_empty());
    }

    #[test]
    fn parent_device_paths() {
        assert_eq!(get_parent_device_path(Path::new("/dev/sda2")), Path::new("/dev/sda"));
        assert_eq!(get_parent_device_path(Path::new("/dev/nvme0n1p3")), Path::new("/dev/nvme0n1"));
        assert_eq!(get_parent_device_path(Path::new("/dev/mmcblk0p1")), Path::new("/dev/mmcblk0"));
    }

    #[test]
    fn mount_table_lookup() {
        let mounts = "/dev/sdb1 /media/my\\040stick vfat rw 0 0\n/dev/sda2 / ext4 rw 0 0\n";
        assert!(is_mounted(mounts, Path::new("/media/my stick")));
        assert!(is_mounted(mounts, Path::new("/")));
        assert!(!is_mounted(mounts, Path::new("/media/STICK")));
    }

    #[test]
    fn regular_files_report_their_length() {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(file.path(), vec![0u8; 4096]).unwrap();
        assert_eq!(block_device_size(file.path()), Some(4096));
        assert_eq!(block_device_size(Path::new("/nonexistent/node")), None);
    }
}
