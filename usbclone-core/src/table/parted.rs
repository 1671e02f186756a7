//! parted layouts: human `print` output, machine (`-m`) output, and
//! `mklabel`/`mkpart` scripts, including the semicolon-joined compact form.
//!
//! Only sector-unit values are understood. Layouts are never replayed
//! through parted itself when scaled; they are converted to sfdisk input.
use super::scale::{Extent, Placement, scale_geometry};
use super::sfdisk::{Fields, GPT_BACKUP_SECTORS, format_line};
use crate::device::partition_name;
use crate::error::{Error, Result};
use regex::Regex;
use std::sync::LazyLock;

static SECTOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(s)?$").expect("static regex"));

static MKPART_RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)s\s+(\d+)s").expect("static regex"));

static SECTOR_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Sector size .*?:\s*(\d+)B").expect("static regex"));

static DISK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Disk /dev/\S+:\s*(\d+)s\s*$").expect("static regex"));

static TABLE_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Number\s+Start").expect("static regex"));

const KNOWN_FLAGS: [&str; 5] = ["boot", "esp", "bios_grub", "legacy_boot", "lba"];

const PARTITION_TYPES: [&str; 3] = ["primary", "extended", "logical"];

/// One partition described by a parted layout, in sectors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartedPartition {
    pub number: u32,
    pub start: u64,
    pub size: u64,
    pub flags: Vec<String>,
    pub fstype: Option<String>,
}

impl PartedPartition {
    fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }
}

/// A parted layout, whichever of the three forms it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartedLayout {
    pub sector_size: u64,
    pub label: Option<String>,
    /// Whole-disk size from a `Disk` line or machine device line.
    pub disk_sectors: Option<u64>,
    pub partitions: Vec<PartedPartition>,
}

impl PartedLayout {
    /// Parses any parted form. Print and machine partitions win over
    /// `mkpart` lines when a file somehow holds both.
    pub fn parse(text: &str) -> Self {
        let mut layout = PartedLayout {
            sector_size: 512,
            label: None,
            disk_sectors: None,
            partitions: Vec::new(),
        };
        let mut unit_is_sectors = false;
        let mut scripted = Vec::new();
        let mut printed = Vec::new();

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(caps) = SECTOR_SIZE.captures(line) {
                layout.sector_size = caps[1].parse::<u64>().unwrap_or(512).max(1);
            } else if let Some(label) = line.strip_prefix("Partition Table:") {
                layout.label = Some(label.trim().to_string());
            } else if let Some(caps) = DISK_LINE.captures(line) {
                layout.disk_sectors = caps[1].parse().ok();
            } else if line.starts_with("unit ") {
                unit_is_sectors = line.split_whitespace().last() == Some("s");
            } else if line.starts_with("mklabel") {
                if let Some(label) = line.split_whitespace().nth(1) {
                    layout.label = Some(label.to_string());
                }
            } else if line.starts_with("mkpart") {
                if let Some(part) = parse_mkpart(line, scripted.len() as u32 + 1) {
                    scripted.push(part);
                }
            } else if line.starts_with("/dev/") && line.contains(':') {
                layout.apply_machine_device(line);
            } else if line.starts_with(|c: char| c.is_ascii_digit()) {
                let part = if line.contains(':') {
                    parse_machine_partition(line)
                } else {
                    parse_print_partition(line, unit_is_sectors)
                };
                printed.extend(part);
            }
        }
        layout.partitions = if printed.is_empty() { scripted } else { printed };
        layout
    }

    /// `/dev/sda:15728640s:scsi:512:512:msdos:Kingston DataTraveler:;`
    fn apply_machine_device(&mut self, line: &str) {
        let fields: Vec<&str> = line.trim_end_matches(';').split(':').collect();
        if let Some(total) = fields.get(1).and_then(|f| parse_sector(f, false)) {
            self.disk_sectors = Some(total);
        }
        if let Some(size) = fields.get(3).and_then(|f| f.parse::<u64>().ok()) {
            self.sector_size = size.max(1);
        }
        if let Some(label) = fields.get(5).filter(|l| !l.is_empty()) {
            self.label = Some(label.to_string());
        }
    }

    /// The highest sector the layout refers to.
    pub fn max_sector(&self) -> Option<u64> {
        let ends = self
            .partitions
            .iter()
            .map(|p| p.start.saturating_add(p.size.saturating_sub(1)));
        ends.chain(self.disk_sectors.map(|total| total.saturating_sub(1)))
            .max()
    }

    /// Scales the layout onto `target_bytes` and renders it as an sfdisk
    /// script for `device`. `None` when the layout has no partitions, its
    /// label is unsupported, or the target is not larger.
    ///
    /// As in [`SfdiskDump::scaled`](super::sfdisk::SfdiskDump::scaled), a
    /// GPT layout stops [`GPT_BACKUP_SECTORS`] short of the disk's last
    /// sector; a DOS layout runs to it.
    pub fn scaled(&self, device: &str, target_bytes: u64) -> Result<Option<String>> {
        let Some(label) = self.label.as_deref().and_then(normalize_label) else {
            return Ok(None);
        };
        let mut target_sectors = target_bytes / self.sector_size;
        if label == "gpt" {
            target_sectors = target_sectors.saturating_sub(GPT_BACKUP_SECTORS);
        }
        let extents: Vec<Extent> = self
            .partitions
            .iter()
            .map(|p| Extent::new(p.start, p.size))
            .collect();
        let Some(placements) = scale_geometry(&extents, target_sectors)? else {
            return Ok(None);
        };
        Ok(Some(self.render_sfdisk(label, device, &placements)))
    }

    fn render_sfdisk(&self, label: &str, device: &str, placements: &[Placement]) -> String {
        let mut lines = vec![
            format!("label: {label}"),
            "unit: sectors".to_string(),
            format!("sector-size: {}", self.sector_size),
        ];
        for placement in placements {
            let part = &self.partitions[placement.index];
            let mut fields: Fields = vec![
                ("start".into(), placement.start.to_string()),
                ("size".into(), placement.size.to_string()),
            ];
            let fstype = part.fstype.as_deref().unwrap_or_default().to_ascii_lowercase();
            match label {
                "gpt" if part.has_flag("esp") || (fstype == "fat32" && part.has_flag("boot")) => {
                    fields.push(("type".into(), "U".into()));
                }
                "dos" => {
                    if let Some(code) = dos_type(&fstype) {
                        fields.push(("type".into(), code.into()));
                    }
                    if part.has_flag("boot") {
                        fields.push(("bootable".into(), String::new()));
                    }
                }
                _ => {}
            }
            let node = format!("/dev/{}", partition_name(device, part.number));
            lines.push(format_line(&node, &fields));
        }
        lines.join("\n") + "\n"
    }
}

/// MBR type codes for filesystems that should not default to Linux (83).
fn dos_type(fstype: &str) -> Option<&'static str> {
    match fstype {
        "fat32" => Some("c"),
        "fat16" => Some("e"),
        "ntfs" => Some("7"),
        "linux-swap" | "linux-swap(v1)" => Some("82"),
        _ => None,
    }
}

fn parse_sector(value: &str, unit_is_sectors: bool) -> Option<u64> {
    let caps = SECTOR.captures(value)?;
    if caps.get(2).is_some() || unit_is_sectors {
        caps[1].parse().ok()
    } else {
        None
    }
}

fn parse_mkpart(line: &str, number: u32) -> Option<PartedPartition> {
    let caps = MKPART_RANGE.captures(line)?;
    let start: u64 = caps[1].parse().ok()?;
    let end: u64 = caps[2].parse().ok()?;
    (end >= start).then(|| PartedPartition {
        number,
        start,
        size: end - start + 1,
        flags: Vec::new(),
        fstype: None,
    })
}

/// `1:8192s:532479s:524288s:fat32::boot, lba;`
fn parse_machine_partition(line: &str) -> Option<PartedPartition> {
    let fields: Vec<&str> = line.trim_end_matches(';').split(':').collect();
    if fields.len() < 4 {
        return None;
    }
    let number = fields[0].parse().ok()?;
    let start = parse_sector(fields[1], false)?;
    let end = parse_sector(fields[2], false)?;
    if end < start {
        return None;
    }
    let fstype = fields.get(4).filter(|f| !f.is_empty()).map(|f| f.to_string());
    let flags: Vec<String> = fields
        .get(6)
        .map(|f| {
            f.split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some(PartedPartition {
        number,
        start,
        size: end - start + 1,
        flags,
        fstype,
    })
}

/// ` 1      8192s    532479s    524288s    primary  fat32        boot, lba`
fn parse_print_partition(line: &str, unit_is_sectors: bool) -> Option<PartedPartition> {
    let columns: Vec<&str> = line.split_whitespace().collect();
    if columns.len() < 4 {
        return None;
    }
    let number = columns[0].parse().ok()?;
    let start = parse_sector(columns[1], unit_is_sectors)?;
    let end = parse_sector(columns[2], unit_is_sectors)?;
    if end < start {
        return None;
    }
    let mut fstype = None;
    let mut flags = Vec::new();
    for column in &columns[4..] {
        if column.contains(',') {
            flags.extend(
                column
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string),
            );
        } else if KNOWN_FLAGS.contains(column) {
            flags.push(column.to_string());
        } else if PARTITION_TYPES.contains(column) {
            continue;
        } else if fstype.is_none() {
            fstype = Some(column.to_string());
        }
    }
    Some(PartedPartition {
        number,
        start,
        size: end - start + 1,
        flags,
        fstype,
    })
}

/// `msdos`/`mbr` become `dos`; anything but `dos` or `gpt` is unsupported.
pub fn normalize_label(label: &str) -> Option<&'static str> {
    match label.trim().to_ascii_lowercase().as_str() {
        "msdos" | "mbr" | "dos" => Some("dos"),
        "gpt" => Some("gpt"),
        _ => None,
    }
}

/// Whether `text` is saved `print` output, which parted cannot replay.
pub fn is_print_output(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with("Model:")
        || trimmed.starts_with("BYT;")
        || text.contains("Partition Table:")
        || TABLE_HEADER.is_match(text)
}

/// Splits a compact script on `;` into one command per line.
///
/// # Errors
///
/// Returns [`Error::Layout`] when the script holds no commands.
pub fn expand_compact(text: &str) -> Result<String> {
    let commands: Vec<&str> = text
        .lines()
        .flat_map(|line| line.split(';'))
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();
    if commands.is_empty() {
        return Err(Error::Layout(
            "compact parted script does not contain any commands".to_string(),
        ));
    }
    Ok(commands.join("\n") + "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::sfdisk::SfdiskDump;

    const PRINT: &str = "Model: Kingston DataTraveler 3.0 (scsi)
Disk /dev/sda: 15728640s
Sector size (logical/physical): 512B/512B
Partition Table: msdos
Disk Flags:

Number  Start    End        Size       Type     File system  Flags
 1      8192s    532479s    524288s    primary  fat32        boot, lba
 2      532480s  15728639s  15196160s  primary  ext4
";

    const MACHINE: &str = "BYT;
/dev/sdb:15728640s:scsi:512:512:gpt:SanDisk Cruzer:;
1:2048s:1050623s:1048576s:fat32:EFI:boot, esp;
2:1050624s:15726591s:14675968s:ext4:root:;
";

    const SCRIPT: &str = "mklabel msdos
unit s
mkpart primary fat32 2048s 206847s
mkpart primary ext4 206848s 4194303s
";

    #[test]
    fn parses_human_print() {
        let layout = PartedLayout::parse(PRINT);
        assert_eq!(layout.label.as_deref(), Some("msdos"));
        assert_eq!(layout.disk_sectors, Some(15_728_640));
        assert_eq!(layout.partitions.len(), 2);
        let boot = &layout.partitions[0];
        assert_eq!((boot.start, boot.size), (8192, 524_288));
        assert_eq!(boot.fstype.as_deref(), Some("fat32"));
        assert_eq!(boot.flags, ["boot", "lba"]);
        assert_eq!(layout.partitions[1].fstype.as_deref(), Some("ext4"));
        assert_eq!(layout.max_sector(), Some(15_728_639));
        assert!(is_print_output(PRINT));
    }

    #[test]
    fn parses_machine_output() {
        let layout = PartedLayout::parse(MACHINE);
        assert_eq!(layout.label.as_deref(), Some("gpt"));
        assert_eq!(layout.sector_size, 512);
        assert_eq!(layout.disk_sectors, Some(15_728_640));
        assert_eq!(layout.partitions[0].flags, ["boot", "esp"]);
        assert_eq!(layout.partitions[1].start, 1_050_624);
        assert!(is_print_output(MACHINE));
    }

    #[test]
    fn parses_mkpart_script() {
        let layout = PartedLayout::parse(SCRIPT);
        assert_eq!(layout.label.as_deref(), Some("msdos"));
        assert_eq!(layout.partitions.len(), 2);
        assert_eq!(layout.partitions[1].number, 2);
        assert_eq!(layout.partitions[1].size, 4_194_304 - 206_848);
        assert!(!is_print_output(SCRIPT));
    }

    #[test]
    fn expands_compact_script() {
        let expanded = expand_compact("mklabel gpt; mkpart p1 2048s 4095s;\n;").unwrap();
        assert_eq!(expanded, "mklabel gpt\nmkpart p1 2048s 4095s\n");
        assert!(expand_compact(" ;; \n").is_err());
    }

    #[test]
    fn unitless_print_values_are_ignored() {
        let layout = PartedLayout::parse(" 1      1049kB  538MB   537MB   primary  fat32  boot\n");
        assert!(layout.partitions.is_empty());
        let scripted = PartedLayout::parse("unit s\n 1  2048  4095  2048  primary\n");
        assert_eq!(scripted.partitions[0].size, 2048);
    }

    #[test]
    fn scaled_print_becomes_dos_sfdisk() {
        let layout = PartedLayout::parse(PRINT);
        let script = layout
            .scaled("sdc", 31_457_280 * 512)
            .unwrap()
            .unwrap();
        assert!(script.starts_with("label: dos\nunit: sectors\nsector-size: 512\n"));
        assert!(script.contains("/dev/sdc1 : start=8192, size=1048576, type=c, bootable"));
        let dump = SfdiskDump::parse(&script);
        let last = &dump.entries[1];
        assert_eq!(last.device, "/dev/sdc2");
        assert_eq!(last.start().unwrap() + last.size().unwrap(), 31_457_280);
    }

    #[test]
    fn scaled_gpt_marks_esp_and_reserves_backup() {
        let layout = PartedLayout::parse(MACHINE);
        let script = layout.scaled("mmcblk0", 31_457_280 * 512).unwrap().unwrap();
        assert!(script.contains("/dev/mmcblk0p1 : start=2048"));
        assert!(script.lines().any(|l| l.starts_with("/dev/mmcblk0p1") && l.ends_with("type=U")));
        let dump = SfdiskDump::parse(&script);
        let last = &dump.entries[1];
        assert_eq!(
            last.start().unwrap() + last.size().unwrap(),
            31_457_280 - GPT_BACKUP_SECTORS
        );
    }

    #[test]
    fn unsupported_label_abstains() {
        let layout = PartedLayout::parse("mklabel loop\nmkpart primary 2048s 4095s\n");
        assert_eq!(layout.scaled("sda", 1 << 30).unwrap(), None);
        assert_eq!(normalize_label("MBR"), Some("dos"));
        assert_eq!(normalize_label("sun"), None);
    }
}
