//! The `sfdisk --dump` dialect.
//!
//! ```text
//! label: dos
//! label-id: 0x1234abcd
//! device: /dev/sda
//! unit: sectors
//! sector-size: 512
//!
//! /dev/sda1 : start=        2048, size=      524288, type=c, bootable
//! /dev/sda2 : start=      526336, size=    61807616, type=83
//! ```
use super::scale::{Extent, scale_geometry};
use crate::error::Result;

/// Sectors at the end of a GPT disk held by the backup header and entries.
pub const GPT_BACKUP_SECTORS: u64 = 33;

/// Header keys that only appear in sfdisk scripts.
const SCRIPT_HEADERS: [&str; 6] = [
    "label:",
    "label-id:",
    "unit:",
    "sector-size:",
    "first-lba:",
    "last-lba:",
];

/// `key=value` (or bare `flag`) entries after the ` : ` of a partition line.
pub type Fields = Vec<(String, String)>;

/// One partition line of a dump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SfdiskEntry {
    /// Index of the line within the dump.
    pub line: usize,
    /// The device node before the colon, e.g. `/dev/sda1`.
    pub device: String,
    pub fields: Fields,
}

impl SfdiskEntry {
    pub fn start(&self) -> Option<u64> {
        int_field(&self.fields, "start")
    }

    pub fn size(&self) -> Option<u64> {
        int_field(&self.fields, "size")
    }
}

/// A parsed dump that can be re-rendered with modified entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SfdiskDump {
    lines: Vec<String>,
    pub label: Option<String>,
    pub sector_size: u64,
    pub last_lba: Option<u64>,
    last_lba_line: Option<usize>,
    pub entries: Vec<SfdiskEntry>,
}

impl SfdiskDump {
    pub fn parse(text: &str) -> Self {
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        let mut dump = SfdiskDump {
            lines: Vec::new(),
            label: None,
            sector_size: 512,
            last_lba: None,
            last_lba_line: None,
            entries: Vec::new(),
        };
        for (index, line) in lines.iter().enumerate() {
            let line = line.trim();
            if let Some(value) = header_value(line, "label:") {
                dump.label = Some(value.to_ascii_lowercase());
            } else if let Some(value) = header_value(line, "sector-size:") {
                if let Ok(size) = value.parse::<u64>() {
                    dump.sector_size = size.max(1);
                }
            } else if let Some(value) = header_value(line, "last-lba:") {
                dump.last_lba = value.parse().ok();
                dump.last_lba_line = Some(index);
            } else if line.starts_with("/dev/") {
                if let Some((device, rest)) = line.split_once(':') {
                    dump.entries.push(SfdiskEntry {
                        line: index,
                        device: device.trim().to_string(),
                        fields: parse_fields(rest),
                    });
                }
            }
        }
        dump.lines = lines;
        dump
    }

    pub fn is_gpt(&self) -> bool {
        self.label.as_deref() == Some("gpt")
    }

    /// The highest sector the table refers to, from `last-lba` or the
    /// partition entries.
    pub fn max_sector(&self) -> Option<u64> {
        let ends = self.entries.iter().filter_map(|e| {
            let (start, size) = (e.start()?, e.size()?);
            Some(start.saturating_add(size.saturating_sub(1)))
        });
        ends.chain(self.last_lba).max()
    }

    /// Rewrites the dump for a disk of `target_bytes`, scaling partitions.
    ///
    /// Returns `None` when the dump has no sized partitions or the target
    /// is not larger.
    ///
    /// On a DOS table the last partition ends at the disk's last sector.
    /// GPT is the exception: the last [`GPT_BACKUP_SECTORS`] sectors hold the
    /// backup table, so the last partition ends at sector
    /// `target_bytes / sector_size - GPT_BACKUP_SECTORS - 1` and `last-lba`
    /// is rewritten to match.
    pub fn scaled(&self, target_bytes: u64) -> Result<Option<String>> {
        let sized: Vec<(usize, Extent)> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| {
                let (start, size) = (e.start()?, e.size()?);
                (size > 0).then_some((i, Extent::new(start, size)))
            })
            .collect();
        let mut target_sectors = target_bytes / self.sector_size;
        if self.is_gpt() {
            target_sectors = target_sectors.saturating_sub(GPT_BACKUP_SECTORS);
        }
        let extents: Vec<Extent> = sized.iter().map(|(_, e)| *e).collect();
        let Some(placements) = scale_geometry(&extents, target_sectors)? else {
            return Ok(None);
        };

        let mut lines = self.lines.clone();
        for placement in placements {
            let entry = &self.entries[sized[placement.index].0];
            let mut fields = entry.fields.clone();
            set_field(&mut fields, "start", placement.start.to_string());
            set_field(&mut fields, "size", placement.size.to_string());
            lines[entry.line] = format_line(&entry.device, &fields);
        }
        if let Some(index) = self.last_lba_line {
            lines[index] = format!("last-lba: {}", target_sectors - 1);
        }
        Ok(Some(lines.join("\n") + "\n"))
    }
}

fn header_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.strip_prefix(key).map(str::trim)
}

/// Splits `start=2048, size=100, type=83, bootable` into key/value pairs.
pub fn parse_fields(rest: &str) -> Fields {
    rest.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
            None => (entry.to_string(), String::new()),
        })
        .collect()
}

/// An integer field, accepting an optional trailing `s` unit.
pub fn int_field(fields: &Fields, key: &str) -> Option<u64> {
    fields
        .iter()
        .filter(|(k, _)| k == key)
        .find_map(|(_, v)| v.strip_suffix('s').unwrap_or(v).parse().ok())
}

/// Replaces `key` in place, or appends it.
pub fn set_field(fields: &mut Fields, key: &str, value: String) {
    match fields.iter_mut().find(|(k, _)| k == key) {
        Some((_, v)) => *v = value,
        None => fields.push((key.to_string(), value)),
    }
}

pub fn format_line(device: &str, fields: &Fields) -> String {
    let rendered: Vec<String> = fields
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{k}={v}")
            }
        })
        .collect();
    format!("{device} : {}", rendered.join(", "))
}

/// Whether `text` reads as sfdisk input rather than something else saved
/// under an sfdisk-ish name.
pub fn looks_like_script(text: &str) -> bool {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .any(|l| l.starts_with("/dev/") || SCRIPT_HEADERS.iter().any(|h| l.starts_with(h)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOS_DUMP: &str = "label: dos
label-id: 0x5452574f
device: /dev/sda
unit: sectors
sector-size: 512

/dev/sda1 : start=        8192, size=      524288, type=c, bootable
/dev/sda2 : start=      532480, size=     7856128, type=83
";

    const GPT_DUMP: &str = "label: gpt
label-id: 6E1F4B0A-8A5C-4E2B-9E0B-2B5C0A1B2C3D
device: /dev/sdb
unit: sectors
first-lba: 34
last-lba: 2097118
sector-size: 512

/dev/sdb1 : start=2048, size=204800, type=C12A7328-F81F-11D2-BA4B-00A0C93EC93B, name=\"EFI\"
/dev/sdb2 : start=206848, size=1890271, type=0FC63DAF-8483-4772-8E79-3D69D8477DE4
";

    #[test]
    fn parses_dos_dump() {
        let dump = SfdiskDump::parse(DOS_DUMP);
        assert_eq!(dump.label.as_deref(), Some("dos"));
        assert_eq!(dump.sector_size, 512);
        assert_eq!(dump.entries.len(), 2);
        assert_eq!(dump.entries[0].device, "/dev/sda1");
        assert_eq!(dump.entries[0].start(), Some(8192));
        assert_eq!(dump.entries[1].size(), Some(7_856_128));
        assert_eq!(dump.max_sector(), Some(532_480 + 7_856_128 - 1));
        assert!(looks_like_script(DOS_DUMP));
    }

    #[test]
    fn field_round_trip_keeps_flags() {
        let mut fields = parse_fields(" start=8192, size=524288, type=c, bootable");
        set_field(&mut fields, "size", "1000".into());
        assert_eq!(
            format_line("/dev/sda1", &fields),
            "/dev/sda1 : start=8192, size=1000, type=c, bootable"
        );
        assert_eq!(int_field(&parse_fields("start=2048s"), "start"), Some(2048));
    }

    #[test]
    fn scales_dos_dump_to_last_sector() {
        let dump = SfdiskDump::parse(DOS_DUMP);
        // Source ends at 8_388_608 sectors (4 GiB); target is 8 GiB.
        let scaled = dump.scaled(8 * 1024 * 1024 * 1024).unwrap().unwrap();
        let rescaled = SfdiskDump::parse(&scaled);
        assert_eq!(rescaled.entries[0].start(), Some(8192));
        assert_eq!(rescaled.entries[0].size(), Some(1_048_576));
        assert_eq!(rescaled.entries[1].start(), Some(1_056_768));
        let last = &rescaled.entries[1];
        assert_eq!(last.start().unwrap() + last.size().unwrap(), 16_777_216);
        assert!(scaled.contains("type=c, bootable"));
        assert!(scaled.starts_with("label: dos\n"));
    }

    #[test]
    fn gpt_scaling_leaves_backup_area() {
        let dump = SfdiskDump::parse(GPT_DUMP);
        let target_bytes = 4_194_304 * 512;
        let scaled = SfdiskDump::parse(&dump.scaled(target_bytes).unwrap().unwrap());
        let usable_end = 4_194_304 - GPT_BACKUP_SECTORS - 1;
        assert_eq!(scaled.last_lba, Some(usable_end));
        let last = &scaled.entries[1];
        assert_eq!(last.start().unwrap() + last.size().unwrap() - 1, usable_end);
        assert!(scaled.entries[1].fields.iter().any(|(k, _)| k == "type"));
    }

    #[test]
    fn smaller_target_abstains() {
        let dump = SfdiskDump::parse(DOS_DUMP);
        assert_eq!(dump.scaled(1024 * 1024 * 1024).unwrap(), None);
    }

    #[test]
    fn device_name_is_not_a_script() {
        assert!(!looks_like_script("sda\n"));
        assert!(!looks_like_script(""));
    }
}
