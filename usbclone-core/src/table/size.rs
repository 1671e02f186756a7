//! Minimum target size implied by an image's layout files.
use super::binary::{GptHeader, mbr_required_bytes};
use super::parted::PartedLayout;
use super::sfdisk::SfdiskDump;
use super::{DiskLayoutOp, LayoutKind, collect_layout_ops};
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Bytes covered by sectors `0..=last` of `sector_size` bytes each.
fn sectors_to_bytes(op: &DiskLayoutOp, last: u64, sector_size: u64) -> Result<u64> {
    last.checked_add(1)
        .and_then(|count| count.checked_mul(sector_size))
        .ok_or_else(|| out_of_range(op))
}

fn out_of_range(op: &DiskLayoutOp) -> Error {
    Error::ImageFormat(format!(
        "{} describes a disk larger than any device can be",
        op.path.display()
    ))
}

/// Bytes a single layout file says the source disk spanned.
///
/// # Errors
///
/// [`Error::ImageFormat`] when the recorded sectors do not fit in 64 bits,
/// which only a corrupt file can produce.
pub fn op_required_bytes(op: &DiskLayoutOp) -> Result<Option<u64>> {
    if let Some(text) = op.contents.as_deref() {
        let dump = SfdiskDump::parse(text);
        let parted = PartedLayout::parse(text);
        let from_dump = dump
            .max_sector()
            .map(|s| sectors_to_bytes(op, s, dump.sector_size))
            .transpose()?;
        let from_parted = parted
            .max_sector()
            .map(|s| sectors_to_bytes(op, s, parted.sector_size))
            .transpose()?;
        return Ok(from_dump.max(from_parted));
    }
    let bytes = match op.kind {
        LayoutKind::PtSgdisk | LayoutKind::Gpt => match GptHeader::find(&fs::read(&op.path)?) {
            Some(header) => Some(header.required_bytes().ok_or_else(|| out_of_range(op))?),
            None => None,
        },
        LayoutKind::Mbr => mbr_required_bytes(&fs::read(&op.path)?),
        _ => None,
    };
    Ok(bytes)
}

/// The largest size any layout file implies, or `None` when no file
/// describes a geometry.
///
/// Every layout file in `dir` is considered alongside `ops`, so a size
/// recorded only in a lower-priority dialect still counts.
pub fn estimate_required_size(ops: &[DiskLayoutOp], dir: Option<&Path>) -> Result<Option<u64>> {
    let mut all: Vec<DiskLayoutOp> = ops.to_vec();
    if let Some(dir) = dir {
        let mut seen: HashSet<_> = ops.iter().map(|op| op.path.clone()).collect();
        for op in collect_layout_ops(dir)? {
            if seen.insert(op.path.clone()) {
                all.push(op);
            }
        }
    }

    let mut required = None;
    for op in &all {
        let bytes = op_required_bytes(op)?;
        debug!(file = %op.path.display(), kind = %op.kind, ?bytes, "Layout size");
        required = required.max(bytes);
    }
    Ok(required)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::select_layout_ops;
    use std::path::PathBuf;

    fn text_op(kind: LayoutKind, text: &str) -> DiskLayoutOp {
        DiskLayoutOp {
            kind,
            path: PathBuf::from(format!("/nonexistent/{}", kind.name())),
            contents: Some(text.to_string()),
            size_bytes: text.len() as u64,
        }
    }

    #[test]
    fn sfdisk_last_lba_and_entries() {
        let op = text_op(
            LayoutKind::PtSf,
            "label: gpt\nlast-lba: 2097118\nsector-size: 512\n/dev/sda1 : start=2048, size=1000\n",
        );
        assert_eq!(op_required_bytes(&op).unwrap(), Some(2_097_119 * 512));
    }

    #[test]
    fn sector_size_scales_result() {
        let op = text_op(
            LayoutKind::PtSf,
            "label: dos\nsector-size: 4096\n/dev/sda1 : start=256, size=256\n",
        );
        assert_eq!(op_required_bytes(&op).unwrap(), Some(512 * 4096));
    }

    #[test]
    fn parted_device_and_partition_lines() {
        let machine = text_op(
            LayoutKind::PtParted,
            "BYT;\n/dev/sda:2000000s:scsi:512:512:msdos:USB:;\n1:2048s:999999s:997952s:ext4::;\n",
        );
        assert_eq!(op_required_bytes(&machine).unwrap(), Some(2_000_000 * 512));

        let human = text_op(LayoutKind::PtParted, "Disk /dev/sda: 1000s\n");
        assert_eq!(op_required_bytes(&human).unwrap(), Some(1000 * 512));
    }

    #[test]
    fn device_name_file_has_no_size() {
        let op = text_op(LayoutKind::Disk, "sda\n");
        assert_eq!(op_required_bytes(&op).unwrap(), None);
        assert_eq!(estimate_required_size(&[op], None).unwrap(), None);
    }

    #[test]
    fn unions_every_file_in_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("sda-pt.sf"),
            "label: dos\n/dev/sda1 : start=2048, size=2048\n",
        )
        .unwrap();
        let mut gpt = vec![0u8; 1024];
        gpt[512..520].copy_from_slice(b"EFI PART");
        gpt[512 + 24..512 + 32].copy_from_slice(&100u64.to_le_bytes());
        gpt[512 + 32..512 + 40].copy_from_slice(&200u64.to_le_bytes());
        gpt[512 + 48..512 + 56].copy_from_slice(&150u64.to_le_bytes());
        fs::write(dir.path().join("sda-pt.sgdisk"), &gpt).unwrap();

        let selected: Vec<DiskLayoutOp> = select_layout_ops(collect_layout_ops(dir.path()).unwrap())
            .into_iter()
            .filter(|op| op.kind == LayoutKind::PtSgdisk)
            .collect();
        assert_eq!(
            estimate_required_size(&selected, None).unwrap(),
            Some(201 * 512)
        );
        assert_eq!(
            estimate_required_size(&selected, Some(dir.path())).unwrap(),
            Some(4096 * 512)
        );
    }

    #[test]
    fn corrupt_sector_numbers_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut gpt = vec![0u8; 1024];
        gpt[512..520].copy_from_slice(b"EFI PART");
        gpt[512 + 32..512 + 40].copy_from_slice(&u64::MAX.to_le_bytes());
        let path = dir.path().join("sda-pt.sgdisk");
        fs::write(&path, &gpt).unwrap();
        let op = DiskLayoutOp::read(LayoutKind::PtSgdisk, &path).unwrap();
        assert!(matches!(op_required_bytes(&op), Err(Error::ImageFormat(_))));

        let last_lba = text_op(
            LayoutKind::PtSf,
            "label: gpt\nlast-lba: 18446744073709551615\n/dev/sda1 : start=2048, size=1000\n",
        );
        assert!(matches!(op_required_bytes(&last_lba), Err(Error::ImageFormat(_))));

        let entry = text_op(
            LayoutKind::PtSf,
            "label: dos\n/dev/sda1 : start=18446744073709551000, size=4096\n",
        );
        assert!(matches!(op_required_bytes(&entry), Err(Error::ImageFormat(_))));

        let sector_size = text_op(
            LayoutKind::PtSf,
            "label: dos\nsector-size: 4096\n/dev/sda1 : start=2048, size=18446744073709550000\n",
        );
        assert!(matches!(
            estimate_required_size(&[sector_size], None),
            Err(Error::ImageFormat(_))
        ));
    }
}
