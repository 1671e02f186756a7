//! Binary partition-table blobs: GPT headers as saved by `sgdisk --backup`
//! and raw MBR sectors.
const SECTOR: u64 = 512;
const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const MBR_TABLE_OFFSET: usize = 0x1BE;
const MBR_ENTRY_LEN: usize = 16;
const GPT_PROTECTIVE: u8 = 0xEE;

fn read_u64_le(bytes: &[u8], offset: usize) -> Option<u64> {
    let raw = bytes.get(offset..offset + 8)?;
    Some(u64::from_le_bytes(raw.try_into().ok()?))
}

fn read_u32_le(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(raw.try_into().ok()?))
}

/// The LBA fields of a GPT header that bound the disk size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GptHeader {
    pub current_lba: u64,
    pub backup_lba: u64,
    pub last_usable_lba: u64,
}

impl GptHeader {
    /// Finds the first `EFI PART` signature in `blob` and reads the header
    /// behind it.
    pub fn find(blob: &[u8]) -> Option<Self> {
        let offset = blob
            .windows(GPT_SIGNATURE.len())
            .position(|w| w == GPT_SIGNATURE)?;
        Some(GptHeader {
            current_lba: read_u64_le(blob, offset + 24)?,
            backup_lba: read_u64_le(blob, offset + 32)?,
            last_usable_lba: read_u64_le(blob, offset + 48)?,
        })
    }

    pub fn max_lba(&self) -> u64 {
        self.current_lba
            .max(self.backup_lba)
            .max(self.last_usable_lba)
    }

    /// Bytes the source disk must have had to hold this header. `None`
    /// when the LBAs are too large to describe a real disk.
    pub fn required_bytes(&self) -> Option<u64> {
        self.max_lba().checked_add(1)?.checked_mul(SECTOR)
    }
}

/// Whether `blob` carries a GPT header anywhere.
pub fn has_gpt_signature(blob: &[u8]) -> bool {
    GptHeader::find(blob).is_some()
}

/// One primary partition slot of an MBR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MbrEntry {
    pub bootable: bool,
    pub type_code: u8,
    pub start_lba: u32,
    pub sectors: u32,
}

impl MbrEntry {
    pub fn end_lba(&self) -> u64 {
        u64::from(self.start_lba) + u64::from(self.sectors).saturating_sub(1)
    }
}

/// Reads the four primary entries of an MBR sector, skipping empty slots.
///
/// Returns `None` when the 0x55AA boot signature is absent.
pub fn parse_mbr(sector: &[u8]) -> Option<Vec<MbrEntry>> {
    if sector.get(510..512)? != MBR_SIGNATURE {
        return None;
    }
    let entries = (0..4)
        .filter_map(|slot| {
            let base = MBR_TABLE_OFFSET + slot * MBR_ENTRY_LEN;
            let entry = MbrEntry {
                bootable: sector[base] == 0x80,
                type_code: sector[base + 4],
                start_lba: read_u32_le(sector, base + 8)?,
                sectors: read_u32_le(sector, base + 12)?,
            };
            (entry.type_code != 0 && entry.sectors > 0).then_some(entry)
        })
        .collect();
    Some(entries)
}

/// Bytes needed to hold every partition of an MBR.
///
/// Protective entries (type 0xEE) are skipped: they are clamped to 2 TiB on
/// large disks and the GPT backup describes the real geometry.
pub fn mbr_required_bytes(sector: &[u8]) -> Option<u64> {
    let entries = parse_mbr(sector)?;
    entries
        .iter()
        .filter(|e| e.type_code != GPT_PROTECTIVE)
        .filter_map(|e| e.end_lba().checked_add(1)?.checked_mul(SECTOR))
        .max()
}
