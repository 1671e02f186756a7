//! Proportional partition resizing for a larger target disk.
//!
//! Partitions are walked in start order. Every partition but the last is
//! scaled by `target / source`; the last one takes everything up to the
//! final sector. A partition keeps its original start unless that start
//! now falls inside its predecessor, in which case it is pushed just past
//! the predecessor's new end.
use crate::error::{Error, Result};
use tracing::info;

/// A partition's position on the source disk, in sectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub start: u64,
    pub size: u64,
}

impl Extent {
    pub fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// One past the last sector.
    pub fn end_exclusive(&self) -> u64 {
        self.start.saturating_add(self.size)
    }
}

/// A partition's new position, tied to its index in the input slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub index: usize,
    pub start: u64,
    pub size: u64,
}

impl Placement {
    /// The last sector the partition occupies.
    pub fn end(&self) -> u64 {
        self.start + self.size - 1
    }
}

/// Scales `extents` onto a disk of `target_sectors`.
///
/// Returns placements in start order, or `None` when the target is not
/// larger than the source (the highest end of any extent) or there is
/// nothing to scale. Zero-sized extents must be filtered by the caller.
///
/// # Errors
///
/// Returns [`Error::Layout`] when a partition would start at or beyond
/// the end of the target.
pub fn scale_geometry(extents: &[Extent], target_sectors: u64) -> Result<Option<Vec<Placement>>> {
    let Some(source_sectors) = extents.iter().map(Extent::end_exclusive).max() else {
        return Ok(None);
    };
    if source_sectors == 0 || target_sectors <= source_sectors {
        return Ok(None);
    }
    let scale = target_sectors as f64 / source_sectors as f64;
    info!(source_sectors, target_sectors, scale, "Scaling partition layout");

    let mut order: Vec<usize> = (0..extents.len()).collect();
    order.sort_by_key(|&i| (extents[i].start, i));

    let mut placements = Vec::with_capacity(extents.len());
    let mut next_free: u64 = 0;
    for (position, &index) in order.iter().enumerate() {
        let extent = extents[index];
        let start = extent.start.max(next_free);
        if start >= target_sectors {
            return Err(Error::Layout(format!(
                "scaled partition {} would start at sector {start}, beyond the {target_sectors}-sector target",
                index + 1
            )));
        }
        let remaining = target_sectors - start;
        let size = if position == order.len() - 1 {
            remaining
        } else {
            let scaled = ((extent.size as f64 * scale).round() as u64).max(1);
            scaled.min(remaining)
        };
        let placement = Placement { index, start, size };
        info!(
            partition = index + 1,
            old_start = extent.start,
            old_size = extent.size,
            new_start = start,
            new_size = size,
            "Partition resized"
        );
        next_free = placement.end() + 1;
        placements.push(placement);
    }
    Ok(Some(placements))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_sound(placements: &[Placement], target: u64) {
        assert_eq!(placements.last().unwrap().end(), target - 1);
        for pair in placements.windows(2) {
            assert!(pair[1].start > pair[0].end(), "{pair:?} overlap");
        }
        assert!(placements.iter().all(|p| p.size >= 1));
    }

    #[test]
    fn abstains_when_target_not_larger() {
        let parts = [Extent::new(2048, 1000), Extent::new(3048, 2000)];
        assert_eq!(scale_geometry(&parts, 5048).unwrap(), None);
        assert_eq!(scale_geometry(&parts, 4000).unwrap(), None);
        assert_eq!(scale_geometry(&[], 10_000).unwrap(), None);
    }

    #[test]
    fn single_partition_takes_whole_disk() {
        let placed = scale_geometry(&[Extent::new(2048, 8192)], 1_000_000)
            .unwrap()
            .unwrap();
        assert_eq!(placed, vec![Placement { index: 0, start: 2048, size: 1_000_000 - 2048 }]);
        assert_sound(&placed, 1_000_000);
    }

    #[test]
    fn doubles_two_partitions() {
        // Source: 2048 + 100_000 + 100_000 = 202_048 sectors; target 2x.
        let parts = [Extent::new(2048, 100_000), Extent::new(102_048, 100_000)];
        let placed = scale_geometry(&parts, 404_096).unwrap().unwrap();
        assert_eq!(placed[0], Placement { index: 0, start: 2048, size: 200_000 });
        assert_eq!(placed[1].start, 202_048);
        assert_eq!(placed[1].end(), 404_095);
        assert_sound(&placed, 404_096);
    }

    #[test]
    fn pushes_start_forward_on_overlap() {
        // The second partition originally starts right after the first, so the
        // grown first partition forces it forward.
        let parts = [Extent::new(0, 1000), Extent::new(1000, 1000)];
        let placed = scale_geometry(&parts, 3000).unwrap().unwrap();
        assert_eq!(placed[0].size, 1500);
        assert_eq!(placed[1].start, 1500);
        assert_eq!(placed[1].size, 1500);
        assert_sound(&placed, 3000);
    }

    #[test]
    fn keeps_start_when_gap_absorbs_growth() {
        let parts = [Extent::new(0, 100), Extent::new(5000, 1000)];
        let placed = scale_geometry(&parts, 6600).unwrap().unwrap();
        assert_eq!(placed[0].size, 110);
        assert_eq!(placed[1].start, 5000);
        assert_sound(&placed, 6600);
    }

    #[test]
    fn zero_slack_one_sector_larger() {
        let parts = [Extent::new(0, 10), Extent::new(10, 10)];
        let placed = scale_geometry(&parts, 21).unwrap().unwrap();
        assert_eq!(placed[0], Placement { index: 0, start: 0, size: 11 });
        assert_eq!(placed[1], Placement { index: 1, start: 11, size: 10 });
        assert_sound(&placed, 21);
    }

    #[test]
    fn orders_by_start_not_input_order() {
        let parts = [Extent::new(600, 400), Extent::new(100, 500)];
        let placed = scale_geometry(&parts, 2000).unwrap().unwrap();
        assert_eq!(placed[0].index, 1);
        assert_eq!(placed[1].index, 0);
        assert_sound(&placed, 2000);
    }

    #[test]
    fn cascading_bumps_past_target_are_fatal() {
        // Four packed one-sector partitions at scale 1.5: each rounds up to
        // two sectors, pushing the last one onto the target boundary.
        let parts: Vec<Extent> = (0..4).map(|i| Extent::new(i, 1)).collect();
        let err = scale_geometry(&parts, 6).unwrap_err();
        assert!(matches!(err, Error::Layout(_)));
        assert!(err.to_string().contains("beyond"));
    }

    #[test]
    fn pushed_partition_still_fits() {
        let parts = [Extent::new(0, 1000), Extent::new(1000, 1)];
        let placed = scale_geometry(&parts, 1002).unwrap().unwrap();
        assert_eq!(placed[0].size, 1001);
        assert_eq!(placed[1], Placement { index: 1, start: 1001, size: 1 });
        assert_sound(&placed, 1002);
    }

    #[test]
    fn rounds_half_away_from_zero() {
        // 3 * 1.5 = 4.5 rounds to 5.
        let parts = [Extent::new(0, 3), Extent::new(3, 1)];
        let placed = scale_geometry(&parts, 6).unwrap().unwrap();
        assert_eq!(placed[0].size, 5);
        assert_eq!(placed[1], Placement { index: 1, start: 5, size: 1 });
    }
}
