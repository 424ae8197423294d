use log::warn;

use crate::image::FirmwareImage;
use crate::sector::Sector;

/// A sector that needs flashing, paired with its full-length payload
/// (image bytes over the sector span, gaps filled with `0xFF`).
#[derive(Debug, Clone)]
pub struct TargetEntry {
    pub sector: Sector,
    pub payload: Vec<u8>,
}

/// Pick the sectors any image segment overlaps and materialize their
/// payloads. Untouched sectors are skipped entirely: they are neither
/// erased nor written, to spare erase cycles and unrelated flash contents.
pub fn select_targets(
    sectors: &[Sector],
    image: &impl FirmwareImage,
) -> Vec<TargetEntry> {
    let segments = image.segments();
    sectors
        .iter()
        .filter(|sector| {
            segments
                .iter()
                .any(|&(start, end)| touches(sector, start, end))
        })
        .map(|sector| {
            if !sector.mode.writable() {
                warn!(
                    "image touches non-writable sector {:#010x} ({})",
                    sector.start, sector.name
                );
            }
            TargetEntry {
                sector: sector.clone(),
                payload: image.read_span(sector.start, sector.end()),
            }
        })
        .collect()
}

fn touches(sector: &Sector, seg_start: u32, seg_end: u32) -> bool {
    (seg_start < sector.start && seg_end > sector.start)
        || (seg_start >= sector.start && seg_start < sector.end())
}
