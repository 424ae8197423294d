use std::collections::BTreeMap;

/// Value of unprogrammed NOR flash; gaps in the image are filled with it.
pub const FILL_BYTE: u8 = 0xFF;

/// Sparse address-to-byte mapping of a firmware image.
///
/// Image *format* parsing happens elsewhere; the flashing engine only needs
/// the occupied address ranges and raw bytes over an arbitrary span.
pub trait FirmwareImage {
    /// Disjoint occupied `[start, end)` ranges, in ascending address order.
    fn segments(&self) -> Vec<(u32, u32)>;

    /// Raw bytes over `[start, end)`, with [`FILL_BYTE`] for addresses the
    /// image does not define.
    fn read_span(&self, start: u32, end: u32) -> Vec<u8>;
}

/// In-memory [`FirmwareImage`] built from one or more byte runs.
#[derive(Debug, Default)]
pub struct SparseImage {
    parts: BTreeMap<u32, Vec<u8>>,
}

impl SparseImage {
    pub fn new() -> Self {
        SparseImage::default()
    }

    /// Whole image as one run starting at `base` (raw binary file case).
    pub fn from_binary(base: u32, data: Vec<u8>) -> Self {
        let mut image = SparseImage::new();
        image.insert(base, data);
        image
    }

    /// Add a byte run. Runs must not overlap.
    pub fn insert(&mut self, addr: u32, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        debug_assert!(
            !self.overlaps(addr, addr + data.len() as u32),
            "overlapping image runs"
        );
        self.parts.insert(addr, data);
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    fn overlaps(&self, start: u32, end: u32) -> bool {
        self.parts
            .iter()
            .any(|(&a, d)| a < end && a + d.len() as u32 > start)
    }
}

impl FirmwareImage for SparseImage {
    fn segments(&self) -> Vec<(u32, u32)> {
        let mut segments: Vec<(u32, u32)> = Vec::new();
        for (&addr, data) in &self.parts {
            let end = addr + data.len() as u32;
            match segments.last_mut() {
                Some(last) if last.1 == addr => last.1 = end,
                _ => segments.push((addr, end)),
            }
        }
        segments
    }

    fn read_span(&self, start: u32, end: u32) -> Vec<u8> {
        let mut out = vec![FILL_BYTE; (end - start) as usize];
        for (&addr, data) in &self.parts {
            let part_end = addr + data.len() as u32;
            if part_end <= start || addr >= end {
                continue;
            }
            let from = start.max(addr);
            let to = end.min(part_end);
            let src = &data[(from - addr) as usize..(to - addr) as usize];
            out[(from - start) as usize..(to - start) as usize]
                .copy_from_slice(src);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_coalesce_adjacent_runs() {
        let mut image = SparseImage::new();
        image.insert(0x0800_0000, vec![1, 2, 3, 4]);
        image.insert(0x0800_0004, vec![5, 6]);
        image.insert(0x0800_1000, vec![7]);
        assert_eq!(
            image.segments(),
            vec![(0x0800_0000, 0x0800_0006), (0x0800_1000, 0x0800_1001)]
        );
    }

    #[test]
    fn read_span_fills_gaps() {
        let mut image = SparseImage::new();
        image.insert(0x100, vec![0xDE, 0xAD]);
        image.insert(0x104, vec![0xBE]);
        let span = image.read_span(0xFE, 0x106);
        assert_eq!(
            span,
            [0xFF, 0xFF, 0xDE, 0xAD, 0xFF, 0xFF, 0xBE, 0xFF]
        );
    }

    #[test]
    fn read_span_clips_partial_runs() {
        let image = SparseImage::from_binary(0x200, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(image.read_span(0x202, 0x204), [3, 4]);
        assert_eq!(image.read_span(0x0, 0x2), [0xFF, 0xFF]);
    }

    #[test]
    fn empty_image() {
        let image = SparseImage::new();
        assert!(image.is_empty());
        assert!(image.segments().is_empty());
        assert_eq!(image.read_span(0, 4), [0xFF; 4]);
    }
}
