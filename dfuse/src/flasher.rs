use log::debug;

use crate::connection::{DfuTransport, DfuseConnection};
use crate::error::DfuseError;
use crate::target::TargetEntry;

/// The three sequential passes of a flashing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
    Erase,
    Program,
    Verify,
}

/// Erase, program and verify all target entries, each as a full pass over
/// the set. Verification only makes sense once every sector holds its
/// final content, and grouping by phase keeps failure isolation simple.
///
/// A failure aborts the run immediately; partially erased or programmed
/// flash is left as-is and the whole run must be restarted.
///
/// `progress` is called as `(phase, done, total)` before each sector of a
/// pass and once more with `done == total` when the pass finishes.
pub fn program_device<T: DfuTransport>(
    conn: &mut DfuseConnection<T>,
    targets: &[TargetEntry],
    transfer_size: u32,
    progress: &mut dyn FnMut(FlashPhase, usize, usize),
) -> Result<(), DfuseError> {
    let total = targets.len();

    for (i, entry) in targets.iter().enumerate() {
        progress(FlashPhase::Erase, i, total);
        erase_sector(conn, entry)?;
    }
    progress(FlashPhase::Erase, total, total);

    for (i, entry) in targets.iter().enumerate() {
        progress(FlashPhase::Program, i, total);
        program_sector(conn, entry, transfer_size)?;
    }
    progress(FlashPhase::Program, total, total);

    for (i, entry) in targets.iter().enumerate() {
        progress(FlashPhase::Verify, i, total);
        verify_sector(conn, entry, transfer_size)?;
    }
    progress(FlashPhase::Verify, total, total);

    Ok(())
}

fn erase_sector<T: DfuTransport>(
    conn: &mut DfuseConnection<T>,
    entry: &TargetEntry,
) -> Result<(), DfuseError> {
    let sector = &entry.sector;
    debug!("erasing sector {:#010x} ({} bytes)", sector.start, sector.len);
    conn.select_alternate(sector.alternate)?;
    conn.erase_page(sector.start, sector.len)
}

fn program_sector<T: DfuTransport>(
    conn: &mut DfuseConnection<T>,
    entry: &TargetEntry,
    transfer_size: u32,
) -> Result<(), DfuseError> {
    let sector = &entry.sector;
    conn.select_alternate(sector.alternate)?;
    conn.set_address(sector.start)?;

    let chunk = chunk_size(sector.len, transfer_size);
    debug!(
        "programming sector {:#010x} in {} byte blocks",
        sector.start, chunk
    );
    for (block, data) in entry.payload.chunks(chunk as usize).enumerate() {
        conn.write_block(block as u16, data)?;
    }
    Ok(())
}

fn verify_sector<T: DfuTransport>(
    conn: &mut DfuseConnection<T>,
    entry: &TargetEntry,
    transfer_size: u32,
) -> Result<(), DfuseError> {
    let sector = &entry.sector;
    conn.select_alternate(sector.alternate)?;
    conn.set_address(sector.start)?;

    let chunk = chunk_size(sector.len, transfer_size);
    let mut observed = Vec::with_capacity(sector.len as usize);
    for block in 0..(sector.len / chunk) {
        observed.extend(conn.read_block(block as u16, chunk as u16)?);
    }
    // back out of the upload phase
    conn.abort()?;

    if let Some(pos) = first_mismatch(&entry.payload, &observed)? {
        let win = window_start(pos);
        let end = (win + 16).min(entry.payload.len());
        return Err(DfuseError::Verify {
            address: sector.start + win as u32,
            expected: entry.payload[win..end].to_vec(),
            observed: observed[win..end].to_vec(),
        });
    }
    Ok(())
}

/// Uniform block size for a sector: every chunk divides the sector length
/// evenly, and none exceeds what the transport allows per transfer.
pub fn chunk_size(sector_len: u32, max_transfer: u32) -> u32 {
    gcd(sector_len, max_transfer)
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Index of the first differing byte, or `None` when equal. Comparing
/// sequences of different lengths is a usage error, not a pass.
pub fn first_mismatch(
    expected: &[u8],
    observed: &[u8],
) -> Result<Option<usize>, DfuseError> {
    if expected.len() != observed.len() {
        return Err(DfuseError::VerifyLength {
            expected: expected.len(),
            observed: observed.len(),
        });
    }
    Ok(expected.iter().zip(observed).position(|(a, b)| a != b))
}

/// Round a mismatch offset down to its 16-byte hex dump row.
pub fn window_start(pos: usize) -> usize {
    pos & !0xF
}
