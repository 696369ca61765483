use thiserror::Error;

/// Width of a linear-index window as a shift (16 KiB windows).
pub const LINEAR_SHIFT: u32 = 14;

/// Coordinates at or beyond this cannot be binned (512 MiB space).
pub const MAX_COORD: u64 = 1 << 29;

/// Highest valid bin id across all six levels.
pub const MAX_BIN: u32 = 37448;

// First bin id of each level, coarsest to finest.
const LEVEL_OFFSETS: [u32; 6] = [0, 1, 9, 73, 585, 4681];
// Interval width of a bin at each level, as a shift.
const LEVEL_SHIFTS: [u32; 6] = [29, 26, 23, 20, 17, 14];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BinningError {
    #[error("coordinate {0} outside the supported 2^29 window")]
    CoordinateRange(u64),
    #[error("empty interval [{0}, {1})")]
    EmptyInterval(u64, u64),
}

fn check_interval(start: u64, end: u64) -> Result<(), BinningError> {
    if end <= start {
        return Err(BinningError::EmptyInterval(start, end));
    }
    if end > MAX_COORD {
        return Err(BinningError::CoordinateRange(end));
    }
    Ok(())
}

/// Bin number of the finest bin containing the half-open interval
/// `[start, end)`.
pub fn bin_of(start: u64, end: u64) -> Result<u32, BinningError> {
    check_interval(start, end)?;
    let last = end - 1;
    for level in (1..=5).rev() {
        let shift = LEVEL_SHIFTS[level];
        if start >> shift == last >> shift {
            return Ok(LEVEL_OFFSETS[level] + (start >> shift) as u32);
        }
    }
    Ok(0)
}

/// All bins whose interval intersects `[start, end)`, sorted ascending.
///
/// Bin 0 is always present; levels are emitted coarsest first so the
/// result is sorted and duplicate-free by construction.
pub fn overlapping_bins(start: u64, end: u64) -> Result<Vec<u32>, BinningError> {
    check_interval(start, end)?;
    let last = end - 1;
    let mut bins = vec![0u32];
    for level in 1..=5 {
        let shift = LEVEL_SHIFTS[level];
        let first = LEVEL_OFFSETS[level] + (start >> shift) as u32;
        let last_bin = LEVEL_OFFSETS[level] + (last >> shift) as u32;
        bins.extend(first..=last_bin);
    }
    Ok(bins)
}

/// Level (0..=5) of a bin id, or `None` above `MAX_BIN`.
pub fn bin_level(bin: u32) -> Option<usize> {
    if bin > MAX_BIN {
        return None;
    }
    Some(match bin {
        0 => 0,
        1..=8 => 1,
        9..=72 => 2,
        73..=584 => 3,
        585..=4680 => 4,
        _ => 5,
    })
}

/// The enclosing bin one level up, or `None` for bin 0.
pub fn parent_bin(bin: u32) -> Option<u32> {
    let level = bin_level(bin)?;
    if level == 0 {
        return None;
    }
    Some(LEVEL_OFFSETS[level - 1] + (bin - LEVEL_OFFSETS[level]) / 8)
}

/// The eight bins one level down, or `None` for a finest-level bin.
pub fn child_bins(bin: u32) -> Option<std::ops::RangeInclusive<u32>> {
    let level = bin_level(bin)?;
    if level == 5 {
        return None;
    }
    let first = LEVEL_OFFSETS[level + 1] + (bin - LEVEL_OFFSETS[level]) * 8;
    Some(first..=first + 7)
}

/// Linear-index window holding a coordinate.
pub fn window_of(pos: u64) -> usize {
    (pos >> LINEAR_SHIFT) as usize
}

// --- BEGIN TESTS --- //


// --- END TESTS --- //
