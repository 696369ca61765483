pub mod builder;
pub mod parser;
pub mod reader;
pub mod resolve;

use fxhash::FxHashMap;
use thiserror::Error;

use operon_bgzf::VirtualOffset;
use operon_common::binning::BinningError;
use operon_common::LINEAR_SHIFT;

pub use builder::BaiBuilder;
pub use reader::QueryResult;
pub use resolve::RefResolver;

pub(crate) const BAI_MAGIC_STR: [u8; 4] = [66, 65, 73, 1];

/// Gap under which adjacent chunks of a bin collapse into one.
pub const DEFAULT_MERGE_GAP: u64 = 65536;

/// Soft warning threshold for chunks accumulated in a single bin.
pub const DEFAULT_MAX_CHUNKS_PER_BIN: usize = 10_000;

#[derive(Error, Debug)]
pub enum BaiError {
    #[error("Missing BAI Magic String")]
    MissingMagicString,
    #[error("malformed BAI index: {0}")]
    Structure(String),
    #[error("index writer already finalized")]
    FinalizedWriter,
    #[error("binning error")]
    Binning(#[from] BinningError),
    #[error("operation cancelled")]
    Cancelled,
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
}

/// Half-open interval of virtual offsets belonging to one bin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub begin: VirtualOffset,
    pub end: VirtualOffset,
}

#[derive(Clone, Debug)]
pub struct BaiConfig {
    /// Window width of the linear index, as a shift. Non-default
    /// values are non-standard but round-trip through builder and
    /// query.
    pub linear_shift: u32,
    pub merge_gap: u64,
    pub max_chunks_per_bin: usize,
}

impl Default for BaiConfig {
    fn default() -> Self {
        BaiConfig {
            linear_shift: LINEAR_SHIFT,
            merge_gap: DEFAULT_MERGE_GAP,
            max_chunks_per_bin: DEFAULT_MAX_CHUNKS_PER_BIN,
        }
    }
}

/// Index data for one reference: bin table plus linear index.
#[derive(Clone, Debug, Default)]
pub struct BaiReference {
    pub(crate) bins: FxHashMap<u32, Vec<Chunk>>,
    pub(crate) linear: Vec<VirtualOffset>,
    // in-memory metadata only; the binary format has no name field
    pub(crate) name: Option<String>,
}

impl BaiReference {
    pub fn bins(&self) -> &FxHashMap<u32, Vec<Chunk>> {
        &self.bins
    }

    pub fn chunks(&self, bin: u32) -> Option<&[Chunk]> {
        self.bins.get(&bin).map(|chunks| chunks.as_slice())
    }

    pub fn linear(&self) -> &[VirtualOffset] {
        &self.linear
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// A decoded (or finalized) BAI index. Read-only.
#[derive(Clone, Debug)]
pub struct BaiIndex {
    pub(crate) references: Vec<BaiReference>,
    pub(crate) config: BaiConfig,
}

impl BaiIndex {
    pub fn references(&self) -> &[BaiReference] {
        &self.references
    }

    pub fn reference(&self, ref_id: i32) -> Option<&BaiReference> {
        usize::try_from(ref_id)
            .ok()
            .and_then(|i| self.references.get(i))
    }

    pub fn n_ref(&self) -> usize {
        self.references.len()
    }

    /// Attach reference names from a BAM header for display purposes;
    /// never serialized.
    pub fn attach_names<'a, I>(&mut self, names: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for (reference, name) in self.references.iter_mut().zip(names) {
            reference.name = Some(name.to_string());
        }
    }
}

/// Collapse sorted chunks whose gap is at most `gap` compressed bytes.
pub(crate) fn merge_chunks(chunks: &mut Vec<Chunk>, gap: u64) {
    let mut merged: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks.drain(..) {
        match merged.last_mut() {
            Some(last) if chunk.begin.as_u64().saturating_sub(last.end.as_u64()) <= gap => {
                if chunk.end > last.end {
                    last.end = chunk.end;
                }
            }
            _ => merged.push(chunk),
        }
    }
    *chunks = merged;
}

// --- BEGIN TESTS --- //

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(begin: u64, end: u64) -> Chunk {
        Chunk {
            begin: VirtualOffset::from(begin),
            end: VirtualOffset::from(end),
        }
    }

    #[test]
    fn merging_respects_the_gap() {
        let mut chunks = vec![chunk(100, 200), chunk(200, 300), chunk(70_000, 70_100)];
        merge_chunks(&mut chunks, 1000);
        assert_eq!(chunks, vec![chunk(100, 300), chunk(70_000, 70_100)]);

        let mut chunks = vec![chunk(100, 200), chunk(200, 300), chunk(70_000, 70_100)];
        merge_chunks(&mut chunks, DEFAULT_MERGE_GAP);
        assert_eq!(chunks, vec![chunk(100, 70_100)]);
    }

    #[test]
    fn merging_keeps_contained_chunks() {
        let mut chunks = vec![chunk(100, 500), chunk(150, 300)];
        merge_chunks(&mut chunks, 0);
        assert_eq!(chunks, vec![chunk(100, 500)]);
    }
}

// --- END TESTS --- //
