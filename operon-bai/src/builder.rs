// ****************************************** //
//               BAI Construction             //
// ****************************************** //

use byteorder::{LittleEndian, WriteBytesExt};
use log::warn;
use std::io::Write;

use operon_bam::Record;
use operon_bgzf::VirtualOffset;
use operon_common::{binning, CancelToken};

use crate::{merge_chunks, BaiConfig, BaiError, BaiIndex, BaiReference, Chunk, BAI_MAGIC_STR};

/// Streaming accumulator for a BAI index.
///
/// Feed it each alignment as it is written, with the virtual-offset
/// interval the record occupies in the compressed stream, then
/// `finalize` once. The builder is the single owner of its state until
/// then; the produced `BaiIndex` is immutable.
#[derive(Debug, Default)]
pub struct BaiBuilder {
    references: Vec<BaiReference>,
    config: BaiConfig,
    finalized: bool,
    cancel: CancelToken,
}

impl BaiBuilder {
    pub fn new() -> Self {
        BaiBuilder::default()
    }

    pub fn with_config(config: BaiConfig) -> Self {
        BaiBuilder {
            config,
            ..BaiBuilder::default()
        }
    }

    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = token;
    }

    /// Pre-size the reference list so references without aligned
    /// records still serialize as (empty) entries.
    pub fn set_reference_count(&mut self, n_ref: usize) {
        if n_ref > self.references.len() {
            self.references.resize_with(n_ref, BaiReference::default);
        }
    }

    /// Record that `record` occupies `[vo_begin, vo_end)` in the
    /// compressed stream. Unmapped records are ignored.
    pub fn add_alignment(
        &mut self,
        record: &Record,
        vo_begin: VirtualOffset,
        vo_end: VirtualOffset,
    ) -> Result<(), BaiError> {
        if self.finalized {
            return Err(BaiError::FinalizedWriter);
        }
        if self.cancel.is_cancelled() {
            return Err(BaiError::Cancelled);
        }
        if record.ref_id < 0 || record.pos < 0 {
            return Ok(());
        }
        if vo_end <= vo_begin {
            return Err(BaiError::Structure(format!(
                "chunk end {vo_end} not after begin {vo_begin}"
            )));
        }

        let start = record.pos as u64;
        let end = start + record.reference_span().max(1);
        let bin = binning::bin_of(start, end)?;

        let ref_id = record.ref_id as usize;
        self.set_reference_count(ref_id + 1);
        let reference = &mut self.references[ref_id];

        let chunks = reference.bins.entry(bin).or_default();
        chunks.push(Chunk {
            begin: vo_begin,
            end: vo_end,
        });
        if chunks.len() == self.config.max_chunks_per_bin + 1 {
            warn!(
                "reference {ref_id}: bin {bin} exceeds {} chunks",
                self.config.max_chunks_per_bin
            );
        }

        let shift = self.config.linear_shift;
        let win_beg = (start >> shift) as usize;
        let win_end = ((end - 1) >> shift) as usize;
        if win_end >= reference.linear.len() {
            reference.linear.resize(win_end + 1, VirtualOffset::ZERO);
        }
        for slot in &mut reference.linear[win_beg..=win_end] {
            if slot.is_zero() || vo_begin < *slot {
                *slot = vo_begin;
            }
        }
        Ok(())
    }

    /// Move the accumulator into a read-only index: chunks sorted per
    /// bin and gap-merged, linear indices sanity-checked.
    pub fn finalize(&mut self) -> Result<BaiIndex, BaiError> {
        if self.finalized {
            return Err(BaiError::FinalizedWriter);
        }
        self.finalized = true;

        let mut references = std::mem::take(&mut self.references);
        for (ref_id, reference) in references.iter_mut().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(BaiError::Cancelled);
            }
            for chunks in reference.bins.values_mut() {
                chunks.sort_by_key(|chunk| chunk.begin);
                merge_chunks(chunks, self.config.merge_gap);
            }
            let mut prev = VirtualOffset::ZERO;
            for (window, slot) in reference.linear.iter().enumerate() {
                if slot.is_zero() {
                    continue;
                }
                if *slot < prev {
                    warn!("reference {ref_id}: linear index decreases at window {window}");
                }
                prev = *slot;
            }
        }
        Ok(BaiIndex {
            references,
            config: self.config.clone(),
        })
    }
}

impl BaiIndex {
    /// Write the standard binary BAI layout, little-endian throughout.
    /// Bins are emitted in ascending id order.
    pub fn serialize<W: Write>(&self, sink: &mut W) -> Result<(), BaiError> {
        sink.write_all(&BAI_MAGIC_STR)?;
        sink.write_i32::<LittleEndian>(self.references.len() as i32)?;
        for reference in &self.references {
            let mut bin_ids: Vec<u32> = reference.bins.keys().copied().collect();
            bin_ids.sort_unstable();
            sink.write_i32::<LittleEndian>(bin_ids.len() as i32)?;
            for bin in bin_ids {
                let chunks = &reference.bins[&bin];
                sink.write_u32::<LittleEndian>(bin)?;
                sink.write_i32::<LittleEndian>(chunks.len() as i32)?;
                for chunk in chunks {
                    sink.write_u64::<LittleEndian>(chunk.begin.as_u64())?;
                    sink.write_u64::<LittleEndian>(chunk.end.as_u64())?;
                }
            }
            sink.write_i32::<LittleEndian>(reference.linear.len() as i32)?;
            for slot in &reference.linear {
                sink.write_u64::<LittleEndian>(slot.as_u64())?;
            }
        }
        Ok(())
    }
}

// --- BEGIN TESTS --- //


// --- END TESTS --- //
