use log::warn;
use std::io::Read;

use operon_bgzf::VirtualOffset;
use operon_common::binning::{self, MAX_BIN};
use operon_common::LINEAR_SHIFT;

use crate::{merge_chunks, parser, BaiConfig, BaiError, BaiIndex, Chunk};

/// Byte ranges answering a coordinate-range query.
///
/// The caller layer realizes the read by fetching each chunk's
/// compressed range; this core only computes which ranges matter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryResult {
    pub ref_id: i32,
    pub start: u64,
    pub end: u64,
    pub chunks: Vec<Chunk>,
    pub min_offset: Option<VirtualOffset>,
}

impl BaiIndex {
    pub fn read<R: Read>(src: &mut R) -> Result<BaiIndex, BaiError> {
        BaiIndex::read_with_config(src, BaiConfig::default())
    }

    pub fn read_with_config<R: Read>(src: &mut R, config: BaiConfig) -> Result<BaiIndex, BaiError> {
        let mut bytes = Vec::new();
        src.read_to_end(&mut bytes)?;
        let references = parser::read_index(&bytes)?;
        let index = BaiIndex { references, config };
        index.validate(false)?;
        Ok(index)
    }

    /// Chunks a reader must visit to cover `[start, end)` on
    /// `ref_id`: overlapping bins, linear-index floor, gap merge.
    pub fn query(&self, ref_id: i32, start: u64, end: u64) -> Result<QueryResult, BaiError> {
        let reference = self.reference(ref_id).ok_or_else(|| {
            BaiError::Structure(format!("reference id {ref_id} outside the index"))
        })?;

        let bins = binning::overlapping_bins(start, end)?;
        let mut chunks: Vec<Chunk> = bins
            .iter()
            .filter_map(|bin| reference.bins.get(bin))
            .flatten()
            .copied()
            .collect();
        chunks.sort_by_key(|chunk| chunk.begin);

        let shift = self.config.linear_shift;
        let win_beg = (start >> shift) as usize;
        let win_end = ((end - 1) >> shift) as usize;
        let floor = (win_beg..=win_end)
            .map_while(|window| reference.linear.get(window))
            .find(|slot| !slot.is_zero())
            .copied();
        if let Some(floor) = floor {
            chunks.retain(|chunk| chunk.begin >= floor);
        }

        merge_chunks(&mut chunks, self.config.merge_gap);
        Ok(QueryResult {
            ref_id,
            start,
            end,
            min_offset: chunks.first().map(|chunk| chunk.begin),
            chunks,
        })
    }

    /// Structural checks; `thorough` adds the bin/linear cross-check,
    /// which only warns because real-world indices frequently violate
    /// it.
    pub fn validate(&self, thorough: bool) -> Result<(), BaiError> {
        for (ref_id, reference) in self.references.iter().enumerate() {
            for (bin, chunks) in &reference.bins {
                if *bin > MAX_BIN {
                    return Err(BaiError::Structure(format!(
                        "reference {ref_id}: bin id {bin} out of range"
                    )));
                }
                for chunk in chunks {
                    if chunk.end <= chunk.begin {
                        return Err(BaiError::Structure(format!(
                            "reference {ref_id}, bin {bin}: chunk end {} not after begin {}",
                            chunk.end, chunk.begin
                        )));
                    }
                }
                for pair in chunks.windows(2) {
                    if pair[1].begin < pair[0].end {
                        return Err(BaiError::Structure(format!(
                            "reference {ref_id}, bin {bin}: chunks unsorted or overlapping"
                        )));
                    }
                }
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
            if thorough && self.config.linear_shift == LINEAR_SHIFT {
                self.cross_check_linear(ref_id, reference);
            }
        }
        Ok(())
    }

    /// Every finest-level bin with chunks should be reflected in its
    /// linear window.
    fn cross_check_linear(&self, ref_id: usize, reference: &crate::BaiReference) {
        for (bin, chunks) in &reference.bins {
            if *bin < 4681 {
                continue;
            }
            let window = (*bin - 4681) as usize;
            let min_begin = match chunks.iter().map(|chunk| chunk.begin).min() {
                Some(begin) => begin,
                None => continue,
            };
            match reference.linear.get(window) {
                Some(slot) if !slot.is_zero() && *slot <= min_begin => {}
                _ => warn!(
                    "reference {ref_id}: bin {bin} is not reflected in linear window {window}"
                ),
            }
        }
    }
}

// --- BEGIN TESTS --- //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BaiBuilder;
    use crate::BaiReference;
    use fxhash::FxHashMap;
    use operon_bam::Record;
    use operon_common::CigarOp;
    use pretty_assertions::assert_eq;

    fn mapped(pos: i32, len: u32) -> Record {
        Record {
            qname: "r".into(),
            ref_id: 0,
            pos,
            cigar: vec![CigarOp::M(len)],
            next_ref_id: -1,
            next_pos: -1,
            ..Record::default()
        }
    }

    fn vo(value: u64) -> VirtualOffset {
        VirtualOffset::from(value)
    }

    /// Three 100 bp alignments at 0 / 20000 / 40000, at offsets
    /// 100 / 200 / 300.
    fn sample_index() -> BaiIndex {
        let mut builder = BaiBuilder::new();
        builder
            .add_alignment(&mapped(0, 100), vo(100), vo(200))
            .unwrap();
        builder
            .add_alignment(&mapped(20_000, 100), vo(200), vo(300))
            .unwrap();
        builder
            .add_alignment(&mapped(40_000, 100), vo(300), vo(400))
            .unwrap();
        builder.finalize().unwrap()
    }

    #[test]
    fn query_filters_and_merges() {
        let index = sample_index();

        let result = index.query(0, 15_000, 25_000).unwrap();
        assert_eq!(result.chunks.len(), 1);
        let covering = result.chunks[0];
        assert!(covering.begin <= vo(200) && vo(200) < covering.end);
        assert_eq!(result.min_offset, Some(covering.begin));

        let result = index.query(0, 0, 50_000).unwrap();
        assert_eq!(
            result.chunks,
            vec![Chunk {
                begin: vo(100),
                end: vo(400)
            }]
        );
    }

    #[test]
    fn linear_floor_drops_early_chunks() {
        // a long early alignment lands in coarse bin 73, which also
        // overlaps the late query window; only the linear floor can
        // exclude its chunk
        let mut builder = BaiBuilder::new();
        builder
            .add_alignment(&mapped(0, 200_000), vo(10), vo(20))
            .unwrap();
        builder
            .add_alignment(&mapped(500_000, 100), vo(200), vo(300))
            .unwrap();
        let index = builder.finalize().unwrap();

        let result = index.query(0, 500_000, 500_100).unwrap();
        assert_eq!(
            result.chunks,
            vec![Chunk {
                begin: vo(200),
                end: vo(300)
            }]
        );
    }

    #[test]
    fn every_indexed_alignment_is_covered_by_its_query() {
        let positions = [(0u64, 100u32), (20_000, 100), (40_000, 100)];
        let offsets = [(100u64, 200u64), (200, 300), (300, 400)];
        let index = sample_index();
        for ((pos, len), (begin, _)) in positions.iter().zip(offsets) {
            let result = index.query(0, *pos, pos + u64::from(*len)).unwrap();
            assert!(
                result
                    .chunks
                    .iter()
                    .any(|c| c.begin <= vo(begin) && vo(begin) < c.end),
                "offset {begin} not covered"
            );
        }
    }

    #[test]
    fn query_outside_the_reference_list_fails() {
        let index = sample_index();
        assert!(matches!(
            index.query(7, 0, 100),
            Err(BaiError::Structure(_))
        ));
        assert!(matches!(
            index.query(-1, 0, 100),
            Err(BaiError::Structure(_))
        ));
    }

    #[test]
    fn serialize_read_serialize_is_a_fixed_point() {
        let index = sample_index();
        let mut first = Vec::new();
        index.serialize(&mut first).unwrap();

        let decoded = BaiIndex::read(&mut &first[..]).unwrap();
        let mut second = Vec::new();
        decoded.serialize(&mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn reference_with_linear_but_no_bins_round_trips() {
        let reference = BaiReference {
            bins: FxHashMap::default(),
            linear: vec![vo(0), vo(4096)],
            name: None,
        };
        let index = BaiIndex {
            references: vec![reference],
            config: BaiConfig::default(),
        };
        let mut bytes = Vec::new();
        index.serialize(&mut bytes).unwrap();
        let decoded = BaiIndex::read(&mut &bytes[..]).unwrap();
        assert!(decoded.reference(0).unwrap().bins().is_empty());
        assert_eq!(decoded.reference(0).unwrap().linear().len(), 2);
    }

    #[test]
    fn reference_with_bins_but_no_linear_round_trips() {
        let mut bins = FxHashMap::default();
        bins.insert(
            4681u32,
            vec![Chunk {
                begin: vo(100),
                end: vo(200),
            }],
        );
        let index = BaiIndex {
            references: vec![BaiReference {
                bins,
                linear: Vec::new(),
                name: None,
            }],
            config: BaiConfig::default(),
        };
        let mut bytes = Vec::new();
        index.serialize(&mut bytes).unwrap();
        let decoded = BaiIndex::read(&mut &bytes[..]).unwrap();
        assert!(decoded.reference(0).unwrap().linear().is_empty());
        assert_eq!(decoded.reference(0).unwrap().chunks(4681).unwrap().len(), 1);
    }

    #[test]
    fn validate_rejects_disordered_chunks() {
        let mut bins = FxHashMap::default();
        bins.insert(
            4681u32,
            vec![
                Chunk {
                    begin: vo(300),
                    end: vo(400),
                },
                Chunk {
                    begin: vo(100),
                    end: vo(200),
                },
            ],
        );
        let index = BaiIndex {
            references: vec![BaiReference {
                bins,
                linear: Vec::new(),
                name: None,
            }],
            config: BaiConfig::default(),
        };
        assert!(matches!(index.validate(false), Err(BaiError::Structure(_))));
    }

    #[test]
    fn validate_rejects_out_of_range_bins() {
        let mut bins = FxHashMap::default();
        bins.insert(
            40_000u32,
            vec![Chunk {
                begin: vo(100),
                end: vo(200),
            }],
        );
        let index = BaiIndex {
            references: vec![BaiReference {
                bins,
                linear: Vec::new(),
                name: None,
            }],
            config: BaiConfig::default(),
        };
        assert!(matches!(index.validate(false), Err(BaiError::Structure(_))));
    }

    #[test]
    fn thorough_validation_accepts_a_built_index() {
        let index = sample_index();
        index.validate(true).unwrap();
    }

    #[test]
    fn attached_names_survive_queries_but_not_serialization() {
        let mut index = sample_index();
        index.attach_names(["chr1"]);
        assert_eq!(index.reference(0).unwrap().name(), Some("chr1"));

        let mut bytes = Vec::new();
        index.serialize(&mut bytes).unwrap();
        let decoded = BaiIndex::read(&mut &bytes[..]).unwrap();
        assert_eq!(decoded.reference(0).unwrap().name(), None);
    }
}

// --- END TESTS --- //
