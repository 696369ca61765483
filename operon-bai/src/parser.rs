use nom::{
    bytes::complete::tag,
    combinator::{map, map_res, verify},
    multi::count,
    number::complete::{le_i32, le_u32, le_u64},
    sequence::tuple,
    IResult,
};

use fxhash::FxHashMap;
use operon_bgzf::VirtualOffset;

use crate::{BaiError, BaiReference, Chunk, BAI_MAGIC_STR};

// ============================== //
//    BEGIN BAI INDEX PARSING     //
// ============================== //

/// Parse BAI magic string
///
/// Attempts to match [66, 65, 73, 1].
pub fn bai_magic(input: &[u8]) -> IResult<&[u8], &[u8]> {
    tag(BAI_MAGIC_STR)(input)
}

/// Parse a count field, rejecting negative values.
fn non_negative_count(input: &[u8]) -> IResult<&[u8], usize> {
    map(verify(le_i32, |n| *n >= 0), |n| n as usize)(input)
}

fn chunk(input: &[u8]) -> IResult<&[u8], Chunk> {
    map(tuple((le_u64, le_u64)), |(begin, end)| Chunk {
        begin: VirtualOffset::from(begin),
        end: VirtualOffset::from(end),
    })(input)
}

/// Parse one bin: id, chunk count, chunks.
fn bin_entry(input: &[u8]) -> IResult<&[u8], (u32, Vec<Chunk>)> {
    let (input, bin_id) = le_u32(input)?;
    let (input, n_chunk) = non_negative_count(input)?;
    let (input, chunks) = count(chunk, n_chunk)(input)?;
    Ok((input, (bin_id, chunks)))
}

/// Parse one reference: bin table, then linear intervals.
fn reference(input: &[u8]) -> IResult<&[u8], BaiReference> {
    let (input, n_bin) = non_negative_count(input)?;
    let (input, bins) = map_res(
        count(bin_entry, n_bin),
        |entries| -> Result<FxHashMap<u32, Vec<Chunk>>, &'static str> {
            let mut map = FxHashMap::default();
            for (bin_id, chunks) in entries {
                if map.insert(bin_id, chunks).is_some() {
                    return Err("duplicate bin id");
                }
            }
            Ok(map)
        },
    )(input)?;
    let (input, n_ival) = non_negative_count(input)?;
    let (input, intervals) = count(map(le_u64, VirtualOffset::from), n_ival)(input)?;
    Ok((
        input,
        BaiReference {
            bins,
            linear: intervals,
            name: None,
        },
    ))
}

/// Decode a complete BAI byte image into its reference list.
pub fn read_index(input: &[u8]) -> Result<Vec<BaiReference>, BaiError> {
    let (input, _) = bai_magic(input).map_err(|_| BaiError::MissingMagicString)?;
    let (input, n_ref) = non_negative_count(input)
        .map_err(|_| BaiError::Structure("negative reference count".into()))?;
    let (rest, references) = count(reference, n_ref)(input)
        .map_err(|_| BaiError::Structure("malformed reference section".into()))?;
    if !rest.is_empty() {
        return Err(BaiError::Structure(format!(
            "{} trailing bytes after the last reference",
            rest.len()
        )));
    }
    Ok(references)
}

// --- BEGIN TESTS --- //

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"BAI\x01");
        bytes.extend_from_slice(&1i32.to_le_bytes()); // n_ref
        bytes.extend_from_slice(&1i32.to_le_bytes()); // n_bin
        bytes.extend_from_slice(&4681u32.to_le_bytes());
        bytes.extend_from_slice(&1i32.to_le_bytes()); // n_chunk
        bytes.extend_from_slice(&100u64.to_le_bytes());
        bytes.extend_from_slice(&200u64.to_le_bytes());
        bytes.extend_from_slice(&1i32.to_le_bytes()); // n_ival
        bytes.extend_from_slice(&100u64.to_le_bytes());
        bytes
    }

    #[test]
    fn decodes_a_minimal_index() {
        let references = read_index(&sample_index_bytes()).unwrap();
        assert_eq!(references.len(), 1);
        let chunks = references[0].chunks(4681).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].begin.as_u64(), 100);
        assert_eq!(references[0].linear().len(), 1);
    }

    #[test]
    fn wrong_magic_is_its_own_error() {
        let mut bytes = sample_index_bytes();
        bytes[0] = b'T';
        assert!(matches!(
            read_index(&bytes),
            Err(BaiError::MissingMagicString)
        ));
    }

    #[test]
    fn negative_counts_are_structural_errors() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"BAI\x01");
        bytes.extend_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(read_index(&bytes), Err(BaiError::Structure(_))));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = sample_index_bytes();
        bytes.push(0);
        assert!(matches!(read_index(&bytes), Err(BaiError::Structure(_))));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = sample_index_bytes();
        assert!(matches!(
            read_index(&bytes[..bytes.len() - 4]),
            Err(BaiError::Structure(_))
        ));
    }
}

// --- END TESTS --- //
