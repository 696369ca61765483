use nom::{
    bytes::streaming::{tag, take},
    multi::length_data,
    number::streaming,
    sequence::{preceded, tuple},
    IResult,
};

use crate::{
    BamAuxField, BamAuxValue, BamError, BamHeader, BamReference, BamSeq, Record, References,
    BAM_MAGIC_STR,
};
use operon_common::{CigarOp, Flags};

// ============================== //
//    BEGIN BAM HEADER PARSING    //
// ============================== //

/// Parse BAM magic string
///
/// Attempts to match [66, 65, 77, 1].
pub fn bam_magic(input: &[u8]) -> IResult<&[u8], &[u8]> {
    tag(BAM_MAGIC_STR)(input)
}

/// Parse BAM header into tuple
///
/// Attempts to match BAM magic string (discarded), header text, and n_ref.
fn header(input: &[u8]) -> IResult<&[u8], (&[u8], u32)> {
    tuple((
        preceded(bam_magic, length_data(streaming::le_u32)),
        streaming::le_u32,
    ))(input)
}

/// Convert bytes into `BamHeader` struct
pub fn read_header(input: &[u8]) -> IResult<&[u8], BamHeader> {
    let (rest, (text_bytes, n_ref)) = header(input)?;
    Ok((
        rest,
        BamHeader::new(String::from_utf8_lossy(text_bytes).into_owned(), n_ref),
    ))
}

// =========================== //
// BEGIN BAM REFERENCE PARSING //
// =========================== //

/// Validate reference name
///
/// SAMv1 1.2.1:
/// Reference name must be ASCII and match the following regex
/// [0-9A-Za-z!#$%&+./:;?@^_|~-][0-9A-Za-z!#$%&*+./:;=?@^_|~-]*
pub(crate) fn validate_ref_name(name: &str) -> Option<&str> {
    if !name.is_empty()
        && name.chars().take(1).all(|c| !matches!(c, '=' | '*'))
        && name.chars().all(|c| {
            c.is_ascii_graphic()
                && !matches!(
                    c,
                    '\\' | '{' | '}' | '[' | ']' | '<' | '>' | '(' | ')' | ','
                )
        })
    {
        Some(name)
    } else {
        None
    }
}

fn reference_parts(input: &[u8]) -> IResult<&[u8], (&[u8], u32)> {
    tuple((length_data(streaming::le_u32), streaming::le_u32))(input)
}

/// Convert bytes into a BamReference
///
/// The name field arrives length-prefixed with a trailing NUL; both the
/// terminator and the SAM name grammar are enforced here.
pub fn read_reference(input: &[u8]) -> Result<Option<(&[u8], BamReference)>, BamError> {
    let (rest, (name_bytes, l_ref)) = match reference_parts(input) {
        Ok(v) => v,
        Err(nom::Err::Incomplete(_)) => return Ok(None),
        Err(_) => return Err(BamError::Framing("malformed reference entry".into())),
    };
    let name_bytes = match name_bytes.split_last() {
        Some((0, rest_name)) => rest_name,
        _ => return Err(BamError::Framing("reference name not NUL-terminated".into())),
    };
    let name = std::str::from_utf8(name_bytes)
        .map_err(|_| BamError::Framing("reference name is not UTF-8".into()))?;
    let name = validate_ref_name(name).ok_or_else(|| BamError::Field {
        field: "reference name",
        reason: format!("{name:?} violates the SAM grammar"),
    })?;
    Ok(Some((
        rest,
        BamReference::new_unchecked(name.to_string(), l_ref),
    )))
}

// ============================== //
//   BEGIN BAM RECORD PARSING     //
// ============================== //

/// parse block size
pub fn block_size(input: &[u8]) -> IResult<&[u8], u32> {
    streaming::le_u32(input)
}

fn truncated(_: nom::Err<nom::error::Error<&[u8]>>) -> BamError {
    BamError::Framing("record ends before its announced block size".into())
}

/// Unpack a packed CIGAR word into an op.
///
/// Low four bits are the op code, the rest the length.
/// See SAM v1 section 4.2
fn unpack_cigar_op(packed: u32) -> Result<CigarOp, BamError> {
    CigarOp::unpack(packed).map_err(|e| BamError::Field {
        field: "cigar",
        reason: e.to_string(),
    })
}

fn read_cigar(input: &[u8], n_op: u16) -> Result<(&[u8], Vec<CigarOp>), BamError> {
    let mut ops = Vec::with_capacity(usize::from(n_op));
    let mut rest = input;
    for _ in 0..n_op {
        let (next, packed) = streaming::le_u32(rest).map_err(truncated)?;
        ops.push(unpack_cigar_op(packed)?);
        rest = next;
    }
    Ok((rest, ops))
}

/// Read packed sequence bytes into `BamSeq`s
///
/// The sequence field is bit-packed two bases per byte, high nibble
/// first. In the event that `l_seq` is odd, the final 4 bits are
/// padding and automatically discarded.
fn read_sequence(input: &[u8], l_seq: u32) -> Result<(&[u8], Vec<BamSeq>), BamError> {
    let n_bytes = (l_seq as usize + 1) / 2;
    let (rest, packed) =
        take::<_, _, nom::error::Error<&[u8]>>(n_bytes)(input).map_err(truncated)?;
    let mut seq = Vec::with_capacity(n_bytes * 2);
    for byte in packed {
        seq.push(BamSeq::from_code(byte >> 4));
        seq.push(BamSeq::from_code(byte & 0x0F));
    }
    seq.truncate(l_seq as usize);
    Ok((rest, seq))
}

/// Read PHRED quality values
///
/// A run of 0xFF means quality is absent for the whole record; the
/// empty run of a zero-length sequence counts as absent too.
fn read_quality(input: &[u8], l_seq: u32) -> Result<(&[u8], Option<Vec<u8>>), BamError> {
    let (rest, raw) = take::<_, _, nom::error::Error<&[u8]>>(l_seq as usize)(input)
        .map_err(truncated)?;
    if raw.iter().all(|q| *q == 255) {
        Ok((rest, None))
    } else {
        Ok((rest, Some(raw.to_vec())))
    }
}

// ============================== //
//      BEGIN AUX BAM PARSING     //
// ============================== //

/// Parse bytes until encountering NULL (\0)
///
/// Consumes but does not return NULL.
fn null_terminated_bytes(input: &[u8]) -> Result<(&[u8], &[u8]), BamError> {
    match input.iter().position(|b| *b == 0) {
        Some(at) => Ok((&input[at + 1..], &input[..at])),
        None => Err(BamError::Framing("unterminated aux string".into())),
    }
}

fn take_n(input: &[u8], n: usize) -> Result<(&[u8], &[u8]), BamError> {
    take::<_, _, nom::error::Error<&[u8]>>(n)(input).map_err(truncated)
}

fn le_chunk<const N: usize>(input: &[u8]) -> Result<(&[u8], [u8; N]), BamError> {
    let (rest, bytes) = take_n(input, N)?;
    let mut chunk = [0u8; N];
    chunk.copy_from_slice(bytes);
    Ok((rest, chunk))
}

/// Read a `B`-typed array value
///
/// Consumes subtype, count, and elements.
fn read_aux_array(input: &[u8]) -> Result<(&[u8], BamAuxValue), BamError> {
    let (input, subtype) = take_n(input, 1)?;
    let subtype = subtype[0];
    let (mut input, count_bytes) = le_chunk::<4>(input)?;
    let count = u32::from_le_bytes(count_bytes) as usize;

    macro_rules! array {
        ($ty:ty, $variant:ident) => {{
            let mut vals: Vec<$ty> = Vec::with_capacity(count);
            for _ in 0..count {
                let (rest, bytes) = le_chunk::<{ std::mem::size_of::<$ty>() }>(input)?;
                vals.push(<$ty>::from_le_bytes(bytes));
                input = rest;
            }
            Ok((input, BamAuxValue::$variant(vals)))
        }};
    }

    match subtype {
        b'c' => array!(i8, Bc),
        b'C' => array!(u8, BC),
        b's' => array!(i16, Bs),
        b'S' => array!(u16, BS),
        b'i' => array!(i32, Bi),
        b'I' => array!(u32, BI),
        b'f' => array!(f32, Bf),
        otherwise => Err(BamError::TagType(otherwise as char)),
    }
}

/// Read one BAM auxilliary field
///
/// Consumes tag, dtype, and value, returning BamAuxField.
fn read_aux_field(input: &[u8]) -> Result<(&[u8], BamAuxField), BamError> {
    let (input, tag_bytes) = take_n(input, 2)?;
    let tag = [tag_bytes[0], tag_bytes[1]];
    let (input, dtype) = take_n(input, 1)?;
    let (rest, value) = match dtype[0] {
        b'A' => {
            let (rest, v) = take_n(input, 1)?;
            (rest, BamAuxValue::A(v[0] as char))
        }
        b'c' => {
            let (rest, v) = le_chunk::<1>(input)?;
            (rest, BamAuxValue::c(i8::from_le_bytes(v)))
        }
        b'C' => {
            let (rest, v) = le_chunk::<1>(input)?;
            (rest, BamAuxValue::C(v[0]))
        }
        b's' => {
            let (rest, v) = le_chunk::<2>(input)?;
            (rest, BamAuxValue::s(i16::from_le_bytes(v)))
        }
        b'S' => {
            let (rest, v) = le_chunk::<2>(input)?;
            (rest, BamAuxValue::S(u16::from_le_bytes(v)))
        }
        b'i' => {
            let (rest, v) = le_chunk::<4>(input)?;
            (rest, BamAuxValue::i(i32::from_le_bytes(v)))
        }
        b'I' => {
            let (rest, v) = le_chunk::<4>(input)?;
            (rest, BamAuxValue::I(u32::from_le_bytes(v)))
        }
        b'f' => {
            let (rest, v) = le_chunk::<4>(input)?;
            (rest, BamAuxValue::f(f32::from_le_bytes(v)))
        }
        b'Z' => {
            let (rest, bytes) = null_terminated_bytes(input)?;
            (
                rest,
                BamAuxValue::Z(String::from_utf8_lossy(bytes).into_owned()),
            )
        }
        b'H' => {
            let (rest, bytes) = null_terminated_bytes(input)?;
            if bytes.len() % 2 != 0 || !bytes.iter().all(|b| b.is_ascii_hexdigit()) {
                return Err(BamError::TagType('H'));
            }
            (
                rest,
                BamAuxValue::H(String::from_utf8_lossy(bytes).into_owned()),
            )
        }
        b'B' => read_aux_array(input)?,
        otherwise => return Err(BamError::TagType(otherwise as char)),
    };
    Ok((rest, BamAuxField { tag, value }))
}

// ============================== //
//  BEGIN BAM ALIGNMENT PARSING   //
// ============================== //

/// Read a complete alignment record from its payload slice.
///
/// `input` holds exactly `block_size` bytes; every byte must be
/// accounted for by the fields decoded here.
pub fn read_alignment(input: &[u8]) -> Result<Record, BamError> {
    let (rest, (ref_id, pos, l_read_name, mapq, _bin, n_cigar_op, flag, l_seq)) = tuple((
        streaming::le_i32,
        streaming::le_i32,
        streaming::le_u8,
        streaming::le_u8,
        streaming::le_u16,
        streaming::le_u16,
        streaming::le_u16,
        streaming::le_u32,
    ))(input)
    .map_err(truncated)?;
    let (rest, (next_ref_id, next_pos, tlen)) =
        tuple((streaming::le_i32, streaming::le_i32, streaming::le_i32))(rest)
            .map_err(truncated)?;

    let (rest, name_bytes) = take_n(rest, usize::from(l_read_name))?;
    let qname = match name_bytes.split_last() {
        Some((0, name)) => String::from_utf8(name.to_vec())?,
        _ => return Err(BamError::Framing("read name not NUL-terminated".into())),
    };

    let (rest, cigar) = read_cigar(rest, n_cigar_op)?;
    let (rest, seq) = read_sequence(rest, l_seq)?;
    let (mut rest, qual) = read_quality(rest, l_seq)?;

    let mut aux = Vec::new();
    while !rest.is_empty() {
        let (next, field) = read_aux_field(rest)?;
        aux.push(field);
        rest = next;
    }

    Ok(Record {
        qname,
        flags: Flags(flag),
        ref_id,
        pos,
        mapq,
        cigar,
        next_ref_id,
        next_pos,
        tlen,
        seq,
        qual,
        aux,
    })
}

/// Maybe correct for long CIGAR fields
///
/// If the criteria described in SAMv1 4.2.2 are met, swap the true
/// CIGAR in from the `CG:B,I` aux field and drop the field.
pub fn restore_long_cigar(record: &mut Record, references: &References) {
    let ref_len = match references.get(record.ref_id) {
        Some(reference) => reference.l_ref(),
        None => return,
    };
    let placeholder = [
        CigarOp::S(record.seq.len() as u32),
        CigarOp::N(ref_len),
    ];
    if record.cigar != placeholder {
        return;
    }
    let at = match record
        .aux
        .iter()
        .position(|field| &field.tag == b"CG" && matches!(field.value, BamAuxValue::BI(_)))
    {
        Some(at) => at,
        None => return,
    };
    let BamAuxValue::BI(packed) = &record.aux[at].value else {
        return;
    };
    let restored = packed
        .iter()
        .map(|word| CigarOp::unpack(*word))
        .collect::<Result<Vec<_>, _>>();
    if let Ok(ops) = restored {
        record.cigar = ops;
        record.aux.remove(at);
    }
}

// --- BEGIN TESTS --- //

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_is_enforced() {
        assert!(bam_magic(b"BAM\x01rest").is_ok());
        assert!(bam_magic(b"BAI\x01rest").is_err());
    }

    #[test]
    fn header_round_trip() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"BAM\x01");
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(b"@HD\tVN:");
        bytes.extend_from_slice(&2u32.to_le_bytes());

        let (rest, header) = read_header(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(header.text(), "@HD\tVN:");
        assert_eq!(header.n_ref(), 2);
    }

    #[test]
    fn header_is_incremental() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"BAM\x01");
        bytes.extend_from_slice(&100u32.to_le_bytes());
        assert!(matches!(
            read_header(&bytes),
            Err(nom::Err::Incomplete(_))
        ));
    }

    #[test]
    fn reference_entry_round_trip() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&5u32.to_le_bytes());
        bytes.extend_from_slice(b"chr1\x00");
        bytes.extend_from_slice(&248_956_422u32.to_le_bytes());

        let (rest, reference) = read_reference(&bytes).unwrap().unwrap();
        assert!(rest.is_empty());
        assert_eq!(reference.name(), "chr1");
        assert_eq!(reference.l_ref(), 248_956_422);
    }

    #[test]
    fn reference_name_grammar() {
        assert!(validate_ref_name("chr1").is_some());
        assert!(validate_ref_name("HLA-A*01:01").is_none());
        assert!(validate_ref_name("=chr").is_none());
        assert!(validate_ref_name("").is_none());
    }

    #[test]
    fn bad_cigar_op_is_a_field_error() {
        // op code 9 does not exist
        let packed = (4u32 << 4) | 9;
        assert!(matches!(
            unpack_cigar_op(packed),
            Err(BamError::Field { field: "cigar", .. })
        ));
    }

    #[test]
    fn sequence_unpacking_drops_odd_padding() {
        // ACG packed: A=1 C=2 G=4 -> 0x12, 0x40
        let (rest, seq) = read_sequence(&[0x12, 0x40], 3).unwrap();
        assert!(rest.is_empty());
        assert_eq!(seq, vec![BamSeq::A, BamSeq::C, BamSeq::G]);
    }

    #[test]
    fn quality_all_ff_is_absent() {
        let (_, qual) = read_quality(&[0xFF, 0xFF, 0xFF], 3).unwrap();
        assert_eq!(qual, None);
        let (_, qual) = read_quality(&[0xFF, 20, 0xFF], 3).unwrap();
        assert_eq!(qual, Some(vec![0xFF, 20, 0xFF]));
        // a zero-length sequence has no quality either
        let (_, qual) = read_quality(&[], 0).unwrap();
        assert_eq!(qual, None);
    }

    #[test]
    fn unknown_aux_type_is_rejected() {
        let bytes = b"NMq\x05";
        assert!(matches!(
            read_aux_field(bytes),
            Err(BamError::TagType('q'))
        ));
    }

    #[test]
    fn aux_field_kinds() {
        let (rest, field) = read_aux_field(b"NMC\x07").unwrap();
        assert!(rest.is_empty());
        assert_eq!(field.tag, *b"NM");
        assert_eq!(field.value, BamAuxValue::C(7));

        let (rest, field) = read_aux_field(b"MDZ4A10\x00").unwrap();
        assert!(rest.is_empty());
        assert_eq!(field.value, BamAuxValue::Z("4A10".into()));

        let mut bytes = b"XBBs".to_vec();
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&(-4i16).to_le_bytes());
        bytes.extend_from_slice(&9i16.to_le_bytes());
        let (rest, field) = read_aux_field(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(field.value, BamAuxValue::Bs(vec![-4, 9]));
    }

    #[test]
    fn malformed_hex_aux_is_rejected() {
        assert!(matches!(
            read_aux_field(b"XHHabg\x00"),
            Err(BamError::TagType('H'))
        ));
    }

    #[test]
    fn long_cigar_restoration() {
        let refs = References::new(vec![BamReference::new("chr1", 100).unwrap()]);
        let mut record = Record {
            qname: "r".into(),
            ref_id: 0,
            pos: 0,
            cigar: vec![CigarOp::S(4), CigarOp::N(100)],
            seq: vec![BamSeq::A, BamSeq::C, BamSeq::G, BamSeq::T],
            aux: vec![BamAuxField {
                tag: *b"CG",
                value: BamAuxValue::BI(vec![
                    CigarOp::M(2).pack().unwrap(),
                    CigarOp::I(1).pack().unwrap(),
                    CigarOp::M(1).pack().unwrap(),
                ]),
            }],
            ..Record::default()
        };
        restore_long_cigar(&mut record, &refs);
        assert_eq!(
            record.cigar,
            vec![CigarOp::M(2), CigarOp::I(1), CigarOp::M(1)]
        );
        assert!(record.aux(b"CG").is_none());
    }
}

// --- END TESTS --- //
