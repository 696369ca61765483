pub mod parser;
pub mod reader;
pub mod writer;

use fxhash::FxHashMap;
use std::fmt::{self, Display};
use thiserror::Error;

use operon_bgzf::BgzfError;
use operon_common::{cigar, CigarOp, Flags};

pub(crate) const BAM_MAGIC_STR: [u8; 4] = [66, 65, 77, 1];

/// Bin assigned to records without a mapped interval.
pub(crate) const UNMAPPED_BIN: u16 = 4680;

/// Offset applied when rendering quality scores as text.
const PHRED_OFFSET: u8 = 33;

#[derive(Error, Debug)]
pub enum BamError {
    #[error("Missing BAM Magic String")]
    MissingMagicString,
    #[error("BAM framing error: {0}")]
    Framing(String),
    #[error("invalid {field}: {reason}")]
    Field { field: &'static str, reason: String },
    #[error("symbol {0:?} outside the BAM sequence alphabet")]
    SequenceAlphabet(char),
    #[error("unknown aux field type {0:?}")]
    TagType(char),
    #[error("reader is closed")]
    StreamClosed,
    #[error("operation cancelled")]
    Cancelled,
    #[error("BGZF transport error")]
    Bgzf(#[from] BgzfError),
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
    #[error("File encoding error")]
    EncodeError(#[from] std::string::FromUtf8Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Sequence primitives
/// See SAM v1 section 4.2
pub enum BamSeq {
    Eq,
    A,
    C,
    M,
    G,
    R,
    S,
    V,
    T,
    W,
    Y,
    H,
    K,
    D,
    B,
    N,
}

impl BamSeq {
    /// 4-bit code used by the packed binary encoding.
    pub fn code(&self) -> u8 {
        match self {
            BamSeq::Eq => 0,
            BamSeq::A => 1,
            BamSeq::C => 2,
            BamSeq::M => 3,
            BamSeq::G => 4,
            BamSeq::R => 5,
            BamSeq::S => 6,
            BamSeq::V => 7,
            BamSeq::T => 8,
            BamSeq::W => 9,
            BamSeq::Y => 10,
            BamSeq::H => 11,
            BamSeq::K => 12,
            BamSeq::D => 13,
            BamSeq::B => 14,
            BamSeq::N => 15,
        }
    }

    /// Decode a 4-bit code; values above 14 collapse to N.
    pub fn from_code(code: u8) -> BamSeq {
        match code {
            0 => BamSeq::Eq,
            1 => BamSeq::A,
            2 => BamSeq::C,
            3 => BamSeq::M,
            4 => BamSeq::G,
            5 => BamSeq::R,
            6 => BamSeq::S,
            7 => BamSeq::V,
            8 => BamSeq::T,
            9 => BamSeq::W,
            10 => BamSeq::Y,
            11 => BamSeq::H,
            12 => BamSeq::K,
            13 => BamSeq::D,
            14 => BamSeq::B,
            _ => BamSeq::N,
        }
    }

    pub fn from_char(c: char) -> Result<BamSeq, BamError> {
        match c.to_ascii_uppercase() {
            '=' => Ok(BamSeq::Eq),
            'A' => Ok(BamSeq::A),
            'C' => Ok(BamSeq::C),
            'M' => Ok(BamSeq::M),
            'G' => Ok(BamSeq::G),
            'R' => Ok(BamSeq::R),
            'S' => Ok(BamSeq::S),
            'V' => Ok(BamSeq::V),
            'T' => Ok(BamSeq::T),
            'W' => Ok(BamSeq::W),
            'Y' => Ok(BamSeq::Y),
            'H' => Ok(BamSeq::H),
            'K' => Ok(BamSeq::K),
            'D' => Ok(BamSeq::D),
            'B' => Ok(BamSeq::B),
            'N' => Ok(BamSeq::N),
            otherwise => Err(BamError::SequenceAlphabet(otherwise)),
        }
    }
}

impl Display for BamSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BamSeq::Eq => write!(f, "="),
            BamSeq::A => write!(f, "A"),
            BamSeq::C => write!(f, "C"),
            BamSeq::M => write!(f, "M"),
            BamSeq::N => write!(f, "N"),
            BamSeq::G => write!(f, "G"),
            BamSeq::R => write!(f, "R"),
            BamSeq::V => write!(f, "V"),
            BamSeq::T => write!(f, "T"),
            BamSeq::B => write!(f, "B"),
            BamSeq::W => write!(f, "W"),
            BamSeq::Y => write!(f, "Y"),
            BamSeq::S => write!(f, "S"),
            BamSeq::K => write!(f, "K"),
            BamSeq::H => write!(f, "H"),
            BamSeq::D => write!(f, "D"),
        }
    }
}

/// Auxilliary BAM field
///
/// arbitrary tag names are supported but must be of length 2
/// See BamAuxValue for possible value types.
#[derive(Clone, Debug, PartialEq)]
pub struct BamAuxField {
    pub tag: [u8; 2],
    pub value: BamAuxValue,
}

impl Display for BamAuxField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}:{}",
            self.tag[0] as char, self.tag[1] as char, self.value
        )
    }
}

/// Auxilliary BAM value encodings
///
/// Display implementation will write in SAM format.
/// See SAM v1 section 4.2.4
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, PartialEq)]
pub enum BamAuxValue {
    A(char),
    c(i8),
    C(u8),
    s(i16),
    S(u16),
    i(i32),
    I(u32),
    f(f32),
    Z(String),
    H(String),
    Bc(Vec<i8>),
    BC(Vec<u8>),
    Bs(Vec<i16>),
    BS(Vec<u16>),
    Bi(Vec<i32>),
    BI(Vec<u32>),
    Bf(Vec<f32>),
}

fn fmt_array<T: Display>(f: &mut fmt::Formatter<'_>, subtype: char, vals: &[T]) -> fmt::Result {
    write!(f, "B:{subtype}")?;
    for v in vals {
        write!(f, ",{v}")?;
    }
    Ok(())
}

/// All integer types are 'i' in SAM format
impl Display for BamAuxValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BamAuxValue::A(v) => write!(f, "A:{v}"),
            BamAuxValue::c(v) => write!(f, "i:{v}"),
            BamAuxValue::C(v) => write!(f, "i:{v}"),
            BamAuxValue::s(v) => write!(f, "i:{v}"),
            BamAuxValue::S(v) => write!(f, "i:{v}"),
            BamAuxValue::i(v) => write!(f, "i:{v}"),
            BamAuxValue::I(v) => write!(f, "i:{v}"),
            BamAuxValue::f(v) => write!(f, "f:{v}"),
            BamAuxValue::Z(v) => write!(f, "Z:{v}"),
            BamAuxValue::H(v) => write!(f, "H:{v}"),
            BamAuxValue::Bc(v) => fmt_array(f, 'c', v),
            BamAuxValue::BC(v) => fmt_array(f, 'C', v),
            BamAuxValue::Bs(v) => fmt_array(f, 's', v),
            BamAuxValue::BS(v) => fmt_array(f, 'S', v),
            BamAuxValue::Bi(v) => fmt_array(f, 'i', v),
            BamAuxValue::BI(v) => fmt_array(f, 'I', v),
            BamAuxValue::Bf(v) => fmt_array(f, 'f', v),
        }
    }
}

impl From<u32> for BamAuxValue {
    fn from(value: u32) -> Self {
        BamAuxValue::I(value)
    }
}

impl From<i32> for BamAuxValue {
    fn from(value: i32) -> Self {
        BamAuxValue::i(value)
    }
}

impl From<u8> for BamAuxValue {
    fn from(value: u8) -> Self {
        BamAuxValue::C(value)
    }
}

impl From<i8> for BamAuxValue {
    fn from(value: i8) -> Self {
        BamAuxValue::c(value)
    }
}

impl From<u16> for BamAuxValue {
    fn from(value: u16) -> Self {
        BamAuxValue::S(value)
    }
}

impl From<i16> for BamAuxValue {
    fn from(value: i16) -> Self {
        BamAuxValue::s(value)
    }
}

impl From<f32> for BamAuxValue {
    fn from(value: f32) -> Self {
        BamAuxValue::f(value)
    }
}

impl From<char> for BamAuxValue {
    fn from(value: char) -> Self {
        BamAuxValue::A(value)
    }
}

impl From<String> for BamAuxValue {
    fn from(value: String) -> Self {
        BamAuxValue::Z(value)
    }
}

/// A BAM alignment record
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    pub qname: String,
    pub flags: Flags,
    pub ref_id: i32,
    pub pos: i32,
    pub mapq: u8,
    pub cigar: Vec<CigarOp>,
    pub next_ref_id: i32,
    pub next_pos: i32,
    pub tlen: i32,
    pub seq: Vec<BamSeq>,
    pub qual: Option<Vec<u8>>,
    pub aux: Vec<BamAuxField>,
}

impl Record {
    pub fn is_mapped(&self) -> bool {
        self.ref_id >= 0 && self.pos >= 0
    }

    /// Reference bases covered by the CIGAR (ops M, D, N, =, X).
    pub fn reference_span(&self) -> u64 {
        cigar::reference_len(&self.cigar)
    }

    /// First aux field with the given tag.
    pub fn aux(&self, tag: &[u8; 2]) -> Option<&BamAuxValue> {
        self.aux
            .iter()
            .find(|field| &field.tag == tag)
            .map(|field| &field.value)
    }

    /// Replace the sequence from text, mapping each symbol through the
    /// BAM alphabet.
    pub fn set_seq_str(&mut self, text: &str) -> Result<(), BamError> {
        self.seq = text
            .chars()
            .map(BamSeq::from_char)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }

    /// Check the record invariants the binary format relies on.
    ///
    /// CIGAR query length disagreeing with the sequence length is
    /// logged, not fatal.
    pub fn validate(&self) -> Result<(), BamError> {
        if self.qname.is_empty() || self.qname.len() > 254 {
            return Err(BamError::Field {
                field: "qname",
                reason: format!("length {} outside 1..=254", self.qname.len()),
            });
        }
        if self.qname.as_bytes().contains(&0) {
            return Err(BamError::Field {
                field: "qname",
                reason: "contains NUL".into(),
            });
        }
        if self.ref_id < 0 && self.pos >= 0 {
            return Err(BamError::Field {
                field: "pos",
                reason: format!("{} with ref_id {}", self.pos, self.ref_id),
            });
        }
        for op in &self.cigar {
            if op.is_empty() {
                return Err(BamError::Field {
                    field: "cigar",
                    reason: format!("zero-length op {op}"),
                });
            }
        }
        if let Some(qual) = &self.qual {
            if !self.seq.is_empty() && qual.len() != self.seq.len() {
                return Err(BamError::Field {
                    field: "qual",
                    reason: format!("length {} does not match {} bases", qual.len(), self.seq.len()),
                });
            }
        }
        if !self.cigar.is_empty() && !self.seq.is_empty() {
            let consumed = cigar::query_len(&self.cigar);
            if consumed != self.seq.len() as u64 {
                log::warn!(
                    "record {}: CIGAR consumes {} query bases but l_seq is {}",
                    self.qname,
                    consumed,
                    self.seq.len()
                );
            }
        }
        Ok(())
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // reference ids are rendered numerically; name resolution is
        // the caller's concern
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.qname,
            self.flags,
            if self.ref_id < 0 {
                "*".to_string()
            } else {
                self.ref_id.to_string()
            },
            self.pos + 1, // SAM is 1-based
            self.mapq,
            if self.cigar.is_empty() {
                "*".to_string()
            } else {
                self.cigar.iter().map(|x| x.to_string()).collect::<String>()
            },
            if self.next_ref_id < 0 {
                "*".to_string()
            } else {
                self.next_ref_id.to_string()
            },
            self.next_pos + 1,
            self.tlen,
            if self.seq.is_empty() {
                "*".to_string()
            } else {
                self.seq.iter().map(|x| x.to_string()).collect::<String>()
            },
            match &self.qual {
                None => "*".to_string(),
                Some(scores) => scores
                    .iter()
                    .map(|q| {
                        // scores up to 254 are valid; widen so the
                        // offset cannot overflow
                        char::from_u32(u32::from(*q) + u32::from(PHRED_OFFSET)).unwrap_or('?')
                    })
                    .collect::<String>(),
            },
        )?;
        for field in &self.aux {
            write!(f, "\t{field}")?;
        }
        Ok(())
    }
}

/// Representation of BAM Reference record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BamReference {
    name: String,
    l_ref: u32,
}

impl BamReference {
    pub fn new(name: impl Into<String>, l_ref: u32) -> Result<Self, BamError> {
        let name = name.into();
        if parser::validate_ref_name(&name).is_none() {
            return Err(BamError::Field {
                field: "reference name",
                reason: format!("{name:?} violates the SAM grammar"),
            });
        }
        Ok(BamReference { name, l_ref })
    }

    pub(crate) fn new_unchecked(name: String, l_ref: u32) -> Self {
        BamReference { name, l_ref }
    }

    pub fn name(&self) -> &str {
        self.name.as_ref()
    }

    pub fn l_ref(&self) -> u32 {
        self.l_ref
    }
}

/// Representation of BAM header field
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BamHeader {
    text: String,
    n_ref: u32,
}

impl BamHeader {
    pub fn new(text: impl Into<String>, n_ref: u32) -> Self {
        BamHeader {
            text: text.into(),
            n_ref,
        }
    }

    pub fn text(&self) -> &str {
        self.text.as_ref()
    }

    pub fn n_ref(&self) -> u32 {
        self.n_ref
    }
}

/// Decoded reference list with lookups in both directions.
#[derive(Debug, Default)]
pub struct References {
    list: Vec<BamReference>,
    by_name: FxHashMap<String, usize>,
}

impl References {
    pub fn new(list: Vec<BamReference>) -> Self {
        let mut by_name = FxHashMap::default();
        for (id, reference) in list.iter().enumerate() {
            by_name.entry(reference.name.clone()).or_insert(id);
        }
        References { list, by_name }
    }

    pub fn name_by_id(&self, id: i32) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.list.get(i))
            .map(|r| r.name())
    }

    pub fn id_by_name(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: i32) -> Option<&BamReference> {
        usize::try_from(id).ok().and_then(|i| self.list.get(i))
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BamReference> {
        self.list.iter()
    }
}

// --- BEGIN TESTS --- //

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_codes_round_trip() {
        for code in 0u8..16 {
            assert_eq!(BamSeq::from_code(code).code(), code);
        }
    }

    #[test]
    fn seq_from_char() {
        assert_eq!(BamSeq::from_char('a').unwrap(), BamSeq::A);
        assert_eq!(BamSeq::from_char('=').unwrap(), BamSeq::Eq);
        assert!(matches!(
            BamSeq::from_char('Q'),
            Err(BamError::SequenceAlphabet('Q'))
        ));
    }

    #[test]
    fn validate_rejects_bad_qnames() {
        let mut record = Record {
            qname: String::new(),
            ..Record::default()
        };
        record.ref_id = -1;
        record.pos = -1;
        assert!(record.validate().is_err());

        record.qname = "x".repeat(255);
        assert!(record.validate().is_err());

        record.qname = "ok".into();
        assert!(record.validate().is_ok());
    }

    #[test]
    fn validate_rejects_mapped_pos_without_ref() {
        let record = Record {
            qname: "r".into(),
            ref_id: -1,
            pos: 10,
            ..Record::default()
        };
        assert!(matches!(
            record.validate(),
            Err(BamError::Field { field: "pos", .. })
        ));
    }

    #[test]
    fn aux_lookup_finds_first_match() {
        let record = Record {
            qname: "r".into(),
            ref_id: -1,
            pos: -1,
            aux: vec![
                BamAuxField {
                    tag: *b"NM",
                    value: BamAuxValue::from(3u8),
                },
                BamAuxField {
                    tag: *b"MD",
                    value: BamAuxValue::from("4".to_string()),
                },
            ],
            ..Record::default()
        };
        assert_eq!(record.aux(b"NM"), Some(&BamAuxValue::C(3)));
        assert_eq!(record.aux(b"XX"), None);
    }

    #[test]
    fn references_lookups() {
        let refs = References::new(vec![
            BamReference::new("chr1", 1000).unwrap(),
            BamReference::new("chr2", 2000).unwrap(),
        ]);
        assert_eq!(refs.name_by_id(1), Some("chr2"));
        assert_eq!(refs.name_by_id(-1), None);
        assert_eq!(refs.id_by_name("chr1"), Some(0));
        assert_eq!(refs.id_by_name("chrM"), None);
    }

    #[test]
    fn sam_style_display() {
        let mut record = Record {
            qname: "r1".into(),
            flags: Flags(0),
            ref_id: 0,
            pos: 99,
            mapq: 30,
            cigar: vec![CigarOp::M(4)],
            next_ref_id: -1,
            next_pos: -1,
            tlen: 0,
            qual: Some(vec![20, 20, 20, 20]),
            ..Record::default()
        };
        record.set_seq_str("ACGT").unwrap();
        assert_eq!(
            record.to_string(),
            "r1\t0\t0\t100\t30\t4M\t*\t0\t0\tACGT\t5555"
        );
    }
}

// --- END TESTS --- //
