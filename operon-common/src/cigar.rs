use std::fmt::{self, Display};

use thiserror::Error;

/// Maximum encodable op length; the packed form keeps 28 bits for it.
pub const MAX_OP_LEN: u32 = (1 << 28) - 1;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CigarError {
    #[error("CIGAR op length {0} exceeds 28 bits")]
    LengthOverflow(u32),
    #[error("zero-length CIGAR op")]
    ZeroLength,
    #[error("unknown CIGAR op code {0}")]
    UnknownOpCode(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
// CIGAR operations
// See SAM v1 section 1.4.6
pub enum CigarOp {
    M(u32),
    I(u32),
    D(u32),
    N(u32),
    S(u32),
    H(u32),
    P(u32),
    Eq(u32),
    X(u32),
}

impl CigarOp {
    /// The 4-bit op code used by the packed binary encoding.
    pub fn code(&self) -> u32 {
        match self {
            CigarOp::M(_) => 0,
            CigarOp::I(_) => 1,
            CigarOp::D(_) => 2,
            CigarOp::N(_) => 3,
            CigarOp::S(_) => 4,
            CigarOp::H(_) => 5,
            CigarOp::P(_) => 6,
            CigarOp::Eq(_) => 7,
            CigarOp::X(_) => 8,
        }
    }

    pub fn from_code(code: u32, len: u32) -> Result<CigarOp, CigarError> {
        match code {
            0 => Ok(CigarOp::M(len)),
            1 => Ok(CigarOp::I(len)),
            2 => Ok(CigarOp::D(len)),
            3 => Ok(CigarOp::N(len)),
            4 => Ok(CigarOp::S(len)),
            5 => Ok(CigarOp::H(len)),
            6 => Ok(CigarOp::P(len)),
            7 => Ok(CigarOp::Eq(len)),
            8 => Ok(CigarOp::X(len)),
            otherwise => Err(CigarError::UnknownOpCode(otherwise)),
        }
    }

    pub fn len(&self) -> u32 {
        match self {
            CigarOp::M(v)
            | CigarOp::I(v)
            | CigarOp::D(v)
            | CigarOp::N(v)
            | CigarOp::S(v)
            | CigarOp::H(v)
            | CigarOp::P(v)
            | CigarOp::Eq(v)
            | CigarOp::X(v) => *v,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this op advances through the query sequence.
    pub fn consumes_query(&self) -> bool {
        matches!(
            self,
            CigarOp::M(_) | CigarOp::I(_) | CigarOp::S(_) | CigarOp::Eq(_) | CigarOp::X(_)
        )
    }

    /// Whether this op advances along the reference.
    pub fn consumes_reference(&self) -> bool {
        matches!(
            self,
            CigarOp::M(_) | CigarOp::D(_) | CigarOp::N(_) | CigarOp::Eq(_) | CigarOp::X(_)
        )
    }

    /// Pack into the binary form `(len << 4) | code`.
    pub fn pack(&self) -> Result<u32, CigarError> {
        let len = self.len();
        if len == 0 {
            return Err(CigarError::ZeroLength);
        }
        if len > MAX_OP_LEN {
            return Err(CigarError::LengthOverflow(len));
        }
        Ok((len << 4) | self.code())
    }

    /// Inverse of `pack`.
    pub fn unpack(packed: u32) -> Result<CigarOp, CigarError> {
        CigarOp::from_code(packed & 0xF, packed >> 4)
    }
}

impl Display for CigarOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CigarOp::M(v) => write!(f, "{v}M"),
            CigarOp::I(v) => write!(f, "{v}I"),
            CigarOp::D(v) => write!(f, "{v}D"),
            CigarOp::N(v) => write!(f, "{v}N"),
            CigarOp::S(v) => write!(f, "{v}S"),
            CigarOp::H(v) => write!(f, "{v}H"),
            CigarOp::P(v) => write!(f, "{v}P"),
            CigarOp::Eq(v) => write!(f, "{v}="),
            CigarOp::X(v) => write!(f, "{v}X"),
        }
    }
}

/// Total length of ops that consume the query sequence.
pub fn query_len(ops: &[CigarOp]) -> u64 {
    ops.iter()
        .filter(|op| op.consumes_query())
        .map(|op| u64::from(op.len()))
        .sum()
}

/// Total length of ops that consume the reference.
pub fn reference_len(ops: &[CigarOp]) -> u64 {
    ops.iter()
        .filter(|op| op.consumes_reference())
        .map(|op| u64::from(op.len()))
        .sum()
}

// --- BEGIN TESTS --- //


// --- END TESTS --- //
