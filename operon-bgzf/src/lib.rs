pub mod reader;
pub mod voffset;
pub mod writer;

use thiserror::Error;

pub use reader::BgzfReader;
pub use voffset::VirtualOffset;
pub use writer::{BgzfConfig, BgzfWriter};

/// Hard cap on a whole BGZF block, framing included.
pub const MAX_BLOCK_SIZE: usize = 65536;

/// Smallest accepted block-size configuration.
pub const MIN_BLOCK_SIZE: usize = 1024;

/// Framing bytes around the deflate payload: 18-byte header + CRC32 + ISIZE.
pub const BLOCK_FRAMING: usize = 26;

/// Largest run of bytes guaranteed to fit one block, reserving 16 bytes
/// of framing headroom for the record-atomicity contract.
pub const MAX_RECORD_PAYLOAD: usize = MAX_BLOCK_SIZE - 16;

// BGZF block header template (18 bytes); bytes 16-17 are the BSIZE
// placeholder, total block size minus one, filled per block.
pub(crate) const HEADER_TEMPLATE: [u8; 18] = [
    0x1f, 0x8b, 0x08, 0x04, // magic, CM=deflate, FLG=FEXTRA
    0, 0, 0, 0, // MTIME
    0, 0xff, // XFL, OS=unknown
    0x06, 0x00, // XLEN=6
    b'B', b'C', 0x02, 0x00, // BC subfield, SLEN=2
    0, 0, // BSIZE placeholder
];

/// Standard 28-byte EOF marker block (empty deflate stream, ISIZE 0).
pub const EOF_BLOCK: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0, 0, 0, 0, 0, 0xff, //
    0x06, 0x00, b'B', b'C', 0x02, 0x00, 0x1b, 0x00, //
    0x03, 0x00, 0, 0, 0, 0, 0, 0, 0, 0,
];

#[derive(Error, Debug)]
pub enum BgzfError {
    #[error("malformed BGZF block at compressed offset {offset}: {reason}")]
    Framing { offset: u64, reason: &'static str },
    #[error("BGZF checksum mismatch at compressed offset {offset}: expected {expected:#010x}, got {actual:#010x}")]
    Checksum {
        offset: u64,
        expected: u32,
        actual: u32,
    },
    #[error("BGZF stream truncated inside the block at compressed offset {offset}")]
    Truncated { offset: u64 },
    #[error("virtual offset components out of range: block {block}, intra {intra}")]
    OffsetRange { block: u64, intra: u64 },
    #[error("record of {len} bytes does not fit a BGZF block (max {max})")]
    RecordTooLarge { len: usize, max: usize },
    #[error("operation cancelled")]
    Cancelled,
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl From<BgzfError> for std::io::Error {
    fn from(e: BgzfError) -> Self {
        match e {
            BgzfError::Io(inner) => inner,
            BgzfError::Truncated { .. } => {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, e)
            }
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}
