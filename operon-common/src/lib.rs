pub mod binning;
pub mod cancel;
pub mod cigar;
pub mod flags;

pub use binning::{bin_of, overlapping_bins, BinningError, LINEAR_SHIFT};
pub use cancel::CancelToken;
pub use cigar::CigarOp;
pub use flags::Flags;
