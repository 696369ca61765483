use std::io::{self, BufRead, Read};

use flate2::read::DeflateDecoder;
use log::warn;

use operon_common::CancelToken;

use crate::{BgzfError, VirtualOffset, MAX_BLOCK_SIZE};

/// Streaming BGZF decompressor.
///
/// Inflates one block at a time, preserving block boundaries so every
/// output byte can be addressed by a virtual offset. Implements
/// `BufRead` over the concatenated payloads; couple it with a
/// `BamReader` for compressed alignment data.
pub struct BgzfReader<R: Read> {
    inner: R,
    /// Decompressed payload of the current block.
    block: Vec<u8>,
    /// Read position within `block`.
    pos: usize,
    /// Compressed offset of the next unread block.
    block_address: u64,
    /// Compressed offset of the block currently loaded.
    cur_block_start: u64,
    last_block_empty: bool,
    done: bool,
    cancel: CancelToken,
}

impl<R: Read> BgzfReader<R> {
    pub fn new(inner: R) -> Self {
        BgzfReader {
            inner,
            block: Vec::new(),
            pos: 0,
            block_address: 0,
            cur_block_start: 0,
            last_block_empty: false,
            done: false,
            cancel: CancelToken::new(),
        }
    }

    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = token;
    }

    /// Virtual offset of the next byte `read` will return.
    ///
    /// When the loaded block is exhausted this addresses the start of
    /// the next unread block, so offsets taken between records stay
    /// within the 16-bit intra-block range.
    pub fn virtual_offset(&self) -> VirtualOffset {
        if self.pos >= self.block.len() {
            VirtualOffset::from(self.block_address << 16)
        } else {
            VirtualOffset::from((self.cur_block_start << 16) | self.pos as u64)
        }
    }

    /// Compressed offset of the block currently loaded.
    pub fn block_start_offset(&self) -> u64 {
        self.cur_block_start
    }

    /// Load and verify the next block. `Ok(false)` on clean end of
    /// input.
    fn read_block(&mut self) -> Result<bool, BgzfError> {
        if self.done {
            return Ok(false);
        }
        if self.cancel.is_cancelled() {
            return Err(BgzfError::Cancelled);
        }
        let offset = self.block_address;

        let mut fixed = [0u8; 12];
        match self.inner.read(&mut fixed[..1]) {
            Ok(0) => {
                self.done = true;
                if !self.last_block_empty {
                    warn!("BGZF stream ended at offset {offset} without the EOF marker");
                }
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) => return Err(BgzfError::Io(e)),
        }
        read_exact_or_truncated(&mut self.inner, &mut fixed[1..], offset)?;

        if fixed[0] != 0x1f || fixed[1] != 0x8b {
            return Err(BgzfError::Framing {
                offset,
                reason: "bad gzip magic",
            });
        }
        if fixed[2] != 0x08 {
            return Err(BgzfError::Framing {
                offset,
                reason: "unsupported compression method",
            });
        }
        if fixed[3] & 0x04 == 0 {
            return Err(BgzfError::Framing {
                offset,
                reason: "missing FEXTRA flag",
            });
        }

        let xlen = u16::from_le_bytes([fixed[10], fixed[11]]) as usize;
        let mut extra = vec![0u8; xlen];
        read_exact_or_truncated(&mut self.inner, &mut extra, offset)?;
        let bsize = bc_subfield(&extra).ok_or(BgzfError::Framing {
            offset,
            reason: "missing BC subfield",
        })?;

        let total = bsize as usize + 1;
        let deflate_len = total
            .checked_sub(12 + xlen + 8)
            .ok_or(BgzfError::Framing {
                offset,
                reason: "block size smaller than its framing",
            })?;

        let mut deflate_data = vec![0u8; deflate_len];
        read_exact_or_truncated(&mut self.inner, &mut deflate_data, offset)?;
        let mut footer = [0u8; 8];
        read_exact_or_truncated(&mut self.inner, &mut footer, offset)?;

        let expected_crc = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
        let expected_isize = u32::from_le_bytes([footer[4], footer[5], footer[6], footer[7]]);
        if expected_isize as usize > MAX_BLOCK_SIZE {
            return Err(BgzfError::Framing {
                offset,
                reason: "uncompressed block size exceeds 65536",
            });
        }

        self.block.clear();
        self.block.reserve(expected_isize as usize);
        let mut decoder = DeflateDecoder::new(&deflate_data[..]);
        decoder
            .read_to_end(&mut self.block)
            .map_err(|_| BgzfError::Framing {
                offset,
                reason: "corrupt deflate payload",
            })?;

        if self.block.len() != expected_isize as usize {
            return Err(BgzfError::Checksum {
                offset,
                expected: expected_isize,
                actual: self.block.len() as u32,
            });
        }
        let actual_crc = crc32fast::hash(&self.block);
        if actual_crc != expected_crc {
            return Err(BgzfError::Checksum {
                offset,
                expected: expected_crc,
                actual: actual_crc,
            });
        }

        self.cur_block_start = offset;
        self.block_address += total as u64;
        self.pos = 0;
        self.last_block_empty = self.block.is_empty();
        Ok(true)
    }
}

impl<R: Read> BufRead for BgzfReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        while self.pos >= self.block.len() {
            if !self.read_block()? {
                return Ok(&[]);
            }
        }
        Ok(&self.block[self.pos..])
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.block.len());
    }
}

impl<R: Read> Read for BgzfReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let avail = self.fill_buf()?;
        if avail.is_empty() {
            return Ok(0);
        }
        let take = avail.len().min(out.len());
        out[..take].copy_from_slice(&avail[..take]);
        self.consume(take);
        Ok(take)
    }
}

/// BSIZE value from the gzip extra field's BC subfield, if present.
fn bc_subfield(extra: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i + 4 <= extra.len() {
        let slen = u16::from_le_bytes([extra[i + 2], extra[i + 3]]) as usize;
        if extra[i] == b'B' && extra[i + 1] == b'C' && slen == 2 && i + 6 <= extra.len() {
            return Some(u16::from_le_bytes([extra[i + 4], extra[i + 5]]));
        }
        i += 4 + slen;
    }
    None
}

fn read_exact_or_truncated<R: Read>(
    inner: &mut R,
    buf: &mut [u8],
    offset: u64,
) -> Result<(), BgzfError> {
    let mut filled = 0;
    while filled < buf.len() {
        match inner.read(&mut buf[filled..]) {
            Ok(0) => return Err(BgzfError::Truncated { offset }),
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(BgzfError::Io(e)),
        }
    }
    Ok(())
}

// --- BEGIN TESTS --- //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{BgzfConfig, BgzfWriter};
    use crate::EOF_BLOCK;
    use std::io::Write;

    fn compress(data: &[u8]) -> Vec<u8> {
        let mut sink = Vec::new();
        let mut writer = BgzfWriter::new(&mut sink);
        writer.write_all(data).unwrap();
        writer.finish().unwrap();
        sink
    }

    /// Compressed offsets of every block, walked via the BC subfield.
    fn block_offsets(compressed: &[u8]) -> Vec<u64> {
        let mut offsets = Vec::new();
        let mut at = 0usize;
        while at < compressed.len() {
            assert_eq!(&compressed[at..at + 2], &[0x1f, 0x8b]);
            offsets.push(at as u64);
            let bsize = u16::from_le_bytes([compressed[at + 16], compressed[at + 17]]);
            at += bsize as usize + 1;
        }
        offsets
    }

    #[test]
    fn round_trips_multi_block_stream() {
        let data = b"HELLO".repeat(20000);
        assert_eq!(data.len(), 100_000);
        let compressed = compress(&data);

        let offsets = block_offsets(&compressed);
        // at least two data blocks plus the EOF marker
        assert!(offsets.len() >= 3);
        assert_eq!(&compressed[compressed.len() - EOF_BLOCK.len()..], &EOF_BLOCK);

        let mut reader = BgzfReader::new(&compressed[..]);
        let mut out = Vec::new();
        let mut observed = Vec::new();
        loop {
            let n = {
                let chunk = reader.fill_buf().unwrap();
                if chunk.is_empty() {
                    break;
                }
                out.extend_from_slice(chunk);
                chunk.len()
            };
            observed.push(reader.block_start_offset());
            reader.consume(n);
        }
        assert_eq!(out, data);
        // every observed source-block offset is a real gzip magic position
        for off in &observed {
            assert!(offsets.contains(off));
        }
        assert_eq!(observed.len() + 1, offsets.len());
    }

    #[test]
    fn tolerates_missing_eof_marker() {
        let data = b"no terminator".to_vec();
        let compressed = compress(&data);
        let chopped = &compressed[..compressed.len() - EOF_BLOCK.len()];

        let mut reader = BgzfReader::new(chopped);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn truncated_stream_is_not_a_checksum_failure() {
        let compressed = compress(b"some payload worth keeping");
        let chopped = &compressed[..compressed.len() - 8];

        let mut reader = BgzfReader::new(chopped);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        let inner = err
            .get_ref()
            .and_then(|e| e.downcast_ref::<BgzfError>())
            .unwrap();
        assert!(matches!(inner, BgzfError::Truncated { .. }));
    }

    #[test]
    fn corrupted_crc_is_a_checksum_failure() {
        let mut compressed = compress(b"checksummed payload");
        let first_total = u16::from_le_bytes([compressed[16], compressed[17]]) as usize + 1;
        compressed[first_total - 8] ^= 0xFF;

        let mut reader = BgzfReader::new(&compressed[..]);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        let inner = err
            .get_ref()
            .and_then(|e| e.downcast_ref::<BgzfError>())
            .unwrap();
        assert!(matches!(inner, BgzfError::Checksum { .. }));
    }

    #[test]
    fn bad_magic_is_a_framing_failure() {
        let mut compressed = compress(b"payload");
        compressed[0] = 0x00;
        let mut reader = BgzfReader::new(&compressed[..]);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        let inner = err
            .get_ref()
            .and_then(|e| e.downcast_ref::<BgzfError>())
            .unwrap();
        assert!(matches!(
            inner,
            BgzfError::Framing {
                reason: "bad gzip magic",
                ..
            }
        ));
    }

    #[test]
    fn level_zero_still_produces_valid_blocks() {
        let data = b"stored, not squeezed".repeat(100);
        let mut sink = Vec::new();
        let mut writer = BgzfWriter::with_config(
            &mut sink,
            BgzfConfig {
                compression_level: 0,
                ..BgzfConfig::default()
            },
        );
        writer.write_all(&data).unwrap();
        writer.finish().unwrap();

        let mut reader = BgzfReader::new(&sink[..]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn cancellation_stops_at_a_block_boundary() {
        let compressed = compress(&b"X".repeat(200_000));
        let mut reader = BgzfReader::new(&compressed[..]);
        let token = CancelToken::new();
        reader.set_cancel_token(token.clone());

        let mut first = vec![0u8; 16];
        reader.read_exact(&mut first).unwrap();
        token.cancel();

        // the loaded block drains, then the next refill observes the token
        let mut rest = Vec::new();
        let err = reader.read_to_end(&mut rest).unwrap_err();
        let inner = err
            .get_ref()
            .and_then(|e| e.downcast_ref::<BgzfError>())
            .unwrap();
        assert!(matches!(inner, BgzfError::Cancelled));
    }
}

// --- END TESTS --- //
