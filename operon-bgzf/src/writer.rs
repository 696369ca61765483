use std::io::{self, Write};

use flate2::write::DeflateEncoder;
use flate2::Compression;

use operon_common::CancelToken;

use crate::{
    BgzfError, VirtualOffset, BLOCK_FRAMING, EOF_BLOCK, HEADER_TEMPLATE, MAX_BLOCK_SIZE,
    MAX_RECORD_PAYLOAD, MIN_BLOCK_SIZE,
};

// Uncompressed bytes buffered before a routine flush, leaving headroom
// so worst-case deflate output still fits the frame.
const BLOCK_HEADROOM: usize = 256;

#[derive(Clone, Copy, Debug)]
pub struct BgzfConfig {
    /// Deflate level, 0..=9. Level 0 emits stored deflate blocks.
    pub compression_level: u32,
    /// Target block size in bytes; clamped to `[1024, 65536]`.
    pub block_size: usize,
}

impl Default for BgzfConfig {
    fn default() -> Self {
        BgzfConfig {
            compression_level: 6,
            block_size: MAX_BLOCK_SIZE,
        }
    }
}

/// Block-emitting BGZF compressor.
///
/// Buffers writes into whole blocks; `finish` emits the tail block and
/// the EOF marker. `begin_record` is the atomicity hint the BAM writer
/// uses to keep a record inside one block.
pub struct BgzfWriter<W: Write> {
    inner: W,
    buf: Vec<u8>,
    /// Compressed bytes emitted so far.
    block_address: u64,
    level: u32,
    payload_target: usize,
    /// Bytes of the current record that must not be split.
    pending_record: usize,
    cancel: CancelToken,
}

impl<W: Write> BgzfWriter<W> {
    pub fn new(inner: W) -> Self {
        BgzfWriter::with_config(inner, BgzfConfig::default())
    }

    pub fn with_config(inner: W, config: BgzfConfig) -> Self {
        let block_size = config.block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE);
        BgzfWriter {
            inner,
            buf: Vec::with_capacity(block_size),
            block_address: 0,
            level: config.compression_level.min(9),
            payload_target: block_size - BLOCK_HEADROOM,
            pending_record: 0,
            cancel: CancelToken::new(),
        }
    }

    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = token;
    }

    /// Virtual offset the next written byte will occupy.
    pub fn virtual_offset(&self) -> VirtualOffset {
        VirtualOffset::from((self.block_address << 16) | self.buf.len() as u64)
    }

    /// Announce an atomic run of `upcoming` bytes.
    ///
    /// Everything written before the run completes lands in a single
    /// block. Fails before any byte reaches the sink if the run cannot
    /// fit one block at all.
    pub fn begin_record(&mut self, upcoming: usize) -> Result<(), BgzfError> {
        if upcoming > MAX_RECORD_PAYLOAD {
            return Err(BgzfError::RecordTooLarge {
                len: upcoming,
                max: MAX_RECORD_PAYLOAD,
            });
        }
        if !self.buf.is_empty() && self.buf.len() + upcoming > self.payload_target {
            self.flush_block()?;
        }
        self.pending_record = upcoming;
        Ok(())
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), BgzfError> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let take = if self.pending_record > 0 {
                // an announced record accumulates without flushing
                let take = remaining.len().min(self.pending_record);
                self.pending_record -= take;
                take
            } else {
                let space = self.payload_target.saturating_sub(self.buf.len());
                if space == 0 {
                    self.flush_block()?;
                    continue;
                }
                remaining.len().min(space)
            };
            self.buf.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            if self.pending_record == 0 && self.buf.len() >= self.payload_target {
                self.flush_block()?;
            }
        }
        Ok(())
    }

    /// Compress and emit the buffer as one block, then clear it.
    fn flush_block(&mut self) -> Result<(), BgzfError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(BgzfError::Cancelled);
        }

        let crc = crc32fast::hash(&self.buf);
        let isize_ = self.buf.len() as u32;

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(self.level));
        encoder.write_all(&self.buf)?;
        let compressed = encoder.finish()?;

        // Stored-block fallback when deflate expands past the frame.
        let payload = if compressed.len() + BLOCK_FRAMING > MAX_BLOCK_SIZE {
            stored_block(&self.buf)
        } else {
            compressed
        };

        let total = payload.len() + BLOCK_FRAMING;
        if total > MAX_BLOCK_SIZE {
            return Err(BgzfError::RecordTooLarge {
                len: self.buf.len(),
                max: MAX_RECORD_PAYLOAD,
            });
        }

        let mut block = Vec::with_capacity(total);
        block.extend_from_slice(&HEADER_TEMPLATE);
        let bsize = (total - 1) as u16;
        block[16..18].copy_from_slice(&bsize.to_le_bytes());
        block.extend_from_slice(&payload);
        block.extend_from_slice(&crc.to_le_bytes());
        block.extend_from_slice(&isize_.to_le_bytes());

        self.inner.write_all(&block)?;
        self.block_address += total as u64;
        self.buf.clear();
        Ok(())
    }

    /// Flush the tail block and append the EOF marker, returning the
    /// inner sink. A cancelled writer never emits the marker.
    pub fn finish(mut self) -> Result<W, BgzfError> {
        self.flush_block()?;
        if self.cancel.is_cancelled() {
            return Err(BgzfError::Cancelled);
        }
        self.inner.write_all(&EOF_BLOCK)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for BgzfWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.write_bytes(data)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_block()?;
        self.inner.flush()
    }
}

// RFC 1951 stored block: [0x01][len][~len][data]; only valid for runs
// under 65536 bytes, which the payload cap guarantees.
fn stored_block(data: &[u8]) -> Vec<u8> {
    let len = data.len() as u16;
    let mut out = Vec::with_capacity(5 + data.len());
    out.push(0x01);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&(!len).to_le_bytes());
    out.extend_from_slice(data);
    out
}

// --- BEGIN TESTS --- //


// --- END TESTS --- //
