use log::warn;
use nom::{Err::Incomplete, Needed};
use std::io::{BufRead, Read};

use operon_common::CancelToken;

use crate::{parser, BamError, BamHeader, Record, References};

/// Represents the state of the BAM Reader
///
/// Header => Next call will parse the BAM header
/// Reference => Next call will parse references
/// Alignment => Next call to `read_record()` will parse an alignment
/// Complete => Reader has been exhausted
/// Errored => A fatal error occurred; further reads return `StreamClosed`
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BamReaderState {
    Header,
    Reference,
    Alignment,
    Complete,
    Errored,
}

/// What to do when a single record fails to decode.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum ErrorPolicy {
    /// Surface the error and close the stream.
    #[default]
    Fail,
    /// Log, drop the record, and resynchronize at the next block-size
    /// boundary.
    SkipRecord,
}

#[derive(Clone, Debug)]
pub struct BamReaderConfig {
    pub skip_validation: bool,
    /// Hard cap on a single record's announced size.
    pub max_record_bytes: usize,
    pub on_record_error: ErrorPolicy,
}

impl Default for BamReaderConfig {
    fn default() -> Self {
        BamReaderConfig {
            skip_validation: false,
            max_record_bytes: 1 << 20,
            on_record_error: ErrorPolicy::default(),
        }
    }
}

/// A streaming BAM Reader
///
/// Accepts any source implementing BufRead carrying *uncompressed* BAM
/// bytes, so it is normally coupled with a `BgzfReader`. The header and
/// reference table are consumed eagerly at construction; alignments
/// stream through the `Iterator` implementation.
pub struct BamReader<T>
where
    T: BufRead,
{
    inner: T,
    buffer: Vec<u8>,
    offset: usize,
    state: BamReaderState,
    header: Option<BamHeader>,
    references: References,
    config: BamReaderConfig,
    cancel: CancelToken,
    n_records: u64,
}

impl<T> BamReader<T>
where
    T: BufRead,
{
    pub fn new(handle: T) -> Result<Self, BamError> {
        BamReader::with_config(handle, BamReaderConfig::default())
    }

    pub fn with_config(handle: T, config: BamReaderConfig) -> Result<Self, BamError> {
        let mut reader = BamReader {
            inner: handle,
            buffer: Vec::with_capacity(8192),
            offset: 0,
            state: BamReaderState::Header,
            header: None,
            references: References::default(),
            config,
            cancel: CancelToken::new(),
            n_records: 0,
        };
        reader.read_header()?;
        if reader.state == BamReaderState::Reference {
            reader.read_references()?;
        }
        Ok(reader)
    }

    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = token;
    }

    pub fn header(&self) -> Option<&BamHeader> {
        self.header.as_ref()
    }

    pub fn references(&self) -> &References {
        &self.references
    }

    pub fn state(&self) -> BamReaderState {
        self.state
    }

    fn get_slice(&self) -> &[u8] {
        &self.buffer[self.offset..]
    }

    fn read_to_buffer(&mut self, amt: u64) -> Result<u64, std::io::Error> {
        std::io::copy(&mut self.inner.by_ref().take(amt), &mut self.buffer)
    }

    fn read_header(&mut self) -> Result<(), BamError> {
        self.read_to_buffer(12)?;
        loop {
            match parser::read_header(self.get_slice()) {
                Ok((rest, header)) => {
                    self.offset = self.buffer.len() - rest.len();
                    self.state = if header.n_ref() > 0 {
                        BamReaderState::Reference
                    } else {
                        BamReaderState::Alignment
                    };
                    self.header = Some(header);
                    return Ok(());
                }
                Err(Incomplete(needed)) => {
                    let amt = match needed {
                        Needed::Size(s) => s.get() as u64,
                        Needed::Unknown => 1,
                    };
                    if self.read_to_buffer(amt)? == 0 {
                        return Err(BamError::Framing(
                            "unexpected end of input in header".into(),
                        ));
                    }
                }
                Err(_) => return Err(BamError::MissingMagicString),
            }
        }
    }

    fn read_references(&mut self) -> Result<(), BamError> {
        let n_ref = self
            .header
            .as_ref()
            .map(|h| h.n_ref() as usize)
            .unwrap_or(0);
        let mut references = Vec::with_capacity(n_ref);
        while references.len() < n_ref {
            match parser::read_reference(self.get_slice())? {
                Some((rest, reference)) => {
                    self.offset = self.buffer.len() - rest.len();
                    references.push(reference);
                }
                None => {
                    if self.read_to_buffer(64)? == 0 {
                        return Err(BamError::Framing(format!(
                            "input ended after {} of {} references",
                            references.len(),
                            n_ref
                        )));
                    }
                }
            }
        }
        self.buffer.drain(..self.offset);
        self.offset = 0;
        self.references = References::new(references);
        self.state = BamReaderState::Alignment;
        Ok(())
    }

    /// Top the buffer up so at least `want` unconsumed bytes are
    /// present, short only at end of input.
    fn fill_buffer_to(&mut self, want: usize) -> Result<usize, BamError> {
        let have = self.buffer.len() - self.offset;
        if have < want {
            self.read_to_buffer((want - have) as u64)?;
        }
        Ok(self.buffer.len() - self.offset)
    }

    /// Read one record's payload into the buffer.
    ///
    /// Returns the payload length, or `None` at a clean end of input.
    fn read_block(&mut self) -> Result<Option<usize>, BamError> {
        match self.fill_buffer_to(4)? {
            0 => return Ok(None),
            1..=3 => return Err(BamError::Framing("input ended inside a block size".into())),
            _ => {}
        }
        let bsize = match parser::block_size(self.get_slice()) {
            Ok((_, v)) => v as usize,
            Err(_) => return Err(BamError::Framing("unreadable block size".into())),
        };
        if bsize > self.config.max_record_bytes {
            return Err(BamError::Field {
                field: "block_size",
                reason: format!(
                    "{bsize} bytes exceeds the {} byte record cap",
                    self.config.max_record_bytes
                ),
            });
        }
        self.offset += 4;
        let have = self.fill_buffer_to(bsize)?;
        if have < bsize {
            return Err(BamError::Framing(format!(
                "record {}: input ended {} bytes into a {} byte record",
                self.n_records, have, bsize
            )));
        }
        Ok(Some(bsize))
    }

    pub fn read_record(&mut self) -> Option<Result<Record, BamError>> {
        loop {
            match self.state {
                BamReaderState::Alignment => {}
                BamReaderState::Complete => return None,
                BamReaderState::Errored => return Some(Err(BamError::StreamClosed)),
                // header and references are consumed during construction
                BamReaderState::Header | BamReaderState::Reference => {
                    return Some(Err(BamError::StreamClosed))
                }
            }
            if self.cancel.is_cancelled() {
                self.state = BamReaderState::Complete;
                return Some(Err(BamError::Cancelled));
            }

            self.buffer.drain(..self.offset);
            self.offset = 0;
            let bsize = match self.read_block() {
                Ok(None) => {
                    self.state = BamReaderState::Complete;
                    return None;
                }
                Ok(Some(bsize)) => bsize,
                // transport and framing failures are never skippable
                Err(e) => {
                    self.state = BamReaderState::Errored;
                    return Some(Err(e));
                }
            };

            let payload = &self.buffer[self.offset..self.offset + bsize];
            let parsed = parser::read_alignment(payload).and_then(|mut record| {
                parser::restore_long_cigar(&mut record, &self.references);
                if !self.config.skip_validation {
                    record.validate()?;
                    if record.ref_id >= self.references.len() as i32 {
                        return Err(BamError::Field {
                            field: "ref_id",
                            reason: format!(
                                "{} outside the {} entry reference table",
                                record.ref_id,
                                self.references.len()
                            ),
                        });
                    }
                }
                Ok(record)
            });
            self.offset += bsize;

            match parsed {
                Ok(record) => {
                    self.n_records += 1;
                    return Some(Ok(record));
                }
                Err(e) => match self.config.on_record_error {
                    ErrorPolicy::Fail => {
                        self.state = BamReaderState::Errored;
                        return Some(Err(e));
                    }
                    ErrorPolicy::SkipRecord => {
                        warn!("skipping record {}: {e}", self.n_records);
                        self.n_records += 1;
                    }
                },
            }
        }
    }
}

impl<B> Iterator for BamReader<B>
where
    B: BufRead,
{
    type Item = Result<Record, BamError>;

    /// Yields records until the stream ends; a closed stream ends the
    /// iteration rather than repeating `StreamClosed`.
    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            BamReaderState::Errored => None,
            _ => self.read_record(),
        }
    }
}

// --- BEGIN TESTS --- //


// --- END TESTS --- //
