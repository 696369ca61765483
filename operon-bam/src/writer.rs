use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

use operon_bgzf::{BgzfConfig, BgzfWriter, VirtualOffset};
use operon_common::{binning, CancelToken};

use crate::{
    BamAuxField, BamAuxValue, BamError, BamReference, Record, BAM_MAGIC_STR, UNMAPPED_BIN,
};

/// BAM serializer over a BGZF transport.
///
/// Write the header first, then records in source order. Each record is
/// announced to the transport so it never straddles a block, and the
/// virtual-offset interval it lands in is returned for indexing.
pub struct BamWriter<W: Write> {
    inner: BgzfWriter<W>,
    scratch: Vec<u8>,
    header_written: bool,
    n_ref: usize,
    n_records: u64,
    cancel: CancelToken,
}

impl<W: Write> BamWriter<W> {
    pub fn new(sink: W) -> Self {
        BamWriter::with_config(sink, BgzfConfig::default())
    }

    pub fn with_config(sink: W, config: BgzfConfig) -> Self {
        BamWriter {
            inner: BgzfWriter::with_config(sink, config),
            scratch: Vec::with_capacity(1024),
            header_written: false,
            n_ref: 0,
            n_records: 0,
            cancel: CancelToken::new(),
        }
    }

    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = token.clone();
        self.inner.set_cancel_token(token);
    }

    /// Virtual offset the next record will begin at.
    pub fn virtual_offset(&self) -> VirtualOffset {
        self.inner.virtual_offset()
    }

    /// Emit magic, header text, and the reference table.
    pub fn write_header(
        &mut self,
        text: &str,
        references: &[BamReference],
    ) -> Result<(), BamError> {
        if self.header_written {
            return Err(BamError::Framing("header written twice".into()));
        }
        self.scratch.clear();
        self.scratch.extend_from_slice(&BAM_MAGIC_STR);
        self.scratch
            .write_u32::<LittleEndian>(text.len() as u32)?;
        self.scratch.extend_from_slice(text.as_bytes());
        self.scratch
            .write_u32::<LittleEndian>(references.len() as u32)?;
        for reference in references {
            self.scratch
                .write_u32::<LittleEndian>(reference.name().len() as u32 + 1)?;
            self.scratch.extend_from_slice(reference.name().as_bytes());
            self.scratch.push(0);
            self.scratch.write_u32::<LittleEndian>(reference.l_ref())?;
        }
        self.inner.write_bytes(&self.scratch)?;
        self.n_ref = references.len();
        self.header_written = true;
        Ok(())
    }

    /// Serialize one record, returning the half-open virtual-offset
    /// interval it occupies.
    pub fn write_record(
        &mut self,
        record: &Record,
    ) -> Result<(VirtualOffset, VirtualOffset), BamError> {
        if !self.header_written {
            return Err(BamError::Framing("record written before header".into()));
        }
        if self.cancel.is_cancelled() {
            return Err(BamError::Cancelled);
        }
        record.validate()?;
        if record.ref_id >= self.n_ref as i32 {
            return Err(BamError::Field {
                field: "ref_id",
                reason: format!("{} outside the {} entry reference table", record.ref_id, self.n_ref),
            });
        }

        encode_record(&mut self.scratch, record).map_err(|e| match e {
            BamError::Field { field, reason } => BamError::Field {
                field,
                reason: format!("record {}: {reason}", self.n_records),
            },
            other => other,
        })?;

        // the hint fails before anything reaches the sink
        self.inner.begin_record(self.scratch.len() + 4)?;
        let begin = self.inner.virtual_offset();
        let mut prefix = [0u8; 4];
        (&mut prefix[..]).write_u32::<LittleEndian>(self.scratch.len() as u32)?;
        self.inner.write_bytes(&prefix)?;
        self.inner.write_bytes(&self.scratch)?;
        let end = self.inner.virtual_offset();
        self.n_records += 1;
        Ok((begin, end))
    }

    /// Flush the transport and append the EOF marker, returning the
    /// sink.
    pub fn finish(self) -> Result<W, BamError> {
        Ok(self.inner.finish()?)
    }
}

/// Bin for a record's mapped interval, per the hierarchical scheme.
fn record_bin(record: &Record) -> Result<u16, BamError> {
    if record.pos < 0 {
        return Ok(UNMAPPED_BIN);
    }
    let start = record.pos as u64;
    let end = start + record.reference_span().max(1);
    let bin = binning::bin_of(start, end).map_err(|e| BamError::Field {
        field: "pos",
        reason: e.to_string(),
    })?;
    Ok(bin as u16)
}

/// Serialize the record payload (everything after block_size).
fn encode_record(buf: &mut Vec<u8>, record: &Record) -> Result<(), BamError> {
    buf.clear();

    let n_cigar = u16::try_from(record.cigar.len()).map_err(|_| BamError::Field {
        field: "cigar",
        reason: format!("{} ops exceed the 16-bit count", record.cigar.len()),
    })?;
    let l_seq = u32::try_from(record.seq.len()).map_err(|_| BamError::Field {
        field: "seq",
        reason: "length exceeds 32 bits".into(),
    })?;

    buf.write_i32::<LittleEndian>(record.ref_id)?;
    buf.write_i32::<LittleEndian>(record.pos)?;
    buf.write_u8(record.qname.len() as u8 + 1)?;
    buf.write_u8(record.mapq)?;
    buf.write_u16::<LittleEndian>(record_bin(record)?)?;
    buf.write_u16::<LittleEndian>(n_cigar)?;
    buf.write_u16::<LittleEndian>(record.flags.into())?;
    buf.write_u32::<LittleEndian>(l_seq)?;
    buf.write_i32::<LittleEndian>(record.next_ref_id)?;
    buf.write_i32::<LittleEndian>(record.next_pos)?;
    buf.write_i32::<LittleEndian>(record.tlen)?;

    buf.extend_from_slice(record.qname.as_bytes());
    buf.push(0);

    for op in &record.cigar {
        let packed = op.pack().map_err(|e| BamError::Field {
            field: "cigar",
            reason: e.to_string(),
        })?;
        buf.write_u32::<LittleEndian>(packed)?;
    }

    for pair in record.seq.chunks(2) {
        let hi = pair[0].code() << 4;
        let lo = pair.get(1).map(|base| base.code()).unwrap_or(0);
        buf.push(hi | lo);
    }

    match &record.qual {
        Some(scores) => buf.extend_from_slice(scores),
        None => buf.extend(std::iter::repeat(0xFF).take(record.seq.len())),
    }

    for field in &record.aux {
        encode_aux(buf, field)?;
    }
    Ok(())
}

fn encode_aux(buf: &mut Vec<u8>, field: &BamAuxField) -> Result<(), BamError> {
    buf.extend_from_slice(&field.tag);
    match &field.value {
        BamAuxValue::A(v) => {
            if !v.is_ascii_graphic() {
                return Err(BamError::TagType('A'));
            }
            buf.push(b'A');
            buf.push(*v as u8);
        }
        BamAuxValue::c(v) => {
            buf.push(b'c');
            buf.write_i8(*v)?;
        }
        BamAuxValue::C(v) => {
            buf.push(b'C');
            buf.push(*v);
        }
        BamAuxValue::s(v) => {
            buf.push(b's');
            buf.write_i16::<LittleEndian>(*v)?;
        }
        BamAuxValue::S(v) => {
            buf.push(b'S');
            buf.write_u16::<LittleEndian>(*v)?;
        }
        BamAuxValue::i(v) => {
            buf.push(b'i');
            buf.write_i32::<LittleEndian>(*v)?;
        }
        BamAuxValue::I(v) => {
            buf.push(b'I');
            buf.write_u32::<LittleEndian>(*v)?;
        }
        BamAuxValue::f(v) => {
            buf.push(b'f');
            buf.write_f32::<LittleEndian>(*v)?;
        }
        BamAuxValue::Z(v) => {
            if v.as_bytes().contains(&0) {
                return Err(BamError::TagType('Z'));
            }
            buf.push(b'Z');
            buf.extend_from_slice(v.as_bytes());
            buf.push(0);
        }
        BamAuxValue::H(v) => {
            if v.len() % 2 != 0 || !v.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(BamError::TagType('H'));
            }
            buf.push(b'H');
            buf.extend_from_slice(v.as_bytes());
            buf.push(0);
        }
        BamAuxValue::Bc(v) => encode_array(buf, b'c', v, |buf, x| buf.write_i8(*x))?,
        BamAuxValue::BC(v) => encode_array(buf, b'C', v, |buf, x| buf.write_u8(*x))?,
        BamAuxValue::Bs(v) => {
            encode_array(buf, b's', v, |buf, x| buf.write_i16::<LittleEndian>(*x))?
        }
        BamAuxValue::BS(v) => {
            encode_array(buf, b'S', v, |buf, x| buf.write_u16::<LittleEndian>(*x))?
        }
        BamAuxValue::Bi(v) => {
            encode_array(buf, b'i', v, |buf, x| buf.write_i32::<LittleEndian>(*x))?
        }
        BamAuxValue::BI(v) => {
            encode_array(buf, b'I', v, |buf, x| buf.write_u32::<LittleEndian>(*x))?
        }
        BamAuxValue::Bf(v) => {
            encode_array(buf, b'f', v, |buf, x| buf.write_f32::<LittleEndian>(*x))?
        }
    }
    Ok(())
}

fn encode_array<T>(
    buf: &mut Vec<u8>,
    subtype: u8,
    vals: &[T],
    mut put: impl FnMut(&mut Vec<u8>, &T) -> std::io::Result<()>,
) -> Result<(), BamError> {
    buf.push(b'B');
    buf.push(subtype);
    buf.write_u32::<LittleEndian>(vals.len() as u32)?;
    for v in vals {
        put(buf, v)?;
    }
    Ok(())
}

// --- BEGIN TESTS --- //


// --- END TESTS --- //
