//! svndiff delta decoding.
//!
//! A delta stream is a 4-byte header (`SVN` plus a version byte) followed by
//! windows. Each window names a slice of the base ("source view"), the
//! length of the text it produces, and two sections: instructions and new
//! data. Version 1 compresses sections with zlib, version 2 with lz4; both
//! prefix a compressed section with its decoded length.

use std::io::{Read, Write};

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::SvnError;

const MAGIC: &[u8; 3] = b"SVN";
const MAX_VARINT_LEN: usize = 10;
const MAX_WINDOW: usize = 64 * 1024;
const MAX_INSTRUCTIONS: usize = MAX_WINDOW * (2 * MAX_VARINT_LEN + 1);

fn corrupt(what: &str) -> SvnError {
    SvnError::Protocol(format!("svndiff: {what}"))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Compression {
    None,
    Zlib,
    Lz4,
}

/// Reads a 7-bit big-endian varint. `Ok(None)` means more input is needed.
fn read_varint(input: &[u8]) -> Result<Option<(u64, usize)>, SvnError> {
    let mut value = 0u64;
    for (i, &byte) in input.iter().take(MAX_VARINT_LEN).enumerate() {
        value = value
            .checked_mul(128)
            .map(|v| v | u64::from(byte & 0x7f))
            .ok_or_else(|| corrupt("integer overflow"))?;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if input.len() >= MAX_VARINT_LEN {
        return Err(corrupt("integer too long"));
    }
    Ok(None)
}

fn read_size(input: &[u8], limit: usize) -> Result<Option<(usize, usize)>, SvnError> {
    match read_varint(input)? {
        Some((value, used)) => {
            let value = usize::try_from(value)
                .ok()
                .filter(|v| *v <= limit)
                .ok_or_else(|| corrupt("window field too large"))?;
            Ok(Some((value, used)))
        }
        None => Ok(None),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct WindowHeader {
    source_offset: u64,
    source_len: usize,
    target_len: usize,
    instructions_len: usize,
    new_data_len: usize,
    encoded_len: usize,
}

impl WindowHeader {
    fn parse(input: &[u8]) -> Result<Option<Self>, SvnError> {
        let mut at = 0usize;
        let Some((source_offset, used)) = read_varint(input)? else {
            return Ok(None);
        };
        at += used;
        let mut fields = [0usize; 4];
        let limits = [MAX_WINDOW, MAX_WINDOW, MAX_INSTRUCTIONS, MAX_WINDOW + MAX_VARINT_LEN];
        for (field, limit) in fields.iter_mut().zip(limits) {
            let Some((value, used)) = read_size(&input[at..], limit)? else {
                return Ok(None);
            };
            *field = value;
            at += used;
        }
        let [source_len, target_len, instructions_len, new_data_len] = fields;
        source_offset
            .checked_add(source_len as u64)
            .ok_or_else(|| corrupt("source view overflow"))?;
        Ok(Some(Self {
            source_offset,
            source_len,
            target_len,
            instructions_len,
            new_data_len,
            encoded_len: at,
        }))
    }

    fn total_len(&self) -> usize {
        self.encoded_len + self.instructions_len + self.new_data_len
    }
}

fn decompress(compression: Compression, section: &[u8], limit: usize) -> Result<Vec<u8>, SvnError> {
    if compression == Compression::None {
        return Ok(section.to_vec());
    }
    let (len, used) = read_size(section, limit)?.ok_or_else(|| corrupt("section size missing"))?;
    let payload = &section[used..];
    if payload.len() == len {
        return Ok(payload.to_vec());
    }
    let decoded = match compression {
        Compression::Zlib => {
            let mut out = Vec::with_capacity(len);
            flate2::read::ZlibDecoder::new(payload)
                .take(len as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|e| corrupt(&format!("zlib section: {e}")))?;
            out
        }
        Compression::Lz4 => lz4_flex::decompress(payload, len)
            .map_err(|e| corrupt(&format!("lz4 section: {e}")))?,
        Compression::None => payload.to_vec(),
    };
    if decoded.len() != len {
        return Err(corrupt("section length mismatch"));
    }
    Ok(decoded)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Instruction {
    Source { offset: usize, len: usize },
    Target { offset: usize, len: usize },
    NewData { len: usize },
}

struct Instructions<'a> {
    bytes: &'a [u8],
}

impl Instructions<'_> {
    fn field(&mut self) -> Result<usize, SvnError> {
        let (value, used) =
            read_size(self.bytes, usize::MAX)?.ok_or_else(|| corrupt("truncated instruction"))?;
        self.bytes = &self.bytes[used..];
        Ok(value)
    }

    fn decode(&mut self, selector: u8) -> Result<Instruction, SvnError> {
        let len = match usize::from(selector & 0x3f) {
            0 => self.field()?,
            len => len,
        };
        if len == 0 {
            return Err(corrupt("zero-length instruction"));
        }
        match selector >> 6 {
            0 => Ok(Instruction::Source {
                len,
                offset: self.field()?,
            }),
            1 => Ok(Instruction::Target {
                len,
                offset: self.field()?,
            }),
            2 => Ok(Instruction::NewData { len }),
            _ => Err(corrupt("invalid instruction")),
        }
    }
}

impl Iterator for Instructions<'_> {
    type Item = Result<Instruction, SvnError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (&selector, rest) = self.bytes.split_first()?;
        self.bytes = rest;
        Some(self.decode(selector))
    }
}

fn apply_instructions(
    source: &[u8],
    target_len: usize,
    instructions: &[u8],
    new_data: &[u8],
) -> Result<Vec<u8>, SvnError> {
    let mut target = Vec::with_capacity(target_len);
    let mut new_pos = 0usize;
    for instruction in (Instructions {
        bytes: instructions,
    }) {
        let instruction = instruction?;
        let len = match instruction {
            Instruction::Source { len, .. }
            | Instruction::Target { len, .. }
            | Instruction::NewData { len } => len,
        };
        if target.len().checked_add(len).is_none_or(|end| end > target_len) {
            return Err(corrupt("window overflows its target length"));
        }
        match instruction {
            Instruction::Source { offset, len } => {
                let slice = offset
                    .checked_add(len)
                    .and_then(|end| source.get(offset..end))
                    .ok_or_else(|| corrupt("source copy outside the source view"))?;
                target.extend_from_slice(slice);
            }
            Instruction::Target { offset, len } => {
                if offset >= target.len() {
                    return Err(corrupt("target copy starts past the output"));
                }
                // Overlapping copies repeat the bytes written so far.
                for i in offset..offset + len {
                    let byte = target[i];
                    target.push(byte);
                }
            }
            Instruction::NewData { len } => {
                let slice = new_pos
                    .checked_add(len)
                    .and_then(|end| new_data.get(new_pos..end))
                    .ok_or_else(|| corrupt("new data copy past the section"))?;
                target.extend_from_slice(slice);
                new_pos += len;
            }
        }
    }
    if target.len() != target_len {
        return Err(corrupt("window does not fill its target length"));
    }
    if new_pos != new_data.len() {
        return Err(corrupt("unused new data in window"));
    }
    Ok(target)
}

/// Applies an svndiff stream to a base text, one window at a time.
///
/// Feed raw chunks with [`DeltaApplier::push`]; completed windows are written
/// to the output immediately. An empty stream reproduces the base.
#[derive(Debug)]
pub struct DeltaApplier<'a> {
    base: &'a [u8],
    header: Vec<u8>,
    compression: Option<Compression>,
    pending: Vec<u8>,
    last_view: (u64, u64),
    windows: usize,
}

impl<'a> DeltaApplier<'a> {
    /// Creates an applier over `base`.
    pub fn new(base: &'a [u8]) -> Self {
        Self {
            base,
            header: Vec::with_capacity(4),
            compression: None,
            pending: Vec::new(),
            last_view: (0, 0),
            windows: 0,
        }
    }

    /// Number of windows applied so far.
    pub fn windows(&self) -> usize {
        self.windows
    }

    /// Decodes `chunk` and writes every window it completes.
    pub fn push<W: Write + ?Sized>(&mut self, chunk: &[u8], out: &mut W) -> Result<(), SvnError> {
        for text in self.decode(chunk)? {
            out.write_all(&text)?;
        }
        Ok(())
    }

    /// Ends the stream, failing on a truncated header or window.
    pub fn finish<W: Write + ?Sized>(self, out: &mut W) -> Result<(), SvnError> {
        if self.header.is_empty() {
            out.write_all(self.base)?;
            return Ok(());
        }
        self.check_complete()
    }

    fn check_complete(&self) -> Result<(), SvnError> {
        if self.compression.is_none() {
            return Err(corrupt("stream ended inside the header"));
        }
        if !self.pending.is_empty() {
            return Err(corrupt("stream ended inside a window"));
        }
        Ok(())
    }

    fn decode(&mut self, mut chunk: &[u8]) -> Result<Vec<Vec<u8>>, SvnError> {
        if self.compression.is_none() {
            let take = (4 - self.header.len()).min(chunk.len());
            self.header.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
            if self.header.len() < 4 {
                return Ok(Vec::new());
            }
            if &self.header[..3] != MAGIC {
                return Err(corrupt("bad header"));
            }
            self.compression = Some(match self.header[3] {
                0 => Compression::None,
                1 => Compression::Zlib,
                2 => Compression::Lz4,
                v => return Err(corrupt(&format!("unsupported version {v}"))),
            });
        }
        let compression = self.compression.unwrap_or(Compression::None);
        self.pending.extend_from_slice(chunk);

        let mut texts = Vec::new();
        let mut consumed = 0usize;
        while let Some(header) = WindowHeader::parse(&self.pending[consumed..])? {
            let end = consumed + header.total_len();
            if self.pending.len() < end {
                break;
            }
            let body = &self.pending[consumed + header.encoded_len..end];
            let (instructions, new_data) = body.split_at(header.instructions_len);
            let instructions = decompress(compression, instructions, MAX_INSTRUCTIONS)?;
            let new_data = decompress(compression, new_data, MAX_WINDOW)?;
            let source = self.source_view(&header)?;
            texts.push(apply_instructions(
                source,
                header.target_len,
                &instructions,
                &new_data,
            )?);
            self.windows += 1;
            consumed = end;
        }
        self.pending.drain(..consumed);
        Ok(texts)
    }

    fn source_view(&mut self, header: &WindowHeader) -> Result<&'a [u8], SvnError> {
        let base = self.base;
        if header.source_len == 0 {
            return Ok(&base[..0]);
        }
        let end = header.source_offset + header.source_len as u64;
        let (last_offset, last_end) = self.last_view;
        if header.source_offset < last_offset || end < last_end {
            return Err(corrupt("source views slide backwards"));
        }
        self.last_view = (header.source_offset, end);
        usize::try_from(header.source_offset)
            .ok()
            .zip(usize::try_from(end).ok())
            .and_then(|(start, end)| base.get(start..end))
            .ok_or_else(|| corrupt("source view outside the base"))
    }
}

/// Applies a complete svndiff stream to `base`, writing the result to `out`.
///
/// # Examples
///
/// ```
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// // svndiff0: one window that inserts "hi" as new data.
/// let delta = [b'S', b'V', b'N', 0, 0, 0, 2, 1, 2, 0x80 | 2, b'h', b'i'];
/// let mut out = Vec::new();
/// svn_core::delta::apply_delta(b"", [&delta[..]], &mut out).await.unwrap();
/// assert_eq!(out, b"hi");
/// # });
/// ```
pub async fn apply_delta<W, I, B>(base: &[u8], chunks: I, out: &mut W) -> Result<(), SvnError>
where
    W: AsyncWrite + Unpin + ?Sized,
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut applier = DeltaApplier::new(base);
    for chunk in chunks {
        for text in applier.decode(chunk.as_ref())? {
            out.write_all(&text).await?;
        }
    }
    if applier.header.is_empty() {
        out.write_all(base).await?;
    } else {
        applier.check_complete()?;
    }
    out.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::io::Write as _;

    use super::*;

    fn varint(mut value: u64) -> Vec<u8> {
        let mut out = vec![(value & 0x7f) as u8];
        value >>= 7;
        while value > 0 {
            out.push(0x80 | (value & 0x7f) as u8);
            value >>= 7;
        }
        out.reverse();
        out
    }

    fn window(source: (u64, usize), target_len: usize, instructions: &[u8], new_data: &[u8]) -> Vec<u8> {
        let mut out = varint(source.0);
        out.extend(varint(source.1 as u64));
        out.extend(varint(target_len as u64));
        out.extend(varint(instructions.len() as u64));
        out.extend(varint(new_data.len() as u64));
        out.extend_from_slice(instructions);
        out.extend_from_slice(new_data);
        out
    }

    fn apply(base: &[u8], chunks: &[&[u8]]) -> Result<Vec<u8>, SvnError> {
        let mut applier = DeltaApplier::new(base);
        let mut out = Vec::new();
        for chunk in chunks {
            applier.push(chunk, &mut out)?;
        }
        applier.finish(&mut out)?;
        Ok(out)
    }

    #[test]
    fn source_and_new_data_copies() {
        // copy "hello" from the source, then insert ", world".
        let instructions = [5, 0, 0x80 | 7];
        let mut delta = b"SVN\0".to_vec();
        delta.extend(window((0, 5), 12, &instructions, b", world"));
        assert_eq!(apply(b"hello", &[&delta]).unwrap(), b"hello, world");
    }

    #[test]
    fn overlapping_target_copy_repeats_bytes() {
        // new "ab", then copy 6 bytes from target offset 0.
        let instructions = [0x80 | 2, 0x40 | 6, 0];
        let mut delta = b"SVN\0".to_vec();
        delta.extend(window((0, 0), 8, &instructions, b"ab"));
        assert_eq!(apply(b"", &[&delta]).unwrap(), b"abababab");
    }

    #[test]
    fn windows_split_across_chunks() {
        let instructions = [0x80 | 3];
        let mut delta = b"SVN\0".to_vec();
        delta.extend(window((0, 0), 3, &instructions, b"abc"));
        delta.extend(window((0, 0), 3, &instructions, b"def"));
        let pieces: Vec<&[u8]> = delta.chunks(3).collect();
        assert_eq!(apply(b"", &pieces).unwrap(), b"abcdef");
    }

    #[test]
    fn empty_stream_is_identity() {
        assert_eq!(apply(b"base", &[]).unwrap(), b"base");
    }

    #[test]
    fn zlib_sections_are_inflated() {
        let text = b"compressible compressible compressible".repeat(4);
        let instructions = {
            let mut ins = vec![0x80];
            ins.extend(varint(text.len() as u64));
            ins
        };
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&text).unwrap();
        let mut new_section = varint(text.len() as u64);
        new_section.extend(encoder.finish().unwrap());
        let mut ins_section = varint(instructions.len() as u64);
        ins_section.extend(&instructions);

        let mut delta = b"SVN\x01".to_vec();
        delta.extend(window((0, 0), text.len(), &ins_section, &new_section));
        assert_eq!(apply(b"", &[&delta]).unwrap(), text);
    }

    #[test]
    fn lz4_sections_are_decoded() {
        let text = b"lz4 lz4 lz4 lz4 lz4 lz4 lz4 lz4".to_vec();
        let mut ins_section = varint(1);
        ins_section.push(0x80 | text.len() as u8);
        let mut new_section = varint(text.len() as u64);
        new_section.extend(lz4_flex::compress(&text));

        let mut delta = b"SVN\x02".to_vec();
        delta.extend(window((0, 0), text.len(), &ins_section, &new_section));
        assert_eq!(apply(b"", &[&delta]).unwrap(), text);
    }

    #[test]
    fn malformed_streams_are_rejected() {
        assert!(matches!(apply(b"", &[b"XYZ\0"]), Err(SvnError::Protocol(_))));
        assert!(matches!(apply(b"", &[b"SVN\x07"]), Err(SvnError::Protocol(_))));
        assert!(matches!(apply(b"", &[b"SV"]), Err(SvnError::Protocol(_))));

        let mut truncated = b"SVN\0".to_vec();
        truncated.extend(&window((0, 0), 3, &[0x80 | 3], b"abc")[..5]);
        assert!(matches!(apply(b"", &[&truncated]), Err(SvnError::Protocol(_))));

        let mut outside = b"SVN\0".to_vec();
        outside.extend(window((2, 4), 4, &[4, 0], b""));
        assert!(matches!(apply(b"abc", &[&outside]), Err(SvnError::Protocol(_))));
    }

    #[test]
    fn async_apply_writes_result() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let mut delta = b"SVN\0".to_vec();
        delta.extend(window((1, 3), 3, &[3, 0], b""));
        let mut out = Vec::new();
        rt.block_on(apply_delta(b"xabc", [delta], &mut out)).unwrap();
        assert_eq!(out, b"abc");
    }
}
