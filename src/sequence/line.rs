use std::borrow::Cow;
use std::cell::OnceCell;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};

/// One logical line of a text source.
///
/// `bytes` holds the stored content: the original bytes including the
/// terminator, or the terminator rewritten when a custom EOL is configured.
#[derive(Clone)]
pub struct Line<'a> {
    offset: u64,
    bytes: Cow<'a, [u8]>,
    hash: OnceCell<u32>,
}

impl<'a> Line<'a> {
    pub(crate) fn new(offset: u64, bytes: Cow<'a, [u8]>) -> Self {
        Self {
            offset,
            bytes,
            hash: OnceCell::new(),
        }
    }

    pub(crate) fn with_hash(offset: u64, bytes: Cow<'a, [u8]>, hash: u32) -> Self {
        let line = Self::new(offset, bytes);
        let _ = line.hash.set(hash);
        line
    }

    /// Byte offset of the line in the original source.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Stored line content.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the line content, detaching it from the cache.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes.into_owned()
    }

    /// Hash of the stored content, computed on first use.
    pub fn hash(&self) -> u32 {
        *self.hash.get_or_init(|| line_hash(&self.bytes))
    }

    /// Returns `true` if the content ends with `\n` or `\r`.
    pub fn has_terminator(&self) -> bool {
        matches!(self.bytes.last(), Some(b'\n' | b'\r'))
    }
}

impl fmt::Debug for Line<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Line")
            .field("offset", &self.offset)
            .field("bytes", &String::from_utf8_lossy(&self.bytes))
            .finish()
    }
}

impl PartialEq for Line<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset && self.bytes == other.bytes
    }
}

impl Eq for Line<'_> {}

/// Polynomial hash over the stored line bytes.
///
/// A result of `0` is indistinguishable from "unknown"; callers compare
/// bytes whenever either side reports `0`.
pub(crate) fn line_hash(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |h, &b| h.wrapping_mul(31).wrapping_add(u32::from(b)))
}

/// Returns `true` unless both hashes are known and differ, in which case the
/// byte comparison is skipped.
pub(crate) fn may_be_equal(left_hash: u32, right_hash: u32) -> bool {
    left_hash == 0 || right_hash == 0 || left_hash == right_hash
}

/// A raw line as read from the source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RawLine {
    /// Offset of the first byte in the source.
    pub(crate) offset: u64,
    /// Length of the terminator at the end of the raw bytes (0, 1 or 2).
    pub(crate) eol_len: usize,
}

/// Splits a byte stream on `\n`, `\r` and `\r\n`.
pub(crate) struct LineReader<R> {
    inner: BufReader<R>,
    offset: u64,
    last_eol_len: Option<usize>,
}

impl<R: Read> LineReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            offset: 0,
            last_eol_len: None,
        }
    }

    /// Reads the next line into `out` (cleared first), terminator included.
    pub(crate) fn next_line(&mut self, out: &mut Vec<u8>) -> io::Result<Option<RawLine>> {
        out.clear();
        loop {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                break;
            }
            match buf.iter().position(|&b| b == b'\n' || b == b'\r') {
                Some(pos) => {
                    let terminator = buf[pos];
                    out.extend_from_slice(&buf[..=pos]);
                    self.inner.consume(pos + 1);
                    let mut eol_len = 1;
                    if terminator == b'\r' {
                        let next = self.inner.fill_buf()?;
                        if next.first() == Some(&b'\n') {
                            out.push(b'\n');
                            self.inner.consume(1);
                            eol_len = 2;
                        }
                    }
                    return Ok(Some(self.finish(out, eol_len)));
                }
                None => {
                    let len = buf.len();
                    out.extend_from_slice(buf);
                    self.inner.consume(len);
                }
            }
        }
        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.finish(out, 0)))
        }
    }

    fn finish(&mut self, out: &[u8], eol_len: usize) -> RawLine {
        let line = RawLine {
            offset: self.offset,
            eol_len,
        };
        self.offset += out.len() as u64;
        self.last_eol_len = Some(eol_len);
        line
    }

    /// Total number of bytes consumed so far.
    pub(crate) fn position(&self) -> u64 {
        self.offset
    }

    /// Returns `true` if the stream ended right after a terminator.
    pub(crate) fn ended_with_terminator(&self) -> bool {
        matches!(self.last_eol_len, Some(len) if len > 0)
    }
}

/// Rewrites the terminator of `raw` to `custom_eol`, if one is configured.
pub(crate) fn normalize<'a>(raw: &'a [u8], eol_len: usize, custom_eol: Option<&[u8]>) -> Cow<'a, [u8]> {
    match custom_eol {
        Some(eol) if eol_len > 0 => {
            let mut bytes = Vec::with_capacity(raw.len() - eol_len + eol.len());
            bytes.extend_from_slice(&raw[..raw.len() - eol_len]);
            bytes.extend_from_slice(eol);
            Cow::Owned(bytes)
        }
        _ => Cow::Borrowed(raw),
    }
}

/// Returns the terminator length at the end of `raw`.
pub(crate) fn terminator_len(raw: &[u8]) -> usize {
    if raw.ends_with(b"\r\n") {
        2
    } else if matches!(raw.last(), Some(b'\n' | b'\r')) {
        1
    } else {
        0
    }
}

/// Reads every line of `source`, calling `sink` with the raw descriptor, the
/// raw bytes and the stored (normalized) bytes.
///
/// With a custom EOL, a source that ends in a terminator gets an explicit
/// empty trailing line at the end offset.
pub(crate) fn read_lines<R, F>(source: R, custom_eol: Option<&[u8]>, mut sink: F) -> io::Result<u64>
where
    R: Read,
    F: FnMut(RawLine, &[u8], &[u8]) -> io::Result<()>,
{
    let mut reader = LineReader::new(source);
    let mut buf = Vec::new();
    while let Some(raw) = reader.next_line(&mut buf)? {
        let stored = normalize(&buf, raw.eol_len, custom_eol);
        sink(raw, &buf, &stored)?;
    }
    let end = reader.position();
    if custom_eol.is_some() && reader.ended_with_terminator() {
        sink(
            RawLine {
                offset: end,
                eol_len: 0,
            },
            &[],
            &[],
        )?;
    }
    Ok(end)
}
