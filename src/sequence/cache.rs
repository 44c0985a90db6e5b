use std::borrow::Cow;
use std::cell::RefCell;
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use super::DiffOptions;
use super::line::{Line, line_hash, normalize, read_lines, terminator_len};
use crate::SvnError;

/// Size of one index record: offset (8), length (4), hash (4).
const INDEX_ENTRY_SIZE: usize = 16;

/// A byte source that can be split into lines.
pub trait LineSource {
    /// Total length of the source in bytes.
    fn byte_len(&self) -> io::Result<u64>;

    /// Opens a fresh reader positioned at the first byte.
    fn open(&self) -> io::Result<Box<dyn Read + '_>>;
}

impl LineSource for [u8] {
    fn byte_len(&self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(self))
    }
}

impl<const N: usize> LineSource for [u8; N] {
    fn byte_len(&self) -> io::Result<u64> {
        Ok(N as u64)
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(&self[..]))
    }
}

impl LineSource for Vec<u8> {
    fn byte_len(&self) -> io::Result<u64> {
        self.as_slice().byte_len()
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(self.as_slice()))
    }
}

impl LineSource for str {
    fn byte_len(&self) -> io::Result<u64> {
        self.as_bytes().byte_len()
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(self.as_bytes()))
    }
}

impl LineSource for Path {
    fn byte_len(&self) -> io::Result<u64> {
        Ok(std::fs::metadata(self)?.len())
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(File::open(self)?))
    }
}

impl LineSource for PathBuf {
    fn byte_len(&self) -> io::Result<u64> {
        self.as_path().byte_len()
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        self.as_path().open()
    }
}

/// Random access to the lines of one source.
///
/// Memory and file backed caches behave identically: the same input yields
/// the same line boundaries, content and hashes.
pub trait LineCache: Send {
    /// Number of lines.
    fn line_count(&self) -> usize;

    /// Returns line `index`, or a sequence error if it is out of range.
    fn line(&self, index: usize) -> Result<Line<'_>, SvnError>;

    /// Returns the hash of line `index`. `0` means "unknown".
    fn line_hash(&self, index: usize) -> Result<u32, SvnError>;
}

fn out_of_range(index: usize, count: usize) -> SvnError {
    SvnError::Sequence(format!("line index {index} out of range ({count} lines)"))
}

/// Reads `source` into the cache backing selected by `options`.
///
/// Sources up to `options.memory_threshold` bytes are held in memory; larger
/// ones spill into a private temporary directory.
pub fn read_cache<S>(source: &S, options: &DiffOptions) -> Result<Box<dyn LineCache>, SvnError>
where
    S: LineSource + ?Sized,
{
    let len = source.byte_len().map_err(SvnError::sequence_io)?;
    let eol = options.custom_eol.as_deref();
    if len <= options.memory_threshold {
        debug!(len, backing = "memory", "reading line cache");
        Ok(Box::new(MemoryLineCache::read(source, eol)?))
    } else {
        debug!(len, backing = "file", "reading line cache");
        Ok(Box::new(FileLineCache::read(
            source,
            eol,
            options.segment_size,
            options.memory_threshold,
        )?))
    }
}

#[derive(Clone, Copy, Debug)]
struct Descriptor {
    start: usize,
    len: usize,
    offset: u64,
    hash: u32,
}

/// A line cache backed by one growable buffer.
#[derive(Debug, Default)]
pub struct MemoryLineCache {
    data: Vec<u8>,
    lines: Vec<Descriptor>,
}

impl MemoryLineCache {
    /// Reads every line of `source`, rewriting terminators to `custom_eol`
    /// when given.
    pub fn read<S>(source: &S, custom_eol: Option<&[u8]>) -> Result<Self, SvnError>
    where
        S: LineSource + ?Sized,
    {
        let mut cache = Self::default();
        let reader = source.open().map_err(SvnError::sequence_io)?;
        read_lines(reader, custom_eol, |raw, _, stored| {
            cache.lines.push(Descriptor {
                start: cache.data.len(),
                len: stored.len(),
                offset: raw.offset,
                hash: line_hash(stored),
            });
            cache.data.extend_from_slice(stored);
            Ok(())
        })
        .map_err(SvnError::sequence_io)?;
        Ok(cache)
    }

    fn descriptor(&self, index: usize) -> Result<&Descriptor, SvnError> {
        self.lines
            .get(index)
            .ok_or_else(|| out_of_range(index, self.lines.len()))
    }
}

impl LineCache for MemoryLineCache {
    fn line_count(&self) -> usize {
        self.lines.len()
    }

    fn line(&self, index: usize) -> Result<Line<'_>, SvnError> {
        let d = self.descriptor(index)?;
        Ok(Line::with_hash(
            d.offset,
            Cow::Borrowed(&self.data[d.start..d.start + d.len]),
            d.hash,
        ))
    }

    fn line_hash(&self, index: usize) -> Result<u32, SvnError> {
        Ok(self.descriptor(index)?.hash)
    }
}

enum Index {
    Memory(Vec<u8>),
    Disk(RefCell<File>),
}

struct IndexWriter {
    memory: Vec<u8>,
    spill: Option<BufWriter<File>>,
    path: PathBuf,
    threshold: u64,
}

impl IndexWriter {
    fn push(&mut self, offset: u64, len: u32, hash: u32) -> io::Result<()> {
        let mut entry = [0u8; INDEX_ENTRY_SIZE];
        entry[..8].copy_from_slice(&offset.to_be_bytes());
        entry[8..12].copy_from_slice(&len.to_be_bytes());
        entry[12..].copy_from_slice(&hash.to_be_bytes());
        if let Some(spill) = self.spill.as_mut() {
            return spill.write_all(&entry);
        }
        self.memory.extend_from_slice(&entry);
        if self.memory.len() as u64 > self.threshold {
            let mut spill = BufWriter::new(File::create(&self.path)?);
            spill.write_all(&self.memory)?;
            self.memory = Vec::new();
            self.spill = Some(spill);
        }
        Ok(())
    }

    fn finish(self) -> io::Result<Index> {
        match self.spill {
            Some(mut spill) => {
                spill.flush()?;
                drop(spill);
                Ok(Index::Disk(RefCell::new(File::open(&self.path)?)))
            }
            None => Ok(Index::Memory(self.memory)),
        }
    }
}

struct SegmentWriter<'a> {
    dir: &'a Path,
    segment_size: usize,
    current: Option<BufWriter<File>>,
    written: usize,
    next_segment: u64,
}

impl SegmentWriter<'_> {
    fn write(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            if self.current.is_none() || self.written == self.segment_size {
                if let Some(mut done) = self.current.take() {
                    done.flush()?;
                }
                let path = segment_path(self.dir, self.next_segment);
                self.current = Some(BufWriter::new(File::create(path)?));
                self.next_segment += 1;
                self.written = 0;
            }
            let n = bytes.len().min(self.segment_size - self.written);
            if let Some(current) = self.current.as_mut() {
                current.write_all(&bytes[..n])?;
            }
            self.written += n;
            bytes = &bytes[n..];
        }
        Ok(())
    }

    fn finish(mut self) -> io::Result<()> {
        match self.current.take() {
            Some(mut current) => current.flush(),
            None => Ok(()),
        }
    }
}

fn segment_path(dir: &Path, segment: u64) -> PathBuf {
    dir.join(format!("segment-{segment:06}"))
}

/// A line cache that keeps content in fixed-size segment files.
///
/// The raw source bytes are split across segment files in a private
/// temporary directory; a 16-byte index record per line points into them.
/// The index itself moves to disk once it outgrows the memory threshold.
/// The directory and everything in it are removed when the cache is dropped.
pub struct FileLineCache {
    dir: TempDir,
    segment_size: usize,
    custom_eol: Option<Vec<u8>>,
    index: Index,
    count: usize,
    open_segment: RefCell<Option<(u64, File)>>,
}

impl FileLineCache {
    /// Reads `source` into segment files of `segment_size` bytes.
    pub fn read<S>(
        source: &S,
        custom_eol: Option<&[u8]>,
        segment_size: usize,
        index_threshold: u64,
    ) -> Result<Self, SvnError>
    where
        S: LineSource + ?Sized,
    {
        if segment_size == 0 {
            return Err(SvnError::Sequence(
                "segment size must be positive".to_string(),
            ));
        }
        let dir = tempfile::Builder::new()
            .prefix("svn-core-lines.")
            .tempdir()
            .map_err(SvnError::sequence_io)?;
        let mut segments = SegmentWriter {
            dir: dir.path(),
            segment_size,
            current: None,
            written: 0,
            next_segment: 0,
        };
        let mut index = IndexWriter {
            memory: Vec::new(),
            spill: None,
            path: dir.path().join("index"),
            threshold: index_threshold,
        };
        let mut count = 0usize;
        let reader = source.open().map_err(SvnError::sequence_io)?;
        read_lines(reader, custom_eol, |raw, bytes, stored| {
            let len = u32::try_from(bytes.len())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "line too long"))?;
            segments.write(bytes)?;
            index.push(raw.offset, len, line_hash(stored))?;
            count += 1;
            Ok(())
        })
        .map_err(SvnError::sequence_io)?;
        segments.finish().map_err(SvnError::sequence_io)?;
        let index = index.finish().map_err(SvnError::sequence_io)?;
        debug!(
            lines = count,
            dir = %dir.path().display(),
            on_disk = matches!(index, Index::Disk(_)),
            "file line cache ready"
        );

        Ok(Self {
            dir,
            segment_size,
            custom_eol: custom_eol.map(<[u8]>::to_vec),
            index,
            count,
            open_segment: RefCell::new(None),
        })
    }

    /// Directory holding the segment files.
    pub fn directory(&self) -> &Path {
        self.dir.path()
    }

    fn entry(&self, index: usize) -> Result<(u64, usize, u32), SvnError> {
        if index >= self.count {
            return Err(out_of_range(index, self.count));
        }
        let mut entry = [0u8; INDEX_ENTRY_SIZE];
        let at = index * INDEX_ENTRY_SIZE;
        match &self.index {
            Index::Memory(bytes) => entry.copy_from_slice(&bytes[at..at + INDEX_ENTRY_SIZE]),
            Index::Disk(file) => {
                let mut file = file.borrow_mut();
                file.seek(SeekFrom::Start(at as u64))
                    .and_then(|_| file.read_exact(&mut entry))
                    .map_err(SvnError::sequence_io)?;
            }
        }
        let mut offset = [0u8; 8];
        let mut len = [0u8; 4];
        let mut hash = [0u8; 4];
        offset.copy_from_slice(&entry[..8]);
        len.copy_from_slice(&entry[8..12]);
        hash.copy_from_slice(&entry[12..]);
        Ok((
            u64::from_be_bytes(offset),
            u32::from_be_bytes(len) as usize,
            u32::from_be_bytes(hash),
        ))
    }

    fn read_raw(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let segment_size = self.segment_size as u64;
        let mut out = vec![0u8; len];
        let mut filled = 0usize;
        let mut open = self.open_segment.borrow_mut();
        while filled < len {
            let pos = offset + filled as u64;
            let segment = pos / segment_size;
            let within = pos % segment_size;
            let n = (len - filled).min((segment_size - within) as usize);
            let reuse = matches!(open.as_ref(), Some((current, _)) if *current == segment);
            if !reuse {
                *open = Some((segment, File::open(segment_path(self.dir.path(), segment))?));
            }
            if let Some((_, file)) = open.as_mut() {
                file.seek(SeekFrom::Start(within))?;
                file.read_exact(&mut out[filled..filled + n])?;
            }
            filled += n;
        }
        Ok(out)
    }
}

impl std::fmt::Debug for FileLineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLineCache")
            .field("dir", &self.dir.path())
            .field("lines", &self.count)
            .finish()
    }
}

impl LineCache for FileLineCache {
    fn line_count(&self) -> usize {
        self.count
    }

    fn line(&self, index: usize) -> Result<Line<'_>, SvnError> {
        let (offset, len, hash) = self.entry(index)?;
        let raw = self.read_raw(offset, len).map_err(SvnError::sequence_io)?;
        let eol_len = terminator_len(&raw);
        let stored = match self.custom_eol.as_deref() {
            Some(eol) if eol_len > 0 => normalize(&raw, eol_len, Some(eol)).into_owned(),
            _ => raw,
        };
        Ok(Line::with_hash(offset, Cow::Owned(stored), hash))
    }

    fn line_hash(&self, index: usize) -> Result<u32, SvnError> {
        Ok(self.entry(index)?.2)
    }
}
