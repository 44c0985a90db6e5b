//! Line diff engine.
//!
//! Sources are split into lines by a [`LineCache`], compared through a
//! [`Media`], searched by [`Difference`] and refined by [`shift_blocks`].
//! Small inputs go through the class-id and discarding decorators; inputs
//! above the memory threshold are compared line by line through their file
//! backed caches.

mod cache;
mod difference;
mod line;
mod media;
mod shift;
pub mod unified;

use tracing::debug;

use crate::SvnError;
use crate::cancel::{Canceller, Event, EventSink, NeverCancel, NoEvents};

pub use cache::{FileLineCache, LineCache, LineSource, MemoryLineCache, read_cache};
pub use difference::{Difference, Run, search_depth, translate_runs};
pub use line::Line;
pub use media::{
    CONFUSION_MULTIPLICITY, CachingMedia, CountingMedia, DiscardingMedia, HashedMedia,
    IdentityTransformer, IndexTransformer, LineMedia, Media,
};
pub use shift::shift_blocks;

/// Sources up to this many bytes are cached in memory.
pub const MEMORY_THRESHOLD: u64 = 1024 * 1024;
/// Segment file size of file-backed caches.
pub const SEGMENT_SIZE: usize = 16 * 1024;

/// Whether a block is a run of equal lines or a change.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// Lines equal on both sides.
    Equal,
    /// Lines removed from the left and/or added on the right.
    Changed,
}

/// A run of equal or changed lines.
///
/// A block list covers both sides contiguously and always ends with a
/// zero-length equal block at `(left_len, right_len)`.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DiffBlock {
    /// Block kind.
    pub kind: BlockKind,
    /// First left line.
    pub left_start: usize,
    /// Number of left lines.
    pub left_len: usize,
    /// First right line.
    pub right_start: usize,
    /// Number of right lines.
    pub right_len: usize,
}

impl DiffBlock {
    /// An equal block of `len` lines on both sides.
    pub fn equal(left_start: usize, right_start: usize, len: usize) -> Self {
        Self {
            kind: BlockKind::Equal,
            left_start,
            left_len: len,
            right_start,
            right_len: len,
        }
    }

    /// A changed block.
    pub fn changed(left_start: usize, left_len: usize, right_start: usize, right_len: usize) -> Self {
        Self {
            kind: BlockKind::Changed,
            left_start,
            left_len,
            right_start,
            right_len,
        }
    }

    /// Returns `true` for [`BlockKind::Equal`].
    pub fn is_equal(&self) -> bool {
        self.kind == BlockKind::Equal
    }

    /// One past the last left line.
    pub fn left_end(&self) -> usize {
        self.left_start + self.left_len
    }

    /// One past the last right line.
    pub fn right_end(&self) -> usize {
        self.right_start + self.right_len
    }
}

/// Line splitting and diff search settings.
#[derive(Clone, Debug, PartialEq)]
pub struct DiffOptions {
    /// Terminator written in place of every `\n`, `\r` or `\r\n`.
    pub custom_eol: Option<Vec<u8>>,
    /// Search-depth exponent in `[0, 1]`; `1.0` is unbounded.
    pub search_depth: f64,
    /// Largest source size kept in memory.
    pub memory_threshold: u64,
    /// Segment size of file-backed caches.
    pub segment_size: usize,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            custom_eol: None,
            search_depth: 1.0,
            memory_threshold: MEMORY_THRESHOLD,
            segment_size: SEGMENT_SIZE,
        }
    }
}

impl DiffOptions {
    /// Rewrites every terminator to `eol`.
    #[must_use]
    pub fn with_custom_eol(mut self, eol: impl Into<Vec<u8>>) -> Self {
        self.custom_eol = Some(eol.into());
        self
    }

    /// Sets the search-depth exponent.
    #[must_use]
    pub fn with_search_depth(mut self, exponent: f64) -> Self {
        self.search_depth = exponent;
        self
    }

    /// Sets the memory threshold.
    #[must_use]
    pub fn with_memory_threshold(mut self, bytes: u64) -> Self {
        self.memory_threshold = bytes;
        self
    }

    /// Sets the file-backed segment size.
    #[must_use]
    pub fn with_segment_size(mut self, bytes: usize) -> Self {
        self.segment_size = bytes;
        self
    }
}

/// The result of diffing two sources.
pub struct LineDiff {
    blocks: Vec<DiffBlock>,
    left: Box<dyn LineCache>,
    right: Box<dyn LineCache>,
}

impl LineDiff {
    /// All blocks, equal and changed.
    pub fn blocks(&self) -> &[DiffBlock] {
        &self.blocks
    }

    /// Changed blocks only.
    pub fn changes(&self) -> impl Iterator<Item = &DiffBlock> + '_ {
        self.blocks.iter().filter(|b| !b.is_equal())
    }

    /// Returns `true` if the sources have identical lines.
    pub fn is_unchanged(&self) -> bool {
        self.changes().next().is_none()
    }

    /// Lines of the left source.
    pub fn left(&self) -> &dyn LineCache {
        self.left.as_ref()
    }

    /// Lines of the right source.
    pub fn right(&self) -> &dyn LineCache {
        self.right.as_ref()
    }
}

impl std::fmt::Debug for LineDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineDiff")
            .field("blocks", &self.blocks)
            .field("left_lines", &self.left.line_count())
            .field("right_lines", &self.right.line_count())
            .finish()
    }
}

/// Diffs two sources with the default search depth.
///
/// # Examples
///
/// ```
/// use svn_core::sequence::{DiffOptions, diff};
///
/// let result = diff(b"a\nb\nc\n", b"a\nc\n", &DiffOptions::default()).unwrap();
/// let changes: Vec<_> = result.changes().collect();
/// assert_eq!(changes.len(), 1);
/// assert_eq!((changes[0].left_start, changes[0].left_len), (1, 1));
/// ```
pub fn diff<L, R>(left: &L, right: &R, options: &DiffOptions) -> Result<LineDiff, SvnError>
where
    L: LineSource + ?Sized,
    R: LineSource + ?Sized,
{
    diff_with(left, right, options, &NeverCancel, &NoEvents)
}

/// Diffs two sources, polling `canceller` and reporting blocks to `events`.
pub fn diff_with<L, R>(
    left: &L,
    right: &R,
    options: &DiffOptions,
    canceller: &dyn Canceller,
    events: &dyn EventSink,
) -> Result<LineDiff, SvnError>
where
    L: LineSource + ?Sized,
    R: LineSource + ?Sized,
{
    canceller.check()?;
    let left_bytes = left.byte_len().map_err(SvnError::sequence_io)?;
    let right_bytes = right.byte_len().map_err(SvnError::sequence_io)?;
    let in_memory =
        left_bytes <= options.memory_threshold && right_bytes <= options.memory_threshold;

    let left_cache = read_cache(left, options)?;
    let right_cache = read_cache(right, options)?;
    let blocks = if in_memory {
        diff_caches(left_cache.as_ref(), right_cache.as_ref(), options.search_depth, canceller)?
    } else {
        diff_caches_direct(left_cache.as_ref(), right_cache.as_ref(), options.search_depth, canceller)?
    };
    for block in &blocks {
        events.on_event(&Event::DiffBlock(*block));
    }
    Ok(LineDiff {
        blocks,
        left: left_cache,
        right: right_cache,
    })
}

/// Diffs two caches through the class-id and discarding decorators.
pub fn diff_caches(
    left: &dyn LineCache,
    right: &dyn LineCache,
    search_depth_exponent: f64,
    canceller: &dyn Canceller,
) -> Result<Vec<DiffBlock>, SvnError> {
    let (left_len, right_len) = (left.line_count(), right.line_count());
    let budget = search_depth(search_depth_exponent, left_len, right_len)?;
    let mut lines = LineMedia::new(left, right);
    let mut classes = CachingMedia::new(&mut lines, canceller)?;
    let runs = {
        let mut reduced = DiscardingMedia::new(&classes);
        let runs = Difference::new(&mut reduced, budget, canceller).runs()?;
        translate_runs(&runs, &reduced)
    };
    let blocks = blocks_from_runs(&runs, left_len, right_len);
    let blocks = shift_blocks(&mut classes, &blocks)?;
    debug!(left_len, right_len, blocks = blocks.len(), "diff complete");
    Ok(blocks)
}

/// Diffs two caches comparing lines directly.
///
/// Used for sources too large to classify up front.
pub fn diff_caches_direct(
    left: &dyn LineCache,
    right: &dyn LineCache,
    search_depth_exponent: f64,
    canceller: &dyn Canceller,
) -> Result<Vec<DiffBlock>, SvnError> {
    let (left_len, right_len) = (left.line_count(), right.line_count());
    let budget = search_depth(search_depth_exponent, left_len, right_len)?;
    let mut lines = LineMedia::new(left, right);
    let runs = Difference::new(&mut lines, budget, canceller).runs()?;
    let runs = translate_runs(&runs, &IdentityTransformer);
    let blocks = blocks_from_runs(&runs, left_len, right_len);
    let blocks = shift_blocks(&mut lines, &blocks)?;
    debug!(left_len, right_len, blocks = blocks.len(), "direct diff complete");
    Ok(blocks)
}

/// Builds the block list for ordered, non-overlapping runs of equal lines.
pub fn blocks_from_runs(runs: &[Run], left_len: usize, right_len: usize) -> Vec<DiffBlock> {
    let mut changes = Vec::new();
    let (mut left, mut right) = (0, 0);
    for run in runs.iter().filter(|run| run.len > 0) {
        if run.left > left || run.right > right {
            changes.push(DiffBlock::changed(left, run.left - left, right, run.right - right));
        }
        left = run.left + run.len;
        right = run.right + run.len;
    }
    if left < left_len || right < right_len {
        changes.push(DiffBlock::changed(left, left_len - left, right, right_len - right));
    }
    blocks_from_changes(&changes, left_len, right_len)
}

/// Fills the gaps between ordered changed blocks with equal blocks.
pub(crate) fn blocks_from_changes(
    changes: &[DiffBlock],
    left_len: usize,
    right_len: usize,
) -> Vec<DiffBlock> {
    let mut blocks = Vec::with_capacity(changes.len() * 2 + 2);
    let (mut left, mut right) = (0, 0);
    for change in changes {
        let gap = change.left_start - left;
        if gap > 0 {
            blocks.push(DiffBlock::equal(left, right, gap));
        }
        blocks.push(*change);
        left = change.left_end();
        right = change.right_end();
    }
    if left < left_len {
        blocks.push(DiffBlock::equal(left, right, left_len - left));
    }
    blocks.push(DiffBlock::equal(left_len, right_len, 0));
    blocks
}
