//! Comparison surfaces for the diff engine.
//!
//! A [`Media`] pairs a left and a right sequence and answers equality
//! questions about their elements. Decorators wrap a base media:
//! [`CachingMedia`] reduces every line to an equivalence class id once, and
//! [`DiscardingMedia`] hides lines that cannot take part in a useful match.

use std::collections::HashMap;

use tracing::debug;

use super::cache::LineCache;
use super::line::may_be_equal;
use crate::SvnError;
use crate::cancel::Canceller;

/// Base multiplicity above which a line is considered confusing.
///
/// The effective cutoff doubles for every factor of four in the length of the
/// other side beyond 64 lines.
pub const CONFUSION_MULTIPLICITY: usize = 5;

/// Two indexable sequences and equality over their elements.
pub trait Media {
    /// Number of elements on the left.
    fn left_len(&self) -> usize;

    /// Number of elements on the right.
    fn right_len(&self) -> usize;

    /// `left[left] == right[right]`.
    fn equals(&mut self, left: usize, right: usize) -> Result<bool, SvnError>;

    /// `left[a] == left[b]`.
    fn equals_left(&mut self, a: usize, b: usize) -> Result<bool, SvnError>;

    /// `right[a] == right[b]`.
    fn equals_right(&mut self, a: usize, b: usize) -> Result<bool, SvnError>;
}

/// A [`Media`] that can also hash its elements.
pub trait HashedMedia: Media {
    /// Hash of `left[index]`, `0` if unknown.
    fn left_hash(&mut self, index: usize) -> Result<u32, SvnError>;

    /// Hash of `right[index]`, `0` if unknown.
    fn right_hash(&mut self, index: usize) -> Result<u32, SvnError>;
}

/// Maps indices of a reduced media back to the original sequences.
pub trait IndexTransformer {
    /// Original left index of reduced left index `index`.
    fn left_original(&self, index: usize) -> usize;

    /// Original right index of reduced right index `index`.
    fn right_original(&self, index: usize) -> usize;
}

/// The identity mapping, for media that are not reduced.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityTransformer;

impl IndexTransformer for IdentityTransformer {
    fn left_original(&self, index: usize) -> usize {
        index
    }

    fn right_original(&self, index: usize) -> usize {
        index
    }
}

/// Compares lines of two [`LineCache`]s.
pub struct LineMedia<'c> {
    left: &'c dyn LineCache,
    right: &'c dyn LineCache,
}

impl<'c> LineMedia<'c> {
    /// Creates a media over two caches.
    pub fn new(left: &'c dyn LineCache, right: &'c dyn LineCache) -> Self {
        Self { left, right }
    }
}

fn lines_equal(
    a: &dyn LineCache,
    i: usize,
    b: &dyn LineCache,
    j: usize,
) -> Result<bool, SvnError> {
    if !may_be_equal(a.line_hash(i)?, b.line_hash(j)?) {
        return Ok(false);
    }
    Ok(a.line(i)?.bytes() == b.line(j)?.bytes())
}

impl Media for LineMedia<'_> {
    fn left_len(&self) -> usize {
        self.left.line_count()
    }

    fn right_len(&self) -> usize {
        self.right.line_count()
    }

    fn equals(&mut self, left: usize, right: usize) -> Result<bool, SvnError> {
        lines_equal(self.left, left, self.right, right)
    }

    fn equals_left(&mut self, a: usize, b: usize) -> Result<bool, SvnError> {
        lines_equal(self.left, a, self.left, b)
    }

    fn equals_right(&mut self, a: usize, b: usize) -> Result<bool, SvnError> {
        lines_equal(self.right, a, self.right, b)
    }
}

impl HashedMedia for LineMedia<'_> {
    fn left_hash(&mut self, index: usize) -> Result<u32, SvnError> {
        self.left.line_hash(index)
    }

    fn right_hash(&mut self, index: usize) -> Result<u32, SvnError> {
        self.right.line_hash(index)
    }
}

#[derive(Clone, Copy)]
enum Side {
    Left,
    Right,
}

/// Reduces both sides to equivalence class ids.
///
/// Each line is compared against the representatives that share its hash,
/// once. Afterwards every equality question is an integer comparison.
#[derive(Clone, Debug)]
pub struct CachingMedia {
    left: Vec<u32>,
    right: Vec<u32>,
    classes: usize,
}

impl CachingMedia {
    /// Classifies every element of `media`.
    pub fn new<M>(media: &mut M, canceller: &dyn Canceller) -> Result<Self, SvnError>
    where
        M: HashedMedia + ?Sized,
    {
        let mut buckets: HashMap<u32, Vec<(Side, usize, u32)>> = HashMap::new();
        let mut next_class = 0u32;
        let mut left = Vec::with_capacity(media.left_len());
        let mut right = Vec::with_capacity(media.right_len());

        for side in [Side::Left, Side::Right] {
            canceller.check()?;
            let len = match side {
                Side::Left => media.left_len(),
                Side::Right => media.right_len(),
            };
            for index in 0..len {
                let hash = match side {
                    Side::Left => media.left_hash(index)?,
                    Side::Right => media.right_hash(index)?,
                };
                let candidates = buckets.entry(hash).or_default();
                let mut class = None;
                for &(rep_side, rep, rep_class) in candidates.iter() {
                    let same = match (rep_side, side) {
                        (Side::Left, Side::Left) => media.equals_left(rep, index)?,
                        (Side::Left, Side::Right) => media.equals(rep, index)?,
                        (Side::Right, Side::Right) => media.equals_right(rep, index)?,
                        (Side::Right, Side::Left) => media.equals(index, rep)?,
                    };
                    if same {
                        class = Some(rep_class);
                        break;
                    }
                }
                let class = match class {
                    Some(class) => class,
                    None => {
                        let class = next_class;
                        next_class += 1;
                        candidates.push((side, index, class));
                        class
                    }
                };
                match side {
                    Side::Left => left.push(class),
                    Side::Right => right.push(class),
                }
            }
        }

        Ok(Self {
            left,
            right,
            classes: next_class as usize,
        })
    }

    /// Builds a media directly from class ids.
    pub fn from_classes(left: Vec<u32>, right: Vec<u32>) -> Self {
        let classes = left
            .iter()
            .chain(right.iter())
            .map(|&c| c as usize + 1)
            .max()
            .unwrap_or(0);
        Self {
            left,
            right,
            classes,
        }
    }

    /// Number of distinct classes over both sides.
    pub fn class_count(&self) -> usize {
        self.classes
    }

    /// Class ids of the left side.
    pub fn left_classes(&self) -> &[u32] {
        &self.left
    }

    /// Class ids of the right side.
    pub fn right_classes(&self) -> &[u32] {
        &self.right
    }
}

impl Media for CachingMedia {
    fn left_len(&self) -> usize {
        self.left.len()
    }

    fn right_len(&self) -> usize {
        self.right.len()
    }

    fn equals(&mut self, left: usize, right: usize) -> Result<bool, SvnError> {
        Ok(self.left[left] == self.right[right])
    }

    fn equals_left(&mut self, a: usize, b: usize) -> Result<bool, SvnError> {
        Ok(self.left[a] == self.left[b])
    }

    fn equals_right(&mut self, a: usize, b: usize) -> Result<bool, SvnError> {
        Ok(self.right[a] == self.right[b])
    }
}

const KEEP: u8 = 0;
const DISCARD: u8 = 1;
const PROVISIONAL: u8 = 2;

fn confusion_cutoff(other_len: usize) -> usize {
    let mut many = CONFUSION_MULTIPLICITY;
    let mut tem = other_len / 64;
    loop {
        tem >>= 2;
        if tem == 0 {
            break;
        }
        many *= 2;
    }
    many
}

fn kept_indices(own: &[u32], other: &[u32], classes: usize) -> Vec<usize> {
    let mut counts = vec![0usize; classes];
    for &class in other {
        counts[class as usize] += 1;
    }
    let many = confusion_cutoff(other.len());
    let marks: Vec<u8> = own
        .iter()
        .map(|&class| match counts[class as usize] {
            0 => DISCARD,
            n if n > many => PROVISIONAL,
            _ => KEEP,
        })
        .collect();

    let mut kept = Vec::with_capacity(own.len());
    let mut i = 0;
    while i < marks.len() {
        match marks[i] {
            KEEP => {
                kept.push(i);
                i += 1;
            }
            DISCARD => i += 1,
            _ => {
                let start = i;
                while i < marks.len() && marks[i] == PROVISIONAL {
                    i += 1;
                }
                let before = start > 0 && marks[start - 1] == DISCARD;
                let after = i < marks.len() && marks[i] == DISCARD;
                if !(before && after) {
                    kept.extend(start..i);
                }
            }
        }
    }
    kept
}

/// Hides lines that cannot contribute a useful match.
///
/// Lines whose class never occurs on the other side are dropped. Lines whose
/// class occurs very often on the other side are dropped too, but only when
/// they sit between dropped lines. Indices seen by the diff engine are
/// positions in the reduced sequences; [`IndexTransformer`] maps them back.
pub struct DiscardingMedia<'a> {
    classes: &'a CachingMedia,
    left: Vec<usize>,
    right: Vec<usize>,
}

impl<'a> DiscardingMedia<'a> {
    /// Reduces both sides of `classes`.
    pub fn new(classes: &'a CachingMedia) -> Self {
        let left = kept_indices(&classes.left, &classes.right, classes.classes);
        let right = kept_indices(&classes.right, &classes.left, classes.classes);
        debug!(
            left = classes.left.len(),
            left_kept = left.len(),
            right = classes.right.len(),
            right_kept = right.len(),
            "discarded unmatched lines"
        );
        Self {
            classes,
            left,
            right,
        }
    }
}

impl Media for DiscardingMedia<'_> {
    fn left_len(&self) -> usize {
        self.left.len()
    }

    fn right_len(&self) -> usize {
        self.right.len()
    }

    fn equals(&mut self, left: usize, right: usize) -> Result<bool, SvnError> {
        Ok(self.classes.left[self.left[left]] == self.classes.right[self.right[right]])
    }

    fn equals_left(&mut self, a: usize, b: usize) -> Result<bool, SvnError> {
        Ok(self.classes.left[self.left[a]] == self.classes.left[self.left[b]])
    }

    fn equals_right(&mut self, a: usize, b: usize) -> Result<bool, SvnError> {
        Ok(self.classes.right[self.right[a]] == self.classes.right[self.right[b]])
    }
}

impl IndexTransformer for DiscardingMedia<'_> {
    fn left_original(&self, index: usize) -> usize {
        self.left[index]
    }

    fn right_original(&self, index: usize) -> usize {
        self.right[index]
    }
}

/// Counts `equals` calls made through it.
pub struct CountingMedia<M> {
    inner: M,
    comparisons: usize,
}

impl<M> CountingMedia<M> {
    /// Wraps `inner`.
    pub fn new(inner: M) -> Self {
        Self {
            inner,
            comparisons: 0,
        }
    }

    /// Number of left/right comparisons so far.
    pub fn comparisons(&self) -> usize {
        self.comparisons
    }

    /// Returns the wrapped media.
    pub fn into_inner(self) -> M {
        self.inner
    }
}

impl<M: Media> Media for CountingMedia<M> {
    fn left_len(&self) -> usize {
        self.inner.left_len()
    }

    fn right_len(&self) -> usize {
        self.inner.right_len()
    }

    fn equals(&mut self, left: usize, right: usize) -> Result<bool, SvnError> {
        self.comparisons += 1;
        self.inner.equals(left, right)
    }

    fn equals_left(&mut self, a: usize, b: usize) -> Result<bool, SvnError> {
        self.inner.equals_left(a, b)
    }

    fn equals_right(&mut self, a: usize, b: usize) -> Result<bool, SvnError> {
        self.inner.equals_right(a, b)
    }
}
