//! Three-way text merge.
//!
//! `base -> local` and `base -> latest` are diffed independently. Changes
//! are then grouped in base line space: a group touched by one side takes
//! that side's text, a group changed identically by both sides takes it once,
//! and any other group becomes a conflict framed by [`MergeMarkers`].

use std::io::Write;

use tracing::debug;

use crate::SvnError;
use crate::cancel::{Canceller, Event, EventSink, NeverCancel, NoEvents};
use crate::sequence::{DiffBlock, DiffOptions, LineCache, LineSource, diff_with};

/// Outcome of a three-way merge.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MergeStatus {
    /// Neither side changed the base.
    Unchanged,
    /// Changes were applied without conflicts.
    Merged,
    /// At least one conflict was written.
    Conflicted,
}

/// Marker lines written around conflicts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeMarkers {
    /// Opens a conflict, before the local text.
    pub start: Vec<u8>,
    /// Separates the local and the latest text.
    pub separator: Vec<u8>,
    /// Closes a conflict, after the latest text.
    pub end: Vec<u8>,
    /// Terminator written after each marker.
    pub eol: Vec<u8>,
}

impl MergeMarkers {
    /// Creates markers from raw bytes.
    pub fn new(
        start: impl Into<Vec<u8>>,
        separator: impl Into<Vec<u8>>,
        end: impl Into<Vec<u8>>,
        eol: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            start: start.into(),
            separator: separator.into(),
            end: end.into(),
            eol: eol.into(),
        }
    }
}

impl Default for MergeMarkers {
    fn default() -> Self {
        Self::new(
            b"<<<<<<< .working".to_vec(),
            b"=======".to_vec(),
            b">>>>>>> .merge-right".to_vec(),
            b"\n".to_vec(),
        )
    }
}

/// Merges texts with fixed markers and diff settings.
#[derive(Clone, Debug, Default)]
pub struct Merger {
    markers: MergeMarkers,
    options: DiffOptions,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Latest,
}

#[derive(Debug, Default)]
struct Group {
    base_start: usize,
    base_end: usize,
    local: Vec<DiffBlock>,
    latest: Vec<DiffBlock>,
}

impl Group {
    fn overlaps(&self, change: &DiffBlock) -> bool {
        let (start, end) = (change.left_start, change.left_end());
        if self.base_start == self.base_end || start == end {
            start <= self.base_end && self.base_start <= end
        } else {
            start < self.base_end && self.base_start < end
        }
    }

    fn add(&mut self, side: Side, change: DiffBlock) {
        self.base_start = self.base_start.min(change.left_start);
        self.base_end = self.base_end.max(change.left_end());
        match side {
            Side::Local => self.local.push(change),
            Side::Latest => self.latest.push(change),
        }
    }

    /// Range of side lines replacing `base_start..base_end`.
    fn side_range(&self, changes: &[DiffBlock]) -> Option<(usize, usize)> {
        let (first, last) = (changes.first()?, changes.last()?);
        Some((
            first.right_start - (first.left_start - self.base_start),
            last.right_end() + (self.base_end - last.left_end()),
        ))
    }
}

fn group_changes(local: &[DiffBlock], latest: &[DiffBlock]) -> Vec<Group> {
    let mut changes: Vec<(Side, DiffBlock)> = local
        .iter()
        .map(|c| (Side::Local, *c))
        .chain(latest.iter().map(|c| (Side::Latest, *c)))
        .collect();
    changes.sort_by_key(|(_, c)| (c.left_start, c.left_end()));

    let mut groups: Vec<Group> = Vec::new();
    for (side, change) in changes {
        if let Some(group) = groups.last_mut()
            && group.overlaps(&change)
        {
            group.add(side, change);
            continue;
        }
        let mut group = Group {
            base_start: change.left_start,
            base_end: change.left_end(),
            ..Group::default()
        };
        group.add(side, change);
        groups.push(group);
    }
    groups
}

fn collect_lines(
    cache: &dyn LineCache,
    start: usize,
    end: usize,
) -> Result<Vec<Vec<u8>>, SvnError> {
    (start..end)
        .map(|i| cache.line(i).map(|line| line.into_bytes()))
        .collect()
}

fn push_lines(out: &mut Vec<u8>, lines: &[Vec<u8>]) {
    for line in lines {
        out.extend_from_slice(line);
    }
}

fn push_variant(out: &mut Vec<u8>, lines: &[Vec<u8>], eol: &[u8]) {
    push_lines(out, lines);
    if let Some(last) = lines.last()
        && !matches!(last.last(), Some(b'\n' | b'\r'))
    {
        out.extend_from_slice(eol);
    }
}

impl Merger {
    /// Creates a merger writing `markers` around conflicts.
    pub fn new(markers: MergeMarkers) -> Self {
        Self {
            markers,
            options: DiffOptions::default(),
        }
    }

    /// Sets the search depth and cache settings used for both diffs.
    #[must_use]
    pub fn with_diff_options(mut self, options: DiffOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the conflict markers.
    pub fn markers(&self) -> &MergeMarkers {
        &self.markers
    }

    /// Merges `local` and `latest` against `base` into `out`.
    pub fn merge<B, L, T, W>(&self, base: &B, local: &L, latest: &T, out: &mut W) -> Result<MergeStatus, SvnError>
    where
        B: LineSource + ?Sized,
        L: LineSource + ?Sized,
        T: LineSource + ?Sized,
        W: Write + ?Sized,
    {
        self.merge_with(base, local, latest, out, &NeverCancel, &NoEvents)
    }

    /// Like [`Merger::merge`], polling `canceller` and reporting the outcome
    /// to `events`.
    ///
    /// Nothing is written to `out` unless the merge succeeds.
    pub fn merge_with<B, L, T, W>(
        &self,
        base: &B,
        local: &L,
        latest: &T,
        out: &mut W,
        canceller: &dyn Canceller,
        events: &dyn EventSink,
    ) -> Result<MergeStatus, SvnError>
    where
        B: LineSource + ?Sized,
        L: LineSource + ?Sized,
        T: LineSource + ?Sized,
        W: Write + ?Sized,
    {
        canceller.check()?;
        let to_local = diff_with(base, local, &self.options, canceller, &NoEvents)?;
        let to_latest = diff_with(base, latest, &self.options, canceller, &NoEvents)?;
        let local_changes: Vec<DiffBlock> = to_local.changes().copied().collect();
        let latest_changes: Vec<DiffBlock> = to_latest.changes().copied().collect();
        let groups = group_changes(&local_changes, &latest_changes);

        let base_lines = to_local.left();
        let mut merged = Vec::new();
        let mut status = MergeStatus::Unchanged;
        let mut conflicts = 0usize;
        let mut cursor = 0;
        for group in &groups {
            push_lines(&mut merged, &collect_lines(base_lines, cursor, group.base_start)?);
            cursor = group.base_end;

            let local_text = match group.side_range(&group.local) {
                Some((start, end)) => Some(collect_lines(to_local.right(), start, end)?),
                None => None,
            };
            let latest_text = match group.side_range(&group.latest) {
                Some((start, end)) => Some(collect_lines(to_latest.right(), start, end)?),
                None => None,
            };
            status = MergeStatus::Merged;
            match (local_text, latest_text) {
                (Some(text), None) | (None, Some(text)) => push_lines(&mut merged, &text),
                (Some(local), Some(latest)) if local == latest => push_lines(&mut merged, &local),
                (Some(local), Some(latest)) => {
                    conflicts += 1;
                    let m = &self.markers;
                    merged.extend_from_slice(&m.start);
                    merged.extend_from_slice(&m.eol);
                    push_variant(&mut merged, &local, &m.eol);
                    merged.extend_from_slice(&m.separator);
                    merged.extend_from_slice(&m.eol);
                    push_variant(&mut merged, &latest, &m.eol);
                    merged.extend_from_slice(&m.end);
                    merged.extend_from_slice(&m.eol);
                }
                (None, None) => {}
            }
        }
        push_lines(
            &mut merged,
            &collect_lines(base_lines, cursor, base_lines.line_count())?,
        );
        if conflicts > 0 {
            status = MergeStatus::Conflicted;
        }

        out.write_all(&merged)?;
        debug!(?status, groups = groups.len(), conflicts, "merge complete");
        events.on_event(&Event::MergeCompleted { status });
        Ok(status)
    }
}

/// Merges with the given markers and default diff settings.
///
/// # Examples
///
/// ```
/// use svn_core::merge::{MergeMarkers, MergeStatus, merge};
///
/// let mut out = Vec::new();
/// let status = merge(b"A\nB\n", b"A\nB\nC\n", b"A\nB\n", &MergeMarkers::default(), &mut out).unwrap();
/// assert_eq!(status, MergeStatus::Merged);
/// assert_eq!(out, b"A\nB\nC\n");
/// ```
pub fn merge<B, L, T, W>(
    base: &B,
    local: &L,
    latest: &T,
    markers: &MergeMarkers,
    out: &mut W,
) -> Result<MergeStatus, SvnError>
where
    B: LineSource + ?Sized,
    L: LineSource + ?Sized,
    T: LineSource + ?Sized,
    W: Write + ?Sized,
{
    Merger::new(markers.clone()).merge(base, local, latest, out)
}
