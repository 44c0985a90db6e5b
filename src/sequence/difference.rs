//! Longest common subsequence search with a comparison budget.
//!
//! The search splits the unmatched window at the middle snake of the edit
//! graph and works the two halves off an explicit stack. Every left/right
//! comparison is charged against the budget; once it runs out the remaining
//! windows are reported as changed.

use tracing::debug;

use super::media::{IndexTransformer, Media};
use crate::SvnError;
use crate::cancel::Canceller;

/// Windows nested deeper than this are reported as changed.
const MAX_SPLIT_DEPTH: usize = 4096;

/// A run of equal elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Run {
    /// First left index.
    pub left: usize,
    /// First right index.
    pub right: usize,
    /// Number of equal elements.
    pub len: usize,
}

/// Returns the comparison budget for two sequences.
///
/// An exponent of `1.0` is unbounded. Smaller exponents allow
/// `max(256, (left_len + right_len) ^ exponent)` comparisons.
pub fn search_depth(exponent: f64, left_len: usize, right_len: usize) -> Result<usize, SvnError> {
    if !(0.0..=1.0).contains(&exponent) {
        return Err(SvnError::Sequence(format!(
            "search depth exponent {exponent} is outside [0, 1]"
        )));
    }
    if exponent == 1.0 {
        return Ok(usize::MAX);
    }
    let budget = ((left_len + right_len) as f64).powf(exponent) as usize;
    Ok(budget.max(256))
}

#[derive(Clone, Copy, Debug)]
struct Window {
    l0: usize,
    l1: usize,
    r0: usize,
    r1: usize,
    depth: usize,
}

/// The diff search over one [`Media`].
pub struct Difference<'a, M: Media + ?Sized> {
    media: &'a mut M,
    canceller: &'a dyn Canceller,
    remaining: usize,
    exhausted: bool,
}

impl<'a, M: Media + ?Sized> Difference<'a, M> {
    /// Prepares a search allowing at most `budget` comparisons.
    pub fn new(media: &'a mut M, budget: usize, canceller: &'a dyn Canceller) -> Self {
        Self {
            media,
            canceller,
            remaining: budget,
            exhausted: false,
        }
    }

    /// Returns `true` once the budget ran out.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Finds the runs of equal elements, ordered by position.
    pub fn runs(&mut self) -> Result<Vec<Run>, SvnError> {
        let mut runs = Vec::new();
        let mut stack = vec![Window {
            l0: 0,
            l1: self.media.left_len(),
            r0: 0,
            r1: self.media.right_len(),
            depth: 0,
        }];
        while let Some(window) = stack.pop() {
            self.canceller.check()?;
            if self.exhausted {
                break;
            }
            self.step(window, &mut stack, &mut runs)?;
        }
        if self.exhausted {
            debug!(
                unmatched_windows = stack.len(),
                "diff search budget exhausted"
            );
        }
        runs.sort_unstable_by_key(|run| run.left);
        Ok(coalesce(runs))
    }

    fn compare(&mut self, left: usize, right: usize) -> Result<Option<bool>, SvnError> {
        if self.remaining == 0 {
            self.exhausted = true;
            return Ok(None);
        }
        self.remaining -= 1;
        self.media.equals(left, right).map(Some)
    }

    fn step(
        &mut self,
        window: Window,
        stack: &mut Vec<Window>,
        runs: &mut Vec<Run>,
    ) -> Result<(), SvnError> {
        let Window {
            mut l0,
            mut l1,
            mut r0,
            mut r1,
            depth,
        } = window;

        let (start_l, start_r) = (l0, r0);
        let mut stopped = false;
        while l0 < l1 && r0 < r1 {
            match self.compare(l0, r0)? {
                Some(true) => {
                    l0 += 1;
                    r0 += 1;
                }
                Some(false) => break,
                None => {
                    stopped = true;
                    break;
                }
            }
        }
        if l0 > start_l {
            runs.push(Run {
                left: start_l,
                right: start_r,
                len: l0 - start_l,
            });
        }
        if stopped {
            return Ok(());
        }

        let end_l = l1;
        while l0 < l1 && r0 < r1 {
            match self.compare(l1 - 1, r1 - 1)? {
                Some(true) => {
                    l1 -= 1;
                    r1 -= 1;
                }
                Some(false) => break,
                None => {
                    stopped = true;
                    break;
                }
            }
        }
        if l1 < end_l {
            runs.push(Run {
                left: l1,
                right: r1,
                len: end_l - l1,
            });
        }
        if stopped || l0 == l1 || r0 == r1 {
            return Ok(());
        }
        if depth >= MAX_SPLIT_DEPTH {
            debug!(depth, "diff split depth cap reached");
            return Ok(());
        }

        let Some((x, y)) = self.middle_snake(l0, l1, r0, r1)? else {
            return Ok(());
        };
        if (x == l0 && y == r0) || (x == l1 && y == r1) {
            return Ok(());
        }
        stack.push(Window {
            l0: x,
            l1,
            r0: y,
            r1,
            depth: depth + 1,
        });
        stack.push(Window {
            l0,
            l1: x,
            r0,
            r1: y,
            depth: depth + 1,
        });
        Ok(())
    }

    /// Locates the split point where the forward and reverse searches meet.
    fn middle_snake(
        &mut self,
        l0: usize,
        l1: usize,
        r0: usize,
        r1: usize,
    ) -> Result<Option<(usize, usize)>, SvnError> {
        let n = (l1 - l0) as isize;
        let m = (r1 - r0) as isize;
        let max_d = (n + m + 1) / 2;
        let offset = max_d;
        let v_len = 2 * max_d + 2;
        let mut forward = vec![-1isize; v_len as usize];
        let mut reverse = vec![-1isize; v_len as usize];
        forward[(offset + 1) as usize] = 0;
        reverse[(offset + 1) as usize] = 0;
        let delta = n - m;
        let front = delta % 2 != 0;
        let (mut k1_start, mut k1_end, mut k2_start, mut k2_end) = (0isize, 0isize, 0isize, 0isize);

        for d in 0..max_d {
            let mut k1 = -d + k1_start;
            while k1 <= d - k1_end {
                let k1_off = (offset + k1) as usize;
                let mut x1 = if k1 == -d || (k1 != d && forward[k1_off - 1] < forward[k1_off + 1]) {
                    forward[k1_off + 1]
                } else {
                    forward[k1_off - 1] + 1
                };
                let mut y1 = x1 - k1;
                while x1 < n && y1 < m {
                    match self.compare(l0 + x1 as usize, r0 + y1 as usize)? {
                        Some(true) => {
                            x1 += 1;
                            y1 += 1;
                        }
                        Some(false) => break,
                        None => return Ok(None),
                    }
                }
                forward[k1_off] = x1;
                if x1 > n {
                    k1_end += 2;
                } else if y1 > m {
                    k1_start += 2;
                } else if front {
                    let k2_off = offset + delta - k1;
                    if (0..v_len).contains(&k2_off) && reverse[k2_off as usize] != -1 {
                        let x2 = n - reverse[k2_off as usize];
                        if x1 >= x2 {
                            return Ok(Some((l0 + x1 as usize, r0 + y1 as usize)));
                        }
                    }
                }
                k1 += 2;
            }

            let mut k2 = -d + k2_start;
            while k2 <= d - k2_end {
                let k2_off = (offset + k2) as usize;
                let mut x2 = if k2 == -d || (k2 != d && reverse[k2_off - 1] < reverse[k2_off + 1]) {
                    reverse[k2_off + 1]
                } else {
                    reverse[k2_off - 1] + 1
                };
                let mut y2 = x2 - k2;
                while x2 < n && y2 < m {
                    let left = l0 + (n - x2 - 1) as usize;
                    let right = r0 + (m - y2 - 1) as usize;
                    match self.compare(left, right)? {
                        Some(true) => {
                            x2 += 1;
                            y2 += 1;
                        }
                        Some(false) => break,
                        None => return Ok(None),
                    }
                }
                reverse[k2_off] = x2;
                if x2 > n {
                    k2_end += 2;
                } else if y2 > m {
                    k2_start += 2;
                } else if !front {
                    let k1_off = offset + delta - k2;
                    if (0..v_len).contains(&k1_off) && forward[k1_off as usize] != -1 {
                        let x1 = forward[k1_off as usize];
                        let y1 = offset + x1 - k1_off;
                        if x1 >= n - x2 {
                            return Ok(Some((l0 + x1 as usize, r0 + y1 as usize)));
                        }
                    }
                }
                k2 += 2;
            }
        }
        Ok(None)
    }
}

fn coalesce(runs: Vec<Run>) -> Vec<Run> {
    let mut out: Vec<Run> = Vec::with_capacity(runs.len());
    for run in runs.into_iter().filter(|run| run.len > 0) {
        if let Some(last) = out.last_mut()
            && last.left + last.len == run.left
            && last.right + last.len == run.right
        {
            last.len += run.len;
            continue;
        }
        out.push(run);
    }
    out
}

/// Maps runs found on a reduced media back to original indices.
///
/// A reduced run splits wherever the original indices stop being
/// consecutive on either side.
pub fn translate_runs<T: IndexTransformer + ?Sized>(runs: &[Run], transformer: &T) -> Vec<Run> {
    let mut out: Vec<Run> = Vec::with_capacity(runs.len());
    for run in runs {
        for k in 0..run.len {
            let left = transformer.left_original(run.left + k);
            let right = transformer.right_original(run.right + k);
            if let Some(last) = out.last_mut()
                && last.left + last.len == left
                && last.right + last.len == right
            {
                last.len += 1;
                continue;
            }
            out.push(Run { left, right, len: 1 });
        }
    }
    out
}
