//! Unified diff output.

use std::io::{Read, Write};

use super::{DiffBlock, DiffOptions, LineCache, LineSource, diff};
use crate::SvnError;

/// Label used for the working copy side.
pub const WORKING_COPY_LABEL: &str = "(working copy)";

const HEADER_SEPARATOR: &[u8] = b"===================================================================";
const BINARY_MESSAGE: &[u8] = b"Cannot display: file marked as binary type.";
const NO_NEWLINE: &[u8] = b"\\ No newline at end of file";
const BINARY_PROBE_LEN: u64 = 8 * 1024;

/// Label for a pristine revision.
pub fn revision_label(revision: u64) -> String {
    format!("(revision {revision})")
}

/// Returns `true` for a mime type that does not start with `text/`.
pub fn is_binary_mime_type(mime_type: Option<&str>) -> bool {
    mime_type.is_some_and(|mime| !mime.starts_with("text/"))
}

/// Writes `Index:`-style unified diffs for one path.
///
/// # Examples
///
/// ```
/// use svn_core::sequence::unified::UnifiedDiff;
///
/// let mut out = Vec::new();
/// UnifiedDiff::new("a.txt")
///     .write(b"one\ntwo\n", b"one\n2\n", &mut out)
///     .unwrap();
/// let text = String::from_utf8(out).unwrap();
/// assert!(text.contains("@@ -1,2 +1,2 @@\n one\n-two\n+2\n"));
/// ```
#[derive(Clone, Debug)]
pub struct UnifiedDiff {
    path: String,
    left_label: String,
    right_label: String,
    context: usize,
    left_mime: Option<String>,
    right_mime: Option<String>,
    force_text: bool,
    options: DiffOptions,
}

impl UnifiedDiff {
    /// Diff of `path` between two working copy states.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            left_label: WORKING_COPY_LABEL.to_string(),
            right_label: WORKING_COPY_LABEL.to_string(),
            context: 3,
            left_mime: None,
            right_mime: None,
            force_text: false,
            options: DiffOptions::default(),
        }
    }

    /// Sets the `---` and `+++` labels.
    #[must_use]
    pub fn with_labels(mut self, left: impl Into<String>, right: impl Into<String>) -> Self {
        self.left_label = left.into();
        self.right_label = right.into();
        self
    }

    /// Sets the number of context lines around each change.
    #[must_use]
    pub fn with_context(mut self, lines: usize) -> Self {
        self.context = lines;
        self
    }

    /// Sets the `svn:mime-type` of both sides.
    #[must_use]
    pub fn with_mime_types(mut self, left: Option<&str>, right: Option<&str>) -> Self {
        self.left_mime = left.map(str::to_string);
        self.right_mime = right.map(str::to_string);
        self
    }

    /// Diffs content as text even if it looks binary.
    #[must_use]
    pub fn force_text(mut self, force: bool) -> Self {
        self.force_text = force;
        self
    }

    /// Sets the search depth and cache settings. Terminators are always
    /// compared as-is.
    #[must_use]
    pub fn with_diff_options(mut self, options: DiffOptions) -> Self {
        self.options = options;
        self.options.custom_eol = None;
        self
    }

    /// Writes the header of a deleted file.
    pub fn write_deleted<W: Write + ?Sized>(&self, out: &mut W) -> Result<(), SvnError> {
        let mut buf = Vec::new();
        buf.extend_from_slice(format!("Index: {} (deleted)\n", self.path).as_bytes());
        buf.extend_from_slice(HEADER_SEPARATOR);
        buf.push(b'\n');
        out.write_all(&buf)?;
        Ok(())
    }

    /// Diffs `left` against `right` and writes the result to `out`.
    ///
    /// Output is assembled in memory and written once, so a failed diff
    /// writes nothing.
    pub fn write<L, R, W>(&self, left: &L, right: &R, out: &mut W) -> Result<(), SvnError>
    where
        L: LineSource + ?Sized,
        R: LineSource + ?Sized,
        W: Write + ?Sized,
    {
        let mut buf = Vec::new();
        buf.extend_from_slice(format!("Index: {}\n", self.path).as_bytes());
        buf.extend_from_slice(HEADER_SEPARATOR);
        buf.push(b'\n');

        if !self.force_text && self.is_binary(left, right)? {
            buf.extend_from_slice(BINARY_MESSAGE);
            buf.push(b'\n');
            self.write_mime_line(&mut buf);
            out.write_all(&buf)?;
            return Ok(());
        }

        buf.extend_from_slice(format!("--- {}\t{}\n", self.path, self.left_label).as_bytes());
        buf.extend_from_slice(format!("+++ {}\t{}\n", self.path, self.right_label).as_bytes());

        let result = diff(left, right, &self.options)?;
        let changes: Vec<DiffBlock> = result.changes().copied().collect();
        for hunk in group_hunks(&changes, self.context) {
            write_hunk(
                &mut buf,
                hunk,
                self.context,
                result.left(),
                result.right(),
            )?;
        }
        out.write_all(&buf)?;
        Ok(())
    }

    fn is_binary<L, R>(&self, left: &L, right: &R) -> Result<bool, SvnError>
    where
        L: LineSource + ?Sized,
        R: LineSource + ?Sized,
    {
        if is_binary_mime_type(self.left_mime.as_deref())
            || is_binary_mime_type(self.right_mime.as_deref())
        {
            return Ok(true);
        }
        Ok(has_nul_prefix(left)? || has_nul_prefix(right)?)
    }

    fn write_mime_line(&self, buf: &mut Vec<u8>) {
        let left = self.left_mime.as_deref();
        let right = self.right_mime.as_deref();
        let line = match (is_binary_mime_type(left), is_binary_mime_type(right), left, right) {
            (true, false, Some(mime), _) | (false, true, _, Some(mime)) => {
                format!("svn:mime-type = {mime}\n")
            }
            (true, true, Some(l), Some(r)) if l == r => format!("svn:mime-type = {r}\n"),
            (true, true, Some(l), Some(r)) => format!("svn:mime-type = ({l}, {r})\n"),
            _ => return,
        };
        buf.extend_from_slice(line.as_bytes());
    }
}

fn has_nul_prefix<S: LineSource + ?Sized>(source: &S) -> Result<bool, SvnError> {
    let mut probe = Vec::new();
    source
        .open()
        .and_then(|reader| reader.take(BINARY_PROBE_LEN).read_to_end(&mut probe))
        .map_err(SvnError::sequence_io)?;
    Ok(probe.contains(&0))
}

fn group_hunks(changes: &[DiffBlock], context: usize) -> Vec<&[DiffBlock]> {
    let mut hunks = Vec::new();
    let mut start = 0;
    for i in 1..changes.len() {
        if changes[i].left_start - changes[i - 1].left_end() > 2 * context {
            hunks.push(&changes[start..i]);
            start = i;
        }
    }
    if start < changes.len() {
        hunks.push(&changes[start..]);
    }
    hunks
}

fn range(start: usize, len: usize) -> String {
    match len {
        0 => format!("{start},0"),
        1 => format!("{}", start + 1),
        _ => format!("{},{len}", start + 1),
    }
}

fn write_hunk(
    buf: &mut Vec<u8>,
    hunk: &[DiffBlock],
    context: usize,
    left: &dyn LineCache,
    right: &dyn LineCache,
) -> Result<(), SvnError> {
    let (Some(first), Some(last)) = (hunk.first(), hunk.last()) else {
        return Ok(());
    };
    let left_start = first.left_start.saturating_sub(context);
    let right_start = first.right_start - (first.left_start - left_start);
    let left_end = (last.left_end() + context).min(left.line_count());
    let right_end = last.right_end() + (left_end - last.left_end());

    buf.extend_from_slice(
        format!(
            "@@ -{} +{} @@\n",
            range(left_start, left_end - left_start),
            range(right_start, right_end - right_start)
        )
        .as_bytes(),
    );

    let mut cursor = left_start;
    for change in hunk {
        for i in cursor..change.left_start {
            write_line(buf, b' ', left, i)?;
        }
        for i in change.left_start..change.left_end() {
            write_line(buf, b'-', left, i)?;
        }
        for i in change.right_start..change.right_end() {
            write_line(buf, b'+', right, i)?;
        }
        cursor = change.left_end();
    }
    for i in cursor..left_end {
        write_line(buf, b' ', left, i)?;
    }
    Ok(())
}

fn write_line(
    buf: &mut Vec<u8>,
    prefix: u8,
    cache: &dyn LineCache,
    index: usize,
) -> Result<(), SvnError> {
    let line = cache.line(index)?;
    buf.push(prefix);
    buf.extend_from_slice(line.bytes());
    if !line.has_terminator() {
        buf.push(b'\n');
        buf.extend_from_slice(NO_NEWLINE);
        buf.push(b'\n');
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn render(diff: &UnifiedDiff, left: &[u8], right: &[u8]) -> String {
        let mut out = Vec::new();
        diff.write(left, right, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn header_and_single_hunk() {
        let text = render(
            &UnifiedDiff::new("trunk/a.txt").with_labels(revision_label(4), WORKING_COPY_LABEL),
            b"a\nb\nc\n",
            b"a\nB\nc\n",
        );
        let expected = "Index: trunk/a.txt\n\
            ===================================================================\n\
            --- trunk/a.txt\t(revision 4)\n\
            +++ trunk/a.txt\t(working copy)\n\
            @@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn distant_changes_get_separate_hunks() {
        let left: Vec<u8> = (0..20).flat_map(|i| format!("{i}\n").into_bytes()).collect();
        let right: Vec<u8> = (0..20)
            .flat_map(|i| match i {
                1 => "one\n".to_string().into_bytes(),
                18 => "eighteen\n".to_string().into_bytes(),
                _ => format!("{i}\n").into_bytes(),
            })
            .collect();
        let text = render(&UnifiedDiff::new("n"), &left, &right);
        assert!(text.contains("@@ -1,5 +1,5 @@\n 0\n-1\n+one\n 2\n 3\n 4\n"));
        assert!(text.contains("@@ -16,5 +16,5 @@\n 15\n 16\n 17\n-18\n+eighteen\n 19\n"));
    }

    #[test]
    fn missing_final_newline_is_marked() {
        let text = render(&UnifiedDiff::new("f"), b"a\n", b"a\nb");
        assert!(text.ends_with("@@ -1 +1,2 @@\n a\n+b\n\\ No newline at end of file\n"));
    }

    #[test]
    fn insertion_into_empty_file() {
        let text = render(&UnifiedDiff::new("f"), b"", b"x\n");
        assert!(text.ends_with("@@ -0,0 +1 @@\n+x\n"));
    }

    #[test]
    fn binary_content_is_not_diffed() {
        let text = render(&UnifiedDiff::new("img.png"), b"\x89PNG\0\0", b"\x89PNG\0\x01");
        assert!(text.ends_with("Cannot display: file marked as binary type.\n"));

        let text = render(
            &UnifiedDiff::new("doc").with_mime_types(Some("application/pdf"), Some("text/plain")),
            b"a\n",
            b"b\n",
        );
        assert!(text.ends_with(
            "Cannot display: file marked as binary type.\nsvn:mime-type = application/pdf\n"
        ));
    }

    #[test]
    fn deleted_header() {
        let mut out = Vec::new();
        UnifiedDiff::new("gone.txt").write_deleted(&mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("Index: gone.txt (deleted)\n===="));
    }
}
