//! Diff, unified output, merge and delta application through the public API.

#![allow(clippy::unwrap_used)]

use std::sync::Mutex;

use svn_core::cancel::{CancelFlag, Event, EventSink, NeverCancel};
use svn_core::merge::{MergeMarkers, MergeStatus, Merger, merge};
use svn_core::sequence::unified::{UnifiedDiff, revision_label};
use svn_core::sequence::{BlockKind, DiffOptions, diff, diff_with};
use svn_core::SvnError;

fn numbered(count: usize, edit: impl Fn(usize) -> Option<String>) -> Vec<u8> {
    let mut out = Vec::new();
    for i in 0..count {
        match edit(i) {
            Some(line) => out.extend_from_slice(line.as_bytes()),
            None => out.extend_from_slice(format!("line {i}\n").as_bytes()),
        }
    }
    out
}

#[derive(Default)]
struct Recorder(Mutex<Vec<Event>>);

impl EventSink for Recorder {
    fn on_event(&self, event: &Event) {
        self.0.lock().unwrap().push(event.clone());
    }
}

#[test]
fn memory_and_file_backed_diffs_agree() {
    let left = numbered(400, |_| None);
    let right = numbered(400, |i| match i {
        17 => Some("changed\n".to_string()),
        200..=204 => Some(String::new()),
        350 => Some("line 350\ninserted\n".to_string()),
        _ => None,
    });

    let in_memory = diff(&left, &right, &DiffOptions::default()).unwrap();
    let file_backed = diff(
        &left,
        &right,
        &DiffOptions::default()
            .with_memory_threshold(64)
            .with_segment_size(128),
    )
    .unwrap();

    assert_eq!(in_memory.blocks(), file_backed.blocks());
    let changes: Vec<_> = in_memory.changes().collect();
    assert_eq!(changes.len(), 3);
    assert_eq!((changes[0].left_start, changes[0].left_len), (17, 1));
    assert_eq!((changes[1].left_start, changes[1].left_len, changes[1].right_len), (200, 5, 0));
    assert_eq!((changes[2].left_len, changes[2].right_len), (0, 1));
}

#[test]
fn diff_reports_every_block_to_the_sink() {
    let events = Recorder::default();
    let result = diff_with(
        b"a\nb\nc\n",
        b"a\nx\nc\n",
        &DiffOptions::default(),
        &NeverCancel,
        &events,
    )
    .unwrap();

    let reported: Vec<_> = events
        .0
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            Event::DiffBlock(block) => Some(*block),
            _ => None,
        })
        .collect();
    assert_eq!(reported, result.blocks());
    assert!(reported.iter().any(|b| b.kind == BlockKind::Changed));
}

#[test]
fn cancelled_diff_stops_with_a_cancellation_error() {
    let flag = CancelFlag::new();
    flag.cancel();
    let err = diff_with(
        b"a\n",
        b"b\n",
        &DiffOptions::default(),
        &flag,
        &svn_core::cancel::NoEvents,
    )
    .unwrap_err();
    assert!(err.is_cancellation());
}

#[test]
fn unified_diff_of_files_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let left = dir.path().join("left.txt");
    let right = dir.path().join("right.txt");
    std::fs::write(&left, b"one\ntwo\nthree").unwrap();
    std::fs::write(&right, b"one\n2\nthree").unwrap();

    let mut out = Vec::new();
    UnifiedDiff::new("notes.txt")
        .with_labels(revision_label(4), "(working copy)")
        .write(left.as_path(), right.as_path(), &mut out)
        .unwrap();
    let text = String::from_utf8(out).unwrap();

    assert!(text.starts_with("Index: notes.txt\n===="), "{text}");
    assert!(text.contains("--- notes.txt\t(revision 4)\n"), "{text}");
    assert!(text.contains("+++ notes.txt\t(working copy)\n"), "{text}");
    assert!(
        text.ends_with("@@ -1,3 +1,3 @@\n one\n-two\n+2\n three\n\\ No newline at end of file\n"),
        "{text}"
    );
}

#[test]
fn merge_round_trips_an_untouched_base() {
    let base = b"alpha\nbeta\n";
    let mut out = Vec::new();
    let status = merge(base, base, base, &MergeMarkers::default(), &mut out).unwrap();
    assert_eq!(status, MergeStatus::Unchanged);
    assert_eq!(out, base);
}

#[test]
fn merge_frames_conflicts_with_custom_markers() {
    let markers = MergeMarkers::new("<<<< mine", "====", ">>>> theirs", "\r\n");
    let mut out = Vec::new();
    let status = merge(b"A\n", b"B\n", b"C\n", &markers, &mut out).unwrap();
    assert_eq!(status, MergeStatus::Conflicted);
    assert_eq!(out, b"<<<< mine\r\nB\n====\r\nC\n>>>> theirs\r\n");
}

#[test]
fn merge_applies_non_overlapping_edits_from_both_sides() {
    let base = numbered(30, |_| None);
    let local = numbered(30, |i| (i == 3).then(|| "local edit\n".to_string()));
    let latest = numbered(30, |i| (i == 25).then(|| "latest edit\n".to_string()));

    let mut out = Vec::new();
    let status = Merger::new(MergeMarkers::default())
        .with_diff_options(DiffOptions::default().with_memory_threshold(32))
        .merge(&base, &local, &latest, &mut out)
        .unwrap();
    assert_eq!(status, MergeStatus::Merged);
    let expected = numbered(30, |i| match i {
        3 => Some("local edit\n".to_string()),
        25 => Some("latest edit\n".to_string()),
        _ => None,
    });
    assert_eq!(out, expected);
}

#[test]
fn merge_of_missing_file_is_a_sequence_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("gone.txt");
    let mut out = Vec::new();
    let err = merge(
        missing.as_path(),
        b"a\n".as_slice(),
        b"a\n".as_slice(),
        &MergeMarkers::default(),
        &mut out,
    )
    .unwrap_err();
    assert!(matches!(err, SvnError::Sequence(_)), "{err}");
    assert!(out.is_empty());
}

#[test]
fn delta_reconstructs_target_from_base() {
    // One window: copy the 5 source bytes, then 6 bytes of new data.
    let mut delta = b"SVN\0".to_vec();
    let instructions = [0x05, 0x00, 0x80 | 6];
    delta.extend_from_slice(&[0, 5, 11, instructions.len() as u8, 6]);
    delta.extend_from_slice(&instructions);
    delta.extend_from_slice(b" world");

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let mut out = Vec::new();
    rt.block_on(svn_core::delta::apply_delta(
        b"hello",
        delta.chunks(3),
        &mut out,
    ))
    .unwrap();
    assert_eq!(out, b"hello world");
}
