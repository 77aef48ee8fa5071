//! Snapshot differ properties.
//!
//! Each `#[case]` is isolated — no shared state.

use runframe_core::{diff, ChangeKind, FileSnapshot};
use rstest::rstest;

fn snap(files: &[(&str, &str)]) -> FileSnapshot {
    files.iter().copied().collect()
}

#[rstest]
#[case::empty(&[])]
#[case::single(&[("main.tsx", "<board/>")])]
#[case::several(&[("main.tsx", "<board/>"), ("lib/part.tsx", "export const P = 1"), ("manual-edits.json", "{}")])]
#[case::unicode(&[("部品.tsx", "// ラベル"), ("main.tsx", "")])]
fn diff_with_self_is_empty(#[case] files: &[(&str, &str)]) {
    let a = snap(files);
    assert!(diff(&a, &a).is_empty());
    assert!(diff(&a, &snap(files)).is_empty());
}

#[rstest]
#[case::added(&[], &[("a.tsx", "1")], "a.tsx", ChangeKind::Added)]
#[case::removed(&[("a.tsx", "1")], &[], "a.tsx", ChangeKind::Removed)]
#[case::modified(&[("a.tsx", "1")], &[("a.tsx", "2")], "a.tsx", ChangeKind::Modified)]
#[case::emptied(&[("a.tsx", "1")], &[("a.tsx", "")], "a.tsx", ChangeKind::Modified)]
fn single_path_changes(
    #[case] before: &[(&str, &str)],
    #[case] after: &[(&str, &str)],
    #[case] path: &str,
    #[case] kind: ChangeKind,
) {
    let changes = diff(&snap(before), &snap(after));
    assert_eq!(changes.len(), 1);
    assert_eq!(changes.get(path).map(|c| c.kind()), Some(kind));
}

#[test]
fn diff_contains_exactly_the_disagreeing_paths() {
    let a = snap(&[("same.ts", "x"), ("changed.ts", "old"), ("dropped.ts", "d")]);
    let b = snap(&[("same.ts", "x"), ("changed.ts", "new"), ("fresh.ts", "f")]);

    let changes = diff(&a, &b);
    let paths: Vec<&str> = changes.paths().collect();
    assert_eq!(paths, vec!["changed.ts", "dropped.ts", "fresh.ts"]);
}

#[test]
fn diff_is_symmetric_in_membership() {
    let a = snap(&[("one.ts", "1"), ("two.ts", "2")]);
    let b = snap(&[("two.ts", "22"), ("three.ts", "3")]);

    let forward: Vec<String> = diff(&a, &b).paths().map(str::to_string).collect();
    let backward: Vec<String> = diff(&b, &a).paths().map(str::to_string).collect();
    assert_eq!(forward, backward);
}
