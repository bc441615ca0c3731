// ABOUTME: Integration tests for the run history file
// ABOUTME: Covers prefix lookup ambiguity, token routing and legacy line formats

use proptest::prelude::*;
use tempfile::TempDir;

use headway::session::{is_uuid_shaped, HistoryFile, SessionError};

fn history_with(lines: &[&str]) -> (TempDir, HistoryFile) {
    let dir = TempDir::new().unwrap();
    let history = HistoryFile::new(dir.path());
    std::fs::write(history.path(), lines.join("\n") + "\n").unwrap();
    (dir, history)
}

#[test]
fn ambiguous_prefix_lists_every_candidate() {
    let (_dir, history) = history_with(&[
        "2024-05-01 10:00:00\trun_a\tb8a3f1e2-1111-4eee-9f60-bbbc63bbcf13\tcmd",
        "2024-05-01 11:00:00\trun_b\t58d8f1e2-2222-4eee-9f60-bbbc63bbcf13\tcmd",
        "2024-05-01 12:00:00\trun_c\t5a6df1e2-3333-4eee-9f60-bbbc63bbcf13\tcmd",
        "2024-05-01 13:00:00\trun_d\t5910f1e2-4444-4eee-9f60-bbbc63bbcf13\tcmd",
    ]);

    let matches = history.find_by_id("5").unwrap();
    assert_eq!(matches.len(), 3);

    let err = history.find_unique("5").unwrap_err();
    match &err {
        SessionError::AmbiguousId { ids, .. } => {
            assert_eq!(ids.len(), 3);
        }
        other => panic!("expected ambiguous id error, got {:?}", other),
    }
    let message = err.to_string();
    for id in ["58d8f1e2", "5a6df1e2", "5910f1e2"] {
        assert!(message.contains(id), "missing {} in: {}", id, message);
    }
    assert!(!message.contains("b8a3f1e2"));
}

#[test]
fn token_routing_last_id_and_name() {
    let (_dir, history) = history_with(&[
        "2024-05-01 10:00:00\tbold_curie\tb8a3f1e2-1111-4eee-9f60-bbbc63bbcf13\tcmd one",
        "2024-05-01 11:00:00\tshy_euler\t58d8f1e2-2222-4eee-9f60-bbbc63bbcf13\tcmd two",
    ]);

    assert_eq!(history.find_by("last").unwrap()[0].run_name, "shy_euler");
    assert_eq!(history.find_by("b8a3").unwrap()[0].run_name, "bold_curie");
    assert_eq!(
        history.find_by("bold_curie").unwrap()[0].command_line,
        "cmd one"
    );
}

#[test]
fn single_character_tokens_are_uuid_shaped() {
    assert!(is_uuid_shaped("5"));
    assert!(is_uuid_shaped("a"));
    assert!(is_uuid_shaped("-"));
    assert!(!is_uuid_shaped("g"));
    assert!(!is_uuid_shaped("run5"));
}

#[test]
fn legacy_two_column_and_swapped_lines_parse() {
    let (_dir, history) = history_with(&[
        "b8a3f1e2-1111-4eee-9f60-bbbc63bbcf13\theadway run legacy.hw",
        "headway run swapped.hw\t58d8f1e2-2222-4eee-9f60-bbbc63bbcf13",
        "2024-05-01 12:00:00\tmodern_run\t5a6df1e2-3333-4eee-9f60-bbbc63bbcf13\theadway run new.hw",
    ]);

    let entries = history.load().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(
        entries[0].session_id,
        "b8a3f1e2-1111-4eee-9f60-bbbc63bbcf13"
    );
    assert_eq!(entries[0].command_line, "headway run legacy.hw");
    assert_eq!(
        entries[1].session_id,
        "58d8f1e2-2222-4eee-9f60-bbbc63bbcf13"
    );
    assert_eq!(entries[1].command_line, "headway run swapped.hw");
    assert_eq!(entries[2].run_name, "modern_run");
    assert!(entries[2].timestamp.is_some());
}

#[test]
fn emitted_lines_are_four_column() {
    let dir = TempDir::new().unwrap();
    let history = HistoryFile::new(dir.path());
    history
        .append(
            "b8a3f1e2-1111-4eee-9f60-bbbc63bbcf13",
            "quiet_volta",
            "headway run main",
        )
        .unwrap();

    let raw = std::fs::read_to_string(history.path()).unwrap();
    let line = raw.lines().next().unwrap();
    assert_eq!(line.split('\t').count(), 4);
    assert!(line.ends_with("headway run main"));
}

proptest! {
    // Prefix lookup returns exactly the entries whose id begins with the
    // prefix; a unique resolution needs exactly one of them.
    #[test]
    fn prefix_lookup_counts(prefix_seed in 0u8..16) {
        let (_dir, history) = history_with(&[
            "2024-05-01 10:00:00\tr1\t00aaf1e2-1111-4eee-9f60-bbbc63bbcf13\tcmd",
            "2024-05-01 11:00:00\tr2\t01bbf1e2-2222-4eee-9f60-bbbc63bbcf13\tcmd",
            "2024-05-01 12:00:00\tr3\t0accf1e2-3333-4eee-9f60-bbbc63bbcf13\tcmd",
        ]);
        let prefix = format!("{:x}", prefix_seed);
        let matches = history.find_by_id(&prefix).unwrap();
        let expected = ["00aaf1e2", "01bbf1e2", "0accf1e2"]
            .iter()
            .filter(|id| id.starts_with(&prefix))
            .count();
        prop_assert_eq!(matches.len(), expected);

        match history.find_unique(&prefix) {
            Ok(_) => prop_assert_eq!(expected, 1),
            Err(SessionError::AmbiguousId { ids, .. }) => {
                prop_assert!(expected >= 2);
                prop_assert_eq!(ids.len(), expected);
            }
            Err(SessionError::UnknownRun(_)) => prop_assert_eq!(expected, 0),
            Err(other) => return Err(TestCaseError::fail(format!("{:?}", other))),
        }
    }
}

#[test]
fn delete_entry_keeps_other_lines() {
    let (_dir, history) = history_with(&[
        "2024-05-01 10:00:00\tkeep_me\tb8a3f1e2-1111-4eee-9f60-bbbc63bbcf13\tcmd",
        "2024-05-01 11:00:00\tdrop_me\t58d8f1e2-2222-4eee-9f60-bbbc63bbcf13\tcmd",
    ]);

    let target = history.find_unique("drop_me").unwrap();
    history.delete_entry(&target).unwrap();

    let remaining = history.load().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].run_name, "keep_me");
}
