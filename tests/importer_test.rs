//! End-to-end tests for the import pipeline: fixture JSONL files laid out
//! like the real projects tree, imported through the bulk driver, verified
//! at the store level.

use engram::db;
use engram::importer::{self, ImportConfig};
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const PROJECT_KEY: &str = "-home-alex-work";

// ---------------------------------------------------------------------------
// Fixture builders matching the real log field structure
// ---------------------------------------------------------------------------

fn user_msg(uuid: &str, parent: Option<&str>, ts: &str, text: &str) -> String {
    let parent = parent
        .map(|p| format!("\"{p}\""))
        .unwrap_or_else(|| "null".into());
    format!(
        r#"{{"parentUuid":{parent},"isSidechain":false,"cwd":"/home/alex/work","sessionId":"ignored","gitBranch":"main","type":"user","message":{{"role":"user","content":"{text}"}},"uuid":"{uuid}","timestamp":"{ts}"}}"#
    )
}

fn assistant_msg(uuid: &str, parent: &str, ts: &str, text: &str) -> String {
    format!(
        r#"{{"parentUuid":"{parent}","isSidechain":false,"cwd":"/home/alex/work","sessionId":"ignored","gitBranch":"main","type":"assistant","message":{{"role":"assistant","model":"claude-sonnet-4-5","content":[{{"type":"text","text":"{text}"}}],"stop_reason":"end_turn"}},"uuid":"{uuid}","timestamp":"{ts}"}}"#
    )
}

fn assistant_tools_msg(uuid: &str, parent: &str, ts: &str) -> String {
    format!(
        r#"{{"parentUuid":"{parent}","type":"assistant","message":{{"role":"assistant","content":[{{"type":"text","text":"editing now"}},{{"type":"tool_use","id":"toolu_01","name":"Edit","input":{{"file_path":"/src/lib.rs","old_string":"a","new_string":"b"}}}},{{"type":"tool_use","id":"toolu_02","name":"Bash","input":{{"command":"git commit -m 'Wire up the archive'"}}}}]}},"uuid":"{uuid}","timestamp":"{ts}"}}"#
    )
}

fn tool_result_msg(uuid: &str, parent: &str, ts: &str) -> String {
    format!(
        r#"{{"parentUuid":"{parent}","type":"user","message":{{"role":"user","content":[{{"tool_use_id":"toolu_01","type":"tool_result","content":"file edited"}}]}},"uuid":"{uuid}","timestamp":"{ts}"}}"#
    )
}

fn progress_msg(uuid: &str, ts: &str) -> String {
    format!(r#"{{"type":"progress","uuid":"{uuid}","timestamp":"{ts}","data":{{}}}}"#)
}

fn write_session(projects_dir: &Path, project_key: &str, file_name: &str, lines: &[String]) -> PathBuf {
    let dir = projects_dir.join(project_key);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(file_name);
    fs::write(&path, lines.join("\n")).unwrap();
    path
}

/// Three records: user -> assistant -> user (scenario S1).
fn linear_session() -> Vec<String> {
    vec![
        user_msg("A", None, "2025-01-01T10:00:00Z", "hi"),
        assistant_msg("B", "A", "2025-01-01T10:00:05Z", "hello"),
        user_msg("C", Some("B"), "2025-01-01T10:01:00Z", "bye"),
    ]
}

/// A -> B -> C plus A -> B -> D, where D is the later leaf (scenario S2).
fn rewind_session() -> Vec<String> {
    vec![
        user_msg("A", None, "2025-01-01T10:00:00Z", "start the work"),
        assistant_msg("B", "A", "2025-01-01T10:00:05Z", "on it"),
        user_msg("C", Some("B"), "2025-01-01T10:01:00Z", "first attempt request"),
        user_msg("D", Some("B"), "2025-01-01T10:02:00Z", "second attempt request"),
    ]
}

fn run(projects_dir: &Path, db_path: &Path) -> importer::ImportReport {
    importer::run_import(ImportConfig {
        db_path: db_path.to_path_buf(),
        projects_dir: projects_dir.to_path_buf(),
        project: None,
        exclude_projects: Vec::new(),
    })
    .unwrap()
}

fn count(conn: &Connection, sql: &str) -> i64 {
    conn.query_row(sql, [], |r| r.get(0)).unwrap()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_s1_linear_session() {
    let tmp = TempDir::new().unwrap();
    let projects_dir = tmp.path().join("projects");
    let db_path = tmp.path().join("test.db");
    write_session(&projects_dir, PROJECT_KEY, "sess-1.jsonl", &linear_session());

    let report = run(&projects_dir, &db_path);
    assert_eq!(report.branches_written, 1);
    assert_eq!(report.messages_written, 3);

    let conn = db::open(&db_path).unwrap();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM sessions"), 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM messages"), 3);

    let (leaf, is_active, exchanges, fork): (String, i64, i64, Option<String>) = conn
        .query_row(
            "SELECT leaf_uuid, is_active, exchange_count, fork_point_uuid FROM branches",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .unwrap();
    assert_eq!(leaf, "C");
    assert_eq!(is_active, 1);
    assert_eq!(exchanges, 2);
    assert!(fork.is_none());

    // Project decoded from the directory key.
    let (path, name): (String, String) = conn
        .query_row("SELECT path, name FROM projects", [], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .unwrap();
    assert_eq!(path, "/home/alex/work");
    assert_eq!(name, "work");

    // Session metadata coalesced from the records.
    let (git_branch, cwd): (Option<String>, Option<String>) = conn
        .query_row("SELECT git_branch, cwd FROM sessions", [], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .unwrap();
    assert_eq!(git_branch.as_deref(), Some("main"));
    assert_eq!(cwd.as_deref(), Some("/home/alex/work"));
}

#[test]
fn test_s2_rewind_produces_shared_prefix_branches() {
    let tmp = TempDir::new().unwrap();
    let projects_dir = tmp.path().join("projects");
    let db_path = tmp.path().join("test.db");
    write_session(&projects_dir, PROJECT_KEY, "sess-1.jsonl", &rewind_session());

    run(&projects_dir, &db_path);

    let conn = db::open(&db_path).unwrap();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM branches"), 2);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM messages"), 4);

    let (active_leaf, active_fork): (String, Option<String>) = conn
        .query_row(
            "SELECT leaf_uuid, fork_point_uuid FROM branches WHERE is_active = 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(active_leaf, "D");
    assert!(active_fork.is_none());

    let (abandoned_leaf, abandoned_fork): (String, Option<String>) = conn
        .query_row(
            "SELECT leaf_uuid, fork_point_uuid FROM branches WHERE is_active = 0",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(abandoned_leaf, "C");
    assert_eq!(abandoned_fork.as_deref(), Some("B"));

    // Both branches share the A/B prefix: each has three members.
    let members = |leaf: &str| -> Vec<String> {
        let mut stmt = conn
            .prepare(
                "SELECT m.uuid FROM branch_messages bm
                 JOIN branches b ON bm.branch_id = b.id
                 JOIN messages m ON bm.message_id = m.id
                 WHERE b.leaf_uuid = ?1 ORDER BY m.uuid",
            )
            .unwrap();
        stmt.query_map([leaf], |r| r.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    };
    assert_eq!(members("D"), vec!["A", "B", "D"]);
    assert_eq!(members("C"), vec!["A", "B", "C"]);
}

#[test]
fn test_s3_rewind_without_user_descendant_is_filtered() {
    let tmp = TempDir::new().unwrap();
    let projects_dir = tmp.path().join("projects");
    let db_path = tmp.path().join("test.db");

    let lines = vec![
        user_msg("A", None, "2025-01-01T10:00:00Z", "start"),
        assistant_msg("B", "A", "2025-01-01T10:00:05Z", "ack"),
        assistant_msg("C", "B", "2025-01-01T10:01:00Z", "side record"),
        user_msg("D", Some("B"), "2025-01-01T10:02:00Z", "real continuation"),
    ];
    write_session(&projects_dir, PROJECT_KEY, "sess-1.jsonl", &lines);

    run(&projects_dir, &db_path);

    let conn = db::open(&db_path).unwrap();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM branches"), 1);
    let leaf: String = conn
        .query_row("SELECT leaf_uuid FROM branches", [], |r| r.get(0))
        .unwrap();
    assert_eq!(leaf, "D");
}

#[test]
fn test_s4_reimport_with_hash_match_is_noop() {
    let tmp = TempDir::new().unwrap();
    let projects_dir = tmp.path().join("projects");
    let db_path = tmp.path().join("test.db");
    write_session(&projects_dir, PROJECT_KEY, "sess-1.jsonl", &linear_session());

    let first = run(&projects_dir, &db_path);
    assert_eq!(first.branches_written, 1);
    assert_eq!(first.messages_written, 3);
    assert_eq!(first.sessions_skipped, 0);

    let second = run(&projects_dir, &db_path);
    assert_eq!(second.branches_written, 0);
    assert_eq!(second.messages_written, 0);
    assert_eq!(second.sessions_skipped, 1);

    let conn = db::open(&db_path).unwrap();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM sessions"), 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM branches"), 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM messages"), 3);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM import_log"), 1);
}

#[test]
fn test_s6_orphan_cleanup_after_branch_removal() {
    let tmp = TempDir::new().unwrap();
    let projects_dir = tmp.path().join("projects");
    let db_path = tmp.path().join("test.db");
    let file = write_session(&projects_dir, PROJECT_KEY, "sess-1.jsonl", &rewind_session());

    run(&projects_dir, &db_path);
    {
        let conn = db::open(&db_path).unwrap();
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM branches"), 2);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM messages"), 4);
    }

    // Rewrite the file without the abandoned record C.
    let trimmed = vec![
        user_msg("A", None, "2025-01-01T10:00:00Z", "start the work"),
        assistant_msg("B", "A", "2025-01-01T10:00:05Z", "on it"),
        user_msg("D", Some("B"), "2025-01-01T10:02:00Z", "second attempt request"),
    ];
    fs::write(&file, trimmed.join("\n")).unwrap();

    run(&projects_dir, &db_path);

    let conn = db::open(&db_path).unwrap();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM branches"), 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM messages"), 3);
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM messages WHERE uuid = 'C'"),
        0
    );

    // FTS no longer matches the deleted message.
    assert_eq!(
        count(
            &conn,
            "SELECT COUNT(*) FROM messages_fts WHERE messages_fts MATCH '\"first\"'"
        ),
        0
    );
    // The surviving sibling still does.
    assert_eq!(
        count(
            &conn,
            "SELECT COUNT(*) FROM messages_fts WHERE messages_fts MATCH '\"second\"'"
        ),
        1
    );
}

// ---------------------------------------------------------------------------
// Invariants
// ---------------------------------------------------------------------------

#[test]
fn test_invariants_after_rewind_import() {
    let tmp = TempDir::new().unwrap();
    let projects_dir = tmp.path().join("projects");
    let db_path = tmp.path().join("test.db");
    write_session(&projects_dir, PROJECT_KEY, "sess-1.jsonl", &rewind_session());
    write_session(&projects_dir, PROJECT_KEY, "sess-2.jsonl", &linear_session());

    run(&projects_dir, &db_path);
    let conn = db::open(&db_path).unwrap();

    // Every membership row stays inside one session.
    assert_eq!(
        count(
            &conn,
            "SELECT COUNT(*) FROM branch_messages bm
             JOIN branches b ON bm.branch_id = b.id
             JOIN messages m ON bm.message_id = m.id
             WHERE b.session_id != m.session_id"
        ),
        0
    );

    // Exactly one active branch per session.
    assert_eq!(
        count(
            &conn,
            "SELECT COUNT(*) FROM (
                 SELECT session_id FROM branches GROUP BY session_id
                 HAVING SUM(is_active) != 1
             )"
        ),
        0
    );

    // No message without a branch.
    assert_eq!(
        count(
            &conn,
            "SELECT COUNT(*) FROM messages m
             WHERE NOT EXISTS (SELECT 1 FROM branch_messages bm WHERE bm.message_id = m.id)"
        ),
        0
    );

    // FTS rowids mirror the messages table exactly.
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM messages_fts"),
        count(&conn, "SELECT COUNT(*) FROM messages")
    );
}

#[test]
fn test_reimport_after_change_matches_fresh_import() {
    let tmp = TempDir::new().unwrap();
    let projects_dir = tmp.path().join("projects");

    // Incremental path: import the short file, then the grown file.
    let db_a = tmp.path().join("a.db");
    let file = write_session(&projects_dir, PROJECT_KEY, "sess-1.jsonl", &linear_session());
    run(&projects_dir, &db_a);
    fs::write(&file, rewind_session().join("\n")).unwrap();
    run(&projects_dir, &db_a);

    // Fresh path: import the grown file into an empty database.
    let db_b = tmp.path().join("b.db");
    run(&projects_dir, &db_b);

    let dump = |path: &Path| -> (Vec<(String, i64, Option<String>, i64)>, Vec<String>, i64) {
        let conn = db::open(path).unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT leaf_uuid, is_active, fork_point_uuid, exchange_count
                 FROM branches ORDER BY leaf_uuid",
            )
            .unwrap();
        let branches = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        let mut stmt = conn
            .prepare("SELECT uuid FROM messages ORDER BY uuid")
            .unwrap();
        let messages = stmt
            .query_map([], |r| r.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        let memberships = count(&conn, "SELECT COUNT(*) FROM branch_messages");
        (branches, messages, memberships)
    };

    assert_eq!(dump(&db_a), dump(&db_b));
}

// ---------------------------------------------------------------------------
// Edge cases and drivers
// ---------------------------------------------------------------------------

#[test]
fn test_noise_only_file_is_skipped() {
    let tmp = TempDir::new().unwrap();
    let projects_dir = tmp.path().join("projects");
    let db_path = tmp.path().join("test.db");

    let lines = vec![
        progress_msg("p1", "2025-01-01T10:00:00Z"),
        progress_msg("p2", "2025-01-01T10:00:01Z"),
        "{broken json".to_string(),
    ];
    write_session(&projects_dir, PROJECT_KEY, "sess-1.jsonl", &lines);

    let report = run(&projects_dir, &db_path);
    assert_eq!(report.branches_written, 0);
    assert_eq!(report.sessions_skipped, 1);

    let conn = db::open(&db_path).unwrap();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM sessions"), 0);
}

#[test]
fn test_tool_result_only_session_has_zero_exchanges() {
    let tmp = TempDir::new().unwrap();
    let projects_dir = tmp.path().join("projects");
    let db_path = tmp.path().join("test.db");

    let lines = vec![
        assistant_tools_msg("A1", "root", "2025-01-01T10:00:00Z"),
        tool_result_msg("T1", "A1", "2025-01-01T10:00:05Z"),
        tool_result_msg("T2", "T1", "2025-01-01T10:00:10Z"),
    ];
    write_session(&projects_dir, PROJECT_KEY, "sess-1.jsonl", &lines);

    run(&projects_dir, &db_path);

    let conn = db::open(&db_path).unwrap();
    let exchanges: i64 = conn
        .query_row("SELECT exchange_count FROM branches", [], |r| r.get(0))
        .unwrap();
    assert_eq!(exchanges, 0);
    // Tool-result user records are never stored as messages.
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM messages WHERE role = 'user'"),
        0
    );
}

#[test]
fn test_branch_metadata_files_and_commits() {
    let tmp = TempDir::new().unwrap();
    let projects_dir = tmp.path().join("projects");
    let db_path = tmp.path().join("test.db");

    let lines = vec![
        user_msg("A", None, "2025-01-01T10:00:00Z", "edit the library"),
        assistant_tools_msg("B", "A", "2025-01-01T10:00:05Z"),
    ];
    write_session(&projects_dir, PROJECT_KEY, "sess-1.jsonl", &lines);

    run(&projects_dir, &db_path);

    let conn = db::open(&db_path).unwrap();
    let (files, commits, started, ended): (String, String, String, String) = conn
        .query_row(
            "SELECT files_modified, commits, started_at, ended_at FROM branches",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .unwrap();
    assert_eq!(files, r#"["/src/lib.rs"]"#);
    assert_eq!(commits, r#"["Wire up the archive"]"#);
    assert_eq!(started, "2025-01-01T10:00:00Z");
    assert_eq!(ended, "2025-01-01T10:00:05Z");

    // Tool usage is summarized on the assistant message, not in its text.
    let (content, summary, has_tools): (String, String, i64) = conn
        .query_row(
            "SELECT content, tool_summary, has_tool_use FROM messages WHERE uuid = 'B'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .unwrap();
    assert_eq!(content, "editing now");
    assert_eq!(summary, r#"{"Bash":1,"Edit":1}"#);
    assert_eq!(has_tools, 1);
}

#[test]
fn test_subagent_links_parent_session() {
    let tmp = TempDir::new().unwrap();
    let projects_dir = tmp.path().join("projects");
    let db_path = tmp.path().join("test.db");

    write_session(&projects_dir, PROJECT_KEY, "sess-1.jsonl", &linear_session());
    let subagents = projects_dir.join(PROJECT_KEY).join("sess-1").join("subagents");
    fs::create_dir_all(&subagents).unwrap();
    fs::write(
        subagents.join("agent-sub-1.jsonl"),
        user_msg("SA", None, "2025-01-01T10:05:00Z", "delegated work"),
    )
    .unwrap();

    run(&projects_dir, &db_path);

    let conn = db::open(&db_path).unwrap();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM sessions"), 2);

    // The agent- prefix is stripped from the sub-agent's session UUID and
    // its parent resolves to the enclosing session's row.
    let parent_uuid: String = conn
        .query_row(
            "SELECT p.uuid FROM sessions c JOIN sessions p ON c.parent_session_id = p.id
             WHERE c.uuid = 'sub-1'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(parent_uuid, "sess-1");
}

#[test]
fn test_subagent_without_imported_parent_gets_null_reference() {
    let tmp = TempDir::new().unwrap();
    let projects_dir = tmp.path().join("projects");
    let db_path = tmp.path().join("test.db");

    // The enclosing session file exists but holds nothing importable, so the
    // parent row never materializes.
    write_session(
        &projects_dir,
        PROJECT_KEY,
        "sess-1.jsonl",
        &[progress_msg("p1", "2025-01-01T10:00:00Z")],
    );
    let subagents = projects_dir.join(PROJECT_KEY).join("sess-1").join("subagents");
    fs::create_dir_all(&subagents).unwrap();
    fs::write(
        subagents.join("agent-sub-1.jsonl"),
        user_msg("SA", None, "2025-01-01T10:05:00Z", "delegated work"),
    )
    .unwrap();

    run(&projects_dir, &db_path);

    let conn = db::open(&db_path).unwrap();
    let parent: Option<i64> = conn
        .query_row(
            "SELECT parent_session_id FROM sessions WHERE uuid = 'sub-1'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert!(parent.is_none());
}

#[test]
fn test_excluded_project_is_skipped_entirely() {
    let tmp = TempDir::new().unwrap();
    let projects_dir = tmp.path().join("projects");
    let db_path = tmp.path().join("test.db");
    write_session(&projects_dir, PROJECT_KEY, "sess-1.jsonl", &linear_session());

    let report = importer::run_import(ImportConfig {
        db_path: db_path.clone(),
        projects_dir,
        project: None,
        exclude_projects: vec!["work".into()],
    })
    .unwrap();
    assert_eq!(report.branches_written, 0);

    let conn = db::open(&db_path).unwrap();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM projects"), 0);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM sessions"), 0);
}

#[test]
fn test_single_project_flag_limits_the_walk() {
    let tmp = TempDir::new().unwrap();
    let projects_dir = tmp.path().join("projects");
    let db_path = tmp.path().join("test.db");
    write_session(&projects_dir, PROJECT_KEY, "sess-1.jsonl", &linear_session());
    write_session(&projects_dir, "-srv-other", "sess-2.jsonl", &linear_session());

    let report = importer::run_import(ImportConfig {
        db_path: db_path.clone(),
        projects_dir: projects_dir.clone(),
        project: Some(PROJECT_KEY.into()),
        exclude_projects: Vec::new(),
    })
    .unwrap();
    assert_eq!(report.branches_written, 1);

    let conn = db::open(&db_path).unwrap();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM projects"), 1);

    let missing = importer::run_import(ImportConfig {
        db_path,
        projects_dir,
        project: Some("-does-not-exist".into()),
        exclude_projects: Vec::new(),
    });
    assert!(missing.is_err());
}

#[test]
fn test_dotfile_directories_ignored() {
    let tmp = TempDir::new().unwrap();
    let projects_dir = tmp.path().join("projects");
    let db_path = tmp.path().join("test.db");
    write_session(&projects_dir, ".hidden", "sess-1.jsonl", &linear_session());

    let report = run(&projects_dir, &db_path);
    assert_eq!(report.branches_written, 0);
}
