use std::collections::{HashMap, HashSet};

use crate::models::LogRecord;

use super::parser;

/// Recursion cap for the user-descendant test. Subtrees deeper than this are
/// treated as having no user descendant rather than risking the call stack.
const MAX_DESCENT_DEPTH: u32 = 100;

/// One reconstructed conversation branch.
#[derive(Debug)]
pub struct DetectedBranch {
    /// UUID of the last record on this branch.
    pub leaf_uuid: String,
    /// Every UUID on this branch's path, including the prefix shared with
    /// the active branch.
    pub uuids: HashSet<String>,
    /// UUID where this branch diverged from the active path. None for the
    /// active branch.
    pub fork_point_uuid: Option<String>,
    pub is_active: bool,
}

/// Reconstruct the active branch and any abandoned branches from the
/// parent-pointer graph of one session file.
///
/// The logs never mark branches explicitly; a rewind shows up as a second
/// child appearing under an ancestor of the old leaf. The active branch runs
/// from the globally-latest record back to the root. Each extra child under
/// an active-path node whose subtree carries at least one user record is a
/// real rewind; children without user descendants are tool-call side records
/// and are ignored.
///
/// The active branch is always first; abandoned branches follow sorted by
/// leaf UUID so re-imports see an identical sequence.
pub fn detect_branches(graph: &[&LogRecord]) -> Vec<DetectedBranch> {
    let mut record_by_uuid: HashMap<&str, &LogRecord> = HashMap::new();
    let mut parent_of: HashMap<&str, Option<&str>> = HashMap::new();
    let mut children_of: HashMap<&str, Vec<&str>> = HashMap::new();

    for &record in graph {
        let Some(uuid) = record.uuid.as_deref() else {
            continue;
        };
        record_by_uuid.insert(uuid, record);
        let parent = record.parent_uuid.as_deref();
        parent_of.insert(uuid, parent);
        if let Some(p) = parent {
            children_of.entry(p).or_default().push(uuid);
        }
    }

    // Active branch: walk from the latest record back to the root. Ties on
    // the maximum timestamp go to whichever record was seen first.
    let mut latest: Option<&LogRecord> = None;
    for &record in graph {
        if record.uuid.is_none() {
            continue;
        }
        let newer = match latest {
            None => true,
            Some(cur) => record.timestamp_key() > cur.timestamp_key(),
        };
        if newer {
            latest = Some(record);
        }
    }
    let Some(active_leaf) = latest.and_then(|r| r.uuid.as_deref()) else {
        return Vec::new();
    };

    let active_uuids = ancestors_inclusive(active_leaf, &parent_of);

    let mut branches = vec![DetectedBranch {
        leaf_uuid: active_leaf.to_string(),
        uuids: active_uuids.iter().map(|s| s.to_string()).collect(),
        fork_point_uuid: None,
        is_active: true,
    }];

    // Rewind forks: active-path nodes with more than one child.
    let mut abandoned = Vec::new();
    for uuid in &active_uuids {
        let Some(kids) = children_of.get(uuid.as_str()) else {
            continue;
        };
        if kids.len() <= 1 {
            continue;
        }

        for &kid in kids {
            if active_uuids.contains(kid) {
                continue;
            }
            if !has_user_descendant(kid, &record_by_uuid, &children_of, 0) {
                continue;
            }

            let prefix = ancestors_inclusive(uuid, &parent_of);
            let subtree = collect_subtree(kid, &children_of);

            let leaf_uuid = subtree
                .iter()
                .filter_map(|u| record_by_uuid.get(u.as_str()))
                .max_by(|a, b| {
                    a.timestamp_key()
                        .cmp(b.timestamp_key())
                        .then_with(|| a.uuid.cmp(&b.uuid))
                })
                .and_then(|r| r.uuid.clone());
            let Some(leaf_uuid) = leaf_uuid else {
                continue;
            };

            let mut uuids = prefix;
            uuids.extend(subtree);

            abandoned.push(DetectedBranch {
                leaf_uuid,
                uuids,
                fork_point_uuid: Some(uuid.clone()),
                is_active: false,
            });
        }
    }

    abandoned.sort_by(|a, b| a.leaf_uuid.cmp(&b.leaf_uuid));
    branches.extend(abandoned);
    branches
}

/// Walk parent pointers from `start` to the root, returning every UUID on
/// the way (including `start` and a final unresolvable parent, if any).
fn ancestors_inclusive(start: &str, parent_of: &HashMap<&str, Option<&str>>) -> HashSet<String> {
    let mut out = HashSet::new();
    let mut current = Some(start);
    while let Some(uuid) = current {
        out.insert(uuid.to_string());
        current = parent_of.get(uuid).copied().flatten();
    }
    out
}

fn collect_subtree(root: &str, children_of: &HashMap<&str, Vec<&str>>) -> HashSet<String> {
    let mut out = HashSet::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if !out.insert(node.to_string()) {
            continue;
        }
        if let Some(kids) = children_of.get(node) {
            stack.extend(kids.iter().copied());
        }
    }
    out
}

fn has_user_descendant(
    uuid: &str,
    record_by_uuid: &HashMap<&str, &LogRecord>,
    children_of: &HashMap<&str, Vec<&str>>,
    depth: u32,
) -> bool {
    if depth > MAX_DESCENT_DEPTH {
        return false;
    }
    if record_by_uuid.get(uuid).is_some_and(|r| r.is_user()) {
        return true;
    }
    children_of
        .get(uuid)
        .into_iter()
        .flatten()
        .any(|kid| has_user_descendant(kid, record_by_uuid, children_of, depth + 1))
}

// ---------------------------------------------------------------------------
// Per-branch metadata
// ---------------------------------------------------------------------------

/// Metadata computed over the messages of one branch.
#[derive(Debug, Default)]
pub struct BranchStats {
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    /// Number of real user turns (tool-result records excluded).
    pub exchange_count: i64,
    /// Files touched by edit tools, first occurrence order.
    pub files_modified: Vec<String>,
    /// Commit subjects, in order.
    pub commits: Vec<String>,
}

/// Compute branch metadata in one pass over the branch's message records.
/// Callers pass the records in timestamp order.
pub fn branch_stats(records: &[&LogRecord]) -> BranchStats {
    let mut stats = BranchStats::default();
    let mut seen_files: HashSet<String> = HashSet::new();

    for record in records {
        if let Some(ts) = record.timestamp.as_deref() {
            match &stats.started_at {
                Some(s) if ts >= s.as_str() => {}
                _ => stats.started_at = Some(ts.to_string()),
            }
            match &stats.ended_at {
                Some(e) if ts <= e.as_str() => {}
                _ => stats.ended_at = Some(ts.to_string()),
            }
        }

        let content = record.message.as_ref().and_then(|m| m.content.as_ref());

        if record.is_user() {
            if !parser::is_tool_result(content) {
                stats.exchange_count += 1;
            }
        } else if record.is_assistant() {
            for file in parser::files_modified(content) {
                if seen_files.insert(file.clone()) {
                    stats.files_modified.push(file);
                }
            }
            stats.commits.extend(parser::commit_subjects(content));
        }
    }

    stats
}
