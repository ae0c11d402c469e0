//! Transcript discovery.
//!
//! On register the manager snapshots the project directory; afterwards a
//! session's transcript is the most recently modified qualifying file that
//! (a) was modified past its snapshot mtime (resumed session) or (b) did not
//! exist at snapshot time. In both cases the file must already contain at
//! least one conversational record, and must not be claimed by another live
//! session.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde_json::Value;

/// Sub-agent transcripts carry this file-name prefix and are never claimed.
const SUBAGENT_PREFIX: &str = "agent-";

/// True for regular transcript files: `*.jsonl`, not a sub-agent log.
pub(crate) fn is_transcript_path(path: &Path) -> bool {
    if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
        return false;
    }
    path.file_name()
        .and_then(|s| s.to_str())
        .is_some_and(|name| !name.starts_with(SUBAGENT_PREFIX))
}

/// Snapshot the transcripts already present in a project directory with
/// their modification times. Missing directories snapshot as empty — the
/// runner may create the directory after announcing.
pub(crate) fn snapshot_project_dir(dir: &Path) -> HashMap<PathBuf, SystemTime> {
    let mut snapshot = HashMap::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return snapshot;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !is_transcript_path(&path) {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            if let Ok(mtime) = metadata.modified() {
                snapshot.insert(path, mtime);
            }
        }
    }
    snapshot
}

/// Candidate transcripts for a session, in claim-preference order:
/// resumed files first (modified past their snapshot mtime), then files
/// created after the snapshot; most recently modified first within each
/// group. Files without a conversational record do not qualify yet.
pub(crate) fn candidate_transcripts(
    dir: &Path,
    snapshot: &HashMap<PathBuf, SystemTime>,
) -> Vec<PathBuf> {
    let mut resumed: Vec<(PathBuf, SystemTime)> = Vec::new();
    let mut fresh: Vec<(PathBuf, SystemTime)> = Vec::new();

    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !is_transcript_path(&path) {
            continue;
        }
        let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        match snapshot.get(&path) {
            Some(snap_mtime) => {
                if mtime > *snap_mtime && has_conversation_record(&path) {
                    resumed.push((path, mtime));
                }
            }
            None => {
                if has_conversation_record(&path) {
                    fresh.push((path, mtime));
                }
            }
        }
    }

    resumed.sort_by(|a, b| b.1.cmp(&a.1));
    fresh.sort_by(|a, b| b.1.cmp(&a.1));
    resumed
        .into_iter()
        .chain(fresh)
        .map(|(path, _)| path)
        .collect()
}

/// Whether the file already holds at least one conversational record
/// (`type` of `user` or `assistant`). Unreadable files don't qualify.
pub(crate) fn has_conversation_record(path: &Path) -> bool {
    let Ok(contents) = fs::read_to_string(path) else {
        return false;
    };
    contents.lines().any(|line| {
        let line = line.trim();
        if line.is_empty() {
            return false;
        }
        serde_json::from_str::<Value>(line)
            .ok()
            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from))
            .is_some_and(|t| t == "user" || t == "assistant")
    })
}
