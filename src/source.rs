//! Event log discovery and line reading.
//!
//! The agent runtime writes one JSONL file per session and renames it when a
//! session is deleted or reset. Renamed files still hold billable usage, so
//! discovery returns them alongside the live files.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};

const JSONL: &str = ".jsonl";
const LOCK_SUFFIX: &str = ".jsonl.lock";
const DELETED_MARKER: &str = ".jsonl.deleted.";
const RESET_MARKER: &str = ".jsonl.reset.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// `<id>.jsonl`
    Live,
    /// `<id>.jsonl.deleted.<stamp>`
    Deleted,
    /// `<id>.jsonl.reset.<stamp>`
    Reset,
    /// `<id>.jsonl.lock`, written while the runtime holds the session open.
    Lock,
}

pub fn classify(path: &Path) -> Option<FileKind> {
    let name = path.file_name()?.to_str()?;
    if name.ends_with(LOCK_SUFFIX) {
        Some(FileKind::Lock)
    } else if name.ends_with(JSONL) {
        Some(FileKind::Live)
    } else if name.contains(DELETED_MARKER) {
        Some(FileKind::Deleted)
    } else if name.contains(RESET_MARKER) {
        Some(FileKind::Reset)
    } else {
        None
    }
}

/// Session id: the file name up to `.jsonl`, for every naming variant.
pub fn session_id_from_path(path: &Path) -> String {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(crate::types::UNKNOWN);
    match name.find(JSONL) {
        Some(idx) if idx > 0 => name[..idx].to_string(),
        _ => name.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub kind: FileKind,
}

/// Result of scanning a source root.
#[derive(Debug, Default)]
pub struct Discovery {
    pub files: Vec<DiscoveredFile>,
    /// The root did not exist. Not an error: the caller sees zero files.
    pub source_absent: bool,
}

/// Every session file under `root` of the given kinds, sorted by path.
fn walk(root: &Path, wanted: &[FileKind]) -> Discovery {
    if !root.exists() {
        debug!(root = %root.display(), "event source absent");
        return Discovery {
            files: Vec::new(),
            source_absent: true,
        };
    }

    let mut files: Vec<DiscoveredFile> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let kind = classify(e.path())?;
            if !wanted.contains(&kind) {
                return None;
            }
            Some(DiscoveredFile {
                path: e.into_path(),
                kind,
            })
        })
        .collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));

    debug!(root = %root.display(), files = files.len(), "discovered event files");
    Discovery {
        files,
        source_absent: false,
    }
}

/// Live, deleted and reset session files under `root`. Lock markers are
/// never returned.
pub fn discover_event_files(root: &Path) -> Discovery {
    walk(root, &[FileKind::Live, FileKind::Deleted, FileKind::Reset])
}

/// Lock markers under `root`.
pub fn discover_lock_markers(root: &Path) -> Discovery {
    walk(root, &[FileKind::Lock])
}

/// Per-file line diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineStats {
    /// Non-blank lines seen.
    pub lines: usize,
    /// Lines that were not a JSON object.
    pub malformed: usize,
    /// The last line had no newline and did not parse: a write in progress.
    pub truncated_tail: bool,
}

impl LineStats {
    pub fn merge(&mut self, other: &LineStats) {
        self.lines += other.lines;
        self.malformed += other.malformed;
        self.truncated_tail |= other.truncated_tail;
    }
}

/// Decode raw file bytes into JSON objects, one per line.
///
/// Invalid UTF-8 is replaced rather than rejected. Lines that are not JSON
/// objects are counted and skipped. An unterminated final line that fails to
/// parse is treated as absent, since the producer may still be writing it.
pub fn parse_json_lines(bytes: &[u8]) -> (Vec<Map<String, Value>>, LineStats) {
    let mut stats = LineStats::default();
    let mut objects = Vec::new();
    let terminated = bytes.last() == Some(&b'\n');
    let segments: Vec<&[u8]> = bytes.split(|b| *b == b'\n').collect();
    let last = segments.len().saturating_sub(1);

    for (idx, raw) in segments.into_iter().enumerate() {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim();
        if line.is_empty() {
            continue;
        }
        stats.lines += 1;

        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => objects.push(map),
            Ok(_) => stats.malformed += 1,
            Err(_) if idx == last && !terminated => stats.truncated_tail = true,
            Err(_) => stats.malformed += 1,
        }
    }

    (objects, stats)
}

/// Read a whole file in one shot and decode its lines. The file handle is
/// closed before decoding starts.
pub fn read_json_lines(path: &Path) -> Result<(Vec<Map<String, Value>>, LineStats)> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::SourceAbsent(path.to_path_buf()))
        }
        Err(e) => return Err(Error::io(path, e)),
    };
    Ok(parse_json_lines(&bytes))
}
