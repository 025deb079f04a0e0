//! Parsers from git porcelain and plumbing output into the shared data shapes.
//!
//! Every parser is strict: unexpected input is a `ParseError` carrying the raw text,
//! never a silently shortened result.

use super::types::{
    BranchInfo, ChangeKind, DiffHunk, DiffLine, DiffLineKind, DiffStats, FileChange, FileDiff,
    GitStatus, LogEntry, StatusEntry, Worktree,
};
use crate::errors::{ArborError, Result};

pub const LOG_FORMAT: &str = "--format=%H%x1f%h%x1f%an%x1f%ae%x1f%at%x1f%s%x1f%D%x1e";
pub const BRANCH_FORMAT: &str =
    "--format=%(HEAD)%1f%(refname)%1f%(refname:short)%1f%(objectname)%1f%(upstream:short)";

const FIELD_SEP: char = '\x1f';
const RECORD_SEP: char = '\x1e';

fn status_pair(command: &str, xy: &str, raw: &str) -> Result<(Option<ChangeKind>, Option<ChangeKind>)> {
    let mut chars = xy.chars();
    let (Some(x), Some(y), None) = (chars.next(), chars.next(), chars.next()) else {
        return Err(ArborError::parse(command, format!("invalid status code '{xy}'"), raw));
    };
    let staged = ChangeKind::from_status_char(x)
        .ok_or_else(|| ArborError::parse(command, format!("unknown status '{x}'"), raw))?;
    let unstaged = ChangeKind::from_status_char(y)
        .ok_or_else(|| ArborError::parse(command, format!("unknown status '{y}'"), raw))?;
    Ok((staged, unstaged))
}

/// Parses `git status --porcelain=v2 --branch -z`.
pub fn parse_status(raw: &str) -> Result<GitStatus> {
    const CMD: &str = "git status";
    let mut status = GitStatus::default();
    let mut records = raw.split('\0').filter(|record| !record.is_empty());

    while let Some(record) = records.next() {
        if let Some(header) = record.strip_prefix("# ") {
            let (key, value) = header.split_once(' ').unwrap_or((header, ""));
            match key {
                "branch.oid" if value != "(initial)" => status.head = Some(value.to_string()),
                "branch.head" if value != "(detached)" => status.branch = Some(value.to_string()),
                "branch.upstream" => status.tracking = Some(value.to_string()),
                "branch.ab" => {
                    let mut counts = value.split(' ');
                    let ahead = counts.next().and_then(|a| a.strip_prefix('+'));
                    let behind = counts.next().and_then(|b| b.strip_prefix('-'));
                    match (
                        ahead.and_then(|a| a.parse().ok()),
                        behind.and_then(|b| b.parse().ok()),
                    ) {
                        (Some(a), Some(b)) => {
                            status.ahead = a;
                            status.behind = b;
                        }
                        _ => {
                            return Err(ArborError::parse(
                                CMD,
                                format!("invalid ahead/behind header '{value}'"),
                                raw,
                            ))
                        }
                    }
                }
                _ => {}
            }
            continue;
        }

        let kind = record.as_bytes()[0];
        match kind {
            b'1' => {
                let fields: Vec<&str> = record.splitn(9, ' ').collect();
                if fields.len() != 9 {
                    return Err(ArborError::parse(CMD, "truncated ordinary entry", raw));
                }
                let (staged, unstaged) = status_pair(CMD, fields[1], raw)?;
                status.entries.push(StatusEntry {
                    path: fields[8].to_string(),
                    original_path: None,
                    staged,
                    unstaged,
                });
            }
            b'2' => {
                let fields: Vec<&str> = record.splitn(10, ' ').collect();
                if fields.len() != 10 {
                    return Err(ArborError::parse(CMD, "truncated rename entry", raw));
                }
                let original = records
                    .next()
                    .ok_or_else(|| ArborError::parse(CMD, "rename entry without source path", raw))?;
                let (staged, unstaged) = status_pair(CMD, fields[1], raw)?;
                status.entries.push(StatusEntry {
                    path: fields[9].to_string(),
                    original_path: Some(original.to_string()),
                    staged,
                    unstaged,
                });
            }
            b'u' => {
                let fields: Vec<&str> = record.splitn(11, ' ').collect();
                if fields.len() != 11 {
                    return Err(ArborError::parse(CMD, "truncated unmerged entry", raw));
                }
                status.entries.push(StatusEntry {
                    path: fields[10].to_string(),
                    original_path: None,
                    staged: Some(ChangeKind::Unmerged),
                    unstaged: Some(ChangeKind::Unmerged),
                });
            }
            b'?' => {
                let path = record
                    .strip_prefix("? ")
                    .ok_or_else(|| ArborError::parse(CMD, "invalid untracked entry", raw))?;
                status.entries.push(StatusEntry {
                    path: path.to_string(),
                    original_path: None,
                    staged: None,
                    unstaged: Some(ChangeKind::Untracked),
                });
            }
            b'!' => {}
            _ => {
                return Err(ArborError::parse(
                    CMD,
                    format!("unexpected status record '{record}'"),
                    raw,
                ))
            }
        }
    }

    Ok(status)
}

/// Parses `git log` output produced with [`LOG_FORMAT`].
pub fn parse_log(raw: &str) -> Result<Vec<LogEntry>> {
    const CMD: &str = "git log";
    let mut entries = Vec::new();
    for record in raw.split(RECORD_SEP) {
        let record = record.trim_start_matches(['\n', '\r']);
        if record.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = record.split(FIELD_SEP).collect();
        if fields.len() != 7 {
            return Err(ArborError::parse(
                CMD,
                format!("expected 7 fields, found {}", fields.len()),
                raw,
            ));
        }
        let timestamp = fields[4]
            .parse::<i64>()
            .map_err(|_| ArborError::parse(CMD, format!("invalid timestamp '{}'", fields[4]), raw))?;
        entries.push(LogEntry {
            hash: fields[0].to_string(),
            short_hash: fields[1].to_string(),
            author_name: fields[2].to_string(),
            author_email: fields[3].to_string(),
            timestamp,
            subject: fields[5].to_string(),
            refs: fields[6]
                .split(", ")
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect(),
        });
    }
    Ok(entries)
}

/// Parses `git for-each-ref` output produced with [`BRANCH_FORMAT`].
pub fn parse_branches(raw: &str) -> Result<Vec<BranchInfo>> {
    const CMD: &str = "git for-each-ref";
    let mut branches = Vec::new();
    for line in raw.lines().filter(|line| !line.trim().is_empty()) {
        let fields: Vec<&str> = line.split(FIELD_SEP).collect();
        if fields.len() != 5 {
            return Err(ArborError::parse(
                CMD,
                format!("expected 5 fields, found {}", fields.len()),
                raw,
            ));
        }
        let refname = fields[1];
        let is_remote = refname.starts_with("refs/remotes/");
        if is_remote && refname.ends_with("/HEAD") {
            continue;
        }
        branches.push(BranchInfo {
            name: fields[2].to_string(),
            commit: fields[3].to_string(),
            is_current: fields[0] == "*",
            is_remote,
            upstream: Some(fields[4]).filter(|u| !u.is_empty()).map(str::to_string),
        });
    }
    Ok(branches)
}

fn parse_range(text: &str) -> Option<(u32, u32)> {
    match text.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((text.parse().ok()?, 1)),
    }
}

/// Parses `@@ -a,b +c,d @@` and the combined form `@@@ -a,b -c,d +e,f @@@`.
/// Returns the hunk and the number of parents it compares against.
fn parse_hunk_header(line: &str) -> Option<(DiffHunk, usize)> {
    let marker_len = line.bytes().take_while(|&b| b == b'@').count();
    if marker_len < 2 {
        return None;
    }
    let parents = marker_len - 1;
    let marker = &line[..marker_len];
    let rest = line[marker_len..].strip_prefix(' ')?;
    let (ranges, _) = rest.split_once(&format!(" {marker}"))?;
    let ranges: Vec<&str> = ranges.split_whitespace().collect();
    if ranges.len() != parents + 1 {
        return None;
    }
    let (old_start, old_lines) = parse_range(ranges[0].strip_prefix('-')?)?;
    for other in &ranges[1..parents] {
        parse_range(other.strip_prefix('-')?)?;
    }
    let (new_start, new_lines) = parse_range(ranges[parents].strip_prefix('+')?)?;
    Some((
        DiffHunk {
            header: line.to_string(),
            old_start,
            old_lines,
            new_start,
            new_lines,
            lines: Vec::new(),
        },
        parents,
    ))
}

/// Best guess at the path from a `diff --git a/x b/x` header. The `---`/`+++` lines
/// that follow replace it when present.
fn path_from_header(line: &str) -> Option<String> {
    if let Some(path) = line
        .strip_prefix("diff --cc ")
        .or_else(|| line.strip_prefix("diff --combined "))
    {
        return Some(path.to_string());
    }
    let rest = line.strip_prefix("diff --git ")?;
    // Unrenamed files repeat the same path on both sides, so an even split is exact
    // even when the path itself contains " b/".
    if let Some(a_side) = rest.strip_prefix("a/") {
        if rest.len() >= 5 && (rest.len() - 5) % 2 == 0 {
            let half = (rest.len() - 5) / 2;
            if let (Some(path), Some(b_side)) = (a_side.get(..half), a_side.get(half..)) {
                if b_side.strip_prefix(" b/") == Some(path) {
                    return Some(path.to_string());
                }
            }
        }
    }
    let (_, b_side) = rest.rsplit_once(" b/")?;
    Some(b_side.to_string())
}

fn is_file_header(line: &str) -> bool {
    line.starts_with("diff --git ")
        || line.starts_with("diff --cc ")
        || line.starts_with("diff --combined ")
}

struct HunkCursor {
    parents: usize,
    old_remaining: u32,
    new_remaining: u32,
    old_line: u32,
    new_line: u32,
}

/// Parses unified diff output (`git diff`, `git show`) into per-file hunks. Combined
/// diffs of unmerged paths are accepted and flagged as conflicted; line numbers on the
/// old side follow the first parent.
pub fn parse_unified_diff(command: &str, raw: &str) -> Result<Vec<FileDiff>> {
    let mut files: Vec<FileDiff> = Vec::new();
    let mut cursor: Option<HunkCursor> = None;

    let finish_hunk = |cursor: &Option<HunkCursor>| -> Result<()> {
        match cursor {
            Some(c) if c.old_remaining != 0 || c.new_remaining != 0 => {
                Err(ArborError::parse(command, "hunk ended before its declared length", raw))
            }
            _ => Ok(()),
        }
    };

    for line in raw.lines() {
        if is_file_header(line) {
            finish_hunk(&cursor)?;
            cursor = None;
            let path = path_from_header(line)
                .ok_or_else(|| ArborError::parse(command, format!("invalid header '{line}'"), raw))?;
            files.push(FileDiff {
                path,
                is_conflicted: !line.starts_with("diff --git "),
                ..FileDiff::default()
            });
            continue;
        }

        let Some(file) = files.last_mut() else {
            if line.trim().is_empty() {
                continue;
            }
            return Err(ArborError::parse(
                command,
                format!("unexpected line before first file header '{line}'"),
                raw,
            ));
        };

        if line.starts_with("@@") {
            finish_hunk(&cursor)?;
            let (hunk, parents) = parse_hunk_header(line).ok_or_else(|| {
                ArborError::parse(command, format!("invalid hunk header '{line}'"), raw)
            })?;
            cursor = Some(HunkCursor {
                parents,
                old_remaining: hunk.old_lines,
                new_remaining: hunk.new_lines,
                old_line: hunk.old_start,
                new_line: hunk.new_start,
            });
            file.hunks.push(hunk);
            continue;
        }

        match cursor.as_mut() {
            Some(c) if c.old_remaining > 0 || c.new_remaining > 0 => {
                if line.starts_with('\\') {
                    continue;
                }
                let Some(hunk) = file.hunks.last_mut() else {
                    return Err(ArborError::parse(command, "hunk line without hunk", raw));
                };
                // One marker column per parent; an empty line is blank context.
                let (markers, content) = if line.is_empty() {
                    ("", "")
                } else {
                    match line.get(..c.parents) {
                        Some(markers) if markers.bytes().all(|b| matches!(b, b' ' | b'+' | b'-')) => {
                            (markers, &line[c.parents..])
                        }
                        _ => {
                            return Err(ArborError::parse(
                                command,
                                format!("unexpected hunk line '{line}'"),
                                raw,
                            ))
                        }
                    }
                };
                let in_new = !markers.contains('-');
                let in_old = !markers.starts_with('+');
                let kind = if markers.trim().is_empty() {
                    DiffLineKind::Context
                } else if in_new {
                    DiffLineKind::Addition
                } else {
                    DiffLineKind::Deletion
                };
                let old_line = in_old.then(|| {
                    c.old_remaining = c.old_remaining.saturating_sub(1);
                    c.old_line += 1;
                    c.old_line - 1
                });
                let new_line = in_new.then(|| {
                    c.new_remaining = c.new_remaining.saturating_sub(1);
                    c.new_line += 1;
                    c.new_line - 1
                });
                hunk.lines.push(DiffLine {
                    kind,
                    content: content.to_string(),
                    old_line,
                    new_line,
                });
            }
            _ => {
                if line.starts_with('\\') {
                    continue;
                }
                if cursor.is_some() {
                    return Err(ArborError::parse(
                        command,
                        format!("unexpected line after hunk '{line}'"),
                        raw,
                    ));
                }
                if let Some(from) = line.strip_prefix("rename from ") {
                    file.old_path = Some(from.to_string());
                } else if let Some(to) = line.strip_prefix("rename to ") {
                    file.path = to.to_string();
                } else if line.starts_with("Binary files ") || line == "GIT binary patch" {
                    file.is_binary = true;
                } else if let Some(target) = line.strip_prefix("+++ ") {
                    if let Some(path) = target.strip_prefix("b/") {
                        file.path = path.to_string();
                    }
                } else if let Some(source) = line.strip_prefix("--- ") {
                    // Deleted files only name the path on this side.
                    if let Some(path) = source.strip_prefix("a/") {
                        if file.old_path.is_none() {
                            file.path = path.to_string();
                        }
                    }
                }
            }
        }
    }

    finish_hunk(&cursor)?;
    Ok(files)
}

/// Parses `git diff --numstat` output.
pub fn parse_numstat(raw: &str) -> Result<DiffStats> {
    const CMD: &str = "git diff --numstat";
    let mut stats = DiffStats::default();
    for line in raw.lines().filter(|line| !line.trim().is_empty()) {
        let mut parts = line.splitn(3, '\t');
        let (Some(added), Some(deleted), Some(_path)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ArborError::parse(CMD, format!("invalid numstat line '{line}'"), raw));
        };
        stats.files_changed += 1;
        if added == "-" && deleted == "-" {
            continue;
        }
        let parse_count = |value: &str| {
            value
                .parse::<u64>()
                .map_err(|_| ArborError::parse(CMD, format!("invalid count '{value}'"), raw))
        };
        stats.insertions += parse_count(added)?;
        stats.deletions += parse_count(deleted)?;
    }
    Ok(stats)
}

/// Parses `git diff-tree --name-status -z` output.
pub fn parse_name_status(raw: &str) -> Result<Vec<FileChange>> {
    const CMD: &str = "git diff-tree";
    let mut tokens = raw.split('\0').filter(|t| !t.is_empty());
    let mut changes = Vec::new();

    while let Some(code) = tokens.next() {
        let letter = code
            .chars()
            .next()
            .ok_or_else(|| ArborError::parse(CMD, "empty status code", raw))?;
        let kind = ChangeKind::from_status_char(letter)
            .flatten()
            .ok_or_else(|| ArborError::parse(CMD, format!("unknown status '{code}'"), raw))?;
        let first = tokens
            .next()
            .ok_or_else(|| ArborError::parse(CMD, "status without path", raw))?;
        let change = if matches!(kind, ChangeKind::Renamed | ChangeKind::Copied) {
            let second = tokens
                .next()
                .ok_or_else(|| ArborError::parse(CMD, "rename without target path", raw))?;
            FileChange {
                path: second.to_string(),
                original_path: Some(first.to_string()),
                kind,
            }
        } else {
            FileChange {
                path: first.to_string(),
                original_path: None,
                kind,
            }
        };
        changes.push(change);
    }
    Ok(changes)
}

/// Parses `git worktree list --porcelain`.
pub fn parse_worktrees(raw: &str) -> Result<Vec<Worktree>> {
    const CMD: &str = "git worktree list";
    let mut worktrees = Vec::new();
    let mut current: Option<Worktree> = None;

    for line in raw.lines() {
        if line.trim().is_empty() {
            if let Some(done) = current.take() {
                worktrees.push(done);
            }
            continue;
        }
        let (key, value) = line.split_once(' ').unwrap_or((line, ""));
        if key == "worktree" {
            if let Some(done) = current.take() {
                worktrees.push(done);
            }
            current = Some(Worktree {
                path: value.to_string(),
                ..Worktree::default()
            });
            continue;
        }
        let Some(worktree) = current.as_mut() else {
            return Err(ArborError::parse(
                CMD,
                format!("attribute '{line}' before worktree line"),
                raw,
            ));
        };
        match key {
            "HEAD" => worktree.head = Some(value.to_string()),
            "branch" => {
                worktree.branch = Some(value.strip_prefix("refs/heads/").unwrap_or(value).to_string())
            }
            "bare" => worktree.is_bare = true,
            "detached" => worktree.is_detached = true,
            "locked" => worktree.locked = true,
            "prunable" => worktree.prunable = true,
            _ => {}
        }
    }
    if let Some(done) = current.take() {
        worktrees.push(done);
    }
    Ok(worktrees)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_headers_and_every_entry_type() {
        let raw = [
            "# branch.oid 1234567890abcdef",
            "# branch.head main",
            "# branch.upstream origin/main",
            "# branch.ab +2 -1",
            "1 M. N... 100644 100644 100644 aaa bbb src/lib.rs",
            "1 .M N... 100644 100644 100644 aaa bbb README with space.md",
            "2 R. N... 100644 100644 100644 aaa bbb R100 new.rs",
            "old.rs",
            "u UU N... 100644 100644 100644 100644 aaa bbb ccc conflict.rs",
            "? notes.txt",
            "",
        ]
        .join("\0");

        let status = parse_status(&raw).unwrap();
        assert_eq!(status.branch.as_deref(), Some("main"));
        assert_eq!(status.tracking.as_deref(), Some("origin/main"));
        assert_eq!((status.ahead, status.behind), (2, 1));
        assert_eq!(status.entries.len(), 5);

        let staged = status.entry("src/lib.rs").unwrap();
        assert_eq!(staged.staged, Some(ChangeKind::Modified));
        assert_eq!(staged.unstaged, None);

        let spaced = status.entry("README with space.md").unwrap();
        assert_eq!(spaced.unstaged, Some(ChangeKind::Modified));

        let renamed = status.entry("new.rs").unwrap();
        assert_eq!(renamed.original_path.as_deref(), Some("old.rs"));
        assert_eq!(renamed.staged, Some(ChangeKind::Renamed));

        assert_eq!(
            status.entry("conflict.rs").unwrap().staged,
            Some(ChangeKind::Unmerged)
        );
        assert_eq!(
            status.entry("notes.txt").unwrap().unstaged,
            Some(ChangeKind::Untracked)
        );
    }

    #[test]
    fn status_on_unborn_branch_has_no_head() {
        let raw = "# branch.oid (initial)\0# branch.head main\0";
        let status = parse_status(raw).unwrap();
        assert!(status.head.is_none());
        assert!(status.is_clean());
    }

    #[test]
    fn status_rejects_garbage() {
        let err = parse_status("fatal: not a git repository\0").unwrap_err();
        match err {
            ArborError::ParseError { raw, .. } => assert!(raw.contains("fatal")),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(parse_status("1 M. N... truncated\0").is_err());
    }

    #[test]
    fn log_parses_records_and_refs() {
        let raw = "abc123\x1fabc\x1fAda\x1fada@example.com\x1f1700000000\x1fInitial commit\x1fHEAD -> main, origin/main\x1e\n\
                   def456\x1fdef\x1fBob\x1fbob@example.com\x1f1700000100\x1fSecond: with\ttab\x1f\x1e\n";
        let entries = parse_log(raw).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].refs, vec!["HEAD -> main", "origin/main"]);
        assert_eq!(entries[1].subject, "Second: with\ttab");
        assert!(entries[1].refs.is_empty());
        assert_eq!(entries[1].timestamp, 1_700_000_100);

        assert!(parse_log("").unwrap().is_empty());
        assert!(parse_log("only\x1ftwo\x1e").is_err());
    }

    #[test]
    fn branches_skip_remote_head_alias() {
        let raw = "*\x1frefs/heads/main\x1fmain\x1faaa\x1forigin/main\n \x1frefs/heads/feature\x1ffeature\x1fbbb\x1f\n \x1frefs/remotes/origin/HEAD\x1forigin\x1faaa\x1f\n \x1frefs/remotes/origin/main\x1forigin/main\x1faaa\x1f\n";
        let branches = parse_branches(raw).unwrap();
        assert_eq!(branches.len(), 3);
        assert!(branches[0].is_current);
        assert_eq!(branches[0].upstream.as_deref(), Some("origin/main"));
        assert!(branches[1].upstream.is_none());
        assert!(branches[2].is_remote);
    }

    #[test]
    fn unified_diff_tracks_line_numbers() {
        let raw = r#"diff --git a/src/a.rs b/src/a.rs
index 111..222 100644
--- a/src/a.rs
+++ b/src/a.rs
@@ -1,3 +1,4 @@ fn main() {
 keep
-old
+new
+added
 tail
\ No newline at end of file
diff --git a/img.png b/img.png
Binary files a/img.png and b/img.png differ
"#;
        let files = parse_unified_diff("git diff", raw).unwrap();
        assert_eq!(files.len(), 2);

        let hunk = &files[0].hunks[0];
        assert_eq!((hunk.old_start, hunk.old_lines, hunk.new_start, hunk.new_lines), (1, 3, 1, 4));
        assert_eq!(hunk.lines.len(), 5);
        assert_eq!(hunk.lines[1].kind, DiffLineKind::Deletion);
        assert_eq!(hunk.lines[1].old_line, Some(2));
        assert_eq!(hunk.lines[3].new_line, Some(3));
        assert_eq!(hunk.lines[4].old_line, Some(3));
        assert_eq!(hunk.lines[4].new_line, Some(4));

        assert!(files[1].is_binary);
        assert!(files[1].hunks.is_empty());
    }

    #[test]
    fn unified_diff_detects_renames_and_truncation() {
        let renamed = "diff --git a/old.txt b/new.txt\nsimilarity index 100%\nrename from old.txt\nrename to new.txt\n";
        let files = parse_unified_diff("git diff", renamed).unwrap();
        assert_eq!(files[0].path, "new.txt");
        assert_eq!(files[0].old_path.as_deref(), Some("old.txt"));

        let truncated = "diff --git a/a b/a\n--- a/a\n+++ b/a\n@@ -1,3 +1,3 @@\n a\n";
        assert!(parse_unified_diff("git diff", truncated).is_err());

        assert!(parse_unified_diff("git diff", "").unwrap().is_empty());
        assert!(parse_unified_diff("git diff", "garbage\n").is_err());
    }

    #[test]
    fn combined_diff_of_unmerged_path_is_flagged_conflicted() {
        let raw = "diff --cc notes.txt
index 1111111,2222222..0000000
--- a/notes.txt
+++ b/notes.txt
@@@ -1,1 -1,1 +1,5 @@@
++<<<<<<< HEAD
 +ours
++=======
+ theirs
++>>>>>>> feature
";
        let files = parse_unified_diff("git diff", raw).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "notes.txt");
        assert!(files[0].is_conflicted);

        let hunk = &files[0].hunks[0];
        assert_eq!((hunk.old_start, hunk.old_lines, hunk.new_start, hunk.new_lines), (1, 1, 1, 5));
        assert_eq!(hunk.lines.len(), 5);
        assert_eq!(hunk.lines[0].content, "<<<<<<< HEAD");
        assert_eq!(hunk.lines[0].old_line, None);
        assert_eq!(hunk.lines[1].content, "ours");
        assert_eq!((hunk.lines[1].old_line, hunk.lines[1].new_line), (Some(1), Some(2)));
        assert_eq!(hunk.lines[4].new_line, Some(5));
        assert!(hunk.lines.iter().all(|l| l.kind == DiffLineKind::Addition));
    }

    #[test]
    fn paths_come_from_file_markers() {
        let spaced = "diff --git a/dir b/x.txt b/dir b/x.txt\n--- a/dir b/x.txt\n+++ b/dir b/x.txt\n@@ -1 +1 @@\n-a\n+b\n";
        let files = parse_unified_diff("git diff", spaced).unwrap();
        assert_eq!(files[0].path, "dir b/x.txt");
        assert!(!files[0].is_conflicted);

        let deleted = "diff --git a/gone.txt b/gone.txt\ndeleted file mode 100644\n--- a/gone.txt\n+++ /dev/null\n@@ -1 +0,0 @@\n-bye\n";
        let files = parse_unified_diff("git diff", deleted).unwrap();
        assert_eq!(files[0].path, "gone.txt");
        assert_eq!(files[0].hunks[0].lines[0].old_line, Some(1));
    }

    #[test]
    fn numstat_counts_text_and_binary_files() {
        let stats = parse_numstat("3\t1\tsrc/a.rs\n-\t-\timg.png\n10\t0\tnew.rs\n").unwrap();
        assert_eq!(
            stats,
            DiffStats {
                files_changed: 3,
                insertions: 13,
                deletions: 1
            }
        );
        assert!(parse_numstat("x\t1\tfile\n").is_err());
        assert!(parse_numstat("nonsense\n").is_err());
    }

    #[test]
    fn name_status_handles_renames() {
        let raw = "M\0src/a.rs\0R100\0old.rs\0new.rs\0A\0added.rs\0";
        let changes = parse_name_status(raw).unwrap();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[1].kind, ChangeKind::Renamed);
        assert_eq!(changes[1].original_path.as_deref(), Some("old.rs"));
        assert_eq!(changes[1].path, "new.rs");
        assert!(parse_name_status("Z\0file\0").is_err());
    }

    #[test]
    fn worktrees_parse_porcelain_blocks() {
        let raw = "worktree /repo\nHEAD aaa\nbranch refs/heads/main\n\nworktree /repo-feature\nHEAD bbb\ndetached\nprunable gitdir file points to non-existent location\n\n";
        let worktrees = parse_worktrees(raw).unwrap();
        assert_eq!(worktrees.len(), 2);
        assert_eq!(worktrees[0].branch.as_deref(), Some("main"));
        assert!(worktrees[1].is_detached);
        assert!(worktrees[1].prunable);
        assert!(parse_worktrees("HEAD aaa\n").is_err());
    }
}
