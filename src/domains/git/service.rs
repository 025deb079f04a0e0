use super::parse;
use super::runner::{describe_command, CommandRunner, RunOptions};
use super::types::{
    BranchInfo, CommitDetails, DiffStats, FileChange, FileChanges, FileDiff, GitStatus, LogEntry,
};
use crate::domains::workdir::{AuthorizationGate, GitSession};
use crate::errors::{ArborError, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_LOG_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct GitTimeouts {
    pub local: Duration,
    pub network: Duration,
}

impl Default for GitTimeouts {
    fn default() -> Self {
        Self {
            local: Duration::from_secs(30),
            network: Duration::from_secs(120),
        }
    }
}

/// Git verbs against authorized workdirs. Every call resolves its workdir through
/// the [`AuthorizationGate`]; callers sequence causally dependent operations.
pub struct GitService {
    gate: Arc<AuthorizationGate>,
    runner: Arc<dyn CommandRunner>,
    timeouts: GitTimeouts,
}

fn validate_ref_name(field: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ArborError::invalid_input(field, "must not be empty"));
    }
    if name.starts_with('-') {
        return Err(ArborError::invalid_input(field, "must not start with '-'"));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ArborError::invalid_input(field, "must not contain whitespace"));
    }
    Ok(())
}

fn validate_paths(paths: &[String]) -> Result<()> {
    if paths.is_empty() {
        return Err(ArborError::invalid_input("paths", "at least one path is required"));
    }
    if paths.iter().any(|p| p.is_empty()) {
        return Err(ArborError::invalid_input("paths", "paths must not be empty"));
    }
    Ok(())
}

impl GitService {
    pub fn new(
        gate: Arc<AuthorizationGate>,
        runner: Arc<dyn CommandRunner>,
        timeouts: GitTimeouts,
    ) -> Self {
        Self {
            gate,
            runner,
            timeouts,
        }
    }

    pub fn gate(&self) -> &Arc<AuthorizationGate> {
        &self.gate
    }

    pub(super) fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub(super) fn local_timeout(&self) -> Duration {
        self.timeouts.local
    }

    pub(super) fn session(&self, workdir: &Path) -> Result<Arc<GitSession>> {
        self.gate.session(workdir)
    }

    fn git_options(&self, session: &GitSession, timeout: Duration) -> RunOptions {
        RunOptions::new(timeout)
            .cwd(session.path())
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_OPTIONAL_LOCKS", "0")
            .env("LC_ALL", "C")
    }

    /// Runs git in the session's workdir; a non-zero exit becomes `CommandFailed`.
    pub(super) async fn run_git(
        &self,
        session: &GitSession,
        args: &[&str],
        timeout: Duration,
    ) -> Result<String> {
        let output = self
            .runner
            .run("git", args, &self.git_options(session, timeout))
            .await?;
        if !output.success() {
            let command = describe_command("git", args);
            log::debug!(
                "{command} failed in {} with {:?}: {}",
                session.key,
                output.status,
                output.stderr.trim()
            );
            return Err(ArborError::CommandFailed {
                command,
                exit_code: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn git(&self, workdir: &Path, args: &[&str]) -> Result<String> {
        let session = self.session(workdir)?;
        self.run_git(&session, args, self.timeouts.local).await
    }

    pub async fn status(&self, workdir: &Path) -> Result<GitStatus> {
        let raw = self
            .git(
                workdir,
                &[
                    "status",
                    "--porcelain=v2",
                    "--branch",
                    "-z",
                    "--untracked-files=all",
                ],
            )
            .await?;
        parse::parse_status(&raw)
    }

    pub async fn log(
        &self,
        workdir: &Path,
        max_count: Option<usize>,
        skip: Option<usize>,
    ) -> Result<Vec<LogEntry>> {
        let max_arg = format!("--max-count={}", max_count.unwrap_or(DEFAULT_LOG_LIMIT));
        let skip_arg = format!("--skip={}", skip.unwrap_or(0));
        let result = self
            .git(workdir, &["log", &max_arg, &skip_arg, parse::LOG_FORMAT])
            .await;
        match result {
            Ok(raw) => parse::parse_log(&raw),
            Err(ArborError::CommandFailed { stderr, .. })
                if stderr.contains("does not have any commits yet") =>
            {
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn branches(&self, workdir: &Path) -> Result<Vec<BranchInfo>> {
        let raw = self
            .git(
                workdir,
                &[
                    "for-each-ref",
                    parse::BRANCH_FORMAT,
                    "refs/heads",
                    "refs/remotes",
                ],
            )
            .await?;
        parse::parse_branches(&raw)
    }

    pub async fn create_branch(
        &self,
        workdir: &Path,
        name: &str,
        start_point: Option<&str>,
    ) -> Result<()> {
        validate_ref_name("name", name)?;
        let mut args = vec!["branch", name];
        if let Some(start) = start_point {
            validate_ref_name("startPoint", start)?;
            args.push(start);
        }
        self.git(workdir, &args).await.map(|_| ())
    }

    pub async fn checkout(&self, workdir: &Path, branch: &str) -> Result<()> {
        validate_ref_name("branch", branch)?;
        self.git(workdir, &["checkout", branch]).await.map(|_| ())
    }

    /// Commits `files` (or the whole index when empty) and returns the new HEAD hash.
    pub async fn commit(&self, workdir: &Path, message: &str, files: &[String]) -> Result<String> {
        if message.trim().is_empty() {
            return Err(ArborError::invalid_input("message", "commit message must not be empty"));
        }
        let session = self.session(workdir)?;
        let mut args = vec!["commit", "-m", message];
        if !files.is_empty() {
            args.push("--");
            args.extend(files.iter().map(String::as_str));
        }
        self.run_git(&session, &args, self.timeouts.local).await?;
        let head = self
            .run_git(&session, &["rev-parse", "HEAD"], self.timeouts.local)
            .await?;
        let hash = head.trim();
        if hash.is_empty() {
            return Err(ArborError::parse("git rev-parse HEAD", "empty commit hash", head.as_str()));
        }
        log::info!("Committed {hash} in {}", session.key);
        Ok(hash.to_string())
    }

    async fn sync(
        &self,
        verb: &'static str,
        workdir: &Path,
        remote: Option<&str>,
        branch: Option<&str>,
    ) -> Result<()> {
        let session = self.session(workdir)?;
        let mut args = vec![verb];
        if let Some(remote) = remote {
            validate_ref_name("remote", remote)?;
            args.push(remote);
            if let Some(branch) = branch {
                validate_ref_name("branch", branch)?;
                args.push(branch);
            }
        } else if branch.is_some() {
            return Err(ArborError::invalid_input("remote", "required when a branch is given"));
        }
        self.run_git(&session, &args, self.timeouts.network)
            .await
            .map(|_| ())
    }

    pub async fn push(&self, workdir: &Path, remote: Option<&str>, branch: Option<&str>) -> Result<()> {
        self.sync("push", workdir, remote, branch).await
    }

    pub async fn pull(&self, workdir: &Path, remote: Option<&str>, branch: Option<&str>) -> Result<()> {
        self.sync("pull", workdir, remote, branch).await
    }

    pub async fn diff(&self, workdir: &Path, staged: bool) -> Result<Vec<FileDiff>> {
        let mut args = vec![
            "-c",
            "core.quotepath=false",
            "diff",
            "--no-color",
            "--no-ext-diff",
            "--src-prefix=a/",
            "--dst-prefix=b/",
        ];
        if staged {
            args.push("--cached");
        }
        let raw = self.git(workdir, &args).await?;
        parse::parse_unified_diff("git diff", &raw)
    }

    /// Initializes a repository and drops the cached session, since the on-disk
    /// state behind the earlier validation has changed.
    pub async fn init(&self, workdir: &Path) -> Result<()> {
        let key = self.gate.authorize(workdir)?;
        let session = GitSession {
            key: key.clone(),
            created: chrono::Utc::now(),
        };
        self.run_git(&session, &["init"], self.timeouts.local).await?;
        self.gate.invalidate(&key);
        log::info!("Initialized repository in {key}");
        Ok(())
    }

    pub async fn file_changes(&self, workdir: &Path) -> Result<FileChanges> {
        let status = self.status(workdir).await?;
        Ok(FileChanges::from(&status))
    }

    async fn is_untracked(&self, session: &GitSession, path: &str) -> Result<bool> {
        let listed = self
            .run_git(
                session,
                &["ls-files", "--others", "--exclude-standard", "--", path],
                self.timeouts.local,
            )
            .await?;
        Ok(!listed.trim().is_empty())
    }

    pub async fn file_diff(&self, workdir: &Path, path: &str, staged: bool) -> Result<FileDiff> {
        if path.is_empty() {
            return Err(ArborError::invalid_input("path", "must not be empty"));
        }
        let session = self.session(workdir)?;
        let mut args = vec![
            "-c",
            "core.quotepath=false",
            "diff",
            "--no-color",
            "--no-ext-diff",
            "--src-prefix=a/",
            "--dst-prefix=b/",
        ];
        if staged {
            args.push("--cached");
        }
        args.extend(["--", path]);
        let raw = self.run_git(&session, &args, self.timeouts.local).await?;
        let mut files = parse::parse_unified_diff("git diff", &raw)?;

        if files.is_empty() && !staged && self.is_untracked(&session, path).await? {
            // --no-index exits 1 when the files differ, which is the expected case
            let no_index = [
                "diff",
                "--no-color",
                "--no-ext-diff",
                "--src-prefix=a/",
                "--dst-prefix=b/",
                "--no-index",
                "--",
                "/dev/null",
                path,
            ];
            let output = self
                .runner
                .run(
                    "git",
                    &no_index,
                    &self.git_options(&session, self.timeouts.local),
                )
                .await?;
            if output.status != Some(0) && output.status != Some(1) {
                return Err(ArborError::CommandFailed {
                    command: describe_command("git", &no_index),
                    exit_code: output.status,
                    stderr: output.stderr.trim().to_string(),
                });
            }
            files = parse::parse_unified_diff("git diff --no-index", &output.stdout)?;
            for file in &mut files {
                file.path = path.to_string();
            }
        }

        Ok(files.into_iter().next().unwrap_or_else(|| FileDiff {
            path: path.to_string(),
            ..FileDiff::default()
        }))
    }

    pub async fn stage(&self, workdir: &Path, paths: &[String]) -> Result<()> {
        validate_paths(paths)?;
        let mut args = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.git(workdir, &args).await.map(|_| ())
    }

    pub async fn unstage(&self, workdir: &Path, paths: &[String]) -> Result<()> {
        validate_paths(paths)?;
        let session = self.session(workdir)?;
        let has_head = self
            .run_git(
                &session,
                &["rev-parse", "--verify", "--quiet", "HEAD"],
                self.timeouts.local,
            )
            .await
            .is_ok();
        let mut args = if has_head {
            vec!["restore", "--staged", "--"]
        } else {
            vec!["rm", "--cached", "-r", "--quiet", "--"]
        };
        args.extend(paths.iter().map(String::as_str));
        self.run_git(&session, &args, self.timeouts.local)
            .await
            .map(|_| ())
    }

    /// Drops worktree changes to `path`; untracked files are deleted.
    pub async fn discard(&self, workdir: &Path, path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(ArborError::invalid_input("path", "must not be empty"));
        }
        let session = self.session(workdir)?;
        if self.is_untracked(&session, path).await? {
            log::info!("Discarding untracked file {path} in {}", session.key);
            self.run_git(&session, &["clean", "-f", "--", path], self.timeouts.local)
                .await?;
        } else {
            log::info!("Discarding changes to {path} in {}", session.key);
            self.run_git(
                &session,
                &["restore", "--worktree", "--", path],
                self.timeouts.local,
            )
            .await?;
        }
        Ok(())
    }

    pub async fn show_commit(&self, workdir: &Path, hash: &str) -> Result<CommitDetails> {
        validate_ref_name("hash", hash)?;
        let session = self.session(workdir)?;
        let header = self
            .run_git(
                &session,
                &["show", "-s", "--no-color", parse::LOG_FORMAT, hash],
                self.timeouts.local,
            )
            .await?;
        let entry = parse::parse_log(&header)?.into_iter().next().ok_or_else(|| {
            ArborError::parse("git show", "no commit header in output", header.as_str())
        })?;
        let body = self
            .run_git(
                &session,
                &["show", "-s", "--no-color", "--format=%b", hash],
                self.timeouts.local,
            )
            .await?;
        let files = self.commit_files_in(&session, hash).await?;
        Ok(CommitDetails {
            entry,
            body: body.trim_end().to_string(),
            files,
        })
    }

    async fn commit_files_in(&self, session: &GitSession, hash: &str) -> Result<Vec<FileChange>> {
        let raw = self
            .run_git(
                session,
                &[
                    "diff-tree",
                    "--no-commit-id",
                    "-r",
                    "--name-status",
                    "-z",
                    "-M",
                    "--root",
                    hash,
                ],
                self.timeouts.local,
            )
            .await?;
        parse::parse_name_status(&raw)
    }

    pub async fn commit_files(&self, workdir: &Path, hash: &str) -> Result<Vec<FileChange>> {
        validate_ref_name("hash", hash)?;
        let session = self.session(workdir)?;
        self.commit_files_in(&session, hash).await
    }

    pub async fn commit_diff(&self, workdir: &Path, hash: &str, path: &str) -> Result<FileDiff> {
        validate_ref_name("hash", hash)?;
        if path.is_empty() {
            return Err(ArborError::invalid_input("path", "must not be empty"));
        }
        let raw = self
            .git(
                workdir,
                &[
                    "-c",
                    "core.quotepath=false",
                    "show",
                    "--no-color",
                    "--no-ext-diff",
                    "--src-prefix=a/",
                    "--dst-prefix=b/",
                    "--format=",
                    "-M",
                    hash,
                    "--",
                    path,
                ],
            )
            .await?;
        let files = parse::parse_unified_diff("git show", &raw)?;
        Ok(files.into_iter().next().unwrap_or_else(|| FileDiff {
            path: path.to_string(),
            ..FileDiff::default()
        }))
    }

    pub async fn diff_stats(&self, workdir: &Path) -> Result<DiffStats> {
        let session = self.session(workdir)?;
        let unstaged = self
            .run_git(&session, &["diff", "--numstat"], self.timeouts.local)
            .await?;
        let staged = self
            .run_git(
                &session,
                &["diff", "--cached", "--numstat"],
                self.timeouts.local,
            )
            .await?;
        let mut stats = parse::parse_numstat(&unstaged)?;
        stats += parse::parse_numstat(&staged)?;
        Ok(stats)
    }
}
