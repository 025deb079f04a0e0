//! Commit message suggestions from the local `claude` CLI.
//!
//! Context gathering is best effort: every git probe runs with a short timeout and a
//! failure simply contributes nothing to the prompt. Generation failures are reported
//! in the returned [`CommitMessageResult`], never as an `Err`.

use super::runner::RunOptions;
use super::service::GitService;
use super::types::{CommitMessageOptions, CommitMessageResult};
use crate::domains::workdir::GitSession;
use crate::errors::{ArborError, Result};
use crate::shared::path_env;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const CONTEXT_TIMEOUT: Duration = Duration::from_secs(5);
const AGENT_PROGRAM: &str = "claude";
const DEFAULT_MODEL: &str = "haiku";

#[derive(Debug, Default)]
struct ChangeContext {
    recent_subjects: String,
    diff_stat: String,
    diff: String,
}

#[derive(Deserialize)]
struct AgentResponse {
    #[serde(rename = "type")]
    kind: Option<String>,
    subtype: Option<String>,
    result: Option<String>,
    error: Option<String>,
}

fn truncate_lines(text: &str, max_lines: usize) -> String {
    text.lines().take(max_lines).collect::<Vec<_>>().join("\n")
}

fn join_non_empty(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
}

fn or_placeholder<'a>(text: &'a str, placeholder: &'a str) -> &'a str {
    if text.is_empty() {
        placeholder
    } else {
        text
    }
}

fn build_prompt(context: &ChangeContext) -> String {
    format!(
        "You cannot call any tools; this message already contains everything you need. \
Do not explain anything. Reply with one short commit message only.\n\n\
Match the style of these recent commits:\n{}\n\n\
Change summary:\n{}\n\n\
Change details:\n{}",
        or_placeholder(&context.recent_subjects, "(no recent commits)"),
        or_placeholder(&context.diff_stat, "(no stats)"),
        or_placeholder(&context.diff, "(no changes detected)"),
    )
}

fn interpret_response(stdout: &str) -> CommitMessageResult {
    let Ok(response) = serde_json::from_str::<AgentResponse>(stdout.trim()) else {
        return CommitMessageResult::failed("Failed to parse response");
    };
    let message = response
        .result
        .as_deref()
        .map(str::trim)
        .filter(|message| !message.is_empty());
    match (response.kind.as_deref(), response.subtype.as_deref(), message) {
        (Some("result"), Some("success"), Some(message)) => CommitMessageResult::ok(message.to_string()),
        _ => CommitMessageResult::failed(response.error.unwrap_or_else(|| "Unknown error".to_string())),
    }
}

impl GitService {
    async fn probe(&self, session: &GitSession, args: &[&str]) -> String {
        match self.run_git(session, args, CONTEXT_TIMEOUT).await {
            Ok(output) => output.trim().to_string(),
            Err(err) => {
                log::debug!("Commit message context probe failed: {err}");
                String::new()
            }
        }
    }

    async fn change_context(&self, session: &GitSession, max_diff_lines: usize) -> ChangeContext {
        let recent_subjects = self
            .probe(session, &["--no-pager", "log", "-5", "--format=%s"])
            .await;
        let staged_stat = self
            .probe(session, &["--no-pager", "diff", "--cached", "--stat"])
            .await;
        let unstaged_stat = self.probe(session, &["--no-pager", "diff", "--stat"]).await;
        let staged_diff = self
            .probe(session, &["--no-pager", "diff", "--no-color", "--cached"])
            .await;
        let unstaged_diff = self
            .probe(session, &["--no-pager", "diff", "--no-color"])
            .await;

        ChangeContext {
            recent_subjects,
            diff_stat: join_non_empty(&[&staged_stat, &unstaged_stat]),
            diff: truncate_lines(
                &join_non_empty(&[&staged_diff, &truncate_lines(&unstaged_diff, max_diff_lines)]),
                max_diff_lines,
            ),
        }
    }

    /// Asks the agent CLI for a one-line commit message describing the pending changes.
    /// Only an unauthorized workdir is an `Err`; everything else lands in the result.
    pub async fn generate_commit_message(
        &self,
        workdir: &Path,
        options: &CommitMessageOptions,
    ) -> Result<CommitMessageResult> {
        let session = self.session(workdir)?;
        let context = self.change_context(&session, options.max_diff_lines).await;
        let prompt = build_prompt(&context);

        let program = path_env::resolve_executable(AGENT_PROGRAM)
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_else(|| AGENT_PROGRAM.to_string());
        let model = options.model.as_deref().unwrap_or(DEFAULT_MODEL);
        let args = [
            "-p",
            "--output-format",
            "json",
            "--no-session-persistence",
            "--tools",
            "",
            "--model",
            model,
        ];
        let run_options = RunOptions::new(Duration::from_secs(options.timeout_secs.max(1)))
            .cwd(session.path())
            .env("PATH", path_env::enriched_path().to_string_lossy())
            .stdin(prompt);

        log::info!("Generating commit message in {} with model {model}", session.key);
        let output = match self.runner().run(&program, &args, &run_options).await {
            Ok(output) => output,
            Err(ArborError::Timeout { .. }) => return Ok(CommitMessageResult::failed("timeout")),
            Err(ArborError::SpawnError { message, .. }) => {
                return Ok(CommitMessageResult::failed(message))
            }
            Err(err) => return Ok(CommitMessageResult::failed(err.to_string())),
        };

        if !output.success() {
            let stderr = output.stderr.trim();
            let error = if stderr.is_empty() {
                match output.status {
                    Some(code) => format!("Exit code: {code}"),
                    None => "Exit code: terminated by signal".to_string(),
                }
            } else {
                stderr.to_string()
            };
            log::warn!("Commit message generation failed: {error}");
            return Ok(CommitMessageResult::failed(error));
        }

        Ok(interpret_response(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::git::runner::mock::MockRunner;
    use crate::domains::git::service::GitTimeouts;
    use crate::domains::workdir::AuthorizationGate;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn service(runner: &MockRunner) -> (GitService, TempDir) {
        let gate = Arc::new(AuthorizationGate::new());
        let dir = TempDir::new().unwrap();
        gate.register(dir.path()).unwrap();
        (
            GitService::new(gate, Arc::new(runner.clone()), GitTimeouts::default()),
            dir,
        )
    }

    fn push_context(runner: &MockRunner) {
        runner.push_ok("Add parser\nFix typo\n");
        runner.push_ok(" src/lib.rs | 2 +-\n");
        runner.push_failure(128, "fatal: not a git repository");
        runner.push_ok("diff --git a/src/lib.rs b/src/lib.rs\n+new\n");
        runner.push_ok("");
    }

    #[tokio::test]
    async fn successful_response_yields_trimmed_message() {
        let runner = MockRunner::default();
        push_context(&runner);
        runner.push_ok(r#"{"type":"result","subtype":"success","result":"  Add parser tests \n"}"#);
        let (service, dir) = service(&runner);

        let result = service
            .generate_commit_message(dir.path(), &CommitMessageOptions::default())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.message.as_deref(), Some("Add parser tests"));

        let calls = runner.calls();
        let agent = calls.last().unwrap();
        assert!(agent.program.ends_with("claude"));
        assert!(agent.args.contains(&"haiku".to_string()));
        let prompt = agent.stdin.as_deref().unwrap();
        assert!(prompt.contains("Add parser\nFix typo"));
        assert!(prompt.contains("src/lib.rs | 2 +-"));
    }

    #[tokio::test]
    async fn agent_failure_is_reported_in_the_result() {
        let runner = MockRunner::default();
        push_context(&runner);
        runner.push_failure(1, "");
        let (service, dir) = service(&runner);

        let result = service
            .generate_commit_message(dir.path(), &CommitMessageOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Exit code: 1"));
    }

    #[tokio::test]
    async fn timeout_is_reported_as_timeout() {
        let runner = MockRunner::default();
        push_context(&runner);
        runner.push_response(Err(ArborError::Timeout {
            command: "claude".to_string(),
            timeout_ms: 1000,
        }));
        let (service, dir) = service(&runner);

        let result = service
            .generate_commit_message(dir.path(), &CommitMessageOptions::default())
            .await
            .unwrap();
        assert_eq!(result.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn response_interpretation() {
        assert!(!interpret_response("not json").success);
        assert_eq!(
            interpret_response(r#"{"type":"result","subtype":"error","error":"quota"}"#).error,
            Some("quota".to_string())
        );
        assert_eq!(
            interpret_response(r#"{"type":"result","subtype":"success","result":""}"#).error,
            Some("Unknown error".to_string())
        );
    }

    #[test]
    fn prompt_uses_placeholders_for_missing_context() {
        let prompt = build_prompt(&ChangeContext::default());
        assert!(prompt.contains("(no recent commits)"));
        assert!(prompt.contains("(no stats)"));
        assert!(prompt.contains("(no changes detected)"));
    }

    #[test]
    fn diff_is_truncated_to_line_budget() {
        assert_eq!(truncate_lines("a\nb\nc\nd", 2), "a\nb");
    }
}
