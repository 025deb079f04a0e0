//! Named request verbs exposed to the presentation layer. Every verb takes plain data
//! and yields plain JSON or an [`ArborError`].

use crate::domains::agents::AgentStartOptions;
use crate::domains::auxiliary::{generate_token, AuxiliaryConfig};
use crate::domains::git::{CommitMessageOptions, WorktreeAddOptions, WorktreeRemoveOptions};
use crate::domains::terminal::TerminalCreateOptions;
use crate::errors::{ArborError, Result};
use crate::infrastructure::config::CustomAgent;
use crate::registry::SessionRegistry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", content = "params", rename_all_fields = "camelCase")]
pub enum Request {
    #[serde(rename = "workdir.register")]
    WorkdirRegister { path: String },
    #[serde(rename = "workdir.unregister")]
    WorkdirUnregister { path: String },
    #[serde(rename = "workdir.authorize")]
    WorkdirAuthorize { path: String },
    #[serde(rename = "workdir.list")]
    WorkdirList,

    #[serde(rename = "git.status")]
    GitStatus { workdir: String },
    #[serde(rename = "git.log")]
    GitLog {
        workdir: String,
        #[serde(default)]
        max_count: Option<usize>,
        #[serde(default)]
        skip: Option<usize>,
    },
    #[serde(rename = "git.branches")]
    GitBranches { workdir: String },
    #[serde(rename = "git.createBranch")]
    GitCreateBranch {
        workdir: String,
        name: String,
        #[serde(default)]
        start_point: Option<String>,
    },
    #[serde(rename = "git.checkout")]
    GitCheckout { workdir: String, branch: String },
    #[serde(rename = "git.commit")]
    GitCommit {
        workdir: String,
        message: String,
        #[serde(default)]
        files: Vec<String>,
    },
    #[serde(rename = "git.push")]
    GitPush {
        workdir: String,
        #[serde(default)]
        remote: Option<String>,
        #[serde(default)]
        branch: Option<String>,
    },
    #[serde(rename = "git.pull")]
    GitPull {
        workdir: String,
        #[serde(default)]
        remote: Option<String>,
        #[serde(default)]
        branch: Option<String>,
    },
    #[serde(rename = "git.diff")]
    GitDiff {
        workdir: String,
        #[serde(default)]
        staged: bool,
    },
    #[serde(rename = "git.init")]
    GitInit { workdir: String },
    #[serde(rename = "git.fileChanges")]
    GitFileChanges { workdir: String },
    #[serde(rename = "git.fileDiff")]
    GitFileDiff {
        workdir: String,
        path: String,
        #[serde(default)]
        staged: bool,
    },
    #[serde(rename = "git.stage")]
    GitStage { workdir: String, paths: Vec<String> },
    #[serde(rename = "git.unstage")]
    GitUnstage { workdir: String, paths: Vec<String> },
    #[serde(rename = "git.discard")]
    GitDiscard { workdir: String, path: String },
    #[serde(rename = "git.show")]
    GitShow { workdir: String, hash: String },
    #[serde(rename = "git.commitFiles")]
    GitCommitFiles { workdir: String, hash: String },
    #[serde(rename = "git.commitDiff")]
    GitCommitDiff {
        workdir: String,
        hash: String,
        path: String,
    },
    #[serde(rename = "git.diffStats")]
    GitDiffStats { workdir: String },
    #[serde(rename = "git.generateCommitMessage")]
    GitGenerateCommitMessage {
        workdir: String,
        #[serde(default)]
        options: CommitMessageOptions,
    },
    #[serde(rename = "git.worktreeList")]
    GitWorktreeList { workdir: String },
    #[serde(rename = "git.worktreeAdd")]
    GitWorktreeAdd {
        workdir: String,
        options: WorktreeAddOptions,
    },
    #[serde(rename = "git.worktreeRemove")]
    GitWorktreeRemove {
        workdir: String,
        options: WorktreeRemoveOptions,
    },

    #[serde(rename = "terminal.create")]
    TerminalCreate {
        #[serde(default)]
        options: TerminalCreateOptions,
    },
    #[serde(rename = "terminal.write")]
    TerminalWrite { session_id: String, data: String },
    #[serde(rename = "terminal.resize")]
    TerminalResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename = "terminal.destroy")]
    TerminalDestroy { session_id: String },
    #[serde(rename = "terminal.snapshot")]
    TerminalSnapshot { session_id: String },
    #[serde(rename = "terminal.exists")]
    TerminalExists { session_id: String },
    #[serde(rename = "terminal.info")]
    TerminalInfo { session_id: String },
    #[serde(rename = "terminal.list")]
    TerminalList,

    #[serde(rename = "agent.detect")]
    AgentDetect {
        #[serde(default)]
        custom: Vec<CustomAgent>,
    },
    #[serde(rename = "agent.detectOne")]
    AgentDetectOne {
        agent_id: String,
        #[serde(default)]
        custom: Option<CustomAgent>,
    },
    #[serde(rename = "agent.refresh")]
    AgentRefresh,
    #[serde(rename = "agent.start")]
    AgentStart { options: AgentStartOptions },
    #[serde(rename = "agent.send")]
    AgentSend { session_id: String, content: String },
    #[serde(rename = "agent.stop")]
    AgentStop { session_id: String },
    #[serde(rename = "agent.status")]
    AgentStatus { session_id: String },
    #[serde(rename = "agent.list")]
    AgentList,

    #[serde(rename = "auxiliary.start")]
    AuxiliaryStart { config: AuxiliaryConfig },
    #[serde(rename = "auxiliary.stop")]
    AuxiliaryStop,
    #[serde(rename = "auxiliary.restart")]
    AuxiliaryRestart { config: AuxiliaryConfig },
    #[serde(rename = "auxiliary.status")]
    AuxiliaryStatus,
    #[serde(rename = "auxiliary.generateToken")]
    AuxiliaryGenerateToken,
}

impl Request {
    /// Parses one request object; a missing `params` is accepted for verbs without
    /// arguments. Transport fields such as `id` are ignored.
    pub fn from_value(mut value: Value) -> Result<Self> {
        if let Value::Object(map) = &mut value {
            map.remove("id");
        }
        Request::deserialize(value).map_err(|e| ArborError::invalid_input("request", e))
    }

    /// Requests feeding one session's input share a lane and must run in arrival order.
    pub fn lane(&self) -> Option<String> {
        match self {
            Request::TerminalWrite { session_id, .. }
            | Request::TerminalResize { session_id, .. }
            | Request::TerminalDestroy { session_id } => Some(format!("terminal:{session_id}")),
            Request::AgentSend { session_id, .. } | Request::AgentStop { session_id } => {
                Some(format!("agent:{session_id}"))
            }
            _ => None,
        }
    }

    /// True for the last request a lane can meaningfully carry.
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            Request::TerminalDestroy { .. } | Request::AgentStop { .. }
        )
    }
}

fn to_json<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| ArborError::invalid_input("response", e))
}

/// Runs one request against the registry.
pub async fn dispatch(registry: &SessionRegistry, request: Request) -> Result<Value> {
    let git = registry.git();
    let terminals = registry.terminals();
    let agents = registry.agents();
    let auxiliary = registry.auxiliary();

    match request {
        Request::WorkdirRegister { path } => to_json(registry.register_workdir(Path::new(&path))?),
        Request::WorkdirUnregister { path } => {
            to_json(registry.unregister_workdir(Path::new(&path))?)
        }
        Request::WorkdirAuthorize { path } => to_json(registry.gate().authorize(Path::new(&path))?),
        Request::WorkdirList => to_json(registry.gate().registered()),

        Request::GitStatus { workdir } => to_json(git.status(Path::new(&workdir)).await?),
        Request::GitLog {
            workdir,
            max_count,
            skip,
        } => to_json(git.log(Path::new(&workdir), max_count, skip).await?),
        Request::GitBranches { workdir } => to_json(git.branches(Path::new(&workdir)).await?),
        Request::GitCreateBranch {
            workdir,
            name,
            start_point,
        } => to_json(
            git.create_branch(Path::new(&workdir), &name, start_point.as_deref())
                .await?,
        ),
        Request::GitCheckout { workdir, branch } => {
            to_json(git.checkout(Path::new(&workdir), &branch).await?)
        }
        Request::GitCommit {
            workdir,
            message,
            files,
        } => to_json(git.commit(Path::new(&workdir), &message, &files).await?),
        Request::GitPush {
            workdir,
            remote,
            branch,
        } => to_json(
            git.push(Path::new(&workdir), remote.as_deref(), branch.as_deref())
                .await?,
        ),
        Request::GitPull {
            workdir,
            remote,
            branch,
        } => to_json(
            git.pull(Path::new(&workdir), remote.as_deref(), branch.as_deref())
                .await?,
        ),
        Request::GitDiff { workdir, staged } => {
            to_json(git.diff(Path::new(&workdir), staged).await?)
        }
        Request::GitInit { workdir } => to_json(git.init(Path::new(&workdir)).await?),
        Request::GitFileChanges { workdir } => {
            to_json(git.file_changes(Path::new(&workdir)).await?)
        }
        Request::GitFileDiff {
            workdir,
            path,
            staged,
        } => to_json(git.file_diff(Path::new(&workdir), &path, staged).await?),
        Request::GitStage { workdir, paths } => {
            to_json(git.stage(Path::new(&workdir), &paths).await?)
        }
        Request::GitUnstage { workdir, paths } => {
            to_json(git.unstage(Path::new(&workdir), &paths).await?)
        }
        Request::GitDiscard { workdir, path } => {
            to_json(git.discard(Path::new(&workdir), &path).await?)
        }
        Request::GitShow { workdir, hash } => {
            to_json(git.show_commit(Path::new(&workdir), &hash).await?)
        }
        Request::GitCommitFiles { workdir, hash } => {
            to_json(git.commit_files(Path::new(&workdir), &hash).await?)
        }
        Request::GitCommitDiff {
            workdir,
            hash,
            path,
        } => to_json(git.commit_diff(Path::new(&workdir), &hash, &path).await?),
        Request::GitDiffStats { workdir } => to_json(git.diff_stats(Path::new(&workdir)).await?),
        Request::GitGenerateCommitMessage { workdir, options } => to_json(
            git.generate_commit_message(Path::new(&workdir), &options)
                .await?,
        ),
        Request::GitWorktreeList { workdir } => {
            to_json(git.worktree_list(Path::new(&workdir)).await?)
        }
        Request::GitWorktreeAdd { workdir, options } => {
            to_json(git.worktree_add(Path::new(&workdir), &options).await?)
        }
        Request::GitWorktreeRemove { workdir, options } => {
            to_json(git.worktree_remove(Path::new(&workdir), &options).await?)
        }

        Request::TerminalCreate { options } => to_json(terminals.create(options).await?),
        Request::TerminalWrite { session_id, data } => {
            to_json(terminals.write(&session_id, data.as_bytes()).await?)
        }
        Request::TerminalResize {
            session_id,
            cols,
            rows,
        } => to_json(terminals.resize(&session_id, cols, rows).await?),
        Request::TerminalDestroy { session_id } => to_json(terminals.destroy(&session_id).await?),
        Request::TerminalSnapshot { session_id } => {
            to_json(terminals.snapshot(&session_id).await?)
        }
        Request::TerminalExists { session_id } => to_json(terminals.exists(&session_id)),
        Request::TerminalInfo { session_id } => to_json(terminals.info(&session_id)?),
        Request::TerminalList => to_json(terminals.list()),

        Request::AgentDetect { custom } => to_json(agents.detect_all(&custom).await),
        Request::AgentDetectOne { agent_id, custom } => to_json(
            agents
                .detector()
                .detect_one(&agent_id, custom.as_ref())
                .await?,
        ),
        Request::AgentRefresh => {
            agents.detector().refresh();
            to_json(())
        }
        Request::AgentStart { options } => to_json(agents.start(options).await?),
        Request::AgentSend {
            session_id,
            content,
        } => to_json(agents.send(&session_id, &content).await?),
        Request::AgentStop { session_id } => to_json(agents.stop(&session_id).await?),
        Request::AgentStatus { session_id } => to_json(agents.status(&session_id)?),
        Request::AgentList => to_json(agents.list()),

        Request::AuxiliaryStart { config } => to_json(auxiliary.start(config).await?),
        Request::AuxiliaryStop => to_json(auxiliary.stop().await?),
        Request::AuxiliaryRestart { config } => to_json(auxiliary.restart(config).await?),
        Request::AuxiliaryStatus => to_json(auxiliary.status()),
        Request::AuxiliaryGenerateToken => to_json(generate_token()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_verbs_with_camel_case_params() {
        let request = Request::from_value(json!({
            "id": 7,
            "method": "terminal.resize",
            "params": {"sessionId": "t-1", "cols": 100, "rows": 30}
        }))
        .unwrap();
        match request {
            Request::TerminalResize {
                session_id,
                cols,
                rows,
            } => {
                assert_eq!(session_id, "t-1");
                assert_eq!((cols, rows), (100, 30));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn verbs_without_params_need_no_params_field() {
        let request = Request::from_value(json!({"id": 1, "method": "agent.list"})).unwrap();
        assert!(matches!(request, Request::AgentList));
    }

    #[test]
    fn optional_params_fall_back_to_defaults() {
        let request = Request::from_value(json!({
            "method": "git.generateCommitMessage",
            "params": {"workdir": "/tmp/repo"}
        }))
        .unwrap();
        match request {
            Request::GitGenerateCommitMessage { options, .. } => {
                assert_eq!(options, CommitMessageOptions::default());
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn unknown_methods_are_invalid_input() {
        let err = Request::from_value(json!({"method": "git.rebase", "params": {}})).unwrap_err();
        assert_eq!(err.kind(), "InvalidInput");
    }

    #[test]
    fn session_input_verbs_share_a_lane_per_session() {
        let write = Request::TerminalWrite {
            session_id: "t1".to_string(),
            data: "ls\n".to_string(),
        };
        let resize = Request::TerminalResize {
            session_id: "t1".to_string(),
            cols: 80,
            rows: 24,
        };
        let send = Request::AgentSend {
            session_id: "t1".to_string(),
            content: "hi".to_string(),
        };
        assert_eq!(write.lane(), resize.lane());
        assert_ne!(write.lane(), send.lane());
        assert!(!write.ends_session());
        assert!(Request::AgentStop {
            session_id: "t1".to_string()
        }
        .ends_session());
        assert_eq!(Request::TerminalList.lane(), None);
    }

    #[tokio::test]
    async fn dispatch_surfaces_typed_errors() {
        let registry = SessionRegistry::new(Default::default());
        let dir = tempfile::tempdir().unwrap();

        let err = dispatch(
            &registry,
            Request::GitStatus {
                workdir: dir.path().to_string_lossy().into_owned(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "NotAuthorized");

        let err = dispatch(
            &registry,
            Request::TerminalWrite {
                session_id: "missing".to_string(),
                data: "ls\n".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "NotFound");

        let status = dispatch(&registry, Request::AuxiliaryStatus).await.unwrap();
        assert_eq!(status["running"], json!(false));
        registry.shutdown().await;
    }
}
