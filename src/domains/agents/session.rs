use super::decoder::FrameDecoder;
use super::detector::ResolvedAgent;
use crate::errors::{ArborError, Result};
use crate::infrastructure::events::{AgentMessageEvent, AgentStatusEvent, EventBus};
use crate::shared::{path_env, process};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

const READ_CHUNK: usize = 8192;
const INPUT_QUEUE: usize = 64;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum AgentState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed { reason: String },
}

impl AgentState {
    pub fn name(&self) -> &'static str {
        match self {
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Stopping => "stopping",
            AgentState::Stopped => "stopped",
            AgentState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Stopped | AgentState::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSessionInfo {
    pub id: String,
    pub agent_id: String,
    pub workdir: String,
    pub pid: Option<u32>,
    pub state: AgentState,
    pub created: DateTime<Utc>,
}

pub(super) type SessionTable = Arc<Mutex<HashMap<String, Arc<AgentSession>>>>;

pub(super) fn lock_table(
    table: &SessionTable,
) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AgentSession>>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything a new session needs from its owner.
pub(super) struct SessionContext {
    pub bus: EventBus,
    pub grace: Duration,
    pub table: SessionTable,
}

struct Shared {
    id: String,
    agent_id: String,
    bus: EventBus,
    state: watch::Sender<AgentState>,
    stop_requested: AtomicBool,
}

impl Shared {
    /// Moves to `next` unless already terminal. The event is published while the
    /// state lock is held so observers see transitions in order.
    fn transition(&self, next: AgentState) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            log::info!(
                "Agent session {} ({}) {} -> {}",
                self.id,
                self.agent_id,
                current.name(),
                next.name()
            );
            *current = next.clone();
            self.bus.publish_agent_status(AgentStatusEvent {
                session_id: self.id.clone(),
                agent_id: self.agent_id.clone(),
                state: next.clone(),
            });
            true
        })
    }

    fn current(&self) -> AgentState {
        self.state.borrow().clone()
    }
}

/// A spawned agent CLI. The child process is owned by the monitor task; this handle
/// only holds the input queue and the stop trigger.
pub struct AgentSession {
    shared: Arc<Shared>,
    workdir: PathBuf,
    pid: Option<u32>,
    created: DateTime<Utc>,
    input: mpsc::Sender<Vec<u8>>,
    stop_tx: Mutex<Option<oneshot::Sender<Duration>>>,
    grace: Duration,
}

fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {signal}");
        }
    }
    "exited abnormally".to_string()
}

impl AgentSession {
    /// Spawns the agent and registers the session in the table once it is running.
    pub(super) fn start(
        ctx: SessionContext,
        id: String,
        resolved: ResolvedAgent,
        workdir: PathBuf,
        extra_args: &[String],
        env: &[(String, String)],
    ) -> Result<Arc<AgentSession>> {
        let (state_tx, _) = watch::channel(AgentState::Starting);
        let shared = Arc::new(Shared {
            id: id.clone(),
            agent_id: resolved.id.clone(),
            bus: ctx.bus.clone(),
            state: state_tx,
            stop_requested: AtomicBool::new(false),
        });
        ctx.bus.publish_agent_status(AgentStatusEvent {
            session_id: id.clone(),
            agent_id: resolved.id.clone(),
            state: AgentState::Starting,
        });

        let mut cmd = Command::new(&resolved.program);
        cmd.args(&resolved.args)
            .args(extra_args)
            .current_dir(&workdir)
            .env("PATH", path_env::enriched_path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                let error = ArborError::spawn(resolved.program.display(), &err);
                shared.transition(AgentState::Failed {
                    reason: err.to_string(),
                });
                return Err(error);
            }
        };
        let pid = child.id();
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            process::force_kill(&mut child);
            shared.transition(AgentState::Failed {
                reason: "stdio handles unavailable".to_string(),
            });
            return Err(ArborError::spawn(
                resolved.program.display(),
                "stdio handles unavailable",
            ));
        };

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        let (stop_tx, stop_rx) = oneshot::channel();
        let session = Arc::new(AgentSession {
            shared: Arc::clone(&shared),
            workdir,
            pid,
            created: Utc::now(),
            input: input_tx,
            stop_tx: Mutex::new(Some(stop_tx)),
            grace: ctx.grace,
        });

        lock_table(&ctx.table).insert(id.clone(), Arc::clone(&session));
        shared.transition(AgentState::Running);

        let writer = tokio::spawn(write_input(id.clone(), stdin, input_rx));
        let reader = tokio::spawn(read_output(Arc::clone(&shared), stdout));
        let stderr_task = tokio::spawn(log_stderr(id.clone(), stderr));
        tokio::spawn(monitor(
            shared,
            ctx.table,
            child,
            stop_rx,
            reader,
            vec![writer, stderr_task],
        ));

        log::info!(
            "Started agent {} as session {id} (pid {:?}) in {}",
            resolved.id,
            pid,
            session.workdir.display()
        );
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> AgentState {
        self.shared.current()
    }

    pub fn info(&self) -> AgentSessionInfo {
        AgentSessionInfo {
            id: self.shared.id.clone(),
            agent_id: self.shared.agent_id.clone(),
            workdir: self.workdir.to_string_lossy().into_owned(),
            pid: self.pid,
            state: self.state(),
            created: self.created,
        }
    }

    /// Queues `content` for the agent's stdin, newline-terminated.
    pub async fn send(&self, content: &str) -> Result<()> {
        let state = self.state();
        if state != AgentState::Running {
            return Err(ArborError::invalid_state(&self.shared.id, state.name(), "running"));
        }
        let mut bytes = content.as_bytes().to_vec();
        if !content.ends_with('\n') {
            bytes.push(b'\n');
        }
        self.input.send(bytes).await.map_err(|_| {
            ArborError::invalid_state(&self.shared.id, self.state().name(), "running")
        })
    }

    async fn request_stop(&self, grace: Duration) -> AgentState {
        let trigger = self
            .stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(trigger) = trigger {
            self.shared.stop_requested.store(true, Ordering::SeqCst);
            self.shared.transition(AgentState::Stopping);
            let _ = trigger.send(grace);
        }

        let mut rx = self.shared.state.subscribe();
        let settled = match rx.wait_for(AgentState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => self.shared.current(),
        };
        settled
    }

    /// SIGTERM, wait for the grace period, then SIGKILL. Resolves once the process has
    /// exited; concurrent callers all wait for the same outcome.
    pub async fn stop(&self) -> AgentState {
        self.request_stop(self.grace).await
    }

    /// Stop without a grace period.
    pub async fn kill(&self) -> AgentState {
        self.request_stop(Duration::ZERO).await
    }
}

async fn write_input(id: String, mut stdin: ChildStdin, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        let written = async {
            stdin.write_all(&bytes).await?;
            stdin.flush().await
        }
        .await;
        if let Err(err) = written {
            log::warn!("Failed to write to agent session {id}: {err}");
            break;
        }
    }
}

async fn read_output(shared: Arc<Shared>, mut stdout: ChildStdout) {
    let mut decoder = FrameDecoder::default();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut seq = 0u64;
    let mut publish = |message| {
        shared.bus.publish_agent_message(AgentMessageEvent {
            session_id: shared.id.clone(),
            seq,
            message,
        });
        seq += 1;
    };

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for message in decoder.push(&buf[..n]) {
                    publish(message);
                }
            }
            Err(err) => {
                log::warn!("Agent session {} stdout read failed: {err}", shared.id);
                break;
            }
        }
    }
    if let Some(message) = decoder.finish() {
        publish(message);
    }
}

async fn log_stderr(id: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log::debug!("[agent {id} stderr] {line}");
    }
}

async fn monitor(
    shared: Arc<Shared>,
    table: SessionTable,
    mut child: Child,
    stop_rx: oneshot::Receiver<Duration>,
    mut reader: JoinHandle<()>,
    helpers: Vec<JoinHandle<()>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(grace) = stop_rx => {
            log::debug!("Stopping agent session {} with grace {grace:?}", shared.id);
            process::terminate_gracefully(&mut child, grace).await
        }
    };

    // every decoded message precedes the final status
    if timeout(OUTPUT_DRAIN_TIMEOUT, &mut reader).await.is_err() {
        log::warn!("Agent session {} output did not drain; dropping the rest", shared.id);
        reader.abort();
    }
    for helper in helpers {
        helper.abort();
    }

    let final_state = if shared.stop_requested.load(Ordering::SeqCst) {
        AgentState::Stopped
    } else {
        match &status {
            Ok(status) if status.success() => AgentState::Stopped,
            Ok(status) => AgentState::Failed {
                reason: describe_exit(status),
            },
            Err(err) => AgentState::Failed {
                reason: format!("wait failed: {err}"),
            },
        }
    };

    lock_table(&table).remove(&shared.id);
    shared.transition(final_state);
}
