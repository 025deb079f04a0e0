use super::shell::effective_shell;
use crate::errors::{ArborError, Result};
use crate::infrastructure::config::{ShellOverride, TerminalDefaults};
use crate::infrastructure::events::{serialize_base64, EventBus, TerminalDataEvent, TerminalExitEvent};
use crate::shared::path_env;
use pty_host::{
    EventSink, ExitInfo, KillRequest, PtyHost, PtyHostError, ResizeRequest, SpawnOptions,
    SpawnRequest, TerminalInfo, TerminalState, WriteRequest,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TerminalCreateOptions {
    pub cwd: Option<String>,
    pub shell_override: Option<ShellOverride>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSessionInfo {
    pub id: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub state: TerminalState,
    pub created_at_ms: u64,
    pub last_activity_ms: u64,
}

impl From<TerminalInfo> for TerminalSessionInfo {
    fn from(info: TerminalInfo) -> Self {
        Self {
            id: info.term_id,
            cwd: info.cwd,
            cols: info.cols,
            rows: info.rows,
            state: info.state,
            created_at_ms: info.created_at_ms,
            last_activity_ms: info.last_activity_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalScrollback {
    pub session_id: String,
    pub seq: u64,
    #[serde(serialize_with = "serialize_base64")]
    pub data: Vec<u8>,
}

/// Forwards pty host output into the event bus, preserving per-terminal order.
struct BusSink {
    bus: EventBus,
}

impl EventSink for BusSink {
    fn emit_chunk(&self, term_id: &str, seq: u64, data: &[u8]) {
        self.bus.publish_terminal_data(TerminalDataEvent {
            session_id: term_id.to_string(),
            seq,
            data: data.to_vec(),
        });
    }

    fn emit_exit(&self, term_id: &str, exit: &ExitInfo) {
        log::info!(
            "Terminal {term_id} exited (code: {:?}, signal: {:?})",
            exit.exit_code,
            exit.signal
        );
        self.bus.publish_terminal_exit(TerminalExitEvent {
            session_id: term_id.to_string(),
            exit_code: exit.exit_code,
            signal: exit.signal.clone(),
        });
    }
}

/// Registry of live terminal sessions. The [`PtyHost`] is the only owner of PTY
/// handles; this layer validates requests and maps errors.
pub struct TerminalManager {
    host: PtyHost,
    defaults: TerminalDefaults,
}

fn validate_size(cols: u16, rows: u16) -> Result<()> {
    if cols == 0 || rows == 0 {
        return Err(ArborError::invalid_input(
            "size",
            format!("terminal size must be non-zero, got {cols}x{rows}"),
        ));
    }
    Ok(())
}

impl TerminalManager {
    pub fn new(bus: EventBus, defaults: TerminalDefaults) -> Self {
        Self {
            host: PtyHost::new(Arc::new(BusSink { bus })),
            defaults,
        }
    }

    fn resolve_cwd(requested: Option<&str>) -> Result<PathBuf> {
        let cwd = match requested {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
        };
        match std::fs::metadata(&cwd) {
            Ok(metadata) if metadata.is_dir() => Ok(cwd),
            _ => Err(ArborError::not_found("directory", cwd.display())),
        }
    }

    pub async fn create(&self, options: TerminalCreateOptions) -> Result<String> {
        let cwd = Self::resolve_cwd(options.cwd.as_deref())?;
        let cols = options.cols.unwrap_or(self.defaults.cols);
        let rows = options.rows.unwrap_or(self.defaults.rows);
        validate_size(cols, rows)?;

        let shell = effective_shell(options.shell_override.as_ref(), self.defaults.shell.as_ref());
        let mut env = path_env::terminal_environment(cols, rows);
        env.push(("SHELL".to_string(), shell.program.clone()));
        env.extend(options.env);

        let id = uuid::Uuid::new_v4().to_string();
        let request = SpawnRequest {
            options: SpawnOptions {
                id: id.clone(),
                cwd: cwd.to_string_lossy().into_owned(),
                rows,
                cols,
                program: shell.program.clone(),
                args: shell.args,
                env,
            },
        };
        self.host
            .spawn(request)
            .await
            .map_err(|e| ArborError::from_pty(&id, e))?;
        log::info!(
            "Created terminal {id} running {} in {} ({cols}x{rows})",
            shell.program,
            cwd.display()
        );
        Ok(id)
    }

    pub async fn write(&self, id: &str, data: &[u8]) -> Result<()> {
        self.host
            .write(WriteRequest {
                term_id: id.to_string(),
                data: data.to_vec(),
            })
            .await
            .map_err(|e| ArborError::from_pty(id, e))
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        validate_size(cols, rows)?;
        self.host
            .resize(ResizeRequest {
                term_id: id.to_string(),
                rows,
                cols,
            })
            .await
            .map_err(|e| ArborError::from_pty(id, e))
    }

    /// Terminates the shell and releases the PTY. Destroying an unknown or already
    /// exited terminal succeeds.
    pub async fn destroy(&self, id: &str) -> Result<()> {
        match self
            .host
            .kill(KillRequest {
                term_id: id.to_string(),
            })
            .await
        {
            Ok(()) => {
                log::info!("Destroyed terminal {id}");
                Ok(())
            }
            Err(PtyHostError::TerminalNotFound(_)) => Ok(()),
            Err(err) => Err(ArborError::from_pty(id, err)),
        }
    }

    pub async fn snapshot(&self, id: &str) -> Result<TerminalScrollback> {
        let snapshot = self
            .host
            .snapshot(id)
            .await
            .map_err(|e| ArborError::from_pty(id, e))?;
        Ok(TerminalScrollback {
            session_id: snapshot.term_id,
            seq: snapshot.seq,
            data: snapshot.data,
        })
    }

    pub fn exists(&self, id: &str) -> bool {
        self.host.exists(id)
    }

    pub fn info(&self, id: &str) -> Result<TerminalSessionInfo> {
        self.host
            .info(id)
            .map(TerminalSessionInfo::from)
            .map_err(|e| ArborError::from_pty(id, e))
    }

    pub fn list(&self) -> Vec<TerminalSessionInfo> {
        self.host
            .list()
            .into_iter()
            .map(TerminalSessionInfo::from)
            .collect()
    }

    pub fn shutdown(&self) {
        let live = self.host.list().len();
        if live > 0 {
            log::info!("Killing {live} terminal(s) at shutdown");
        }
        self.host.kill_all();
    }
}
