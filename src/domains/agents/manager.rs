use super::detector::{AgentDetection, CliDetector};
use super::session::{lock_table, AgentSession, AgentSessionInfo, AgentState, SessionContext, SessionTable};
use crate::errors::{ArborError, Result};
use crate::infrastructure::config::CustomAgent;
use crate::infrastructure::events::EventBus;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStartOptions {
    pub agent_id: String,
    pub workdir: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub custom_agent: Option<CustomAgent>,
}

/// Keyed registry of live agent sessions. A session leaves the table when its
/// process exits, whatever the cause.
pub struct AgentManager {
    detector: CliDetector,
    bus: EventBus,
    grace: Duration,
    sessions: SessionTable,
}

impl AgentManager {
    pub fn new(detector: CliDetector, bus: EventBus, grace: Duration) -> Self {
        Self {
            detector,
            bus,
            grace,
            sessions: SessionTable::default(),
        }
    }

    pub fn detector(&self) -> &CliDetector {
        &self.detector
    }

    pub async fn detect_all(&self, custom: &[CustomAgent]) -> Vec<AgentDetection> {
        self.detector.detect_all(custom).await
    }

    pub async fn start(&self, options: AgentStartOptions) -> Result<String> {
        let workdir = PathBuf::from(&options.workdir);
        if !workdir.is_dir() {
            return Err(ArborError::not_found("directory", workdir.display()));
        }
        let resolved = self
            .detector
            .resolve(&options.agent_id, options.custom_agent.as_ref())?;

        let id = uuid::Uuid::new_v4().to_string();
        let ctx = SessionContext {
            bus: self.bus.clone(),
            grace: self.grace,
            table: Arc::clone(&self.sessions),
        };
        AgentSession::start(ctx, id.clone(), resolved, workdir, &options.args, &options.env)?;
        Ok(id)
    }

    fn get(&self, id: &str) -> Result<Arc<AgentSession>> {
        lock_table(&self.sessions)
            .get(id)
            .cloned()
            .ok_or_else(|| ArborError::not_found("agent-session", id))
    }

    pub async fn send(&self, id: &str, content: &str) -> Result<()> {
        self.get(id)?.send(content).await
    }

    pub async fn stop(&self, id: &str) -> Result<AgentState> {
        let session = self.get(id)?;
        Ok(session.stop().await)
    }

    pub fn status(&self, id: &str) -> Result<AgentSessionInfo> {
        self.get(id).map(|session| session.info())
    }

    pub fn list(&self) -> Vec<AgentSessionInfo> {
        let mut sessions: Vec<_> = lock_table(&self.sessions)
            .values()
            .map(|session| session.info())
            .collect();
        sessions.sort_by(|a, b| a.created.cmp(&b.created));
        sessions
    }

    /// Force-stops every live session and waits for each process to exit.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = lock_table(&self.sessions).values().cloned().collect();
        if sessions.is_empty() {
            return;
        }
        log::info!("Force-stopping {} agent session(s)", sessions.len());
        futures::future::join_all(sessions.iter().map(|session| session.kill())).await;
    }
}
