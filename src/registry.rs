//! The umbrella owner of every live resource: the authorization gate, git sessions,
//! terminals, agent sessions and the auxiliary server all hang off one
//! [`SessionRegistry`], which is the only place that tears them down.

use crate::domains::agents::{AgentManager, CliDetector};
use crate::domains::auxiliary::AuxiliaryServer;
use crate::domains::git::{CommandRunner, GitService, GitTimeouts, SystemCommandRunner};
use crate::domains::terminal::TerminalManager;
use crate::domains::workdir::{AuthorizationGate, WorkdirKey};
use crate::errors::Result;
use crate::infrastructure::config::ArborConfig;
use crate::infrastructure::events::EventBus;
use std::path::Path;
use std::sync::Arc;

pub struct SessionRegistry {
    config: ArborConfig,
    bus: EventBus,
    gate: Arc<AuthorizationGate>,
    git: GitService,
    terminals: TerminalManager,
    agents: AgentManager,
    auxiliary: AuxiliaryServer,
}

impl SessionRegistry {
    /// Must be called from within a tokio runtime; the auxiliary server actor is
    /// spawned immediately.
    pub fn new(config: ArborConfig) -> Self {
        Self::with_runner(config, Arc::new(SystemCommandRunner))
    }

    pub fn with_runner(config: ArborConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let bus = EventBus::new(config.event_capacity);
        let gate = Arc::new(AuthorizationGate::new());
        let git = GitService::new(
            Arc::clone(&gate),
            Arc::clone(&runner),
            GitTimeouts {
                local: config.git_timeout(),
                network: config.git_network_timeout(),
            },
        );
        let terminals = TerminalManager::new(bus.clone(), config.terminal.clone());
        let agents = AgentManager::new(
            CliDetector::new(runner, config.agents.clone()),
            bus.clone(),
            config.stop_grace(),
        );
        let auxiliary = AuxiliaryServer::spawn(
            config.auxiliary.clone(),
            bus.clone(),
            config.stop_grace(),
            config.auxiliary_steady_window(),
        );
        log::info!(
            "Session registry ready (git timeout {:?}, stop grace {:?})",
            config.git_timeout(),
            config.stop_grace()
        );

        Self {
            config,
            bus,
            gate,
            git,
            terminals,
            agents,
            auxiliary,
        }
    }

    pub fn config(&self) -> &ArborConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn gate(&self) -> &AuthorizationGate {
        &self.gate
    }

    pub fn git(&self) -> &GitService {
        &self.git
    }

    pub fn terminals(&self) -> &TerminalManager {
        &self.terminals
    }

    pub fn agents(&self) -> &AgentManager {
        &self.agents
    }

    pub fn auxiliary(&self) -> &AuxiliaryServer {
        &self.auxiliary
    }

    pub fn register_workdir(&self, path: &Path) -> Result<WorkdirKey> {
        self.gate.register(path)
    }

    pub fn unregister_workdir(&self, path: &Path) -> Result<WorkdirKey> {
        self.gate.unregister(path)
    }

    /// Destroys all terminals, force-stops all agents and kills the auxiliary server.
    pub async fn shutdown(&self) {
        log::info!("Shutting down session registry");
        self.terminals.shutdown();
        self.agents.shutdown().await;
        self.auxiliary.cleanup();
    }
}
