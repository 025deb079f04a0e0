use crate::domains::git::{CommandRunner, RunOptions};
use crate::errors::{ArborError, Result};
use crate::infrastructure::config::CustomAgent;
use crate::shared::path_env;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

struct BuiltinAgent {
    id: &'static str,
    name: &'static str,
    program: &'static str,
    session_args: &'static [&'static str],
}

const BUILTIN_AGENTS: &[BuiltinAgent] = &[
    BuiltinAgent {
        id: "claude",
        name: "Claude Code",
        program: "claude",
        session_args: &[
            "--print",
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--verbose",
        ],
    },
    BuiltinAgent {
        id: "codex",
        name: "Codex",
        program: "codex",
        session_args: &["exec", "--json", "-"],
    },
    BuiltinAgent {
        id: "gemini",
        name: "Gemini CLI",
        program: "gemini",
        session_args: &["--output-format", "stream-json"],
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDetection {
    pub id: String,
    pub name: String,
    pub command: String,
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// An agent command ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAgent {
    pub id: String,
    pub program: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
struct AgentDefinition {
    id: String,
    name: String,
    command: String,
    program: String,
    args: Vec<String>,
}

impl AgentDefinition {
    fn builtin(agent: &BuiltinAgent) -> Self {
        Self {
            id: agent.id.to_string(),
            name: agent.name.to_string(),
            command: agent.program.to_string(),
            program: agent.program.to_string(),
            args: agent.session_args.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn custom(agent: &CustomAgent) -> Result<Self> {
        let mut words = shell_words::split(&agent.command)
            .map_err(|e| ArborError::invalid_input("command", e))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| ArborError::invalid_input("command", "agent command is empty"))?;
        Ok(Self {
            id: agent.id.clone(),
            name: agent.name.clone(),
            command: agent.command.clone(),
            program,
            args: words.collect(),
        })
    }
}

/// Maps agent ids to invocable commands and reports which agent CLIs are installed.
pub struct CliDetector {
    runner: Arc<dyn CommandRunner>,
    custom: Vec<CustomAgent>,
    cache: Mutex<HashMap<String, AgentDetection>>,
}

impl CliDetector {
    pub fn new(runner: Arc<dyn CommandRunner>, custom: Vec<CustomAgent>) -> Self {
        Self {
            runner,
            custom,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn definition(&self, id: &str, custom: Option<&CustomAgent>) -> Result<AgentDefinition> {
        if let Some(agent) = custom.filter(|agent| agent.id == id) {
            return AgentDefinition::custom(agent);
        }
        if let Some(agent) = BUILTIN_AGENTS.iter().find(|agent| agent.id == id) {
            return Ok(AgentDefinition::builtin(agent));
        }
        match self.custom.iter().find(|agent| agent.id == id) {
            Some(agent) => AgentDefinition::custom(agent),
            None => Err(ArborError::not_found("agent", id)),
        }
    }

    async fn probe_version(&self, path: &str) -> Option<String> {
        let output = self
            .runner
            .run(path, &["--version"], &RunOptions::new(VERSION_TIMEOUT))
            .await
            .ok()?;
        if !output.success() {
            log::debug!("{path} --version exited with {:?}", output.status);
            return None;
        }
        output
            .stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }

    async fn detect(&self, definition: &AgentDefinition) -> AgentDetection {
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&definition.id)
            .filter(|hit| hit.command == definition.command)
            .cloned();
        if let Some(hit) = cached {
            return hit;
        }

        let path = path_env::resolve_executable(&definition.program)
            .map(|path| path.to_string_lossy().into_owned());
        let version = match &path {
            Some(path) => self.probe_version(path).await,
            None => None,
        };
        let detection = AgentDetection {
            id: definition.id.clone(),
            name: definition.name.clone(),
            command: definition.command.clone(),
            installed: path.is_some(),
            path,
            version,
        };
        log::info!(
            "Detected agent {} (installed: {}, version: {:?})",
            detection.id,
            detection.installed,
            detection.version
        );

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(detection.id.clone(), detection.clone());
        detection
    }

    /// Detects every built-in agent plus the configured and supplied custom agents.
    pub async fn detect_all(&self, custom: &[CustomAgent]) -> Vec<AgentDetection> {
        let mut definitions: Vec<AgentDefinition> =
            BUILTIN_AGENTS.iter().map(AgentDefinition::builtin).collect();
        for agent in self.custom.iter().chain(custom) {
            if definitions.iter().any(|known| known.id == agent.id) {
                continue;
            }
            match AgentDefinition::custom(agent) {
                Ok(definition) => definitions.push(definition),
                Err(err) => log::warn!("Skipping custom agent {}: {err}", agent.id),
            }
        }

        let mut detections = Vec::with_capacity(definitions.len());
        for definition in &definitions {
            detections.push(self.detect(definition).await);
        }
        detections
    }

    pub async fn detect_one(&self, id: &str, custom: Option<&CustomAgent>) -> Result<AgentDetection> {
        let definition = self.definition(id, custom)?;
        Ok(self.detect(&definition).await)
    }

    /// Drops cached detections so the next call probes again.
    pub fn refresh(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Resolves the command used to start a session for `id`.
    pub fn resolve(&self, id: &str, custom: Option<&CustomAgent>) -> Result<ResolvedAgent> {
        let definition = self.definition(id, custom)?;
        let program = path_env::resolve_executable(&definition.program).ok_or_else(|| {
            ArborError::spawn(&definition.program, "executable not found on the search path")
        })?;
        Ok(ResolvedAgent {
            id: definition.id,
            program,
            args: definition.args,
        })
    }
}
