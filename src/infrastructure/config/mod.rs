use crate::errors::{ArborError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const GIT_TIMEOUT_ENV: &str = "ARBOR_GIT_TIMEOUT_SECS";
pub const GIT_NETWORK_TIMEOUT_ENV: &str = "ARBOR_GIT_NETWORK_TIMEOUT_SECS";
pub const STOP_GRACE_ENV: &str = "ARBOR_STOP_GRACE_MS";
pub const SHELL_ENV: &str = "ARBOR_SHELL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellOverride {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalDefaults {
    pub cols: u16,
    pub rows: u16,
    pub shell: Option<ShellOverride>,
}

impl Default for TerminalDefaults {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            shell: None,
        }
    }
}

/// Command used to launch the auxiliary remote-access server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuxiliaryLaunch {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for AuxiliaryLaunch {
    fn default() -> Self {
        Self {
            program: "npx".to_string(),
            args: vec![
                "-y".to_string(),
                "@twsxtd/hapi".to_string(),
                "server".to_string(),
            ],
        }
    }
}

/// A user-defined agent CLI, detected alongside the built-in ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomAgent {
    pub id: String,
    pub name: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArborConfig {
    pub git_timeout_secs: u64,
    pub git_network_timeout_secs: u64,
    pub stop_grace_ms: u64,
    pub auxiliary_steady_ms: u64,
    pub event_capacity: usize,
    pub terminal: TerminalDefaults,
    pub auxiliary: AuxiliaryLaunch,
    pub agents: Vec<CustomAgent>,
}

impl Default for ArborConfig {
    fn default() -> Self {
        Self {
            git_timeout_secs: 30,
            git_network_timeout_secs: 120,
            stop_grace_ms: 5_000,
            auxiliary_steady_ms: 2_000,
            event_capacity: 1024,
            terminal: TerminalDefaults::default(),
            auxiliary: AuxiliaryLaunch::default(),
            agents: Vec::new(),
        }
    }
}

impl ArborConfig {
    /// Reads the optional TOML file, then applies `ARBOR_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ArborError::io("read config", path.display(), e))?;
        let config: ArborConfig = toml::from_str(&contents)
            .map_err(|e| ArborError::invalid_input("config", e.message()))?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secs) = parse_env_u64(&lookup, GIT_TIMEOUT_ENV) {
            self.git_timeout_secs = secs;
        }
        if let Some(secs) = parse_env_u64(&lookup, GIT_NETWORK_TIMEOUT_ENV) {
            self.git_network_timeout_secs = secs;
        }
        if let Some(ms) = parse_env_u64(&lookup, STOP_GRACE_ENV) {
            self.stop_grace_ms = ms;
        }
        if let Some(raw) = lookup(SHELL_ENV).filter(|value| !value.trim().is_empty()) {
            match shell_words::split(&raw) {
                Ok(mut words) if !words.is_empty() => {
                    let program = words.remove(0);
                    self.terminal.shell = Some(ShellOverride {
                        program,
                        args: words,
                    });
                }
                _ => log::warn!("Ignoring unparsable {SHELL_ENV} value '{raw}'"),
            }
        }
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn git_network_timeout(&self) -> Duration {
        Duration::from_secs(self.git_network_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn auxiliary_steady_window(&self) -> Duration {
        Duration::from_millis(self.auxiliary_steady_ms)
    }
}

fn parse_env_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            log::warn!("Ignoring invalid {key} value '{raw}'");
            None
        }
    }
}
