//! Executable search path shared by every spawn point (terminals, agents, probes).
//!
//! Processes started from a desktop session usually inherit a minimal `PATH`, which
//! hides tools installed through per-user version managers. Everything that spawns a
//! user-facing program goes through [`enriched_path`] so a tool visible from one spawn
//! point is visible from all of them.

use std::env;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

const USER_PATH_SUFFIXES: &[&str] = &[
    ".local/bin",
    ".cargo/bin",
    ".pyenv/shims",
    "bin",
    ".nvm/current/bin",
    ".volta/bin",
    ".fnm",
    ".bun/bin",
    ".deno/bin",
];

const SYSTEM_PATHS: &[&str] = &[
    "/opt/homebrew/bin",
    "/usr/local/bin",
    "/usr/bin",
    "/bin",
    "/usr/sbin",
    "/sbin",
];

/// Builds the enriched search path from an explicit home directory and existing `PATH`.
pub fn enriched_path_from(home: Option<&Path>, existing: Option<&OsStr>) -> OsString {
    let mut components: Vec<PathBuf> = Vec::new();
    let mut push_unique = |candidate: PathBuf| {
        if !candidate.as_os_str().is_empty() && !components.contains(&candidate) {
            components.push(candidate);
        }
    };

    if let Some(home) = home {
        for suffix in USER_PATH_SUFFIXES {
            push_unique(home.join(suffix));
        }
    }
    for system in SYSTEM_PATHS {
        push_unique(PathBuf::from(system));
    }
    if let Some(existing) = existing {
        for entry in env::split_paths(existing) {
            push_unique(entry);
        }
    }

    env::join_paths(&components).unwrap_or_else(|err| {
        log::warn!("Failed to join enriched PATH ({err}); using inherited PATH");
        existing.map(OsStr::to_os_string).unwrap_or_default()
    })
}

pub fn enriched_path() -> OsString {
    enriched_path_from(dirs::home_dir().as_deref(), env::var_os("PATH").as_deref())
}

/// Resolves a program name against the enriched path; absolute paths are checked as-is.
pub fn resolve_executable(program: &str) -> Option<PathBuf> {
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    which::which_in(program, Some(enriched_path()), cwd).ok()
}

/// Environment for an interactive terminal of the given geometry.
pub fn terminal_environment(cols: u16, rows: u16) -> Vec<(String, String)> {
    let mut envs = vec![
        ("TERM".to_string(), "xterm-256color".to_string()),
        ("LINES".to_string(), rows.to_string()),
        ("COLUMNS".to_string(), cols.to_string()),
        ("PATH".to_string(), enriched_path().to_string_lossy().into_owned()),
    ];

    if let Some(home) = dirs::home_dir() {
        envs.push(("HOME".to_string(), home.to_string_lossy().into_owned()));
    }

    let lang_value = env::var("LANG").unwrap_or_else(|_| "en_US.UTF-8".to_string());
    envs.push(("LANG".to_string(), lang_value));
    if let Ok(lc_all) = env::var("LC_ALL") {
        envs.push(("LC_ALL".to_string(), lc_all));
    }

    envs.push(("CLICOLOR".to_string(), "1".to_string()));
    envs.push(("CLICOLOR_FORCE".to_string(), "1".to_string()));
    envs
}
