use crate::infrastructure::config::ShellOverride;
use crate::shared::path_env;
use std::env;
use std::path::{Path, PathBuf};

const FALLBACK_SHELLS: &[&str] = &[
    "/bin/zsh",
    "/usr/bin/zsh",
    "/bin/bash",
    "/usr/bin/bash",
    "/bin/sh",
    "/usr/bin/sh",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedShell {
    pub program: String,
    pub args: Vec<String>,
}

/// Picks the shell for a new terminal: the per-request override, then the configured
/// default, then `$SHELL`, then the first available well-known shell.
pub fn effective_shell(
    requested: Option<&ShellOverride>,
    configured: Option<&ShellOverride>,
) -> ResolvedShell {
    for (source, candidate) in [("request", requested), ("config", configured)] {
        let Some(shell) = candidate else { continue };
        match resolve_shell_candidate(&shell.program) {
            Some(program) => {
                return ResolvedShell {
                    program,
                    args: shell.args.clone(),
                }
            }
            None => log::warn!(
                "Shell {:?} from {source} is unavailable; falling back to defaults",
                shell.program
            ),
        }
    }

    if let Ok(env_shell) = env::var("SHELL") {
        if let Some(program) = resolve_shell_candidate(&env_shell) {
            return ResolvedShell {
                program,
                args: Vec::new(),
            };
        }
        log::warn!("Environment variable SHELL={env_shell:?} is unavailable; falling back to defaults");
    }

    for candidate in FALLBACK_SHELLS {
        if let Some(program) = resolve_shell_candidate(candidate) {
            return ResolvedShell {
                program,
                args: Vec::new(),
            };
        }
    }

    log::warn!("No configured shells available; falling back to bare 'sh'");
    ResolvedShell {
        program: "sh".to_string(),
        args: Vec::new(),
    }
}

fn resolve_shell_candidate(shell: &str) -> Option<String> {
    if shell.trim().is_empty() {
        return None;
    }

    let expanded = expand_home(shell);
    let candidate = Path::new(&expanded);
    if candidate.is_absolute() {
        return path_is_executable(candidate).then_some(expanded);
    }

    path_env::resolve_executable(&expanded).map(|path| path.to_string_lossy().into_owned())
}

fn expand_home(shell: &str) -> String {
    if let Some(stripped) = shell.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return PathBuf::from(home)
                .join(stripped)
                .to_string_lossy()
                .into_owned();
        }
    }
    shell.to_string()
}

fn path_is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        std::fs::metadata(path)
            .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        path.is_file()
    }
}
