pub mod manager;
pub mod shell;

pub use manager::{TerminalCreateOptions, TerminalManager, TerminalScrollback, TerminalSessionInfo};
pub use shell::{effective_shell, ResolvedShell};
