pub mod commit_message;
pub mod parse;
pub mod runner;
pub mod service;
pub mod types;
pub mod worktrees;

pub use runner::{CommandOutput, CommandRunner, RunOptions, SystemCommandRunner};
pub use service::{GitService, GitTimeouts};
pub use types::*;
