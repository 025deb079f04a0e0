use clap::Parser;
use std::path::PathBuf;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Arbor - session orchestration for git workdirs, terminals and coding agents
#[derive(Debug, Parser)]
#[command(
    name = "arbor",
    about = "Arbor - session orchestration for git workdirs, terminals and coding agents",
    version = VERSION,
    help_template = "\
{before-help}{name} {version}
{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}

PROTOCOL:
    One JSON request per stdin line:   {\"id\": 1, \"method\": \"git.status\", \"params\": {\"workdir\": \"/repo\"}}
    One JSON response per stdout line: {\"id\": 1, \"ok\": true, \"result\": ...}
    Push events share stdout:          {\"event\": \"arbor:terminal-data\", \"payload\": ...}

EXAMPLES:
    arbor                                  # Serve with default configuration
    arbor --config ~/.config/arbor.toml    # Load settings from a TOML file
    arbor --register ~/src/app             # Pre-authorize a workdir
    arbor --version, -V                    # Show version information
"
)]
pub struct Cli {
    /// TOML configuration file. ARBOR_* environment variables override its values.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Workdir to register with the authorization gate at startup. May be repeated.
    #[arg(long = "register", value_name = "DIR")]
    pub register: Vec<PathBuf>,
}
