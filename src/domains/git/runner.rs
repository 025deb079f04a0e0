use crate::errors::{ArborError, Result};
use crate::shared::process::terminate_gracefully;
#[cfg(unix)]
use crate::shared::process::{signal_process_group, SIGKILL};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::{timeout, Duration};

/// Grace period between SIGTERM and SIGKILL for a command that hit its deadline.
const TIMEOUT_KILL_GRACE: Duration = Duration::from_millis(500);

/// How long output pipes may stay open after the command itself has exited.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Options for one command execution. The timeout is mandatory.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
}

impl RunOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            cwd: None,
            timeout,
            env: Vec::new(),
            stdin: None,
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.push((key.to_string(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

/// Runs one external command to completion or timeout, capturing its output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str], options: &RunOptions) -> Result<CommandOutput>;
}

pub fn describe_command(program: &str, args: &[&str]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program);
    parts.extend_from_slice(args);
    shell_words::join(parts)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[&str], options: &RunOptions) -> Result<CommandOutput> {
        let described = describe_command(program, args);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if options.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &options.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ArborError::spawn(&described, e))?;
        #[cfg(unix)]
        let pid = child.id();

        let stdin_task = match (child.stdin.take(), options.stdin.clone()) {
            (Some(mut stdin), Some(input)) => Some(tokio::spawn(async move {
                if let Err(err) = stdin.write_all(input.as_bytes()).await {
                    log::debug!("Failed to write command stdin: {err}");
                }
                drop(stdin);
            })),
            _ => None,
        };

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(out) = stdout.as_mut() {
                let _ = out.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(err) = stderr.as_mut() {
                let _ = err.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = match timeout(options.timeout, child.wait()).await {
            Ok(status) => status.map_err(|e| ArborError::spawn(&described, e))?,
            Err(_) => {
                log::warn!(
                    "Command timed out after {}ms: {described}",
                    options.timeout.as_millis()
                );
                if let Err(err) = terminate_gracefully(&mut child, TIMEOUT_KILL_GRACE).await {
                    log::debug!("Failed to reap timed out command: {err}");
                }
                stdout_task.abort();
                stderr_task.abort();
                if let Some(task) = stdin_task {
                    task.abort();
                }
                return Err(ArborError::Timeout {
                    command: described,
                    timeout_ms: options.timeout.as_millis() as u64,
                });
            }
        };

        // Input the command never read is irrelevant once it has exited.
        if let Some(task) = stdin_task {
            task.abort();
        }

        // Background processes left behind by the command inherit its pipes.
        let aborts = [stdout_task.abort_handle(), stderr_task.abort_handle()];
        let mut readers = futures::future::join(stdout_task, stderr_task);
        let (stdout, stderr) = match timeout(PIPE_DRAIN_TIMEOUT, &mut readers).await {
            Ok(outputs) => outputs,
            Err(_) => {
                log::debug!("Output of {described} still open after exit, killing its process group");
                #[cfg(unix)]
                {
                    if let Some(pid) = pid {
                        signal_process_group(pid, SIGKILL);
                    }
                }
                match timeout(PIPE_DRAIN_TIMEOUT, readers).await {
                    Ok(outputs) => outputs,
                    Err(_) => {
                        aborts.iter().for_each(|handle| handle.abort());
                        (Ok(Vec::new()), Ok(Vec::new()))
                    }
                }
            }
        };
        let stdout = stdout.unwrap_or_default();
        let stderr = stderr.unwrap_or_default();

        Ok(CommandOutput {
            status: status.code(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn captures_stdout_stderr_and_exit_code() {
        let output = SystemCommandRunner
            .run(
                "sh",
                &["-c", "echo out; echo err >&2; exit 3"],
                &RunOptions::new(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(output.status, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn env_overrides_and_stdin_reach_the_child() {
        let options = RunOptions::new(Duration::from_secs(5))
            .env("ARBOR_TEST_VALUE", "overlay")
            .stdin("from stdin");
        let output = SystemCommandRunner
            .run("sh", &["-c", "printf '%s ' \"$ARBOR_TEST_VALUE\"; cat"], &options)
            .await
            .unwrap();
        assert_eq!(output.stdout, "overlay from stdin");
    }

    #[tokio::test]
    async fn runs_in_requested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let output = SystemCommandRunner
            .run(
                "pwd",
                &[],
                &RunOptions::new(Duration::from_secs(5)).cwd(dir.path()),
            )
            .await
            .unwrap();
        let reported = std::fs::canonicalize(output.stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn timeout_kills_the_child_and_reports_timeout() {
        let started = Instant::now();
        let err = SystemCommandRunner
            .run(
                "sh",
                &["-c", "sleep 30"],
                &RunOptions::new(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ArborError::Timeout { timeout_ms: 200, .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let err = SystemCommandRunner
            .run(
                "arbor-definitely-missing-binary",
                &[],
                &RunOptions::new(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "SpawnError");
    }

    #[tokio::test]
    async fn background_processes_holding_output_do_not_block_the_result() {
        let started = Instant::now();
        let output = SystemCommandRunner
            .run(
                "sh",
                &["-c", "sleep 20 & echo done"],
                &RunOptions::new(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "done");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn describe_quotes_arguments() {
        assert_eq!(
            describe_command("git", &["commit", "-m", "two words"]),
            "git commit -m 'two words'"
        );
    }
}
