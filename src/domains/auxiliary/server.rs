//! The auxiliary remote-access server: a single child process driven by an actor.
//!
//! Every start, stop and restart request goes through one command channel, so two
//! concurrent starts can never both spawn. The published [`ServerStatus`] is also
//! written only by the actor, which keeps status events in transition order.

use crate::errors::{ArborError, Result};
use crate::infrastructure::config::AuxiliaryLaunch;
use crate::infrastructure::events::EventBus;
use crate::shared::{path_env, process};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, Instant};

const COMMAND_QUEUE: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuxiliaryConfig {
    pub webapp_port: u16,
    pub cli_api_token: String,
    pub telegram_bot_token: String,
    pub webapp_url: String,
    pub allowed_chat_ids: String,
}

impl AuxiliaryConfig {
    /// Environment handed to the server. Optional values are only set when non-empty.
    pub fn environment(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![("WEBAPP_PORT", self.webapp_port.to_string())];
        let optional = [
            ("CLI_API_TOKEN", &self.cli_api_token),
            ("TELEGRAM_BOT_TOKEN", &self.telegram_bot_token),
            ("WEBAPP_URL", &self.webapp_url),
            ("ALLOWED_CHAT_IDS", &self.allowed_chat_ids),
        ];
        env.extend(
            optional
                .into_iter()
                .filter(|(_, value)| !value.is_empty())
                .map(|(key, value)| (key, value.clone())),
        );
        env
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerStatus {
    fn running(pid: Option<u32>, port: u16) -> Self {
        Self {
            running: true,
            pid,
            port: Some(port),
            error: None,
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// 32 random bytes as lowercase hex, for use as `CLI_API_TOKEN`.
pub fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    getrandom::fill(&mut bytes).map_err(|e| ArborError::io("generate_token", "os rng", e))?;
    let mut token = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(token, "{byte:02x}");
    }
    Ok(token)
}

enum ServerCommand {
    Start {
        config: AuxiliaryConfig,
        reply: oneshot::Sender<ServerStatus>,
    },
    Stop {
        reply: oneshot::Sender<ServerStatus>,
    },
    Restart {
        config: AuxiliaryConfig,
        reply: oneshot::Sender<ServerStatus>,
    },
}

struct RunningServer {
    child: Child,
    started: Instant,
}

struct ServerActor {
    launch: AuxiliaryLaunch,
    bus: EventBus,
    grace: Duration,
    steady: Duration,
    status: watch::Sender<ServerStatus>,
    pid: Arc<AtomicU32>,
    shutting_down: Arc<AtomicBool>,
    server: Option<RunningServer>,
}

async fn wait_for_exit(server: &mut Option<RunningServer>) -> io::Result<ExitStatus> {
    match server {
        Some(running) => running.child.wait().await,
        None => std::future::pending().await,
    }
}

fn forward_output<R>(stream: Option<R>, label: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(stream) = stream else { return };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log::info!("[auxiliary {label}] {line}");
        }
    });
}

impl ServerActor {
    async fn run(mut self, mut commands: mpsc::Receiver<ServerCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                exit = wait_for_exit(&mut self.server) => self.on_exit(exit),
            }
        }
        if let Some(mut running) = self.server.take() {
            process::force_kill(&mut running.child);
        }
        self.pid.store(0, Ordering::SeqCst);
        log::debug!("Auxiliary server actor stopped");
    }

    async fn handle(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::Start { config, reply } => {
                let status = self.start(config);
                let _ = reply.send(status);
            }
            ServerCommand::Stop { reply } => {
                let status = self.stop().await;
                let _ = reply.send(status);
            }
            ServerCommand::Restart { config, reply } => {
                self.stop().await;
                let status = self.start(config);
                let _ = reply.send(status);
            }
        }
    }

    fn set_status(&self, status: ServerStatus) {
        self.status.send_replace(status.clone());
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        self.bus.publish_auxiliary_status(status);
    }

    fn current(&self) -> ServerStatus {
        self.status.borrow().clone()
    }

    fn start(&mut self, config: AuxiliaryConfig) -> ServerStatus {
        if self.server.is_some() {
            log::debug!("Auxiliary server already running; start is a no-op");
            return self.current();
        }

        let program = path_env::resolve_executable(&self.launch.program)
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.launch.program.clone());
        let mut cmd = Command::new(&program);
        cmd.args(&self.launch.args)
            .env("PATH", path_env::enriched_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        for (key, value) in config.environment() {
            cmd.env(key, value);
        }

        let status = match cmd.spawn() {
            Ok(mut child) => {
                let pid = child.id();
                self.pid.store(pid.unwrap_or(0), Ordering::SeqCst);
                forward_output(child.stdout.take(), "stdout");
                forward_output(child.stderr.take(), "stderr");
                log::info!(
                    "Started auxiliary server {program} (pid {pid:?}) on port {}",
                    config.webapp_port
                );
                self.server = Some(RunningServer {
                    child,
                    started: Instant::now(),
                });
                ServerStatus::running(pid, config.webapp_port)
            }
            Err(err) => {
                log::error!("Failed to start auxiliary server {program}: {err}");
                ServerStatus::failed(err.to_string())
            }
        };
        self.set_status(status.clone());
        status
    }

    async fn stop(&mut self) -> ServerStatus {
        let Some(mut running) = self.server.take() else {
            return self.current();
        };
        match process::terminate_gracefully(&mut running.child, self.grace).await {
            Ok(exit) => log::info!("Auxiliary server stopped ({exit})"),
            Err(err) => log::warn!("Failed to reap auxiliary server: {err}"),
        }
        self.pid.store(0, Ordering::SeqCst);
        let status = ServerStatus::default();
        self.set_status(status.clone());
        status
    }

    fn on_exit(&mut self, exit: io::Result<ExitStatus>) {
        let Some(running) = self.server.take() else {
            return;
        };
        self.pid.store(0, Ordering::SeqCst);
        let uptime = running.started.elapsed();
        let status = match exit {
            Ok(exit) if uptime < self.steady => {
                log::warn!("Auxiliary server exited during startup after {uptime:?} ({exit})");
                ServerStatus::failed(format!("server exited during startup ({exit})"))
            }
            Ok(exit) => {
                log::info!("Auxiliary server exited ({exit})");
                ServerStatus::default()
            }
            Err(err) => ServerStatus::failed(format!("failed to wait for server: {err}")),
        };
        self.set_status(status);
    }
}

/// Handle to the singleton server actor.
pub struct AuxiliaryServer {
    commands: mpsc::Sender<ServerCommand>,
    status: watch::Receiver<ServerStatus>,
    pid: Arc<AtomicU32>,
    shutting_down: Arc<AtomicBool>,
}

impl AuxiliaryServer {
    pub fn spawn(launch: AuxiliaryLaunch, bus: EventBus, grace: Duration, steady: Duration) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        let (status_tx, status) = watch::channel(ServerStatus::default());
        let pid = Arc::new(AtomicU32::new(0));
        let shutting_down = Arc::new(AtomicBool::new(false));
        let actor = ServerActor {
            launch,
            bus,
            grace,
            steady,
            status: status_tx,
            pid: Arc::clone(&pid),
            shutting_down: Arc::clone(&shutting_down),
            server: None,
        };
        tokio::spawn(actor.run(rx));
        Self {
            commands,
            status,
            pid,
            shutting_down,
        }
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<ServerStatus>) -> ServerCommand,
    ) -> Result<ServerStatus> {
        let closed = || ArborError::invalid_state("auxiliary-server", "shut down", "available");
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| closed())?;
        response.await.map_err(|_| closed())
    }

    /// Starts the server; returns the current status unchanged when already running.
    pub async fn start(&self, config: AuxiliaryConfig) -> Result<ServerStatus> {
        self.request(|reply| ServerCommand::Start { config, reply })
            .await
    }

    pub async fn stop(&self) -> Result<ServerStatus> {
        self.request(|reply| ServerCommand::Stop { reply }).await
    }

    pub async fn restart(&self, config: AuxiliaryConfig) -> Result<ServerStatus> {
        self.request(|reply| ServerCommand::Restart { config, reply })
            .await
    }

    pub fn status(&self) -> ServerStatus {
        self.status.borrow().clone()
    }

    /// Shutdown-only SIGKILL of the server's process group. Publishes nothing.
    pub fn cleanup(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let pid = self.pid.swap(0, Ordering::SeqCst);
        if pid == 0 {
            return;
        }
        log::info!("Killing auxiliary server (pid {pid}) at shutdown");
        #[cfg(unix)]
        {
            process::signal_process_group(pid, process::SIGKILL);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn server(script: &str, grace_ms: u64, steady_ms: u64) -> (AuxiliaryServer, EventBus) {
        let bus = EventBus::new(64);
        let launch = AuxiliaryLaunch {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        };
        let server = AuxiliaryServer::spawn(
            launch,
            bus.clone(),
            Duration::from_millis(grace_ms),
            Duration::from_millis(steady_ms),
        );
        (server, bus)
    }

    fn config(port: u16) -> AuxiliaryConfig {
        AuxiliaryConfig {
            webapp_port: port,
            ..AuxiliaryConfig::default()
        }
    }

    #[test]
    fn environment_skips_empty_values() {
        let env = AuxiliaryConfig {
            webapp_port: 3006,
            cli_api_token: "tok".to_string(),
            webapp_url: String::new(),
            ..AuxiliaryConfig::default()
        }
        .environment();
        assert_eq!(
            env,
            vec![
                ("WEBAPP_PORT", "3006".to_string()),
                ("CLI_API_TOKEN", "tok".to_string())
            ]
        );
    }

    #[test]
    fn tokens_are_64_hex_chars_and_unique() {
        let a = generate_token().unwrap();
        let b = generate_token().unwrap();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn concurrent_starts_spawn_one_process() {
        let (server, _bus) = server("sleep 30", 1000, 100);
        let (first, second) = tokio::join!(server.start(config(4001)), server.start(config(4002)));
        let (first, second) = (first.unwrap(), second.unwrap());

        assert!(first.running);
        assert_eq!(first, second);
        assert_eq!(server.status(), first);

        let stopped = server.stop().await.unwrap();
        assert!(!stopped.running);
        assert!(!process::process_alive(first.pid.unwrap()));
    }

    #[tokio::test]
    async fn stop_force_kills_after_grace() {
        let (server, _bus) = server("trap '' TERM; while true; do sleep 1; done", 300, 100);
        let running = server.start(config(4003)).await.unwrap();
        assert!(running.running);

        let started = std::time::Instant::now();
        let stopped = timeout(Duration::from_secs(5), server.stop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stopped, ServerStatus::default());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn early_exit_is_failed_and_published() {
        let (server, bus) = server("exit 3", 1000, 5_000);
        let mut events = bus.subscribe_auxiliary_status();
        server.start(config(4004)).await.unwrap();

        assert!(events.recv().await.unwrap().running);
        let failed = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(failed.is_failed());
        assert!(!failed.running);
        assert_eq!(server.status(), failed);
    }

    #[tokio::test]
    async fn spawn_error_is_failed() {
        let bus = EventBus::new(8);
        let launch = AuxiliaryLaunch {
            program: "/nonexistent/arbor-aux".to_string(),
            args: Vec::new(),
        };
        let server = AuxiliaryServer::spawn(launch, bus, Duration::from_secs(1), Duration::from_secs(1));
        let status = server.start(config(4005)).await.unwrap();
        assert!(status.is_failed());
        assert!(!status.running);
    }

    #[tokio::test]
    async fn restart_replaces_the_process() {
        let (server, bus) = server("sleep 30", 1000, 100);
        let mut events = bus.subscribe_auxiliary_status();
        let first = server.start(config(4006)).await.unwrap();
        let second = server.restart(config(4007)).await.unwrap();

        assert!(second.running);
        assert_ne!(first.pid, second.pid);
        assert_eq!(second.port, Some(4007));

        let seen: Vec<bool> = (0..3).map(|_| events.try_recv().unwrap().running).collect();
        assert_eq!(seen, [true, false, true]);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_kills_without_events() {
        let (server, bus) = server("sleep 30", 1000, 100);
        let running = server.start(config(4008)).await.unwrap();
        let mut events = bus.subscribe_auxiliary_status();

        server.cleanup();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!process::process_alive(running.pid.unwrap()));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn port_zero_is_handed_to_the_server_as_is() {
        let (server, _bus) = server(r#"[ "$WEBAPP_PORT" = 0 ] && exec sleep 30; exit 1"#, 1000, 100);
        let status = server.start(config(0)).await.unwrap();
        assert!(status.running, "{status:?}");
        assert_eq!(status.port, Some(0));
        server.stop().await.unwrap();
    }
}
