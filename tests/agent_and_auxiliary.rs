#![cfg(unix)]

use arbor::domains::agents::{AgentMessage, AgentStartOptions, AgentState};
use arbor::domains::auxiliary::AuxiliaryConfig;
use arbor::infrastructure::config::{ArborConfig, AuxiliaryLaunch, CustomAgent};
use arbor::SessionRegistry;
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;

fn registry(aux_script: &str) -> SessionRegistry {
    let config = ArborConfig {
        stop_grace_ms: 300,
        auxiliary_steady_ms: 100,
        auxiliary: AuxiliaryLaunch {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), aux_script.to_string()],
        },
        agents: vec![
            CustomAgent {
                id: "echo".to_string(),
                name: "Echo".to_string(),
                command: "sh -c 'exec cat'".to_string(),
            },
            CustomAgent {
                id: "crasher".to_string(),
                name: "Crasher".to_string(),
                command: "sh -c 'read line; exit 9'".to_string(),
            },
        ],
        ..ArborConfig::default()
    };
    SessionRegistry::new(config)
}

fn start_options(agent_id: &str, workdir: &std::path::Path) -> AgentStartOptions {
    AgentStartOptions {
        agent_id: agent_id.to_string(),
        workdir: workdir.to_string_lossy().into_owned(),
        args: Vec::new(),
        env: Vec::new(),
        custom_agent: None,
    }
}

fn port(webapp_port: u16) -> AuxiliaryConfig {
    AuxiliaryConfig {
        webapp_port,
        ..AuxiliaryConfig::default()
    }
}

#[tokio::test]
async fn agent_messages_arrive_in_order_and_stop_is_not_a_crash() {
    let registry = registry("sleep 30");
    let mut messages = registry.events().subscribe_agent_message();
    let mut statuses = registry.events().subscribe_agent_status();
    let dir = tempfile::tempdir().unwrap();

    let id = registry
        .agents()
        .start(start_options("echo", dir.path()))
        .await
        .unwrap();
    for n in 0..5 {
        registry
            .agents()
            .send(&id, &json!({"type": "user", "n": n}).to_string())
            .await
            .unwrap();
    }

    for n in 0..5 {
        let event = timeout(Duration::from_secs(5), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.session_id, id);
        assert_eq!(event.message, AgentMessage::Json(json!({"type": "user", "n": n})));
    }

    assert_eq!(registry.agents().stop(&id).await.unwrap(), AgentState::Stopped);
    let mut seen = Vec::new();
    while let Ok(event) = statuses.try_recv() {
        seen.push(event.state.name());
    }
    assert_eq!(seen, ["starting", "running", "stopping", "stopped"]);
    assert_eq!(registry.agents().status(&id).unwrap_err().kind(), "NotFound");
    registry.shutdown().await;
}

#[tokio::test]
async fn agent_crash_is_reported_as_failed() {
    let registry = registry("sleep 30");
    let mut statuses = registry.events().subscribe_agent_status();
    let dir = tempfile::tempdir().unwrap();

    let id = registry
        .agents()
        .start(start_options("crasher", dir.path()))
        .await
        .unwrap();
    registry.agents().send(&id, "go").await.unwrap();

    let failed = loop {
        let event = timeout(Duration::from_secs(5), statuses.recv())
            .await
            .unwrap()
            .unwrap();
        if event.state.is_terminal() {
            break event.state;
        }
    };
    assert!(matches!(failed, AgentState::Failed { .. }), "got {failed:?}");
    registry.shutdown().await;
}

#[tokio::test]
async fn concurrent_auxiliary_starts_share_one_process() {
    let registry = registry("sleep 30");
    let aux = registry.auxiliary();

    let (first, second) = tokio::join!(aux.start(port(5101)), aux.start(port(5102)));
    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(first.running);
    assert_eq!(first, second);
    assert!(matches!(first.port, Some(5101) | Some(5102)));

    let stopped = aux.stop().await.unwrap();
    assert!(!stopped.running);
    assert!(!arbor::shared::process::process_alive(first.pid.unwrap()));
    registry.shutdown().await;
}

#[tokio::test]
async fn stubborn_auxiliary_server_is_force_killed() {
    let registry = registry("trap '' TERM; while true; do sleep 1; done");
    let aux = registry.auxiliary();
    let running = aux.start(port(5103)).await.unwrap();
    assert!(running.running);

    let started = std::time::Instant::now();
    let stopped = timeout(Duration::from_secs(5), aux.stop())
        .await
        .expect("stop must not hang")
        .unwrap();
    assert!(!stopped.running);
    assert!(stopped.error.is_none());
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(aux.status(), stopped);
    registry.shutdown().await;
}

#[tokio::test]
async fn shutdown_reclaims_every_process() {
    let registry = registry("sleep 30");
    let dir = tempfile::tempdir().unwrap();
    let running = registry.auxiliary().start(port(5104)).await.unwrap();
    registry
        .agents()
        .start(start_options("echo", dir.path()))
        .await
        .unwrap();

    registry.shutdown().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(registry.agents().list().is_empty());
    assert!(!arbor::shared::process::process_alive(running.pid.unwrap()));
}
