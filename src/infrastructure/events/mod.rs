use crate::domains::agents::{AgentMessage, AgentState};
use crate::domains::auxiliary::ServerStatus;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Serialize, Serializer};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    TerminalData,
    TerminalExit,
    AgentMessage,
    AgentStatus,
    AuxiliaryStatusChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TerminalData => "arbor:terminal-data",
            EventKind::TerminalExit => "arbor:terminal-exit",
            EventKind::AgentMessage => "arbor:agent-message",
            EventKind::AgentStatus => "arbor:agent-status",
            EventKind::AuxiliaryStatusChanged => "arbor:auxiliary-status-changed",
        }
    }
}

pub(crate) fn serialize_base64<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(data))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalDataEvent {
    pub session_id: String,
    pub seq: u64,
    #[serde(serialize_with = "serialize_base64")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalExitEvent {
    pub session_id: String,
    pub exit_code: Option<u32>,
    pub signal: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessageEvent {
    pub session_id: String,
    pub seq: u64,
    pub message: AgentMessage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusEvent {
    pub session_id: String,
    pub agent_id: String,
    pub state: AgentState,
}

/// Envelope handed to observers; serializes as `{"event": name, "payload": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum ArborEvent {
    #[serde(rename = "arbor:terminal-data")]
    TerminalData(TerminalDataEvent),
    #[serde(rename = "arbor:terminal-exit")]
    TerminalExit(TerminalExitEvent),
    #[serde(rename = "arbor:agent-message")]
    AgentMessage(AgentMessageEvent),
    #[serde(rename = "arbor:agent-status")]
    AgentStatus(AgentStatusEvent),
    #[serde(rename = "arbor:auxiliary-status-changed")]
    AuxiliaryStatusChanged(ServerStatus),
}

impl ArborEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ArborEvent::TerminalData(_) => EventKind::TerminalData,
            ArborEvent::TerminalExit(_) => EventKind::TerminalExit,
            ArborEvent::AgentMessage(_) => EventKind::AgentMessage,
            ArborEvent::AgentStatus(_) => EventKind::AgentStatus,
            ArborEvent::AuxiliaryStatusChanged(_) => EventKind::AuxiliaryStatusChanged,
        }
    }
}

/// Disposer returned by [`EventBus::observe`]; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One typed broadcast channel per event category plus a combined stream that keeps
/// the publish order across categories. Publishing never fails, even with no
/// observers attached.
#[derive(Clone)]
pub struct EventBus {
    all: broadcast::Sender<ArborEvent>,
    terminal_data: broadcast::Sender<TerminalDataEvent>,
    terminal_exit: broadcast::Sender<TerminalExitEvent>,
    agent_message: broadcast::Sender<AgentMessageEvent>,
    agent_status: broadcast::Sender<AgentStatusEvent>,
    auxiliary_status: broadcast::Sender<ServerStatus>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            all: broadcast::channel(capacity).0,
            terminal_data: broadcast::channel(capacity).0,
            terminal_exit: broadcast::channel(capacity).0,
            agent_message: broadcast::channel(capacity).0,
            agent_status: broadcast::channel(capacity).0,
            auxiliary_status: broadcast::channel(capacity).0,
        }
    }

    fn publish<T: Clone>(&self, typed: &broadcast::Sender<T>, event: T, wrap: fn(T) -> ArborEvent) {
        if typed.receiver_count() > 0 {
            let _ = typed.send(event.clone());
        }
        let _ = self.all.send(wrap(event));
    }

    pub fn publish_terminal_data(&self, event: TerminalDataEvent) {
        self.publish(&self.terminal_data, event, ArborEvent::TerminalData);
    }

    pub fn publish_terminal_exit(&self, event: TerminalExitEvent) {
        self.publish(&self.terminal_exit, event, ArborEvent::TerminalExit);
    }

    pub fn publish_agent_message(&self, event: AgentMessageEvent) {
        self.publish(&self.agent_message, event, ArborEvent::AgentMessage);
    }

    pub fn publish_agent_status(&self, event: AgentStatusEvent) {
        self.publish(&self.agent_status, event, ArborEvent::AgentStatus);
    }

    pub fn publish_auxiliary_status(&self, status: ServerStatus) {
        self.publish(
            &self.auxiliary_status,
            status,
            ArborEvent::AuxiliaryStatusChanged,
        );
    }

    pub fn subscribe_terminal_data(&self) -> broadcast::Receiver<TerminalDataEvent> {
        self.terminal_data.subscribe()
    }

    pub fn subscribe_terminal_exit(&self) -> broadcast::Receiver<TerminalExitEvent> {
        self.terminal_exit.subscribe()
    }

    pub fn subscribe_agent_message(&self) -> broadcast::Receiver<AgentMessageEvent> {
        self.agent_message.subscribe()
    }

    pub fn subscribe_agent_status(&self) -> broadcast::Receiver<AgentStatusEvent> {
        self.agent_status.subscribe()
    }

    pub fn subscribe_auxiliary_status(&self) -> broadcast::Receiver<ServerStatus> {
        self.auxiliary_status.subscribe()
    }

    /// Forwards every event of `kind` to `handler` until the returned
    /// subscription is dropped. Must be called from within a tokio runtime.
    pub fn observe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(ArborEvent) + Send + Sync + 'static,
    {
        self.forward(Some(kind), handler)
    }

    /// Forwards every event, in publish order across all categories.
    pub fn observe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ArborEvent) + Send + Sync + 'static,
    {
        self.forward(None, handler)
    }

    fn forward<F>(&self, only: Option<EventKind>, handler: F) -> Subscription
    where
        F: Fn(ArborEvent) + Send + Sync + 'static,
    {
        let mut rx = self.all.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if only.is_none() || only == Some(event.kind()) => handler(event),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Event observer lagged behind, dropped {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { handle }
    }
}
