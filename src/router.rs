//! Turns request lines into response objects. Requests that feed a session's input
//! run one at a time in arrival order on a lane per session; everything else runs
//! on its own task.

use crate::api::{dispatch, Request};
use crate::errors::{ArborError, Result};
use crate::registry::SessionRegistry;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::SendError, UnboundedReceiver, UnboundedSender};

struct Queued {
    id: Value,
    request: Request,
}

pub struct RequestRouter {
    registry: Arc<SessionRegistry>,
    out: UnboundedSender<Value>,
    lanes: HashMap<String, UnboundedSender<Queued>>,
}

impl RequestRouter {
    pub fn new(registry: Arc<SessionRegistry>, out: UnboundedSender<Value>) -> Self {
        Self {
            registry,
            out,
            lanes: HashMap::new(),
        }
    }

    /// Accepts one request line. Must be called from within a tokio runtime.
    pub fn submit(&mut self, line: &str) {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                let _ = self.out.send(response(
                    Value::Null,
                    Err(ArborError::invalid_input("request", e)),
                ));
                return;
            }
        };
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        let request = match Request::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                let _ = self.out.send(response(id, Err(e)));
                return;
            }
        };

        match request.lane() {
            Some(lane) => self.enqueue(lane, Queued { id, request }),
            None => {
                let registry = Arc::clone(&self.registry);
                let out = self.out.clone();
                tokio::spawn(async move {
                    let result = dispatch(&registry, request).await;
                    let _ = out.send(response(id, result));
                });
            }
        }
    }

    fn enqueue(&mut self, lane: String, job: Queued) {
        self.lanes.retain(|_, tx| !tx.is_closed());
        let job = match self.lanes.get(&lane) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                Err(SendError(job)) => job,
            },
            None => job,
        };

        log::debug!("Opening request lane {lane}");
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_lane(
            Arc::clone(&self.registry),
            rx,
            self.out.clone(),
        ));
        let _ = tx.send(job);
        self.lanes.insert(lane, tx);
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.values().filter(|tx| !tx.is_closed()).count()
    }
}

/// Runs a lane's requests back to back. A destroy or stop closes the lane; whatever
/// was already queued still runs and later requests open a fresh lane.
async fn run_lane(
    registry: Arc<SessionRegistry>,
    mut rx: UnboundedReceiver<Queued>,
    out: UnboundedSender<Value>,
) {
    while let Some(Queued { id, request }) = rx.recv().await {
        let closes = request.ends_session();
        let result = dispatch(&registry, request).await;
        if closes {
            rx.close();
        }
        let _ = out.send(response(id, result));
    }
}

pub fn response(id: Value, result: Result<Value>) -> Value {
    match result {
        Ok(result) => json!({"id": id, "ok": true, "result": result}),
        Err(err) => {
            log::debug!("Request {id} failed: {err}");
            json!({"id": id, "ok": false, "error": err})
        }
    }
}
