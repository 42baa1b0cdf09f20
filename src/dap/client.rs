use crate::dap::protocol::{event, DapEvent, DapRequest, DapResponse, OutputEventBody};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Message queued for the client. Sequence numbers are assigned by the writer.
#[derive(Debug, Clone)]
pub enum Outgoing {
    Response {
        request_seq: i64,
        command: String,
        success: bool,
        message: Option<String>,
        body: Option<Value>,
    },
    Event {
        event: String,
        body: Option<Value>,
    },
}

impl Outgoing {
    pub fn into_message(self, seq: i64) -> serde_json::Result<Value> {
        match self {
            Outgoing::Response {
                request_seq,
                command,
                success,
                message,
                body,
            } => serde_json::to_value(DapResponse {
                seq,
                r#type: "response",
                request_seq,
                success,
                command,
                message,
                body,
            }),
            Outgoing::Event { event, body } => serde_json::to_value(DapEvent {
                seq,
                r#type: "event",
                event,
                body,
            }),
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        match self {
            Outgoing::Event { event, .. } => Some(event),
            Outgoing::Response { .. } => None,
        }
    }

    pub fn body(&self) -> Option<&Value> {
        match self {
            Outgoing::Response { body, .. } | Outgoing::Event { body, .. } => body.as_ref(),
        }
    }
}

/// Handle used by every component to talk to the client.
#[derive(Clone, Debug)]
pub struct ClientSender {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl ClientSender {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn push(&self, msg: Outgoing) {
        if self.tx.send(msg).is_err() {
            log::debug!(target: "dap", "client writer is gone, message dropped");
        }
    }

    /// Queue an event without logging on failure. Used by the client logger itself.
    pub fn try_send_event(&self, name: &str, body: Value) -> bool {
        self.tx
            .send(Outgoing::Event {
                event: name.to_string(),
                body: Some(body),
            })
            .is_ok()
    }

    fn to_body<T: Serialize>(body: T) -> Option<Value> {
        match serde_json::to_value(body) {
            Ok(Value::Null) => None,
            Ok(value) => Some(value),
            Err(e) => {
                log::error!(target: "dap", "serialize message body: {e}");
                None
            }
        }
    }

    pub fn respond<T: Serialize>(&self, req: &DapRequest, body: T) {
        self.push(Outgoing::Response {
            request_seq: req.seq,
            command: req.command.clone(),
            success: true,
            message: None,
            body: Self::to_body(body),
        })
    }

    pub fn respond_empty(&self, req: &DapRequest) {
        self.respond(req, Value::Null)
    }

    pub fn respond_error(&self, req: &DapRequest, message: impl ToString) {
        self.push(Outgoing::Response {
            request_seq: req.seq,
            command: req.command.clone(),
            success: false,
            message: Some(message.to_string()),
            body: None,
        })
    }

    pub fn send_event<T: Serialize>(&self, name: &str, body: T) {
        self.push(Outgoing::Event {
            event: name.to_string(),
            body: Self::to_body(body),
        })
    }

    pub fn output(&self, category: &'static str, output: impl Into<String>) {
        self.send_event(
            event::OUTPUT,
            OutputEventBody {
                category,
                output: output.into(),
            },
        )
    }
}

/// Sends the `terminated` event at most once per session, whatever triggers it.
#[derive(Clone, Debug)]
pub struct TerminationSignal {
    sent: Arc<AtomicBool>,
    restart: Arc<Mutex<Option<Value>>>,
    client: ClientSender,
}

impl TerminationSignal {
    pub fn new(client: ClientSender) -> Self {
        Self {
            sent: Arc::new(AtomicBool::new(false)),
            restart: Arc::default(),
            client,
        }
    }

    /// Restart data echoed back to the client in the `terminated` event.
    pub fn set_restart(&self, restart: Option<Value>) {
        *self.restart.lock() = restart;
    }

    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::SeqCst)
    }

    /// Send `terminated`. Return `false` if it was already sent.
    pub fn send_terminated(&self) -> bool {
        if self.sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        let body = self
            .restart
            .lock()
            .clone()
            .map(|restart| json!({ "restart": restart }));
        self.client.send_event(event::TERMINATED, body);
        true
    }
}
