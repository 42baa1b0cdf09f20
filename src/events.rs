//! Event dispatcher: routes runtime stream events once the debugger is initialized.

use crate::convert::ValueConverter;
use crate::dap::client::ClientSender;
use crate::dap::protocol::event;
use crate::gate::Gate;
use crate::isolates::IsolateManager;
use crate::vm::service::{StreamEvent, StreamId};
use crate::vm::types::{Event, EventKind, LogRecord, ObjRef};
use crate::weak_error;
use base64::Engine as _;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct EventDispatcher {
    isolates: Arc<IsolateManager>,
    converter: Arc<dyn ValueConverter>,
    client: ClientSender,
    initialized: Arc<Gate>,
}

impl EventDispatcher {
    pub fn new(
        isolates: Arc<IsolateManager>,
        converter: Arc<dyn ValueConverter>,
        client: ClientSender,
        initialized: Arc<Gate>,
    ) -> Self {
        Self {
            isolates,
            converter,
            client,
            initialized,
        }
    }

    /// Handle events in arrival order until the runtime closes the channel.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<StreamEvent>) {
        while let Some(StreamEvent { stream, event }) = events.recv().await {
            self.initialized.wait().await;
            self.dispatch(&stream, &event).await;
        }
        log::info!(target: "vm", "vm service event stream closed");
    }

    pub async fn dispatch(&self, stream: &str, event: &Event) {
        log::debug!(target: "vm", "{stream} event {}", event.kind);
        match event.kind {
            EventKind::ServiceExtensionAdded => {
                if let (Some(rpc), Some(isolate)) = (&event.extension_rpc, &event.isolate) {
                    self.client.send_event(
                        event::SERVICE_EXTENSION_ADDED,
                        json!({ "extensionRPC": rpc, "isolateId": isolate.id }),
                    );
                }
            }
            EventKind::ServiceRegistered => self.forward_service(event::SERVICE_REGISTERED, event),
            EventKind::ServiceUnregistered => {
                self.forward_service(event::SERVICE_UNREGISTERED, event)
            }
            EventKind::Logging => {
                if let Some(record) = &event.log_record {
                    self.handle_log_record(event, record).await;
                }
            }
            EventKind::WriteEvent => self.handle_output(stream, event),
            _ if stream == StreamId::Isolate.as_ref() || stream == StreamId::Debug.as_ref() => {
                weak_error!(self.isolates.handle_event(event).await, "handle runtime event:");
            }
            _ => {}
        }
    }

    fn forward_service(&self, name: &str, event: &Event) {
        self.client.send_event(
            name,
            json!({ "service": event.service, "method": event.method }),
        );
    }

    fn handle_output(&self, stream: &str, event: &Event) {
        let category = if stream == StreamId::Stderr.as_ref() {
            "stderr"
        } else {
            "stdout"
        };
        let Some(bytes) = &event.bytes else {
            return;
        };
        if let Some(decoded) = weak_error!(
            base64::engine::general_purpose::STANDARD.decode(bytes),
            "decode output:"
        ) {
            self.client
                .output(category, String::from_utf8_lossy(&decoded).into_owned());
        }
    }

    async fn handle_log_record(&self, event: &Event, record: &LogRecord) {
        let thread = event
            .isolate
            .as_ref()
            .and_then(|isolate| self.isolates.thread_for_isolate(&isolate.id));

        let display = |obj: ObjRef| {
            let thread = thread.clone();
            async move {
                match (&thread, &obj) {
                    (Some(thread), _) => {
                        self.converter
                            .to_display_string(thread, &obj, false, false)
                            .await
                    }
                    (None, ObjRef::Instance(instance)) => {
                        instance.value_as_string.clone().unwrap_or_default()
                    }
                    (None, _) => String::new(),
                }
            }
        };

        let logger = match &record.logger_name {
            Some(name) => display(ObjRef::Instance(name.clone())).await,
            None => String::new(),
        };
        let logger = logger.trim_matches('"');
        let prefix = if logger.is_empty() {
            "[log] ".to_string()
        } else {
            format!("[{logger}] ")
        };

        let message = display(ObjRef::Instance(record.message.clone())).await;
        let mut output = format!("{prefix}{}", message.trim_matches('"'));
        for extra in [&record.error, &record.stack_trace].into_iter().flatten() {
            if matches!(extra, ObjRef::Instance(i) if i.kind == crate::vm::types::InstanceKind::Null)
            {
                continue;
            }
            output.push('\n');
            output.push_str(display(extra.clone()).await.trim_matches('"'));
        }
        if !output.ends_with('\n') {
            output.push('\n');
        }
        self.client.output("stdout", output);
    }
}
