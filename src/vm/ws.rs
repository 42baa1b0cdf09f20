//! JSON-RPC 2.0 client of the runtime service over a websocket.

use crate::vm::service::{RpcError, StreamEvent, VmConnection, VmConnector, VmService};
use crate::vm::types::{
    Event, ExceptionPauseMode, Isolate, Obj, ObjRef, Stack, StepOption, Vm, VmBreakpoint,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value, RpcError>>>>>;

pub struct WsVmService {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WsVmService {
    pub async fn connect(uri: &Url) -> Result<VmConnection, RpcError> {
        let (socket, _) = tokio_tungstenite::connect_async(uri.as_str())
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(Self::from_socket(socket))
    }

    /// Drive an already open websocket.
    pub fn from_socket<S>(socket: WebSocketStream<S>) -> VmConnection
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    log::debug!(target: "vm", "websocket send: {e}");
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        let reader = tokio::spawn({
            let pending = pending.clone();
            let closed = closed.clone();
            async move {
                while let Some(msg) = stream.next().await {
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::debug!(target: "vm", "websocket receive: {e}");
                            break;
                        }
                    };
                    match msg {
                        Message::Text(text) => dispatch_incoming(text.as_str(), &pending, &event_tx),
                        Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                            Ok(text) => dispatch_incoming(text, &pending, &event_tx),
                            Err(e) => log::warn!(target: "vm", "non utf-8 frame: {e}"),
                        },
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
                fail_pending(&closed, &pending);
            }
        });

        let service = WsVmService {
            outgoing: out_tx,
            pending,
            closed,
            next_id: AtomicU64::new(1),
            reader: Mutex::new(Some(reader)),
        };
        VmConnection {
            service: Arc::new(service),
            events: event_rx,
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);
        // the reader sets `closed` before draining, so a waiter inserted late is removed here
        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().remove(&id);
            return Err(RpcError::Closed);
        }

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        log::trace!(target: "vm", "-> {request}");
        if self.outgoing.send(Message::Text(request.to_string().into())).is_err() {
            self.pending.lock().remove(&id);
            return Err(RpcError::Closed);
        }

        rx.await.map_err(|_| RpcError::Closed)?
    }

    async fn call_typed<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let result = self.call(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }
}

fn fail_pending(closed: &AtomicBool, pending: &Pending) {
    closed.store(true, Ordering::SeqCst);
    for (_, waiter) in pending.lock().drain() {
        let _ = waiter.send(Err(RpcError::Closed));
    }
}

fn dispatch_incoming(text: &str, pending: &Pending, events: &mpsc::UnboundedSender<StreamEvent>) {
    log::trace!(target: "vm", "<- {text}");
    let msg: Value = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!(target: "vm", "malformed message from vm service: {e}");
            return;
        }
    };

    if msg.get("method").and_then(Value::as_str) == Some("streamNotify") {
        let params = &msg["params"];
        let stream = params["streamId"].as_str().unwrap_or_default().to_string();
        match serde_json::from_value::<Event>(params["event"].clone()) {
            Ok(event) => {
                let _ = events.send(StreamEvent { stream, event });
            }
            Err(e) => log::warn!(target: "vm", "undecodable event on {stream}: {e}"),
        }
        return;
    }

    let id = match &msg["id"] {
        Value::String(id) => id.clone(),
        Value::Number(id) => id.to_string(),
        _ => return,
    };
    let Some(waiter) = pending.lock().remove(&id) else {
        log::debug!(target: "vm", "response to unknown request {id}");
        return;
    };

    let result = match (msg.get("result"), msg.get("error")) {
        (_, Some(error)) => Err(RpcError::Server {
            code: error["code"].as_i64().unwrap_or_default(),
            message: error["message"].as_str().unwrap_or_default().to_string(),
            details: error["data"]["details"].as_str().map(ToString::to_string),
        }),
        (Some(result), None) => Ok(result.clone()),
        (None, None) => Ok(Value::Null),
    };
    let _ = waiter.send(result);
}

fn params(pairs: &[(&str, Value)]) -> Value {
    let mut map = Map::new();
    for (key, value) in pairs {
        if !value.is_null() {
            map.insert(key.to_string(), value.clone());
        }
    }
    Value::Object(map)
}

#[async_trait]
impl VmService for WsVmService {
    async fn get_vm(&self) -> Result<Vm, RpcError> {
        self.call_typed("getVM", json!({})).await
    }

    async fn get_isolate(&self, isolate_id: &str) -> Result<Isolate, RpcError> {
        self.call_typed("getIsolate", json!({ "isolateId": isolate_id }))
            .await
    }

    async fn get_stack(&self, isolate_id: &str, limit: Option<usize>) -> Result<Stack, RpcError> {
        self.call_typed(
            "getStack",
            params(&[("isolateId", json!(isolate_id)), ("limit", json!(limit))]),
        )
        .await
    }

    async fn get_object(
        &self,
        isolate_id: &str,
        object_id: &str,
        offset: Option<i64>,
        count: Option<i64>,
    ) -> Result<Obj, RpcError> {
        self.call_typed(
            "getObject",
            params(&[
                ("isolateId", json!(isolate_id)),
                ("objectId", json!(object_id)),
                ("offset", json!(offset)),
                ("count", json!(count)),
            ]),
        )
        .await
    }

    async fn evaluate(
        &self,
        isolate_id: &str,
        target_id: &str,
        expression: &str,
    ) -> Result<ObjRef, RpcError> {
        self.call_typed(
            "evaluate",
            json!({ "isolateId": isolate_id, "targetId": target_id, "expression": expression }),
        )
        .await
    }

    async fn evaluate_in_frame(
        &self,
        isolate_id: &str,
        frame_index: usize,
        expression: &str,
    ) -> Result<ObjRef, RpcError> {
        self.call_typed(
            "evaluateInFrame",
            json!({ "isolateId": isolate_id, "frameIndex": frame_index, "expression": expression }),
        )
        .await
    }

    async fn stream_listen(&self, stream_id: &str) -> Result<(), RpcError> {
        self.call("streamListen", json!({ "streamId": stream_id }))
            .await
            .map(drop)
    }

    async fn call_service_extension(
        &self,
        method: &str,
        isolate_id: Option<&str>,
        args: Value,
    ) -> Result<Value, RpcError> {
        let mut params = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        if let Some(isolate_id) = isolate_id {
            params.insert("isolateId".to_string(), json!(isolate_id));
        }
        self.call(method, Value::Object(params)).await
    }

    async fn resume(&self, isolate_id: &str, step: Option<StepOption>) -> Result<(), RpcError> {
        let step: Option<&'static str> = step.map(Into::into);
        self.call(
            "resume",
            params(&[("isolateId", json!(isolate_id)), ("step", json!(step))]),
        )
        .await
        .map(drop)
    }

    async fn pause(&self, isolate_id: &str) -> Result<(), RpcError> {
        self.call("pause", json!({ "isolateId": isolate_id }))
            .await
            .map(drop)
    }

    async fn add_breakpoint_with_script_uri(
        &self,
        isolate_id: &str,
        script_uri: &str,
        line: i64,
        column: Option<i64>,
    ) -> Result<VmBreakpoint, RpcError> {
        self.call_typed(
            "addBreakpointWithScriptUri",
            params(&[
                ("isolateId", json!(isolate_id)),
                ("scriptUri", json!(script_uri)),
                ("line", json!(line)),
                ("column", json!(column)),
            ]),
        )
        .await
    }

    async fn remove_breakpoint(&self, isolate_id: &str, breakpoint_id: &str) -> Result<(), RpcError> {
        self.call(
            "removeBreakpoint",
            json!({ "isolateId": isolate_id, "breakpointId": breakpoint_id }),
        )
        .await
        .map(drop)
    }

    async fn set_exception_pause_mode(
        &self,
        isolate_id: &str,
        mode: ExceptionPauseMode,
    ) -> Result<(), RpcError> {
        let mode: &'static str = mode.into();
        self.call(
            "setIsolatePauseMode",
            json!({ "isolateId": isolate_id, "exceptionPauseMode": mode }),
        )
        .await
        .map(drop)
    }

    async fn set_library_debuggable(
        &self,
        isolate_id: &str,
        library_id: &str,
        debuggable: bool,
    ) -> Result<(), RpcError> {
        self.call(
            "setLibraryDebuggable",
            json!({ "isolateId": isolate_id, "libraryId": library_id, "isDebuggable": debuggable }),
        )
        .await
        .map(drop)
    }

    async fn dispose(&self) {
        let _ = self.outgoing.send(Message::Close(None));
        fail_pending(&self.closed, &self.pending);
        // dropping the reader drops the event sender, closing the event channel
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

/// Opens websocket connections to runtime services.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl VmConnector for WsConnector {
    async fn connect(&self, uri: &Url) -> Result<VmConnection, RpcError> {
        WsVmService::connect(uri).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal runtime service: answers `getVM`, fails `evaluate`, pushes one event
    /// after `streamListen` and closes on `pause`.
    async fn serve_one(listener: TcpListener) {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            let Message::Text(text) = msg else { continue };
            let req: Value = serde_json::from_str(text.as_str()).unwrap();
            let id = req["id"].clone();
            let reply = match req["method"].as_str().unwrap() {
                "getVM" => json!({"jsonrpc": "2.0", "id": id, "result": {
                    "type": "VM",
                    "name": "vm",
                    "isolates": [{"type": "@Isolate", "id": "isolates/1", "name": "main"}]
                }}),
                "evaluate" => json!({"jsonrpc": "2.0", "id": id, "error": {
                    "code": 113,
                    "message": "Expression compilation error",
                    "data": {"details": "Error: Undefined name 'x'."}
                }}),
                "streamListen" => {
                    let ok = json!({"jsonrpc": "2.0", "id": id, "result": {"type": "Success"}});
                    ws.send(Message::Text(ok.to_string().into())).await.unwrap();
                    json!({"jsonrpc": "2.0", "method": "streamNotify", "params": {
                        "streamId": "Debug",
                        "event": {
                            "type": "Event",
                            "kind": "PauseInterrupted",
                            "isolate": {"type": "@Isolate", "id": "isolates/1", "name": "main"}
                        }
                    }})
                }
                _ => break,
            };
            ws.send(Message::Text(reply.to_string().into())).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_ws_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_one(listener));

        let uri = Url::parse(&format!("ws://{addr}/ws")).unwrap();
        let VmConnection {
            service,
            mut events,
        } = WsConnector.connect(&uri).await.unwrap();

        let vm = service.get_vm().await.unwrap();
        assert_eq!(vm.isolates[0].id, "isolates/1");

        let err = service
            .evaluate("isolates/1", "objects/1", "x")
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(RpcError::EXPRESSION_COMPILATION_ERROR));
        assert_eq!(
            err.full_message(),
            "Expression compilation error: Error: Undefined name 'x'."
        );

        service.stream_listen("Debug").await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.stream, "Debug");
        assert_eq!(event.event.kind, crate::vm::types::EventKind::PauseInterrupted);

        // unknown method makes the fake server hang up
        let err = service.pause("isolates/1").await.unwrap_err();
        assert!(matches!(err, RpcError::Closed));
        assert!(events.recv().await.is_none());
        server.await.unwrap();
    }
}
