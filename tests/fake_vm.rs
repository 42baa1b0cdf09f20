//! In-process runtime service and launcher doubles plus a request driver.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;
use vmdap::adapter::DebugAdapter;
use vmdap::dap::client::{ClientSender, Outgoing, TerminationSignal};
use vmdap::dap::protocol::{DapRequest, LaunchArguments};
use vmdap::launcher::LaunchStrategy;
use vmdap::proxy::{ProxyError, ServiceProxy};
use vmdap::vm::service::{RpcError, StreamEvent, VmConnection, VmConnector, VmService};
use vmdap::vm::types::{
    ClassRef, Event, EventKind, ExceptionPauseMode, Frame, FuncRef, InstanceKind, InstanceRef,
    Isolate, IsolateRef, Obj, ObjRef, ScriptRef, SourceLocation, Stack, StepOption, Vm,
    VmBreakpoint,
};

pub const WAIT: Duration = Duration::from_secs(5);
pub const SERVICE_URI: &str = "http://127.0.0.1:8181/abc=/";

pub fn isolate_ref(id: &str) -> IsolateRef {
    IsolateRef {
        id: id.to_string(),
        name: "main".to_string(),
        ..Default::default()
    }
}

pub fn instance(id: &str, kind: InstanceKind, class: &str, value: Option<&str>) -> InstanceRef {
    InstanceRef {
        id: id.to_string(),
        kind,
        class_ref: Some(ClassRef {
            id: None,
            name: class.to_string(),
        }),
        value_as_string: value.map(ToString::to_string),
        ..Default::default()
    }
}

pub fn frame(index: usize, function: &str, uri: &str, line: i64) -> Frame {
    Frame {
        index,
        function: Some(FuncRef {
            id: None,
            name: function.to_string(),
        }),
        location: Some(SourceLocation {
            script: ScriptRef {
                id: format!("scripts/{index}"),
                uri: uri.to_string(),
            },
            token_pos: 0,
            line: Some(line),
            column: Some(1),
        }),
        ..Default::default()
    }
}

pub fn pause_event(kind: EventKind, isolate_id: &str) -> Event {
    Event {
        kind,
        isolate: Some(isolate_ref(isolate_id)),
        ..Default::default()
    }
}

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    isolates: Vec<Isolate>,
    /// Live breakpoints: id -> (isolate, uri, line).
    breakpoints: HashMap<String, (String, String, i64)>,
    next_breakpoint: i64,
    stack: Stack,
    evaluations: HashMap<String, ObjRef>,
    objects: HashMap<String, Obj>,
    exception_mode: Option<ExceptionPauseMode>,
}

/// Scriptable runtime service recording every call it receives.
pub struct FakeVm {
    state: Mutex<FakeState>,
    events: Mutex<Option<mpsc::UnboundedSender<StreamEvent>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>,
}

impl FakeVm {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            events: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
        })
    }

    pub fn add_isolate(&self, id: &str) {
        self.state.lock().isolates.push(Isolate {
            id: id.to_string(),
            name: "main".to_string(),
            runnable: true,
            pause_event: None,
            libraries: vec![],
        });
    }

    pub fn set_stack(&self, stack: Stack) {
        self.state.lock().stack = stack;
    }

    pub fn set_evaluation(&self, expression: &str, result: ObjRef) {
        self.state
            .lock()
            .evaluations
            .insert(expression.to_string(), result);
    }

    pub fn set_object(&self, id: &str, obj: Obj) {
        self.state.lock().objects.insert(id.to_string(), obj);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn called(&self, method: &str) -> bool {
        self.state.lock().calls.iter().any(|c| c.starts_with(method))
    }

    pub fn exception_mode(&self) -> Option<ExceptionPauseMode> {
        self.state.lock().exception_mode
    }

    /// Lines of live breakpoints for `uri`, sorted.
    pub fn breakpoint_lines(&self, uri: &str) -> Vec<i64> {
        let mut lines: Vec<i64> = self
            .state
            .lock()
            .breakpoints
            .values()
            .filter(|(_, u, _)| u == uri)
            .map(|(_, _, line)| *line)
            .collect();
        lines.sort();
        lines
    }

    /// Lines of live breakpoints for `uri` in one isolate, sorted.
    pub fn isolate_breakpoint_lines(&self, isolate_id: &str, uri: &str) -> Vec<i64> {
        let mut lines: Vec<i64> = self
            .state
            .lock()
            .breakpoints
            .values()
            .filter(|(isolate, u, _)| isolate == isolate_id && u == uri)
            .map(|(_, _, line)| *line)
            .collect();
        lines.sort();
        lines
    }

    pub fn emit(&self, stream: &str, event: Event) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(StreamEvent {
                stream: stream.to_string(),
                event,
            });
        }
    }

    /// Drop the event channel, as a closed transport does.
    pub fn close(&self) {
        self.events.lock().take();
    }

    pub fn connection(self: &Arc<Self>) -> Option<VmConnection> {
        let events = self.receiver.lock().take()?;
        Some(VmConnection {
            service: self.clone(),
            events,
        })
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }

    /// Wait until `method` shows up in the call log.
    pub async fn wait_for_call(&self, method: &str) {
        tokio::time::timeout(WAIT, async {
            while !self.called(method) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("`{method}` was never called, calls: {:?}", self.calls()));
    }
}

fn compile_error(expression: &str) -> RpcError {
    RpcError::Server {
        code: RpcError::EXPRESSION_COMPILATION_ERROR,
        message: "Expression compilation error".to_string(),
        details: Some(format!(
            "org-dartlang-debug:synthetic_debug_expression:1:1: Error: Undefined name '{expression}'.\n{expression}\n^"
        )),
    }
}

#[async_trait]
impl VmService for FakeVm {
    async fn get_vm(&self) -> Result<Vm, RpcError> {
        self.record("getVM".to_string());
        let isolates = self
            .state
            .lock()
            .isolates
            .iter()
            .map(Isolate::to_ref)
            .collect();
        Ok(Vm {
            name: Some("vm".to_string()),
            isolates,
        })
    }

    async fn get_isolate(&self, isolate_id: &str) -> Result<Isolate, RpcError> {
        self.record(format!("getIsolate {isolate_id}"));
        self.state
            .lock()
            .isolates
            .iter()
            .find(|i| i.id == isolate_id)
            .cloned()
            .ok_or_else(|| RpcError::Server {
                code: 105,
                message: "Isolate must be runnable".to_string(),
                details: None,
            })
    }

    async fn get_stack(&self, isolate_id: &str, limit: Option<usize>) -> Result<Stack, RpcError> {
        self.record(format!("getStack {isolate_id} {limit:?}"));
        Ok(self.state.lock().stack.clone())
    }

    async fn get_object(
        &self,
        _isolate_id: &str,
        object_id: &str,
        _offset: Option<i64>,
        _count: Option<i64>,
    ) -> Result<Obj, RpcError> {
        self.record(format!("getObject {object_id}"));
        self.state
            .lock()
            .objects
            .get(object_id)
            .cloned()
            .ok_or_else(|| RpcError::Server {
                code: 100,
                message: "object not found".to_string(),
                details: None,
            })
    }

    async fn evaluate(
        &self,
        _isolate_id: &str,
        target_id: &str,
        expression: &str,
    ) -> Result<ObjRef, RpcError> {
        self.record(format!("evaluate {target_id} {expression}"));
        self.state
            .lock()
            .evaluations
            .get(expression)
            .cloned()
            .ok_or_else(|| compile_error(expression))
    }

    async fn evaluate_in_frame(
        &self,
        _isolate_id: &str,
        frame_index: usize,
        expression: &str,
    ) -> Result<ObjRef, RpcError> {
        self.record(format!("evaluateInFrame {frame_index} {expression}"));
        self.state
            .lock()
            .evaluations
            .get(expression)
            .cloned()
            .ok_or_else(|| compile_error(expression))
    }

    async fn stream_listen(&self, stream_id: &str) -> Result<(), RpcError> {
        self.record(format!("streamListen {stream_id}"));
        Ok(())
    }

    async fn call_service_extension(
        &self,
        method: &str,
        isolate_id: Option<&str>,
        args: Value,
    ) -> Result<Value, RpcError> {
        self.record(format!("{method} {isolate_id:?}"));
        Ok(json!({ "type": "Success", "echo": args }))
    }

    async fn resume(&self, isolate_id: &str, step: Option<StepOption>) -> Result<(), RpcError> {
        self.record(format!("resume {isolate_id} {step:?}"));
        Ok(())
    }

    async fn pause(&self, isolate_id: &str) -> Result<(), RpcError> {
        self.record(format!("pause {isolate_id}"));
        Ok(())
    }

    async fn add_breakpoint_with_script_uri(
        &self,
        isolate_id: &str,
        script_uri: &str,
        line: i64,
        _column: Option<i64>,
    ) -> Result<VmBreakpoint, RpcError> {
        self.record(format!("addBreakpointWithScriptUri {script_uri}:{line}"));
        // a real round trip lets other requests interleave here
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.next_breakpoint += 1;
        let id = format!("breakpoints/{}", state.next_breakpoint);
        state.breakpoints.insert(
            id.clone(),
            (isolate_id.to_string(), script_uri.to_string(), line),
        );
        Ok(VmBreakpoint {
            id,
            breakpoint_number: Some(state.next_breakpoint),
            resolved: false,
        })
    }

    async fn remove_breakpoint(&self, _isolate_id: &str, breakpoint_id: &str) -> Result<(), RpcError> {
        self.record(format!("removeBreakpoint {breakpoint_id}"));
        tokio::task::yield_now().await;
        self.state.lock().breakpoints.remove(breakpoint_id);
        Ok(())
    }

    async fn set_exception_pause_mode(
        &self,
        isolate_id: &str,
        mode: ExceptionPauseMode,
    ) -> Result<(), RpcError> {
        self.record(format!("setIsolatePauseMode {isolate_id} {mode}"));
        self.state.lock().exception_mode = Some(mode);
        Ok(())
    }

    async fn set_library_debuggable(
        &self,
        _isolate_id: &str,
        library_id: &str,
        debuggable: bool,
    ) -> Result<(), RpcError> {
        self.record(format!("setLibraryDebuggable {library_id} {debuggable}"));
        Ok(())
    }

    async fn dispose(&self) {
        self.record("dispose".to_string());
        self.close();
    }
}

/// Hands out the single connection of a [`FakeVm`].
pub struct FakeConnector {
    pub vm: Arc<FakeVm>,
    pub connected: Mutex<Option<Url>>,
}

#[async_trait]
impl VmConnector for FakeConnector {
    async fn connect(&self, uri: &Url) -> Result<VmConnection, RpcError> {
        *self.connected.lock() = Some(uri.clone());
        self.vm.connection().ok_or(RpcError::Closed)
    }
}

/// Launcher that never starts a process and always reports [`SERVICE_URI`].
#[derive(Default)]
pub struct FakeLauncher {
    pub calls: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl LaunchStrategy for FakeLauncher {
    async fn launch(&self, _args: &LaunchArguments) -> vmdap::error::Result<String> {
        self.calls.lock().push("launch");
        Ok(SERVICE_URI.to_string())
    }

    async fn attach(&self, args: &LaunchArguments) -> vmdap::error::Result<String> {
        self.calls.lock().push("attach");
        Ok(args
            .vm_service_uri
            .clone()
            .unwrap_or_else(|| SERVICE_URI.to_string()))
    }

    async fn disconnect(&self) {
        self.calls.lock().push("disconnect");
    }

    async fn terminate(&self) {
        self.calls.lock().push("terminate");
    }

    fn drains_output(&self) -> bool {
        false
    }

    fn terminate_on_vm_service_close(&self) -> bool {
        true
    }
}

/// Proxy double answering every start with the same outcome.
pub enum FakeProxy {
    /// Another proxy already serves the runtime at this uri.
    AlreadyProxied(&'static str),
    Broken(&'static str),
}

#[async_trait]
impl ServiceProxy for FakeProxy {
    async fn start(&self, _uri: &Url) -> Result<Url, ProxyError> {
        match self {
            FakeProxy::AlreadyProxied(existing) => {
                Err(ProxyError::AlreadyProxied(existing.to_string()))
            }
            FakeProxy::Broken(reason) => Err(ProxyError::Failed(reason.to_string())),
        }
    }

    async fn shutdown(&self) {}
}

/// Drives a [`DebugAdapter`] request by request and collects what it sends back.
pub struct TestSession {
    pub adapter: Arc<DebugAdapter>,
    pub vm: Arc<FakeVm>,
    pub connector: Arc<FakeConnector>,
    pub launcher: Arc<FakeLauncher>,
    queue: mpsc::UnboundedReceiver<Outgoing>,
    received: Vec<Value>,
    seq: i64,
}

impl TestSession {
    pub fn new(vm: Arc<FakeVm>) -> Self {
        Self::with_proxy(vm, None)
    }

    pub fn with_proxy(vm: Arc<FakeVm>, proxy: Option<Arc<dyn ServiceProxy>>) -> Self {
        let (client, queue) = ClientSender::new();
        let termination = TerminationSignal::new(client.clone());
        let connector = Arc::new(FakeConnector {
            vm: vm.clone(),
            connected: Mutex::new(None),
        });
        let launcher = Arc::new(FakeLauncher::default());
        let adapter = DebugAdapter::builder()
            .with_connector(connector.clone())
            .with_proxy(proxy)
            .build(client, termination, launcher.clone());
        Self {
            adapter,
            vm,
            connector,
            launcher,
            queue,
            received: vec![],
            seq: 0,
        }
    }

    /// Start a request without waiting for its response.
    pub fn send(&mut self, command: &str, arguments: Value) -> i64 {
        self.seq += 1;
        let req = DapRequest {
            seq: self.seq,
            r#type: "request".to_string(),
            command: command.to_string(),
            arguments,
        };
        self.adapter.submit(req);
        self.seq
    }

    pub async fn request(&mut self, command: &str, arguments: Value) -> Value {
        let seq = self.send(command, arguments);
        self.response(seq).await
    }

    /// Like [`Self::request`], asserting success and returning the body.
    pub async fn ok(&mut self, command: &str, arguments: Value) -> Value {
        let response = self.request(command, arguments).await;
        assert_eq!(response["success"], json!(true), "{command} failed: {response}");
        response.get("body").cloned().unwrap_or(Value::Null)
    }

    async fn next_message(&mut self) -> Value {
        let msg = tokio::time::timeout(WAIT, self.queue.recv())
            .await
            .expect("adapter went silent")
            .expect("adapter queue closed");
        let msg = msg.into_message(0).unwrap();
        self.received.push(msg.clone());
        msg
    }

    pub async fn response(&mut self, seq: i64) -> Value {
        let found = |msg: &Value| msg["type"] == json!("response") && msg["request_seq"] == json!(seq);
        if let Some(msg) = self.received.iter().find(|m| found(m)) {
            return msg.clone();
        }
        loop {
            let msg = self.next_message().await;
            if found(&msg) {
                return msg;
            }
        }
    }

    /// Wait for the `nth` (from 1) event named `name` since the session started.
    pub async fn nth_event(&mut self, name: &str, nth: usize) -> Value {
        loop {
            let seen: Vec<&Value> = self.events(name);
            if seen.len() >= nth {
                return seen[nth - 1].clone();
            }
            self.next_message().await;
        }
    }

    pub async fn event(&mut self, name: &str) -> Value {
        self.nth_event(name, 1).await
    }

    /// Events received so far, without waiting.
    pub fn events(&self, name: &str) -> Vec<&Value> {
        self.received
            .iter()
            .filter(|m| m["type"] == json!("event") && m["event"] == json!(name))
            .collect()
    }

    /// Pull everything queued right now.
    pub async fn drain(&mut self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(msg) = self.queue.try_recv() {
            self.received.push(msg.into_message(0).unwrap());
        }
    }

    /// `initialize`, `attach` and `configurationDone`, returning once attached.
    pub async fn attach(&mut self, extra: Value) {
        self.ok("initialize", json!({ "clientID": "test" })).await;
        self.event("initialized").await;
        let mut args = json!({ "vmServiceUri": SERVICE_URI });
        if let (Some(args), Some(extra)) = (args.as_object_mut(), extra.as_object()) {
            args.extend(extra.clone());
        }
        let attach = self.send("attach", args);
        self.ok("configurationDone", Value::Null).await;
        let response = self.response(attach).await;
        assert_eq!(response["success"], json!(true), "attach failed: {response}");
    }

    /// Pause `isolate` with `event` and return the client thread id from the stopped event.
    pub async fn pause(&mut self, event: Event) -> i64 {
        let stopped = self.events(vmdap::dap::protocol::event::STOPPED).len();
        self.vm.emit("Debug", event);
        let stopped = self
            .nth_event(vmdap::dap::protocol::event::STOPPED, stopped + 1)
            .await;
        stopped["body"]["threadId"].as_i64().unwrap()
    }
}
