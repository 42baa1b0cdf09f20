//! Session controller: serves client requests against one runtime connection.

mod inspect;
mod session;

pub use session::SessionState;

use crate::connect::{ConnectOptions, ConnectionEstablisher};
use crate::convert::{ValueConverter, VmValueConverter};
use crate::dap::client::{ClientSender, TerminationSignal};
use crate::dap::logger::ClientLogger;
use crate::dap::protocol::{
    event, Breakpoint, Capabilities, Command, ContinueResponseBody, DapRequest,
    ExceptionBreakpointsFilter, InitializeArguments, LaunchArguments, SetBreakpointsArguments,
    SetBreakpointsResponseBody, SetExceptionBreakpointsArguments, Source, Thread,
    ThreadsResponseBody,
};
use crate::error::{Error, Result};
use crate::evaluate_name::EvaluateNameTracker;
use crate::events::EventDispatcher;
use crate::gate::Gate;
use crate::isolates::{IsolateManager, LibrarySettings};
use crate::launcher::LaunchStrategy;
use crate::log::LOGGER_SWITCHER;
use crate::proxy::ServiceProxy;
use crate::refs::StoredData;
use crate::vm::service::{VmConnection, VmConnector};
use crate::vm::types::{ExceptionPauseMode, StepOption};
use crate::vm::ws::WsConnector;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use session::{Runtime, Session};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use url::Url;

/// Expression naming the exception the current thread is paused on.
pub const THREAD_EXCEPTION_EXPRESSION: &str = "$_threadException";

/// Frames reported beyond the known ones when the runtime truncated the stack.
pub const STACK_FRAME_BATCH_SIZE: i64 = 20;

/// Requests that change session or runtime state. They run one after another in arrival order.
fn is_ordered(command: &str) -> bool {
    matches!(
        command,
        "initialize"
            | "configurationDone"
            | "setBreakpoints"
            | "setExceptionBreakpoints"
            | "continue"
            | "next"
            | "stepIn"
            | "stepOut"
            | "pause"
    )
}

/// Builder of a [`DebugAdapter`].
pub struct AdapterBuilder {
    connector: Arc<dyn VmConnector>,
    proxy: Option<Arc<dyn ServiceProxy>>,
}

impl Default for AdapterBuilder {
    fn default() -> Self {
        Self {
            connector: Arc::new(WsConnector),
            proxy: None,
        }
    }
}

impl AdapterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom runtime connector (websocket by default).
    pub fn with_connector(self, connector: Arc<dyn VmConnector>) -> Self {
        Self { connector, ..self }
    }

    pub fn with_proxy(self, proxy: Option<Arc<dyn ServiceProxy>>) -> Self {
        Self { proxy, ..self }
    }

    pub fn build(
        self,
        client: ClientSender,
        termination: TerminationSignal,
        strategy: Arc<dyn LaunchStrategy>,
    ) -> Arc<DebugAdapter> {
        Arc::new_cyclic(|this| DebugAdapter {
            this: this.clone(),
            establisher: ConnectionEstablisher::new(self.connector, self.proxy, client.clone()),
            client,
            termination,
            strategy,
            configured: Arc::new(Gate::new()),
            initialized: Arc::new(Gate::new()),
            closed: Gate::new(),
            names: Arc::new(EvaluateNameTracker::default()),
            session: Mutex::new(Session::default()),
            ordered_tail: Mutex::new(None),
        })
    }
}

pub struct DebugAdapter {
    this: Weak<DebugAdapter>,
    client: ClientSender,
    termination: TerminationSignal,
    strategy: Arc<dyn LaunchStrategy>,
    establisher: ConnectionEstablisher,
    /// Opened by `configurationDone`.
    configured: Arc<Gate>,
    /// Opened once the isolates existing at connect time are registered.
    initialized: Arc<Gate>,
    closed: Gate,
    names: Arc<EvaluateNameTracker>,
    session: Mutex<Session>,
    /// Completion of the last ordered request, see [`is_ordered`].
    ordered_tail: Mutex<Option<Shared<oneshot::Receiver<()>>>>,
}

impl DebugAdapter {
    pub fn builder() -> AdapterBuilder {
        AdapterBuilder::new()
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().state
    }

    fn set_state(&self, state: SessionState) {
        let mut session = self.session.lock();
        log::debug!(target: "dap", "session state {} -> {state}", session.state);
        session.state = state;
    }

    /// Wait until the session is torn down.
    pub async fn closed(&self) {
        self.closed.wait().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_open()
    }

    fn runtime(&self) -> Result<Runtime> {
        self.session
            .lock()
            .runtime
            .clone()
            .ok_or(Error::NotConnected)
    }

    /// Start serving a request in the background. Must be called in the order requests arrive.
    ///
    /// Every request waits for the ordered requests received before it, except `disconnect`
    /// and `terminate` which must get through while a request hangs.
    pub fn submit(self: &Arc<Self>, req: DapRequest) {
        let adapter = self.clone();
        let (previous, done) = {
            let mut tail = self.ordered_tail.lock();
            let previous = match req.command.as_str() {
                "disconnect" | "terminate" => None,
                _ => tail.clone(),
            };
            let done = is_ordered(&req.command).then(|| {
                let (done, finished) = oneshot::channel::<()>();
                *tail = Some(finished.shared());
                done
            });
            (previous, done)
        };

        tokio::spawn(async move {
            if let Some(previous) = previous {
                // resolves once the previous ordered request dropped its sender
                let _ = previous.await;
            }
            adapter.handle(req).await;
            drop(done);
        });
    }

    /// Serve one client request. Errors become failed responses; fatal ones end the session.
    pub async fn handle(self: Arc<Self>, req: DapRequest) {
        let result = match Command::parse(&req.command, req.arguments.clone()) {
            Ok(command) => self.dispatch(&req, command).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            log::warn!(target: "dap", "request `{}` failed: {e}", req.command);
            self.client.respond_error(&req, &e);
            if e.is_fatal() {
                self.client.output("stderr", format!("{e}\n"));
                self.shutdown().await;
            }
        }
    }

    async fn dispatch(&self, req: &DapRequest, command: Command) -> Result<()> {
        if !matches!(command, Command::Initialize(_)) && self.state() == SessionState::Created {
            return Err(Error::NotInitialized(req.command.clone()));
        }

        match command {
            Command::Initialize(args) => {
                let capabilities = self.initialize(args);
                self.client.respond(req, capabilities);
                self.client.send_event(event::INITIALIZED, Value::Null);
            }
            Command::ConfigurationDone => {
                self.configured.open();
                self.client.respond_empty(req);
            }
            Command::Launch(args) => {
                self.start(args, false).await?;
                self.client.respond_empty(req);
            }
            Command::Attach(args) => {
                self.start(args, true).await?;
                self.client.respond_empty(req);
            }
            Command::SetBreakpoints(args) => {
                let body = self.set_breakpoints(args).await?;
                self.client.respond(req, body);
            }
            Command::SetExceptionBreakpoints(args) => {
                self.set_exception_breakpoints(args).await?;
                self.client.respond_empty(req);
            }
            Command::Continue(args) => {
                self.resume(args.thread_id, None).await?;
                self.client.respond(
                    req,
                    ContinueResponseBody {
                        all_threads_continued: false,
                    },
                );
            }
            Command::Next(args) => {
                self.resume(args.thread_id, Some(StepOption::Over)).await?;
                self.client.respond_empty(req);
            }
            Command::StepIn(args) => {
                self.resume(args.thread_id, Some(StepOption::Into)).await?;
                self.client.respond_empty(req);
            }
            Command::StepOut(args) => {
                self.resume(args.thread_id, Some(StepOption::Out)).await?;
                self.client.respond_empty(req);
            }
            Command::Pause(args) => {
                self.runtime()?.isolates.pause_thread(args.thread_id).await?;
                self.client.respond_empty(req);
            }
            Command::Threads => self.client.respond(req, self.threads()),
            Command::StackTrace(args) => {
                let body = self.stack_trace(args).await?;
                self.client.respond(req, body);
            }
            Command::Scopes(args) => {
                let body = self.scopes(args)?;
                self.client.respond(req, body);
            }
            Command::Variables(args) => {
                let body = self.variables(args).await?;
                self.client.respond(req, body);
            }
            Command::Evaluate(args) => {
                let body = self.evaluate(args).await?;
                self.client.respond(req, body);
            }
            Command::Source(args) => {
                let body = self.source(args).await?;
                self.client.respond(req, body);
            }
            Command::Disconnect(_) => {
                self.disconnect().await;
                self.client.respond_empty(req);
            }
            Command::Terminate(_) => {
                self.terminate().await;
                self.client.respond_empty(req);
            }
            Command::CallService(args) => {
                let result = self
                    .runtime()?
                    .vm
                    .call_service_extension(&args.method, args.isolate_id.as_deref(), args.params)
                    .await?;
                self.client.respond(req, result);
            }
        }
        Ok(())
    }

    fn initialize(&self, args: InitializeArguments) -> Capabilities {
        log::info!(
            target: "dap",
            "initialize from {}",
            args.client_name.or(args.client_id).unwrap_or_else(|| "unknown client".to_string())
        );
        {
            let mut session = self.session.lock();
            if session.state == SessionState::Created {
                session.state = SessionState::Initializing;
            }
        }

        let capabilities = Capabilities {
            supports_configuration_done_request: Some(true),
            supports_conditional_breakpoints: Some(true),
            supports_delayed_stack_trace_loading: Some(true),
            supports_evaluate_for_hovers: Some(true),
            supports_clipboard_context: Some(true),
            supports_terminate_request: Some(true),
            supports_restart_request: Some(false),
            supports_set_variable: Some(false),
            supports_log_points: Some(false),
            exception_breakpoint_filters: vec![
                ExceptionBreakpointsFilter {
                    filter: ExceptionPauseMode::All.to_string(),
                    label: "All Exceptions".to_string(),
                    default: false,
                },
                ExceptionBreakpointsFilter {
                    filter: ExceptionPauseMode::Unhandled.to_string(),
                    label: "Uncaught Exceptions".to_string(),
                    default: true,
                },
            ],
        };

        let mut session = self.session.lock();
        if session.state == SessionState::Initializing {
            session.state = SessionState::AwaitingConfiguration;
        }
        capabilities
    }

    async fn start(&self, args: LaunchArguments, attach: bool) -> Result<()> {
        {
            let mut session = self.session.lock();
            if session.launch_args.is_some() {
                return Err(Error::AlreadyStarted);
            }
            session.launch_args = Some(args.clone());
            session.state = if attach {
                SessionState::Attaching
            } else {
                SessionState::Launching
            };
        }
        self.termination.set_restart(args.restart.clone());

        if args.send_logs_to_client.unwrap_or(false) {
            let logger = ClientLogger::new(self.client.clone());
            let filter = logger.filter();
            LOGGER_SWITCHER.switch(logger, filter);
            self.session.lock().client_logging = true;
        }

        self.configured.wait().await;

        let uri = if attach {
            self.strategy.attach(&args).await?
        } else {
            self.strategy.launch(&args).await?
        };

        let options = ConnectOptions {
            use_proxy: args.use_proxy.unwrap_or(true),
            subscribe_output_streams: !self.strategy.drains_output(),
        };
        let (_, connection) = self.establisher.establish(&uri, options).await?;
        self.install_runtime(connection, &args).await?;
        self.set_state(SessionState::Running);
        Ok(())
    }

    /// Wire the runtime connection into the session and register existing isolates.
    async fn install_runtime(&self, connection: VmConnection, args: &LaunchArguments) -> Result<()> {
        let VmConnection { service, events } = connection;

        let isolates = Arc::new(IsolateManager::new(service.clone(), self.client.clone()));
        isolates.set_library_settings(LibrarySettings::new(
            args.debug_sdk_libraries.unwrap_or(false),
            args.debug_external_package_libraries.unwrap_or(false),
            args.cwd.as_deref().map(Path::new),
            &args.additional_project_paths,
        ));
        let converter: Arc<dyn ValueConverter> = Arc::new(VmValueConverter::new(
            service.clone(),
            isolates.clone(),
            self.names.clone(),
        ));

        {
            let mut session = self.session.lock();
            isolates.restore(session.breakpoints.clone(), session.exception_mode);
            session.runtime = Some(Runtime {
                vm: service.clone(),
                isolates: isolates.clone(),
                converter: converter.clone(),
            });
        }

        let dispatcher = EventDispatcher::new(
            isolates.clone(),
            converter,
            self.client.clone(),
            self.initialized.clone(),
        );
        let strategy = self.strategy.clone();
        let adapter = self.this.clone();
        tokio::spawn(async move {
            dispatcher.run(events).await;
            if strategy.terminate_on_vm_service_close() {
                log::info!(target: "dap", "vm service connection closed, ending the session");
                if let Some(adapter) = adapter.upgrade() {
                    adapter.shutdown().await;
                }
            }
        });

        let vm = service.get_vm().await?;
        for isolate_ref in vm.isolates {
            let isolate = service.get_isolate(&isolate_ref.id).await?;
            isolates.register_existing(&isolate).await?;
        }
        self.initialized.open();
        Ok(())
    }

    /// Runtime uri of a client source.
    fn source_uri(&self, source: &Source) -> Result<String> {
        if let Some(path) = &source.path {
            if ["file:", "package:", "dart:", "org-dartlang-"]
                .iter()
                .any(|scheme| path.starts_with(scheme))
            {
                return Ok(path.clone());
            }
            let mut path = PathBuf::from(path);
            if path.is_relative() {
                let base = match self.session.lock().cwd() {
                    Some(cwd) => PathBuf::from(cwd),
                    None => std::env::current_dir()?,
                };
                path = base.join(path);
            }
            return Url::from_file_path(&path)
                .map(String::from)
                .map_err(|_| Error::InvalidSourcePath(path.display().to_string()));
        }

        match source.source_reference.filter(|r| *r > 0) {
            Some(reference) => match self.runtime()?.isolates.get_stored_data(reference)?.1 {
                StoredData::Script(script) => Ok(script.uri),
                other => Err(Error::UnexpectedReference(reference, other.kind_name())),
            },
            None => Err(Error::SourceNotAvailable),
        }
    }

    async fn set_breakpoints(&self, args: SetBreakpointsArguments) -> Result<SetBreakpointsResponseBody> {
        let uri = self.source_uri(&args.source)?;
        let requested = args.requested();
        let runtime = {
            let mut session = self.session.lock();
            session.breakpoints.insert(uri.clone(), requested.clone());
            session.runtime.clone()
        };
        if let Some(runtime) = runtime {
            runtime.isolates.set_breakpoints(&uri, requested.clone()).await?;
        }

        // the runtime resolves breakpoints lazily, report them as accepted
        let breakpoints = requested
            .iter()
            .map(|bp| Breakpoint {
                id: None,
                verified: true,
                line: Some(bp.line),
                column: bp.column,
                source: Some(args.source.clone()),
            })
            .collect();
        Ok(SetBreakpointsResponseBody { breakpoints })
    }

    async fn set_exception_breakpoints(&self, args: SetExceptionBreakpointsArguments) -> Result<()> {
        let mode = ExceptionPauseMode::from_filters(&args.filters);
        let runtime = {
            let mut session = self.session.lock();
            session.exception_mode = mode;
            session.runtime.clone()
        };
        if let Some(runtime) = runtime {
            runtime.isolates.set_exception_pause_mode(mode).await?;
        }
        Ok(())
    }

    async fn resume(&self, thread_id: i64, step: Option<StepOption>) -> Result<()> {
        self.runtime()?
            .isolates
            .resume_thread(thread_id, step)
            .await
    }

    fn threads(&self) -> ThreadsResponseBody {
        let threads = self
            .runtime()
            .map(|runtime| runtime.isolates.threads())
            .unwrap_or_default()
            .into_iter()
            .map(|thread| Thread {
                id: thread.thread_id,
                name: thread.isolate.name,
            })
            .collect();
        ThreadsResponseBody { threads }
    }

    /// Forceful stop of the session. Safe to call more than once.
    pub async fn disconnect(&self) {
        if self.is_closed() {
            return;
        }
        self.set_state(SessionState::Terminating);
        self.strategy.disconnect().await;
        self.shutdown().await;
    }

    /// Ask the debuggee to exit, then disconnect.
    pub async fn terminate(&self) {
        if self.is_closed() {
            return;
        }
        self.set_state(SessionState::Terminating);
        self.strategy.terminate().await;
        self.disconnect().await;
    }

    async fn shutdown(&self) {
        let (runtime, client_logging) = {
            let mut session = self.session.lock();
            session.state = SessionState::Closed;
            (
                session.runtime.take(),
                std::mem::take(&mut session.client_logging),
            )
        };

        self.establisher.shutdown_proxy().await;
        if let Some(runtime) = runtime {
            runtime.vm.dispose().await;
        }
        self.termination.send_terminated();
        if client_logging {
            LOGGER_SWITCHER.switch_to_default();
        }
        self.closed.open();
    }
}
