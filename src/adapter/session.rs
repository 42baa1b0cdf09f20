use crate::convert::ValueConverter;
use crate::dap::protocol::{LaunchArguments, SourceBreakpoint};
use crate::isolates::IsolateManager;
use crate::vm::service::VmService;
use crate::vm::types::ExceptionPauseMode;
use std::collections::HashMap;
use std::sync::Arc;
use strum_macros::Display;

/// Session lifecycle as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Created,
    Initializing,
    AwaitingConfiguration,
    Launching,
    Attaching,
    Running,
    Terminating,
    Closed,
}

/// Handles to an established runtime connection.
#[derive(Clone)]
pub(crate) struct Runtime {
    pub vm: Arc<dyn VmService>,
    pub isolates: Arc<IsolateManager>,
    pub converter: Arc<dyn ValueConverter>,
}

pub(crate) struct Session {
    pub state: SessionState,
    pub launch_args: Option<LaunchArguments>,
    /// Client breakpoints by script uri. Kept here so requests sent before the
    /// runtime is connected are not lost.
    pub breakpoints: HashMap<String, Vec<SourceBreakpoint>>,
    pub exception_mode: ExceptionPauseMode,
    pub client_logging: bool,
    pub runtime: Option<Runtime>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: SessionState::Created,
            launch_args: None,
            breakpoints: HashMap::new(),
            exception_mode: ExceptionPauseMode::default(),
            client_logging: false,
            runtime: None,
        }
    }
}

impl Session {
    pub fn allow_to_string(&self) -> bool {
        self.launch_args
            .as_ref()
            .and_then(|args| args.evaluate_to_string_in_debug_views)
            .unwrap_or(false)
    }

    pub fn cwd(&self) -> Option<&str> {
        self.launch_args.as_ref().and_then(|args| args.cwd.as_deref())
    }
}
