//! Debug Adapter Protocol message model.
//!
//! Only the request surface served by the adapter is modeled, unknown
//! commands are rejected at parse time.

use crate::error::Error;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// DAP request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct DapRequest {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

/// DAP response envelope.
///
/// Note: the DAP specification allows responses with no `body` field at all.
/// Using a `serde_json::Value` keeps the envelope stable and avoids type
/// inference issues around `None` bodies.
#[derive(Debug, Serialize)]
pub struct DapResponse {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// DAP event envelope.
#[derive(Debug, Serialize)]
pub struct DapEvent {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Names of events sent to the client.
pub mod event {
    pub const INITIALIZED: &str = "initialized";
    pub const STOPPED: &str = "stopped";
    pub const CONTINUED: &str = "continued";
    pub const THREAD: &str = "thread";
    pub const OUTPUT: &str = "output";
    pub const EXITED: &str = "exited";
    pub const TERMINATED: &str = "terminated";

    pub const DEBUGGER_URIS: &str = "vmdap.debuggerUris";
    pub const SERVICE_EXTENSION_ADDED: &str = "vmdap.serviceExtensionAdded";
    pub const SERVICE_REGISTERED: &str = "vmdap.serviceRegistered";
    pub const SERVICE_UNREGISTERED: &str = "vmdap.serviceUnregistered";
    pub const LOG: &str = "vmdap.log";
}

// ------------------------------------- request arguments -----------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitializeArguments {
    #[serde(rename = "clientID")]
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    #[serde(rename = "adapterID")]
    pub adapter_id: Option<String>,
    pub locale: Option<String>,
    pub lines_start_at1: Option<bool>,
    pub columns_start_at1: Option<bool>,
    pub supports_variable_type: Option<bool>,
    pub supports_progress_reporting: Option<bool>,
}

/// Arguments of both `launch` and `attach` requests.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchArguments {
    pub program: Option<String>,
    pub args: Vec<String>,
    pub tool_args: Vec<String>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub vm_service_uri: Option<String>,
    pub vm_service_info_file: Option<String>,
    pub additional_project_paths: Vec<String>,
    pub debug_sdk_libraries: Option<bool>,
    pub debug_external_package_libraries: Option<bool>,
    pub evaluate_getters_in_debug_views: Option<bool>,
    pub evaluate_to_string_in_debug_views: Option<bool>,
    pub send_logs_to_client: Option<bool>,
    pub use_proxy: Option<bool>,
    #[serde(rename = "__restart")]
    pub restart: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_reference: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presentation_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBreakpoint {
    pub line: i64,
    #[serde(default)]
    pub column: Option<i64>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
    #[serde(default)]
    pub log_message: Option<String>,
}

impl SourceBreakpoint {
    pub fn at_line(line: i64) -> Self {
        Self {
            line,
            column: None,
            condition: None,
            hit_condition: None,
            log_message: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetBreakpointsArguments {
    pub source: Source,
    pub breakpoints: Option<Vec<SourceBreakpoint>>,
    /// Deprecated form of `breakpoints`.
    pub lines: Option<Vec<i64>>,
    pub source_modified: Option<bool>,
}

impl SetBreakpointsArguments {
    /// Requested breakpoints, the deprecated `lines` form is used when `breakpoints` is absent.
    pub fn requested(&self) -> Vec<SourceBreakpoint> {
        match (&self.breakpoints, &self.lines) {
            (Some(bps), _) => bps.clone(),
            (None, Some(lines)) => lines.iter().map(|&l| SourceBreakpoint::at_line(l)).collect(),
            (None, None) => vec![],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetExceptionBreakpointsArguments {
    pub filters: Vec<String>,
}

/// Arguments of `continue`, `next`, `stepIn`, `stepOut` and `pause`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadArguments {
    pub thread_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceArguments {
    pub thread_id: i64,
    #[serde(default)]
    pub start_frame: Option<i64>,
    #[serde(default)]
    pub levels: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopesArguments {
    pub frame_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesArguments {
    pub variables_reference: i64,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub count: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateArguments {
    pub expression: String,
    #[serde(default)]
    pub frame_id: Option<i64>,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceArguments {
    #[serde(default)]
    pub source: Option<Source>,
    pub source_reference: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DisconnectArguments {
    pub restart: Option<bool>,
    pub terminate_debuggee: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TerminateArguments {
    pub restart: Option<bool>,
}

/// Custom request forwarding a raw call to the runtime service.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallServiceArguments {
    pub method: String,
    pub params: Value,
    pub isolate_id: Option<String>,
}

/// Requests served by the adapter, keyed by the DAP `command` field.
#[derive(Debug, Clone)]
pub enum Command {
    Initialize(InitializeArguments),
    ConfigurationDone,
    Launch(LaunchArguments),
    Attach(LaunchArguments),
    SetBreakpoints(SetBreakpointsArguments),
    SetExceptionBreakpoints(SetExceptionBreakpointsArguments),
    Continue(ThreadArguments),
    Next(ThreadArguments),
    StepIn(ThreadArguments),
    StepOut(ThreadArguments),
    Pause(ThreadArguments),
    Threads,
    StackTrace(StackTraceArguments),
    Scopes(ScopesArguments),
    Variables(VariablesArguments),
    Evaluate(EvaluateArguments),
    Source(SourceArguments),
    Disconnect(DisconnectArguments),
    Terminate(TerminateArguments),
    CallService(CallServiceArguments),
}

impl Command {
    pub fn parse(command: &str, arguments: Value) -> Result<Self, Error> {
        fn args<T: DeserializeOwned>(command: &str, arguments: Value) -> Result<T, Error> {
            // a missing `arguments` field is an empty argument set
            let arguments = match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            };
            serde_json::from_value(arguments)
                .map_err(|e| Error::InvalidArguments(command.to_string(), e))
        }

        let cmd = match command {
            "initialize" => Command::Initialize(args(command, arguments)?),
            "configurationDone" => Command::ConfigurationDone,
            "launch" => Command::Launch(args(command, arguments)?),
            "attach" => Command::Attach(args(command, arguments)?),
            "setBreakpoints" => Command::SetBreakpoints(args(command, arguments)?),
            "setExceptionBreakpoints" => {
                Command::SetExceptionBreakpoints(args(command, arguments)?)
            }
            "continue" => Command::Continue(args(command, arguments)?),
            "next" => Command::Next(args(command, arguments)?),
            "stepIn" => Command::StepIn(args(command, arguments)?),
            "stepOut" => Command::StepOut(args(command, arguments)?),
            "pause" => Command::Pause(args(command, arguments)?),
            "threads" => Command::Threads,
            "stackTrace" => Command::StackTrace(args(command, arguments)?),
            "scopes" => Command::Scopes(args(command, arguments)?),
            "variables" => Command::Variables(args(command, arguments)?),
            "evaluate" => Command::Evaluate(args(command, arguments)?),
            "source" => Command::Source(args(command, arguments)?),
            "disconnect" => Command::Disconnect(args(command, arguments)?),
            "terminate" => Command::Terminate(args(command, arguments)?),
            "callService" => Command::CallService(args(command, arguments)?),
            other => return Err(Error::UnsupportedCommand(other.to_string())),
        };
        Ok(cmd)
    }
}

// ------------------------------------- response bodies -------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ExceptionBreakpointsFilter {
    pub filter: String,
    pub label: String,
    pub default: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_configuration_done_request: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_conditional_breakpoints: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_delayed_stack_trace_loading: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_evaluate_for_hovers: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_clipboard_context: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_terminate_request: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_restart_request: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_set_variable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_log_points: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exception_breakpoint_filters: Vec<ExceptionBreakpointsFilter>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetBreakpointsResponseBody {
    pub breakpoints: Vec<Breakpoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thread {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadsResponseBody {
    pub threads: Vec<Thread>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    pub line: i64,
    pub column: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presentation_hint: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceResponseBody {
    pub stack_frames: Vec<StackFrame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_frames: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presentation_hint: Option<String>,
    pub variables_reference: i64,
    pub expensive: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScopesResponseBody {
    pub scopes: Vec<Scope>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub value: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluate_name: Option<String>,
    pub variables_reference: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexed_variables: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariablesResponseBody {
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponseBody {
    pub result: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub variables_reference: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexed_variables: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceResponseBody {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueResponseBody {
    pub all_threads_continued: bool,
}

// ------------------------------------- event bodies ----------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedEventBody {
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    pub all_threads_stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuedEventBody {
    pub thread_id: i64,
    pub all_threads_continued: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadEventBody {
    pub reason: &'static str,
    pub thread_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputEventBody {
    pub category: &'static str,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitedEventBody {
    pub exit_code: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_command_without_arguments() {
        let cmd = Command::parse("configurationDone", Value::Null).unwrap();
        assert!(matches!(cmd, Command::ConfigurationDone));

        let cmd = Command::parse("disconnect", Value::Null).unwrap();
        assert!(matches!(cmd, Command::Disconnect(DisconnectArguments { restart: None, .. })));
    }

    #[test]
    fn test_parse_launch_arguments() {
        let cmd = Command::parse(
            "launch",
            json!({
                "program": "bin/main.dart",
                "args": ["--verbose"],
                "debugSdkLibraries": true,
                "additionalProjectPaths": ["/work/lib"],
                "__restart": {"attempt": 2},
            }),
        )
        .unwrap();

        let Command::Launch(args) = cmd else {
            panic!("launch expected");
        };
        assert_eq!(args.program.as_deref(), Some("bin/main.dart"));
        assert_eq!(args.args, vec!["--verbose".to_string()]);
        assert_eq!(args.debug_sdk_libraries, Some(true));
        assert_eq!(args.debug_external_package_libraries, None);
        assert_eq!(args.additional_project_paths, vec!["/work/lib".to_string()]);
        assert_eq!(args.restart, Some(json!({"attempt": 2})));
    }

    #[test]
    fn test_parse_unknown_and_malformed() {
        let err = Command::parse("readMemory", json!({})).unwrap_err();
        assert!(matches!(err, Error::UnsupportedCommand(cmd) if cmd == "readMemory"));

        let err = Command::parse("stackTrace", json!({"startFrame": 1})).unwrap_err();
        assert!(matches!(err, Error::InvalidArguments(cmd, _) if cmd == "stackTrace"));
    }

    #[test]
    fn test_breakpoints_from_deprecated_lines() {
        let Command::SetBreakpoints(args) = Command::parse(
            "setBreakpoints",
            json!({"source": {"path": "/a.dart"}, "lines": [3, 7]}),
        )
        .unwrap() else {
            panic!("setBreakpoints expected");
        };
        assert_eq!(
            args.requested(),
            vec![SourceBreakpoint::at_line(3), SourceBreakpoint::at_line(7)]
        );
    }

    #[test]
    fn test_capabilities_shape() {
        let caps = Capabilities {
            supports_configuration_done_request: Some(true),
            exception_breakpoint_filters: vec![ExceptionBreakpointsFilter {
                filter: "All".to_string(),
                label: "All Exceptions".to_string(),
                default: false,
            }],
            ..Default::default()
        };
        let v = serde_json::to_value(caps).unwrap();
        assert_eq!(v["supportsConfigurationDoneRequest"], json!(true));
        assert!(v.get("supportsSetVariable").is_none());
        assert_eq!(v["exceptionBreakpointFilters"][0]["filter"], json!("All"));
    }
}
