use crate::vm::types::{
    ExceptionPauseMode, Isolate, Obj, ObjRef, Stack, StepOption, Vm, VmBreakpoint,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use strum_macros::{AsRefStr, Display};
use tokio::sync::mpsc;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("vm service connection closed")]
    Closed,
    #[error("{message} (code {code})")]
    Server {
        code: i64,
        message: String,
        details: Option<String>,
    },
    #[error("vm service transport: {0}")]
    Transport(String),
    #[error("decode vm service response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl RpcError {
    pub const STREAM_ALREADY_SUBSCRIBED: i64 = 103;
    pub const ISOLATE_MUST_BE_PAUSED: i64 = 106;
    pub const EXPRESSION_COMPILATION_ERROR: i64 = 113;

    pub fn code(&self) -> Option<i64> {
        match self {
            RpcError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Message text including compiler details when the server sent them.
    pub fn full_message(&self) -> String {
        match self {
            RpcError::Server {
                message,
                details: Some(details),
                ..
            } => format!("{message}: {details}"),
            RpcError::Server { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Event channels of the runtime service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum StreamId {
    Isolate,
    Debug,
    Logging,
    Extension,
    Service,
    Stdout,
    Stderr,
}

/// Event pushed by the runtime on one of its streams.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub stream: String,
    pub event: crate::vm::types::Event,
}

/// RPC surface of the runtime debug service.
#[async_trait]
pub trait VmService: Send + Sync {
    async fn get_vm(&self) -> Result<Vm, RpcError>;

    async fn get_isolate(&self, isolate_id: &str) -> Result<Isolate, RpcError>;

    /// Fetch at most `limit` frames. The service can not slice by offset.
    async fn get_stack(&self, isolate_id: &str, limit: Option<usize>) -> Result<Stack, RpcError>;

    async fn get_object(
        &self,
        isolate_id: &str,
        object_id: &str,
        offset: Option<i64>,
        count: Option<i64>,
    ) -> Result<Obj, RpcError>;

    async fn evaluate(
        &self,
        isolate_id: &str,
        target_id: &str,
        expression: &str,
    ) -> Result<ObjRef, RpcError>;

    async fn evaluate_in_frame(
        &self,
        isolate_id: &str,
        frame_index: usize,
        expression: &str,
    ) -> Result<ObjRef, RpcError>;

    async fn stream_listen(&self, stream_id: &str) -> Result<(), RpcError>;

    /// Call an arbitrary service method, typically a registered `ext.*` extension.
    async fn call_service_extension(
        &self,
        method: &str,
        isolate_id: Option<&str>,
        args: Value,
    ) -> Result<Value, RpcError>;

    async fn resume(&self, isolate_id: &str, step: Option<StepOption>) -> Result<(), RpcError>;

    async fn pause(&self, isolate_id: &str) -> Result<(), RpcError>;

    async fn add_breakpoint_with_script_uri(
        &self,
        isolate_id: &str,
        script_uri: &str,
        line: i64,
        column: Option<i64>,
    ) -> Result<VmBreakpoint, RpcError>;

    async fn remove_breakpoint(&self, isolate_id: &str, breakpoint_id: &str)
        -> Result<(), RpcError>;

    async fn set_exception_pause_mode(
        &self,
        isolate_id: &str,
        mode: ExceptionPauseMode,
    ) -> Result<(), RpcError>;

    async fn set_library_debuggable(
        &self,
        isolate_id: &str,
        library_id: &str,
        debuggable: bool,
    ) -> Result<(), RpcError>;

    /// Close the transport. In-flight calls fail with [`RpcError::Closed`] and the
    /// event channel ends.
    async fn dispose(&self);
}

/// An open runtime connection: the RPC handle and its event channel.
/// The channel ending is the "service closed" signal.
pub struct VmConnection {
    pub service: Arc<dyn VmService>,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
}

#[async_trait]
pub trait VmConnector: Send + Sync {
    async fn connect(&self, uri: &Url) -> Result<VmConnection, RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_message_carries_details() {
        let err = RpcError::Server {
            code: RpcError::EXPRESSION_COMPILATION_ERROR,
            message: "Expression compilation error".to_string(),
            details: Some("org-dartlang-debug:synthetic_debug_expression:1:1: Error: Undefined name 'x'.".to_string()),
        };
        assert_eq!(err.code(), Some(113));
        assert!(err.full_message().ends_with("Undefined name 'x'."));
        assert_eq!(RpcError::Closed.code(), None);
        assert_eq!(StreamId::Debug.as_ref(), "Debug");
    }
}
