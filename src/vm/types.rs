//! Subset of the runtime debug service object model used by the adapter.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, IntoStaticStr};

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsolateRef {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_system_isolate: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vm {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub isolates: Vec<IsolateRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LibraryRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub uri: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Isolate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub runnable: bool,
    #[serde(default)]
    pub pause_event: Option<Event>,
    #[serde(default)]
    pub libraries: Vec<LibraryRef>,
}

impl Isolate {
    pub fn to_ref(&self) -> IsolateRef {
        IsolateRef {
            id: self.id.clone(),
            name: self.name.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display)]
pub enum EventKind {
    IsolateStart,
    IsolateRunnable,
    IsolateExit,
    IsolateUpdate,
    IsolateReload,
    ServiceExtensionAdded,
    PauseStart,
    PauseExit,
    PauseBreakpoint,
    PauseInterrupted,
    PauseException,
    PausePostRequest,
    Resume,
    None,
    BreakpointAdded,
    BreakpointResolved,
    BreakpointRemoved,
    BreakpointUpdated,
    Logging,
    WriteEvent,
    Extension,
    ServiceRegistered,
    ServiceUnregistered,
    #[default]
    #[serde(other)]
    Unknown,
}

impl EventKind {
    /// Kinds reported while an isolate is stopped.
    pub fn is_pause(self) -> bool {
        matches!(
            self,
            EventKind::PauseStart
                | EventKind::PauseExit
                | EventKind::PauseBreakpoint
                | EventKind::PauseInterrupted
                | EventKind::PauseException
                | EventKind::PausePostRequest
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub kind: EventKind,
    #[serde(default)]
    pub isolate: Option<IsolateRef>,
    #[serde(default)]
    pub top_frame: Option<Frame>,
    #[serde(default)]
    pub exception: Option<InstanceRef>,
    #[serde(default)]
    pub pause_breakpoints: Vec<VmBreakpoint>,
    #[serde(default)]
    pub at_async_suspension: Option<bool>,
    #[serde(default, rename = "extensionRPC")]
    pub extension_rpc: Option<String>,
    #[serde(default)]
    pub extension_kind: Option<String>,
    #[serde(default)]
    pub extension_data: Option<Value>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub log_record: Option<LogRecord>,
    /// Base64 payload of `WriteEvent`.
    #[serde(default)]
    pub bytes: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmBreakpoint {
    pub id: String,
    #[serde(default)]
    pub breakpoint_number: Option<i64>,
    #[serde(default)]
    pub resolved: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub message: InstanceRef,
    #[serde(default)]
    pub level: i64,
    #[serde(default)]
    pub logger_name: Option<InstanceRef>,
    #[serde(default)]
    pub error: Option<ObjRef>,
    #[serde(default)]
    pub stack_trace: Option<ObjRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum FrameKind {
    Regular,
    AsyncCausal,
    AsyncSuspensionMarker,
    AsyncActivation,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FuncRef {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CodeRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize)]
pub struct ScriptRef {
    pub id: String,
    pub uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLocation {
    pub script: ScriptRef,
    #[serde(default)]
    pub token_pos: i64,
    #[serde(default)]
    pub line: Option<i64>,
    #[serde(default)]
    pub column: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BoundVariable {
    pub name: String,
    pub value: ObjRef,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub function: Option<FuncRef>,
    #[serde(default)]
    pub code: Option<CodeRef>,
    #[serde(default)]
    pub location: Option<SourceLocation>,
    #[serde(default)]
    pub vars: Vec<BoundVariable>,
    #[serde(default)]
    pub kind: Option<FrameKind>,
}

impl Frame {
    pub fn is_async_marker(&self) -> bool {
        self.kind == Some(FrameKind::AsyncSuspensionMarker)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stack {
    #[serde(default)]
    pub frames: Vec<Frame>,
    #[serde(default)]
    pub async_causal_frames: Option<Vec<Frame>>,
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum InstanceKind {
    Null,
    Bool,
    Double,
    Int,
    String,
    Float32x4,
    Float64x2,
    Int32x4,
    List,
    Map,
    Set,
    Uint8ClampedList,
    Uint8List,
    Uint16List,
    Uint32List,
    Uint64List,
    Int8List,
    Int16List,
    Int32List,
    Int64List,
    Float32List,
    Float64List,
    Int32x4List,
    Float32x4List,
    Float64x2List,
    Record,
    StackTrace,
    Closure,
    MirrorReference,
    RegExp,
    WeakProperty,
    WeakReference,
    Type,
    TypeParameter,
    TypeRef,
    FunctionType,
    RecordType,
    ReceivePort,
    UserTag,
    #[default]
    PlainInstance,
    #[serde(other)]
    Other,
}

impl InstanceKind {
    /// Kinds whose elements are addressed by an integer index.
    pub fn is_list_like(self) -> bool {
        matches!(
            self,
            InstanceKind::List
                | InstanceKind::Set
                | InstanceKind::Uint8ClampedList
                | InstanceKind::Uint8List
                | InstanceKind::Uint16List
                | InstanceKind::Uint32List
                | InstanceKind::Uint64List
                | InstanceKind::Int8List
                | InstanceKind::Int16List
                | InstanceKind::Int32List
                | InstanceKind::Int64List
                | InstanceKind::Float32List
                | InstanceKind::Float64List
                | InstanceKind::Int32x4List
                | InstanceKind::Float32x4List
                | InstanceKind::Float64x2List
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ClassRef {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRef {
    pub id: String,
    pub kind: InstanceKind,
    #[serde(default)]
    pub class_ref: Option<ClassRef>,
    #[serde(default)]
    pub value_as_string: Option<String>,
    #[serde(default)]
    pub value_as_string_is_truncated: Option<bool>,
    #[serde(default)]
    pub length: Option<i64>,
}

impl InstanceRef {
    pub fn class_name(&self) -> Option<&str> {
        self.class_ref.as_ref().map(|c| c.name.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FieldRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BoundField {
    #[serde(default)]
    pub decl: Option<FieldRef>,
    /// Record fields are named by position or by name.
    #[serde(default)]
    pub name: Option<Value>,
    pub value: ObjRef,
}

impl BoundField {
    pub fn field_name(&self) -> String {
        if let Some(decl) = &self.decl {
            return decl.name.clone();
        }
        match &self.name {
            Some(Value::String(name)) => name.clone(),
            Some(Value::Number(pos)) => format!("${pos}"),
            _ => "<unnamed>".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MapAssociation {
    pub key: ObjRef,
    pub value: ObjRef,
}

/// Full instance as returned by `getObject`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub kind: InstanceKind,
    #[serde(default)]
    pub class_ref: Option<ClassRef>,
    #[serde(default)]
    pub value_as_string: Option<String>,
    #[serde(default)]
    pub length: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub count: Option<i64>,
    #[serde(default)]
    pub fields: Vec<BoundField>,
    #[serde(default)]
    pub elements: Vec<ObjRef>,
    #[serde(default)]
    pub associations: Vec<MapAssociation>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ErrorRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sentinel {
    pub kind: String,
    pub value_as_string: String,
}

/// Reference returned by evaluation and stored in variables and collections.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ObjRef {
    #[serde(rename = "@Instance", alias = "Instance")]
    Instance(InstanceRef),
    #[serde(rename = "@Error", alias = "Error")]
    Error(ErrorRef),
    #[serde(rename = "Sentinel")]
    Sentinel(Sentinel),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Script {
    pub id: String,
    pub uri: String,
    #[serde(default)]
    pub source: Option<String>,
}

/// Result of `getObject`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum Obj {
    Instance(Instance),
    Script(Script),
    Sentinel(Sentinel),
    Error(ErrorRef),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum StepOption {
    Into,
    Over,
    OverAsyncSuspension,
    Out,
}

/// When an isolate stops on a thrown exception.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, IntoStaticStr)]
pub enum ExceptionPauseMode {
    All,
    #[default]
    Unhandled,
    None,
}

impl ExceptionPauseMode {
    /// Map client exception filters to a pause mode. `All` wins over `Unhandled`.
    pub fn from_filters<S: AsRef<str>>(filters: &[S]) -> Self {
        let has = |name: &str| filters.iter().any(|f| f.as_ref() == name);
        if has("All") {
            ExceptionPauseMode::All
        } else if has("Unhandled") {
            ExceptionPauseMode::Unhandled
        } else {
            ExceptionPauseMode::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exception_filter_precedence() {
        assert_eq!(
            ExceptionPauseMode::from_filters(&["All", "Unhandled"]),
            ExceptionPauseMode::All
        );
        assert_eq!(
            ExceptionPauseMode::from_filters(&["Unhandled"]),
            ExceptionPauseMode::Unhandled
        );
        assert_eq!(
            ExceptionPauseMode::from_filters::<&str>(&[]),
            ExceptionPauseMode::None
        );
        assert_eq!(ExceptionPauseMode::All.to_string(), "All");
    }

    #[test]
    fn test_obj_ref_variants() {
        let inst: ObjRef = serde_json::from_value(json!({
            "type": "@Instance",
            "id": "objects/1",
            "kind": "List",
            "length": 3,
            "classRef": {"type": "@Class", "id": "classes/1", "name": "_GrowableList"}
        }))
        .unwrap();
        let ObjRef::Instance(inst) = inst else {
            panic!("instance expected");
        };
        assert_eq!(inst.kind, InstanceKind::List);
        assert_eq!(inst.class_name(), Some("_GrowableList"));

        let sentinel: ObjRef = serde_json::from_value(json!({
            "type": "Sentinel",
            "kind": "Collected",
            "valueAsString": "<collected>"
        }))
        .unwrap();
        assert!(matches!(sentinel, ObjRef::Sentinel(s) if s.kind == "Collected"));

        let unknown_kind: InstanceRef = serde_json::from_value(json!({
            "id": "objects/2",
            "kind": "SomethingNew"
        }))
        .unwrap();
        assert_eq!(unknown_kind.kind, InstanceKind::Other);
    }

    #[test]
    fn test_pause_event_with_top_frame() {
        let event: Event = serde_json::from_value(json!({
            "type": "Event",
            "kind": "PauseBreakpoint",
            "isolate": {"type": "@Isolate", "id": "isolates/1", "name": "main"},
            "topFrame": {
                "type": "Frame",
                "index": 0,
                "kind": "Regular",
                "function": {"type": "@Function", "name": "main"},
                "location": {
                    "type": "SourceLocation",
                    "script": {"type": "@Script", "id": "scripts/1", "uri": "file:///app/bin/main.dart"},
                    "tokenPos": 42,
                    "line": 10,
                    "column": 3
                }
            },
            "pauseBreakpoints": [{"type": "Breakpoint", "id": "breakpoints/1", "resolved": true}],
            "unknownField": 1
        }))
        .unwrap();

        assert_eq!(event.kind, EventKind::PauseBreakpoint);
        assert!(event.kind.is_pause());
        let frame = event.top_frame.unwrap();
        assert_eq!(frame.location.unwrap().line, Some(10));
        assert_eq!(event.pause_breakpoints[0].id, "breakpoints/1");
    }
}
