//! Conversion of runtime values and frames into client variables and frames.

use crate::dap::protocol::{Source, StackFrame, Variable};
use crate::error::{Error, Result};
use crate::evaluate_name::{field_suffix, index_suffix, EvaluateNameTracker};
use crate::isolates::{IsolateManager, ThreadInfo};
use crate::refs::{StoredData, NO_REFERENCE};
use crate::vm::service::VmService;
use crate::vm::types::{Frame, Instance, InstanceKind, InstanceRef, Obj, ObjRef};
use async_trait::async_trait;
use std::sync::Arc;
use url::Url;

#[async_trait]
pub trait ValueConverter: Send + Sync {
    /// Kinds shown inline and never expanded.
    fn is_atomic_kind(&self, kind: InstanceKind) -> bool;

    async fn to_display_string(
        &self,
        thread: &ThreadInfo,
        obj: &ObjRef,
        allow_to_string: bool,
        allow_truncation: bool,
    ) -> String;

    async fn to_variable(
        &self,
        thread: &ThreadInfo,
        name: String,
        obj: &ObjRef,
        evaluate_name: Option<String>,
        allow_to_string: bool,
    ) -> Result<Variable>;

    /// Children of an object: elements, map entries or fields, windowed by
    /// `start`/`count` for indexed collections.
    async fn to_variable_list(
        &self,
        thread: &ThreadInfo,
        instance: &InstanceRef,
        evaluate_name: Option<&str>,
        allow_to_string: bool,
        start: Option<i64>,
        count: Option<i64>,
    ) -> Result<Vec<Variable>>;

    fn to_stack_frame(
        &self,
        thread: &ThreadInfo,
        frame: &Frame,
        frame_id: i64,
        after_async_gap: bool,
    ) -> Result<StackFrame>;
}

pub struct VmValueConverter {
    vm: Arc<dyn VmService>,
    isolates: Arc<IsolateManager>,
    names: Arc<EvaluateNameTracker>,
}

impl VmValueConverter {
    pub fn new(
        vm: Arc<dyn VmService>,
        isolates: Arc<IsolateManager>,
        names: Arc<EvaluateNameTracker>,
    ) -> Self {
        Self {
            vm,
            isolates,
            names,
        }
    }

    async fn full_string(&self, thread: &ThreadInfo, instance: &InstanceRef) -> Option<String> {
        let obj = self
            .vm
            .get_object(thread.isolate_id(), &instance.id, None, instance.length)
            .await
            .ok()?;
        match obj {
            Obj::Instance(Instance {
                value_as_string, ..
            }) => value_as_string,
            _ => None,
        }
    }

    async fn instance_display(
        &self,
        thread: &ThreadInfo,
        instance: &InstanceRef,
        allow_to_string: bool,
        allow_truncation: bool,
    ) -> String {
        let class_name = instance.class_name().unwrap_or("Object").to_string();
        match instance.kind {
            InstanceKind::String => {
                let truncated = instance.value_as_string_is_truncated.unwrap_or(false);
                let mut value = instance.value_as_string.clone().unwrap_or_default();
                if truncated && !allow_truncation {
                    if let Some(full) = self.full_string(thread, instance).await {
                        return format!("\"{full}\"");
                    }
                }
                if truncated {
                    value.push('…');
                }
                format!("\"{value}\"")
            }
            InstanceKind::Null => "null".to_string(),
            InstanceKind::Bool | InstanceKind::Int | InstanceKind::Double => {
                instance.value_as_string.clone().unwrap_or_default()
            }
            kind if kind.is_list_like() || kind == InstanceKind::Map => {
                let length = instance.length.unwrap_or_default();
                let items = if length == 1 { "item" } else { "items" };
                format!("{class_name} ({length} {items})")
            }
            InstanceKind::PlainInstance if allow_to_string => {
                match self.vm.evaluate(thread.isolate_id(), &instance.id, "toString()").await {
                    Ok(ObjRef::Instance(InstanceRef {
                        kind: InstanceKind::String,
                        value_as_string: Some(text),
                        ..
                    })) if text != format!("Instance of '{class_name}'") => {
                        format!("{class_name} ({text})")
                    }
                    Ok(_) => class_name,
                    Err(e) => {
                        log::debug!(target: "dap", "toString() on {}: {e}", instance.id);
                        class_name
                    }
                }
            }
            _ => instance.value_as_string.clone().unwrap_or(class_name),
        }
    }

    /// Evaluate name of a child: the caller's prefix, or the one recorded for the parent object.
    fn child_name(&self, parent: Option<&str>, parent_id: &str, suffix: &str) -> Option<String> {
        match parent {
            Some(parent) => Some(format!("{parent}{suffix}")),
            None => self.names.build(parent_id, suffix),
        }
    }
}

/// Client source for a script uri. Non-file scripts are served by reference.
fn frame_source(
    isolates: &IsolateManager,
    thread: &ThreadInfo,
    script: &crate::vm::types::ScriptRef,
) -> Result<Source> {
    let hint = (!isolates.is_debuggable_uri(&script.uri)).then(|| "deemphasize".to_string());
    let file_path = Url::parse(&script.uri)
        .ok()
        .filter(|url| url.scheme() == "file")
        .and_then(|url| url.to_file_path().ok());

    match file_path {
        Some(path) => Ok(Source {
            name: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            path: Some(path.to_string_lossy().into_owned()),
            source_reference: None,
            presentation_hint: hint,
        }),
        None => {
            let reference = isolates.store_data(thread.thread_id, StoredData::Script(script.clone()))?;
            Ok(Source {
                name: Some(script.uri.clone()),
                path: None,
                source_reference: Some(reference),
                presentation_hint: hint,
            })
        }
    }
}

#[async_trait]
impl ValueConverter for VmValueConverter {
    fn is_atomic_kind(&self, kind: InstanceKind) -> bool {
        matches!(
            kind,
            InstanceKind::Null
                | InstanceKind::Bool
                | InstanceKind::Int
                | InstanceKind::Double
                | InstanceKind::String
                | InstanceKind::Closure
        )
    }

    async fn to_display_string(
        &self,
        thread: &ThreadInfo,
        obj: &ObjRef,
        allow_to_string: bool,
        allow_truncation: bool,
    ) -> String {
        match obj {
            ObjRef::Instance(instance) => {
                self.instance_display(thread, instance, allow_to_string, allow_truncation)
                    .await
            }
            ObjRef::Error(error) => error.message.clone(),
            ObjRef::Sentinel(sentinel) => sentinel.value_as_string.clone(),
        }
    }

    async fn to_variable(
        &self,
        thread: &ThreadInfo,
        name: String,
        obj: &ObjRef,
        evaluate_name: Option<String>,
        allow_to_string: bool,
    ) -> Result<Variable> {
        let value = self
            .to_display_string(thread, obj, allow_to_string, true)
            .await;
        let mut variable = Variable {
            name,
            value,
            evaluate_name: evaluate_name.clone(),
            ..Default::default()
        };
        if let ObjRef::Instance(instance) = obj {
            if let Some(expression) = &evaluate_name {
                self.names.record(&instance.id, expression);
            }
            variable.type_name = instance.class_name().map(ToString::to_string);
            variable.variables_reference =
                self.isolates
                    .store_object(thread.thread_id, obj, |kind| self.is_atomic_kind(kind))?;
            if instance.kind.is_list_like() {
                variable.indexed_variables = instance.length;
            }
        }
        Ok(variable)
    }

    async fn to_variable_list(
        &self,
        thread: &ThreadInfo,
        instance: &InstanceRef,
        evaluate_name: Option<&str>,
        allow_to_string: bool,
        start: Option<i64>,
        count: Option<i64>,
    ) -> Result<Vec<Variable>> {
        let obj = self
            .vm
            .get_object(thread.isolate_id(), &instance.id, start, count)
            .await?;
        let object = match obj {
            Obj::Instance(object) => object,
            Obj::Sentinel(sentinel) => {
                return Ok(vec![Variable {
                    name: format!("<{}>", sentinel.kind),
                    value: sentinel.value_as_string,
                    variables_reference: NO_REFERENCE,
                    ..Default::default()
                }])
            }
            Obj::Error(error) => return Err(Error::Evaluation(error.message)),
            Obj::Script(_) | Obj::Other => {
                return Err(Error::Evaluation(format!("{} is not an instance", instance.id)));
            }
        };

        let offset = object.offset.or(start).unwrap_or_default();
        let mut variables = Vec::new();

        if object.kind.is_list_like() {
            for (i, element) in object.elements.iter().enumerate() {
                let index = offset + i as i64;
                let suffix = index_suffix(index);
                variables.push(
                    self.to_variable(
                        thread,
                        suffix.clone(),
                        element,
                        self.child_name(evaluate_name, &object.id, &suffix),
                        allow_to_string,
                    )
                    .await?,
                );
            }
        } else if object.kind == InstanceKind::Map {
            for (i, association) in object.associations.iter().enumerate() {
                let key = self
                    .to_display_string(thread, &association.key, allow_to_string, true)
                    .await;
                let value = self
                    .to_display_string(thread, &association.value, allow_to_string, true)
                    .await;
                let atomic_key = matches!(
                    &association.key,
                    ObjRef::Instance(k) if self.is_atomic_kind(k.kind)
                );
                let entry_name = atomic_key
                    .then(|| self.child_name(evaluate_name, &object.id, &index_suffix(&key)))
                    .flatten();
                let reference = self.isolates.store_data(
                    thread.thread_id,
                    StoredData::MapAssociation {
                        key: association.key.clone(),
                        value: association.value.clone(),
                        evaluate_name: entry_name.clone(),
                    },
                )?;
                variables.push(Variable {
                    name: index_suffix(offset + i as i64),
                    evaluate_name: entry_name,
                    value: format!("{key} -> {value}"),
                    variables_reference: reference,
                    ..Default::default()
                });
            }
        } else {
            for field in &object.fields {
                let name = field.field_name();
                variables.push(
                    self.to_variable(
                        thread,
                        name.clone(),
                        &field.value,
                        self.child_name(evaluate_name, &object.id, &field_suffix(&name)),
                        allow_to_string,
                    )
                    .await?,
                );
            }
        }
        Ok(variables)
    }

    fn to_stack_frame(
        &self,
        thread: &ThreadInfo,
        frame: &Frame,
        frame_id: i64,
        after_async_gap: bool,
    ) -> Result<StackFrame> {
        if frame.is_async_marker() {
            return Ok(StackFrame {
                id: frame_id,
                name: "<asynchronous gap>".to_string(),
                presentation_hint: Some("label".to_string()),
                ..Default::default()
            });
        }

        let name = frame
            .code
            .as_ref()
            .map(|code| code.name.clone())
            .or_else(|| frame.function.as_ref().map(|f| f.name.clone()))
            .unwrap_or_else(|| "<unknown>".to_string())
            .replace("<anonymous closure>", "<closure>");

        let (source, line, column) = match &frame.location {
            Some(location) => (
                Some(frame_source(&self.isolates, thread, &location.script)?),
                location.line.unwrap_or_default(),
                location.column.unwrap_or_default(),
            ),
            None => (None, 0, 0),
        };

        Ok(StackFrame {
            id: frame_id,
            name,
            source,
            line,
            column,
            presentation_hint: after_async_gap.then(|| "subtle".to_string()),
        })
    }
}
