//! Inspection requests: stack traces, scopes, variables, evaluation and sources.

use super::{DebugAdapter, STACK_FRAME_BATCH_SIZE, THREAD_EXCEPTION_EXPRESSION};
use crate::dap::protocol::{
    EvaluateArguments, EvaluateResponseBody, Scope, ScopesArguments, ScopesResponseBody,
    SourceArguments, SourceResponseBody, StackTraceArguments, StackTraceResponseBody,
    Variable, VariablesArguments, VariablesResponseBody,
};
use crate::error::{Error, Result};
use crate::refs::{StoredData, NO_REFERENCE};
use crate::vm::service::RpcError;
use crate::vm::types::{Frame, Obj, ObjRef, Script};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;

static WATCH_ERROR: Lazy<Regex> = Lazy::new(|| Regex::new(r"Error: (.*)").expect("must compile"));

/// Trim the expression and drop a single trailing `;`.
pub(super) fn normalize_expression(expression: &str) -> &str {
    let expression = expression.trim();
    expression.strip_suffix(';').unwrap_or(expression)
}

/// Short form of a compiler error, suitable for a one line watch.
pub(super) fn watch_error_message(message: &str) -> &str {
    WATCH_ERROR
        .captures(message)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
        .unwrap_or(message)
}

fn evaluation_error(e: RpcError, context: Option<&str>) -> Error {
    match e {
        RpcError::Server { .. } => {
            let message = e.full_message();
            if context == Some("watch") {
                Error::Evaluation(watch_error_message(&message).to_string())
            } else {
                Error::Evaluation(message)
            }
        }
        other => Error::Rpc(other),
    }
}

impl DebugAdapter {
    pub(super) async fn stack_trace(&self, args: StackTraceArguments) -> Result<StackTraceResponseBody> {
        let runtime = self.runtime()?;
        let thread = runtime.isolates.thread(args.thread_id)?;
        if !thread.paused {
            return Err(Error::ThreadNotPaused(args.thread_id));
        }

        let start = args.start_frame.unwrap_or(0).max(0) as usize;
        let levels = args.levels.unwrap_or(0).max(0) as usize;

        // clients ask for the top frame first, the pause event already carries it
        if start == 0 && levels == 1 {
            if let Some(top) = thread.pause_event.as_ref().and_then(|e| e.top_frame.as_ref()) {
                let id = runtime
                    .isolates
                    .store_data(thread.thread_id, StoredData::Frame(top.clone()))?;
                let frame = runtime.converter.to_stack_frame(&thread, top, id, false)?;
                return Ok(StackTraceResponseBody {
                    stack_frames: vec![frame],
                    total_frames: Some(1 + STACK_FRAME_BATCH_SIZE),
                });
            }
        }

        let limit = (levels > 0).then_some(start + levels);
        let stack = runtime.vm.get_stack(thread.isolate_id(), limit).await?;
        let truncated = stack.truncated;
        let frames: Vec<Frame> = stack.async_causal_frames.unwrap_or(stack.frames);
        let first_async_marker = frames.iter().position(Frame::is_async_marker);

        let window = frames
            .iter()
            .enumerate()
            .skip(start)
            .take(if levels > 0 { levels } else { usize::MAX });
        let mut stack_frames = Vec::new();
        for (index, frame) in window {
            let id = runtime
                .isolates
                .store_data(thread.thread_id, StoredData::Frame(frame.clone()))?;
            let after_async_gap = first_async_marker.is_some_and(|marker| index > marker);
            stack_frames.push(
                runtime
                    .converter
                    .to_stack_frame(&thread, frame, id, after_async_gap)?,
            );
        }

        let known = frames.len() as i64;
        Ok(StackTraceResponseBody {
            stack_frames,
            total_frames: Some(if truncated {
                known + STACK_FRAME_BATCH_SIZE
            } else {
                known
            }),
        })
    }

    pub(super) fn scopes(&self, args: ScopesArguments) -> Result<ScopesResponseBody> {
        let runtime = self.runtime()?;
        let (thread, data) = runtime.isolates.get_stored_data(args.frame_id)?;
        if !matches!(data, StoredData::Frame(_)) {
            return Err(Error::UnexpectedReference(args.frame_id, "frame"));
        }

        let mut scopes = vec![Scope {
            name: "Locals".to_string(),
            presentation_hint: Some("locals".to_string()),
            variables_reference: args.frame_id,
            expensive: false,
        }];
        if let Some(reference) = thread.exception_reference {
            scopes.push(Scope {
                name: "Exceptions".to_string(),
                presentation_hint: None,
                variables_reference: reference,
                expensive: false,
            });
        }
        Ok(ScopesResponseBody { scopes })
    }

    pub(super) async fn variables(&self, args: VariablesArguments) -> Result<VariablesResponseBody> {
        let runtime = self.runtime()?;
        let allow_to_string = self.session.lock().allow_to_string();
        let (thread, data) = runtime.isolates.get_stored_data(args.variables_reference)?;
        let converter = &runtime.converter;

        let variables = match data {
            StoredData::Frame(frame) => {
                let mut variables = Vec::with_capacity(frame.vars.len());
                for var in frame.vars.into_iter().sorted_by(|a, b| a.name.cmp(&b.name)) {
                    variables.push(
                        converter
                            .to_variable(
                                &thread,
                                var.name.clone(),
                                &var.value,
                                Some(var.name),
                                allow_to_string,
                            )
                            .await?,
                    );
                }
                variables
            }
            StoredData::MapAssociation {
                key,
                value,
                evaluate_name,
            } => vec![
                converter
                    .to_variable(&thread, "key".to_string(), &key, None, allow_to_string)
                    .await?,
                converter
                    .to_variable(&thread, "value".to_string(), &value, evaluate_name, allow_to_string)
                    .await?,
            ],
            StoredData::Instance(instance) => {
                let evaluate_name = self.names.get(&instance.id);
                match converter
                    .to_variable_list(
                        &thread,
                        &instance,
                        evaluate_name.as_deref(),
                        allow_to_string,
                        args.start,
                        args.count,
                    )
                    .await
                {
                    Ok(variables) => variables,
                    // collected objects show up as a placeholder child
                    Err(Error::Rpc(e @ RpcError::Server { .. })) => vec![Variable {
                        name: "<unavailable>".to_string(),
                        value: e.full_message(),
                        variables_reference: NO_REFERENCE,
                        ..Default::default()
                    }],
                    Err(e) => return Err(e),
                }
            }
            StoredData::Script(_) => {
                return Err(Error::UnexpectedReference(
                    args.variables_reference,
                    "variable container",
                ))
            }
        };
        Ok(VariablesResponseBody { variables })
    }

    pub(super) async fn evaluate(&self, args: EvaluateArguments) -> Result<EvaluateResponseBody> {
        let expression = normalize_expression(&args.expression);
        let frame_id = args.frame_id.ok_or(Error::NoFrame)?;
        let runtime = self.runtime()?;
        let (thread, data) = runtime.isolates.get_stored_data(frame_id)?;
        let StoredData::Frame(frame) = data else {
            return Err(Error::UnexpectedReference(frame_id, "frame"));
        };
        let context = args.context.as_deref();

        let result = match expression.strip_prefix(THREAD_EXCEPTION_EXPRESSION) {
            Some(rest) if rest.is_empty() || rest.starts_with('.') => {
                let exception = thread.exception.clone().ok_or(Error::NoException)?;
                match rest.strip_prefix('.') {
                    None => ObjRef::Instance(exception),
                    Some(member) => runtime
                        .vm
                        .evaluate(thread.isolate_id(), &exception.id, member)
                        .await
                        .map_err(|e| evaluation_error(e, context))?,
                }
            }
            _ => runtime
                .vm
                .evaluate_in_frame(thread.isolate_id(), frame.index, expression)
                .await
                .map_err(|e| evaluation_error(e, context))?,
        };

        match &result {
            ObjRef::Error(error) => {
                let message = if context == Some("watch") {
                    watch_error_message(&error.message)
                } else {
                    &error.message
                };
                return Err(Error::Evaluation(message.to_string()));
            }
            ObjRef::Sentinel(sentinel) => {
                return Ok(EvaluateResponseBody {
                    result: sentinel.value_as_string.clone(),
                    variables_reference: NO_REFERENCE,
                    ..Default::default()
                })
            }
            ObjRef::Instance(instance) => self.names.record(&instance.id, expression),
        }

        let converter = &runtime.converter;
        let allow_to_string = self.session.lock().allow_to_string();
        let display = converter
            .to_display_string(&thread, &result, allow_to_string, context != Some("clipboard"))
            .await;
        let variables_reference = runtime
            .isolates
            .store_object(thread.thread_id, &result, |kind| converter.is_atomic_kind(kind))?;

        let (type_name, indexed_variables) = match &result {
            ObjRef::Instance(instance) => (
                instance.class_name().map(ToString::to_string),
                instance.kind.is_list_like().then_some(instance.length).flatten(),
            ),
            _ => (None, None),
        };
        Ok(EvaluateResponseBody {
            result: display,
            type_name,
            variables_reference,
            indexed_variables,
        })
    }

    pub(super) async fn source(&self, args: SourceArguments) -> Result<SourceResponseBody> {
        let reference = args
            .source
            .as_ref()
            .and_then(|source| source.source_reference)
            .filter(|reference| *reference > 0)
            .unwrap_or(args.source_reference);
        let runtime = self.runtime()?;
        let (thread, data) = runtime.isolates.get_stored_data(reference)?;
        let StoredData::Script(script) = data else {
            return Err(Error::UnexpectedReference(reference, "script"));
        };

        match runtime
            .vm
            .get_object(thread.isolate_id(), &script.id, None, None)
            .await?
        {
            Obj::Script(Script {
                source: Some(content),
                ..
            }) => Ok(SourceResponseBody {
                content,
                mime_type: Some("text/x-dart".to_string()),
            }),
            _ => Err(Error::SourceNotAvailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_expression() {
        assert_eq!(normalize_expression("  a + b;  "), "a + b");
        assert_eq!(normalize_expression("foo();;"), "foo();");
        assert_eq!(normalize_expression("x"), "x");
    }

    #[test]
    fn test_watch_error_message() {
        let message = "expression compilation error: org-dartlang-debug:synthetic_debug_expression:1:1: Error: Undefined name 'nope'.\nnope\n^^^^";
        assert_eq!(watch_error_message(message), "Undefined name 'nope'.");
        assert_eq!(watch_error_message("plain failure"), "plain failure");
    }
}
