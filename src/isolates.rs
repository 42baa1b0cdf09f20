//! Isolate bookkeeping: maps runtime isolates to client threads, tracks pause
//! state and fans breakpoints and exception settings out to every isolate.

use crate::dap::client::ClientSender;
use crate::dap::protocol::{
    event, ContinuedEventBody, SourceBreakpoint, StoppedEventBody, ThreadEventBody,
};
use crate::error::{Error, Result};
use crate::refs::{Owner, RefStore, StoredData, StoredEntry};
use crate::vm::service::{RpcError, VmService};
use crate::vm::types::{
    Event, EventKind, ExceptionPauseMode, InstanceKind, InstanceRef, Isolate, IsolateRef, ObjRef,
    StepOption,
};
use crate::weak_error;
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

/// Client visible view of one isolate.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub thread_id: i64,
    pub isolate: IsolateRef,
    pub runnable: bool,
    pub paused: bool,
    /// Event the isolate is currently paused with.
    pub pause_event: Option<Event>,
    /// Bumped on each pause; handles minted under another value are stale.
    pub generation: u64,
    pub exception: Option<InstanceRef>,
    pub exception_reference: Option<i64>,
    configured: bool,
    stepping: bool,
    /// Runtime breakpoint ids per script uri.
    vm_breakpoints: HashMap<String, Vec<String>>,
    /// Client conditions per runtime breakpoint id.
    conditions: HashMap<String, String>,
}

impl ThreadInfo {
    fn new(thread_id: i64, isolate: IsolateRef) -> Self {
        Self {
            thread_id,
            isolate,
            runnable: false,
            paused: false,
            pause_event: None,
            generation: 0,
            exception: None,
            exception_reference: None,
            configured: false,
            stepping: false,
            vm_breakpoints: HashMap::new(),
            conditions: HashMap::new(),
        }
    }

    pub fn owner(&self) -> Owner {
        Owner {
            thread_id: self.thread_id,
            generation: self.generation,
        }
    }

    pub fn isolate_id(&self) -> &str {
        &self.isolate.id
    }
}

/// Which libraries the user wants to step into.
#[derive(Debug, Clone, Default)]
pub struct LibrarySettings {
    pub debug_sdk_libraries: bool,
    pub debug_external_package_libraries: bool,
    project_paths: Vec<PathBuf>,
    package_roots: HashMap<String, PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageConfig {
    #[serde(default)]
    packages: Vec<PackageEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageEntry {
    name: String,
    root_uri: String,
}

impl LibrarySettings {
    pub fn new(
        debug_sdk_libraries: bool,
        debug_external_package_libraries: bool,
        cwd: Option<&Path>,
        additional_project_paths: &[String],
    ) -> Self {
        let mut project_paths: Vec<PathBuf> = cwd.into_iter().map(Path::to_path_buf).collect();
        project_paths.extend(additional_project_paths.iter().map(PathBuf::from));
        let package_roots = cwd.map(load_package_roots).unwrap_or_default();
        Self {
            debug_sdk_libraries,
            debug_external_package_libraries,
            project_paths,
            package_roots,
        }
    }

    fn is_project_path(&self, path: &Path) -> bool {
        self.project_paths.is_empty() || self.project_paths.iter().any(|p| path.starts_with(p))
    }

    pub fn is_debuggable(&self, uri: &str) -> bool {
        if uri.starts_with("dart:") {
            return self.debug_sdk_libraries;
        }
        if self.debug_external_package_libraries {
            return true;
        }
        if let Some(rest) = uri.strip_prefix("package:") {
            let package = rest.split('/').next().unwrap_or_default();
            return match self.package_roots.get(package) {
                Some(root) => !self.project_paths.is_empty() && self.is_project_path(root),
                None => false,
            };
        }
        match Url::parse(uri).ok().filter(|u| u.scheme() == "file") {
            Some(url) => url
                .to_file_path()
                .map(|path| self.is_project_path(&path))
                .unwrap_or(true),
            None => true,
        }
    }
}

/// Package name to root directory, read from `.dart_tool/package_config.json`.
fn load_package_roots(cwd: &Path) -> HashMap<String, PathBuf> {
    let tool_dir = cwd.join(".dart_tool");
    let Ok(text) = std::fs::read_to_string(tool_dir.join("package_config.json")) else {
        return HashMap::new();
    };
    let Some(config) = weak_error!(
        serde_json::from_str::<PackageConfig>(&text),
        "malformed package config:"
    ) else {
        return HashMap::new();
    };
    let Ok(base) = Url::from_directory_path(&tool_dir) else {
        return HashMap::new();
    };

    config
        .packages
        .into_iter()
        .filter_map(|package| {
            let root = base.join(&package.root_uri).ok()?.to_file_path().ok()?;
            Some((package.name, root))
        })
        .collect()
}

struct State {
    next_thread_id: i64,
    next_generation: u64,
    threads: IndexMap<i64, ThreadInfo>,
    by_isolate: HashMap<String, i64>,
    breakpoints: HashMap<String, Vec<SourceBreakpoint>>,
    exception_mode: ExceptionPauseMode,
    refs: RefStore,
}

pub struct IsolateManager {
    vm: Arc<dyn VmService>,
    client: ClientSender,
    libraries: Mutex<LibrarySettings>,
    state: Mutex<State>,
    /// Held across a whole breakpoint replacement so runtime ids stay in sync with `vm_breakpoints`.
    breakpoint_updates: tokio::sync::Mutex<()>,
}

fn tolerate_not_paused(result: std::result::Result<(), RpcError>) -> Result<()> {
    match result {
        Err(e) if e.code() == Some(RpcError::ISOLATE_MUST_BE_PAUSED) => Ok(()),
        other => Ok(other?),
    }
}

impl IsolateManager {
    pub fn new(vm: Arc<dyn VmService>, client: ClientSender) -> Self {
        Self {
            vm,
            client,
            libraries: Mutex::new(LibrarySettings::default()),
            state: Mutex::new(State {
                next_thread_id: 1,
                next_generation: 1,
                threads: IndexMap::new(),
                by_isolate: HashMap::new(),
                breakpoints: HashMap::new(),
                exception_mode: ExceptionPauseMode::default(),
                refs: RefStore::default(),
            }),
            breakpoint_updates: tokio::sync::Mutex::new(()),
        }
    }

    /// Seed breakpoints and exception mode requested before the runtime connected.
    pub fn restore(
        &self,
        breakpoints: HashMap<String, Vec<SourceBreakpoint>>,
        mode: ExceptionPauseMode,
    ) {
        let mut state = self.state.lock();
        state.breakpoints = breakpoints;
        state.exception_mode = mode;
    }

    pub fn set_library_settings(&self, settings: LibrarySettings) {
        *self.libraries.lock() = settings;
    }

    pub fn is_debuggable_uri(&self, uri: &str) -> bool {
        self.libraries.lock().is_debuggable(uri)
    }

    pub fn threads(&self) -> Vec<ThreadInfo> {
        self.state.lock().threads.values().cloned().collect()
    }

    pub fn thread(&self, thread_id: i64) -> Result<ThreadInfo> {
        self.state
            .lock()
            .threads
            .get(&thread_id)
            .cloned()
            .ok_or(Error::ThreadNotFound(thread_id))
    }

    pub fn thread_for_isolate(&self, isolate_id: &str) -> Option<ThreadInfo> {
        let state = self.state.lock();
        let thread_id = state.by_isolate.get(isolate_id)?;
        state.threads.get(thread_id).cloned()
    }

    /// Track an isolate. Return the thread and whether it is new.
    pub fn register_isolate(&self, isolate: &IsolateRef) -> (ThreadInfo, bool) {
        let (thread, created) = {
            let mut state = self.state.lock();
            let known = state
                .by_isolate
                .get(&isolate.id)
                .and_then(|thread_id| state.threads.get(thread_id))
                .cloned();
            match known {
                Some(thread) => (thread, false),
                None => {
                    let thread_id = state.next_thread_id;
                    state.next_thread_id += 1;
                    let thread = ThreadInfo::new(thread_id, isolate.clone());
                    state.by_isolate.insert(isolate.id.clone(), thread_id);
                    state.threads.insert(thread_id, thread.clone());
                    (thread, true)
                }
            }
        };
        if created {
            log::debug!(target: "dap", "isolate {} registered as thread {}", isolate.id, thread.thread_id);
            self.client.send_event(
                event::THREAD,
                ThreadEventBody {
                    reason: "started",
                    thread_id: thread.thread_id,
                },
            );
        }
        (thread, created)
    }

    /// Pick up an isolate that existed before the adapter connected.
    pub async fn register_existing(&self, isolate: &Isolate) -> Result<()> {
        let (thread, _) = self.register_isolate(&isolate.to_ref());
        if isolate.runnable {
            self.mark_runnable(thread.thread_id);
            self.configure_isolate(thread.thread_id).await?;
        }
        if let Some(pause) = isolate.pause_event.as_ref().filter(|e| e.kind.is_pause()) {
            let mut pause = pause.clone();
            pause.isolate.get_or_insert_with(|| isolate.to_ref());
            self.handle_event(&pause).await?;
        }
        Ok(())
    }

    fn mark_runnable(&self, thread_id: i64) {
        if let Some(thread) = self.state.lock().threads.get_mut(&thread_id) {
            thread.runnable = true;
        }
    }

    pub async fn handle_event(&self, event: &Event) -> Result<()> {
        let Some(isolate) = event.isolate.as_ref() else {
            return Ok(());
        };

        match event.kind {
            EventKind::IsolateStart => {
                self.register_isolate(isolate);
            }
            EventKind::IsolateRunnable => {
                let (thread, _) = self.register_isolate(isolate);
                self.mark_runnable(thread.thread_id);
                self.configure_isolate(thread.thread_id).await?;
            }
            EventKind::IsolateExit => self.remove_isolate(&isolate.id),
            EventKind::PauseStart | EventKind::PausePostRequest => {
                let (thread, _) = self.register_isolate(isolate);
                self.configure_isolate(thread.thread_id).await?;
                self.set_paused(thread.thread_id, event);
                self.resume_thread(thread.thread_id, None).await?;
            }
            EventKind::PauseExit => {
                let (thread, _) = self.register_isolate(isolate);
                self.set_paused(thread.thread_id, event);
                self.resume_thread(thread.thread_id, None).await?;
            }
            kind if kind.is_pause() => {
                let (thread, _) = self.register_isolate(isolate);
                if kind == EventKind::PauseBreakpoint && !self.should_stop(&thread, event).await {
                    log::debug!(target: "dap", "breakpoint condition not met on thread {}", thread.thread_id);
                    tolerate_not_paused(self.vm.resume(&isolate.id, None).await)?;
                    return Ok(());
                }
                if let Some(thread) = self.set_paused(thread.thread_id, event) {
                    self.send_stopped(&thread, event);
                }
            }
            EventKind::Resume => self.handle_resume(&isolate.id),
            _ => {}
        }
        Ok(())
    }

    fn remove_isolate(&self, isolate_id: &str) {
        let removed = {
            let mut state = self.state.lock();
            let thread_id = state.by_isolate.remove(isolate_id);
            if let Some(thread_id) = thread_id {
                state.refs.release_thread(thread_id);
                state.threads.shift_remove(&thread_id);
            }
            thread_id
        };
        if let Some(thread_id) = removed {
            self.client.send_event(
                event::THREAD,
                ThreadEventBody {
                    reason: "exited",
                    thread_id,
                },
            );
        }
    }

    /// A resume the adapter did not ask for, e.g. from another client.
    fn handle_resume(&self, isolate_id: &str) {
        let continued = {
            let mut state = self.state.lock();
            let Some(thread_id) = state.by_isolate.get(isolate_id).copied() else {
                return;
            };
            let paused = state
                .threads
                .get(&thread_id)
                .map(|t| t.paused)
                .unwrap_or(false);
            if paused {
                Self::clear_pause(&mut state, thread_id);
                Some(thread_id)
            } else {
                None
            }
        };
        if let Some(thread_id) = continued {
            self.client.send_event(
                event::CONTINUED,
                ContinuedEventBody {
                    thread_id,
                    all_threads_continued: false,
                },
            );
        }
    }

    fn clear_pause(state: &mut State, thread_id: i64) {
        state.refs.release_thread(thread_id);
        if let Some(thread) = state.threads.get_mut(&thread_id) {
            thread.paused = false;
            thread.pause_event = None;
            thread.exception = None;
            thread.exception_reference = None;
        }
    }

    fn set_paused(&self, thread_id: i64, event: &Event) -> Option<ThreadInfo> {
        let mut state = self.state.lock();
        let generation = state.next_generation;
        state.next_generation += 1;

        let exception = if event.kind == EventKind::PauseException {
            event.exception.clone()
        } else {
            None
        };
        let exception_reference = exception.as_ref().map(|exception| {
            state.refs.store(
                Owner {
                    thread_id,
                    generation,
                },
                StoredData::Instance(exception.clone()),
            )
        });

        let thread = state.threads.get_mut(&thread_id)?;
        thread.paused = true;
        thread.generation = generation;
        thread.pause_event = Some(event.clone());
        thread.exception = exception;
        thread.exception_reference = exception_reference;
        Some(thread.clone())
    }

    fn send_stopped(&self, thread: &ThreadInfo, event: &Event) {
        let reason = match event.kind {
            EventKind::PauseBreakpoint if thread.stepping && event.pause_breakpoints.is_empty() => {
                "step"
            }
            EventKind::PauseBreakpoint => "breakpoint",
            EventKind::PauseException => "exception",
            EventKind::PauseInterrupted if thread.stepping => "step",
            _ => "pause",
        };
        let text = thread.exception.as_ref().map(|exception| {
            exception
                .value_as_string
                .clone()
                .or_else(|| exception.class_name().map(ToString::to_string))
                .unwrap_or_default()
        });
        self.client.send_event(
            event::STOPPED,
            StoppedEventBody {
                reason: reason.to_string(),
                description: None,
                thread_id: Some(thread.thread_id),
                all_threads_stopped: false,
                text,
            },
        );
    }

    /// Decide whether a breakpoint pause should be shown to the user.
    async fn should_stop(&self, thread: &ThreadInfo, event: &Event) -> bool {
        if event.pause_breakpoints.is_empty() {
            return true;
        }
        let conditions: Vec<Option<String>> = {
            let state = self.state.lock();
            let current = state.threads.get(&thread.thread_id);
            event
                .pause_breakpoints
                .iter()
                .map(|bp| current.and_then(|t| t.conditions.get(&bp.id).cloned()))
                .collect()
        };
        if conditions.iter().any(Option::is_none) {
            return true;
        }

        for condition in conditions.into_iter().flatten() {
            match self
                .vm
                .evaluate_in_frame(thread.isolate_id(), 0, &condition)
                .await
            {
                Ok(ObjRef::Instance(InstanceRef {
                    kind: InstanceKind::Bool,
                    value_as_string: Some(value),
                    ..
                })) if value == "true" => return true,
                Ok(_) => {}
                Err(e) => {
                    log::warn!(target: "dap", "breakpoint condition `{condition}` failed: {e}");
                    return true;
                }
            }
        }
        false
    }

    /// Resume a thread, optionally stepping.
    pub async fn resume_thread(&self, thread_id: i64, step: Option<StepOption>) -> Result<()> {
        let (isolate_id, at_async_suspension) = {
            let mut state = self.state.lock();
            let thread = state
                .threads
                .get_mut(&thread_id)
                .ok_or(Error::ThreadNotFound(thread_id))?;
            thread.stepping = step.is_some();
            let at_async = thread
                .pause_event
                .as_ref()
                .and_then(|e| e.at_async_suspension)
                .unwrap_or(false);
            let isolate_id = thread.isolate.id.clone();
            Self::clear_pause(&mut state, thread_id);
            (isolate_id, at_async)
        };

        let step = match step {
            Some(StepOption::Over) if at_async_suspension => Some(StepOption::OverAsyncSuspension),
            other => other,
        };
        tolerate_not_paused(self.vm.resume(&isolate_id, step).await)
    }

    pub async fn pause_thread(&self, thread_id: i64) -> Result<()> {
        let thread = self.thread(thread_id)?;
        Ok(self.vm.pause(thread.isolate_id()).await?)
    }

    /// Replace every breakpoint of `uri` in all isolates, current and future.
    pub async fn set_breakpoints(&self, uri: &str, breakpoints: Vec<SourceBreakpoint>) -> Result<()> {
        let _updating = self.breakpoint_updates.lock().await;
        let targets: Vec<i64> = {
            let mut state = self.state.lock();
            state.breakpoints.insert(uri.to_string(), breakpoints);
            state
                .threads
                .values()
                .filter(|t| t.configured)
                .map(|t| t.thread_id)
                .collect()
        };
        join_all(targets.into_iter().map(|t| self.apply_breakpoints(t, uri))).await;
        Ok(())
    }

    async fn apply_breakpoints(&self, thread_id: i64, uri: &str) {
        let (isolate_id, stale, wanted) = {
            let mut state = self.state.lock();
            let wanted = state.breakpoints.get(uri).cloned().unwrap_or_default();
            let Some(thread) = state.threads.get_mut(&thread_id) else {
                return;
            };
            let stale = thread.vm_breakpoints.remove(uri).unwrap_or_default();
            for id in &stale {
                thread.conditions.remove(id);
            }
            (thread.isolate.id.clone(), stale, wanted)
        };

        for id in stale {
            weak_error!(
                self.vm.remove_breakpoint(&isolate_id, &id).await,
                "remove breakpoint:"
            );
        }

        let mut added = Vec::with_capacity(wanted.len());
        let mut conditions = HashMap::new();
        for bp in wanted {
            let Some(vm_bp) = weak_error!(
                self.vm
                    .add_breakpoint_with_script_uri(&isolate_id, uri, bp.line, bp.column)
                    .await,
                "add breakpoint:"
            ) else {
                continue;
            };
            if let Some(condition) = bp.condition.filter(|c| !c.trim().is_empty()) {
                conditions.insert(vm_bp.id.clone(), condition);
            }
            added.push(vm_bp.id);
        }

        let mut state = self.state.lock();
        if let Some(thread) = state.threads.get_mut(&thread_id) {
            thread.vm_breakpoints.insert(uri.to_string(), added);
            thread.conditions.extend(conditions);
        }
    }

    pub async fn set_exception_pause_mode(&self, mode: ExceptionPauseMode) -> Result<()> {
        let targets: Vec<String> = {
            let mut state = self.state.lock();
            state.exception_mode = mode;
            state
                .threads
                .values()
                .filter(|t| t.configured)
                .map(|t| t.isolate.id.clone())
                .collect()
        };
        let results = join_all(
            targets
                .iter()
                .map(|isolate_id| self.vm.set_exception_pause_mode(isolate_id, mode)),
        )
        .await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Send breakpoints, exception mode and library debuggability to an isolate.
    /// Runs once per isolate.
    pub async fn configure_isolate(&self, thread_id: i64) -> Result<()> {
        let (isolate_id, uris, mode) = {
            let mut state = self.state.lock();
            let uris: Vec<String> = state.breakpoints.keys().cloned().collect();
            let mode = state.exception_mode;
            let Some(thread) = state.threads.get_mut(&thread_id) else {
                return Ok(());
            };
            if thread.configured {
                return Ok(());
            }
            thread.configured = true;
            (thread.isolate.id.clone(), uris, mode)
        };

        self.configure_libraries(&isolate_id).await;
        self.vm.set_exception_pause_mode(&isolate_id, mode).await?;
        let _updating = self.breakpoint_updates.lock().await;
        join_all(uris.iter().map(|uri| self.apply_breakpoints(thread_id, uri))).await;
        Ok(())
    }

    async fn configure_libraries(&self, isolate_id: &str) {
        let Some(isolate) = weak_error!(self.vm.get_isolate(isolate_id).await, "get isolate:") else {
            return;
        };
        let hidden: Vec<_> = {
            let settings = self.libraries.lock();
            isolate
                .libraries
                .iter()
                .filter(|lib| !settings.is_debuggable(&lib.uri))
                .map(|lib| lib.id.clone())
                .collect()
        };
        join_all(hidden.iter().map(|library_id| async move {
            weak_error!(
                self.vm
                    .set_library_debuggable(isolate_id, library_id, false)
                    .await,
                "set library debuggable:"
            )
        }))
        .await;
    }

    /// Mint a handle owned by the thread's current pause.
    pub fn store_data(&self, thread_id: i64, data: StoredData) -> Result<i64> {
        let mut state = self.state.lock();
        let owner = state
            .threads
            .get(&thread_id)
            .filter(|t| t.paused)
            .map(ThreadInfo::owner)
            .ok_or(Error::ThreadNotPaused(thread_id))?;
        Ok(state.refs.store(owner, data))
    }

    /// Like [`Self::store_data`] for evaluation results; atomic values get no handle.
    pub fn store_object(
        &self,
        thread_id: i64,
        obj: &ObjRef,
        is_atomic: impl Fn(InstanceKind) -> bool,
    ) -> Result<i64> {
        let mut state = self.state.lock();
        let owner = state
            .threads
            .get(&thread_id)
            .filter(|t| t.paused)
            .map(ThreadInfo::owner)
            .ok_or(Error::ThreadNotPaused(thread_id))?;
        Ok(state.refs.store_object(owner, obj, is_atomic))
    }

    /// Resolve a handle to its data and the thread that owns it.
    pub fn get_stored_data(&self, handle: i64) -> Result<(ThreadInfo, StoredData)> {
        let state = self.state.lock();
        let threads = &state.threads;
        let StoredEntry { owner, data } = state.refs.resolve(handle, |thread_id| {
            threads
                .get(&thread_id)
                .filter(|t| t.paused)
                .map(|t| t.generation)
        })?;
        let thread = threads
            .get(&owner.thread_id)
            .cloned()
            .ok_or(Error::StaleReference(handle))?;
        Ok((thread, data.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_project(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vmdap-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join(".dart_tool")).unwrap();
        dir
    }

    #[test]
    fn test_sdk_libraries() {
        let settings = LibrarySettings::new(false, false, None, &[]);
        assert!(!settings.is_debuggable("dart:core"));
        assert!(settings.is_debuggable("file:///anywhere/main.dart"));

        let settings = LibrarySettings::new(true, false, None, &[]);
        assert!(settings.is_debuggable("dart:async"));
    }

    #[test]
    fn test_file_libraries_outside_project() {
        let settings = LibrarySettings::new(
            false,
            false,
            Some(Path::new("/work/app")),
            &["/work/shared".to_string()],
        );
        assert!(settings.is_debuggable("file:///work/app/bin/main.dart"));
        assert!(settings.is_debuggable("file:///work/shared/lib/util.dart"));
        assert!(!settings.is_debuggable("file:///opt/other/lib/x.dart"));

        let settings = LibrarySettings::new(false, true, Some(Path::new("/work/app")), &[]);
        assert!(settings.is_debuggable("file:///opt/other/lib/x.dart"));
    }

    #[test]
    fn test_package_libraries_resolved_through_package_config() {
        let project = temp_project("packages");
        std::fs::write(
            project.join(".dart_tool").join("package_config.json"),
            r#"{
                "configVersion": 2,
                "packages": [
                    {"name": "app", "rootUri": "../", "packageUri": "lib/"},
                    {"name": "path", "rootUri": "file:///home/u/.pub-cache/path-1.8.3", "packageUri": "lib/"}
                ]
            }"#,
        )
        .unwrap();

        let settings = LibrarySettings::new(false, false, Some(&project), &[]);
        assert!(settings.is_debuggable("package:app/src/model.dart"));
        assert!(!settings.is_debuggable("package:path/path.dart"));
        assert!(!settings.is_debuggable("package:unknown/x.dart"));

        let _ = std::fs::remove_dir_all(&project);
    }
}
