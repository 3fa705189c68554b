//! One debug session end to end: stage the project, inject breakpoint
//! statements, connect to the device console, and translate every
//! coordinate that crosses the boundary between device space and the
//! user's source tree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::breakpoints::{find_entry_line, BreakpointManager};
use crate::config::DebugConfig;
use crate::error::Result;
use crate::events::{DeviceEvent, RuntimeLocation, SourcePosition};
use crate::locations::{LocationResolver, Resolution};
use crate::project::Project;
use crate::protocol::client::{ConsoleClient, SessionState};
use crate::protocol::replies::{StackFrame, ThreadInfo, Variable};

/// Breakpoints live outside the session so they can be edited before a
/// launch and survive across launches. The session locks the set while
/// it is connected.
pub type SharedBreakpoints = Arc<Mutex<BreakpointManager>>;

pub fn shared_breakpoints() -> SharedBreakpoints {
    Arc::new(Mutex::new(BreakpointManager::new()))
}

pub struct LaunchOptions {
    pub project: Project,
    /// Position in this list decides each library's `__libN` postfix,
    /// 1-based.
    pub component_libraries: Vec<Project>,
    /// Surface the entry-point stop instead of auto-resuming past it.
    pub stop_on_entry: bool,
}

impl LaunchOptions {
    pub fn new(project: Project) -> Self {
        Self {
            project,
            component_libraries: Vec::new(),
            stop_on_entry: false,
        }
    }
}

pub struct Session {
    client: ConsoleClient,
    resolver: Arc<ResolverCache>,
    breakpoints: SharedBreakpoints,
    projects: Vec<Project>,
    retain_staging_dir: bool,
    pump_task: JoinHandle<()>,
}

/// A session stops at the same few locations over and over, and the
/// truncated-path fallback behind each lookup walks the source tree.
/// Memoized per session; a fresh launch builds a fresh cache, so stale
/// entries cannot outlive the staging pass they describe.
struct ResolverCache {
    inner: LocationResolver,
    resolved: Mutex<HashMap<(String, u32), Resolution>>,
}

impl ResolverCache {
    fn new(inner: LocationResolver) -> Self {
        Self {
            inner,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    async fn resolve_runtime(&self, location: &RuntimeLocation) -> Resolution {
        let key = (location.path.clone(), location.line);
        let mut resolved = self.resolved.lock().await;
        if let Some(hit) = resolved.get(&key) {
            return hit.clone();
        }
        let resolution = self.inner.resolve_runtime(location);
        resolved.insert(key, resolution.clone());
        resolution
    }

    fn to_runtime(&self, source: &SourcePosition) -> Option<RuntimeLocation> {
        self.inner.to_runtime(source)
    }
}

impl Session {
    /// Stages the project, injects breakpoints, connects to the device
    /// console, and starts translating events. The returned receiver
    /// carries [`DeviceEvent`]s with source coordinates filled in.
    ///
    /// Sideloading the staged output is the caller's business; the
    /// console connection picks the launch up at compile time either
    /// way.
    pub async fn launch(
        options: LaunchOptions,
        breakpoints: SharedBreakpoints,
        config: DebugConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DeviceEvent>)> {
        let LaunchOptions {
            project,
            component_libraries,
            stop_on_entry,
        } = options;

        let mut projects = Vec::with_capacity(1 + component_libraries.len());
        projects.push(project);
        for (i, library) in component_libraries.into_iter().enumerate() {
            projects.push(library.as_component_library(i as u32 + 1));
        }

        let prepared = prepare_launch(&mut projects, &breakpoints, stop_on_entry, &config).await;
        let (resolver, entry_stop) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                breakpoints.lock().await.unlock();
                cleanup_projects(&mut projects, config.retain_staging_dir);
                return Err(e);
            }
        };

        let hidden_stops: Vec<(String, u32)> = entry_stop.into_iter().collect();
        let (client, raw_events) = match ConsoleClient::connect(&config, hidden_stops).await {
            Ok(pair) => pair,
            Err(e) => {
                breakpoints.lock().await.unlock();
                cleanup_projects(&mut projects, config.retain_staging_dir);
                return Err(e);
            }
        };

        let resolver = Arc::new(ResolverCache::new(resolver));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pump_task = tokio::spawn(pump_events(raw_events, events_tx, Arc::clone(&resolver)));

        info!(host = %config.host, "debug session launched");
        Ok((
            Self {
                client,
                resolver,
                breakpoints,
                projects,
                retain_staging_dir: config.retain_staging_dir,
                pump_task,
            },
            events_rx,
        ))
    }

    pub async fn state(&self) -> SessionState {
        self.client.state().await
    }

    pub fn is_at_prompt(&self) -> bool {
        self.client.is_at_prompt()
    }

    pub fn is_degraded(&self) -> bool {
        self.client.is_degraded()
    }

    pub async fn wait_for_suspend(&self, wait: Duration) -> bool {
        self.client.wait_for_suspend(wait).await
    }

    pub async fn continue_run(&self) -> Result<()> {
        self.client.continue_run().await
    }

    pub async fn pause(&self) -> Result<()> {
        self.client.pause().await
    }

    pub async fn step_over(&self, thread_id: u32) -> Result<()> {
        self.client.step_over(thread_id).await
    }

    pub async fn step_into(&self, thread_id: u32) -> Result<()> {
        self.client.step_into(thread_id).await
    }

    pub async fn step_out(&self, thread_id: u32) -> Result<()> {
        self.client.step_out(thread_id).await
    }

    /// Thread listing with device coordinates mapped back to source.
    /// Asking while the app is running is an ordinary host race, not a
    /// fault: it yields an empty list instead of an error.
    pub async fn get_threads(&self) -> Result<Vec<ThreadInfo>> {
        let mut threads = match self.client.get_threads().await {
            Ok(threads) => threads,
            Err(e) if e.is_not_at_prompt() => {
                debug!("thread listing requested while running");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        for thread in &mut threads {
            thread.source = self.resolver.resolve_runtime(&thread.location).await.source;
        }
        Ok(threads)
    }

    pub async fn get_stack_trace(&self, thread_id: u32) -> Result<Vec<StackFrame>> {
        let mut frames = match self.client.get_stack_trace(thread_id).await {
            Ok(frames) => frames,
            Err(e) if e.is_not_at_prompt() => {
                debug!(thread_id, "stack trace requested while running");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        for frame in &mut frames {
            frame.source = self.resolver.resolve_runtime(&frame.location).await.source;
        }
        Ok(frames)
    }

    pub async fn get_variable(
        &self,
        expression: &str,
        thread_id: u32,
        root_scope: bool,
    ) -> Result<Vec<Variable>> {
        match self
            .client
            .get_variable(expression, thread_id, root_scope)
            .await
        {
            Ok(variables) => Ok(variables),
            Err(e) if e.is_not_at_prompt() => {
                debug!(expression, "variables requested while running");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn evaluate(&self, expression: &str) -> Result<String> {
        self.client.evaluate(expression).await
    }

    pub async fn exit_active_debugger(&self) -> Result<()> {
        self.client.exit_active_debugger().await
    }

    /// Where the device will report a stop placed at `source`.
    pub fn runtime_location_for(&self, source: &SourcePosition) -> Option<RuntimeLocation> {
        self.resolver.to_runtime(source)
    }

    /// Shuts the connection down, unlocks the breakpoint set, and
    /// removes staging output unless configured to keep it.
    pub async fn disconnect(self) -> Result<()> {
        let Self {
            client,
            resolver: _,
            breakpoints,
            mut projects,
            retain_staging_dir,
            pump_task,
        } = self;

        let result = client.disconnect().await;
        drop(client);
        let _ = pump_task.await;
        breakpoints.lock().await.unlock();
        cleanup_projects(&mut projects, retain_staging_dir);
        result
    }
}

/// Staging and injection, under the breakpoint lock. Returns the
/// resolver plus the hidden entry stop to register with the client,
/// already in post-injection runtime coordinates.
async fn prepare_launch(
    projects: &mut [Project],
    breakpoints: &SharedBreakpoints,
    stop_on_entry: bool,
    config: &DebugConfig,
) -> Result<(LocationResolver, Option<(String, u32)>)> {
    for project in projects.iter_mut() {
        project.stage()?;
    }

    let mut manager = breakpoints.lock().await;
    let entry = find_entry_stop(&projects[0]);
    let mut entry_is_hidden = false;
    if let Some((source_path, line)) = &entry {
        entry_is_hidden = manager.add_hidden_breakpoint(source_path, *line)?;
        debug!(
            path = %source_path.display(),
            line,
            hidden = entry_is_hidden,
            "entry-point stop added"
        );
    }
    manager.lock();

    let main_ledger = manager.write_breakpoints_for_project(&projects[0])?;

    // Suppression is only for the stop the adapter injected itself: a
    // user breakpoint on the entry line owns that stop and must surface.
    let entry_stop = match (&entry, stop_on_entry) {
        (Some((source_path, line)), false) if entry_is_hidden => {
            projects[0].staged_for_source(source_path).map(|staged| {
                let suffix = relative_suffix(&staged.relative_path);
                let runtime = main_ledger.stop_line_for_source(&staged.relative_path, *line);
                (suffix, runtime)
            })
        }
        _ => None,
    };

    let mut resolver = LocationResolver::new(&projects[0], main_ledger, config.enable_source_maps);
    for library in projects.iter().skip(1) {
        let ledger = manager.write_breakpoints_for_project(library)?;
        resolver.add_library(library, ledger);
    }

    Ok((resolver, entry_stop))
}

/// Scans the staged main project for the app entry point.
fn find_entry_stop(project: &Project) -> Option<(PathBuf, u32)> {
    for file in project.staged_files() {
        let relative = relative_suffix(&file.relative_path);
        if !relative.starts_with("source/") || !relative.ends_with(".brs") {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(&file.staged_path) else {
            continue;
        };
        if let Some(line) = find_entry_line(&text) {
            return Some((file.source_path.clone(), line));
        }
    }
    None
}

fn relative_suffix(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "/")
        .to_ascii_lowercase()
}

fn cleanup_projects(projects: &mut [Project], retain: bool) {
    for project in projects {
        if let Err(e) = project.cleanup(retain) {
            warn!(
                root = %project.root_dir().display(),
                error = %e,
                "staging cleanup failed"
            );
        }
    }
}

/// Forwards raw console events with source coordinates filled in.
/// Compile errors get the same treatment as stops: injected statements
/// shift device line numbers even before the app runs.
async fn pump_events(
    mut raw: mpsc::UnboundedReceiver<DeviceEvent>,
    tx: mpsc::UnboundedSender<DeviceEvent>,
    resolver: Arc<ResolverCache>,
) {
    while let Some(event) = raw.recv().await {
        let event = match event {
            DeviceEvent::Suspended {
                thread_id,
                location,
                ..
            } => {
                let source = resolve(&resolver, location.as_ref()).await;
                DeviceEvent::Suspended {
                    thread_id,
                    location,
                    source,
                }
            }
            DeviceEvent::RuntimeError {
                thread_id,
                code,
                message,
                location,
                ..
            } => {
                let source = resolve(&resolver, location.as_ref()).await;
                DeviceEvent::RuntimeError {
                    thread_id,
                    code,
                    message,
                    location,
                    source,
                }
            }
            DeviceEvent::CompileErrors { mut errors } => {
                for error in &mut errors {
                    let location = RuntimeLocation {
                        path: error.path.clone(),
                        line: error.line,
                    };
                    error.source = resolver.resolve_runtime(&location).await.source;
                }
                DeviceEvent::CompileErrors { errors }
            }
            other => other,
        };
        if tx.send(event).is_err() {
            break;
        }
    }
}

async fn resolve(
    resolver: &ResolverCache,
    location: Option<&RuntimeLocation>,
) -> Option<SourcePosition> {
    match location {
        Some(loc) => resolver.resolve_runtime(loc).await.source,
        None => None,
    }
}
