use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    tool, tool_handler, tool_router, transport, ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use roku_debug_core::{
    shared_breakpoints, BreakpointRequest, DebugConfig, DebugError, DeviceEvent, LaunchOptions,
    Project, Session, SharedBreakpoints,
};

const WAIT_FOR_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BUFFERED_EVENTS: usize = 1024;

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ComponentLibrarySpec {
    root_dir: String,
    #[serde(default)]
    files: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerLaunchParams {
    /// Project root containing the manifest.
    root_dir: String,
    #[serde(default)]
    out_dir: Option<String>,
    /// Glob patterns selecting files to stage; defaults to everything.
    #[serde(default)]
    files: Vec<String>,
    /// Component libraries in postfix order: the first entry is `__lib1`.
    #[serde(default)]
    component_libraries: Vec<ComponentLibrarySpec>,
    /// Device host or host:port; falls back to ROKU_HOST.
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    stop_on_entry: bool,
    #[serde(default)]
    retain_staging_dir: bool,
    #[serde(default)]
    enable_source_maps: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerDisconnectParams {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct BreakpointSpec {
    line: u32,
    #[serde(default)]
    column: Option<u32>,
    #[serde(default)]
    condition: Option<String>,
    /// Trigger only from the Nth hit onward.
    #[serde(default)]
    hit_count: Option<u32>,
    /// Makes this a logpoint: print the message with `{expr}`
    /// interpolation instead of halting.
    #[serde(default)]
    log_message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerSetBreakpointsParams {
    source_path: String,
    breakpoints: Vec<BreakpointSpec>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerContinueParams {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerPauseParams {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerExitParams {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerStepParams {
    #[serde(default)]
    thread_id: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerThreadsParams {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerStackTraceParams {
    #[serde(default)]
    thread_id: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerVariablesParams {
    /// Dotted expression to inspect; omit for the local scope listing.
    #[serde(default)]
    expression: Option<String>,
    #[serde(default)]
    thread_id: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerEvaluateParams {
    /// Raw console statement, run against the selected thread.
    expression: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerEventsParams {
    /// Cap on returned events, oldest first; newer ones stay buffered.
    #[serde(default)]
    max: Option<usize>,
}

impl From<BreakpointSpec> for BreakpointRequest {
    fn from(spec: BreakpointSpec) -> Self {
        BreakpointRequest {
            line: spec.line,
            column: spec.column,
            condition: spec.condition,
            hit_count: spec.hit_count,
            log_message: spec.log_message,
        }
    }
}

/// One live session plus the event stream consumed on behalf of the
/// caller. Events accumulate here between `debugger_events` calls so
/// nothing is lost while the caller is busy.
struct ActiveSession {
    session: Session,
    events_rx: mpsc::UnboundedReceiver<DeviceEvent>,
    event_buffer: VecDeque<DeviceEvent>,
    last_suspended: Option<DeviceEvent>,
}

impl ActiveSession {
    fn new(session: Session, events_rx: mpsc::UnboundedReceiver<DeviceEvent>) -> Self {
        Self {
            session,
            events_rx,
            event_buffer: VecDeque::new(),
            last_suspended: None,
        }
    }

    /// Moves everything the session has emitted so far into the buffer.
    fn pump(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            if matches!(event, DeviceEvent::Suspended { .. }) {
                self.last_suspended = Some(event.clone());
            }
            if matches!(event, DeviceEvent::Resumed) {
                self.last_suspended = None;
            }
            push_buffered_event(&mut self.event_buffer, event);
        }
    }

    fn thread_or_default(&self, explicit: Option<u32>) -> u32 {
        default_thread(self.last_suspended.as_ref(), explicit)
    }

    fn stop_summary(&self) -> Value {
        self.last_suspended
            .as_ref()
            .and_then(|event| serde_json::to_value(event).ok())
            .unwrap_or(Value::Null)
    }
}

fn push_buffered_event(buffer: &mut VecDeque<DeviceEvent>, event: DeviceEvent) {
    buffer.push_back(event);
    while buffer.len() > MAX_BUFFERED_EVENTS {
        buffer.pop_front();
    }
}

/// Device commands target the last-suspended thread unless the caller
/// names one. With nothing suspended yet, thread 0 is the main thread.
fn default_thread(last_suspended: Option<&DeviceEvent>, explicit: Option<u32>) -> u32 {
    if let Some(thread_id) = explicit {
        return thread_id;
    }
    match last_suspended {
        Some(DeviceEvent::Suspended { thread_id, .. }) => *thread_id,
        _ => 0,
    }
}

struct SessionManager {
    breakpoints: SharedBreakpoints,
    session: Option<ActiveSession>,
}

impl SessionManager {
    fn new() -> Self {
        Self {
            breakpoints: shared_breakpoints(),
            session: None,
        }
    }
}

#[derive(Clone)]
struct RokuDebugMcpServer {
    tool_router: ToolRouter<Self>,
    state: Arc<Mutex<SessionManager>>,
}

fn to_mcp_error(message: impl Into<String>) -> McpError {
    McpError::internal_error(message.into(), None)
}

fn debug_error(e: DebugError) -> McpError {
    if e.is_not_at_prompt() {
        return to_mcp_error(format!(
            "{e}. The channel is running; pause or wait for a breakpoint, then retry."
        ));
    }
    to_mcp_error(e.to_string())
}

fn no_session_error(tool_name: &str) -> McpError {
    to_mcp_error(format!(
        "{tool_name} requires a connected session. Call debugger_launch first."
    ))
}

#[tool_router]
impl RokuDebugMcpServer {
    fn new() -> Self {
        Self {
            tool_router: Self::tool_router(),
            state: Arc::new(Mutex::new(SessionManager::new())),
        }
    }

    #[tool(
        description = "Stage a Roku project with breakpoints injected and connect to the device debug console"
    )]
    async fn debugger_launch(
        &self,
        params: Parameters<DebuggerLaunchParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let mut manager = self.state.lock().await;

        if manager.session.is_some() {
            return Err(to_mcp_error(
                "A debug session is already connected. Disconnect before launching again.",
            ));
        }

        let mut config = DebugConfig::from_env();
        if let Some(host) = &params.host {
            config.host = host.clone();
        }
        config.retain_staging_dir = params.retain_staging_dir;
        config.enable_source_maps = params.enable_source_maps;

        let mut project = Project::new(&params.root_dir)
            .map_err(|e| to_mcp_error(format!("Invalid root_dir '{}': {e}", params.root_dir)))?;
        if let Some(out_dir) = &params.out_dir {
            project = project.with_out_dir(PathBuf::from(out_dir));
        }
        if !params.files.is_empty() {
            project = project.with_files(params.files.clone());
        }

        let mut component_libraries = Vec::with_capacity(params.component_libraries.len());
        for library in &params.component_libraries {
            let mut lib = Project::new(&library.root_dir).map_err(|e| {
                to_mcp_error(format!(
                    "Invalid component library root '{}': {e}",
                    library.root_dir
                ))
            })?;
            if !library.files.is_empty() {
                lib = lib.with_files(library.files.clone());
            }
            component_libraries.push(lib);
        }

        let options = LaunchOptions {
            project,
            component_libraries,
            stop_on_entry: params.stop_on_entry,
        };

        let host = config.host.clone();
        let (session, events_rx) =
            Session::launch(options, Arc::clone(&manager.breakpoints), config)
                .await
                .map_err(|e| to_mcp_error(format!("Launch failed: {e}")))?;

        let state = session.state().await;
        manager.session = Some(ActiveSession::new(session, events_rx));

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": state,
            "host": host,
        })))
    }

    #[tool(description = "Disconnect from the device and clean up staged output")]
    async fn debugger_disconnect(
        &self,
        _params: Parameters<DebuggerDisconnectParams>,
    ) -> Result<CallToolResult, McpError> {
        let mut manager = self.state.lock().await;

        let Some(active) = manager.session.take() else {
            return Ok(CallToolResult::structured(json!({
                "ok": true,
                "state": "disconnected",
            })));
        };

        active
            .session
            .disconnect()
            .await
            .map_err(|e| to_mcp_error(format!("Disconnect failed: {e}")))?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": "disconnected",
        })))
    }

    #[tool(
        description = "Replace the breakpoints for one source file; only valid while no session is connected"
    )]
    async fn debugger_set_breakpoints(
        &self,
        params: Parameters<DebuggerSetBreakpointsParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let manager = self.state.lock().await;

        let requests: Vec<BreakpointRequest> = params
            .breakpoints
            .into_iter()
            .map(BreakpointRequest::from)
            .collect();

        let accepted = manager
            .breakpoints
            .lock()
            .await
            .replace_breakpoints(Path::new(&params.source_path), requests)
            .map_err(|e| match e {
                DebugError::BreakpointsLocked => to_mcp_error(
                    "Breakpoints are locked while a session is connected. \
                     Disconnect, change breakpoints, and launch again.",
                ),
                other => to_mcp_error(other.to_string()),
            })?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "source_path": params.source_path,
            "breakpoints": accepted.iter().filter(|bp| !bp.hidden).collect::<Vec<_>>(),
        })))
    }

    #[tool(description = "Resume the suspended channel")]
    async fn debugger_continue(
        &self,
        _params: Parameters<DebuggerContinueParams>,
    ) -> Result<CallToolResult, McpError> {
        let mut manager = self.state.lock().await;
        let Some(active) = manager.session.as_mut() else {
            return Err(no_session_error("debugger_continue"));
        };

        active.session.continue_run().await.map_err(debug_error)?;
        active.pump();

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": "running",
        })))
    }

    #[tool(description = "Interrupt the running channel at its next instruction")]
    async fn debugger_pause(
        &self,
        _params: Parameters<DebuggerPauseParams>,
    ) -> Result<CallToolResult, McpError> {
        let mut manager = self.state.lock().await;
        let Some(active) = manager.session.as_mut() else {
            return Err(no_session_error("debugger_pause"));
        };

        active.session.pause().await.map_err(debug_error)?;
        active.pump();

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": "suspended",
            "stop": active.stop_summary(),
        })))
    }

    #[tool(description = "Leave the debugger prompt via the device's `exit` command")]
    async fn debugger_exit(
        &self,
        _params: Parameters<DebuggerExitParams>,
    ) -> Result<CallToolResult, McpError> {
        let mut manager = self.state.lock().await;
        let Some(active) = manager.session.as_mut() else {
            return Err(no_session_error("debugger_exit"));
        };

        active.session.exit_active_debugger().await.map_err(debug_error)?;
        active.pump();

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": "running",
        })))
    }

    #[tool(description = "Step over the current line")]
    async fn debugger_step_over(
        &self,
        params: Parameters<DebuggerStepParams>,
    ) -> Result<CallToolResult, McpError> {
        self.step("over", params.0.thread_id).await
    }

    #[tool(description = "Step into the call on the current line")]
    async fn debugger_step_in(
        &self,
        params: Parameters<DebuggerStepParams>,
    ) -> Result<CallToolResult, McpError> {
        self.step("in", params.0.thread_id).await
    }

    #[tool(description = "Step out of the current function")]
    async fn debugger_step_out(
        &self,
        params: Parameters<DebuggerStepParams>,
    ) -> Result<CallToolResult, McpError> {
        self.step("out", params.0.thread_id).await
    }

    #[tool(description = "List device threads with suspension points mapped to source")]
    async fn debugger_threads(
        &self,
        _params: Parameters<DebuggerThreadsParams>,
    ) -> Result<CallToolResult, McpError> {
        let mut manager = self.state.lock().await;
        let Some(active) = manager.session.as_mut() else {
            return Err(no_session_error("debugger_threads"));
        };

        let threads = active.session.get_threads().await.map_err(debug_error)?;
        active.pump();

        // An empty list while "running" means "not suspended yet", not
        // "no threads"; the state field is how callers tell them apart.
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": active.session.state().await,
            "threads": threads,
        })))
    }

    #[tool(description = "Backtrace for one thread, innermost frame first")]
    async fn debugger_stack_trace(
        &self,
        params: Parameters<DebuggerStackTraceParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let mut manager = self.state.lock().await;
        let Some(active) = manager.session.as_mut() else {
            return Err(no_session_error("debugger_stack_trace"));
        };
        active.pump();

        let thread_id = active.thread_or_default(params.thread_id);
        let frames = active
            .session
            .get_stack_trace(thread_id)
            .await
            .map_err(debug_error)?;
        active.pump();

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": active.session.state().await,
            "thread_id": thread_id,
            "frames": frames,
        })))
    }

    #[tool(description = "Inspect locals or a dotted expression in the suspended thread")]
    async fn debugger_variables(
        &self,
        params: Parameters<DebuggerVariablesParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let mut manager = self.state.lock().await;
        let Some(active) = manager.session.as_mut() else {
            return Err(no_session_error("debugger_variables"));
        };
        active.pump();

        let thread_id = active.thread_or_default(params.thread_id);
        let expression = params.expression.unwrap_or_default();
        let root_scope = expression.trim().is_empty();
        let variables = active
            .session
            .get_variable(&expression, thread_id, root_scope)
            .await
            .map_err(debug_error)?;
        active.pump();

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": active.session.state().await,
            "thread_id": thread_id,
            "variables": variables,
        })))
    }

    #[tool(description = "Run a raw console statement and return what the device printed")]
    async fn debugger_evaluate(
        &self,
        params: Parameters<DebuggerEvaluateParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let mut manager = self.state.lock().await;
        let Some(active) = manager.session.as_mut() else {
            return Err(no_session_error("debugger_evaluate"));
        };
        active.pump();

        let result = active
            .session
            .evaluate(&params.expression)
            .await
            .map_err(debug_error)?;
        active.pump();

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "result": result,
        })))
    }

    #[tool(
        description = "Drain buffered device events: suspensions, console output, compile and runtime errors, rendezvous updates"
    )]
    async fn debugger_events(
        &self,
        params: Parameters<DebuggerEventsParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let mut manager = self.state.lock().await;
        let Some(active) = manager.session.as_mut() else {
            return Err(no_session_error("debugger_events"));
        };

        active.pump();
        let take = params
            .max
            .unwrap_or(usize::MAX)
            .min(active.event_buffer.len());
        let events: Vec<DeviceEvent> = active.event_buffer.drain(..take).collect();
        let state = active.session.state().await;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": state,
            "degraded": active.session.is_degraded(),
            "remaining": active.event_buffer.len(),
            "events": events,
        })))
    }

    async fn step(
        &self,
        kind: &str,
        thread_id: Option<u32>,
    ) -> Result<CallToolResult, McpError> {
        let mut manager = self.state.lock().await;
        let Some(active) = manager.session.as_mut() else {
            return Err(no_session_error("debugger_step"));
        };
        active.pump();

        let thread_id = active.thread_or_default(thread_id);
        let step_result = match kind {
            "in" => active.session.step_into(thread_id).await,
            "out" => active.session.step_out(thread_id).await,
            _ => active.session.step_over(thread_id).await,
        };
        step_result.map_err(debug_error)?;

        // The step completes when the device lands on its next line.
        let suspended = active.session.wait_for_suspend(WAIT_FOR_STOP_TIMEOUT).await;
        active.pump();

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": if suspended { "suspended" } else { "running" },
            "thread_id": thread_id,
            "stop": active.stop_summary(),
        })))
    }
}

#[tool_handler]
impl ServerHandler for RokuDebugMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Roku debug MCP server: stage, inject breakpoints, and drive the device's \
                 BrightScript debug console over a single session"
                    .into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let server = RokuDebugMcpServer::new();
    let transport = transport::stdio();

    tracing::info!("Starting Roku Debug MCP Server on stdio...");

    server.serve(transport).await?.waiting().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use roku_debug_core::RuntimeLocation;

    #[test]
    fn breakpoint_spec_converts_to_request() {
        let spec = BreakpointSpec {
            line: 12,
            column: Some(5),
            condition: Some("count > 3".to_string()),
            hit_count: Some(4),
            log_message: None,
        };
        let request = BreakpointRequest::from(spec);
        assert_eq!(request.line, 12);
        assert_eq!(request.column, Some(5));
        assert_eq!(request.condition.as_deref(), Some("count > 3"));
        assert_eq!(request.hit_count, Some(4));
    }

    #[test]
    fn push_buffered_event_keeps_buffer_bounded() {
        let mut buffer = VecDeque::new();
        for i in 0..(MAX_BUFFERED_EVENTS + 10) {
            push_buffered_event(
                &mut buffer,
                DeviceEvent::ConsoleOutput {
                    text: format!("line-{i}"),
                    is_adapter_owned: false,
                },
            );
        }
        assert_eq!(buffer.len(), MAX_BUFFERED_EVENTS);
        match buffer.front() {
            Some(DeviceEvent::ConsoleOutput { text, .. }) => assert_eq!(text, "line-10"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn thread_default_follows_last_suspension() {
        let suspended = DeviceEvent::Suspended {
            thread_id: 2,
            location: Some(RuntimeLocation {
                path: "pkg:/source/main.brs".to_string(),
                line: 10,
            }),
            source: None,
        };
        assert_eq!(default_thread(Some(&suspended), None), 2);
        assert_eq!(default_thread(Some(&suspended), Some(5)), 5);
        assert_eq!(default_thread(None, None), 0);
    }

    #[test]
    fn launch_params_accept_minimal_payload() {
        let params: DebuggerLaunchParams =
            serde_json::from_value(json!({ "root_dir": "/tmp/app" })).unwrap();
        assert_eq!(params.root_dir, "/tmp/app");
        assert!(params.files.is_empty());
        assert!(params.component_libraries.is_empty());
        assert!(!params.stop_on_entry);
    }
}
