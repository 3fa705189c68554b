//! The device console client.
//!
//! Owns the single TCP connection to the debug console and presents it
//! two ways: a typed command surface whose calls resolve against the
//! next prompt, and a stream of classified [`DeviceEvent`]s for
//! everything the device volunteers on its own. The console is one
//! shared byte stream, so commands are strictly serialized; unsolicited
//! events keep flowing while a command is in flight because the read
//! loop runs independently of any waiter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::breakpoints::LOGPOINT_PREFIX;
use crate::config::DebugConfig;
use crate::error::{DebugError, Result};
use crate::events::{CloseReason, CompileError, DeviceEvent, RuntimeLocation};
use crate::protocol::classifier::{drain_console_buffer, Classified, Classifier, ConsoleChunk};
use crate::protocol::replies::{
    parse_stack_trace, parse_threads, parse_variables, selected_thread, StackFrame, ThreadInfo,
    Variable,
};
use crate::rendezvous::RendezvousTracker;

const LINE_TERMINATOR: &str = "\r\n";
const READ_CHUNK_SIZE: usize = 4096;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Connection lifecycle. `Suspended` alone does not mean commands are
/// valid; the prompt flag tracks whether the device is accepting input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Running,
    Suspended,
    Terminated,
}

/// The one in-flight command slot. `Abandoned` marks a command whose
/// waiter timed out: the device has no cancel primitive, so its reply
/// may still arrive and must be discarded up to the next prompt rather
/// than attributed to a later command.
enum Pending {
    Idle,
    Active {
        command: String,
        lines: Vec<String>,
        tx: oneshot::Sender<String>,
    },
    Abandoned {
        command: String,
    },
}

struct Shared {
    writer: Mutex<BoxedWriter>,
    events_tx: mpsc::UnboundedSender<DeviceEvent>,
    state: Mutex<SessionState>,
    at_prompt: AtomicBool,
    degraded: AtomicBool,
    pending: Mutex<Pending>,
    command_gate: Mutex<()>,
    prompt_notify: Notify,
    last_stop: Mutex<Option<RuntimeLocation>>,
    /// Thread id from the most recent attach/select hint; the device
    /// attributes stops and crashes to it.
    hinted_thread: Mutex<u32>,
    selected_thread: Mutex<Option<u32>>,
    /// Lowercased path suffix plus runtime line of every stop the
    /// adapter injected for itself. Fixed for the connection's life;
    /// known before the reader sees its first byte.
    hidden_stops: Vec<(String, u32)>,
    suppress_hidden_stops: bool,
    rendezvous_tracking: bool,
    close_reason: Mutex<CloseReason>,
    closed_emitted: AtomicBool,
    command_timeout: Duration,
}

impl Shared {
    fn emit(&self, event: DeviceEvent) {
        let _ = self.events_tx.send(event);
    }
}

pub struct ConsoleClient {
    shared: Arc<Shared>,
    reader_task: JoinHandle<()>,
}

impl ConsoleClient {
    /// Dials the device's debug console. `hidden_stops` lists the
    /// adapter-injected stops (path suffix, runtime line) to suppress;
    /// it must be complete up front because the device may hit one
    /// before the first command goes out.
    pub async fn connect(
        config: &DebugConfig,
        hidden_stops: Vec<(String, u32)>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DeviceEvent>)> {
        let addr = config.console_addr();
        let stream = timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| DebugError::timeout("connect", config.connect_timeout))??;
        debug!(%addr, "connected to debug console");
        let (read_half, write_half) = stream.into_split();
        Ok(Self::start(
            Box::new(read_half),
            Box::new(write_half),
            config,
            hidden_stops,
        ))
    }

    /// Builds a client over arbitrary stream halves. The transport seam
    /// for in-memory console simulation.
    pub fn start(
        reader: BoxedReader,
        writer: BoxedWriter,
        config: &DebugConfig,
        hidden_stops: Vec<(String, u32)>,
    ) -> (Self, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            writer: Mutex::new(writer),
            events_tx,
            state: Mutex::new(SessionState::Connecting),
            at_prompt: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            pending: Mutex::new(Pending::Idle),
            command_gate: Mutex::new(()),
            prompt_notify: Notify::new(),
            last_stop: Mutex::new(None),
            hinted_thread: Mutex::new(0),
            selected_thread: Mutex::new(None),
            hidden_stops: hidden_stops
                .into_iter()
                .map(|(path, line)| (path.to_ascii_lowercase(), line))
                .collect(),
            suppress_hidden_stops: config.suppress_hidden_stops,
            rendezvous_tracking: config.rendezvous_tracking,
            close_reason: Mutex::new(CloseReason::ConnectionLost),
            closed_emitted: AtomicBool::new(false),
            command_timeout: config.command_timeout,
        });

        shared.emit(DeviceEvent::Connected);
        let reader_task = tokio::spawn(reader_loop(reader, Arc::clone(&shared)));

        (
            Self {
                shared,
                reader_task,
            },
            events_rx,
        )
    }

    pub async fn state(&self) -> SessionState {
        *self.shared.state.lock().await
    }

    pub fn is_at_prompt(&self) -> bool {
        self.shared.at_prompt.load(Ordering::SeqCst)
    }

    /// True once a command has timed out on this connection. Later
    /// commands may still succeed; callers decide whether to tear down.
    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.load(Ordering::SeqCst)
    }

    /// Waits until the device is at its prompt, up to `wait`. Returns
    /// the prompt flag as last observed.
    pub async fn wait_for_suspend(&self, wait: Duration) -> bool {
        if self.shared.at_prompt.load(Ordering::SeqCst) {
            return true;
        }
        let notified = self.shared.prompt_notify.notified();
        let _ = timeout(wait, notified).await;
        self.shared.at_prompt.load(Ordering::SeqCst)
    }

    pub async fn continue_run(&self) -> Result<()> {
        let _gate = self.shared.command_gate.lock().await;
        self.ensure_connected().await?;
        self.resume_with("c").await
    }

    /// Interrupts a running channel. The console takes a bare line
    /// terminator as the break request; the resulting prompt is the
    /// reply.
    pub async fn pause(&self) -> Result<()> {
        let _gate = self.shared.command_gate.lock().await;
        self.ensure_connected().await?;
        if self.shared.at_prompt.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.write_line("").await?;
        if !self.wait_prompt_internal().await {
            self.shared.degraded.store(true, Ordering::SeqCst);
            return Err(DebugError::timeout("pause", self.shared.command_timeout));
        }
        Ok(())
    }

    pub async fn step_over(&self, thread_id: u32) -> Result<()> {
        self.step("over", thread_id).await
    }

    pub async fn step_into(&self, thread_id: u32) -> Result<()> {
        self.step("step", thread_id).await
    }

    pub async fn step_out(&self, thread_id: u32) -> Result<()> {
        self.step("out", thread_id).await
    }

    pub async fn get_threads(&self) -> Result<Vec<ThreadInfo>> {
        let _gate = self.shared.command_gate.lock().await;
        let text = self.request_locked("threads", true, false).await?;
        let threads = parse_threads(&text);
        if let Some(id) = selected_thread(&threads) {
            *self.shared.selected_thread.lock().await = Some(id);
        }
        Ok(threads)
    }

    pub async fn get_stack_trace(&self, thread_id: u32) -> Result<Vec<StackFrame>> {
        let _gate = self.shared.command_gate.lock().await;
        self.select_thread_locked(thread_id).await?;
        let text = self.request_locked("bt", true, false).await?;
        Ok(parse_stack_trace(&text))
    }

    /// Fetches variables on `thread_id`. With `root_scope` set the
    /// reply is the `var` locals listing; otherwise the expression is
    /// printed and returned as a single value. The console inspects the
    /// selected thread's top frame only.
    pub async fn get_variable(
        &self,
        expression: &str,
        thread_id: u32,
        root_scope: bool,
    ) -> Result<Vec<Variable>> {
        let _gate = self.shared.command_gate.lock().await;
        self.select_thread_locked(thread_id).await?;
        if root_scope {
            let text = self.request_locked("var", true, false).await?;
            return Ok(parse_variables(&text));
        }
        let command = format!("print {expression}");
        let text = self.request_locked(&command, true, false).await?;
        Ok(vec![Variable {
            name: expression.to_string(),
            value: text.trim().to_string(),
        }])
    }

    /// Runs a raw statement in the selected thread's scope and returns
    /// whatever the console printed back.
    pub async fn evaluate(&self, expression: &str) -> Result<String> {
        let _gate = self.shared.command_gate.lock().await;
        let text = self.request_locked(expression, true, false).await?;
        Ok(text.trim_end().to_string())
    }

    /// Leaves the micro debugger, letting the channel continue.
    pub async fn exit_active_debugger(&self) -> Result<()> {
        let _gate = self.shared.command_gate.lock().await;
        self.ensure_connected().await?;
        self.resume_with("exit").await
    }

    /// Tears the connection down locally.
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut reason = self.shared.close_reason.lock().await;
            if *reason == CloseReason::ConnectionLost {
                *reason = CloseReason::Requested;
            }
        }
        {
            let mut state = self.shared.state.lock().await;
            *state = SessionState::Terminated;
        }
        self.shared.at_prompt.store(false, Ordering::SeqCst);
        fail_pending(&self.shared).await;
        self.reader_task.abort();
        {
            let mut writer = self.shared.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        if !self.shared.closed_emitted.swap(true, Ordering::SeqCst) {
            let reason = *self.shared.close_reason.lock().await;
            self.shared.emit(DeviceEvent::ConnectionClosed { reason });
        }
        Ok(())
    }

    async fn step(&self, verb: &str, thread_id: u32) -> Result<()> {
        let _gate = self.shared.command_gate.lock().await;
        self.select_thread_locked(thread_id).await?;
        self.request_locked(verb, true, true).await?;
        Ok(())
    }

    /// The console steps and inspects whichever thread is selected, so
    /// thread-scoped commands select first. Skipped when the cached
    /// selection already matches; the cache resets at every resume.
    async fn select_thread_locked(&self, thread_id: u32) -> Result<()> {
        let current = *self.shared.selected_thread.lock().await;
        if current == Some(thread_id) {
            return Ok(());
        }
        let command = format!("thread {thread_id}");
        self.request_locked(&command, true, false).await?;
        *self.shared.selected_thread.lock().await = Some(thread_id);
        Ok(())
    }

    /// Writes one command and waits for its reply, the text between the
    /// write and the next prompt. Caller must hold the command gate.
    async fn request_locked(
        &self,
        command: &str,
        requires_prompt: bool,
        resumes: bool,
    ) -> Result<String> {
        self.ensure_connected().await?;
        if requires_prompt && !self.shared.at_prompt.load(Ordering::SeqCst) {
            return Err(DebugError::not_at_prompt(command));
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().await;
            match &*pending {
                Pending::Idle => {}
                // A previous command's reply may still be streaming;
                // never interleave a new command with it.
                Pending::Active { command: owner, .. }
                | Pending::Abandoned { command: owner } => {
                    return Err(DebugError::busy(owner.clone()));
                }
            }
            *pending = Pending::Active {
                command: command.to_string(),
                lines: Vec::new(),
                tx,
            };
        }

        self.shared.at_prompt.store(false, Ordering::SeqCst);
        if resumes {
            let mut state = self.shared.state.lock().await;
            *state = SessionState::Running;
            drop(state);
            *self.shared.selected_thread.lock().await = None;
            self.shared.emit(DeviceEvent::Resumed);
        }

        if let Err(e) = self.write_line(command).await {
            let mut pending = self.shared.pending.lock().await;
            *pending = Pending::Idle;
            return Err(e);
        }

        match timeout(self.shared.command_timeout, rx).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(_)) => {
                let reason = *self.shared.close_reason.lock().await;
                Err(DebugError::ConnectionClosed { reason })
            }
            Err(_) => {
                {
                    let mut pending = self.shared.pending.lock().await;
                    if matches!(*pending, Pending::Active { .. }) {
                        *pending = Pending::Abandoned {
                            command: command.to_string(),
                        };
                    }
                }
                self.shared.degraded.store(true, Ordering::SeqCst);
                warn!(command, "command timed out; connection marked degraded");
                Err(DebugError::timeout(command, self.shared.command_timeout))
            }
        }
    }

    /// Resumption commands have no reply; the console goes quiet until
    /// the next stop, which arrives as an event.
    async fn resume_with(&self, command: &str) -> Result<()> {
        self.shared.at_prompt.store(false, Ordering::SeqCst);
        {
            let mut state = self.shared.state.lock().await;
            *state = SessionState::Running;
        }
        *self.shared.selected_thread.lock().await = None;
        self.write_line(command).await?;
        self.shared.emit(DeviceEvent::Resumed);
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<()> {
        let state = *self.shared.state.lock().await;
        if state == SessionState::Terminated {
            let reason = *self.shared.close_reason.lock().await;
            return Err(DebugError::ConnectionClosed { reason });
        }
        Ok(())
    }

    async fn write_line(&self, command: &str) -> Result<()> {
        let mut writer = self.shared.writer.lock().await;
        writer.write_all(command.as_bytes()).await?;
        writer.write_all(LINE_TERMINATOR.as_bytes()).await?;
        writer.flush().await?;
        trace!(command, "wrote console command");
        Ok(())
    }

    async fn wait_prompt_internal(&self) -> bool {
        if self.shared.at_prompt.load(Ordering::SeqCst) {
            return true;
        }
        let notified = self.shared.prompt_notify.notified();
        let _ = timeout(self.shared.command_timeout, notified).await;
        self.shared.at_prompt.load(Ordering::SeqCst)
    }
}

async fn reader_loop(mut reader: BoxedReader, shared: Arc<Shared>) {
    let mut raw: Vec<u8> = Vec::new();
    let mut buffer = String::new();
    let mut bytes = [0_u8; READ_CHUNK_SIZE];
    let mut classifier = Classifier::new();
    let mut rendezvous = RendezvousTracker::new();

    loop {
        let n = match reader.read(&mut bytes).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "console read failed");
                break;
            }
        };
        raw.extend_from_slice(&bytes[..n]);
        // Hold back a partial multi-byte sequence at the chunk edge.
        let valid = match std::str::from_utf8(&raw) {
            Ok(s) => s.len(),
            Err(e) => e.valid_up_to(),
        };
        buffer.push_str(&String::from_utf8_lossy(&raw[..valid]));
        raw.drain(..valid);

        for chunk in drain_console_buffer(&mut buffer) {
            let classified = match chunk {
                ConsoleChunk::Prompt => classifier.classify_prompt(),
                ConsoleChunk::Line(line) => classifier.classify(&line),
            };
            handle_classified(&shared, &mut rendezvous, classified).await;
        }
    }

    // A compile block with no closing marker flushes on disconnect.
    if let Some(errors) = classifier.take_compile_errors() {
        handle_compile_errors(&shared, errors).await;
    }
    finish_connection(&shared).await;
}

async fn handle_classified(
    shared: &Arc<Shared>,
    rendezvous: &mut RendezvousTracker,
    classified: Classified,
) {
    match classified {
        Classified::Prompt => handle_prompt(shared).await,
        Classified::Stopped { location } => {
            *shared.last_stop.lock().await = location;
        }
        Classified::RuntimeError {
            code,
            message,
            location,
        } => {
            *shared.last_stop.lock().await = location.clone();
            let thread_id = *shared.hinted_thread.lock().await;
            shared.emit(DeviceEvent::RuntimeError {
                thread_id,
                code,
                message,
                location,
                source: None,
            });
        }
        Classified::RendezvousBlock { id, path, line } => {
            if shared.rendezvous_tracking {
                rendezvous.observe_block(id, &path, line);
            }
        }
        Classified::RendezvousUnblock { id, seconds } => {
            if shared.rendezvous_tracking {
                if let Some(histogram) = rendezvous.observe_unblock(id, seconds) {
                    shared.emit(DeviceEvent::RendezvousUpdate { histogram });
                }
            }
        }
        Classified::ThreadHint {
            thread_id,
            location,
        } => {
            *shared.last_stop.lock().await = Some(location);
            if let Some(id) = thread_id {
                *shared.hinted_thread.lock().await = id;
            }
        }
        Classified::LaunchStarted => {
            let mut state = shared.state.lock().await;
            if *state == SessionState::Connecting {
                *state = SessionState::Running;
            }
        }
        Classified::CompileBlockLine => {}
        Classified::CompileErrors(errors) => handle_compile_errors(shared, errors).await,
        Classified::AppExit => shared.emit(DeviceEvent::AppExit),
        Classified::Output(text) => handle_output(shared, text).await,
    }
}

async fn handle_output(shared: &Arc<Shared>, text: String) {
    let mut pending = shared.pending.lock().await;
    if let Pending::Active { lines, .. } = &mut *pending {
        lines.push(text);
        return;
    }
    let abandoned = matches!(*pending, Pending::Abandoned { .. });
    drop(pending);
    if abandoned {
        trace!("dropped line from abandoned command's reply");
        return;
    }
    // Logpoint output is adapter-owned; the sentinel never reaches the
    // consumer.
    let (text, is_adapter_owned) = match text.strip_prefix(LOGPOINT_PREFIX) {
        Some(rest) => (rest.strip_prefix(' ').unwrap_or(rest).to_string(), true),
        None => (text, false),
    };
    shared.emit(DeviceEvent::ConsoleOutput {
        text,
        is_adapter_owned,
    });
}

async fn handle_prompt(shared: &Arc<Shared>) {
    shared.at_prompt.store(true, Ordering::SeqCst);

    {
        let mut pending = shared.pending.lock().await;
        match std::mem::replace(&mut *pending, Pending::Idle) {
            Pending::Active { command, lines, tx } => {
                trace!(command, "reply complete");
                let _ = tx.send(lines.join("\n"));
            }
            Pending::Abandoned { command } => {
                debug!(command, "prompt closed an abandoned command's reply");
            }
            Pending::Idle => {}
        }
    }

    let became_suspended = {
        let mut state = shared.state.lock().await;
        match *state {
            SessionState::Connecting | SessionState::Running => {
                *state = SessionState::Suspended;
                true
            }
            _ => false,
        }
    };

    if became_suspended {
        let location = shared.last_stop.lock().await.take();
        if shared.suppress_hidden_stops && is_hidden_stop(shared, location.as_ref()) {
            debug!(?location, "suppressed hidden stop, resuming device");
            auto_continue(shared).await;
        } else {
            let thread_id = *shared.hinted_thread.lock().await;
            shared.emit(DeviceEvent::Suspended {
                thread_id,
                location,
                source: None,
            });
        }
    }

    shared.prompt_notify.notify_waiters();
}

fn is_hidden_stop(shared: &Shared, location: Option<&RuntimeLocation>) -> bool {
    let Some(location) = location else {
        return false;
    };
    let path = location.path.to_ascii_lowercase();
    shared
        .hidden_stops
        .iter()
        .any(|(suffix, line)| *line == location.line && path.ends_with(suffix))
}

async fn auto_continue(shared: &Arc<Shared>) {
    shared.at_prompt.store(false, Ordering::SeqCst);
    {
        let mut state = shared.state.lock().await;
        *state = SessionState::Running;
    }
    *shared.selected_thread.lock().await = None;
    let mut writer = shared.writer.lock().await;
    if let Err(e) = writer.write_all(format!("c{LINE_TERMINATOR}").as_bytes()).await {
        debug!(error = %e, "auto-continue write failed");
        return;
    }
    let _ = writer.flush().await;
}

async fn handle_compile_errors(shared: &Arc<Shared>, errors: Vec<CompileError>) {
    warn!(count = errors.len(), "device reported compile errors");
    {
        let mut state = shared.state.lock().await;
        *state = SessionState::Terminated;
    }
    *shared.close_reason.lock().await = CloseReason::CompileError;
    shared.at_prompt.store(false, Ordering::SeqCst);
    fail_pending(shared).await;
    shared.emit(DeviceEvent::CompileErrors { errors });
}

async fn finish_connection(shared: &Arc<Shared>) {
    {
        let mut state = shared.state.lock().await;
        *state = SessionState::Terminated;
    }
    shared.at_prompt.store(false, Ordering::SeqCst);
    fail_pending(shared).await;
    if !shared.closed_emitted.swap(true, Ordering::SeqCst) {
        let reason = *shared.close_reason.lock().await;
        shared.emit(DeviceEvent::ConnectionClosed { reason });
    }
    shared.prompt_notify.notify_waiters();
}

/// Drops the in-flight command's sender so its waiter sees the
/// connection-closed error instead of hanging out the full timeout.
async fn fail_pending(shared: &Arc<Shared>) {
    let mut pending = shared.pending.lock().await;
    *pending = Pending::Idle;
}
