//! Classified device events.
//!
//! Everything the device volunteers outside of a command reply is folded
//! into [`DeviceEvent`] and pushed through the session's event channel.
//! Coordinates arrive in debugger space (`pkg:/...` paths, post-injection
//! line numbers); the session orchestrator fills in the `source` fields
//! after running them through the resolver, so consumers see both spaces.

use std::path::PathBuf;

use serde::Serialize;

use crate::rendezvous::RendezvousHistogram;

/// A position as the device reports it: a `pkg:/`-relative (possibly
/// truncated) path and a 1-based line in the staged copy of the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeLocation {
    pub path: String,
    pub line: u32,
}

/// A position in the files the user edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourcePosition {
    pub path: PathBuf,
    pub line: u32,
}

/// Why the device closed (or we closed) the console socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloseReason {
    /// The package was rejected at compile time; a `compile-errors`
    /// event preceded this one.
    CompileError,
    /// The socket dropped without a recognized terminal marker.
    ConnectionLost,
    /// `disconnect()` was called locally.
    Requested,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::CompileError => write!(f, "compile error"),
            CloseReason::ConnectionLost => write!(f, "connection lost"),
            CloseReason::Requested => write!(f, "disconnect requested"),
        }
    }
}

/// One diagnostic from the device's compile-error block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompileError {
    /// Path as reported, debugger space.
    pub path: String,
    pub line: u32,
    pub message: String,
    /// Filled by the session orchestrator when the path resolves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourcePosition>,
}

/// Unsolicited device activity, in the order the device reported it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum DeviceEvent {
    /// Socket opened and the console is live.
    Connected,
    /// The device printed its debug prompt; inspection commands are
    /// valid until the next resume.
    Suspended {
        thread_id: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        location: Option<RuntimeLocation>,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<SourcePosition>,
    },
    /// Execution continued (a `continue`/step command was accepted).
    Resumed,
    /// The app hit a runtime error. Not terminal; the device stays at
    /// its prompt and can still be inspected.
    RuntimeError {
        thread_id: u32,
        /// Device error code, e.g. `0xe2`. `0xf7` is the code the device
        /// uses for its own STOP statement.
        code: u32,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        location: Option<RuntimeLocation>,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<SourcePosition>,
    },
    /// A rendezvous wait completed; carries the full histogram so far.
    RendezvousUpdate { histogram: RendezvousHistogram },
    /// Console text that was neither a reply to a pending command nor a
    /// recognized marker.
    ConsoleOutput { text: String, is_adapter_owned: bool },
    /// The device rejected the package. Terminal for the session.
    CompileErrors { errors: Vec<CompileError> },
    /// The app announced a clean exit.
    AppExit,
    /// The socket is gone. Always the last event of a session.
    ConnectionClosed { reason: CloseReason },
}
