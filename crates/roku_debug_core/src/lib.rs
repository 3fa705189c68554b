//! Roku Debug Core
//!
//! An async library that turns a Roku device's line-oriented debug
//! console into a structured debugging API: session lifecycle over the
//! telnet-style console on port 8085, breakpoint injection into staged
//! BrightScript source, classification of everything the device prints,
//! and bidirectional mapping between device-reported coordinates and
//! the user's source tree.

pub mod breakpoints;
pub mod config;
pub mod error;
pub mod events;
pub mod locations;
pub mod project;
pub mod protocol;
pub mod rendezvous;
pub mod session;
pub mod source_maps;

// Re-export commonly used types
pub use breakpoints::{Breakpoint, BreakpointManager, BreakpointRequest};
pub use config::DebugConfig;
pub use error::{DebugError, Result};
pub use events::{CloseReason, CompileError, DeviceEvent, RuntimeLocation, SourcePosition};
pub use locations::LocationResolver;
pub use project::Project;
pub use protocol::{ConsoleClient, SessionState, StackFrame, ThreadInfo, Variable};
pub use session::{shared_breakpoints, LaunchOptions, Session, SharedBreakpoints};
