//! Wire-level handling for the device debug console: splitting the
//! byte stream into lines and prompts, classifying what the device
//! said, parsing structured replies, and the client that owns the
//! connection.

pub mod classifier;
pub mod client;
pub mod replies;

pub use classifier::{Classified, Classifier, ConsoleChunk, PROMPT};
pub use client::{ConsoleClient, SessionState};
pub use replies::{StackFrame, ThreadInfo, Variable};
