//! Splits the console byte stream into logical chunks and classifies
//! each line.
//!
//! The console is a shared human-oriented stream: command replies,
//! compile diagnostics, crash reports, rendezvous traces and plain app
//! output all interleave on it. Two quirks drive the design here. The
//! debug prompt arrives WITHOUT a trailing newline, so it must be
//! detected in the unterminated buffer tail, not just in completed
//! lines. And compile errors arrive as a block whose end is only
//! recognizable by what follows it, so the classifier is stateful.

use std::sync::OnceLock;

use regex::Regex;

use crate::events::{CompileError, RuntimeLocation};

/// The device's input marker. Printed without a newline.
pub const PROMPT: &str = "Brightscript Debugger>";

/// Device error code for a `STOP` statement: a break, not a crash.
pub const STOP_ERROR_CODE: u32 = 0xf7;

const COMPILING_BANNER: &str = "------ Compiling";
const RUNNING_BANNER: &str = "------ Running";
const APP_EXIT_BEACON: &str = "|AppExitComplete";

/// Sideload output frames the compile phase in rulers of `=`; shorter
/// runs of `=` show up in ordinary app logs and must not count.
const EQUALS_BANNER_MIN: usize = 34;

fn is_equals_banner(line: &str) -> bool {
    line.len() >= EQUALS_BANNER_MIN && line.bytes().all(|b| b == b'=')
}

fn error_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<msg>.*?)\s*\((?P<kind>compile|runtime) error &h(?P<code>[0-9a-fA-F]+)\)(?:\s+in\s+(?P<path>\S+)\((?P<line>\d+)\))?\s*$",
        )
        .expect("hardcoded regex should compile")
    })
}

fn rendezvous_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Rendezvous\[(?P<id>\d+)\] at (?P<path>\S+)\((?P<line>\d+)\)\s*$")
            .expect("hardcoded regex should compile")
    })
}

fn rendezvous_unblock_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Rendezvous\[(?P<id>\d+)\] completed in (?P<secs>[0-9.]+) s\s*$")
            .expect("hardcoded regex should compile")
    })
}

fn thread_hint_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // `attached` gives just a position; `selected` leads with the
        // thread's listing row, id first.
        Regex::new(
            r"^Thread (?:attached|selected):\s+(?:(?P<id>\d+)\*?\s+)?(?P<path>\S+)\((?P<line>\d+)\)",
        )
        .expect("hardcoded regex should compile")
    })
}

/// One unit pulled out of the read buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleChunk {
    /// A newline-terminated line, terminator stripped.
    Line(String),
    /// The debug prompt, possibly unterminated.
    Prompt,
}

/// Extracts every complete line from `buffer`, then consumes a trailing
/// prompt if one is sitting in the unterminated tail. Partial lines and
/// partial prompts stay buffered for the next read.
pub fn drain_console_buffer(buffer: &mut String) -> Vec<ConsoleChunk> {
    let mut chunks = Vec::new();

    while let Some(pos) = buffer.find('\n') {
        let raw: String = buffer.drain(..=pos).collect();
        chunks.push(ConsoleChunk::Line(
            raw.trim_end_matches(['\r', '\n']).to_string(),
        ));
    }

    if buffer.trim_end().ends_with(PROMPT) {
        let tail = std::mem::take(buffer);
        let mut rest = tail.trim_end();
        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix(PROMPT) {
                chunks.push(ConsoleChunk::Prompt);
                rest = after.trim_start_matches(' ');
            } else if let Some(next) = rest.find(PROMPT) {
                let lead = rest[..next].trim_end();
                if !lead.is_empty() {
                    chunks.push(ConsoleChunk::Line(lead.to_string()));
                }
                rest = &rest[next..];
            } else {
                break;
            }
        }
    }

    chunks
}

/// Meaning of one console line.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// Device is at its prompt and accepting input.
    Prompt,
    /// A `STOP` was hit (`&hf7`); the prompt follows.
    Stopped { location: Option<RuntimeLocation> },
    RuntimeError {
        code: u32,
        message: String,
        location: Option<RuntimeLocation>,
    },
    RendezvousBlock {
        id: u64,
        path: String,
        line: u32,
    },
    RendezvousUnblock {
        id: u64,
        seconds: f64,
    },
    /// `Thread attached:` / `Thread selected:` hint. The id is only
    /// present in the `selected` row form.
    ThreadHint {
        thread_id: Option<u32>,
        location: RuntimeLocation,
    },
    /// The compile phase finished and the app is starting.
    LaunchStarted,
    /// Line absorbed into an open compile-error block.
    CompileBlockLine,
    /// A compile-error block just closed with these diagnostics.
    CompileErrors(Vec<CompileError>),
    AppExit,
    Output(String),
}

/// Stateful line classifier. One instance per connection; the compile
/// block and nothing else carries across lines.
#[derive(Debug, Default)]
pub struct Classifier {
    compile_block: Option<Vec<CompileError>>,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify_prompt(&mut self) -> Classified {
        // A prompt while a compile block is open means the device gave
        // up on launching; flush whatever it reported.
        match self.take_compile_errors() {
            Some(errors) => Classified::CompileErrors(errors),
            None => Classified::Prompt,
        }
    }

    pub fn classify(&mut self, line: &str) -> Classified {
        let trimmed = line.trim_end();

        if trimmed.trim_start().starts_with(PROMPT) {
            // Prompt flushed together with a newline, possibly with a
            // command echo after it; the echo is ours, drop it.
            return self.classify_prompt();
        }

        if self.compile_block.is_some() {
            return self.classify_in_block(trimmed);
        }

        if trimmed.starts_with(COMPILING_BANNER) || is_equals_banner(trimmed) {
            self.compile_block = Some(Vec::new());
            return Classified::CompileBlockLine;
        }
        if trimmed.starts_with(RUNNING_BANNER) {
            return Classified::LaunchStarted;
        }

        if let Some(caps) = error_re().captures(trimmed) {
            let code = u32::from_str_radix(&caps["code"], 16).unwrap_or(0);
            let location = match (caps.name("path"), caps.name("line")) {
                (Some(path), Some(line)) => Some(RuntimeLocation {
                    path: path.as_str().to_string(),
                    line: line.as_str().parse().unwrap_or(0),
                }),
                _ => None,
            };
            if &caps["kind"] == "compile" {
                // A stray compile diagnostic without its banner still
                // opens a block so follow-up lines group with it.
                let error = compile_error_from(&caps, location);
                self.compile_block = Some(vec![error]);
                return Classified::CompileBlockLine;
            }
            let message = caps["msg"].trim().to_string();
            if code == STOP_ERROR_CODE {
                return Classified::Stopped { location };
            }
            return Classified::RuntimeError {
                code,
                message,
                location,
            };
        }

        if let Some(caps) = rendezvous_block_re().captures(trimmed) {
            return Classified::RendezvousBlock {
                id: caps["id"].parse().unwrap_or(0),
                path: caps["path"].to_string(),
                line: caps["line"].parse().unwrap_or(0),
            };
        }
        if let Some(caps) = rendezvous_unblock_re().captures(trimmed) {
            return Classified::RendezvousUnblock {
                id: caps["id"].parse().unwrap_or(0),
                seconds: caps["secs"].parse().unwrap_or(0.0),
            };
        }

        if let Some(caps) = thread_hint_re().captures(trimmed) {
            return Classified::ThreadHint {
                thread_id: caps.name("id").and_then(|id| id.as_str().parse().ok()),
                location: RuntimeLocation {
                    path: caps["path"].to_string(),
                    line: caps["line"].parse().unwrap_or(0),
                },
            };
        }

        if trimmed.contains(APP_EXIT_BEACON) {
            return Classified::AppExit;
        }

        Classified::Output(line.to_string())
    }

    fn classify_in_block(&mut self, trimmed: &str) -> Classified {
        if trimmed.starts_with(RUNNING_BANNER) {
            // Compile finished. With diagnostics on record the device
            // should not have gotten here, but if it did, surface them.
            return match self.take_compile_errors() {
                Some(errors) => Classified::CompileErrors(errors),
                None => {
                    self.compile_block = None;
                    Classified::LaunchStarted
                }
            };
        }

        if let Some(caps) = error_re().captures(trimmed) {
            if &caps["kind"] == "compile" {
                let location = match (caps.name("path"), caps.name("line")) {
                    (Some(path), Some(line)) => Some(RuntimeLocation {
                        path: path.as_str().to_string(),
                        line: line.as_str().parse().unwrap_or(0),
                    }),
                    _ => None,
                };
                let error = compile_error_from(&caps, location);
                if let Some(block) = &mut self.compile_block {
                    block.push(error);
                }
                return Classified::CompileBlockLine;
            }
        }

        // Informational compile-phase chatter.
        Classified::CompileBlockLine
    }

    /// Drains the open compile block, if it holds any diagnostics. Used
    /// on socket close so a block with no closing marker still flushes.
    pub fn take_compile_errors(&mut self) -> Option<Vec<CompileError>> {
        match self.compile_block.take() {
            Some(errors) if !errors.is_empty() => Some(errors),
            _ => None,
        }
    }
}

fn compile_error_from(caps: &regex::Captures<'_>, location: Option<RuntimeLocation>) -> CompileError {
    let (path, line) = match location {
        Some(loc) => (loc.path, loc.line),
        None => (String::new(), 0),
    };
    CompileError {
        path,
        line,
        message: caps["msg"].trim().to_string(),
        source: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_extracts_lines_and_tail_prompt() {
        let mut buffer = String::from("hello world\r\npartial");
        let chunks = drain_console_buffer(&mut buffer);
        assert_eq!(chunks, vec![ConsoleChunk::Line("hello world".to_string())]);
        assert_eq!(buffer, "partial");

        buffer.push_str(" line\r\nBrightscript Debugger> ");
        let chunks = drain_console_buffer(&mut buffer);
        assert_eq!(
            chunks,
            vec![
                ConsoleChunk::Line("partial line".to_string()),
                ConsoleChunk::Prompt,
            ]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_keeps_partial_prompt_buffered() {
        let mut buffer = String::from("Brightscript Debu");
        assert!(drain_console_buffer(&mut buffer).is_empty());
        assert_eq!(buffer, "Brightscript Debu");

        buffer.push_str("gger> ");
        assert_eq!(
            drain_console_buffer(&mut buffer),
            vec![ConsoleChunk::Prompt]
        );
    }

    #[test]
    fn test_drain_handles_stuttered_prompts() {
        let mut buffer = String::from("Brightscript Debugger> Brightscript Debugger> ");
        let chunks = drain_console_buffer(&mut buffer);
        assert_eq!(chunks, vec![ConsoleChunk::Prompt, ConsoleChunk::Prompt]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_classify_stop_line() {
        let mut classifier = Classifier::new();
        let classified =
            classifier.classify("STOP (runtime error &hf7) in pkg:/source/main.brs(4)");
        assert_eq!(
            classified,
            Classified::Stopped {
                location: Some(RuntimeLocation {
                    path: "pkg:/source/main.brs".to_string(),
                    line: 4,
                }),
            }
        );
    }

    #[test]
    fn test_classify_runtime_error() {
        let mut classifier = Classifier::new();
        let classified = classifier
            .classify("Member function not found in BrightScript Component or interface. (runtime error &hf4) in pkg:/source/main.brs(22)");
        match classified {
            Classified::RuntimeError {
                code,
                message,
                location,
            } => {
                assert_eq!(code, 0xf4);
                assert!(message.starts_with("Member function not found"));
                assert_eq!(location.expect("location").line, 22);
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn test_compile_block_flushes_once_on_prompt() {
        let mut classifier = Classifier::new();
        assert_eq!(
            classifier.classify("------ Compiling dev 'Demo' ------"),
            Classified::CompileBlockLine
        );
        assert_eq!(
            classifier.classify("Syntax Error. (compile error &h02) in pkg:/source/main.brs(12)"),
            Classified::CompileBlockLine
        );
        assert_eq!(
            classifier.classify("Error loading file. (compile error &hb9) in pkg:/components/x.brs(1)"),
            Classified::CompileBlockLine
        );

        let flushed = classifier.classify("Brightscript Debugger> ");
        match flushed {
            Classified::CompileErrors(errors) => {
                assert_eq!(errors.len(), 2);
                assert_eq!(errors[0].path, "pkg:/source/main.brs");
                assert_eq!(errors[0].line, 12);
                assert_eq!(errors[0].message, "Syntax Error.");
            }
            other => panic!("unexpected classification: {other:?}"),
        }

        // The block is gone; a second prompt is just a prompt.
        assert_eq!(
            classifier.classify("Brightscript Debugger>"),
            Classified::Prompt
        );
        assert!(classifier.take_compile_errors().is_none());
    }

    #[test]
    fn test_clean_compile_closes_on_running_banner() {
        let mut classifier = Classifier::new();
        classifier.classify("------ Compiling dev 'Demo' ------");
        assert_eq!(
            classifier.classify("------ Running dev 'Demo' main ------"),
            Classified::LaunchStarted
        );
        assert_eq!(
            classifier.classify("app says hi"),
            Classified::Output("app says hi".to_string())
        );
    }

    #[test]
    fn test_equals_banner_opens_block() {
        let mut classifier = Classifier::new();
        assert_eq!(
            classifier.classify(&"=".repeat(40)),
            Classified::CompileBlockLine
        );
        assert_eq!(
            classifier.classify("Found dev 'Demo' UI application"),
            Classified::CompileBlockLine
        );
        assert_eq!(
            classifier.classify("Syntax Error. (compile error &h02) in pkg:/source/main.brs(7)"),
            Classified::CompileBlockLine
        );
        match classifier.classify("Brightscript Debugger> ") {
            Classified::CompileErrors(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].line, 7);
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn test_equals_banner_clean_launch_stays_quiet() {
        let mut classifier = Classifier::new();
        classifier.classify(&"=".repeat(34));
        classifier.classify("Found dev 'Demo' UI application");
        classifier.classify("------ Compiling dev 'Demo' ------");
        assert_eq!(
            classifier.classify("------ Running dev 'Demo' main ------"),
            Classified::LaunchStarted
        );
        assert!(classifier.take_compile_errors().is_none());

        // A short ruler in app output is just output.
        assert_eq!(
            classifier.classify("===="),
            Classified::Output("====".to_string())
        );
    }

    #[test]
    fn test_stray_compile_error_opens_block() {
        let mut classifier = Classifier::new();
        assert_eq!(
            classifier.classify("Syntax Error. (compile error &h02) in pkg:/source/main.brs(3)"),
            Classified::CompileBlockLine
        );
        let errors = classifier.take_compile_errors().expect("flushed");
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_classify_rendezvous_pair() {
        let mut classifier = Classifier::new();
        assert_eq!(
            classifier.classify("Rendezvous[31] at pkg:/components/task.brs(12)"),
            Classified::RendezvousBlock {
                id: 31,
                path: "pkg:/components/task.brs".to_string(),
                line: 12,
            }
        );
        assert_eq!(
            classifier.classify("Rendezvous[31] completed in 0.002 s"),
            Classified::RendezvousUnblock {
                id: 31,
                seconds: 0.002,
            }
        );
    }

    #[test]
    fn test_classify_thread_hint_and_exit_beacon() {
        let mut classifier = Classifier::new();
        assert_eq!(
            classifier.classify("Thread attached: pkg:/source/main.brs(8)     main()"),
            Classified::ThreadHint {
                thread_id: None,
                location: RuntimeLocation {
                    path: "pkg:/source/main.brs".to_string(),
                    line: 8,
                },
            }
        );
        assert_eq!(
            classifier.classify(
                "Thread selected:  1*   pkg:/components/task.brs(20)   json = response.getstring()"
            ),
            Classified::ThreadHint {
                thread_id: Some(1),
                location: RuntimeLocation {
                    path: "pkg:/components/task.brs".to_string(),
                    line: 20,
                },
            }
        );
        assert_eq!(
            classifier.classify("07-20 10:32:01.123 [beacon.signal] |AppExitComplete"),
            Classified::AppExit
        );
    }

    #[test]
    fn test_ordinary_output_passes_through() {
        let mut classifier = Classifier::new();
        assert_eq!(
            classifier.classify("loading feed page 2"),
            Classified::Output("loading feed page 2".to_string())
        );
    }
}
