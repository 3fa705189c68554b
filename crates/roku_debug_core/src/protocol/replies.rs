//! Parsers for the fixed-format listings the console prints in reply to
//! inspection commands. Field order is fixed by the device; function
//! identifiers arrive lower-cased.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::events::RuntimeLocation;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadInfo {
    pub id: u32,
    /// The thread the debugger currently operates on, starred in the
    /// listing.
    pub selected: bool,
    pub location: RuntimeLocation,
    /// Filled by the session orchestrator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<crate::events::SourcePosition>,
    pub code_snippet: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    /// Device frame number; 0 is the outermost frame. Listed
    /// innermost-first.
    pub index: u32,
    pub function: String,
    pub location: RuntimeLocation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<crate::events::SourcePosition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Variable {
    pub name: String,
    /// The device's one-line rendering, type and value together.
    pub value: String,
}

fn thread_row_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?P<id>\d+)(?P<sel>\*?)\s+(?P<path>\S+)\((?P<line>\d+)\)\s*(?P<code>.*)$")
            .expect("hardcoded regex should compile")
    })
}

fn frame_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^#(?P<index>\d+)\s+Function\s+(?P<function>.+)$")
            .expect("hardcoded regex should compile")
    })
}

fn frame_location_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"file/line:\s*(?P<path>\S+)\((?P<line>\d+)\)")
            .expect("hardcoded regex should compile")
    })
}

/// Parses the `threads` listing. Header and `*selected` footer are
/// skipped; unrecognized rows are ignored rather than failing the whole
/// listing.
pub fn parse_threads(text: &str) -> Vec<ThreadInfo> {
    let mut threads = Vec::new();
    for line in text.lines() {
        let Some(caps) = thread_row_re().captures(line) else {
            continue;
        };
        threads.push(ThreadInfo {
            id: caps["id"].parse().unwrap_or(0),
            selected: !caps["sel"].is_empty(),
            location: RuntimeLocation {
                path: caps["path"].to_string(),
                line: caps["line"].parse().unwrap_or(0),
            },
            source: None,
            code_snippet: caps["code"].trim_end().to_string(),
        });
    }
    threads
}

pub fn selected_thread(threads: &[ThreadInfo]) -> Option<u32> {
    threads.iter().find(|t| t.selected).map(|t| t.id)
}

/// Parses a `bt` listing: `#N  Function <sig>` headers each followed by
/// a `file/line:` row. Frames come innermost-first and stay that way.
pub fn parse_stack_trace(text: &str) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    let mut current: Option<(u32, String)> = None;

    for line in text.lines() {
        if let Some(caps) = frame_header_re().captures(line.trim_end()) {
            current = Some((
                caps["index"].parse().unwrap_or(0),
                caps["function"].trim().to_string(),
            ));
            continue;
        }
        if let Some(caps) = frame_location_re().captures(line) {
            if let Some((index, function)) = current.take() {
                frames.push(StackFrame {
                    index,
                    function,
                    location: RuntimeLocation {
                        path: caps["path"].to_string(),
                        line: caps["line"].parse().unwrap_or(0),
                    },
                    source: None,
                });
            }
        }
    }
    frames
}

/// Parses a `var` listing: one local per line, name first, the device's
/// type/value rendering after it.
pub fn parse_variables(text: &str) -> Vec<Variable> {
    let mut variables = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (name, value) = match trimmed.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (trimmed, ""),
        };
        variables.push(Variable {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
    variables
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_threads_listing() {
        let text = "  ID    Location                                Source Code\n \
                    0*   pkg:/source/main.brs(6)                 screen.show()\n \
                    1    pkg:/components/loadertask.brs(20)      json = response.getstring()\n  \
                    *selected";
        let threads = parse_threads(text);

        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].id, 0);
        assert!(threads[0].selected);
        assert_eq!(threads[0].location.path, "pkg:/source/main.brs");
        assert_eq!(threads[0].location.line, 6);
        assert_eq!(threads[0].code_snippet, "screen.show()");
        assert!(!threads[1].selected);
        assert_eq!(threads[1].id, 1);

        assert_eq!(selected_thread(&threads), Some(0));
    }

    #[test]
    fn test_parse_stack_trace_listing() {
        let text = "#1  Function updatescores() As Void\n    \
                    file/line: pkg:/source/scores.brs(10)\n\
                    #0  Function main() As Void\n    \
                    file/line: pkg:/source/appmain.brs(8)";
        let frames = parse_stack_trace(text);

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].index, 1);
        assert_eq!(frames[0].function, "updatescores() As Void");
        assert_eq!(frames[0].location.line, 10);
        assert_eq!(frames[1].index, 0);
        assert_eq!(frames[1].location.path, "pkg:/source/appmain.brs");
    }

    #[test]
    fn test_parse_stack_trace_tolerates_noise() {
        let frames = parse_stack_trace("Current Function:\nnothing here\n");
        assert!(frames.is_empty());
    }

    #[test]
    fn test_parse_variables_listing() {
        let text = "global           Interface:ifGlobal\n\
                    m                roAssociativeArray refcnt=2 count:4\n\
                    i                Integer val:5\n\
                    obj              <uninitialized>\n";
        let variables = parse_variables(text);

        assert_eq!(variables.len(), 4);
        assert_eq!(variables[0].name, "global");
        assert_eq!(variables[0].value, "Interface:ifGlobal");
        assert_eq!(variables[2].name, "i");
        assert_eq!(variables[2].value, "Integer val:5");
        assert_eq!(variables[3].value, "<uninitialized>");
    }
}
