//! Breakpoint bookkeeping and statement injection.
//!
//! The device has no breakpoint API; stopping at a line means writing a
//! `STOP` statement into the staged copy of the file before packaging.
//! Every injected statement occupies exactly one new line, which shifts
//! everything below it down by one. The [`InjectionLedger`] records the
//! injected lines per file so the resolver can undo those shifts when
//! the device reports post-injection line numbers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DebugError, Result};
use crate::project::{normalize_path, Project};

/// Console lines printed by injected logpoints start with this, letting
/// the classifier mark them as adapter-owned rather than app output.
pub const LOGPOINT_PREFIX: &str = "[rdb]";

/// A breakpoint as submitted by the host. Lines and columns are 1-based
/// here; the column is normalized to 0-based at the manager boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointRequest {
    pub line: u32,
    #[serde(default)]
    pub column: Option<u32>,
    #[serde(default)]
    pub condition: Option<String>,
    /// Trigger only from the Nth hit onward.
    #[serde(default)]
    pub hit_count: Option<u32>,
    /// Makes this a logpoint: print the message (with `{expr}`
    /// interpolation) instead of halting.
    #[serde(default)]
    pub log_message: Option<String>,
}

/// A breakpoint as the manager tracks it. `hidden` marks entries the
/// adapter injected for its own purposes (the entry-point stop) rather
/// than ones the user asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breakpoint {
    pub line: u32,
    /// 0-based.
    pub column: Option<u32>,
    pub enabled: bool,
    pub condition: Option<String>,
    pub hit_count: Option<u32>,
    pub log_message: Option<String>,
    pub hidden: bool,
}

impl Breakpoint {
    fn from_request(request: BreakpointRequest) -> Self {
        Self {
            line: request.line,
            column: request.column.map(|c| c.saturating_sub(1)),
            enabled: true,
            condition: none_if_blank(request.condition),
            hit_count: request.hit_count.filter(|n| *n > 1),
            log_message: none_if_blank(request.log_message),
            hidden: false,
        }
    }

    fn sort_key(&self) -> (u32, u32) {
        // Column None sorts before any concrete column.
        (self.line, self.column.map(|c| c + 1).unwrap_or(0))
    }
}

fn none_if_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Injected source lines per staged file, sorted ascending. All the
/// line-shift arithmetic between source space and runtime space lives
/// here.
#[derive(Debug, Clone, Default)]
pub struct InjectionLedger {
    by_relative_path: HashMap<PathBuf, Vec<u32>>,
}

impl InjectionLedger {
    pub fn lines_for(&self, relative: &Path) -> &[u32] {
        self.by_relative_path
            .get(relative)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn record(&mut self, relative: PathBuf, mut lines: Vec<u32>) {
        lines.sort_unstable();
        self.by_relative_path.insert(relative, lines);
    }

    /// Undoes injection shifts: the i-th injected statement (0-based,
    /// ascending) sits at runtime line `src_i + i`, so a runtime line is
    /// shifted by the number of injected statements strictly above it.
    /// Counting strictly above also makes an injected statement's own
    /// line map back to the breakpoint's source line.
    pub fn source_line_for_runtime(&self, relative: &Path, runtime_line: u32) -> u32 {
        let above = self
            .lines_for(relative)
            .iter()
            .enumerate()
            .filter(|&(i, &src)| src + (i as u32) < runtime_line)
            .count() as u32;
        runtime_line.saturating_sub(above)
    }

    /// Forward direction: a source line is pushed down once per
    /// injection at or above it.
    pub fn runtime_line_for_source(&self, relative: &Path, source_line: u32) -> u32 {
        let below = self
            .lines_for(relative)
            .iter()
            .filter(|src| **src <= source_line)
            .count() as u32;
        source_line + below
    }

    /// Runtime line of the injected statement for a breakpoint at
    /// `source_line` (the statement lands above the original line, so
    /// only injections strictly above it shift it).
    pub fn stop_line_for_source(&self, relative: &Path, source_line: u32) -> u32 {
        let above = self
            .lines_for(relative)
            .iter()
            .filter(|src| **src < source_line)
            .count() as u32;
        source_line + above
    }
}

#[derive(Debug, Default)]
pub struct BreakpointManager {
    by_source_path: HashMap<PathBuf, Vec<Breakpoint>>,
    locked: bool,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the user-visible breakpoint set for one file. Hidden
    /// entries survive the replacement; a user breakpoint on the same
    /// (line, column) wins over a hidden one. The returned list is the
    /// full set for the file, deduplicated and sorted by (line, column)
    /// so identical submissions produce identical output.
    pub fn replace_breakpoints(
        &mut self,
        path: &Path,
        requested: Vec<BreakpointRequest>,
    ) -> Result<Vec<Breakpoint>> {
        if self.locked {
            return Err(DebugError::BreakpointsLocked);
        }
        let key = normalize_path(path);

        let mut next: Vec<Breakpoint> = requested
            .into_iter()
            .map(Breakpoint::from_request)
            .collect();
        if let Some(existing) = self.by_source_path.get(&key) {
            for hidden in existing.iter().filter(|bp| bp.hidden) {
                if !next
                    .iter()
                    .any(|bp| (bp.line, bp.column) == (hidden.line, hidden.column))
                {
                    next.push(hidden.clone());
                }
            }
        }

        next.sort_by_key(Breakpoint::sort_key);
        next.dedup_by_key(|bp| bp.sort_key());

        self.by_source_path.insert(key, next.clone());
        Ok(next)
    }

    /// Registers an adapter-owned stop (the entry-point stop). Returns
    /// whether a hidden entry was actually added; when the user already
    /// has a breakpoint on that line nothing is inserted and the stop
    /// stays user-owned.
    pub fn add_hidden_breakpoint(&mut self, path: &Path, line: u32) -> Result<bool> {
        if self.locked {
            return Err(DebugError::BreakpointsLocked);
        }
        let key = normalize_path(path);
        let set = self.by_source_path.entry(key).or_default();
        if set.iter().any(|bp| bp.line == line) {
            return Ok(false);
        }
        set.push(Breakpoint {
            line,
            column: None,
            enabled: true,
            condition: None,
            hit_count: None,
            log_message: None,
            hidden: true,
        });
        set.sort_by_key(Breakpoint::sort_key);
        Ok(true)
    }

    pub fn breakpoints_for(&self, path: &Path) -> Vec<Breakpoint> {
        self.by_source_path
            .get(&normalize_path(path))
            .cloned()
            .unwrap_or_default()
    }

    /// Freezes the set for the duration of staging and injection. Any
    /// `replace_breakpoints` after this fails instead of racing the
    /// writer.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Rewrites every staged file of `project` that owns enabled
    /// breakpoints, inserting one statement line per breakpoint. Must
    /// run exactly once per freshly staged copy.
    pub fn write_breakpoints_for_project(&self, project: &Project) -> Result<InjectionLedger> {
        let mut ledger = InjectionLedger::default();

        for (source_path, breakpoints) in &self.by_source_path {
            let Some(staged) = project.staged_for_source(source_path) else {
                continue;
            };
            let enabled: Vec<&Breakpoint> =
                breakpoints.iter().filter(|bp| bp.enabled).collect();
            if enabled.is_empty() {
                continue;
            }

            let contents = std::fs::read_to_string(&staged.staged_path)?;
            let mut lines: Vec<String> = contents.lines().map(str::to_string).collect();
            let line_count = lines.len() as u32;

            // One statement per distinct line; the first breakpoint (by
            // sort order) on a line decides the statement form.
            let mut per_line: Vec<&Breakpoint> = Vec::new();
            for &bp in &enabled {
                if bp.line == 0 || bp.line > line_count {
                    warn!(
                        path = %staged.relative_path.display(),
                        line = bp.line,
                        "breakpoint outside file, skipped"
                    );
                    continue;
                }
                if !per_line.iter().any(|seen| seen.line == bp.line) {
                    per_line.push(bp);
                }
            }
            if per_line.is_empty() {
                continue;
            }

            // Insert bottom-up so each earlier (higher) insertion leaves
            // the lower target lines unshifted.
            per_line.sort_by_key(|bp| std::cmp::Reverse(bp.line));
            for bp in &per_line {
                let key = hit_count_key(&staged.relative_path, bp.line);
                let statement = injected_statement(bp, &key);
                lines.insert((bp.line - 1) as usize, statement);
            }

            std::fs::write(&staged.staged_path, lines.join("\n") + "\n")?;

            let injected: Vec<u32> = per_line.iter().map(|bp| bp.line).collect();
            debug!(
                path = %staged.relative_path.display(),
                count = injected.len(),
                "injected breakpoint statements"
            );
            ledger.record(staged.relative_path.clone(), injected);
        }

        Ok(ledger)
    }
}

/// The statement for one breakpoint, always a single line. Condition
/// wraps hit count wraps the action.
fn injected_statement(bp: &Breakpoint, hit_key: &str) -> String {
    let action = match &bp.log_message {
        Some(message) => logpoint_statement(message),
        None => "STOP".to_string(),
    };
    let action = match bp.hit_count {
        Some(n) if n > 1 => hit_count_chain(hit_key, n, &action),
        _ => action,
    };
    match &bp.condition {
        Some(condition) => format!("if {condition} then : {action} : end if"),
        None => action,
    }
}

/// Counts hits in an associative array on `m` and fires the action from
/// the Nth hit onward. Each `if` is closed with `end if` so the
/// colon-joined statements stay independent on one line.
fn hit_count_chain(key: &str, n: u32, action: &str) -> String {
    format!(
        "if m.__rdbHits = invalid then : m.__rdbHits = {{}} : end if : \
         if m.__rdbHits[\"{key}\"] = invalid then : m.__rdbHits[\"{key}\"] = 0 : end if : \
         m.__rdbHits[\"{key}\"] = m.__rdbHits[\"{key}\"] + 1 : \
         if m.__rdbHits[\"{key}\"] >= {n} then : {action} : end if"
    )
}

fn hit_count_key(relative: &Path, line: u32) -> String {
    let mut key: String = relative
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    key.push('_');
    key.push_str(&line.to_string());
    key
}

/// Builds the print statement for a logpoint. `{expr}` interpolates the
/// expression; literal text becomes string items. BrightScript strings
/// have no escape syntax, so embedded quotes are spliced via `chr(34)`.
fn logpoint_statement(message: &str) -> String {
    let mut items: Vec<String> = vec![format!("\"{LOGPOINT_PREFIX} \"")];
    let mut literal = String::new();
    let mut rest = message;

    while let Some(open) = rest.find('{') {
        match rest[open..].find('}') {
            Some(close_offset) => {
                literal.push_str(&rest[..open]);
                flush_literal(&mut items, &mut literal);
                let expr = rest[open + 1..open + close_offset].trim();
                if !expr.is_empty() {
                    items.push(expr.to_string());
                }
                rest = &rest[open + close_offset + 1..];
            }
            None => break,
        }
    }
    literal.push_str(rest);
    flush_literal(&mut items, &mut literal);

    format!("print {}", items.join("; "))
}

fn flush_literal(items: &mut Vec<String>, literal: &mut String) {
    if literal.is_empty() {
        return;
    }
    for (i, segment) in literal.split('"').enumerate() {
        if i > 0 {
            items.push("chr(34)".to_string());
        }
        if !segment.is_empty() {
            items.push(format!("\"{segment}\""));
        }
    }
    literal.clear();
}

/// Finds the 1-based line of the app entry point in a BrightScript
/// file, used to place the adapter's hidden entry stop.
pub fn find_entry_line(text: &str) -> Option<u32> {
    for (i, raw) in text.lines().enumerate() {
        let line = raw.trim().to_ascii_lowercase();
        let is_entry = ["sub main", "function main", "sub runuserinterface", "function runuserinterface"]
            .iter()
            .any(|prefix| {
                line.strip_prefix(prefix)
                    .is_some_and(|tail| tail.trim_start().starts_with('('))
            });
        if is_entry {
            // Stop on the first statement inside, not the signature.
            return Some(i as u32 + 2);
        }
    }
    None
}
