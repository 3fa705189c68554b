//! Translation between runtime and source coordinates.
//!
//! The device reports positions in its own terms: `pkg:/`-relative
//! paths, sometimes truncated from the left to fit a length limit,
//! component-library files tagged with a `__lib<N>` postfix, and line
//! numbers that count the staged file after breakpoint injection. This
//! module is the only place those are mapped back to the files and
//! lines the user edits, and the only place the inverse runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;
use walkdir::WalkDir;

use crate::breakpoints::InjectionLedger;
use crate::events::{RuntimeLocation, SourcePosition};
use crate::project::Project;
use crate::source_maps::SourceMap;

/// Device paths over the length limit arrive truncated from the left,
/// prefixed with this marker.
pub const TRUNCATION_MARKER: &str = "...";

/// Postfix token the device appends to component-library file names,
/// immediately before the extension: `main__lib2.brs`.
pub const LIBRARY_POSTFIX: &str = "__lib";

fn library_postfix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<stem>.+)__lib(?P<index>\d+)(?P<ext>\.[^.\\/]+)$")
            .expect("hardcoded regex should compile")
    })
}

/// Splits the library postfix off a runtime path. Returns the path with
/// the postfix removed and the library index, or the input unchanged
/// when the file name carries no well-formed postfix (`main__lib.brs`
/// has no digits, `main__notlib1.brs` has the wrong token).
pub fn strip_library_postfix(path: &str) -> (String, Option<u32>) {
    let (dir, file) = match path.rfind('/') {
        Some(i) => (&path[..i + 1], &path[i + 1..]),
        None => ("", path),
    };
    let Some(caps) = library_postfix_re().captures(file) else {
        return (path.to_string(), None);
    };
    let index = caps["index"].parse::<u32>().ok();
    match index {
        Some(index) => (
            format!("{dir}{}{}", &caps["stem"], &caps["ext"]),
            Some(index),
        ),
        None => (path.to_string(), None),
    }
}

/// Strips the `pkg:/` scheme and any leading slashes, leaving a
/// package-relative path.
pub fn package_relative(path: &str) -> &str {
    let path = path.trim();
    let path = path.strip_prefix("pkg:").unwrap_or(path);
    path.trim_start_matches('/')
}

/// Outcome of a runtime-to-source lookup. `source` is `None` when no
/// candidate file exists; warnings carry non-fatal oddities such as an
/// ambiguous truncated-path match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub source: Option<SourcePosition>,
    pub warnings: Vec<String>,
}

#[derive(Debug)]
struct ProjectIndex {
    search_roots: Vec<PathBuf>,
    out_dir: PathBuf,
    staging_dir: Option<PathBuf>,
    ledger: InjectionLedger,
}

impl ProjectIndex {
    fn new(project: &Project, ledger: InjectionLedger) -> Self {
        Self {
            search_roots: project
                .search_roots()
                .into_iter()
                .map(Path::to_path_buf)
                .collect(),
            out_dir: project.out_dir().to_path_buf(),
            staging_dir: project.staging_dir().map(Path::to_path_buf),
            ledger,
        }
    }

    /// First existing file for a full package-relative path, in search
    /// root order.
    fn find_exact(&self, relative: &Path) -> Option<PathBuf> {
        self.search_roots
            .iter()
            .map(|root| root.join(relative))
            .find(|candidate| candidate.is_file())
    }

    /// All files whose path ends with `suffix`, in search-root order
    /// and sorted within each root, so repeated queries agree.
    fn find_by_suffix(&self, suffix: &str) -> Vec<(PathBuf, PathBuf)> {
        let needle = suffix.replace('\\', "/").to_ascii_lowercase();
        let mut matches = Vec::new();
        for root in &self.search_roots {
            for entry in WalkDir::new(root)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                // The out dir usually nests inside the root; a live
                // session always has a staged copy of every file there,
                // which must never shadow the user's source.
                if entry.path().starts_with(&self.out_dir) {
                    continue;
                }
                let haystack = entry
                    .path()
                    .to_string_lossy()
                    .replace('\\', "/")
                    .to_ascii_lowercase();
                if haystack.ends_with(&needle) {
                    let relative = entry
                        .path()
                        .strip_prefix(root)
                        .unwrap_or(entry.path())
                        .to_path_buf();
                    matches.push((entry.path().to_path_buf(), relative));
                }
            }
        }
        matches
    }
}

/// Immutable per-session view over the main project and its component
/// libraries, built once staging and injection are done.
#[derive(Debug)]
pub struct LocationResolver {
    main: ProjectIndex,
    libraries: HashMap<u32, ProjectIndex>,
    enable_source_maps: bool,
}

impl LocationResolver {
    pub fn new(main: &Project, ledger: InjectionLedger, enable_source_maps: bool) -> Self {
        Self {
            main: ProjectIndex::new(main, ledger),
            libraries: HashMap::new(),
            enable_source_maps,
        }
    }

    pub fn add_library(&mut self, project: &Project, ledger: InjectionLedger) {
        if let Some(index) = project.library_index() {
            self.libraries
                .insert(index, ProjectIndex::new(project, ledger));
        }
    }

    /// Maps a device-reported position to the user's source. Never
    /// fails hard: an unresolvable path yields `source: None` plus a
    /// warning, and an ambiguous truncated path picks the first match
    /// by search order with exactly one warning.
    pub fn resolve_runtime(&self, location: &RuntimeLocation) -> Resolution {
        let mut resolution = Resolution::default();

        let relative = package_relative(&location.path);
        let (clean, library_index) = strip_library_postfix(relative);

        let index = match library_index {
            Some(n) => match self.libraries.get(&n) {
                Some(index) => index,
                None => {
                    resolution
                        .warnings
                        .push(format!("no component library with index {n} for {relative}"));
                    return resolution;
                }
            },
            None => &self.main,
        };

        let (source_path, ledger_key) = match clean.strip_prefix(TRUNCATION_MARKER) {
            Some(suffix) => {
                let matches = index.find_by_suffix(suffix);
                let count = matches.len();
                match matches.into_iter().next() {
                    None => {
                        resolution
                            .warnings
                            .push(format!("no file matching truncated path {clean}"));
                        return resolution;
                    }
                    Some((path, rel)) => {
                        if count > 1 {
                            let message = format!(
                                "truncated path {clean} matched {count} files; using {}",
                                path.display()
                            );
                            warn!("{message}");
                            resolution.warnings.push(message);
                        }
                        (path, rel)
                    }
                }
            }
            None => {
                let rel = PathBuf::from(&clean);
                match index.find_exact(&rel) {
                    Some(path) => (path, rel),
                    None => {
                        resolution
                            .warnings
                            .push(format!("no file for runtime path {relative}"));
                        return resolution;
                    }
                }
            }
        };

        let staged_line = index
            .ledger
            .source_line_for_runtime(&ledger_key, location.line);
        let (source_path, source_line) =
            self.apply_source_map(index, &ledger_key, source_path, staged_line);

        resolution.source = Some(SourcePosition {
            path: source_path,
            line: source_line,
        });
        resolution
    }

    /// Inverse mapping, for telling the device about a source position.
    pub fn to_runtime(&self, source: &SourcePosition) -> Option<RuntimeLocation> {
        let (library_index, index) = self
            .index_owning(&source.path)
            .unwrap_or((None, &self.main));
        let relative = index
            .search_roots
            .iter()
            .find_map(|root| source.path.strip_prefix(root).ok())?;

        let staged_line = match self.staged_map(index, relative) {
            Some(map) => map.to_generated_line(source.line),
            None => source.line,
        };
        let runtime_line = index.ledger.runtime_line_for_source(relative, staged_line);

        let rel_text = relative.to_string_lossy().replace('\\', "/");
        let path = match library_index {
            Some(n) => {
                let (dir, file) = match rel_text.rfind('/') {
                    Some(i) => (&rel_text[..i + 1], &rel_text[i + 1..]),
                    None => ("", rel_text.as_str()),
                };
                let (stem, ext) = match file.rfind('.') {
                    Some(i) => (&file[..i], &file[i..]),
                    None => (file, ""),
                };
                format!("pkg:/{dir}{stem}{LIBRARY_POSTFIX}{n}{ext}")
            }
            None => format!("pkg:/{rel_text}"),
        };

        Some(RuntimeLocation {
            path,
            line: runtime_line,
        })
    }

    fn index_owning(&self, source_path: &Path) -> Option<(Option<u32>, &ProjectIndex)> {
        for (n, index) in &self.libraries {
            if index
                .search_roots
                .iter()
                .any(|root| source_path.starts_with(root))
            {
                return Some((Some(*n), index));
            }
        }
        if self
            .main
            .search_roots
            .iter()
            .any(|root| source_path.starts_with(root))
        {
            return Some((None, &self.main));
        }
        None
    }

    fn staged_map(&self, index: &ProjectIndex, relative: &Path) -> Option<SourceMap> {
        if !self.enable_source_maps {
            return None;
        }
        let staged = index.staging_dir.as_ref()?.join(relative);
        SourceMap::load_for(&staged).ok().flatten()
    }

    fn apply_source_map(
        &self,
        index: &ProjectIndex,
        ledger_key: &Path,
        source_path: PathBuf,
        staged_line: u32,
    ) -> (PathBuf, u32) {
        match self.staged_map(index, ledger_key) {
            Some(map) => {
                let line = map.to_source_line(staged_line);
                let path = match &map.source_path {
                    Some(override_path) => index
                        .search_roots
                        .last()
                        .map(|root| root.join(override_path))
                        .unwrap_or(source_path),
                    None => source_path,
                };
                (path, line)
            }
            None => (source_path, staged_line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoints::{BreakpointManager, BreakpointRequest};

    #[test]
    fn test_strip_library_postfix() {
        assert_eq!(
            strip_library_postfix("pkg:/source/main__lib2.brs"),
            ("pkg:/source/main.brs".to_string(), Some(2))
        );
        assert_eq!(
            strip_library_postfix("main__lib12.brs"),
            ("main.brs".to_string(), Some(12))
        );
        // No digits after the token: not a library postfix.
        assert_eq!(
            strip_library_postfix("main__lib.brs"),
            ("main__lib.brs".to_string(), None)
        );
        // Wrong token.
        assert_eq!(
            strip_library_postfix("main__notlib1.brs"),
            ("main__notlib1.brs".to_string(), None)
        );
    }

    #[test]
    fn test_package_relative() {
        assert_eq!(package_relative("pkg:/source/main.brs"), "source/main.brs");
        assert_eq!(package_relative("source/main.brs"), "source/main.brs");
        assert_eq!(package_relative("  pkg:/a.brs"), "a.brs");
    }

    fn project_with(files: &[(&str, &str)]) -> (tempfile::TempDir, Project) {
        let dir = tempfile::tempdir().unwrap();
        for (rel, contents) in files {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }
        let project = Project::new(dir.path()).unwrap();
        (dir, project)
    }

    #[test]
    fn test_exact_resolution() {
        let (dir, project) = project_with(&[("source/main.brs", "sub main()\nend sub\n")]);
        let resolver = LocationResolver::new(&project, InjectionLedger::default(), false);

        let resolution = resolver.resolve_runtime(&RuntimeLocation {
            path: "pkg:/source/main.brs".to_string(),
            line: 2,
        });
        let source = resolution.source.expect("resolved");
        assert_eq!(source.path, dir.path().canonicalize().unwrap().join("source/main.brs"));
        assert_eq!(source.line, 2);
        assert!(resolution.warnings.is_empty());
    }

    #[test]
    fn test_unknown_path_warns_without_failing() {
        let (_dir, project) = project_with(&[("source/main.brs", "sub main()\nend sub\n")]);
        let resolver = LocationResolver::new(&project, InjectionLedger::default(), false);

        let resolution = resolver.resolve_runtime(&RuntimeLocation {
            path: "pkg:/source/missing.brs".to_string(),
            line: 1,
        });
        assert!(resolution.source.is_none());
        assert_eq!(resolution.warnings.len(), 1);
    }

    #[test]
    fn test_ambiguous_truncated_path_picks_first_with_one_warning() {
        let (dir, project) = project_with(&[
            ("source/lib1/lib.brs", "sub a()\nend sub\n"),
            ("source/lib2/lib.brs", "sub b()\nend sub\n"),
        ]);
        let resolver = LocationResolver::new(&project, InjectionLedger::default(), false);

        let resolution = resolver.resolve_runtime(&RuntimeLocation {
            path: "...lib.brs".to_string(),
            line: 1,
        });
        let source = resolution.source.expect("resolved");
        assert_eq!(
            source.path,
            dir.path().canonicalize().unwrap().join("source/lib1/lib.brs")
        );
        assert_eq!(resolution.warnings.len(), 1);
    }

    #[test]
    fn test_truncated_path_unique_match_has_no_warning() {
        let (dir, project) = project_with(&[
            ("source/screens/details.brs", "sub show()\nend sub\n"),
            ("source/main.brs", "sub main()\nend sub\n"),
        ]);
        let resolver = LocationResolver::new(&project, InjectionLedger::default(), false);

        let resolution = resolver.resolve_runtime(&RuntimeLocation {
            path: "...eens/details.brs".to_string(),
            line: 1,
        });
        let source = resolution.source.expect("resolved");
        assert_eq!(
            source.path,
            dir.path()
                .canonicalize()
                .unwrap()
                .join("source/screens/details.brs")
        );
        assert!(resolution.warnings.is_empty());
    }

    #[test]
    fn test_truncated_path_ignores_staged_copy() {
        let (dir, mut project) = project_with(&[
            ("source/screens/details.brs", "sub show()\nend sub\n"),
            ("source/main.brs", "sub main()\nend sub\n"),
        ]);
        // A live session always has a staged copy under out/; the suffix
        // walk must not match it.
        project.stage().unwrap();
        let resolver = LocationResolver::new(&project, InjectionLedger::default(), false);

        let resolution = resolver.resolve_runtime(&RuntimeLocation {
            path: "...eens/details.brs".to_string(),
            line: 1,
        });
        let source = resolution.source.expect("resolved");
        assert_eq!(
            source.path,
            dir.path()
                .canonicalize()
                .unwrap()
                .join("source/screens/details.brs")
        );
        assert!(resolution.warnings.is_empty());
    }

    #[test]
    fn test_injection_shift_is_undone() {
        let (dir, mut project) = project_with(&[(
            "source/main.brs",
            &(1..=10)
                .map(|i| format!("print {i}"))
                .collect::<Vec<_>>()
                .join("\n"),
        )]);
        project.stage().unwrap();

        let mut manager = BreakpointManager::new();
        manager
            .replace_breakpoints(
                &dir.path().join("source/main.brs"),
                vec![
                    BreakpointRequest {
                        line: 3,
                        column: None,
                        condition: None,
                        hit_count: None,
                        log_message: None,
                    },
                    BreakpointRequest {
                        line: 7,
                        column: None,
                        condition: None,
                        hit_count: None,
                        log_message: None,
                    },
                ],
            )
            .unwrap();
        manager.lock();
        let ledger = manager.write_breakpoints_for_project(&project).unwrap();
        let resolver = LocationResolver::new(&project, ledger, false);

        let resolution = resolver.resolve_runtime(&RuntimeLocation {
            path: "pkg:/source/main.brs".to_string(),
            line: 9,
        });
        assert_eq!(resolution.source.expect("resolved").line, 7);
    }

    #[test]
    fn test_library_postfix_routes_to_library_project() {
        let (main_dir, main) = project_with(&[("source/main.brs", "sub main()\nend sub\n")]);
        let (lib_dir, lib) = project_with(&[("source/widgets.brs", "sub w()\nend sub\n")]);
        let lib = lib.as_component_library(2);
        drop(main_dir);

        let mut resolver = LocationResolver::new(&main, InjectionLedger::default(), false);
        resolver.add_library(&lib, InjectionLedger::default());

        let resolution = resolver.resolve_runtime(&RuntimeLocation {
            path: "pkg:/source/widgets__lib2.brs".to_string(),
            line: 1,
        });
        assert_eq!(
            resolution.source.expect("resolved").path,
            lib_dir.path().canonicalize().unwrap().join("source/widgets.brs")
        );

        // Unknown library index: warning, no match.
        let resolution = resolver.resolve_runtime(&RuntimeLocation {
            path: "pkg:/source/widgets__lib9.brs".to_string(),
            line: 1,
        });
        assert!(resolution.source.is_none());
        assert_eq!(resolution.warnings.len(), 1);
    }

    #[test]
    fn test_to_runtime_is_inverse() {
        let (dir, mut project) = project_with(&[(
            "source/main.brs",
            &(1..=10)
                .map(|i| format!("print {i}"))
                .collect::<Vec<_>>()
                .join("\n"),
        )]);
        project.stage().unwrap();

        let mut manager = BreakpointManager::new();
        manager
            .replace_breakpoints(
                &dir.path().join("source/main.brs"),
                vec![
                    BreakpointRequest {
                        line: 3,
                        column: None,
                        condition: None,
                        hit_count: None,
                        log_message: None,
                    },
                    BreakpointRequest {
                        line: 7,
                        column: None,
                        condition: None,
                        hit_count: None,
                        log_message: None,
                    },
                ],
            )
            .unwrap();
        manager.lock();
        let ledger = manager.write_breakpoints_for_project(&project).unwrap();
        let resolver = LocationResolver::new(&project, ledger, false);

        let runtime = resolver
            .to_runtime(&SourcePosition {
                path: dir.path().canonicalize().unwrap().join("source/main.brs"),
                line: 7,
            })
            .expect("mapped");
        assert_eq!(runtime.path, "pkg:/source/main.brs");
        assert_eq!(runtime.line, 9);
    }

    #[test]
    fn test_to_runtime_restores_library_postfix() {
        let (lib_dir, lib) = project_with(&[("source/widgets.brs", "sub w()\nend sub\n")]);
        let lib = lib.as_component_library(3);
        let (_main_dir, main) = project_with(&[("source/main.brs", "sub main()\nend sub\n")]);

        let mut resolver = LocationResolver::new(&main, InjectionLedger::default(), false);
        resolver.add_library(&lib, InjectionLedger::default());

        let runtime = resolver
            .to_runtime(&SourcePosition {
                path: lib_dir.path().canonicalize().unwrap().join("source/widgets.brs"),
                line: 1,
            })
            .expect("mapped");
        assert_eq!(runtime.path, "pkg:/source/widgets__lib3.brs");
    }
}
