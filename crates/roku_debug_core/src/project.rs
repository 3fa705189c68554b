//! Project roots and the per-session staging copy.
//!
//! A session debugs exactly one main project plus any number of
//! component-library projects. Each owns its own staging directory, a
//! fresh copy of the selected files that breakpoint injection is free to
//! rewrite without touching what the user edits.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{DebugError, Result};
use crate::locations::LIBRARY_POSTFIX;

/// One file carried into the staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// Absolute path of the original file.
    pub source_path: PathBuf,
    /// Absolute path of the writable copy. Component-library scripts
    /// carry the `__lib<N>` tag in this name.
    pub staged_path: PathBuf,
    /// Path relative to the project root, always in source space: the
    /// library rename never shows up here.
    pub relative_path: PathBuf,
}

#[derive(Debug)]
pub struct Project {
    root_dir: PathBuf,
    out_dir: PathBuf,
    file_patterns: Vec<String>,
    source_dirs: Vec<PathBuf>,
    library_index: Option<u32>,
    staging_dir: Option<PathBuf>,
    staged_files: Vec<StagedFile>,
}

impl Project {
    pub fn new(root_dir: impl Into<PathBuf>) -> Result<Self> {
        let root_dir: PathBuf = root_dir.into();
        let root_dir = root_dir
            .canonicalize()
            .map_err(|e| DebugError::invalid_path(&root_dir, e.to_string()))?;
        if !root_dir.is_dir() {
            return Err(DebugError::invalid_path(&root_dir, "not a directory"));
        }
        let out_dir = root_dir.join("out");
        Ok(Self {
            root_dir,
            out_dir,
            file_patterns: vec!["**/*".to_string()],
            source_dirs: Vec::new(),
            library_index: None,
            staging_dir: None,
            staged_files: Vec::new(),
        })
    }

    /// Replaces the default catch-all selection with explicit globs,
    /// relative to the root.
    pub fn with_files(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.file_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_out_dir(mut self, out_dir: impl Into<PathBuf>) -> Self {
        self.out_dir = out_dir.into();
        self
    }

    /// Alternate directories the original sources live in, searched in
    /// the given order before falling back to the root.
    pub fn with_source_dirs(
        mut self,
        dirs: impl IntoIterator<Item = impl Into<PathBuf>>,
    ) -> Self {
        self.source_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    /// Marks this project as component library `index`. The device
    /// reports this library's files with a `__lib<index>` name tag, so
    /// staging renames its scripts to match.
    pub fn as_component_library(mut self, index: u32) -> Self {
        self.library_index = Some(index);
        self
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn library_index(&self) -> Option<u32> {
        self.library_index
    }

    /// Roots to search when resolving a truncated runtime path, in
    /// resolution order.
    pub fn search_roots(&self) -> Vec<&Path> {
        let mut roots: Vec<&Path> = self.source_dirs.iter().map(PathBuf::as_path).collect();
        roots.push(&self.root_dir);
        roots
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn staging_dir(&self) -> Option<&Path> {
        self.staging_dir.as_deref()
    }

    pub fn staged_files(&self) -> &[StagedFile] {
        &self.staged_files
    }

    pub fn is_staged(&self) -> bool {
        self.staging_dir.is_some()
    }

    /// Copies the selected files into a fresh staging directory under
    /// the out dir, replacing any leftover from a previous session.
    pub fn stage(&mut self) -> Result<PathBuf> {
        let staging_dir = match self.library_index {
            Some(index) => self.out_dir.join(format!("staging_lib{index}")),
            None => self.out_dir.join("staging"),
        };
        if staging_dir.exists() {
            std::fs::remove_dir_all(&staging_dir)?;
        }
        std::fs::create_dir_all(&staging_dir)?;

        let matcher = build_glob_set(&self.file_patterns)?;
        self.staged_files.clear();

        for entry in WalkDir::new(&self.root_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                DebugError::invalid_path(self.root_dir.clone(), e.to_string())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            // The out dir usually nests inside the root; never stage our
            // own output.
            if entry.path().starts_with(&self.out_dir) {
                continue;
            }
            let relative = match entry.path().strip_prefix(&self.root_dir) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            if !matcher.is_match(&relative) {
                continue;
            }

            let staged_path = staging_dir.join(self.staged_name(&relative));
            if let Some(parent) = staged_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &staged_path)?;
            self.staged_files.push(StagedFile {
                source_path: entry.path().to_path_buf(),
                staged_path,
                relative_path: relative,
            });
        }

        debug!(
            root = %self.root_dir.display(),
            files = self.staged_files.len(),
            "staged project"
        );
        self.staging_dir = Some(staging_dir.clone());
        Ok(staging_dir)
    }

    /// Name a file takes inside the staging directory. Scripts and
    /// component XML in a library pick up the `__lib<N>` tag the device
    /// will report them under; everything else keeps its name, which
    /// leaves `.map.json` sidecars addressable by their clean path.
    fn staged_name(&self, relative: &Path) -> PathBuf {
        let Some(index) = self.library_index else {
            return relative.to_path_buf();
        };
        let (Some(stem), Some(ext)) = (relative.file_stem(), relative.extension()) else {
            return relative.to_path_buf();
        };
        if !ext.eq_ignore_ascii_case("brs") && !ext.eq_ignore_ascii_case("xml") {
            return relative.to_path_buf();
        }
        let mut name = stem.to_os_string();
        name.push(format!("{LIBRARY_POSTFIX}{index}."));
        name.push(ext);
        relative.with_file_name(name)
    }

    pub fn staged_for_source(&self, source_path: &Path) -> Option<&StagedFile> {
        let normalized = normalize_path(source_path);
        self.staged_files
            .iter()
            .find(|f| f.source_path == normalized)
    }

    pub fn staged_for_relative(&self, relative: &Path) -> Option<&StagedFile> {
        self.staged_files.iter().find(|f| f.relative_path == relative)
    }

    /// Deletes the staging directory unless `retain` asks to keep it for
    /// post-mortem inspection.
    pub fn cleanup(&mut self, retain: bool) -> Result<()> {
        if let Some(staging_dir) = self.staging_dir.take() {
            self.staged_files.clear();
            if retain {
                debug!(dir = %staging_dir.display(), "retaining staging dir");
            } else if staging_dir.exists() {
                std::fs::remove_dir_all(&staging_dir)?;
            }
        }
        Ok(())
    }
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Canonicalizes when the file exists, otherwise returns the path
/// unchanged. Breakpoints are keyed by this form.
pub fn normalize_path(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("source")).unwrap();
        std::fs::create_dir_all(dir.path().join("components")).unwrap();
        std::fs::write(dir.path().join("manifest"), "title=Demo\n").unwrap();
        std::fs::write(
            dir.path().join("source/main.brs"),
            "sub main()\n  print \"hi\"\nend sub\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("components/scene.xml"),
            "<component name=\"Scene\"/>\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "scratch\n").unwrap();
        dir
    }

    #[test]
    fn test_stage_copies_selected_files() {
        let dir = fixture_tree();
        let mut project = Project::new(dir.path())
            .unwrap()
            .with_files(["manifest", "source/**/*", "components/**/*"]);

        project.stage().unwrap();
        let staging = project.staging_dir().unwrap().to_path_buf();

        assert!(staging.join("manifest").is_file());
        assert!(staging.join("source/main.brs").is_file());
        assert!(staging.join("components/scene.xml").is_file());
        assert!(!staging.join("notes.txt").exists());
        assert_eq!(project.staged_files().len(), 3);
    }

    #[test]
    fn test_stage_skips_out_dir() {
        let dir = fixture_tree();
        let mut project = Project::new(dir.path()).unwrap();
        project.stage().unwrap();
        // Stage again: the first pass left files under out/, which must
        // not be swept up by the catch-all pattern.
        project.stage().unwrap();
        assert!(project
            .staged_files()
            .iter()
            .all(|f| !f.relative_path.starts_with("out")));
    }

    #[test]
    fn test_staged_for_source_lookup() {
        let dir = fixture_tree();
        let mut project = Project::new(dir.path()).unwrap();
        project.stage().unwrap();

        let staged = project
            .staged_for_source(&dir.path().join("source/main.brs"))
            .expect("staged entry");
        assert_eq!(staged.relative_path, Path::new("source/main.brs"));
        assert!(staged.staged_path.is_file());

        assert!(project
            .staged_for_source(Path::new("/nonexistent/other.brs"))
            .is_none());
    }

    #[test]
    fn test_cleanup_removes_unless_retained() {
        let dir = fixture_tree();
        let mut project = Project::new(dir.path()).unwrap();
        project.stage().unwrap();
        let staging = project.staging_dir().unwrap().to_path_buf();
        project.cleanup(false).unwrap();
        assert!(!staging.exists());
        assert!(!project.is_staged());

        project.stage().unwrap();
        let staging = project.staging_dir().unwrap().to_path_buf();
        project.cleanup(true).unwrap();
        assert!(staging.exists());
    }

    #[test]
    fn test_component_library_staging_dir() {
        let dir = fixture_tree();
        let mut project = Project::new(dir.path()).unwrap().as_component_library(2);
        project.stage().unwrap();
        assert!(project
            .staging_dir()
            .unwrap()
            .to_string_lossy()
            .ends_with("staging_lib2"));
        assert_eq!(project.library_index(), Some(2));
    }

    #[test]
    fn test_library_staging_renames_scripts() {
        let dir = fixture_tree();
        let mut project = Project::new(dir.path())
            .unwrap()
            .with_files(["manifest", "source/**/*", "components/**/*"])
            .as_component_library(1);
        project.stage().unwrap();
        let staging = project.staging_dir().unwrap().to_path_buf();

        assert!(staging.join("source/main__lib1.brs").is_file());
        assert!(staging.join("components/scene__lib1.xml").is_file());
        assert!(!staging.join("source/main.brs").exists());
        // The manifest is not a script; it keeps its name.
        assert!(staging.join("manifest").is_file());

        // Lookups still key on the clean source-space path.
        let staged = project
            .staged_for_relative(Path::new("source/main.brs"))
            .expect("staged entry");
        assert!(staged
            .staged_path
            .to_string_lossy()
            .ends_with("main__lib1.brs"));
    }

    #[test]
    fn test_search_roots_order() {
        let dir = fixture_tree();
        let source_dir = dir.path().join("source");
        let project = Project::new(dir.path())
            .unwrap()
            .with_source_dirs([source_dir.clone()]);
        let roots = project.search_roots();
        assert_eq!(roots[0], source_dir.as_path());
        assert_eq!(roots[1], project.root_dir());
    }
}
