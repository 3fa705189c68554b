//! Optional on-disk line maps for preprocessed source.
//!
//! Builds that transpile or preprocess BrightScript can leave a JSON
//! sidecar next to each staged file (`foo.brs.map.json`) recording how
//! its lines relate to the original source. The map covers build-time
//! shifts only; breakpoint-injection shifts are applied separately by
//! the resolver, after this translation.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Result;

/// One segment anchor: staged line `generated_line` corresponds to
/// original line `source_line`, and the correspondence continues
/// line-for-line until the next anchor. Both sides are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineMapping {
    pub generated_line: u32,
    pub source_line: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMap {
    /// Overrides the source file the staged file was generated from,
    /// relative to the project root. Absent when the path is unchanged.
    #[serde(default)]
    pub source_path: Option<PathBuf>,
    #[serde(default)]
    mappings: Vec<LineMapping>,
}

impl SourceMap {
    /// Sidecar path for a staged file: `main.brs` -> `main.brs.map.json`.
    pub fn sidecar_for(staged_file: &Path) -> PathBuf {
        let mut name = staged_file.as_os_str().to_os_string();
        name.push(".map.json");
        PathBuf::from(name)
    }

    /// Loads the sidecar for `staged_file` if one exists.
    pub fn load_for(staged_file: &Path) -> Result<Option<Self>> {
        let sidecar = Self::sidecar_for(staged_file);
        if !sidecar.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&sidecar)?;
        let mut map: SourceMap = serde_json::from_str(&text)?;
        map.mappings.sort_by_key(|m| m.generated_line);
        Ok(Some(map))
    }

    /// Translates a staged line to its original line. Lines before the
    /// first anchor map through unchanged.
    pub fn to_source_line(&self, generated: u32) -> u32 {
        match self.anchor_for(generated, |m| m.generated_line) {
            Some(anchor) => anchor.source_line + (generated - anchor.generated_line),
            None => generated,
        }
    }

    /// Inverse of [`to_source_line`](Self::to_source_line).
    pub fn to_generated_line(&self, source: u32) -> u32 {
        let mut by_source = self.mappings.clone();
        by_source.sort_by_key(|m| m.source_line);
        let anchor = by_source
            .iter()
            .rev()
            .find(|m| m.source_line <= source)
            .copied();
        match anchor {
            Some(anchor) => anchor.generated_line + (source - anchor.source_line),
            None => source,
        }
    }

    fn anchor_for(&self, line: u32, key: impl Fn(&LineMapping) -> u32) -> Option<LineMapping> {
        self.mappings.iter().rev().find(|m| key(m) <= line).copied()
    }
}
