// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading and merging.
//!
//! The pipeline reads its settings from the `resource` key of a JSON
//! configuration file and layers command-line overrides on top. Paths in
//! the file are resolved against the file's own directory, so a config
//! can travel with the project it describes.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Errors during configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Requested path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON.
    #[error("failed to parse config: {reason}")]
    Parse {
        /// Parse error detail.
        reason: String,
    },
}

/// A config value that is either one string or an array of strings;
/// single strings may pack several entries separated by `;` or `,`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn entries(&self) -> Vec<String> {
        match self {
            Self::One(s) => s
                .split([';', ','])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            Self::Many(list) => list.clone(),
        }
    }
}

/// Raw shape of the `resource` key.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawResourceConfig {
    local_path: Option<StringOrList>,
    source_path: Option<String>,
    base_path: Option<String>,
    autoimport_path: Option<StringOrList>,
    tool_path: Option<StringOrList>,
    remote_sourced: Option<String>,
    remote_compiled: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    resource: RawResourceConfig,
}

/// Resolved resource-pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceConfig {
    /// Local compiled-artifact cache roots, searched in order.
    pub local_paths: Vec<PathBuf>,
    /// Root of the source change-log tree.
    pub source_path: Option<PathBuf>,
    /// Base path imports are resolved against.
    pub base_path: Option<PathBuf>,
    /// Directories watched for automatic re-import.
    pub autoimport_paths: Vec<PathBuf>,
    /// Directories searched for external `*import` / `*compile` tools.
    pub tool_paths: Vec<PathBuf>,
    /// Sourced service endpoint (`host:port`).
    pub remote_sourced: Option<String>,
    /// Compiled service endpoint (`host:port`).
    pub remote_compiled: Option<String>,
}

impl ResourceConfig {
    /// Load from a JSON file, resolving relative paths against the file's
    /// directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_json(&text, base)
    }

    /// Parse from JSON text, resolving relative paths against `base`.
    pub fn from_json(text: &str, base: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(text).map_err(|err| ConfigError::Parse {
            reason: err.to_string(),
        })?;
        let r = raw.resource;
        Ok(Self {
            local_paths: list_paths(r.local_path.as_ref(), base),
            source_path: r.source_path.as_deref().map(|p| absolutize(p, base)),
            base_path: r.base_path.as_deref().map(|p| absolutize(p, base)),
            autoimport_paths: list_paths(r.autoimport_path.as_ref(), base),
            tool_paths: list_paths(r.tool_path.as_ref(), base),
            remote_sourced: r.remote_sourced,
            remote_compiled: r.remote_compiled,
        })
    }

    /// Merge command-line overrides on top of this config. Path-valued
    /// overrides are resolved against the current working directory by
    /// the caller; list-valued overrides append.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        for p in &overrides.local_paths {
            self.local_paths.push(p.clone());
        }
        if let Some(p) = &overrides.source_path {
            self.source_path = Some(p.clone());
        }
        if let Some(p) = &overrides.base_path {
            self.base_path = Some(p.clone());
        }
        for p in &overrides.autoimport_paths {
            self.autoimport_paths.push(p.clone());
        }
        for p in &overrides.tool_paths {
            self.tool_paths.push(p.clone());
        }
        if let Some(r) = &overrides.remote_sourced {
            self.remote_sourced = Some(r.clone());
        }
        if let Some(r) = &overrides.remote_compiled {
            self.remote_compiled = Some(r.clone());
        }
    }
}

/// Values collected from `--resource-*` command-line flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    /// `--resource-local-path`, repeatable.
    pub local_paths: Vec<PathBuf>,
    /// `--resource-source-path`.
    pub source_path: Option<PathBuf>,
    /// `--resource-base-path`.
    pub base_path: Option<PathBuf>,
    /// `--resource-autoimport-path`, repeatable.
    pub autoimport_paths: Vec<PathBuf>,
    /// `--resource-tool-path`, repeatable.
    pub tool_paths: Vec<PathBuf>,
    /// `--resource-remote-sourced`.
    pub remote_sourced: Option<String>,
    /// `--resource-remote-compiled`.
    pub remote_compiled: Option<String>,
}

fn absolutize(path: &str, base: &Path) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

fn list_paths(value: Option<&StringOrList>, base: &Path) -> Vec<PathBuf> {
    value
        .map(|v| v.entries().iter().map(|p| absolutize(p, base)).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_keys() {
        let json = r#"{
            "resource": {
                "local_path": "cache;shared/cache",
                "source_path": "sources",
                "base_path": "/assets",
                "autoimport_path": ["art", "/mnt/drops"],
                "tool_path": "tools",
                "remote_sourced": "build-host:7780",
                "remote_compiled": "build-host:7781"
            }
        }"#;
        let config = ResourceConfig::from_json(json, Path::new("/project")).unwrap();
        assert_eq!(
            config.local_paths,
            vec![PathBuf::from("/project/cache"), PathBuf::from("/project/shared/cache")]
        );
        assert_eq!(config.source_path, Some(PathBuf::from("/project/sources")));
        assert_eq!(config.base_path, Some(PathBuf::from("/assets")));
        assert_eq!(
            config.autoimport_paths,
            vec![PathBuf::from("/project/art"), PathBuf::from("/mnt/drops")]
        );
        assert_eq!(config.remote_sourced.as_deref(), Some("build-host:7780"));
        assert_eq!(config.remote_compiled.as_deref(), Some("build-host:7781"));
    }

    #[test]
    fn missing_resource_key_is_empty_config() {
        let config = ResourceConfig::from_json("{}", Path::new("/")).unwrap();
        assert_eq!(config, ResourceConfig::default());
    }

    #[test]
    fn comma_separated_lists_split() {
        let json = r#"{"resource": {"tool_path": "a, b ,c"}}"#;
        let config = ResourceConfig::from_json(json, Path::new("/x")).unwrap();
        assert_eq!(
            config.tool_paths,
            vec![PathBuf::from("/x/a"), PathBuf::from("/x/b"), PathBuf::from("/x/c")]
        );
    }

    #[test]
    fn invalid_json_is_parse_error() {
        let err = ResourceConfig::from_json("{", Path::new("/")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn overrides_append_and_replace() {
        let json = r#"{"resource": {"local_path": "cache", "remote_sourced": "old:1"}}"#;
        let mut config = ResourceConfig::from_json(json, Path::new("/p")).unwrap();
        config.apply_overrides(&ConfigOverrides {
            local_paths: vec![PathBuf::from("/extra")],
            remote_sourced: Some("new:2".into()),
            ..ConfigOverrides::default()
        });
        assert_eq!(
            config.local_paths,
            vec![PathBuf::from("/p/cache"), PathBuf::from("/extra")]
        );
        assert_eq!(config.remote_sourced.as_deref(), Some("new:2"));
    }

    #[test]
    fn load_reads_file_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pipeline.json");
        std::fs::write(&file, r#"{"resource": {"source_path": "src"}}"#).unwrap();
        let config = ResourceConfig::load(&file).unwrap();
        assert_eq!(config.source_path, Some(dir.path().join("src")));
    }
}
