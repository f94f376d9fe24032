// SPDX-License-Identifier: MIT OR Apache-2.0
//! External import/compile tool discovery and invocation.
//!
//! Anything the in-process tables decline can still be handled by a
//! stand-alone executable dropped into a tool directory: names ending in
//! `import`/`compile` (plus `.exe` on Windows) are candidates, invoked
//! with the work item as the first argument and the pipeline's own
//! configuration forwarded as `--resource-*` flags. Exit status zero
//! means handled.

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Which kind of external tool to search for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// `*import` executables.
    Import,
    /// `*compile` executables.
    Compile,
}

impl ToolKind {
    fn suffix(self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::Compile => "compile",
        }
    }
}

/// Configuration forwarded to spawned tools.
#[derive(Debug, Clone, Default)]
pub struct ToolForwarding {
    /// Forwarded as `--resource-local-path`.
    pub local_path: Option<PathBuf>,
    /// Forwarded as `--resource-local-source`.
    pub local_source: Option<PathBuf>,
    /// Forwarded as `--resource-remote-sourced`.
    pub remote_sourced: Option<String>,
}

impl ToolForwarding {
    fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(path) = &self.local_path {
            args.push("--resource-local-path".into());
            args.push(path.to_string_lossy().into_owned());
        }
        if let Some(path) = &self.local_source {
            args.push("--resource-local-source".into());
            args.push(path.to_string_lossy().into_owned());
        }
        if let Some(endpoint) = &self.remote_sourced {
            args.push("--resource-remote-sourced".into());
            args.push(endpoint.clone());
        }
        args
    }
}

/// Find candidate tool executables under the given directories, in
/// directory order then name order within each directory.
#[must_use]
pub fn find_tools(dirs: &[PathBuf], kind: ToolKind) -> Vec<PathBuf> {
    let mut tools = Vec::new();
    for dir in dirs {
        let mut found: Vec<PathBuf> = WalkDir::new(dir)
            .max_depth(1)
            .into_iter()
            .flatten()
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| matches_kind(path, kind))
            .collect();
        found.sort();
        tools.extend(found);
    }
    tools
}

fn matches_kind(path: &Path, kind: ToolKind) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let stem = name.strip_suffix(".exe").unwrap_or(name);
    stem.ends_with(kind.suffix())
}

/// Run each candidate tool with `subject` plus the forwarded flags until
/// one exits with status zero. Tool stderr is inherited so failures stay
/// diagnosable.
pub fn run_tools(
    dirs: &[PathBuf],
    kind: ToolKind,
    subject: &str,
    forwarding: &ToolForwarding,
) -> bool {
    for tool in find_tools(dirs, kind) {
        debug!(tool = %tool.display(), subject, "invoking external tool");
        let status = Command::new(&tool)
            .arg(subject)
            .args(forwarding.args())
            .status();
        match status {
            Ok(status) if status.success() => return true,
            Ok(status) => {
                debug!(tool = %tool.display(), ?status, "external tool declined");
            }
            Err(err) => {
                warn!(tool = %tool.display(), %err, "external tool failed to spawn");
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn discovery_matches_suffix_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("texturecompile"), b"").unwrap();
        fs::write(dir.path().join("meshcompile.exe"), b"").unwrap();
        fs::write(dir.path().join("textureimport"), b"").unwrap();
        fs::write(dir.path().join("readme.md"), b"").unwrap();

        let dirs = vec![dir.path().to_path_buf()];
        let compilers = find_tools(&dirs, ToolKind::Compile);
        assert_eq!(compilers.len(), 2);
        let importers = find_tools(&dirs, ToolKind::Import);
        assert_eq!(importers.len(), 1);
        assert!(importers[0].ends_with("textureimport"));
    }

    #[cfg(unix)]
    #[test]
    fn run_tools_stops_at_first_success() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let failing = dir.path().join("acompile");
        let passing = dir.path().join("bcompile");
        fs::write(&failing, "#!/bin/sh\nexit 3\n").unwrap();
        fs::write(
            &passing,
            format!("#!/bin/sh\ntouch {}\nexit 0\n", marker.display()),
        )
        .unwrap();
        for tool in [&failing, &passing] {
            fs::set_permissions(tool, fs::Permissions::from_mode(0o755)).unwrap();
        }

        let ok = run_tools(
            &[dir.path().to_path_buf()],
            ToolKind::Compile,
            "subject-uuid",
            &ToolForwarding::default(),
        );
        assert!(ok);
        assert!(marker.is_file());
    }

    #[test]
    fn run_tools_with_no_tools_is_false() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!run_tools(
            &[dir.path().to_path_buf()],
            ToolKind::Import,
            "x",
            &ToolForwarding::default(),
        ));
    }
}
