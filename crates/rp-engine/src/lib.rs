// SPDX-License-Identifier: MIT OR Apache-2.0
//! Freshness and dependency engine.
//!
//! [`ResourceEngine`] owns the logic that keeps compiled artifacts in
//! step with their sources: up-to-date checks via the content hash that
//! travels from import through the change log into artifact headers,
//! recursive dependency compilation, plug-in compiler/importer tables
//! with external tool fallback, and the autoimport watcher that turns
//! filesystem edits into MODIFY/DEPENDS event cascades.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod monitor;
mod registry;
mod tools;
mod watch;

pub use engine::ResourceEngine;
pub use monitor::{FsEvent, FsEventKind, FsMonitor, PollingMonitor};
pub use registry::{
    CompileContext, CompiledOutput, CompilerOutcome, ImporterOutcome, ResourceCompiler,
    ResourceImporter,
};
pub use tools::{find_tools, ToolForwarding, ToolKind};
pub use watch::WatchSet;

use std::path::PathBuf;
use uuid::Uuid;

/// Errors from engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No source (or no import-map entry) for the resource.
    #[error("resource not found: {0}")]
    NotFound(Uuid),

    /// No import-map entry for the path.
    #[error("path not imported: {0}")]
    PathNotFound(PathBuf),

    /// Filesystem failure.
    #[error("engine i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// The source change log did not parse.
    #[error(transparent)]
    Source(#[from] rp_source::SourceError),

    /// Blob sidecar failure.
    #[error(transparent)]
    Blob(#[from] rp_source::BlobError),

    /// Import map failure.
    #[error(transparent)]
    ImportMap(#[from] rp_importmap::ImportMapError),

    /// Local cache failure.
    #[error(transparent)]
    Cache(#[from] rp_cache::CacheError),

    /// A recursive dependency compile failed.
    #[error("dependency {uuid} (platform {platform}) failed to compile")]
    DependencyFailed {
        /// The dependency that failed.
        uuid: Uuid,
        /// Its platform.
        platform: u64,
    },

    /// The source carries no resource type, so no compiler can be chosen.
    #[error("resource {0} has no resource_type")]
    NoResourceType(Uuid),

    /// Every registered compiler and external tool declined or failed.
    #[error("no compiler produced output for {uuid} (type {resource_type})")]
    NoCompiler {
        /// The resource.
        uuid: Uuid,
        /// Its declared type.
        resource_type: String,
    },

    /// Every registered importer and external tool declined or failed.
    #[error("no importer accepted {0}")]
    NoImporter(PathBuf),

    /// A compiler or importer plug-in reported failure.
    #[error("plug-in failed: {0}")]
    Plugin(String),
}
