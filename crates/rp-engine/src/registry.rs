// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-process compiler and importer plug-ins.
//!
//! Plug-ins are consulted in registration order; the first that does not
//! decline wins. Anything neither table accepts falls through to the
//! external tool search.

use crate::EngineError;
use rp_core::ContentHash;
use rp_source::ResourceSource;
use std::path::Path;
use uuid::Uuid;

/// Everything a compiler needs to produce an artifact.
#[derive(Debug)]
pub struct CompileContext<'a> {
    /// Resource being compiled.
    pub uuid: Uuid,
    /// Target platform.
    pub platform: u64,
    /// The source, already collapsed to per-platform winners.
    pub source: &'a ResourceSource,
    /// Content hash of the source; embedded into the artifact header by
    /// the engine.
    pub source_hash: ContentHash,
    /// Declared resource type.
    pub resource_type: &'a str,
}

/// Output of a successful compile.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompiledOutput {
    /// Static artifact body (follows the engine-written header).
    pub data: Vec<u8>,
    /// Optional dynamic (`.blob`) artifact content.
    pub dynamic: Option<Vec<u8>>,
}

/// What a compiler decided about a compile request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompilerOutcome {
    /// This compiler does not handle the resource type; try the next.
    Unsupported,
    /// Compiled successfully.
    Compiled(CompiledOutput),
}

/// An in-process resource compiler.
pub trait ResourceCompiler: Send + Sync {
    /// Compile `ctx` or decline it.
    fn compile(&self, ctx: &CompileContext<'_>) -> Result<CompilerOutcome, EngineError>;
}

/// What an importer decided about a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImporterOutcome {
    /// This importer does not handle the file; try the next.
    Unsupported,
    /// The source was populated.
    Imported,
}

/// An in-process resource importer.
///
/// An importer inspects the raw file bytes and records whatever changes
/// describe the asset into `source`, including its `resource_type`. The
/// engine handles the import map, the import hash, and persistence.
pub trait ResourceImporter: Send + Sync {
    /// Import `bytes` (read from `path`) into `source` or decline.
    fn import(
        &self,
        path: &Path,
        bytes: &[u8],
        uuid: Uuid,
        source: &mut ResourceSource,
        timestamp: i64,
    ) -> Result<ImporterOutcome, EngineError>;
}

impl<F> ResourceCompiler for F
where
    F: Fn(&CompileContext<'_>) -> Result<CompilerOutcome, EngineError> + Send + Sync,
{
    fn compile(&self, ctx: &CompileContext<'_>) -> Result<CompilerOutcome, EngineError> {
        self(ctx)
    }
}
