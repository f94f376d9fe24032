// SPDX-License-Identifier: MIT OR Apache-2.0
//! The [`ResourceModule`] composition root.
//!
//! Everything the pipeline keeps alive lives here, initialized once and
//! finalized explicitly: the configuration, the event stream, the
//! freshness engine with its registered plug-ins, and the remote client
//! workers. The module also implements the artifact open flow: remote
//! compiled service first, then local autoimport/compile/cache.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use rp_cache::{CachedArtifact, LocalCache};
use rp_config::ResourceConfig;
use rp_engine::ResourceEngine;
use rp_events::EventStream;
use rp_remote::{CompiledClient, CompiledStream, SourcedClient};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors from module-level operations.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// Engine failure (import, compile, lookup).
    #[error(transparent)]
    Engine(#[from] rp_engine::EngineError),

    /// Local cache failure.
    #[error(transparent)]
    Cache(#[from] rp_cache::CacheError),

    /// A blocking engine task was cancelled.
    #[error("engine task cancelled")]
    Cancelled,
}

/// An opened artifact: streamed from the remote compiled service or
/// served from the local cache.
#[derive(Debug)]
pub enum OpenedArtifact {
    /// Remote stream of known size.
    Remote(CompiledStream),
    /// Locally cached file.
    Local(CachedArtifact),
}

/// The pipeline's root object.
pub struct ResourceModule {
    config: ResourceConfig,
    events: Arc<EventStream>,
    engine: Arc<ResourceEngine>,
    sourced: Option<Arc<SourcedClient>>,
    compiled: Option<Arc<CompiledClient>>,
}

impl ResourceModule {
    /// Build the module from configuration.
    ///
    /// `setup` runs against the engine before it is shared, which is
    /// where compilers and importers are registered. Remote clients are
    /// spawned here when the config names endpoints, so this must run
    /// inside a tokio runtime.
    #[must_use]
    pub fn initialize(config: ResourceConfig, setup: impl FnOnce(&mut ResourceEngine)) -> Self {
        let events = Arc::new(EventStream::default());
        let source_root = config
            .source_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("resources"));
        let cache = LocalCache::new(config.local_paths.clone());

        let mut engine = ResourceEngine::new(source_root, cache, events.clone());
        if let Some(base) = &config.base_path {
            engine.set_base_path(base);
        }
        for tool_path in &config.tool_paths {
            engine.add_tool_path(tool_path);
        }
        if let Some(endpoint) = &config.remote_sourced {
            engine.set_remote_sourced(endpoint.clone());
        }
        setup(&mut engine);
        let engine = Arc::new(engine);

        for dir in &config.autoimport_paths {
            engine.watch(dir);
        }

        let sourced = config
            .remote_sourced
            .as_ref()
            .map(|endpoint| Arc::new(SourcedClient::connect(endpoint.clone(), events.clone())));
        let compiled = config
            .remote_compiled
            .as_ref()
            .map(|endpoint| Arc::new(CompiledClient::connect(endpoint.clone(), events.clone())));

        info!(
            sources = %engine.blob_store().root().display(),
            cache_roots = config.local_paths.len(),
            remote_sourced = config.remote_sourced.is_some(),
            remote_compiled = config.remote_compiled.is_some(),
            "resource module initialized"
        );
        Self {
            config,
            events,
            engine,
            sourced,
            compiled,
        }
    }

    /// Terminate remote workers. The module is unusable for remote
    /// operations afterwards; local operations keep working.
    pub async fn finalize(&self) {
        if let Some(sourced) = &self.sourced {
            sourced.terminate().await;
        }
        if let Some(compiled) = &self.compiled {
            compiled.terminate().await;
        }
        debug!("resource module finalized");
    }

    /// The loaded configuration.
    #[must_use]
    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// The shared event stream.
    #[must_use]
    pub fn events(&self) -> &Arc<EventStream> {
        &self.events
    }

    /// The freshness engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<ResourceEngine> {
        &self.engine
    }

    /// The sourced remote client, when configured.
    #[must_use]
    pub fn sourced(&self) -> Option<&Arc<SourcedClient>> {
        self.sourced.as_ref()
    }

    /// The compiled remote client, when configured.
    #[must_use]
    pub fn compiled(&self) -> Option<&Arc<CompiledClient>> {
        self.compiled.as_ref()
    }

    /// Open the static artifact for `(uuid, platform)`.
    ///
    /// Tries the remote compiled service first; otherwise reimports and
    /// recompiles locally as needed and serves from the cache.
    pub async fn open_static(
        &self,
        uuid: Uuid,
        platform: u64,
    ) -> Result<Option<OpenedArtifact>, ModuleError> {
        self.open(uuid, platform, false).await
    }

    /// Open the dynamic (`.blob`) artifact for `(uuid, platform)`.
    pub async fn open_dynamic(
        &self,
        uuid: Uuid,
        platform: u64,
    ) -> Result<Option<OpenedArtifact>, ModuleError> {
        self.open(uuid, platform, true).await
    }

    async fn open(
        &self,
        uuid: Uuid,
        platform: u64,
        dynamic: bool,
    ) -> Result<Option<OpenedArtifact>, ModuleError> {
        if let Some(remote) = &self.compiled {
            let opened = if dynamic {
                remote.open_dynamic(uuid, platform).await
            } else {
                remote.open_static(uuid, platform).await
            };
            match opened {
                Ok(Some(stream)) => return Ok(Some(OpenedArtifact::Remote(stream))),
                Ok(None) => debug!(%uuid, platform, "remote compiled has no artifact"),
                Err(err) => debug!(%uuid, platform, %err, "remote compiled unavailable"),
            }
        }
        Ok(self
            .open_local(uuid, platform, dynamic)
            .await?
            .map(OpenedArtifact::Local))
    }

    /// Open from the local cache only, bringing the pair up to date
    /// first (reimport and compile as needed, best effort). This is what
    /// the compiled server itself serves from.
    pub async fn open_local(
        &self,
        uuid: Uuid,
        platform: u64,
        dynamic: bool,
    ) -> Result<Option<CachedArtifact>, ModuleError> {
        let engine = self.engine.clone();
        let artifact = tokio::task::spawn_blocking(move || {
            ensure_fresh(&engine, uuid, platform);
            if dynamic {
                engine.cache().open_dynamic(uuid, platform)
            } else {
                engine.cache().open_static(uuid, platform)
            }
        })
        .await
        .map_err(|_| ModuleError::Cancelled)??;
        Ok(artifact)
    }
}

/// Bring `(uuid, platform)` up to date locally, best effort: a failed
/// reimport or compile still lets the open fall back to whatever the
/// cache holds.
fn ensure_fresh(engine: &ResourceEngine, uuid: Uuid, platform: u64) {
    if engine.autoimport_needs_update(uuid, platform) {
        match engine.reverse_lookup(uuid) {
            Ok(Some(path)) => {
                if let Err(err) = engine.import(&path) {
                    warn!(%uuid, path = %path.display(), %err, "autoimport failed");
                }
            }
            Ok(None) => debug!(%uuid, "no import path known, serving as-is"),
            Err(err) => warn!(%uuid, %err, "reverse lookup failed"),
        }
    }
    if engine.needs_update(uuid, platform) {
        if let Err(err) = engine.compile(uuid, platform) {
            warn!(%uuid, platform, %err, "compile failed, serving stale artifact if any");
        }
    }
}

impl std::fmt::Debug for ResourceModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceModule")
            .field("remote_sourced", &self.sourced.is_some())
            .field("remote_compiled", &self.compiled.is_some())
            .finish_non_exhaustive()
    }
}
