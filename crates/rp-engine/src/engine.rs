// SPDX-License-Identifier: MIT OR Apache-2.0
//! The resource engine: import, compile, freshness, autoimport.

use crate::monitor::FsEvent;
use crate::registry::{CompileContext, CompilerOutcome, ImporterOutcome};
use crate::tools::{self, ToolForwarding, ToolKind};
use crate::watch::WatchSet;
use crate::{EngineError, ResourceCompiler, ResourceImporter};
use rp_cache::{ArtifactHeader, LocalCache};
use rp_core::{hash64, ContentHash, TickSource, KEY_DEPENDENCIES, KEY_IMPORT_HASH, KEY_RESOURCE_TYPE};
use rp_events::{DependencyGraph, EventKind, EventStream};
use rp_importmap::{normalize, ImportMap, MAP_FILE_NAME};
use rp_source::{BlobStore, ChangeValue, ResourceSource, SourceFormat};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// The freshness and dependency engine.
///
/// One engine serves a whole pipeline instance. Mutable state (dependency
/// graph, watch set, autoimport dedup) sits behind mutexes so the engine
/// can be shared across server connection tasks; compiler and importer
/// tables are fixed at registration time, before the engine is shared.
pub struct ResourceEngine {
    source_root: PathBuf,
    blob_store: BlobStore,
    cache: LocalCache,
    base_path: Option<PathBuf>,
    tool_paths: Vec<PathBuf>,
    remote_sourced: Option<String>,
    compilers: Vec<Box<dyn ResourceCompiler>>,
    importers: Vec<Box<dyn ResourceImporter>>,
    events: Arc<EventStream>,
    graph: Mutex<DependencyGraph>,
    watch: Mutex<WatchSet>,
    last_notified: Mutex<HashMap<Uuid, ContentHash>>,
    ticks: TickSource,
}

impl ResourceEngine {
    /// An engine over a source tree, a local cache, and an event stream.
    #[must_use]
    pub fn new(source_root: impl Into<PathBuf>, cache: LocalCache, events: Arc<EventStream>) -> Self {
        let source_root = source_root.into();
        Self {
            blob_store: BlobStore::new(&source_root),
            source_root,
            cache,
            base_path: None,
            tool_paths: Vec::new(),
            remote_sourced: None,
            compilers: Vec::new(),
            importers: Vec::new(),
            events,
            graph: Mutex::new(DependencyGraph::new()),
            watch: Mutex::new(WatchSet::new()),
            last_notified: Mutex::new(HashMap::new()),
            ticks: TickSource::new(),
        }
    }

    /// Set the base path imports are resolved against.
    pub fn set_base_path(&mut self, path: impl Into<PathBuf>) {
        self.base_path = Some(path.into());
    }

    /// Add a directory searched for external `*import`/`*compile` tools.
    pub fn add_tool_path(&mut self, path: impl Into<PathBuf>) {
        self.tool_paths.push(path.into());
    }

    /// Record the sourced endpoint forwarded to external tools.
    pub fn set_remote_sourced(&mut self, endpoint: impl Into<String>) {
        self.remote_sourced = Some(endpoint.into());
    }

    /// Register an in-process compiler; consulted in registration order.
    pub fn register_compiler(&mut self, compiler: Box<dyn ResourceCompiler>) {
        self.compilers.push(compiler);
    }

    /// Register an in-process importer; consulted in registration order.
    pub fn register_importer(&mut self, importer: Box<dyn ResourceImporter>) {
        self.importers.push(importer);
    }

    /// The engine's event stream.
    #[must_use]
    pub fn events(&self) -> &Arc<EventStream> {
        &self.events
    }

    /// The local artifact cache.
    #[must_use]
    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    /// The blob sidecar store of the source tree.
    #[must_use]
    pub fn blob_store(&self) -> &BlobStore {
        &self.blob_store
    }

    /// The change timestamp source.
    #[must_use]
    pub fn ticks(&self) -> &TickSource {
        &self.ticks
    }

    /// Source file path for a resource.
    #[must_use]
    pub fn source_path(&self, uuid: Uuid) -> PathBuf {
        self.blob_store.source_path(uuid)
    }

    // -----------------------------------------------------------------
    // Sources
    // -----------------------------------------------------------------

    /// Read the source change log of `uuid`.
    pub fn read_source(&self, uuid: Uuid) -> Result<ResourceSource, EngineError> {
        let path = self.source_path(uuid);
        if !path.is_file() {
            return Err(EngineError::NotFound(uuid));
        }
        Ok(ResourceSource::read_file(&path)?)
    }

    /// Content hash of the source of `uuid`; `None` when never imported.
    #[must_use]
    pub fn source_hash(&self, uuid: Uuid) -> Option<ContentHash> {
        self.read_source(uuid).ok().map(|s| s.source_hash())
    }

    /// Direct dependencies declared by `source` for `platform`.
    ///
    /// The `dependencies` value is a space-separated list of `<uuid>` or
    /// `<uuid>@<platform-decimal>` tokens; bare UUIDs inherit the queried
    /// platform.
    #[must_use]
    pub fn dependencies_of(&self, source: &ResourceSource, platform: u64) -> Vec<(Uuid, u64)> {
        let Some(view) = source.get(KEY_DEPENDENCIES, platform) else {
            return Vec::new();
        };
        let ChangeValue::Value(bytes) = view.value else {
            return Vec::new();
        };
        let Ok(text) = std::str::from_utf8(bytes) else {
            return Vec::new();
        };
        text.split_whitespace()
            .filter_map(|token| {
                let (id, dep_platform) = match token.split_once('@') {
                    Some((id, p)) => (id, p.parse().ok()?),
                    None => (token, platform),
                };
                Some((Uuid::try_parse(id).ok()?, dep_platform))
            })
            .collect()
    }

    /// Direct dependencies of `(uuid, platform)`.
    pub fn dependencies(&self, uuid: Uuid, platform: u64) -> Result<Vec<(Uuid, u64)>, EngineError> {
        Ok(self.dependencies_of(&self.read_source(uuid)?, platform))
    }

    /// Apply a value change to the source of `uuid` and persist it.
    pub fn apply_set(
        &self,
        uuid: Uuid,
        key: u64,
        platform: u64,
        value: &[u8],
    ) -> Result<(), EngineError> {
        self.mutate_source(uuid, |source, ts| source.set(ts, key, platform, value))
    }

    /// Apply an unset change to the source of `uuid` and persist it.
    pub fn apply_unset(&self, uuid: Uuid, key: u64, platform: u64) -> Result<(), EngineError> {
        self.mutate_source(uuid, |source, ts| source.unset(ts, key, platform))
    }

    fn mutate_source(
        &self,
        uuid: Uuid,
        mutate: impl FnOnce(&mut ResourceSource, i64),
    ) -> Result<(), EngineError> {
        let mut source = self.read_source(uuid)?;
        if let Some(newest) = source.newest_timestamp() {
            self.ticks.observe(newest);
        }
        mutate(&mut source, self.ticks.next());
        source.write_file(&self.source_path(uuid), true)?;

        // The edit may have rewritten the dependency list.
        let deps = self.dependencies_of(&source, rp_platform::PLATFORM_ANY);
        let token = self.events.next_token();
        {
            let mut graph = self.graph.lock().expect("dependency graph poisoned");
            graph.set_dependencies((uuid, rp_platform::PLATFORM_ANY), deps);
        }
        self.events.post(EventKind::Modify, uuid, 0, token);
        let graph = self.graph.lock().expect("dependency graph poisoned");
        self.events.post_depends(&graph, uuid, 0, token);
        Ok(())
    }

    /// Fetch the blob payload for `(uuid, platform, key)`.
    pub fn read_blob(
        &self,
        uuid: Uuid,
        platform: u64,
        key: u64,
    ) -> Result<(u64, Vec<u8>), EngineError> {
        let source = self.read_source(uuid)?;
        let Some(view) = source.get(key, platform) else {
            return Err(EngineError::NotFound(uuid));
        };
        let ChangeValue::Blob { checksum, size } = view.value else {
            return Err(EngineError::NotFound(uuid));
        };
        let bytes = self
            .blob_store
            .read(uuid, key, view.platform, checksum, size)?;
        Ok((checksum, bytes))
    }

    // -----------------------------------------------------------------
    // Freshness
    // -----------------------------------------------------------------

    /// `true` when `(uuid, platform)` must be (re)compiled before it can
    /// be served: never imported, no artifact, or stale artifact hash.
    #[must_use]
    pub fn needs_update(&self, uuid: Uuid, platform: u64) -> bool {
        let Some(source_hash) = self.source_hash(uuid) else {
            return true;
        };
        let Some((path, _)) = self.cache.locate(uuid, platform, false) else {
            return true;
        };
        match ArtifactHeader::read_from_file(&path) {
            Ok(header) => header.source_hash != source_hash,
            Err(err) => {
                debug!(%uuid, platform, %err, "artifact header unreadable, forcing rebuild");
                true
            }
        }
    }

    /// Compile `(uuid, platform)`, recursively compiling stale
    /// dependencies first.
    pub fn compile(&self, uuid: Uuid, platform: u64) -> Result<(), EngineError> {
        let mut visited = HashSet::new();
        self.compile_inner(uuid, platform, &mut visited)
    }

    fn compile_inner(
        &self,
        uuid: Uuid,
        platform: u64,
        visited: &mut HashSet<(Uuid, u64)>,
    ) -> Result<(), EngineError> {
        if !visited.insert((uuid, platform)) {
            // Already compiled (or being compiled) in this walk; cycles
            // through user data must not recurse forever.
            return Ok(());
        }

        let mut source = self.read_source(uuid)?;
        let deps = self.dependencies_of(&source, platform);
        for (dep, dep_platform) in &deps {
            if !visited.contains(&(*dep, *dep_platform)) && self.needs_update(*dep, *dep_platform) {
                if let Err(err) = self.compile_inner(*dep, *dep_platform, visited) {
                    warn!(%uuid, dep = %dep, %err, "dependency compile failed");
                    return Err(EngineError::DependencyFailed {
                        uuid: *dep,
                        platform: *dep_platform,
                    });
                }
            }
        }

        // A text-format source on disk is rewritten canonically so the
        // file content and the hash stay in step.
        if source.loaded_format() == Some(SourceFormat::Text) {
            source.write_file(&self.source_path(uuid), true)?;
        }
        let source_hash = source.source_hash();
        source.collapse_history();

        let resource_type = source
            .get(KEY_RESOURCE_TYPE, platform)
            .and_then(|view| match view.value {
                ChangeValue::Value(bytes) => std::str::from_utf8(bytes).ok().map(String::from),
                _ => None,
            })
            .ok_or(EngineError::NoResourceType(uuid))?;

        self.graph
            .lock()
            .expect("dependency graph poisoned")
            .set_dependencies((uuid, platform), deps);

        let ctx = CompileContext {
            uuid,
            platform,
            source: &source,
            source_hash,
            resource_type: &resource_type,
        };
        for compiler in &self.compilers {
            match compiler.compile(&ctx)? {
                CompilerOutcome::Unsupported => continue,
                CompilerOutcome::Compiled(output) => {
                    let header = ArtifactHeader::new(hash64(resource_type.as_bytes()), source_hash);
                    let mut file = self.cache.create_static(uuid, platform)?;
                    header.write_to(&mut file)?;
                    file.write_all(&output.data)?;
                    if let Some(dynamic) = &output.dynamic {
                        let mut blob = self.cache.create_dynamic(uuid, platform)?;
                        blob.write_all(dynamic)?;
                    }
                    info!(%uuid, platform, %resource_type, "compiled resource");
                    return Ok(());
                }
            }
        }

        if tools::run_tools(
            &self.tool_paths,
            ToolKind::Compile,
            &uuid.to_string(),
            &self.forwarding(),
        ) {
            info!(%uuid, platform, %resource_type, "compiled by external tool");
            return Ok(());
        }

        Err(EngineError::NoCompiler {
            uuid,
            resource_type,
        })
    }

    // -----------------------------------------------------------------
    // Import
    // -----------------------------------------------------------------

    /// Import (or re-import) a file, assigning a UUID on first contact.
    ///
    /// Posts CREATE on first import and MODIFY on re-import, then fans
    /// DEPENDS out to everything depending on the resource.
    pub fn import(&self, path: &Path) -> Result<(Uuid, ContentHash), EngineError> {
        let path = normalize(path);
        let bytes = fs::read(&path)?;
        let content_hash = ContentHash::of(&bytes);

        let Some(map) = ImportMap::open(&path, true)? else {
            // Write-mode open always yields a map; treat the impossible
            // case as the path being unindexable.
            return Err(EngineError::PathNotFound(path));
        };
        let existing = map.lookup(&path)?;
        let (uuid, created) = match &existing {
            Some(entry) => (entry.uuid, false),
            None => (Uuid::new_v4(), true),
        };

        let source_file = self.source_path(uuid);
        let mut source = if source_file.is_file() {
            ResourceSource::read_file(&source_file)?
        } else {
            ResourceSource::new()
        };
        if let Some(newest) = source.newest_timestamp() {
            self.ticks.observe(newest);
        }
        let ts = self.ticks.next();

        let mut handled = false;
        for importer in &self.importers {
            match importer.import(&path, &bytes, uuid, &mut source, ts)? {
                ImporterOutcome::Unsupported => continue,
                ImporterOutcome::Imported => {
                    handled = true;
                    break;
                }
            }
        }
        if !handled {
            // External tools own the whole import, map update included.
            if tools::run_tools(
                &self.tool_paths,
                ToolKind::Import,
                &path.to_string_lossy(),
                &self.forwarding(),
            ) {
                let entry = map
                    .lookup(&path)?
                    .ok_or_else(|| EngineError::PathNotFound(path.clone()))?;
                self.last_notified
                    .lock()
                    .expect("autoimport state poisoned")
                    .insert(entry.uuid, entry.signature);
                return Ok((entry.uuid, entry.signature));
            }
            return Err(EngineError::NoImporter(path));
        }

        source.set(ts, KEY_IMPORT_HASH, 0, content_hash.to_hex().as_bytes());
        source.write_file(&source_file, true)?;
        let stored_uuid = map.store(&path, uuid, content_hash)?;
        debug_assert_eq!(stored_uuid, uuid);

        let deps = self.dependencies_of(&source, rp_platform::PLATFORM_ANY);
        {
            let mut graph = self.graph.lock().expect("dependency graph poisoned");
            graph.set_dependencies((uuid, rp_platform::PLATFORM_ANY), deps);
        }

        let token = self.events.next_token();
        let kind = if created {
            EventKind::Create
        } else {
            EventKind::Modify
        };
        self.events.post(kind, uuid, 0, token);
        {
            let graph = self.graph.lock().expect("dependency graph poisoned");
            self.events.post_depends(&graph, uuid, 0, token);
        }
        self.last_notified
            .lock()
            .expect("autoimport state poisoned")
            .insert(uuid, content_hash);

        info!(path = %path.display(), %uuid, created, "imported resource");
        Ok((uuid, content_hash))
    }

    /// `true` when the import of `uuid` is stale: no source, a signature
    /// hash that no longer matches the file, or an import hash recorded
    /// in the source that disagrees with the file content.
    #[must_use]
    pub fn autoimport_needs_update(&self, uuid: Uuid, platform: u64) -> bool {
        let source_file = self.source_path(uuid);
        if !source_file.is_file() {
            return true;
        }
        let Ok(Some(path)) = self.reverse_lookup(uuid) else {
            return true;
        };
        let Ok(bytes) = fs::read(&path) else {
            return true;
        };
        let file_hash = ContentHash::of(&bytes);

        let map_signature = ImportMap::open(&path, false)
            .ok()
            .flatten()
            .and_then(|map| map.lookup(&path).ok().flatten())
            .map(|entry| entry.signature);
        if map_signature != Some(file_hash) {
            return true;
        }

        let Ok(source) = ResourceSource::read_file(&source_file) else {
            return true;
        };
        match source.get(KEY_IMPORT_HASH, platform) {
            Some(view) => match view.value {
                ChangeValue::Value(bytes) => {
                    let stored = std::str::from_utf8(bytes)
                        .ok()
                        .and_then(|s| s.parse::<ContentHash>().ok());
                    stored != Some(file_hash)
                }
                _ => true,
            },
            None => true,
        }
    }

    // -----------------------------------------------------------------
    // Autoimport watching
    // -----------------------------------------------------------------

    /// Watch a directory for automatic re-import. Redundant watches
    /// (covered by an existing ancestor) are dropped; descendants of the
    /// new directory are swallowed.
    pub fn watch(&self, dir: &Path) -> bool {
        self.watch.lock().expect("watch set poisoned").watch(dir)
    }

    /// Stop watching exactly `dir`.
    pub fn unwatch(&self, dir: &Path) -> bool {
        self.watch.lock().expect("watch set poisoned").unwatch(dir)
    }

    /// Snapshot of the watched directories.
    #[must_use]
    pub fn watched_dirs(&self) -> Vec<PathBuf> {
        self.watch
            .lock()
            .expect("watch set poisoned")
            .dirs()
            .to_vec()
    }

    /// React to one filesystem event: re-import the file when it lies
    /// under a watched directory and its content actually changed since
    /// the last notification. Returns the affected UUID, if any.
    pub fn handle_fs_event(&self, event: &FsEvent) -> Result<Option<Uuid>, EngineError> {
        let path = &event.path;
        if !self.watch.lock().expect("watch set poisoned").covers(path) {
            return Ok(None);
        }
        let Ok(bytes) = fs::read(path) else {
            // Raced with a delete; nothing to import.
            return Ok(None);
        };
        let hash = ContentHash::of(&bytes);

        if let Ok(Some(map)) = ImportMap::open(path, false) {
            if let Ok(Some(entry)) = map.lookup(path) {
                let last = self
                    .last_notified
                    .lock()
                    .expect("autoimport state poisoned")
                    .get(&entry.uuid)
                    .copied();
                if last == Some(hash) {
                    return Ok(None);
                }
            }
        }

        let (uuid, _) = self.import(path)?;
        Ok(Some(uuid))
    }

    // -----------------------------------------------------------------
    // Lookup and deletion
    // -----------------------------------------------------------------

    /// Resolve a path to `(uuid, signature)` through its closest map.
    pub fn lookup(&self, path: &Path) -> Result<Option<(Uuid, ContentHash)>, EngineError> {
        let Some(map) = ImportMap::open(path, false)? else {
            return Ok(None);
        };
        Ok(map.lookup(path)?.map(|entry| (entry.uuid, entry.signature)))
    }

    /// Resolve a UUID back to its imported path by scanning every known
    /// import map.
    pub fn reverse_lookup(&self, uuid: Uuid) -> Result<Option<PathBuf>, EngineError> {
        for map in self.known_maps() {
            if let Some(path) = map.reverse_lookup(uuid)? {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    fn known_maps(&self) -> Vec<ImportMap> {
        let mut roots: Vec<PathBuf> = Vec::new();
        if let Some(base) = &self.base_path {
            roots.push(base.clone());
        }
        roots.extend(self.watched_dirs());

        let mut seen = HashSet::new();
        let mut maps = Vec::new();
        for root in roots {
            for entry in WalkDir::new(&root).follow_links(false).into_iter().flatten() {
                if entry.file_type().is_file()
                    && entry.file_name() == MAP_FILE_NAME
                    && seen.insert(entry.path().to_path_buf())
                {
                    // Any file under the map's directory opens it.
                    if let Ok(Some(map)) = ImportMap::open(entry.path(), false) {
                        maps.push(map);
                    }
                }
            }
        }
        maps
    }

    /// Delete `uuid` everywhere: import-map line, source file, blob
    /// sidecars, compiled artifacts, and dependency edges.
    pub fn delete(&self, uuid: Uuid) -> Result<(), EngineError> {
        if let Some(path) = self.reverse_lookup(uuid)? {
            if let Some(map) = ImportMap::open(&path, false)? {
                map.remove(&path)?;
            }
        }
        self.blob_store.remove_all(uuid)?;
        let source_file = self.source_path(uuid);
        match fs::remove_file(&source_file) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.cache.remove_all(uuid)?;

        let token = self.events.next_token();
        self.events.post(EventKind::Delete, uuid, 0, token);
        {
            let graph = self.graph.lock().expect("dependency graph poisoned");
            self.events.post_depends(&graph, uuid, 0, token);
        }
        self.graph
            .lock()
            .expect("dependency graph poisoned")
            .remove_resource(uuid);
        self.last_notified
            .lock()
            .expect("autoimport state poisoned")
            .remove(&uuid);
        info!(%uuid, "deleted resource");
        Ok(())
    }

    fn forwarding(&self) -> ToolForwarding {
        ToolForwarding {
            local_path: self.cache.roots().first().cloned(),
            local_source: Some(self.source_root.clone()),
            remote_sourced: self.remote_sourced.clone(),
        }
    }
}

impl std::fmt::Debug for ResourceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceEngine")
            .field("source_root", &self.source_root)
            .field("compilers", &self.compilers.len())
            .field("importers", &self.importers.len())
            .finish_non_exhaustive()
    }
}
