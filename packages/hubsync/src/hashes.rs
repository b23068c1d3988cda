//! Per-tenant change tracking for the working directory.
//!
//! The hashes file is a single JSON document living next to the artifact
//! folders. It maps each tenant to the artifact metadata last observed
//! locally (server revision, content MD5, on-disk path, modification times)
//! plus the pull/push watermarks that back `--modified` flows. Everything the
//! engine knows about "has this changed" comes from here.
//!
//! ## Durability
//!
//! Mutations accumulate in memory and are flushed to disk synchronously after
//! a configurable number of updates or elapsed time, and unconditionally on
//! drop. The first opened store also installs SIGINT/SIGTERM hooks that flush
//! every live store before re-raising, so an interrupted sync never loses
//! more than the in-flight item.
//!
//! ## Concurrency
//!
//! The store assumes a single writer per working directory per process; the
//! internal mutex serializes the map itself, and flows funnel their updates
//! through the throttled batch that owns the store.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, Once, Weak},
    time::Instant,
};

use color_eyre::{Result, eyre::Context as _};
use dashmap::DashMap;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

use clients::hub::v1::{Item, Md5};

use crate::{config::Options, fs};

/// Filename of the hashes file within the working directory.
pub const HASHES_FILE: &str = ".wchtoolshashes";

/// Legacy filename, renamed to [`HASHES_FILE`] on first open.
pub const LEGACY_HASHES_FILE: &str = ".dxhashes";

/// Format version written to new hashes files.
const FILE_VERSION: &str = "2";

/// Which change classes a modification query asks about.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ModFlags {
    pub new: bool,
    pub modified: bool,
    pub deleted: bool,
}

impl ModFlags {
    pub const NEW_AND_MODIFIED: ModFlags = ModFlags {
        new: true,
        modified: true,
        deleted: false,
    };

    pub const ALL: ModFlags = ModFlags {
        new: true,
        modified: true,
        deleted: true,
    };
}

/// Which asset sub-kind a watermark covers. Non-asset artifact types always
/// use [`TimestampScope::All`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimestampScope {
    All,
    WebAssets,
    ContentAssets,
}

/// One tracked artifact.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HashEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(rename = "lastModified", skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "localLastModified", skip_serializing_if = "Option::is_none")]
    pub local_last_modified: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(rename = "resourcePath", skip_serializing_if = "Option::is_none")]
    pub resource_path: Option<String>,
    #[serde(rename = "resourceMD5", skip_serializing_if = "Option::is_none")]
    pub resource_md5: Option<String>,
    #[serde(
        rename = "resourceLocalLastModified",
        skip_serializing_if = "Option::is_none"
    )]
    pub resource_local_last_modified: Option<Timestamp>,
    #[serde(rename = "contentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// A pull or push watermark: a single timestamp for most artifact types, or
/// one per asset sub-kind. Legacy single values inherit into both sub-kinds
/// when read with a scoped query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Watermark {
    Single(Timestamp),
    Split {
        #[serde(rename = "webAssets", skip_serializing_if = "Option::is_none")]
        web_assets: Option<Timestamp>,
        #[serde(rename = "contentAssets", skip_serializing_if = "Option::is_none")]
        content_assets: Option<Timestamp>,
    },
}

impl Watermark {
    fn get(&self, scope: TimestampScope) -> Option<Timestamp> {
        match (self, scope) {
            (Watermark::Single(ts), _) => Some(*ts),
            (Watermark::Split { web_assets, .. }, TimestampScope::WebAssets) => *web_assets,
            (Watermark::Split { content_assets, .. }, TimestampScope::ContentAssets) => {
                *content_assets
            }
            (
                Watermark::Split {
                    web_assets,
                    content_assets,
                },
                TimestampScope::All,
            ) => {
                // An unscoped query over a split watermark answers with the
                // older sub-kind so no modification window is skipped.
                match (*web_assets, *content_assets) {
                    (Some(web), Some(content)) => Some(web.min(content)),
                    _ => None,
                }
            }
        }
    }

    fn set(previous: Option<Watermark>, scope: TimestampScope, ts: Timestamp) -> Watermark {
        match scope {
            TimestampScope::All => Watermark::Single(ts),
            TimestampScope::WebAssets => {
                let content_assets = previous.and_then(|w| w.get(TimestampScope::ContentAssets));
                Watermark::Split {
                    web_assets: Some(ts),
                    content_assets,
                }
            }
            TimestampScope::ContentAssets => {
                let web_assets = previous.and_then(|w| w.get(TimestampScope::WebAssets));
                Watermark::Split {
                    web_assets,
                    content_assets: Some(ts),
                }
            }
        }
    }
}

/// Everything tracked for one tenant.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct TenantTracking {
    #[serde(rename = "lastPullTimestamp", skip_serializing_if = "Option::is_none")]
    last_pull: Option<Watermark>,
    #[serde(rename = "lastPushTimestamp", skip_serializing_if = "Option::is_none")]
    last_push: Option<Watermark>,
    #[serde(rename = "baseUrls", default, skip_serializing_if = "Vec::is_empty")]
    base_urls: Vec<String>,
    #[serde(flatten)]
    entries: BTreeMap<String, HashEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct HashesDocument {
    version: String,
    #[serde(flatten)]
    tenants: BTreeMap<String, TenantTracking>,
}

impl Default for HashesDocument {
    fn default() -> Self {
        Self {
            version: FILE_VERSION.into(),
            tenants: BTreeMap::new(),
        }
    }
}

struct State {
    file_path: PathBuf,
    working_dir: PathBuf,
    document: HashesDocument,
    tenant_key: String,
    enabled: bool,
    dirty: u32,
    write_threshold: u32,
    write_max_time: std::time::Duration,
    last_write: Instant,
}

impl State {
    fn tenant(&self) -> Option<&TenantTracking> {
        self.document.tenants.get(&self.tenant_key)
    }

    fn tenant_mut(&mut self) -> &mut TenantTracking {
        self.document.tenants.entry(self.tenant_key.clone()).or_default()
    }

    /// Write the current snapshot to disk if anything is dirty.
    fn flush(&mut self) -> Result<()> {
        if self.dirty == 0 {
            return Ok(());
        }
        let content = serde_json::to_vec_pretty(&self.document).context("serialize hashes")?;
        fs::write_atomic_sync(&self.file_path, content)?;
        self.dirty = 0;
        self.last_write = Instant::now();
        trace!(path = ?self.file_path, "flushed hashes");
        Ok(())
    }

    /// Record a mutation and flush when the policy says so.
    fn touch(&mut self) -> Result<()> {
        self.dirty += 1;
        if self.dirty >= self.write_threshold || self.last_write.elapsed() >= self.write_max_time {
            self.flush()?;
        }
        Ok(())
    }
}

/// Handle to the hashes file of one working directory, scoped to one tenant.
///
/// Cheaply cloneable; clones share the underlying map.
#[derive(Clone)]
pub struct Hashes {
    inner: Arc<Mutex<State>>,
}

impl std::fmt::Debug for Hashes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock().expect("hashes mutex poisoned");
        f.debug_struct("Hashes")
            .field("file", &state.file_path)
            .field("tenant", &state.tenant_key)
            .field("enabled", &state.enabled)
            .finish()
    }
}

impl Hashes {
    /// Open (or create) the hashes file next to the artifact folders of
    /// `working_dir`, resolving the tenant key from the options.
    ///
    /// A legacy `.dxhashes` file is renamed into place first. An unparseable
    /// file is treated as absent: change tracking starts fresh rather than
    /// failing the whole flow.
    #[instrument(name = "Hashes::open", skip(options))]
    pub async fn open(working_dir: &Path, options: &Options) -> Result<Self> {
        let file_path = working_dir.join(HASHES_FILE);
        let legacy_path = working_dir.join(LEGACY_HASHES_FILE);
        if !fs::exists(&file_path).await && fs::exists(&legacy_path).await {
            fs::rename(&legacy_path, &file_path)
                .await
                .context("rename legacy hashes file")?;
            debug!(?file_path, "renamed legacy hashes file");
        }

        let document = match fs::read_buffered(&file_path).await? {
            Some(content) => match serde_json::from_slice::<HashesDocument>(&content) {
                Ok(document) => document,
                Err(err) => {
                    warn!(?file_path, error = %err, "unparseable hashes file, starting fresh");
                    HashesDocument::default()
                }
            },
            None => HashesDocument::default(),
        };

        let base_url = options
            .base_url()
            .ok()
            .map(|url| url.as_str().trim_end_matches('/').to_string());
        let tenant_key = resolve_tenant_key(&document, options.tenant_id(), base_url.as_deref());

        let mut state = State {
            file_path,
            working_dir: working_dir.to_path_buf(),
            document,
            tenant_key,
            enabled: options.use_hashes(),
            dirty: 0,
            write_threshold: options.hashes_write_threshold().max(1),
            write_max_time: options.hashes_write_max_time(),
            last_write: Instant::now(),
        };

        // Remember the base URL for future reverse lookups.
        if state.enabled
            && let Some(url) = base_url
        {
            let tenant = state.tenant_mut();
            if !tenant.base_urls.contains(&url) {
                tenant.base_urls.push(url);
                state.dirty += 1;
            }
        }

        let inner = Arc::new(Mutex::new(state));
        flush_guard::register(&inner);
        Ok(Self { inner })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.lock().expect("hashes mutex poisoned")
    }

    /// Whether change tracking is enabled. When disabled every mutator is a
    /// no-op and every predicate answers `false`.
    pub fn enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Record a successful pull or push of `item` stored at `rel_path`
    /// (working-directory relative).
    ///
    /// Recomputes the file's MD5 and mtime, removes any stale entry that
    /// claims the same path under a different id, and, for assets with a
    /// linked resource, records the resource as its own entry so resource
    /// files can be found by id later.
    #[instrument(name = "Hashes::update", skip(self, item))]
    pub async fn update(
        &self,
        item: &Item,
        rel_path: &str,
        resource: Option<ResourceLink<'_>>,
    ) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let Some(id) = item.id() else {
            warn!(rel_path, "cannot track an item without an id");
            return Ok(());
        };
        let id = id.to_string();

        let abs = self.lock().working_dir.join(rel_path);
        let md5 = fs::hash_file(&abs).await.context("hash tracked file")?;
        let mtime = fs::mtime(&abs).await?.unwrap_or_else(Timestamp::now);

        let mut state = self.lock();
        let tenant = state.tenant_mut();

        // A rename leaves the old id pointing at a path that now belongs to
        // this item; drop any such stale claim.
        let rel = normalize(rel_path);
        tenant
            .entries
            .retain(|other_id, entry| other_id == &id || entry.path.as_deref() != Some(rel.as_str()));

        let entry = tenant.entries.entry(id).or_default();
        entry.rev = item.rev().map(str::to_string);
        entry.last_modified = item.last_modified().map(str::to_string);
        entry.md5 = Some(md5.to_base64());
        entry.path = Some(rel.clone());
        entry.local_last_modified = Some(mtime);

        match &resource {
            Some(link) => {
                entry.resource = Some(link.id.to_string());
                entry.resource_path = Some(normalize(link.rel_path));
                entry.resource_md5 = Some(link.md5.to_base64());
                entry.resource_local_last_modified = link.local_last_modified;
            }
            // Keep the bare resource reference even without a tracked
            // resource file, so resource reconciliation knows the id is
            // accounted for.
            None => entry.resource = item.resource().map(str::to_string),
        }

        if let Some(link) = resource {
            let resource_entry = tenant.entries.entry(link.id.to_string()).or_default();
            resource_entry.md5 = Some(link.md5.to_base64());
            resource_entry.path = Some(normalize(link.rel_path));
            resource_entry.local_last_modified = link.local_last_modified;
        }

        state.touch()
    }

    /// Remove entries by id.
    #[instrument(name = "Hashes::remove", skip(self))]
    pub fn remove(&self, ids: &[&str]) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let mut state = self.lock();
        let tenant = state.tenant_mut();
        let mut removed = false;
        for id in ids {
            removed |= tenant.entries.remove(*id).is_some();
        }
        if removed { state.touch() } else { Ok(()) }
    }

    /// Remove every entry claiming the given working-directory-relative path.
    #[instrument(name = "Hashes::remove_by_path", skip(self))]
    pub fn remove_by_path(&self, rel_path: &str) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let rel = normalize(rel_path);
        let mut state = self.lock();
        let tenant = state.tenant_mut();
        let before = tenant.entries.len();
        tenant
            .entries
            .retain(|_, entry| entry.path.as_deref() != Some(rel.as_str()));
        if tenant.entries.len() != before {
            state.touch()
        } else {
            Ok(())
        }
    }

    /// Drop all tracking for the tenant.
    #[instrument(name = "Hashes::remove_all_for_tenant", skip(self))]
    pub fn remove_all_for_tenant(&self) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let mut state = self.lock();
        let key = state.tenant_key.clone();
        if state.document.tenants.remove(&key).is_some() {
            state.touch()
        } else {
            Ok(())
        }
    }

    /// The stored MD5 (base64) of the artifact at the given path.
    pub fn get_md5(&self, rel_path: &str) -> Option<String> {
        let rel = normalize(rel_path);
        let state = self.lock();
        state.tenant().and_then(|tenant| {
            tenant
                .entries
                .values()
                .find(|entry| entry.path.as_deref() == Some(rel.as_str()))
                .and_then(|entry| entry.md5.clone())
        })
    }

    /// The stored resource MD5 (base64) for the asset whose resource file
    /// lives at the given path.
    pub fn get_resource_md5(&self, rel_path: &str) -> Option<String> {
        let rel = normalize(rel_path);
        let state = self.lock();
        state.tenant().and_then(|tenant| {
            tenant
                .entries
                .values()
                .find(|entry| entry.resource_path.as_deref() == Some(rel.as_str()))
                .and_then(|entry| entry.resource_md5.clone())
        })
    }

    /// Where the resource with the given id is stored, if known.
    pub fn get_path_for_resource(&self, resource_id: &str) -> Option<String> {
        let state = self.lock();
        state
            .tenant()
            .and_then(|tenant| tenant.entries.get(resource_id))
            .and_then(|entry| entry.path.clone())
    }

    /// The full entry for an id, if tracked.
    pub fn get_entry(&self, id: &str) -> Option<HashEntry> {
        let state = self.lock();
        state
            .tenant()
            .and_then(|tenant| tenant.entries.get(id))
            .cloned()
    }

    /// Every resource id the tenant map accounts for: referenced by a
    /// tracked asset, or tracked as a file under `resources/`.
    pub fn known_resource_ids(&self) -> std::collections::HashSet<String> {
        let state = self.lock();
        let mut known = std::collections::HashSet::new();
        if let Some(tenant) = state.tenant() {
            for (id, entry) in &tenant.entries {
                if let Some(resource) = &entry.resource {
                    known.insert(resource.clone());
                }
                if entry
                    .path
                    .as_deref()
                    .is_some_and(|path| path.starts_with("resources/"))
                {
                    known.insert(id.clone());
                }
            }
        }
        known
    }

    /// Every tracked `(id, path)` pair for the tenant.
    pub fn list_files(&self) -> Vec<(String, String)> {
        let state = self.lock();
        state
            .tenant()
            .map(|tenant| {
                tenant
                    .entries
                    .iter()
                    .filter_map(|(id, entry)| Some((id.clone(), entry.path.clone()?)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the local file at `rel_path` counts as modified under `flags`.
    ///
    /// NEW means no entry claims the path. MODIFIED first compares mtimes
    /// (cheap), then falls back to an MD5 comparison; a file whose mtime
    /// changed but whose content didn't gets its stored mtime refreshed so
    /// the next query takes the fast path again.
    #[instrument(name = "Hashes::is_local_modified", skip(self))]
    pub async fn is_local_modified(&self, flags: ModFlags, rel_path: &str) -> Result<bool> {
        if !self.enabled() {
            return Ok(false);
        }
        let rel = normalize(rel_path);
        let (entry_id, entry) = {
            let state = self.lock();
            let found = state.tenant().and_then(|tenant| {
                tenant
                    .entries
                    .iter()
                    .find(|(_, entry)| entry.path.as_deref() == Some(rel.as_str()))
                    .map(|(id, entry)| (id.clone(), entry.clone()))
            });
            match found {
                Some((id, entry)) => (id, entry),
                None => return Ok(flags.new),
            }
        };

        if !flags.modified {
            return Ok(false);
        }

        let abs = self.lock().working_dir.join(&rel);
        let current_mtime = fs::mtime(&abs).await?;
        if current_mtime.is_some() && current_mtime == entry.local_last_modified {
            return Ok(false);
        }

        let current_md5 = fs::hash_file(&abs).await?.to_base64();
        if entry.md5.as_deref() == Some(current_md5.as_str()) {
            // Content unchanged; refresh the stored mtime in place so the
            // fast path works next time. Not a tracked mutation worth its own
            // flush cycle, but it rides along with the next one.
            if let Some(mtime) = current_mtime {
                let mut state = self.lock();
                if let Some(entry) = state.tenant_mut().entries.get_mut(&entry_id) {
                    entry.local_last_modified = Some(mtime);
                }
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Whether the server item counts as modified relative to what was last
    /// observed locally: NEW when untracked, MODIFIED when the revisions
    /// differ.
    pub fn is_remote_modified(&self, flags: ModFlags, item: &Item) -> bool {
        if !self.enabled() {
            return false;
        }
        let Some(id) = item.id() else {
            return flags.new;
        };
        let state = self.lock();
        let Some(entry) = state.tenant().and_then(|tenant| tenant.entries.get(id)) else {
            return flags.new;
        };
        flags.modified && entry.rev.as_deref() != item.rev()
    }

    pub fn last_pull_timestamp(&self, scope: TimestampScope) -> Option<Timestamp> {
        let state = self.lock();
        state
            .tenant()
            .and_then(|tenant| tenant.last_pull.as_ref())
            .and_then(|watermark| watermark.get(scope))
    }

    pub fn set_last_pull_timestamp(&self, scope: TimestampScope, ts: Timestamp) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let mut state = self.lock();
        let tenant = state.tenant_mut();
        tenant.last_pull = Some(Watermark::set(tenant.last_pull.take(), scope, ts));
        state.touch()
    }

    pub fn last_push_timestamp(&self, scope: TimestampScope) -> Option<Timestamp> {
        let state = self.lock();
        state
            .tenant()
            .and_then(|tenant| tenant.last_push.as_ref())
            .and_then(|watermark| watermark.get(scope))
    }

    pub fn set_last_push_timestamp(&self, scope: TimestampScope, ts: Timestamp) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let mut state = self.lock();
        let tenant = state.tenant_mut();
        tenant.last_push = Some(Watermark::set(tenant.last_push.take(), scope, ts));
        state.touch()
    }

    /// Force the current snapshot to disk.
    pub fn flush(&self) -> Result<()> {
        self.lock().flush()
    }
}

impl Drop for Hashes {
    fn drop(&mut self) {
        // Only the last clone flushes; earlier drops leave the shared state
        // to the survivors and the signal hooks.
        if Arc::strong_count(&self.inner) == 1
            && let Ok(mut state) = self.inner.lock()
            && let Err(err) = state.flush()
        {
            warn!(error = ?err, "failed to flush hashes on drop");
        }
    }
}

/// A resource attached to an asset entry.
#[derive(Debug)]
pub struct ResourceLink<'a> {
    pub id: &'a str,
    pub rel_path: &'a str,
    pub md5: Md5,
    pub local_last_modified: Option<Timestamp>,
}

fn normalize(rel_path: &str) -> String {
    rel_path.replace('\\', "/")
}

fn resolve_tenant_key(
    document: &HashesDocument,
    tenant_id: Option<&str>,
    base_url: Option<&str>,
) -> String {
    if let Some(id) = tenant_id {
        return id.to_string();
    }
    if let Some(url) = base_url {
        // Reverse lookup: an earlier session may have stored this tenant
        // under its id while we only know the URL today.
        for (key, tenant) in &document.tenants {
            if tenant.base_urls.iter().any(|stored| stored == url) {
                return key.clone();
            }
        }
        return url.to_string();
    }
    // No tenant identity at all: track under a fixed key so single-tenant
    // setups keep working.
    String::from("default")
}

/// Process-wide flush-on-signal machinery.
///
/// Stores register their shared state here; the first registration installs
/// SIGINT/SIGTERM handlers that flush every still-live store and then
/// re-raise the signal for the default disposition.
mod flush_guard {
    use super::*;

    static REGISTRY: std::sync::OnceLock<DashMap<usize, Weak<Mutex<State>>>> =
        std::sync::OnceLock::new();
    static INSTALL: Once = Once::new();

    pub(super) fn register(state: &Arc<Mutex<State>>) {
        let registry = REGISTRY.get_or_init(DashMap::new);
        registry.insert(Arc::as_ptr(state) as usize, Arc::downgrade(state));

        INSTALL.call_once(|| {
            let signals =
                signal_hook::iterator::Signals::new([signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM]);
            match signals {
                Ok(mut signals) => {
                    std::thread::spawn(move || {
                        if let Some(signal) = signals.forever().next() {
                            flush_all();
                            let _ = signal_hook::low_level::emulate_default_handler(signal);
                        }
                    });
                }
                Err(err) => warn!(error = %err, "failed to install hashes signal hooks"),
            }
        });
    }

    pub(super) fn flush_all() {
        let Some(registry) = REGISTRY.get() else {
            return;
        };
        registry.retain(|_, weak| {
            if let Some(state) = weak.upgrade() {
                if let Ok(mut state) = state.lock()
                    && let Err(err) = state.flush()
                {
                    warn!(error = ?err, "failed to flush hashes on signal");
                }
                true
            } else {
                false
            }
        });
    }
}
