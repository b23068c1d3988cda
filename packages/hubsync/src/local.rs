//! Local store: the on-disk layout of one artifact type.
//!
//! Each JSON artifact type maps a virtual folder below the working directory
//! (`types/`, `content/`, ...) to files named for the artifact id with a
//! type-specific suffix. The store owns naming, reading/writing, directory
//! walking, rename reconciliation, ignore filtering, and conflict variants.
//! Asset binaries have their own layout and live in the assets helper.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use color_eyre::{Result, eyre::Context as _};
use dashmap::DashMap;
use futures::TryStreamExt;
use serde_json::Value;
use tracing::{debug, instrument, trace, warn};

use clients::hub::v1::Item;

use crate::{config::Options, fs, names, sync::ArtifactDescriptor};

/// A lightweight view of one local artifact file, produced by listing.
///
/// Files that fail to parse still yield a proxy (with no id) so flows can
/// surface them instead of silently skipping.
#[derive(Clone, Debug, PartialEq)]
pub struct ProxyItem {
    pub id: Option<String>,
    pub name: Option<String>,
    /// Path relative to the working directory, forward slashes.
    pub rel_path: String,
}

impl ProxyItem {
    /// A displayable identifier for logs and events.
    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .or(self.id.as_deref())
            .unwrap_or(&self.rel_path)
    }
}

/// Filter deciding which files a folder walk surfaces.
///
/// The defaults exclude the engine's own bookkeeping files and common OS
/// litter; user patterns either extend the defaults (additive mode) or
/// replace them.
#[derive(Clone, Debug)]
pub struct IgnoreFilter {
    patterns: Vec<String>,
}

impl IgnoreFilter {
    const DEFAULTS: &'static [&'static str] = &[
        crate::hashes::HASHES_FILE,
        crate::hashes::LEGACY_HASHES_FILE,
        crate::config::OPTIONS_FILE,
        "*.partial",
        ".DS_Store",
        "Thumbs.db",
        ".git",
    ];

    pub fn from_options(options: &Options) -> Self {
        let user = options.ignore_patterns();
        let patterns = if options.ignore_additive() || user.is_empty() {
            Self::DEFAULTS
                .iter()
                .map(|s| s.to_string())
                .chain(user)
                .collect()
        } else {
            user
        };
        Self { patterns }
    }

    /// Whether the file at the given working-directory-relative path is
    /// ignored. Matches any single path component, or a `*.suffix` glob on
    /// the file name.
    pub fn matches(&self, rel_path: &str) -> bool {
        let file_name = rel_path.rsplit('/').next().unwrap_or(rel_path);
        self.patterns.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('*') {
                return file_name.ends_with(suffix);
            }
            rel_path.split('/').any(|component| component == pattern)
        })
    }
}

/// The filesystem home of one artifact type.
#[derive(Debug)]
pub struct LocalStore {
    working_dir: PathBuf,
    descriptor: &'static ArtifactDescriptor,
    /// Folder below the working directory; empty when `noVirtualFolder`
    /// collapses the layout for single-type workflows.
    folder: String,
    ignore: IgnoreFilter,
    cache: Option<DashMap<String, Item>>,
}

impl LocalStore {
    pub fn new(
        working_dir: impl Into<PathBuf>,
        descriptor: &'static ArtifactDescriptor,
        options: &Options,
    ) -> Self {
        let folder = if options.no_virtual_folder() {
            String::new()
        } else {
            descriptor.folder_name.to_string()
        };
        Self::with_folder(working_dir, descriptor, folder, options)
    }

    /// Construct with an explicit folder, used for site-scoped types whose
    /// folder embeds a site id (`sites/<siteId>/pages`).
    pub fn with_folder(
        working_dir: impl Into<PathBuf>,
        descriptor: &'static ArtifactDescriptor,
        folder: String,
        options: &Options,
    ) -> Self {
        Self {
            working_dir: working_dir.into(),
            descriptor,
            folder,
            ignore: IgnoreFilter::from_options(options),
            cache: None,
        }
    }

    /// Enable the per-operation read cache. Flows that re-read the same
    /// files across stages (push retry passes, rename reconciliation) turn
    /// this on for their lifetime.
    pub fn with_read_cache(mut self) -> Self {
        self.cache = Some(DashMap::new());
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// The absolute folder this store scans.
    pub fn folder_path(&self) -> PathBuf {
        if self.folder.is_empty() {
            self.working_dir.clone()
        } else {
            self.working_dir.join(&self.folder)
        }
    }

    /// The working-directory-relative path an item is stored at.
    pub fn item_rel_path(&self, item: &Item) -> Result<String> {
        let file_name =
            names::item_file_name(item.id(), item.name(), self.descriptor.extension)?;
        Ok(self.join_rel(&file_name))
    }

    fn join_rel(&self, file_name: &str) -> String {
        if self.folder.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{file_name}", self.folder)
        }
    }

    fn abs(&self, rel_path: &str) -> PathBuf {
        self.working_dir.join(rel_path)
    }

    /// Read and parse the item stored at the given relative path.
    #[instrument(name = "LocalStore::read_item", skip(self))]
    pub async fn read_item(&self, rel_path: &str) -> Result<Item> {
        if let Some(cache) = &self.cache
            && let Some(hit) = cache.get(rel_path)
        {
            trace!(rel_path, "read cache hit");
            return Ok(hit.value().clone());
        }
        let content = fs::must_read_buffered(&self.abs(rel_path)).await?;
        let item = serde_json::from_slice::<Item>(&content)
            .with_context(|| format!("parse artifact file: {rel_path}"))?;
        if let Some(cache) = &self.cache {
            cache.insert(rel_path.to_string(), item.clone());
        }
        Ok(item)
    }

    /// Persist an item to its canonical path, returning that path.
    ///
    /// Server-only fields named by the descriptor are stripped first. When an
    /// `id_map` from [`LocalStore::build_id_map`] is supplied, files left at
    /// stale paths by a local rename of the same id are removed so each id
    /// keeps exactly one file.
    pub async fn write_item(
        &self,
        item: &Item,
        id_map: Option<&HashMap<String, Vec<String>>>,
    ) -> Result<String> {
        let rel_path = self.item_rel_path(item)?;
        self.write_item_at(item, &rel_path, id_map).await?;
        Ok(rel_path)
    }

    /// Persist an item to an explicit path. Push flows write server metadata
    /// back to the file the push was read from rather than the id-canonical
    /// name, so a user's chosen filename survives a round trip.
    #[instrument(name = "LocalStore::write_item_at", skip(self, item, id_map), fields(label = item.label()))]
    pub async fn write_item_at(
        &self,
        item: &Item,
        rel_path: &str,
        id_map: Option<&HashMap<String, Vec<String>>>,
    ) -> Result<()> {
        if let (Some(id), Some(id_map)) = (item.id(), id_map) {
            self.reconcile_renames(id, rel_path, id_map).await?;
        }

        let pruned = self.prune(item);
        let content = serde_json::to_vec_pretty(&pruned).context("serialize artifact")?;
        fs::write(&self.abs(rel_path), content).await?;
        if let Some(cache) = &self.cache {
            cache.insert(rel_path.to_string(), pruned);
        }
        Ok(())
    }

    /// Persist the server's copy of a conflicting item next to the local
    /// file. Conflict files are advisory: hashes are not updated for them.
    #[instrument(name = "LocalStore::write_conflict", skip(self, item), fields(label = item.label()))]
    pub async fn write_conflict(&self, item: &Item, rel_path: &str) -> Result<String> {
        let conflict_rel = format!("{rel_path}{}", names::CONFLICT_SUFFIX);
        let pruned = self.prune(item);
        let content = serde_json::to_vec_pretty(&pruned).context("serialize artifact")?;
        fs::write(&self.abs(&conflict_rel), content).await?;
        Ok(conflict_rel)
    }

    /// Delete the file for an item, pruning directories it leaves empty.
    /// Returns the removed relative path, or `None` when no file existed.
    #[instrument(name = "LocalStore::delete_item", skip(self, item), fields(label = item.label()))]
    pub async fn delete_item(&self, item: &Item) -> Result<Option<String>> {
        let rel_path = self.item_rel_path(item)?;
        self.delete_path(&rel_path).await
    }

    /// Delete the file at the given relative path, pruning empty parents.
    pub async fn delete_path(&self, rel_path: &str) -> Result<Option<String>> {
        let abs = self.abs(rel_path);
        if !fs::exists(&abs).await {
            return Ok(None);
        }
        fs::remove_file(&abs).await?;
        if let Some(cache) = &self.cache {
            cache.remove(rel_path);
        }
        if let Some(parent) = abs.parent() {
            fs::prune_empty_dirs(parent, &self.folder_path()).await?;
        }
        Ok(Some(rel_path.to_string()))
    }

    /// Map every id found under the virtual folder to the relative paths of
    /// the files claiming it. Push flows build this once per batch and feed
    /// it to [`LocalStore::write_item`] so renames reconcile in O(1) per
    /// item.
    #[instrument(name = "LocalStore::build_id_map", skip(self))]
    pub async fn build_id_map(&self) -> Result<HashMap<String, Vec<String>>> {
        let mut map = HashMap::<String, Vec<String>>::new();
        for proxy in self.list_names().await? {
            if let Some(id) = proxy.id {
                map.entry(id).or_default().push(proxy.rel_path);
            }
        }
        Ok(map)
    }

    async fn reconcile_renames(
        &self,
        id: &str,
        intended_rel: &str,
        id_map: &HashMap<String, Vec<String>>,
    ) -> Result<()> {
        let Some(paths) = id_map.get(id) else {
            return Ok(());
        };
        for stale_rel in paths {
            if stale_rel == intended_rel {
                continue;
            }
            // The map may be stale by the time this item is written; confirm
            // the file still claims the id before removing it.
            match self.read_item(stale_rel).await {
                Ok(current) if current.id() == Some(id) => {
                    debug!(id, stale = %stale_rel, "removing renamed duplicate");
                    self.delete_path(stale_rel).await?;
                }
                Ok(_) => trace!(id, stale = %stale_rel, "path reassigned, leaving in place"),
                Err(err) => {
                    warn!(id, stale = %stale_rel, error = ?err, "could not confirm stale file")
                }
            }
        }
        Ok(())
    }

    /// List every artifact file under the virtual folder as a proxy item.
    #[instrument(name = "LocalStore::list_names", skip(self))]
    pub async fn list_names(&self) -> Result<Vec<ProxyItem>> {
        let folder = self.folder_path();
        let files = fs::walk_files(&folder).try_collect::<Vec<_>>().await?;

        let mut proxies = Vec::new();
        for path in files {
            let Some(rel_path) = self.relative(&path) else {
                continue;
            };
            if !rel_path.ends_with(self.descriptor.extension)
                || rel_path.ends_with(names::CONFLICT_SUFFIX)
                || self.ignore.matches(&rel_path)
            {
                continue;
            }
            proxies.push(self.proxy_for(&path, rel_path).await);
        }
        proxies.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        Ok(proxies)
    }

    async fn proxy_for(&self, path: &Path, rel_path: String) -> ProxyItem {
        let fallback_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.trim_end_matches(self.descriptor.extension).to_string());
        match self.read_item(&rel_path).await {
            Ok(item) => ProxyItem {
                id: item.id().map(str::to_string),
                name: item.name().map(str::to_string).or(fallback_name),
                rel_path,
            },
            Err(err) => {
                warn!(%rel_path, error = ?err, "unparseable artifact file");
                ProxyItem {
                    id: None,
                    name: fallback_name,
                    rel_path,
                }
            }
        }
    }

    fn relative(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.working_dir)
            .ok()
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
    }

    fn prune(&self, item: &Item) -> Item {
        if self.descriptor.pruned_fields.is_empty() {
            return item.clone();
        }
        let mut pruned = item.clone();
        for field in self.descriptor.pruned_fields {
            pruned.0.remove(*field);
        }
        pruned
    }
}

/// Strip server-only fields from a raw JSON value in place. Shared with the
/// assets helper, which prunes sidecar metadata without a full store.
pub fn prune_fields(value: &mut Value, fields: &[&str]) {
    if let Value::Object(map) = value {
        for field in fields {
            map.remove(*field);
        }
    }
}
