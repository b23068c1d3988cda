//! The assets helper: binary artifacts and their resources.
//!
//! Assets differ from every other artifact type in three ways. They have two
//! on-disk forms (content assets carry a JSON sidecar next to the binary,
//! web assets are the file itself), they reference a separately addressable
//! Resource whose id derives from content, and their endpoint cannot address
//! items by path, so path lookups scan pages. Pulls stream into a staging
//! file and only rename it into place once the MD5 matches the server
//! digest; pushes stream the binary and then settle the metadata document.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use color_eyre::{
    Result,
    eyre::{Context as _, ContextCompat as _, bail, eyre},
};
use futures::TryStreamExt;
use jiff::Timestamp;
use lazy_regex::regex::Regex;
use tracing::{debug, instrument, warn};

use clients::hub::v1::{Item, PushAssetParams, ResourceId, SearchRequest};

use crate::{
    config::Options,
    events::Event,
    fs,
    hashes::{Hashes, ModFlags, ResourceLink, TimestampScope},
    local::{IgnoreFilter, ProxyItem, prune_fields},
    manifest::{Manifest, ManifestStore},
    names,
    pager::{ChunkOutcome, PageBounds, each_page},
    remote::RemoteAssetStore,
    retry::{self, RetryItem, RetryPolicy},
    sync::{DeleteRetry, SyncContext, artifacts},
    throttle::{Outcome, settle},
};

pub use crate::sync::helper::FlowSummary;

/// The virtual folder asset binaries live under.
pub const ASSETS_FOLDER: &str = "assets";

/// Which asset sub-kinds an invocation covers. Watermarks are kept per
/// sub-kind so a scoped pull does not invalidate the other kind's window.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AssetScope {
    Both,
    WebAssets,
    ContentAssets,
}

impl AssetScope {
    fn from_options(options: &Options) -> Self {
        match options.asset_types() {
            Some("webassets") => AssetScope::WebAssets,
            Some("contentassets") => AssetScope::ContentAssets,
            _ => AssetScope::Both,
        }
    }

    fn admits(self, kind: AssetKind) -> bool {
        match self {
            AssetScope::Both => true,
            AssetScope::WebAssets => kind == AssetKind::Web,
            AssetScope::ContentAssets => kind == AssetKind::Content,
        }
    }

    fn timestamp_scope(self) -> TimestampScope {
        match self {
            AssetScope::Both => TimestampScope::All,
            AssetScope::WebAssets => TimestampScope::WebAssets,
            AssetScope::ContentAssets => TimestampScope::ContentAssets,
        }
    }
}

/// Content assets live under the reserved `dxdam/` tree and carry a sidecar;
/// web assets are bare binaries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AssetKind {
    Web,
    Content,
}

impl AssetKind {
    pub fn of_virtual_path(path: &str) -> Self {
        if names::is_content_asset_path(path) {
            AssetKind::Content
        } else {
            AssetKind::Web
        }
    }

    fn is_managed(self) -> bool {
        self == AssetKind::Content
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Scope {
    All,
    Modified,
    Manifest,
}

/// Sync flows for assets and resources.
pub struct AssetsHelper<R> {
    remote: R,
    working_dir: PathBuf,
    hashes: Hashes,
    manifests: ManifestStore,
    options: Options,
    ignore: IgnoreFilter,
}

impl<R: RemoteAssetStore> AssetsHelper<R> {
    pub fn new(
        remote: R,
        working_dir: impl Into<PathBuf>,
        hashes: Hashes,
        options: Options,
    ) -> Self {
        let working_dir = working_dir.into();
        let manifests = ManifestStore::new(&working_dir);
        let ignore = IgnoreFilter::from_options(&options);
        Self {
            remote,
            working_dir,
            hashes,
            manifests,
            options,
            ignore,
        }
    }

    pub fn hashes(&self) -> &Hashes {
        &self.hashes
    }

    fn scope(&self) -> AssetScope {
        AssetScope::from_options(&self.options)
    }

    fn concurrency(&self) -> usize {
        self.options
            .concurrent_limit("assets", artifacts::ASSETS.default_concurrency)
    }

    fn bounds(&self) -> PageBounds {
        PageBounds {
            offset: self.options.page_offset("assets"),
            limit: self.options.page_limit("assets"),
        }
    }

    fn policy(&self) -> RetryPolicy {
        self.options.retry_policy()
    }

    fn assets_root(&self) -> PathBuf {
        if self.options.no_virtual_folder() {
            self.working_dir.clone()
        } else {
            self.working_dir.join(ASSETS_FOLDER)
        }
    }

    fn folder_prefix(&self) -> String {
        if self.options.no_virtual_folder() {
            String::new()
        } else {
            format!("{ASSETS_FOLDER}/")
        }
    }

    /// The working-directory-relative binary path for a server item,
    /// inserting the draft marker for draft variants.
    fn binary_rel_path(&self, item: &Item) -> Result<String> {
        let path = item
            .path()
            .ok_or_else(|| eyre!("asset {} has no path", item.label()))?;
        let virtual_path = names::virtual_path(path);
        let decorated = if item.is_draft() {
            names::draft_file_name(virtual_path)
        } else {
            virtual_path.to_string()
        };
        Ok(format!("{}{decorated}", self.folder_prefix()))
    }

    /// The server path for a local binary: folder prefix stripped, draft
    /// marker undone, leading slash restored.
    fn virtual_path_of(&self, rel_path: &str) -> Option<String> {
        let below = rel_path.strip_prefix(&self.folder_prefix())?;
        let ready = names::ready_file_name(below).unwrap_or_else(|| below.to_string());
        Some(format!("/{ready}"))
    }

    fn kind_of_rel(&self, rel_path: &str) -> AssetKind {
        match rel_path.strip_prefix(&self.folder_prefix()) {
            Some(below) => AssetKind::of_virtual_path(below),
            None => AssetKind::Web,
        }
    }

    /// Whether the ready/draft/path filters and the sub-kind scope admit
    /// this item.
    fn accepts(&self, item: &Item) -> bool {
        let Some(path) = item.path() else {
            return false;
        };
        if !self.scope().admits(AssetKind::of_virtual_path(path)) {
            return false;
        }
        let ready = self.options.filter_ready();
        let draft = self.options.filter_draft();
        if ready && !draft && item.is_draft() {
            return false;
        }
        if draft && !ready && !item.is_draft() {
            return false;
        }
        if let Some(prefix) = self.options.filter_path()
            && !names::virtual_path(path).starts_with(names::virtual_path(prefix))
        {
            return false;
        }
        true
    }

    // ------------------------------------------------------------------
    // listing
    // ------------------------------------------------------------------

    /// Every local asset binary the scope admits. Sidecar metadata files and
    /// staging litter are never listed; the binary represents the asset.
    #[instrument(name = "AssetsHelper::list_local", skip(self))]
    pub async fn list_local(&self) -> Result<Vec<ProxyItem>> {
        let root = self.assets_root();
        let files = fs::walk_files(&root).try_collect::<Vec<_>>().await?;

        let mut proxies = Vec::new();
        for path in files {
            let Some(rel_path) = self.relative(&path) else {
                continue;
            };
            if names::is_metadata_file_name(&rel_path)
                || rel_path.ends_with(names::CONFLICT_SUFFIX)
                || self.ignore.matches(&rel_path)
            {
                continue;
            }
            if !self.scope().admits(self.kind_of_rel(&rel_path)) {
                continue;
            }
            let id = self.sidecar_item(&rel_path).await.and_then(|item| {
                item.id().map(str::to_string)
            });
            let name = rel_path.rsplit('/').next().map(str::to_string);
            proxies.push(ProxyItem { id, name, rel_path });
        }
        proxies.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        Ok(proxies)
    }

    /// Local binaries whose content or sidecar changed against the hashes
    /// store; with the deleted flag, tracked assets whose files are gone.
    #[instrument(name = "AssetsHelper::list_modified_local", skip(self))]
    pub async fn list_modified_local(&self, flags: ModFlags) -> Result<Vec<ProxyItem>> {
        let mut modified = Vec::new();
        for proxy in self.list_local().await? {
            if self.is_asset_modified(flags, &proxy.rel_path).await? {
                modified.push(proxy);
            }
        }
        if flags.deleted {
            for (id, rel_path) in self.hashes.list_files() {
                if !rel_path.starts_with(&self.folder_prefix()) {
                    continue;
                }
                if names::is_metadata_file_name(&rel_path) {
                    continue;
                }
                if !fs::exists(&self.working_dir.join(&rel_path)).await {
                    modified.push(ProxyItem {
                        id: Some(id),
                        name: None,
                        rel_path,
                    });
                }
            }
        }
        Ok(modified)
    }

    async fn is_asset_modified(&self, flags: ModFlags, rel_path: &str) -> Result<bool> {
        match self.kind_of_rel(rel_path) {
            // Web assets are tracked by their binary path directly.
            AssetKind::Web => self.hashes.is_local_modified(flags, rel_path).await,
            // Content assets track the sidecar as the entry path and the
            // binary through the resource MD5.
            AssetKind::Content => {
                let sidecar = names::metadata_file_name(rel_path);
                if self.hashes.is_local_modified(flags, &sidecar).await? {
                    return Ok(true);
                }
                let Some(stored) = self.hashes.get_resource_md5(rel_path) else {
                    return Ok(flags.new);
                };
                if !flags.modified {
                    return Ok(false);
                }
                let current = fs::hash_file(&self.working_dir.join(rel_path)).await?;
                Ok(stored != current.to_base64())
            }
        }
    }

    /// Every remote asset the filters admit, fully paged.
    #[instrument(name = "AssetsHelper::list_remote", skip(self))]
    pub async fn list_remote(&self) -> Result<Vec<Item>> {
        each_page(
            self.bounds(),
            false,
            move |bounds| self.remote.get_items(bounds.offset, bounds.limit),
            move |chunk| async move {
                let size = chunk.len();
                let produced = chunk
                    .into_iter()
                    .filter(|item| self.accepts(item))
                    .collect();
                Ok(ChunkOutcome {
                    size,
                    removed: 0,
                    produced,
                })
            },
        )
        .await
    }

    /// Remote assets modified since the last pull watermark for the current
    /// sub-kind scope; with the deleted flag, tombstones for tracked ids the
    /// server no longer has.
    #[instrument(name = "AssetsHelper::list_modified_remote", skip(self))]
    pub async fn list_modified_remote(&self, flags: ModFlags) -> Result<Vec<Item>> {
        let since = self
            .hashes
            .last_pull_timestamp(self.scope().timestamp_scope());
        let mut items = each_page(
            self.bounds(),
            false,
            move |bounds| self.list_page(since, bounds),
            move |chunk| async move {
                let size = chunk.len();
                let produced = chunk
                    .into_iter()
                    .filter(|item| self.accepts(item))
                    .filter(|item| self.hashes.is_remote_modified(flags, item))
                    .collect();
                Ok(ChunkOutcome {
                    size,
                    removed: 0,
                    produced,
                })
            },
        )
        .await?;

        if flags.deleted {
            let remote_ids = self
                .list_remote()
                .await?
                .iter()
                .filter_map(|item| item.id().map(str::to_string))
                .collect::<HashSet<_>>();
            for (id, rel_path) in self.hashes.list_files() {
                if rel_path.starts_with(&self.folder_prefix()) && !remote_ids.contains(&id) {
                    let mut tombstone = Item::default();
                    tombstone.set_id(id);
                    tombstone.set_path(rel_path);
                    items.push(tombstone);
                }
            }
        }
        Ok(items)
    }

    async fn list_page(&self, since: Option<Timestamp>, bounds: PageBounds) -> Result<Vec<Item>> {
        match since {
            Some(since) => {
                self.remote
                    .get_modified_items(&since.to_string(), bounds.offset, bounds.limit)
                    .await
            }
            None => self.remote.get_items(bounds.offset, bounds.limit).await,
        }
    }

    /// List remote assets matching a path pattern through the search index.
    ///
    /// The search service takes a prefix filter (slashes escaped); the exact
    /// glob semantics (`*` never crossing a slash, unless `recursive` allows
    /// arbitrary descendants) are enforced by a post-filter here.
    #[instrument(name = "AssetsHelper::list_remote_by_path", skip(self))]
    pub async fn list_remote_by_path(&self, pattern: &str, recursive: bool) -> Result<Vec<Item>> {
        let pattern = format!("/{}", names::virtual_path(pattern));
        let prefix = &pattern[..pattern.find('*').unwrap_or(pattern.len())];
        let matcher = path_pattern_regex(&pattern, recursive)?;

        let mut fq = vec![String::from("classification:asset")];
        if !prefix.is_empty() {
            fq.push(format!("path:{}*", prefix.replace('/', "\\/")));
        }
        match self.scope() {
            AssetScope::WebAssets => fq.push(String::from("isManaged:false")),
            AssetScope::ContentAssets => fq.push(String::from("isManaged:true")),
            AssetScope::Both => {}
        }

        each_page(
            self.bounds(),
            false,
            move |bounds| {
                let request = SearchRequest::builder()
                    .fq(fq.clone())
                    .offset(bounds.offset)
                    .limit(bounds.limit)
                    .build();
                async move {
                    let page = self.remote.search(&request).await?;
                    Ok(page.documents)
                }
            },
            move |chunk| {
                let matcher = matcher.clone();
                async move {
                    let size = chunk.len();
                    let produced = chunk
                        .into_iter()
                        .filter(|item| self.accepts(item))
                        .filter(|item| item.path().is_some_and(|path| matcher.is_match(path)))
                        .collect();
                    Ok(ChunkOutcome {
                        size,
                        removed: 0,
                        produced,
                    })
                }
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // pull
    // ------------------------------------------------------------------

    /// Pull every remote asset the scope admits, then decoupled resources.
    pub async fn pull_all(&self, ctx: &SyncContext) -> Result<FlowSummary> {
        self.pull_with(ctx, Scope::All).await
    }

    /// Pull remote assets modified since the sub-kind's watermark.
    pub async fn pull_modified(&self, ctx: &SyncContext) -> Result<FlowSummary> {
        self.pull_with(ctx, Scope::Modified).await
    }

    /// Pull exactly the assets the input manifest names.
    #[instrument(name = "AssetsHelper::pull_by_manifest", skip(self, ctx))]
    pub async fn pull_by_manifest(&self, ctx: &SyncContext) -> Result<FlowSummary> {
        let start_errors = ctx.error_count();
        let manifest = self.read_input_manifest().await?;
        let ids = manifest.section_ids("assets");

        let mut items = Vec::new();
        for chunk in ids.chunks(self.bounds().limit.max(1) as usize) {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let tasks = chunk
                .iter()
                .map(|id| self.pull_one(ctx, id.clone()))
                .collect::<Vec<_>>();
            for outcome in settle(self.concurrency(), tasks).await {
                if let Some(Some(item)) = outcome.fulfilled() {
                    items.push(item);
                }
            }
        }

        self.record_output_manifest(&items).await?;
        Ok(FlowSummary {
            items,
            errors: ctx.error_count() - start_errors,
        })
    }

    /// Pull a single asset by id.
    pub async fn pull_item(&self, ctx: &SyncContext, id: &str) -> Result<Option<Item>> {
        self.pull_one(ctx, id.to_string()).await
    }

    /// Pull a single asset by its virtual path.
    ///
    /// The assets endpoint has no get-by-path, so this scans pages linearly
    /// until the path matches or the listing is exhausted; cost grows with
    /// the tenant's asset count.
    #[instrument(name = "AssetsHelper::pull_by_path", skip(self, ctx))]
    pub async fn pull_by_path(&self, ctx: &SyncContext, path: &str) -> Result<Option<Item>> {
        let wanted = format!("/{}", names::virtual_path(path));
        let mut bounds = self.bounds();
        loop {
            let chunk = self
                .remote
                .get_items(bounds.offset, bounds.limit)
                .await?;
            let size = chunk.len();
            if let Some(item) = chunk.into_iter().find(|item| {
                item.path()
                    .is_some_and(|p| format!("/{}", names::virtual_path(p)) == wanted)
            }) {
                return self.pull_task(ctx, item).await.map(Some);
            }
            if (size as u64) < bounds.limit {
                return Ok(None);
            }
            bounds.offset += bounds.limit;
        }
    }

    async fn pull_one(&self, ctx: &SyncContext, id: String) -> Result<Option<Item>> {
        let fetched = match self.remote.get_item(&id).await {
            Ok(item) => item,
            Err(err) => {
                ctx.events.emit(Event::PulledError {
                    id: id.clone(),
                    error: format!("{err:#}"),
                });
                ctx.record_error();
                return Err(err);
            }
        };
        let Some(item) = fetched else {
            debug!(id, "asset not found on server");
            return Ok(None);
        };
        self.pull_task(ctx, item).await.map(Some)
    }

    #[instrument(name = "AssetsHelper::pull_with", skip(self, ctx))]
    async fn pull_with(&self, ctx: &SyncContext, scope: Scope) -> Result<FlowSummary> {
        let start_errors = ctx.error_count();
        let sampled = Timestamp::now();
        let since = match scope {
            Scope::Modified => self
                .hashes
                .last_pull_timestamp(self.scope().timestamp_scope()),
            _ => None,
        };
        let flags = ModFlags::NEW_AND_MODIFIED;

        let items = each_page(
            self.bounds(),
            false,
            move |bounds| self.list_page(since, bounds),
            move |chunk| async move {
                let size = chunk.len();
                if ctx.cancel.is_cancelled() {
                    return Ok(ChunkOutcome {
                        size: 0,
                        removed: 0,
                        produced: Vec::new(),
                    });
                }
                let wanted = chunk
                    .into_iter()
                    .filter(|item| self.accepts(item))
                    .filter(|item| {
                        scope != Scope::Modified || self.hashes.is_remote_modified(flags, item)
                    })
                    .collect::<Vec<_>>();
                let tasks = wanted
                    .into_iter()
                    .map(|item| self.pull_task(ctx, item))
                    .collect::<Vec<_>>();
                let produced = settle(self.concurrency(), tasks)
                    .await
                    .into_iter()
                    .filter_map(Outcome::fulfilled)
                    .collect();
                Ok(ChunkOutcome {
                    size,
                    removed: 0,
                    produced,
                })
            },
        )
        .await?;

        let mut remote_resources = HashSet::new();
        if !self.options.disable_push_pull_resources() && !ctx.cancel.is_cancelled() {
            remote_resources = self.pull_resources(ctx).await?;
        }

        let errors = ctx.error_count() - start_errors;
        if errors == 0 && !self.options.is_filtered() && !ctx.cancel.is_cancelled() {
            self.hashes
                .set_last_pull_timestamp(self.scope().timestamp_scope(), sampled)?;
        }

        // Reconciliation compares local files against the pulled set, so a
        // pull with failures would misreport the failed assets as local-only;
        // only an error-free full pull is trustworthy.
        if scope == Scope::All && errors == 0 && self.options.deletions() {
            self.reconcile_deletions(ctx, &items, &remote_resources)
                .await?;
        }

        self.record_output_manifest(&items).await?;
        Ok(FlowSummary { items, errors })
    }

    /// Pull one asset: stream the binary into a staging file, verify the
    /// digest, rename into place, settle the sidecar, update hashes.
    async fn pull_task(&self, ctx: &SyncContext, item: Item) -> Result<Item> {
        let id = item.id().unwrap_or_default().to_string();
        match self.store_pulled_asset(&item).await {
            Ok(()) => {
                ctx.events.emit(Event::Pulled { item: item.clone() });
                Ok(item)
            }
            Err(err) => {
                ctx.events.emit(Event::PulledError {
                    id,
                    error: format!("{err:#}"),
                });
                ctx.record_error();
                Err(err)
            }
        }
    }

    async fn store_pulled_asset(&self, item: &Item) -> Result<()> {
        let resource_id = item
            .resource()
            .ok_or_else(|| eyre!("asset {} has no resource", item.label()))?
            .to_string();
        let binary_rel = self.binary_rel_path(item)?;
        let binary_abs = self.working_dir.join(&binary_rel);
        let staging = staging_path(&binary_abs);

        let mut writer = fs::create_file(&staging).await?;
        let pulled = self.remote.pull_asset(&resource_id, &mut writer).await?;
        drop(writer);

        // Digest mismatch is a hard integrity failure: the staging file is
        // left on disk for inspection and hashes stay untouched.
        if let Some(digest) = item.digest()
            && digest != pulled.md5.to_base64()
        {
            bail!(
                "digest mismatch for {}: server {digest}, received {}",
                item.label(),
                pulled.md5.to_base64()
            );
        }
        fs::rename(&staging, &binary_abs).await?;

        match self.kind_of_rel(&binary_rel) {
            AssetKind::Web => {
                self.hashes.update(item, &binary_rel, None).await?;
            }
            AssetKind::Content => {
                let sidecar_rel = names::metadata_file_name(&binary_rel);
                let mut sidecar = serde_json::to_value(item).context("serialize asset")?;
                prune_fields(&mut sidecar, artifacts::ASSETS.pruned_fields);
                fs::write(
                    &self.working_dir.join(&sidecar_rel),
                    serde_json::to_vec_pretty(&sidecar).context("serialize sidecar")?,
                )
                .await?;

                let mtime = fs::mtime(&binary_abs).await?;
                let link = ResourceLink {
                    id: &resource_id,
                    rel_path: &binary_rel,
                    md5: pulled.md5,
                    local_last_modified: mtime,
                };
                self.hashes.update(item, &sidecar_rel, Some(link)).await?;
            }
        }
        Ok(())
    }

    /// Pull resources no asset references into `resources/`, returning every
    /// resource id the server reported.
    #[instrument(name = "AssetsHelper::pull_resources", skip(self, ctx))]
    async fn pull_resources(&self, ctx: &SyncContext) -> Result<HashSet<String>> {
        let known = self.hashes.known_resource_ids();
        let known = &known;
        let seen = std::sync::Mutex::new(HashSet::new());
        let seen_ref = &seen;

        each_page(
            self.bounds(),
            false,
            move |bounds| self.remote.get_resources(bounds.offset, bounds.limit),
            move |chunk| async move {
                let size = chunk.len();
                if ctx.cancel.is_cancelled() {
                    return Ok(ChunkOutcome {
                        size: 0,
                        removed: 0,
                        produced: Vec::new(),
                    });
                }
                let wanted = chunk
                    .into_iter()
                    .filter_map(|resource| resource.id().map(str::to_string))
                    .inspect(|id| {
                        seen_ref.lock().expect("seen mutex poisoned").insert(id.clone());
                    })
                    .filter(|id| !known.contains(id))
                    .collect::<Vec<_>>();
                let tasks = wanted
                    .into_iter()
                    .map(|id| self.pull_resource_task(ctx, id))
                    .collect::<Vec<_>>();
                settle(self.concurrency(), tasks).await;
                Ok(ChunkOutcome {
                    size,
                    removed: 0,
                    produced: Vec::<()>::new(),
                })
            },
        )
        .await?;

        Ok(seen.into_inner().expect("seen mutex poisoned"))
    }

    async fn pull_resource_task(&self, ctx: &SyncContext, id: String) -> Result<()> {
        match self.store_pulled_resource(&id).await {
            Ok(()) => {
                ctx.events.emit(Event::ResourcePulled { id });
                Ok(())
            }
            Err(err) => {
                ctx.events.emit(Event::ResourcePulledError {
                    id,
                    error: format!("{err:#}"),
                });
                ctx.record_error();
                Err(err)
            }
        }
    }

    async fn store_pulled_resource(&self, id: &str) -> Result<()> {
        let resource_id = ResourceId::new(id);
        // The final filename comes from the server's disposition header, so
        // stream to a staging file in the resource directory first.
        let dir_rel = names::resource_relative_path(&resource_id, "download");
        let dir_abs = self
            .working_dir
            .join(dir_rel.parent().expect("resource path has a parent"));
        let staging = staging_path(&dir_abs.join("download"));

        let mut writer = fs::create_file(&staging).await?;
        let pulled = self.remote.pull_asset(id, &mut writer).await?;
        drop(writer);

        let file_name = pulled
            .filename
            .clone()
            .map(|name| names::sanitize_file_name(&name))
            .unwrap_or_else(|| String::from("download"));
        let final_abs = dir_abs.join(&file_name);
        fs::rename(&staging, &final_abs).await?;

        let rel = names::resource_relative_path(&resource_id, &file_name)
            .to_string_lossy()
            .replace('\\', "/");
        let mut entry = Item::default();
        entry.set_id(id);
        self.hashes.update(&entry, &rel, None).await?;
        Ok(())
    }

    /// Emit `local-only` events for assets and resources the full pull did
    /// not see. The engine never deletes local files during a pull.
    async fn reconcile_deletions(
        &self,
        ctx: &SyncContext,
        pulled: &[Item],
        remote_resources: &HashSet<String>,
    ) -> Result<()> {
        let remote_paths = pulled
            .iter()
            .filter_map(|item| self.binary_rel_path(item).ok())
            .collect::<HashSet<_>>();

        let mut local_only = Vec::new();
        for proxy in self.list_local().await? {
            if !remote_paths.contains(&proxy.rel_path) {
                let mut item = Item::default();
                if let Some(id) = &proxy.id {
                    item.set_id(id.clone());
                }
                item.set_path(proxy.rel_path.clone());
                ctx.events.emit(Event::LocalOnly { item: item.clone() });
                local_only.push(item);
            }
        }

        if !self.options.disable_push_pull_resources() {
            for (id, rel_path) in self.hashes.list_files() {
                if rel_path.starts_with(names::RESOURCES_FOLDER)
                    && !remote_resources.contains(&id)
                {
                    ctx.events.emit(Event::ResourceLocalOnly { id });
                }
            }
        }

        if let Some(name) = self.options.deletions_manifest()
            && !local_only.is_empty()
        {
            self.record_manifest(name, &local_only).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // push
    // ------------------------------------------------------------------

    /// Push every local asset, ready variants before drafts, then decoupled
    /// resources.
    pub async fn push_all(&self, ctx: &SyncContext) -> Result<FlowSummary> {
        self.push_with(ctx, Scope::All).await
    }

    /// Push local assets that changed since they were last synced.
    pub async fn push_modified(&self, ctx: &SyncContext) -> Result<FlowSummary> {
        self.push_with(ctx, Scope::Modified).await
    }

    /// Push exactly the assets the input manifest names.
    pub async fn push_by_manifest(&self, ctx: &SyncContext) -> Result<FlowSummary> {
        self.push_with(ctx, Scope::Manifest).await
    }

    /// Push the single binary at the given working-directory-relative path,
    /// driving its backoff loop to completion.
    pub async fn push_path(&self, ctx: &SyncContext, rel_path: &str) -> Result<Option<Item>> {
        let policy = self.policy();
        let mut attempt = 1;
        loop {
            match self.push_once(ctx, rel_path, attempt, &policy).await {
                Ok(item) => return Ok(item),
                Err(err) => {
                    let Some(retry) = ctx.take_retry_push().into_iter().next() else {
                        return Err(err);
                    };
                    if ctx.cancel.is_cancelled() {
                        return Err(err);
                    }
                    tokio::time::sleep(retry.delay).await;
                    attempt = retry.attempt + 1;
                }
            }
        }
    }

    #[instrument(name = "AssetsHelper::push_with", skip(self, ctx))]
    async fn push_with(&self, ctx: &SyncContext, scope: Scope) -> Result<FlowSummary> {
        let start_errors = ctx.error_count();
        let sampled = Timestamp::now();

        let proxies = match scope {
            Scope::All => self.list_local().await?,
            Scope::Modified => self.list_modified_local(ModFlags::NEW_AND_MODIFIED).await?,
            Scope::Manifest => {
                let manifest = self.read_input_manifest().await?;
                let wanted = manifest
                    .section_ids("assets")
                    .into_iter()
                    .collect::<HashSet<_>>();
                self.list_local()
                    .await?
                    .into_iter()
                    .filter(|proxy| proxy.id.as_ref().is_some_and(|id| wanted.contains(id)))
                    .collect()
            }
        };

        // The ready batch completes (including its retries) before any draft
        // is pushed: drafts are variants of a ready asset and the server
        // wants the base to exist first.
        let (draft, ready): (Vec<_>, Vec<_>) = proxies
            .into_iter()
            .partition(|proxy| names::is_draft_file_name(&proxy.rel_path));

        let mut items = self.push_batch(ctx, ready).await;
        if !ctx.cancel.is_cancelled() {
            items.extend(self.push_batch(ctx, draft).await);
        }

        if scope != Scope::Manifest
            && !self.options.disable_push_pull_resources()
            && !ctx.cancel.is_cancelled()
        {
            self.push_resources(ctx, scope).await?;
        }

        let errors = ctx.error_count() - start_errors;
        if errors == 0
            && scope != Scope::Manifest
            && !self.options.is_filtered()
            && !ctx.cancel.is_cancelled()
        {
            self.hashes
                .set_last_push_timestamp(self.scope().timestamp_scope(), sampled)?;
        }

        self.record_output_manifest(&items).await?;
        Ok(FlowSummary { items, errors })
    }

    /// Run one batch through the throttler, then drive the retry list: a
    /// pass with zero successes fails the remaining retries.
    async fn push_batch(&self, ctx: &SyncContext, proxies: Vec<ProxyItem>) -> Vec<Item> {
        let policy = self.policy();
        let concurrency = self.concurrency();

        let tasks = proxies
            .iter()
            .map(|proxy| self.push_once(ctx, &proxy.rel_path, 1, &policy))
            .collect::<Vec<_>>();
        let outcomes = settle(concurrency, tasks).await;
        let mut items = outcomes
            .into_iter()
            .filter_map(Outcome::fulfilled)
            .flatten()
            .collect::<Vec<_>>();

        // Same gate as the generic helper: only a batch that made some
        // progress earns retry passes; queued items then re-enter until
        // their attempts run out.
        let batch_progressed = !items.is_empty();
        loop {
            let retries = ctx.take_retry_push();
            if retries.is_empty() {
                break;
            }
            if !batch_progressed || ctx.cancel.is_cancelled() {
                for retry in retries {
                    ctx.events.emit(Event::PushedError {
                        name: retry.name,
                        error: format!("{:#}", retry.error),
                    });
                    ctx.record_error();
                }
                break;
            }
            debug!(count = retries.len(), "running asset push retry pass");
            let tasks = retries
                .into_iter()
                .map(|retry| {
                    let policy = &policy;
                    async move {
                        tokio::time::sleep(retry.delay).await;
                        self.push_once(ctx, &retry.name, retry.attempt + 1, policy)
                            .await
                    }
                })
                .collect::<Vec<_>>();
            let retried = settle(concurrency, tasks).await;
            items.extend(
                retried
                    .into_iter()
                    .filter_map(Outcome::fulfilled)
                    .flatten(),
            );
        }
        items
    }

    /// One push attempt for one binary.
    async fn push_once(
        &self,
        ctx: &SyncContext,
        rel_path: &str,
        attempt: u32,
        policy: &RetryPolicy,
    ) -> Result<Option<Item>> {
        match self.push_asset_inner(rel_path).await {
            Ok(server) => {
                ctx.events.emit(Event::Pushed {
                    item: server.clone(),
                });
                Ok(Some(server))
            }
            Err(err) => {
                let retriable = retry::is_retriable_push(
                    &err,
                    &self.options.retry_status_codes("assets"),
                    artifacts::ASSETS.transient_push_codes,
                );
                if retriable && policy.allows(attempt) {
                    let delay = policy.delay(attempt);
                    debug!(rel_path, attempt, ?delay, "queueing asset push retry");
                    ctx.add_retry_push(RetryItem {
                        name: rel_path.to_string(),
                        attempt,
                        delay,
                        error: err,
                    });
                    Err(eyre!("push of {rel_path} queued for retry"))
                } else {
                    ctx.events.emit(Event::PushedError {
                        name: rel_path.to_string(),
                        error: format!("{err:#}"),
                    });
                    ctx.record_error();
                    Err(err)
                }
            }
        }
    }

    async fn push_asset_inner(&self, rel_path: &str) -> Result<Item> {
        let kind = self.kind_of_rel(rel_path);
        let draft = names::is_draft_file_name(rel_path);
        let virtual_path = self
            .virtual_path_of(rel_path)
            .ok_or_else(|| eyre!("file {rel_path} is outside the assets folder"))?;
        let binary_abs = self.working_dir.join(rel_path);

        let current_md5 = fs::hash_file(&binary_abs).await?;
        let content_length = fs::metadata(&binary_abs)
            .await?
            .map(|metadata| metadata.len());

        // Sidecar metadata, when present, carries the asset's identity and
        // its previous resource id.
        let sidecar_rel = names::metadata_file_name(rel_path);
        let mut item = if kind == AssetKind::Content {
            self.sidecar_item(rel_path).await
        } else {
            None
        };
        if draft {
            let metadata = item.get_or_insert_with(Item::default);
            metadata
                .0
                .insert("status".into(), serde_json::Value::String("draft".into()));
        }

        // A new resource is only minted when the binary actually changed
        // under a persisting metadata item.
        let stored_md5 = match kind {
            AssetKind::Content => self.hashes.get_resource_md5(rel_path),
            AssetKind::Web => self.hashes.get_md5(rel_path),
        };
        let replace = stored_md5.is_some_and(|stored| stored != current_md5.to_base64());

        let resource_id = item
            .as_ref()
            .and_then(|item| item.resource())
            .filter(|_| !replace)
            .map(ResourceId::new)
            .unwrap_or_else(|| {
                ResourceId::derive(&current_md5, names::virtual_path(&virtual_path))
            });

        let params = PushAssetParams::builder()
            .replace_content_resource(replace)
            .resource_id(resource_id.clone())
            .resource_md5(current_md5)
            .path(virtual_path)
            .maybe_content_length(content_length)
            .maybe_item(item)
            .build();

        let content = fs::open_file(&binary_abs).await?;
        let server = self.remote.push_asset(&params, content).await?;

        match kind {
            AssetKind::Web => {
                self.hashes.update(&server, rel_path, None).await?;
            }
            AssetKind::Content => {
                if self.options.rewrite_on_push() {
                    let mut sidecar = serde_json::to_value(&server).context("serialize asset")?;
                    prune_fields(&mut sidecar, artifacts::ASSETS.pruned_fields);
                    fs::write(
                        &self.working_dir.join(&sidecar_rel),
                        serde_json::to_vec_pretty(&sidecar).context("serialize sidecar")?,
                    )
                    .await?;
                }
                let mtime = fs::mtime(&binary_abs).await?;
                let link = ResourceLink {
                    id: server.resource().unwrap_or(resource_id.as_str()),
                    rel_path,
                    md5: current_md5,
                    local_last_modified: mtime,
                };
                self.hashes.update(&server, &sidecar_rel, Some(link)).await?;
            }
        }
        Ok(server)
    }

    /// Push local resource binaries (under `resources/`) that are new or
    /// changed. These have no metadata document; only the binary travels.
    /// Resources are content-addressed, so an unchanged file is already on
    /// the server under the same id and is skipped in every scope.
    #[instrument(name = "AssetsHelper::push_resources", skip(self, ctx))]
    async fn push_resources(&self, ctx: &SyncContext, _scope: Scope) -> Result<()> {
        let root = self.working_dir.join(names::RESOURCES_FOLDER);
        let files = fs::walk_files(&root).try_collect::<Vec<_>>().await?;

        let mut wanted = Vec::new();
        for path in files {
            let Some(rel_path) = self.relative(&path) else {
                continue;
            };
            if self.ignore.matches(&rel_path) {
                continue;
            }
            if self.hashes.enabled()
                && !self
                    .hashes
                    .is_local_modified(ModFlags::NEW_AND_MODIFIED, &rel_path)
                    .await?
            {
                continue;
            }
            wanted.push(rel_path);
        }

        let tasks = wanted
            .iter()
            .map(|rel_path| self.push_resource_task(ctx, rel_path))
            .collect::<Vec<_>>();
        settle(self.concurrency(), tasks).await;
        Ok(())
    }

    async fn push_resource_task(&self, ctx: &SyncContext, rel_path: &str) -> Result<()> {
        // resources/<shard>/<id>/<name>
        let mut segments = rel_path.split('/');
        let id = segments
            .nth(2)
            .ok_or_else(|| eyre!("unexpected resource layout: {rel_path}"))?
            .to_string();

        match self.push_resource_inner(&id, rel_path).await {
            Ok(()) => {
                ctx.events.emit(Event::ResourcePushed { id });
                Ok(())
            }
            Err(err) => {
                ctx.events.emit(Event::ResourcePushedError {
                    id,
                    error: format!("{err:#}"),
                });
                ctx.record_error();
                Err(err)
            }
        }
    }

    async fn push_resource_inner(&self, id: &str, rel_path: &str) -> Result<()> {
        let abs = self.working_dir.join(rel_path);
        let md5 = fs::hash_file(&abs).await?;
        let content_length = fs::metadata(&abs).await?.map(|metadata| metadata.len());

        let params = PushAssetParams::builder()
            .resource_only(true)
            .resource_id(ResourceId::new(id))
            .resource_md5(md5)
            .path(rel_path.rsplit('/').next().unwrap_or(rel_path))
            .maybe_content_length(content_length)
            .build();
        let content = fs::open_file(&abs).await?;
        self.remote.push_asset(&params, content).await?;

        let mut entry = Item::default();
        entry.set_id(id);
        self.hashes.update(&entry, rel_path, None).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // delete
    // ------------------------------------------------------------------

    /// Delete every remote asset the filters admit, driving reference
    /// rejections to a fixpoint.
    #[instrument(name = "AssetsHelper::delete_all", skip(self, ctx))]
    pub async fn delete_all(&self, ctx: &SyncContext) -> Result<FlowSummary> {
        let start_errors = ctx.error_count();
        let concurrency = self.concurrency();

        let mut items = each_page(
            self.bounds(),
            true,
            move |bounds| self.remote.get_items(bounds.offset, bounds.limit),
            move |chunk| async move {
                let size = chunk.len();
                if ctx.cancel.is_cancelled() {
                    return Ok(ChunkOutcome {
                        size: 0,
                        removed: 0,
                        produced: Vec::new(),
                    });
                }
                let candidates = chunk
                    .into_iter()
                    .filter(|item| self.accepts(item))
                    .collect::<Vec<_>>();
                let tasks = candidates
                    .into_iter()
                    .map(|item| self.delete_task(ctx, item))
                    .collect::<Vec<_>>();
                let produced = settle(concurrency, tasks)
                    .await
                    .into_iter()
                    .filter_map(Outcome::fulfilled)
                    .collect::<Vec<Item>>();
                Ok(ChunkOutcome {
                    removed: produced.len(),
                    size,
                    produced,
                })
            },
        )
        .await?;

        let mut progressed = true;
        loop {
            let retries = ctx.take_retry_delete();
            if retries.is_empty() {
                break;
            }
            if !progressed || ctx.cancel.is_cancelled() {
                for retry in retries {
                    ctx.events.emit(Event::DeletedError {
                        name: retry.item.label().to_string(),
                        error: retry.error,
                    });
                    ctx.record_error();
                }
                break;
            }
            let tasks = retries
                .into_iter()
                .map(|retry| self.delete_task(ctx, retry.item))
                .collect::<Vec<_>>();
            let deleted = settle(concurrency, tasks)
                .await
                .into_iter()
                .filter_map(Outcome::fulfilled)
                .collect::<Vec<_>>();
            progressed = !deleted.is_empty();
            items.extend(deleted);
        }

        if let Some(name) = self.options.deletions_manifest()
            && !items.is_empty()
        {
            self.record_manifest(name, &items).await?;
        }
        Ok(FlowSummary {
            items,
            errors: ctx.error_count() - start_errors,
        })
    }

    /// Delete a single remote asset.
    pub async fn delete_item(&self, ctx: &SyncContext, item: Item) -> Result<Option<Item>> {
        self.delete_task(ctx, item).await.map(Some)
    }

    async fn delete_task(&self, ctx: &SyncContext, item: Item) -> Result<Item> {
        let Some(id) = item.id().map(str::to_string) else {
            let err = eyre!("cannot delete an asset without an id");
            ctx.events.emit(Event::DeletedError {
                name: item.label().to_string(),
                error: format!("{err:#}"),
            });
            ctx.record_error();
            return Err(err);
        };
        match self.remote.delete_item(&id).await {
            Ok(_deleted) => {
                if let Err(err) = self.hashes.remove(&[id.as_str()]) {
                    warn!(id, error = ?err, "failed to drop hashes entry after delete");
                }
                ctx.events.emit(Event::Deleted { item: item.clone() });
                Ok(item)
            }
            Err(err) if retry::is_retriable_delete(&err) => {
                debug!(id, "asset delete rejected on a reference, queueing retry");
                ctx.add_retry_delete(DeleteRetry {
                    item,
                    error: format!("{err:#}"),
                });
                Err(err)
            }
            Err(err) => {
                ctx.events.emit(Event::DeletedError {
                    name: item.label().to_string(),
                    error: format!("{err:#}"),
                });
                ctx.record_error();
                Err(err)
            }
        }
    }

    /// Remove a local asset entirely: the binary, its sidecar if any, and
    /// every hashes claim on either path.
    #[instrument(name = "AssetsHelper::delete_local", skip(self))]
    pub async fn delete_local(&self, rel_path: &str) -> Result<()> {
        let abs = self.working_dir.join(rel_path);
        fs::remove_file(&abs).await?;
        self.hashes.remove_by_path(rel_path)?;

        if self.kind_of_rel(rel_path) == AssetKind::Content {
            let sidecar_rel = names::metadata_file_name(rel_path);
            fs::remove_file(&self.working_dir.join(&sidecar_rel)).await?;
            self.hashes.remove_by_path(&sidecar_rel)?;
        }
        if let Some(parent) = abs.parent() {
            fs::prune_empty_dirs(parent, &self.assets_root()).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // shared bits
    // ------------------------------------------------------------------

    async fn sidecar_item(&self, binary_rel: &str) -> Option<Item> {
        if self.kind_of_rel(binary_rel) != AssetKind::Content {
            return None;
        }
        let sidecar = self.working_dir.join(names::metadata_file_name(binary_rel));
        let content = fs::read_buffered(&sidecar).await.ok().flatten()?;
        match serde_json::from_slice::<Item>(&content) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!(binary_rel, error = %err, "unparseable asset sidecar");
                None
            }
        }
    }

    fn relative(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.working_dir)
            .ok()
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
    }

    async fn read_input_manifest(&self) -> Result<Manifest> {
        let name = self
            .options
            .manifest()
            .context("no input manifest configured")?;
        self.manifests.read(name).await
    }

    async fn record_output_manifest(&self, items: &[Item]) -> Result<()> {
        if let Some(name) = self.options.write_manifest()
            && !items.is_empty()
        {
            self.record_manifest(name, items).await?;
        }
        Ok(())
    }

    async fn record_manifest(&self, name: &str, items: &[Item]) -> Result<()> {
        let mut manifest = match self.manifests.read(name).await {
            Ok(manifest) => manifest,
            Err(_) => Manifest::default(),
        };
        for item in items {
            manifest.append("assets", item);
        }
        self.manifests.write(name, &manifest).await
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut staged = path.as_os_str().to_os_string();
    staged.push(".partial");
    PathBuf::from(staged)
}

/// Translate a path glob into the regex enforcing it: `*` matches within one
/// segment; `recursive` additionally admits any descendant of a match.
fn path_pattern_regex(pattern: &str, recursive: bool) -> Result<Regex> {
    let escaped = pattern
        .split('*')
        .map(lazy_regex::regex::escape)
        .collect::<Vec<_>>()
        .join("([^/]*)");
    let full = if recursive {
        format!("^{escaped}(/.*)?$")
    } else {
        format!("^{escaped}$")
    };
    Regex::new(&full).context("build path pattern")
}
