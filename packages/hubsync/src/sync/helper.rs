//! The per-type sync helper: list, pull, push, delete.
//!
//! One helper instance serves one artifact type against one working
//! directory and one remote store. Flows share a pattern: a paged listing
//! feeds chunks of per-item tasks through the throttler, item failures are
//! classified (fatal, semantic, transient) and either surfaced as events or
//! queued for retry, and the hashes store is updated synchronously after
//! every per-item success.

use std::collections::{HashMap, HashSet};

use color_eyre::{
    Result,
    eyre::{ContextCompat as _, bail, eyre},
};
use jiff::Timestamp;
use tracing::{debug, instrument, warn};

use clients::hub::v1::Item;

use crate::{
    config::Options,
    events::Event,
    fs,
    hashes::{Hashes, ModFlags, TimestampScope},
    local::{LocalStore, ProxyItem},
    manifest::{Manifest, ManifestStore},
    pager::{ChunkOutcome, PageBounds, each_page},
    remote::RemoteItemStore,
    retry::{self, RetryItem, RetryPolicy},
    sync::{ArtifactDescriptor, DeleteRetry, SyncContext},
    throttle::{Outcome, settle},
};

/// What a finished flow produced: the items that succeeded and how many
/// failed. Flows resolve with this instead of erroring once a batch has
/// started.
#[derive(Debug, Default)]
pub struct FlowSummary {
    pub items: Vec<Item>,
    pub errors: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Scope {
    All,
    Modified,
    Manifest,
}

/// Sync flows for one artifact type.
pub struct SyncHelper<R> {
    descriptor: &'static ArtifactDescriptor,
    remote: R,
    local: LocalStore,
    hashes: Hashes,
    manifests: ManifestStore,
    options: Options,
    /// Set for site-scoped types (pages); routes manifest entries under the
    /// owning site.
    site_id: Option<String>,
}

impl<R: RemoteItemStore> SyncHelper<R> {
    pub fn new(
        descriptor: &'static ArtifactDescriptor,
        remote: R,
        local: LocalStore,
        hashes: Hashes,
        options: Options,
    ) -> Self {
        let manifests = ManifestStore::new(local.working_dir());
        Self {
            descriptor,
            remote,
            local,
            hashes,
            manifests,
            options,
            site_id: None,
        }
    }

    /// Scope manifest recording to a site (pages only).
    pub fn for_site(mut self, site_id: impl Into<String>) -> Self {
        self.site_id = Some(site_id.into());
        self
    }

    pub fn descriptor(&self) -> &'static ArtifactDescriptor {
        self.descriptor
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn hashes(&self) -> &Hashes {
        &self.hashes
    }

    fn service(&self) -> &'static str {
        self.descriptor.service_name
    }

    fn concurrency(&self) -> usize {
        self.options
            .concurrent_limit(self.service(), self.descriptor.default_concurrency)
    }

    fn bounds(&self) -> PageBounds {
        PageBounds {
            offset: self.options.page_offset(self.service()),
            limit: self.options.page_limit(self.service()),
        }
    }

    fn policy(&self) -> RetryPolicy {
        self.options.retry_policy()
    }

    /// Whether the ready/draft/path filters admit this item.
    fn accepts(&self, item: &Item) -> bool {
        let ready = self.options.filter_ready();
        let draft = self.options.filter_draft();
        if ready && !draft && item.is_draft() {
            return false;
        }
        if draft && !ready && !item.is_draft() {
            return false;
        }
        if let Some(prefix) = self.options.filter_path() {
            let Some(path) = item.path() else {
                return false;
            };
            if !crate::names::virtual_path(path).starts_with(crate::names::virtual_path(prefix)) {
                return false;
            }
        }
        if let Some(site) = self.options.filter_site()
            && self.descriptor.service_name == "sites"
            && item.id() != Some(site)
        {
            return false;
        }
        true
    }

    // ------------------------------------------------------------------
    // list
    // ------------------------------------------------------------------

    /// Every artifact file in the virtual folder.
    pub async fn list_local(&self) -> Result<Vec<ProxyItem>> {
        self.local.list_names().await
    }

    /// Local files that count as new/modified against the hashes store;
    /// with the deleted flag, also tracked entries whose file is gone.
    #[instrument(name = "SyncHelper::list_modified_local", skip(self))]
    pub async fn list_modified_local(&self, flags: ModFlags) -> Result<Vec<ProxyItem>> {
        let mut modified = Vec::new();
        for proxy in self.local.list_names().await? {
            if self
                .hashes
                .is_local_modified(flags, &proxy.rel_path)
                .await?
            {
                modified.push(proxy);
            }
        }
        if flags.deleted {
            for (id, rel_path) in self.tracked_files() {
                if !fs::exists(&self.local.working_dir().join(&rel_path)).await {
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

    /// Every remote item, fully paged.
    #[instrument(name = "SyncHelper::list_remote", skip(self))]
    pub async fn list_remote(&self) -> Result<Vec<Item>> {
        let items = self.fetch_all_remote().await?;
        self.record_list_manifest(&items).await?;
        Ok(items)
    }

    /// Page through the full remote listing without touching manifests.
    /// Deleted-name computation needs the current server inventory but must
    /// not record it anywhere.
    async fn fetch_all_remote(&self) -> Result<Vec<Item>> {
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

    /// Remote items modified since the last pull watermark; with the deleted
    /// flag, also minimal items for ids we track that the server no longer
    /// has.
    #[instrument(name = "SyncHelper::list_modified_remote", skip(self))]
    pub async fn list_modified_remote(&self, flags: ModFlags) -> Result<Vec<Item>> {
        let since = self.hashes.last_pull_timestamp(self.timestamp_scope());
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
                .fetch_all_remote()
                .await?
                .iter()
                .filter_map(|item| item.id().map(str::to_string))
                .collect::<HashSet<_>>();
            for (id, rel_path) in self.tracked_files() {
                if !remote_ids.contains(&id) {
                    let mut tombstone = Item::default();
                    tombstone.set_id(id);
                    tombstone.set_path(rel_path);
                    items.push(tombstone);
                }
            }
        }

        self.record_list_manifest(&items).await?;
        Ok(items)
    }

    async fn list_page(&self, since: Option<Timestamp>, bounds: PageBounds) -> Result<Vec<Item>> {
        match since {
            Some(since) => {
                self.remote
                    .get_modified_items(&since.to_string(), bounds.offset, bounds.limit)
                    .await
            }
            // No watermark yet: everything counts as modified.
            None => self.remote.get_items(bounds.offset, bounds.limit).await,
        }
    }

    /// Tracked hashes entries belonging to this type's folder.
    fn tracked_files(&self) -> Vec<(String, String)> {
        self.hashes
            .list_files()
            .into_iter()
            .filter(|(_, path)| path.ends_with(self.descriptor.extension))
            .filter(|(_, path)| {
                self.local
                    .working_dir()
                    .join(path)
                    .starts_with(self.local.folder_path())
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // pull
    // ------------------------------------------------------------------

    /// Pull every remote item into the working directory.
    pub async fn pull_all(&self, ctx: &SyncContext) -> Result<FlowSummary> {
        self.pull_with(ctx, Scope::All).await
    }

    /// Pull remote items modified since the last pull watermark.
    pub async fn pull_modified(&self, ctx: &SyncContext) -> Result<FlowSummary> {
        self.pull_with(ctx, Scope::Modified).await
    }

    /// Pull exactly the items the input manifest names for this type.
    #[instrument(name = "SyncHelper::pull_by_manifest", skip(self, ctx))]
    pub async fn pull_by_manifest(&self, ctx: &SyncContext) -> Result<FlowSummary> {
        let start_errors = ctx.error_count();
        let manifest = self.read_input_manifest().await?;
        let ids = self.manifest_ids(&manifest);
        let id_map = self.local.build_id_map().await?;

        let mut items = Vec::new();
        for chunk in ids.chunks(self.bounds().limit.max(1) as usize) {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let tasks = chunk
                .iter()
                .map(|id| self.pull_one(ctx, id.clone(), &id_map))
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

    /// Pull a single item by id.
    pub async fn pull_item(&self, ctx: &SyncContext, id: &str) -> Result<Option<Item>> {
        let id_map = self.local.build_id_map().await?;
        self.pull_one(ctx, id.to_string(), &id_map).await
    }

    async fn pull_one(
        &self,
        ctx: &SyncContext,
        id: String,
        id_map: &HashMap<String, Vec<String>>,
    ) -> Result<Option<Item>> {
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
            debug!(id, "item not found on server");
            return Ok(None);
        };
        self.pull_task(ctx, item, id_map).await.map(Some)
    }

    #[instrument(name = "SyncHelper::pull_with", skip(self, ctx))]
    async fn pull_with(&self, ctx: &SyncContext, scope: Scope) -> Result<FlowSummary> {
        let start_errors = ctx.error_count();
        // Sampled before the first server call so items created mid-pull
        // fall after the stored watermark and are seen next time.
        let sampled = Timestamp::now();
        let since = match scope {
            Scope::Modified => self.hashes.last_pull_timestamp(self.timestamp_scope()),
            _ => None,
        };
        let id_map = self.local.build_id_map().await?;
        let id_map = &id_map;
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
                    .map(|item| self.pull_task(ctx, item, id_map))
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

        let errors = ctx.error_count() - start_errors;
        if errors == 0 && !self.options.is_filtered() && !ctx.cancel.is_cancelled() {
            self.hashes
                .set_last_pull_timestamp(self.timestamp_scope(), sampled)?;
        }

        // Reconciliation compares local files against the pulled set, so a
        // pull with failures would misreport the failed items as local-only;
        // only an error-free full pull is trustworthy.
        if scope == Scope::All && errors == 0 && self.options.deletions() {
            self.reconcile_deletions(ctx, &items).await?;
        }

        self.record_output_manifest(&items).await?;
        Ok(FlowSummary { items, errors })
    }

    async fn pull_task(
        &self,
        ctx: &SyncContext,
        item: Item,
        id_map: &HashMap<String, Vec<String>>,
    ) -> Result<Item> {
        let id = item.id().unwrap_or_default().to_string();
        let stored = async {
            let rel_path = self.local.write_item(&item, Some(id_map)).await?;
            self.hashes.update(&item, &rel_path, None).await?;
            Ok::<_, color_eyre::Report>(())
        }
        .await;
        match stored {
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

    /// Emit `local-only` for every local file the full pull did not see.
    /// The engine itself never deletes local files during a pull.
    async fn reconcile_deletions(&self, ctx: &SyncContext, pulled: &[Item]) -> Result<()> {
        let remote_paths = pulled
            .iter()
            .filter_map(|item| self.local.item_rel_path(item).ok())
            .collect::<HashSet<_>>();

        let mut local_only = Vec::new();
        for proxy in self.local.list_names().await? {
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

    /// Push every local file.
    pub async fn push_all(&self, ctx: &SyncContext) -> Result<FlowSummary> {
        self.push_with(ctx, Scope::All).await
    }

    /// Push local files that changed since they were last synced.
    pub async fn push_modified(&self, ctx: &SyncContext) -> Result<FlowSummary> {
        self.push_with(ctx, Scope::Modified).await
    }

    /// Push exactly the items the input manifest names for this type.
    pub async fn push_by_manifest(&self, ctx: &SyncContext) -> Result<FlowSummary> {
        self.push_with(ctx, Scope::Manifest).await
    }

    /// Push the single file at the given working-directory-relative path,
    /// driving its backoff loop to completion.
    pub async fn push_path(&self, ctx: &SyncContext, rel_path: &str) -> Result<Option<Item>> {
        let id_map = self.local.build_id_map().await?;
        let policy = self.policy();
        let mut attempt = 1;
        loop {
            match self.push_once(ctx, rel_path, attempt, &id_map, &policy).await {
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

    #[instrument(name = "SyncHelper::push_with", skip(self, ctx))]
    async fn push_with(&self, ctx: &SyncContext, scope: Scope) -> Result<FlowSummary> {
        let start_errors = ctx.error_count();
        let sampled = Timestamp::now();

        let mut proxies = match scope {
            Scope::All => self.list_local().await?,
            Scope::Modified => self.list_modified_local(ModFlags::NEW_AND_MODIFIED).await?,
            Scope::Manifest => {
                let manifest = self.read_input_manifest().await?;
                let wanted = self.manifest_ids(&manifest).into_iter().collect::<HashSet<_>>();
                self.list_local()
                    .await?
                    .into_iter()
                    .filter(|proxy| proxy.id.as_ref().is_some_and(|id| wanted.contains(id)))
                    .collect()
            }
        };
        proxies.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

        let id_map = self.local.build_id_map().await?;
        let policy = self.policy();
        let concurrency = self.concurrency();

        let tasks = proxies
            .iter()
            .map(|proxy| self.push_once(ctx, &proxy.rel_path, 1, &id_map, &policy))
            .collect::<Vec<_>>();
        let outcomes = settle(concurrency, tasks).await;
        let mut items = outcomes
            .into_iter()
            .filter_map(Outcome::fulfilled)
            .flatten()
            .collect::<Vec<_>>();

        // A batch where nothing succeeded is not going to be rescued by
        // backoff; fail its retries outright. Otherwise each queued item
        // re-enters until it succeeds or exhausts its attempts (exhaustion
        // is handled inside push_once).
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
            debug!(count = retries.len(), "running push retry pass");
            let tasks = retries
                .into_iter()
                .map(|retry| {
                    let id_map = &id_map;
                    let policy = &policy;
                    async move {
                        tokio::time::sleep(retry.delay).await;
                        self.push_once(ctx, &retry.name, retry.attempt + 1, id_map, policy)
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

        let errors = ctx.error_count() - start_errors;
        if errors == 0
            && scope != Scope::Manifest
            && !self.options.is_filtered()
            && !ctx.cancel.is_cancelled()
        {
            self.hashes
                .set_last_push_timestamp(self.timestamp_scope(), sampled)?;
        }

        self.record_output_manifest(&items).await?;
        Ok(FlowSummary { items, errors })
    }

    /// One push attempt for one file. `attempt` is 1-based; a retriable
    /// failure with attempts left queues a retry record instead of counting
    /// an error.
    async fn push_once(
        &self,
        ctx: &SyncContext,
        rel_path: &str,
        attempt: u32,
        id_map: &HashMap<String, Vec<String>>,
        policy: &RetryPolicy,
    ) -> Result<Option<Item>> {
        let item = match self.local.read_item(rel_path).await {
            Ok(item) => item,
            Err(err) => {
                ctx.events.emit(Event::PushedError {
                    name: rel_path.to_string(),
                    error: format!("{err:#}"),
                });
                ctx.record_error();
                return Err(err);
            }
        };
        if !self.accepts(&item) {
            return Ok(None);
        }

        let result = if !self.descriptor.update_as_create
            && item.id().is_some()
            && item.rev().is_some()
        {
            self.remote.update_item(&item).await
        } else {
            self.remote.create_item(&item).await
        };

        match result {
            Ok(server) => {
                if self.options.rewrite_on_push() {
                    self.local
                        .write_item_at(&server, rel_path, Some(id_map))
                        .await?;
                }
                self.hashes.update(&server, rel_path, None).await?;
                ctx.events.emit(Event::Pushed {
                    item: server.clone(),
                });
                Ok(Some(server))
            }
            Err(err) => {
                if retry::api_failure(&err).is_some_and(|failure| failure.status == 409) {
                    self.save_conflict(&item, rel_path).await;
                    ctx.events.emit(Event::PushedError {
                        name: rel_path.to_string(),
                        error: format!("{err:#}"),
                    });
                    ctx.record_error();
                    return Err(err);
                }
                let retriable = retry::is_retriable_push(
                    &err,
                    &self.options.retry_status_codes(self.service()),
                    self.descriptor.transient_push_codes,
                );
                if retriable && policy.allows(attempt) {
                    let delay = policy.delay(attempt);
                    debug!(rel_path, attempt, ?delay, "queueing push retry");
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

    /// Best-effort: save the server's copy next to the conflicting file for
    /// manual merging. The push error itself still propagates.
    async fn save_conflict(&self, item: &Item, rel_path: &str) {
        if !self.options.save_file_on_conflict() {
            return;
        }
        let Some(id) = item.id() else { return };
        match self.remote.get_item(id).await {
            Ok(Some(server)) => {
                if let Err(err) = self.local.write_conflict(&server, rel_path).await {
                    warn!(rel_path, error = ?err, "failed to save conflict file");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(rel_path, error = ?err, "failed to fetch server conflict copy"),
        }
    }

    // ------------------------------------------------------------------
    // delete
    // ------------------------------------------------------------------

    /// Delete every remote item the filters admit, retrying reference
    /// rejections to a fixpoint (breaking one link in a cycle unblocks the
    /// rest).
    #[instrument(name = "SyncHelper::delete_all", skip(self, ctx))]
    pub async fn delete_all(&self, ctx: &SyncContext) -> Result<FlowSummary> {
        if !self.descriptor.can_delete {
            bail!("{} does not support delete", self.service());
        }
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

        // Reference-cycle fixpoint: the first retry pass always runs (a
        // rejected delete can still have broken a link on the server), later
        // passes only while the previous one deleted something.
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
            let deleted = each_page(
                PageBounds {
                    offset: 0,
                    limit: self.bounds().limit,
                },
                false,
                |bounds| {
                    let chunk = retries
                        .iter()
                        .skip(bounds.offset as usize)
                        .take(bounds.limit as usize)
                        .map(|retry| retry.item.clone())
                        .collect::<Vec<_>>();
                    async move { Ok(chunk) }
                },
                move |chunk| async move {
                    let size = chunk.len();
                    let tasks = chunk
                        .into_iter()
                        .map(|item| self.delete_task(ctx, item))
                        .collect::<Vec<_>>();
                    let produced = settle(concurrency, tasks)
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

    /// Delete a single remote item.
    pub async fn delete_item(&self, ctx: &SyncContext, item: Item) -> Result<Option<Item>> {
        if !self.descriptor.can_delete {
            bail!("{} does not support delete", self.service());
        }
        self.delete_task(ctx, item).await.map(Some)
    }

    async fn delete_task(&self, ctx: &SyncContext, item: Item) -> Result<Item> {
        let Some(id) = item.id().map(str::to_string) else {
            let err = eyre!("cannot delete an item without an id");
            ctx.events.emit(Event::DeletedError {
                name: item.label().to_string(),
                error: format!("{err:#}"),
            });
            ctx.record_error();
            return Err(err);
        };
        match self.remote.delete_item(&id).await {
            // A 404 counts as deleted: the goal state is reached either way.
            Ok(_deleted) => {
                if let Err(err) = self.hashes.remove(&[id.as_str()]) {
                    warn!(id, error = ?err, "failed to drop hashes entry after delete");
                }
                ctx.events.emit(Event::Deleted { item: item.clone() });
                Ok(item)
            }
            Err(err) if retry::is_retriable_delete(&err) => {
                debug!(id, "delete rejected on a reference, queueing retry");
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

    // ------------------------------------------------------------------
    // manifests
    // ------------------------------------------------------------------

    fn timestamp_scope(&self) -> TimestampScope {
        TimestampScope::All
    }

    async fn read_input_manifest(&self) -> Result<Manifest> {
        let name = self
            .options
            .manifest()
            .context("no input manifest configured")?;
        self.manifests.read(name).await
    }

    fn manifest_ids(&self, manifest: &Manifest) -> Vec<String> {
        match &self.site_id {
            Some(site_id) => manifest.page_ids(site_id),
            None => manifest.section_ids(self.service()),
        }
    }

    async fn record_output_manifest(&self, items: &[Item]) -> Result<()> {
        if let Some(name) = self.options.write_manifest()
            && !items.is_empty()
        {
            self.record_manifest(name, items).await?;
        }
        Ok(())
    }

    async fn record_list_manifest(&self, items: &[Item]) -> Result<()> {
        self.record_output_manifest(items).await
    }

    async fn record_manifest(&self, name: &str, items: &[Item]) -> Result<()> {
        let mut manifest = match self.manifests.read(name).await {
            Ok(manifest) => manifest,
            Err(_) => Manifest::default(),
        };
        for item in items {
            match &self.site_id {
                Some(site_id) => manifest.append_page(site_id, item),
                None => manifest.append(self.service(), item),
            }
        }
        self.manifests.write(name, &manifest).await
    }
}
