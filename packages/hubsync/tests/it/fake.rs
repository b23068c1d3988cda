//! An in-memory hub the flow tests run against.
//!
//! The fake keeps items in creation order (matching the paging contract),
//! models reference-blocked deletes, scripted per-item failures, and tracks
//! call and concurrency accounting so tests can assert the throttling and
//! retry properties.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use color_eyre::{Report, Result, eyre::eyre};
use jiff::Timestamp;
use md5::{Digest as _, Md5 as Md5Hasher};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use clients::hub::v1::{
    ApiFailure, Item, Md5, PulledAsset, PushAssetParams, SearchPage, SearchRequest, ServiceError,
};
use hubsync::remote::{RemoteAssetStore, RemoteItemStore};

#[derive(Default)]
pub struct State {
    /// Items in creation order; paging slices this directly.
    pub items: Vec<Item>,
    /// Resource binaries by id.
    pub resources: HashMap<String, Vec<u8>>,
    /// Outgoing references; a delete is rejected while the target is still
    /// referenced by a surviving item, but the attempt breaks the target's
    /// own outgoing links.
    pub references: HashMap<String, HashSet<String>>,
    /// Scripted failures per item id: (status, service error codes).
    pub fail_plan: HashMap<String, VecDeque<(u16, Vec<u32>)>>,
    /// Resource ids served with corrupted bytes.
    pub corrupt: HashSet<String>,
    /// Write calls per item id (create/update/push).
    pub write_calls: HashMap<String, usize>,
    /// Paths in the order their pushes arrived.
    pub push_order: Vec<String>,
    /// `replaceContentResource` flags observed per asset path.
    pub replace_flags: HashMap<String, bool>,
    pub in_flight: usize,
    pub max_in_flight: usize,
    next_id: u64,
}

impl State {
    fn find_mut(&mut self, id: &str) -> Option<&mut Item> {
        self.items.iter_mut().find(|item| item.id() == Some(id))
    }

    fn take_failure(&mut self, id: &str) -> Option<(u16, Vec<u32>)> {
        self.fail_plan.get_mut(id).and_then(VecDeque::pop_front)
    }

    fn fresh_id(&mut self) -> String {
        self.next_id += 1;
        format!("gen-{}", self.next_id)
    }
}

/// Cheaply cloneable in-memory hub.
#[derive(Clone, Default)]
pub struct FakeHub {
    state: Arc<Mutex<State>>,
}

impl FakeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("fake hub mutex poisoned")
    }

    /// Seed an item with the given id/rev and arbitrary extra fields.
    pub fn seed(&self, value: serde_json::Value) -> Item {
        let mut item = Item::from_value(value).expect("seed must be an object");
        let mut state = self.state();
        if item.id().is_none() {
            let id = state.fresh_id();
            item.set_id(id);
        }
        if item.rev().is_none() {
            item.set_rev("1");
        }
        item.0.insert(
            "lastModified".into(),
            serde_json::Value::String(Timestamp::now().to_string()),
        );
        state.items.push(item.clone());
        item
    }

    /// Seed an asset item plus its resource bytes.
    pub fn seed_asset(&self, path: &str, status: &str, bytes: &[u8]) -> Item {
        let digest = Md5::from_buffer(bytes);
        let resource_id = format!("res-{}", digest.to_hex());
        self.state()
            .resources
            .insert(resource_id.clone(), bytes.to_vec());
        self.seed(serde_json::json!({
            "path": path,
            "status": status,
            "resource": resource_id,
            "digest": digest.to_base64(),
        }))
    }

    /// Script the next failures for write calls touching `id`.
    pub fn fail_next(&self, id: &str, failures: &[(u16, &[u32])]) {
        let mut state = self.state();
        let queue = state.fail_plan.entry(id.to_string()).or_default();
        for (status, codes) in failures {
            queue.push_back((*status, codes.to_vec()));
        }
    }

    pub fn write_calls(&self, id: &str) -> usize {
        self.state().write_calls.get(id).copied().unwrap_or(0)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    pub fn item_count(&self) -> usize {
        self.state().items.len()
    }

    /// Track one in-flight remote call; the sleep keeps tasks overlapping so
    /// the concurrency ceiling is observable.
    async fn enter(&self) {
        {
            let mut state = self.state();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    fn leave(&self) {
        self.state().in_flight -= 1;
    }

    fn failure_for(&self, id: &str) -> Option<Report> {
        let planned = self.state().take_failure(id);
        planned.map(|(status, codes)| failure(status, &codes))
    }
}

fn failure(status: u16, codes: &[u32]) -> Report {
    let errors = codes
        .iter()
        .map(|code| ServiceError {
            code: *code,
            message: String::from("scripted failure"),
        })
        .collect();
    Report::new(ApiFailure::new(status, errors, "http://fake.hub/api"))
}

fn bump_rev(item: &mut Item) {
    let next = item
        .rev()
        .and_then(|rev| rev.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    item.set_rev(next.to_string());
    item.0.insert(
        "lastModified".into(),
        serde_json::Value::String(Timestamp::now().to_string()),
    );
}

impl RemoteItemStore for FakeHub {
    async fn get_items(&self, offset: u64, limit: u64) -> Result<Vec<Item>> {
        let state = self.state();
        Ok(state
            .items
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn get_item(&self, id: &str) -> Result<Option<Item>> {
        let state = self.state();
        Ok(state.items.iter().find(|item| item.id() == Some(id)).cloned())
    }

    async fn get_item_by_path(&self, path: &str) -> Result<Option<Item>> {
        let state = self.state();
        Ok(state
            .items
            .iter()
            .find(|item| item.path() == Some(path))
            .cloned())
    }

    async fn get_modified_items(&self, since: &str, offset: u64, limit: u64) -> Result<Vec<Item>> {
        let since: Timestamp = since.parse().map_err(|err| eyre!("bad since: {err}"))?;
        let state = self.state();
        Ok(state
            .items
            .iter()
            .filter(|item| {
                item.last_modified()
                    .and_then(|ts| ts.parse::<Timestamp>().ok())
                    .is_some_and(|ts| ts > since)
            })
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn create_item(&self, item: &Item) -> Result<Item> {
        self.enter().await;
        let mut created = item.clone();
        let id = {
            let mut state = self.state();
            let id = match created.id() {
                Some(id) => id.to_string(),
                None => {
                    let id = state.fresh_id();
                    created.set_id(id.clone());
                    id
                }
            };
            *state.write_calls.entry(id.clone()).or_default() += 1;
            id
        };
        let result = match self.failure_for(&id) {
            Some(err) => Err(err),
            None => {
                created.set_rev("0");
                bump_rev(&mut created);
                self.state().items.push(created.clone());
                Ok(created)
            }
        };
        self.leave();
        result
    }

    async fn update_item(&self, item: &Item) -> Result<Item> {
        self.enter().await;
        let result = {
            let id = item.id().expect("update needs an id").to_string();
            {
                let mut state = self.state();
                *state.write_calls.entry(id.clone()).or_default() += 1;
            }
            match self.failure_for(&id) {
                Some(err) => Err(err),
                None => {
                    let mut state = self.state();
                    match state.find_mut(&id) {
                        Some(existing) => {
                            let mut updated = item.clone();
                            bump_rev(&mut updated);
                            *existing = updated.clone();
                            Ok(updated)
                        }
                        None => Err(failure(404, &[])),
                    }
                }
            }
        };
        self.leave();
        result
    }

    async fn delete_item(&self, id: &str) -> Result<bool> {
        self.enter().await;
        let result = {
            match self.failure_for(id) {
                Some(err) => Err(err),
                None => {
                    let mut state = self.state();
                    let referenced = state.references.iter().any(|(owner, targets)| {
                        owner != id
                            && targets.contains(id)
                            && state.items.iter().any(|item| item.id() == Some(owner))
                    });
                    if referenced {
                        // The rejected delete still severs this item's own
                        // outgoing links, which is what lets cyclic groups
                        // drain over successive passes.
                        state.references.remove(id);
                        Err(failure(400, &[3008]))
                    } else {
                        let before = state.items.len();
                        state.items.retain(|item| item.id() != Some(id));
                        state.references.remove(id);
                        Ok(state.items.len() < before)
                    }
                }
            }
        };
        self.leave();
        result
    }
}

impl RemoteAssetStore for FakeHub {
    async fn push_asset(
        &self,
        params: &PushAssetParams,
        mut content: impl AsyncRead + Send + Unpin + 'static,
    ) -> Result<Item> {
        self.enter().await;
        let result = async {
            let mut bytes = Vec::new();
            content.read_to_end(&mut bytes).await?;
            let digest = Md5::from_buffer(&bytes);

            let mut state = self.state();
            state.push_order.push(params.path.clone());
            state
                .replace_flags
                .insert(params.path.clone(), params.replace_content_resource);
            state
                .resources
                .insert(params.resource_id.as_str().to_string(), bytes);

            if params.resource_only {
                let mut synthesized = Item::default();
                synthesized.set_path(params.path.clone());
                synthesized.set_resource(params.resource_id.as_str());
                return Ok(synthesized);
            }

            let mut item = params.item.clone().unwrap_or_default();
            item.set_path(params.path.clone());
            item.set_resource(params.resource_id.as_str());
            item.0.insert(
                "digest".into(),
                serde_json::Value::String(digest.to_base64()),
            );

            let id = match item.id() {
                Some(id) => id.to_string(),
                None => {
                    // Re-pushing the same path updates the existing asset.
                    let existing = state
                        .items
                        .iter()
                        .find(|existing| existing.path() == item.path())
                        .and_then(|existing| existing.id())
                        .map(str::to_string);
                    match existing {
                        Some(id) => {
                            item.set_id(id.clone());
                            id
                        }
                        None => {
                            let id = state.fresh_id();
                            item.set_id(id.clone());
                            id
                        }
                    }
                }
            };
            *state.write_calls.entry(id.clone()).or_default() += 1;
            if let Some((status, codes)) = state.take_failure(&id) {
                return Err(failure(status, &codes));
            }

            bump_rev(&mut item);
            match state.find_mut(&id) {
                Some(existing) => *existing = item.clone(),
                None => state.items.push(item.clone()),
            }
            Ok(item)
        }
        .await;
        self.leave();
        result
    }

    async fn pull_asset(
        &self,
        resource_id: &str,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> Result<PulledAsset> {
        self.enter().await;
        let result = async {
            let bytes = {
                let state = self.state();
                let mut bytes = state
                    .resources
                    .get(resource_id)
                    .cloned()
                    .ok_or_else(|| failure(404, &[]))?;
                if state.corrupt.contains(resource_id) {
                    for byte in &mut bytes {
                        *byte = byte.wrapping_add(1);
                    }
                }
                bytes
            };
            let mut hasher = Md5Hasher::new();
            hasher.update(&bytes);
            writer.write_all(&bytes).await?;
            writer.flush().await?;
            Ok(PulledAsset {
                md5: Md5::from_hasher(hasher),
                length: bytes.len() as u64,
                filename: Some(String::from("download.bin")),
            })
        }
        .await;
        self.leave();
        result
    }

    async fn get_resources(&self, offset: u64, limit: u64) -> Result<Vec<Item>> {
        let state = self.state();
        let mut ids = state.resources.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        Ok(ids
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|id| {
                let mut item = Item::default();
                item.set_id(id);
                item
            })
            .collect())
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchPage> {
        let state = self.state();
        let prefix = request
            .fq
            .iter()
            .find_map(|fq| fq.strip_prefix("path:"))
            .map(|prefix| {
                prefix
                    .trim_end_matches('*')
                    .replace("\\/", "/")
            });
        let documents = state
            .items
            .iter()
            .filter(|item| match (&prefix, item.path()) {
                (Some(prefix), Some(path)) => path.starts_with(prefix.as_str()),
                (None, _) => true,
                _ => false,
            })
            .skip(request.offset as usize)
            .take(request.limit as usize)
            .cloned()
            .collect::<Vec<_>>();
        Ok(SearchPage {
            num_found: documents.len() as u64,
            documents,
        })
    }
}
