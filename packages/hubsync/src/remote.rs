//! Remote store abstraction over the hub client.
//!
//! Sync flows reach the hub through these traits rather than the HTTP client
//! directly, so integration tests substitute an in-memory hub and exercise
//! the full flows without a network.

use std::{future::Future, sync::Arc};

use color_eyre::Result;
use derive_more::Debug;
use tokio::io::{AsyncRead, AsyncWrite};

use clients::hub::v1::{Client, Item, PulledAsset, PushAssetParams, SearchPage, SearchRequest};

/// Remote CRUD surface of one artifact type.
pub trait RemoteItemStore: Clone + Send + Sync + 'static {
    /// One page of items, ordered by creation time ascending so newly
    /// appended items never invalidate an advancing cursor.
    fn get_items(&self, offset: u64, limit: u64)
    -> impl Future<Output = Result<Vec<Item>>> + Send;

    fn get_item(&self, id: &str) -> impl Future<Output = Result<Option<Item>>> + Send;

    fn get_item_by_path(&self, path: &str) -> impl Future<Output = Result<Option<Item>>> + Send;

    /// One page of items modified on the server since `since` (RFC 3339).
    fn get_modified_items(
        &self,
        since: &str,
        offset: u64,
        limit: u64,
    ) -> impl Future<Output = Result<Vec<Item>>> + Send;

    fn create_item(&self, item: &Item) -> impl Future<Output = Result<Item>> + Send;

    fn update_item(&self, item: &Item) -> impl Future<Output = Result<Item>> + Send;

    /// Returns `false` when the item was already gone, which delete flows
    /// count as success.
    fn delete_item(&self, id: &str) -> impl Future<Output = Result<bool>> + Send;
}

/// The additional surface assets need: streamed binary transfer, the raw
/// resource listing, and the search index backing path-filtered listings.
pub trait RemoteAssetStore: RemoteItemStore {
    fn push_asset(
        &self,
        params: &PushAssetParams,
        content: impl AsyncRead + Send + Unpin + 'static,
    ) -> impl Future<Output = Result<Item>> + Send;

    fn pull_asset(
        &self,
        resource_id: &str,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> impl Future<Output = Result<PulledAsset>> + Send;

    /// One page of raw resources, for syncing binaries no asset references.
    fn get_resources(
        &self,
        offset: u64,
        limit: u64,
    ) -> impl Future<Output = Result<Vec<Item>>> + Send;

    fn search(&self, request: &SearchRequest) -> impl Future<Output = Result<SearchPage>> + Send;
}

/// [`RemoteItemStore`] implementation binding the hub client to one service
/// path.
///
/// The path is owned rather than static because site-scoped services embed a
/// site id (`authoring/v1/sites/<id>/pages`).
#[derive(Clone, Debug)]
pub struct HubStore {
    #[debug("{client}")]
    client: Client,
    api_path: Arc<String>,
}

impl HubStore {
    pub fn new(client: Client, api_path: impl Into<String>) -> Self {
        Self {
            client,
            api_path: Arc::new(api_path.into()),
        }
    }

    pub fn api_path(&self) -> &str {
        &self.api_path
    }
}

impl RemoteItemStore for HubStore {
    async fn get_items(&self, offset: u64, limit: u64) -> Result<Vec<Item>> {
        self.client.get_items(&self.api_path, offset, limit).await
    }

    async fn get_item(&self, id: &str) -> Result<Option<Item>> {
        self.client.get_item(&self.api_path, id).await
    }

    async fn get_item_by_path(&self, path: &str) -> Result<Option<Item>> {
        self.client.get_item_by_path(&self.api_path, path).await
    }

    async fn get_modified_items(&self, since: &str, offset: u64, limit: u64) -> Result<Vec<Item>> {
        self.client
            .get_modified_items(&self.api_path, since, offset, limit)
            .await
    }

    async fn create_item(&self, item: &Item) -> Result<Item> {
        self.client.create_item(&self.api_path, item).await
    }

    async fn update_item(&self, item: &Item) -> Result<Item> {
        self.client.update_item(&self.api_path, item).await
    }

    async fn delete_item(&self, id: &str) -> Result<bool> {
        self.client.delete_item(&self.api_path, id).await
    }
}

impl RemoteAssetStore for HubStore {
    async fn push_asset(
        &self,
        params: &PushAssetParams,
        content: impl AsyncRead + Send + Unpin + 'static,
    ) -> Result<Item> {
        self.client.push_asset(params, content).await
    }

    async fn pull_asset(
        &self,
        resource_id: &str,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> Result<PulledAsset> {
        self.client.pull_asset(resource_id, writer).await
    }

    async fn get_resources(&self, offset: u64, limit: u64) -> Result<Vec<Item>> {
        self.client
            .get_items("authoring/v1/resources", offset, limit)
            .await
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchPage> {
        self.client.search(request).await
    }
}
