//! HTTP client for the hub v1 authoring APIs.

use std::sync::Arc;

use color_eyre::{
    Report, Result, Section, SectionExt,
    eyre::{Context, eyre},
};
use derive_more::{Debug, Display};
use futures::StreamExt;
use md5::{Digest as _, Md5 as Md5Hasher};
use reqwest::{Response, StatusCode, header};
use tap::Pipe;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{instrument, warn};
use url::Url;

use crate::{
    ContentType, NETWORK_BUFFER_SIZE, TENANT_ID_HEADER, Token,
    hub::v1::{
        ApiFailure, Item, ItemPage, Md5, PulledAsset, PushAssetParams, SearchPage, SearchRequest,
        TransportFailure, TransportKind,
    },
};

/// Client for the hub v1 authoring APIs.
///
/// ## Cloning
///
/// This type is cheaply cloneable, and clones share the underlying HTTP
/// connection pool.
#[derive(Clone, Debug, Display)]
#[display("{base}")]
pub struct Client {
    #[debug("{:?}", base.as_str())]
    base: Arc<Url>,

    #[debug(skip)]
    http: reqwest::Client,

    tenant_id: Option<String>,

    token: Option<Token>,
}

impl Client {
    /// Create a new client for the given tenant base URL.
    ///
    /// The base URL addresses the tenant; `tenant_id` additionally travels as
    /// a request header when known. The token, when present, is sent as a
    /// bearer credential.
    pub fn new(base: Url, tenant_id: Option<String>, token: Option<Token>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .build()
            .context("build http client")?;

        Ok(Self {
            base: Arc::new(base),
            http,
            tenant_id,
            token,
        })
    }

    /// The tenant base URL this client talks to.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, url);
        if let Some(tenant) = &self.tenant_id {
            builder = builder.header(TENANT_ID_HEADER, tenant);
        }
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token.expose());
        }
        builder
    }

    fn service_url(&self, service: &str) -> Result<Url> {
        self.base
            .join(service)
            .with_context(|| format!("join service path: {service}"))
    }

    /// Check that the service is reachable.
    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<()> {
        let url = self.service_url("login/v1/basicauth")?;
        let response = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::OK => Ok(()),
            _ => Err(failure(response).await),
        }
    }

    /// List one page of items, ordered by creation time ascending.
    #[instrument(skip(self))]
    pub async fn get_items(&self, service: &str, offset: u64, limit: u64) -> Result<Vec<Item>> {
        let mut url = self.service_url(service)?;
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &limit.to_string());
        self.fetch_page(url).await
    }

    /// List one page of items modified since the given timestamp.
    #[instrument(skip(self))]
    pub async fn get_modified_items(
        &self,
        service: &str,
        since: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Item>> {
        let mut url = self.service_url(service)?;
        url.query_pairs_mut()
            .append_pair("start", since)
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &limit.to_string());
        self.fetch_page(url).await
    }

    async fn fetch_page(&self, url: Url) -> Result<Vec<Item>> {
        let response = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::OK => response
                .json::<ItemPage>()
                .await
                .context("parse JSON response")?
                .items
                .pipe(Ok),
            _ => Err(failure(response).await),
        }
    }

    /// Get a single item by id.
    #[instrument(skip(self))]
    pub async fn get_item(&self, service: &str, id: &str) -> Result<Option<Item>> {
        let url = self.service_url(&format!("{service}/{id}"))?;
        let response = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::OK => response
                .json::<Item>()
                .await
                .context("parse JSON response")?
                .pipe(Some)
                .pipe(Ok),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(failure(response).await),
        }
    }

    /// Get a single item by its virtual path.
    ///
    /// Not every authoring service supports path addressing; callers that
    /// target one that doesn't (notably assets) must scan pages instead.
    #[instrument(skip(self))]
    pub async fn get_item_by_path(&self, service: &str, path: &str) -> Result<Option<Item>> {
        let mut url = self.service_url(&format!("{service}/by-path"))?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::OK => response
                .json::<Item>()
                .await
                .context("parse JSON response")?
                .pipe(Some)
                .pipe(Ok),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(failure(response).await),
        }
    }

    /// Create an item.
    #[instrument(skip(self, item), fields(label = item.label()))]
    pub async fn create_item(&self, service: &str, item: &Item) -> Result<Item> {
        let url = self.service_url(service)?;
        let response = self
            .request(reqwest::Method::POST, url)
            .json(item)
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => response
                .json::<Item>()
                .await
                .context("parse JSON response")?
                .pipe(Ok),
            _ => Err(failure(response).await),
        }
    }

    /// Update an item in place.
    ///
    /// The server compares the submitted `rev` against its own and answers
    /// 409 when they diverge; that conflict is surfaced as an [`ApiFailure`].
    #[instrument(skip(self, item), fields(label = item.label()))]
    pub async fn update_item(&self, service: &str, item: &Item) -> Result<Item> {
        let id = item
            .id()
            .ok_or_else(|| eyre!("cannot update an item without an id"))?;
        let url = self.service_url(&format!("{service}/{id}"))?;
        let response = self
            .request(reqwest::Method::PUT, url)
            .json(item)
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => response
                .json::<Item>()
                .await
                .context("parse JSON response")?
                .pipe(Ok),
            _ => Err(failure(response).await),
        }
    }

    /// Delete an item by id.
    ///
    /// Returns `false` when the server reports the item already gone, which
    /// delete flows treat as success.
    #[instrument(skip(self))]
    pub async fn delete_item(&self, service: &str, id: &str) -> Result<bool> {
        let url = self.service_url(&format!("{service}/{id}"))?;
        let response = self
            .request(reqwest::Method::DELETE, url)
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(failure(response).await),
        }
    }

    /// Push an asset: stream the resource binary, then create or update the
    /// asset metadata referencing it.
    ///
    /// Returns the server's view of the asset metadata, including any
    /// reassigned `id`/`rev`. For resource-only pushes the returned item is
    /// synthesized from the parameters since no metadata document exists.
    #[instrument(
        name = "Client::push_asset",
        skip(self, params, content),
        fields(path = params.path, resource = %params.resource_id),
    )]
    pub async fn push_asset(
        &self,
        params: &PushAssetParams,
        content: impl AsyncRead + Send + Unpin + 'static,
    ) -> Result<Item> {
        let name = params
            .path
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or(&params.path);
        let mut url = self.service_url(&format!("authoring/v1/resources/{}", params.resource_id))?;
        url.query_pairs_mut()
            .append_pair("name", name)
            .append_pair("md5", &params.resource_md5.to_base64());

        let stream = ReaderStream::with_capacity(content, NETWORK_BUFFER_SIZE);
        let body = reqwest::Body::wrap_stream(stream);
        let mut builder = self
            .request(reqwest::Method::PUT, url)
            .header(ContentType::HEADER, ContentType::Bytes.value())
            .body(body);
        if let Some(length) = params.content_length {
            builder = builder.header(header::CONTENT_LENGTH, length);
        }
        let response = builder.send().await.map_err(transport)?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {}
            _ => return Err(failure(response).await),
        }

        if params.resource_only {
            let mut synthesized = Item::default();
            synthesized.set_path(params.path.clone());
            synthesized.set_resource(params.resource_id.as_str());
            return Ok(synthesized);
        }

        // The binary is in place; now create or update the metadata document
        // pointing at it. Web assets pushed without a sidecar get a minimal
        // document so the server can classify them.
        let mut item = params.item.clone().unwrap_or_default();
        if item.path().is_none() {
            item.set_path(params.path.clone());
        }
        item.set_resource(params.resource_id.as_str());
        if params.replace_content_resource {
            item.0.insert(
                "replaceContentResource".into(),
                serde_json::Value::Bool(true),
            );
        }

        let mut pushed = if item.id().is_some() && item.rev().is_some() {
            self.update_item("authoring/v1/assets", &item).await?
        } else {
            self.create_item("authoring/v1/assets", &item).await?
        };
        pushed.remove_field("replaceContentResource");
        Ok(pushed)
    }

    /// Pull a resource binary, streaming it into `writer`.
    ///
    /// The MD5 of the streamed bytes is computed on the fly so callers can
    /// verify the server digest without re-reading the file.
    #[instrument(name = "Client::pull_asset", skip(self, writer))]
    pub async fn pull_asset(
        &self,
        resource_id: &str,
        writer: &mut (impl AsyncWrite + Unpin),
    ) -> Result<PulledAsset> {
        let url = self.service_url(&format!("authoring/v1/resources/{resource_id}"))?;
        let response = self
            .request(reqwest::Method::GET, url)
            .header(ContentType::ACCEPT, ContentType::Bytes.value())
            .send()
            .await
            .map_err(transport)?;
        if response.status() != StatusCode::OK {
            return Err(failure(response).await);
        }

        let filename = disposition_filename(&response);
        let mut hasher = Md5Hasher::new();
        let mut length = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(transport)?;
            hasher.update(&chunk);
            length += chunk.len() as u64;
            writer.write_all(&chunk).await.context("write chunk")?;
        }
        writer.flush().await.context("flush writer")?;

        Ok(PulledAsset {
            md5: Md5::from_hasher(hasher),
            length,
            filename,
        })
    }

    /// Run a full-text search.
    #[instrument(skip(self))]
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchPage> {
        let mut url = self.service_url("authoring/v1/search")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("q", &request.q);
            for fq in &request.fq {
                pairs.append_pair("fq", fq);
            }
            pairs.append_pair("start", &request.offset.to_string());
            pairs.append_pair("rows", &request.limit.to_string());
        }
        let response = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::OK => response
                .json::<SearchPage>()
                .await
                .context("parse JSON response")?
                .pipe(Ok),
            _ => Err(failure(response).await),
        }
    }
}

/// Convert a non-success response into a report carrying an [`ApiFailure`],
/// with the URL and body attached as sections for the log.
async fn failure(response: Response) -> Report {
    let status = response.status();
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    let errors = ApiFailure::parse_errors(&body);
    Report::new(ApiFailure::new(status.as_u16(), errors, url.clone()))
        .with_section(move || url.header("Url:"))
        .with_section(move || body.header("Body:"))
}

/// Convert a reqwest transport error into a report carrying a
/// [`TransportFailure`] so retry classification sees it as transient.
fn transport(err: reqwest::Error) -> Report {
    let kind = if err.is_timeout() {
        TransportKind::Timeout
    } else if err.is_connect() {
        TransportKind::Connect
    } else if err.is_body() || err.is_decode() {
        TransportKind::Body
    } else {
        TransportKind::Request
    };
    warn!(?kind, error = %err, "transport failure");
    Report::new(TransportFailure {
        kind,
        detail: err.to_string(),
    })
}

/// Extract the filename from a Content-Disposition header, if present.
fn disposition_filename(response: &Response) -> Option<String> {
    let value = response
        .headers()
        .get(header::CONTENT_DISPOSITION)?
        .to_str()
        .ok()?;
    value.split(';').find_map(|part| {
        let part = part.trim();
        let name = part.strip_prefix("filename=")?;
        Some(name.trim_matches('"').to_string())
    })
}
