//! Hub v1 API types and client.

use std::fmt;

use base64::Engine as _;
use bon::Builder;
use color_eyre::eyre::{Context, bail};
use derive_more::{Display, Error};
use md5::{Digest as _, Md5 as Md5Hasher};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::instrument;

#[cfg(feature = "client")]
mod client;

#[cfg(feature = "client")]
pub use client::Client;

/// An MD5 digest.
///
/// The hub reports digests for resource binaries in base64; resource ids embed
/// them in hex. This type holds the raw bytes and renders either form.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Md5([u8; 16]);

impl Md5 {
    /// Hash the contents of a buffer.
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        let mut hasher = Md5Hasher::new();
        hasher.update(buffer.as_ref());
        Self(hasher.finalize().into())
    }

    /// Finish an incremental hasher into a digest.
    pub fn from_hasher(hasher: Md5Hasher) -> Self {
        Self(hasher.finalize().into())
    }

    /// View the digest as a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Attempt to parse the digest from a hex string.
    pub fn from_hex(hex: impl AsRef<str>) -> color_eyre::Result<Self> {
        let bytes = hex::decode(hex.as_ref()).context("decode hex")?;
        Self::from_bytes(&bytes)
    }

    /// View the digest as a base64 string, the form the hub reports.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Attempt to parse the digest from a base64 string.
    pub fn from_base64(encoded: impl AsRef<str>) -> color_eyre::Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_ref())
            .context("decode base64")?;
        Self::from_bytes(&bytes)
    }

    /// View the digest as raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn from_bytes(bytes: &[u8]) -> color_eyre::Result<Self> {
        let len = bytes.len();
        if len != 16 {
            bail!("invalid digest length: expected 16 bytes, got {len}");
        }
        let mut buf = [0u8; 16];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }
}

impl fmt::Display for Md5 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for Md5 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Md5 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Md5 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// The id of a resource binary.
///
/// Resource ids are derived from content, not assigned by the server: the MD5
/// of the binary content and the MD5 of its relative path below the resources
/// root, both hex encoded and joined by an underscore. Two assets holding the
/// same bytes at the same relative path therefore share a resource.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Derive the id for the given binary digest stored at the given
    /// resources-root-relative path.
    #[instrument(name = "ResourceId::derive")]
    pub fn derive(content: &Md5, relative_path: &str) -> Self {
        let path_md5 = Md5::from_buffer(relative_path.as_bytes());
        Self(format!("{}_{}", content.to_hex(), path_md5.to_hex()))
    }

    /// Wrap an id received from the server.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The two-character shard prefix used for on-disk layout.
    pub fn shard(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(2)
            .map(|(idx, _)| idx)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }

    /// View the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Server-side lifecycle state of an artifact.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    #[display("ready")]
    Ready,
    #[display("draft")]
    Draft,
}

/// A typed, id-addressed content hub artifact.
///
/// The engine treats artifacts as schemaless JSON objects; this wrapper keeps
/// the full document intact for round-tripping while exposing typed accessors
/// for the handful of properties the engine inspects.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Item(pub serde_json::Map<String, Value>);

impl Item {
    /// Wrap a JSON object. Returns an error for any other JSON shape.
    pub fn from_value(value: Value) -> color_eyre::Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => bail!("artifact is not a JSON object: {other}"),
        }
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn id(&self) -> Option<&str> {
        self.str_field("id")
    }

    pub fn rev(&self) -> Option<&str> {
        self.str_field("rev")
    }

    pub fn name(&self) -> Option<&str> {
        self.str_field("name")
    }

    pub fn path(&self) -> Option<&str> {
        self.str_field("path")
    }

    pub fn resource(&self) -> Option<&str> {
        self.str_field("resource")
    }

    /// The server-reported MD5 of the resource binary, base64 encoded.
    pub fn digest(&self) -> Option<&str> {
        self.str_field("digest")
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.str_field("lastModified")
    }

    pub fn context_root(&self) -> Option<&str> {
        self.str_field("contextRoot")
    }

    pub fn status(&self) -> Status {
        match self.str_field("status") {
            Some("draft") => Status::Draft,
            _ => Status::Ready,
        }
    }

    pub fn is_draft(&self) -> bool {
        self.status() == Status::Draft
    }

    /// The id of the ready counterpart for a draft variant.
    ///
    /// Draft ids are compound: `<baseId>:<variantToken>`. For a plain id this
    /// returns the id unchanged.
    pub fn base_id(&self) -> Option<&str> {
        self.id().map(|id| id.split(':').next().unwrap_or(id))
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.0.insert("id".into(), Value::String(id.into()));
    }

    pub fn set_rev(&mut self, rev: impl Into<String>) {
        self.0.insert("rev".into(), Value::String(rev.into()));
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.0.insert("path".into(), Value::String(path.into()));
    }

    pub fn set_resource(&mut self, resource: impl Into<String>) {
        self.0.insert("resource".into(), Value::String(resource.into()));
    }

    /// Remove a field, returning its previous value if any.
    pub fn remove_field(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// A displayable identifier for logs and events: name, path, or id,
    /// whichever is known first.
    pub fn label(&self) -> &str {
        self.name()
            .or_else(|| self.path())
            .or_else(|| self.id())
            .unwrap_or("<unnamed>")
    }
}

impl From<serde_json::Map<String, Value>> for Item {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        Self(map)
    }
}

/// One page of items from a paged authoring endpoint.
///
/// The service reports its own offset/limit back; the client only surfaces
/// the items, callers drive paging themselves.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ItemPage {
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub items: Vec<Item>,
}

/// A single error object in a hub error response body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceError {
    pub code: u32,
    #[serde(default)]
    pub message: String,
}

/// A non-success response from the hub.
///
/// Carries the HTTP status and any service error codes parsed from the
/// response body so callers can classify the failure (retriable reference
/// violations, tier restrictions, and so on) without string matching.
#[derive(Clone, Debug, Display, Error)]
#[display("hub request failed with status {status}")]
pub struct ApiFailure {
    pub status: u16,
    pub errors: Vec<ServiceError>,
    pub url: String,
}

impl ApiFailure {
    pub fn new(status: u16, errors: Vec<ServiceError>, url: impl Into<String>) -> Self {
        Self {
            status,
            errors,
            url: url.into(),
        }
    }

    /// Whether any service error in the body carries the given code.
    pub fn has_code(&self, code: u32) -> bool {
        self.errors.iter().any(|err| err.code == code)
    }

    /// Whether any service error code falls within the given half-open range.
    pub fn has_code_in(&self, range: std::ops::Range<u32>) -> bool {
        self.errors.iter().any(|err| range.contains(&err.code))
    }

    /// Parse service errors out of a response body.
    ///
    /// The hub wraps errors as `{"errors": [{code, message}]}` but some
    /// endpoints return a bare `{code, message}` object. Anything else parses
    /// to an empty list.
    pub fn parse_errors(body: &str) -> Vec<ServiceError> {
        #[derive(Deserialize)]
        struct Wrapped {
            errors: Vec<ServiceError>,
        }

        if let Ok(wrapped) = serde_json::from_str::<Wrapped>(body) {
            return wrapped.errors;
        }
        if let Ok(single) = serde_json::from_str::<ServiceError>(body) {
            return vec![single];
        }
        Vec::new()
    }
}

/// A network-level failure talking to the hub, before any HTTP status was
/// received. Kept distinct from [`ApiFailure`] so retry classification can
/// treat all transport failures as transient.
#[derive(Clone, Debug, Display, Error)]
#[display("transport failure talking to the hub: {kind}")]
pub struct TransportFailure {
    pub kind: TransportKind,
    pub detail: String,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
pub enum TransportKind {
    #[display("timeout")]
    Timeout,
    #[display("connect")]
    Connect,
    #[display("request")]
    Request,
    #[display("body")]
    Body,
}

/// Parameters for a streamed asset push.
#[derive(Clone, Debug, Builder)]
#[non_exhaustive]
pub struct PushAssetParams {
    /// Push only the resource binary, skipping asset metadata.
    #[builder(default)]
    pub resource_only: bool,

    /// Ask the server to mint a fresh resource even though the asset item
    /// persists; set when the binary content changed under an existing asset.
    #[builder(default)]
    pub replace_content_resource: bool,

    /// The derived id of the resource being uploaded.
    pub resource_id: ResourceId,

    /// The MD5 of the binary being uploaded.
    pub resource_md5: Md5,

    /// Virtual root-relative path of the asset.
    #[builder(into)]
    pub path: String,

    /// Content length of the binary, if known.
    pub content_length: Option<u64>,

    /// Asset metadata to create or update alongside the resource. Absent for
    /// web assets pushed without a sidecar.
    pub item: Option<Item>,
}

/// The outcome of a streamed asset pull.
#[derive(Clone, Debug)]
pub struct PulledAsset {
    /// MD5 of the bytes actually written, computed while streaming.
    pub md5: Md5,
    /// Bytes written.
    pub length: u64,
    /// Server-supplied disposition filename, when present.
    pub filename: Option<String>,
}

/// A search request against the hub's full-text index.
///
/// Only the handful of parameters the engine uses are modeled: a query,
/// filter queries, and paging.
#[derive(Clone, Debug, Builder)]
#[non_exhaustive]
pub struct SearchRequest {
    /// The main query, e.g. `*:*`.
    #[builder(into, default = String::from("*:*"))]
    pub q: String,

    /// Filter queries, e.g. `classification:asset`.
    #[builder(default)]
    pub fq: Vec<String>,

    pub offset: u64,
    pub limit: u64,
}

/// One page of search results.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SearchPage {
    #[serde(rename = "numFound", default)]
    pub num_found: u64,
    #[serde(default)]
    pub documents: Vec<Item>,
}
