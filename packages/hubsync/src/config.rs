//! The options bag driving sync flows.
//!
//! Options are an open JSON object merged from layers: built-in defaults,
//! then the user's options file, then the working directory's options file,
//! then whatever the caller passes for a single invocation. Artifact-type
//! scoped settings (page limits, concurrency) nest under the service name and
//! shadow the top-level value of the same key.

use std::{path::Path, time::Duration};

use color_eyre::{
    Result,
    eyre::{Context, ContextCompat},
};
use serde_json::{Map, Value};
use tracing::instrument;
use url::Url;

use crate::{fs, retry::RetryPolicy};

/// Filename of an options file, both in the user's home and in the working
/// directory.
pub const OPTIONS_FILE: &str = ".wchtoolsoptions";

/// Option key naming the tenant API endpoint.
pub const TENANT_BASE_URL: &str = clients::TENANT_BASE_URL_KEY;

/// Option key naming the tenant.
pub const TENANT_ID: &str = "x-ibm-dx-tenant-id";

/// Environment variable carrying the hub password for the CLI collaborator.
pub const ENV_PASSWORD: &str = "WCHTOOLS_PASSWORD";

/// Environment variable bounding how long the engine waits for upload
/// streams to close on failure paths, in seconds.
pub const ENV_WAIT_FOR_CLOSE: &str = "WCHTOOLS_WAIT_FOR_CLOSE";

const DEFAULT_PAGE_LIMIT: u64 = 100;
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_MIN_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_MAX_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_FACTOR: f64 = 2.0;
const DEFAULT_HASHES_WRITE_THRESHOLD: u32 = 25;
const DEFAULT_HASHES_WRITE_MAX_TIME: Duration = Duration::from_secs(60);

/// An immutable merged view of every configuration layer.
#[derive(Clone, Debug, Default)]
pub struct Options {
    bag: Map<String, Value>,
}

impl Options {
    /// An empty bag: every getter answers its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an already-merged JSON object.
    pub fn from_object(bag: Map<String, Value>) -> Self {
        Self { bag }
    }

    /// Load the working directory's options file, if present.
    #[instrument]
    pub async fn load(working_dir: &Path) -> Result<Self> {
        let path = working_dir.join(OPTIONS_FILE);
        let Some(content) = fs::read_buffered(&path).await? else {
            return Ok(Self::new());
        };
        let bag = serde_json::from_slice::<Map<String, Value>>(&content)
            .with_context(|| format!("parse options file: {path:?}"))?;
        Ok(Self { bag })
    }

    /// Layer `overrides` on top of this bag. Objects merge key by key,
    /// everything else is replaced outright.
    pub fn merged_with(&self, overrides: &Options) -> Options {
        let mut merged = self.bag.clone();
        merge_objects(&mut merged, &overrides.bag);
        Options { bag: merged }
    }

    fn value(&self, key: &str) -> Option<&Value> {
        self.bag.get(key)
    }

    /// A setting scoped to an artifact service, shadowing the top-level
    /// setting of the same name.
    fn service_value(&self, service: &str, key: &str) -> Option<&Value> {
        self.bag
            .get(service)
            .and_then(Value::as_object)
            .and_then(|scoped| scoped.get(key))
            .or_else(|| self.value(key))
    }

    fn bool_flag(&self, key: &str, default: bool) -> bool {
        self.value(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn base_url(&self) -> Result<Url> {
        let raw = self
            .value(TENANT_BASE_URL)
            .and_then(Value::as_str)
            .with_context(|| format!("missing option: {TENANT_BASE_URL}"))?;
        // The authoring API paths are joined onto the base, so it must end
        // with a slash or the last segment silently disappears.
        let normalized = if raw.ends_with('/') {
            raw.to_string()
        } else {
            format!("{raw}/")
        };
        Url::parse(&normalized).with_context(|| format!("invalid tenant base URL: {raw}"))
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.value(TENANT_ID).and_then(Value::as_str)
    }

    /// The key the tenant's entries are stored under in the hashes file:
    /// the tenant id when known, else the base URL for reverse lookup.
    pub fn tenant_key(&self) -> Option<String> {
        if let Some(id) = self.tenant_id() {
            return Some(id.to_string());
        }
        self.value(TENANT_BASE_URL)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn use_hashes(&self) -> bool {
        self.bool_flag("useHashes", true)
    }

    pub fn concurrent_limit(&self, service: &str, default: usize) -> usize {
        self.service_value(service, "concurrent-limit")
            .and_then(Value::as_u64)
            .map(|limit| limit.max(1) as usize)
            .unwrap_or(default)
    }

    pub fn page_limit(&self, service: &str) -> u64 {
        self.service_value(service, "limit")
            .and_then(Value::as_u64)
            .filter(|limit| *limit > 0)
            .unwrap_or(DEFAULT_PAGE_LIMIT)
    }

    pub fn page_offset(&self, service: &str) -> u64 {
        self.service_value(service, "offset")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let max_attempts = self
            .value("retryMaxAttempts")
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or(DEFAULT_RETRY_MAX_ATTEMPTS);
        let min_timeout = self
            .value("retryMinTimeout")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RETRY_MIN_TIMEOUT);
        let max_timeout = self
            .value("retryMaxTimeout")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RETRY_MAX_TIMEOUT);
        let factor = self
            .value("retryFactor")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_RETRY_FACTOR);
        let randomize = self.bool_flag("retryRandomize", true);

        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .min_timeout(min_timeout)
            .max_timeout(max_timeout)
            .factor(factor)
            .randomize(randomize)
            .build()
    }

    /// Extra HTTP status codes treated as retriable for the given service.
    pub fn retry_status_codes(&self, service: &str) -> Vec<u16> {
        self.service_value(service, "retryStatusCodes")
            .and_then(Value::as_array)
            .map(|codes| {
                codes
                    .iter()
                    .filter_map(Value::as_u64)
                    .map(|code| code as u16)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn filter_ready(&self) -> bool {
        self.bool_flag("filterReady", false)
    }

    pub fn filter_draft(&self) -> bool {
        self.bool_flag("filterDraft", false)
    }

    pub fn filter_path(&self) -> Option<&str> {
        self.value("filterPath").and_then(Value::as_str)
    }

    pub fn filter_site(&self) -> Option<&str> {
        self.value("filterSite").and_then(Value::as_str)
    }

    /// Whether any scope filter is active; watermarks only advance on
    /// unfiltered flows.
    pub fn is_filtered(&self) -> bool {
        self.filter_ready()
            || self.filter_draft()
            || self.filter_path().is_some()
            || self.filter_site().is_some()
    }

    pub fn rewrite_on_push(&self) -> bool {
        self.bool_flag("rewriteOnPush", true)
    }

    pub fn save_file_on_conflict(&self) -> bool {
        self.bool_flag("saveFileOnConflict", true)
    }

    pub fn deletions(&self) -> bool {
        self.bool_flag("deletions", false)
    }

    pub fn no_virtual_folder(&self) -> bool {
        self.bool_flag("noVirtualFolder", false)
    }

    pub fn ignore_additive(&self) -> bool {
        self.bool_flag("is_ignore_additive", true)
    }

    /// User ignore patterns layered onto (or replacing) the built-in set.
    pub fn ignore_patterns(&self) -> Vec<String> {
        self.value("ignore")
            .and_then(Value::as_array)
            .map(|patterns| {
                patterns
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn disable_push_pull_resources(&self) -> bool {
        self.bool_flag("disablePushPullResources", false)
    }

    /// Which asset sub-kinds an invocation covers: `webassets`,
    /// `contentassets`, or both when unset.
    pub fn asset_types(&self) -> Option<&str> {
        self.value("assetTypes").and_then(Value::as_str)
    }

    /// Name of the manifest scoping this invocation, if any.
    pub fn manifest(&self) -> Option<&str> {
        self.value("manifest").and_then(Value::as_str)
    }

    /// Name of the manifest successes are recorded into, if any.
    pub fn write_manifest(&self) -> Option<&str> {
        self.value("writeManifest").and_then(Value::as_str)
    }

    /// Name of the manifest reconciliation deletions are recorded into,
    /// if any.
    pub fn deletions_manifest(&self) -> Option<&str> {
        self.value("writeDeletionsManifest").and_then(Value::as_str)
    }

    pub fn hashes_write_threshold(&self) -> u32 {
        self.value("hashesWriteThreshold")
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or(DEFAULT_HASHES_WRITE_THRESHOLD)
    }

    pub fn hashes_write_max_time(&self) -> Duration {
        self.value("hashesWriteMaxTime")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_HASHES_WRITE_MAX_TIME)
    }

    /// How long to wait for an upload stream to close on failure paths.
    /// Bounded so a wedged stream cannot hang the retry machinery.
    pub fn wait_for_close(&self) -> Duration {
        std::env::var(ENV_WAIT_FOR_CLOSE)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(10))
    }
}

/// Credential pass-through from the environment, used by the CLI
/// collaborator when no keystore entry exists.
pub fn password() -> Option<clients::Token> {
    std::env::var(ENV_PASSWORD)
        .ok()
        .filter(|value| !value.is_empty())
        .map(clients::Token::from)
}

fn merge_objects(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_objects(existing, incoming);
            }
            (_, incoming) => {
                base.insert(key.clone(), incoming.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn options(value: serde_json::Value) -> Options {
        match value {
            Value::Object(map) => Options::from_object(map),
            _ => panic!("options fixture must be an object"),
        }
    }

    #[test]
    fn service_scope_shadows_top_level() {
        let opts = options(json!({
            "limit": 50,
            "concurrent-limit": 4,
            "assets": {"limit": 10},
        }));
        assert_eq!(opts.page_limit("assets"), 10);
        assert_eq!(opts.page_limit("content"), 50);
        assert_eq!(opts.concurrent_limit("assets", 8), 4);
        assert_eq!(opts.concurrent_limit("content", 8), 4);
    }

    #[test]
    fn merge_is_deep_for_objects() {
        let base = options(json!({"assets": {"limit": 10, "offset": 5}, "useHashes": true}));
        let overlay = options(json!({"assets": {"limit": 20}, "useHashes": false}));
        let merged = base.merged_with(&overlay);
        assert_eq!(merged.page_limit("assets"), 20);
        assert_eq!(merged.page_offset("assets"), 5);
        assert!(!merged.use_hashes());
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        let opts = options(json!({TENANT_BASE_URL: "https://content.example.com/api/tenant1"}));
        let url = opts.base_url().unwrap();
        assert_eq!(url.as_str(), "https://content.example.com/api/tenant1/");
        assert_eq!(
            url.join("authoring/v1/types").unwrap().path(),
            "/api/tenant1/authoring/v1/types"
        );
    }

    #[test]
    fn tenant_key_prefers_id() {
        let opts = options(json!({
            TENANT_BASE_URL: "https://content.example.com/api/t1",
            TENANT_ID: "tenant-1",
        }));
        assert_eq!(opts.tenant_key().as_deref(), Some("tenant-1"));

        let opts = options(json!({TENANT_BASE_URL: "https://content.example.com/api/t1"}));
        assert_eq!(
            opts.tenant_key().as_deref(),
            Some("https://content.example.com/api/t1")
        );
    }

    #[test]
    fn filters_mark_flow_as_filtered() {
        assert!(!options(json!({})).is_filtered());
        assert!(options(json!({"filterDraft": true})).is_filtered());
        assert!(options(json!({"filterPath": "dxdam/a"})).is_filtered());
    }

    #[test_log::test(tokio::test)]
    async fn load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::load(dir.path()).await.unwrap();
        assert!(opts.use_hashes());
        assert_eq!(opts.hashes_write_threshold(), 25);
        assert_eq!(opts.hashes_write_max_time(), Duration::from_secs(60));
    }

    #[test_log::test(tokio::test)]
    async fn load_reads_directory_options() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            &dir.path().join(OPTIONS_FILE),
            serde_json::to_vec(&json!({"useHashes": false, "retryMaxAttempts": 2})).unwrap(),
        )
        .await
        .unwrap();

        let opts = Options::load(dir.path()).await.unwrap();
        assert!(!opts.use_hashes());
        assert_eq!(opts.retry_policy().max_attempts(), 2);
    }
}
