//! Named manifests scoping and recording bulk operations.
//!
//! A manifest is a JSON inventory of artifacts, one section per artifact
//! type. Per invocation a manifest plays up to three roles: *input* (scope a
//! flow to the listed ids), *output* (record what succeeded), and *deletions*
//! (record what reconciliation found to be local-only).

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use color_eyre::{
    Result,
    eyre::{Context as _, bail},
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use clients::hub::v1::Item;

use crate::fs;

/// Sections that only exist on multi-site capable tenants.
const MULTI_SITE_SECTIONS: &[&str] = &["pages", "layouts", "layout-mappings"];

/// One artifact reference in a manifest section.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A site reference: sites carry their context root and status, and nest
/// their pages.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteManifestEntry {
    #[serde(rename = "contextRoot", skip_serializing_if = "Option::is_none")]
    pub context_root: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pages: BTreeMap<String, ManifestEntry>,
}

/// The parsed form of a manifest file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sites: BTreeMap<String, SiteManifestEntry>,
    #[serde(flatten)]
    pub sections: BTreeMap<String, BTreeMap<String, ManifestEntry>>,
}

impl Manifest {
    /// The ids listed in a section, in stable order.
    pub fn section_ids(&self, section: &str) -> Vec<String> {
        if section == "sites" {
            return self.sites.keys().cloned().collect();
        }
        self.sections
            .get(section)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The page ids recorded under a site.
    pub fn page_ids(&self, site_id: &str) -> Vec<String> {
        self.sites
            .get(site_id)
            .map(|site| site.pages.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether the manifest names the given id in the given section.
    pub fn contains(&self, section: &str, id: &str) -> bool {
        if section == "sites" {
            return self.sites.contains_key(id);
        }
        self.sections
            .get(section)
            .is_some_and(|entries| entries.contains_key(id))
    }

    /// Record an artifact in a section. Items without an id are skipped:
    /// manifests address artifacts by id.
    pub fn append(&mut self, section: &str, item: &Item) {
        let Some(id) = item.id() else { return };
        if section == "sites" {
            self.sites.insert(
                id.to_string(),
                SiteManifestEntry {
                    context_root: item.context_root().map(str::to_string),
                    status: Some(item.status().to_string()),
                    pages: self
                        .sites
                        .get(id)
                        .map(|existing| existing.pages.clone())
                        .unwrap_or_default(),
                },
            );
            return;
        }
        self.sections.entry(section.to_string()).or_default().insert(
            id.to_string(),
            ManifestEntry {
                name: item.name().map(str::to_string),
                path: item.path().map(str::to_string),
            },
        );
    }

    /// Record a page under its site.
    pub fn append_page(&mut self, site_id: &str, item: &Item) {
        let Some(id) = item.id() else { return };
        self.sites.entry(site_id.to_string()).or_default().pages.insert(
            id.to_string(),
            ManifestEntry {
                name: item.name().map(str::to_string),
                path: item.path().map(str::to_string),
            },
        );
    }

    /// Reject manifests that reference multi-site artifacts against a tenant
    /// tier that cannot hold them.
    pub fn ensure_compatible(&self, tier: TenantTier) -> Result<()> {
        if tier != TenantTier::Base {
            return Ok(());
        }
        if !self.sites.is_empty() {
            bail!("manifest contains sites, which a Base tier tenant does not support");
        }
        for section in MULTI_SITE_SECTIONS {
            if self
                .sections
                .get(*section)
                .is_some_and(|entries| !entries.is_empty())
            {
                bail!(
                    "manifest contains {section}, which a Base tier tenant does not support"
                );
            }
        }
        Ok(())
    }
}

/// Tenant capability tier relevant to manifest compatibility.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TenantTier {
    Base,
    Standard,
    Trial,
}

/// Reads and writes named manifests below a working directory.
#[derive(Clone, Debug)]
pub struct ManifestStore {
    working_dir: PathBuf,
}

impl ManifestStore {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    /// Resolve a manifest name to its file path. Bare names get a `.json`
    /// suffix; names with an extension are used as given.
    pub fn path_for(&self, name: &str) -> PathBuf {
        let file = if Path::new(name).extension().is_some() {
            name.to_string()
        } else {
            format!("{name}.json")
        };
        self.working_dir.join(file)
    }

    /// Read a named manifest. A missing manifest is a configuration error:
    /// the caller asked to scope a flow to something that doesn't exist.
    #[instrument(name = "ManifestStore::read", skip(self))]
    pub async fn read(&self, name: &str) -> Result<Manifest> {
        let path = self.path_for(name);
        let content = fs::must_read_buffered(&path)
            .await
            .with_context(|| format!("read manifest: {name}"))?;
        serde_json::from_slice(&content).with_context(|| format!("parse manifest: {name}"))
    }

    /// Write a named manifest.
    #[instrument(name = "ManifestStore::write", skip(self, manifest))]
    pub async fn write(&self, name: &str, manifest: &Manifest) -> Result<()> {
        let path = self.path_for(name);
        let content = serde_json::to_vec_pretty(manifest).context("serialize manifest")?;
        fs::write(&path, content).await
    }
}
