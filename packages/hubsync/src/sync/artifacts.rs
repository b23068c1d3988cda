//! Descriptors and constructors for every supported artifact type.
//!
//! The descriptors encode each type's remote path, local layout, and flow
//! quirks; [`helper_for`] binds one to the hub client. Assets are the
//! exception: their helper lives in [`crate::assets`] and only shares the
//! descriptor.

use std::path::Path;

use clients::hub::v1::Client;

use crate::{
    config::Options,
    hashes::Hashes,
    local::LocalStore,
    remote::HubStore,
    sync::{ArtifactDescriptor, helper::SyncHelper},
};

pub static TYPES: ArtifactDescriptor = ArtifactDescriptor {
    service_name: "types",
    api_path: "authoring/v1/types",
    folder_name: "types",
    extension: "_tmd.json",
    classification: "content-type",
    default_concurrency: 10,
    can_delete: true,
    update_as_create: false,
    transient_push_codes: &[2504],
    pruned_fields: &["links"],
};

pub static CONTENT: ArtifactDescriptor = ArtifactDescriptor {
    service_name: "content",
    api_path: "authoring/v1/content",
    folder_name: "content",
    extension: "_cmd.json",
    classification: "content",
    default_concurrency: 10,
    can_delete: true,
    update_as_create: false,
    transient_push_codes: &[2503],
    pruned_fields: &["links"],
};

pub static ASSETS: ArtifactDescriptor = ArtifactDescriptor {
    service_name: "assets",
    api_path: "authoring/v1/assets",
    folder_name: "assets",
    extension: "_amd.json",
    classification: "asset",
    default_concurrency: 5,
    can_delete: true,
    update_as_create: false,
    transient_push_codes: &[],
    pruned_fields: &["links", "mediaType", "filename"],
};

pub static CATEGORIES: ArtifactDescriptor = ArtifactDescriptor {
    service_name: "categories",
    api_path: "authoring/v1/categories",
    folder_name: "categories",
    extension: "_catmd.json",
    classification: "category",
    default_concurrency: 10,
    can_delete: true,
    update_as_create: false,
    transient_push_codes: &[],
    pruned_fields: &["links"],
};

/// Renditions are append-only on the server: updates alias to creates and
/// deletes are always rejected.
pub static RENDITIONS: ArtifactDescriptor = ArtifactDescriptor {
    service_name: "renditions",
    api_path: "authoring/v1/renditions",
    folder_name: "renditions",
    extension: "_rmd.json",
    classification: "rendition",
    default_concurrency: 10,
    can_delete: false,
    update_as_create: true,
    transient_push_codes: &[],
    pruned_fields: &["links"],
};

pub static IMAGE_PROFILES: ArtifactDescriptor = ArtifactDescriptor {
    service_name: "image-profiles",
    api_path: "authoring/v1/image-profiles",
    folder_name: "image-profiles",
    extension: "_ipmd.json",
    classification: "image-profile",
    default_concurrency: 10,
    can_delete: true,
    update_as_create: false,
    transient_push_codes: &[],
    pruned_fields: &["links"],
};

pub static LAYOUTS: ArtifactDescriptor = ArtifactDescriptor {
    service_name: "layouts",
    api_path: "authoring/v1/layouts",
    folder_name: "layouts",
    extension: "_lmd.json",
    classification: "layout",
    default_concurrency: 10,
    can_delete: true,
    update_as_create: false,
    transient_push_codes: &[],
    pruned_fields: &["links"],
};

pub static LAYOUT_MAPPINGS: ArtifactDescriptor = ArtifactDescriptor {
    service_name: "layout-mappings",
    api_path: "authoring/v1/layout-mappings",
    folder_name: "layout-mappings",
    extension: "_lmmd.json",
    classification: "layout-mapping",
    default_concurrency: 10,
    can_delete: true,
    update_as_create: false,
    transient_push_codes: &[],
    pruned_fields: &["links"],
};

pub static SITES: ArtifactDescriptor = ArtifactDescriptor {
    service_name: "sites",
    api_path: "authoring/v1/sites",
    folder_name: "sites",
    extension: "_smd.json",
    classification: "site",
    default_concurrency: 10,
    can_delete: true,
    update_as_create: false,
    transient_push_codes: &[],
    pruned_fields: &["links"],
};

/// Pages are site-scoped; use [`pages`] to bind a helper to one site.
pub static PAGES: ArtifactDescriptor = ArtifactDescriptor {
    service_name: "pages",
    api_path: "authoring/v1/sites",
    folder_name: "sites",
    extension: "_pmd.json",
    classification: "page",
    default_concurrency: 10,
    can_delete: true,
    update_as_create: false,
    transient_push_codes: &[],
    pruned_fields: &["links"],
};

pub static PUBLISHING_SOURCES: ArtifactDescriptor = ArtifactDescriptor {
    service_name: "publishing-sources",
    api_path: "publishing/v1/sources",
    folder_name: "publishing-sources",
    extension: "_psmd.json",
    classification: "publishing-source",
    default_concurrency: 10,
    can_delete: true,
    update_as_create: false,
    transient_push_codes: &[],
    pruned_fields: &["links"],
};

pub static PUBLISHING_PROFILES: ArtifactDescriptor = ArtifactDescriptor {
    service_name: "publishing-profiles",
    api_path: "publishing/v1/profiles",
    folder_name: "publishing-profiles",
    extension: "_ppmd.json",
    classification: "publishing-profile",
    default_concurrency: 10,
    can_delete: true,
    update_as_create: false,
    transient_push_codes: &[],
    pruned_fields: &["links"],
};

pub static PUBLISHING_SITE_REVISIONS: ArtifactDescriptor = ArtifactDescriptor {
    service_name: "publishing-site-revisions",
    api_path: "publishing/v1/site-revisions",
    folder_name: "publishing-site-revisions",
    extension: "_srmd.json",
    classification: "publishing-site-revision",
    default_concurrency: 10,
    can_delete: true,
    update_as_create: false,
    transient_push_codes: &[],
    pruned_fields: &["links"],
};

/// Every descriptor with a plain (non-asset, non-site-scoped) helper, in
/// pull dependency order: referenced types before the artifacts that
/// reference them.
pub static STANDALONE: &[&ArtifactDescriptor] = &[
    &IMAGE_PROFILES,
    &CATEGORIES,
    &TYPES,
    &LAYOUTS,
    &CONTENT,
    &LAYOUT_MAPPINGS,
    &RENDITIONS,
    &SITES,
    &PUBLISHING_SOURCES,
    &PUBLISHING_PROFILES,
    &PUBLISHING_SITE_REVISIONS,
];

/// Bind a descriptor to the hub client and a working directory.
pub fn helper_for(
    descriptor: &'static ArtifactDescriptor,
    client: Client,
    working_dir: &Path,
    hashes: Hashes,
    options: Options,
) -> SyncHelper<HubStore> {
    let remote = HubStore::new(client, descriptor.api_path);
    let local = LocalStore::new(working_dir, descriptor, &options).with_read_cache();
    SyncHelper::new(descriptor, remote, local, hashes, options)
}

/// Bind the pages helper to one site: remote path and local folder both
/// embed the site id.
pub fn pages(
    client: Client,
    site_id: &str,
    working_dir: &Path,
    hashes: Hashes,
    options: Options,
) -> SyncHelper<HubStore> {
    let remote = HubStore::new(client, format!("authoring/v1/sites/{site_id}/pages"));
    let folder = format!("sites/{site_id}/pages");
    let local = LocalStore::with_folder(working_dir, &PAGES, folder, &options).with_read_cache();
    SyncHelper::new(&PAGES, remote, local, hashes, options).for_site(site_id)
}
