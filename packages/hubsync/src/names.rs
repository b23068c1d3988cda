//! Naming rules for on-disk artifact files.
//!
//! Artifact files are named for their server id (falling back to their name),
//! with a type-specific suffix. Asset binaries keep their virtual path, with
//! two decorations: draft variants insert a marker before the extension, and
//! content assets carry a sidecar metadata document next to the binary.

use std::path::PathBuf;

use color_eyre::{Result, eyre::bail};

use clients::hub::v1::ResourceId;

/// Marker inserted before the extension of a draft asset's on-disk filename.
pub const DRAFT_SUFFIX: &str = "_wchdraft";

/// Suffix of the sidecar metadata document stored next to a content asset
/// binary.
pub const METADATA_SUFFIX: &str = "_amd.json";

/// Suffix of files holding an unmerged server copy after a conflicting push.
pub const CONFLICT_SUFFIX: &str = ".conflict";

/// The reserved virtual folder that classifies an asset as a content asset.
pub const CONTENT_ASSET_ROOT: &str = "dxdam/";

/// The working-directory folder holding resource binaries.
pub const RESOURCES_FOLDER: &str = "resources";

/// Sanitize a single filename component so it is valid on every platform the
/// working directory might be checked out on.
///
/// The replacement is applied uniformly rather than per-platform so that the
/// same artifact produces the same filename everywhere.
pub fn sanitize_file_name(name: &str) -> String {
    let mut sanitized = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>();
    // Windows rejects names ending in dots or spaces.
    while sanitized.ends_with('.') || sanitized.ends_with(' ') {
        sanitized.pop();
    }
    if sanitized.is_empty() {
        sanitized.push('_');
    }
    sanitized
}

/// The filename for an artifact, preferring its id over its name.
pub fn item_file_name(id: Option<&str>, name: Option<&str>, extension: &str) -> Result<String> {
    let base = match (id, name) {
        (Some(id), _) if !id.is_empty() => id,
        (_, Some(name)) if !name.is_empty() => name,
        _ => bail!("artifact has neither id nor name"),
    };
    Ok(format!("{}{extension}", sanitize_file_name(base)))
}

/// Insert the draft marker before the final extension dot of the last path
/// segment; a segment with no extension gets the marker appended.
pub fn draft_file_name(path: &str) -> String {
    let (dir, file) = match path.rfind('/') {
        Some(idx) => (&path[..=idx], &path[idx + 1..]),
        None => ("", path),
    };
    match file.rfind('.') {
        Some(dot) => format!("{dir}{}{DRAFT_SUFFIX}{}", &file[..dot], &file[dot..]),
        None => format!("{dir}{file}{DRAFT_SUFFIX}"),
    }
}

/// Undo [`draft_file_name`]. Returns `None` when the path carries no draft
/// marker.
pub fn ready_file_name(path: &str) -> Option<String> {
    let (dir, file) = match path.rfind('/') {
        Some(idx) => (&path[..=idx], &path[idx + 1..]),
        None => ("", path),
    };
    match file.rfind('.') {
        Some(dot) => {
            let stem = file[..dot].strip_suffix(DRAFT_SUFFIX)?;
            Some(format!("{dir}{stem}{}", &file[dot..]))
        }
        None => {
            let stem = file.strip_suffix(DRAFT_SUFFIX)?;
            Some(format!("{dir}{stem}"))
        }
    }
}

/// Whether the on-disk filename carries the draft marker.
pub fn is_draft_file_name(path: &str) -> bool {
    ready_file_name(path).is_some()
}

/// Strip the virtual-root leading slash the server includes on asset paths.
pub fn virtual_path(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

/// Whether the virtual path classifies the asset as a content asset (one
/// carrying a sidecar metadata document).
pub fn is_content_asset_path(path: &str) -> bool {
    virtual_path(path).starts_with(CONTENT_ASSET_ROOT)
}

/// The sidecar metadata filename for a content asset binary.
pub fn metadata_file_name(binary_path: &str) -> String {
    format!("{binary_path}{METADATA_SUFFIX}")
}

/// Whether the on-disk filename is a content asset metadata sidecar.
pub fn is_metadata_file_name(path: &str) -> bool {
    path.ends_with(METADATA_SUFFIX)
}

/// The binary path a metadata sidecar describes.
pub fn binary_for_metadata(path: &str) -> Option<&str> {
    path.strip_suffix(METADATA_SUFFIX)
}

/// Where a resource binary lives below the working directory:
/// `resources/<two-char shard>/<resource id>/<original filename>`.
pub fn resource_relative_path(id: &ResourceId, original_name: &str) -> PathBuf {
    PathBuf::from(RESOURCES_FOLDER)
        .join(id.shard())
        .join(id.as_str())
        .join(sanitize_file_name(original_name))
}
