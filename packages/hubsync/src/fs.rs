//! Filesystem operations tailored to the sync engine.
//!
//! Inside this module, we refer to `std::fs` or `tokio::fs` by its fully
//! qualified path to make it maximally clear what we are using.
//!
//! Everything here is async over tokio except [`write_atomic_sync`]: the
//! hashes store requires its snapshot writes to complete synchronously on the
//! updating thread, so that path stays on `std::fs` on purpose.

use std::{
    fmt::Debug as StdDebug,
    path::{Path, PathBuf},
};

use color_eyre::{Result, eyre::Context};
use futures::Stream;
use jiff::Timestamp;
use md5::{Digest as _, Md5 as Md5Hasher};
use tap::{Pipe, TapFallible};
use tokio::{io::AsyncReadExt, task::spawn_blocking};
use tracing::{error, instrument, trace};

use clients::{LOCAL_BUFFER_SIZE, hub::v1::Md5};

/// Create the directory and all its parents, if they don't already exist.
#[instrument]
pub async fn create_dir_all(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create dir: {dir:?}"))
        .tap_ok(|_| trace!(?dir, "create directory"))
}

/// Write the provided file content to disk, creating parent directories.
#[instrument(skip(content))]
pub async fn write(path: &Path, content: impl AsRef<[u8]>) -> Result<()> {
    let content = content.as_ref();
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("write file: {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "write file"))
}

/// Buffer the file content from disk.
#[instrument]
pub async fn read_buffered(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Buffer the file content from disk.
/// Unlike [`read_buffered`], this function returns an error if the file
/// doesn't exist.
#[instrument]
pub async fn must_read_buffered(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("read file: {path:?}"))
}

/// Open a file for reading.
#[instrument]
pub async fn open_file(path: &Path) -> Result<tokio::fs::File> {
    tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open file: {path:?}"))
        .tap_ok(|_| trace!(?path, "open file"))
}

/// Open a file for writing, creating parent directories.
#[instrument]
pub async fn create_file(path: &Path) -> Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }
    tokio::fs::File::create(path)
        .await
        .with_context(|| format!("create file: {path:?}"))
        .tap_ok(|_| trace!(?path, "create file"))
}

/// Remove a file. Missing files are not an error.
#[instrument]
pub async fn remove_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            trace!(?path, "remove file");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove file: {path:?}")),
    }
}

/// Rename a file, overwriting the destination if it already exists.
#[instrument]
pub async fn rename(src: &Path, dst: &Path) -> Result<()> {
    tokio::fs::rename(src, dst)
        .await
        .with_context(|| format!("rename file: {src:?} -> {dst:?}"))
        .tap_ok(|_| trace!(?src, ?dst, "rename file"))
}

/// Get the standard metadata for the file, or `None` when it doesn't exist.
#[instrument]
pub async fn metadata(path: impl AsRef<Path> + StdDebug) -> Result<Option<std::fs::Metadata>> {
    let path = path.as_ref();
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("stat metadata: {path:?}")),
    }
}

/// Read the modification time of the file as a timestamp.
#[instrument]
pub async fn mtime(path: &Path) -> Result<Option<Timestamp>> {
    let Some(metadata) = metadata(path).await? else {
        return Ok(None);
    };
    let modified = metadata
        .modified()
        .with_context(|| format!("read mtime: {path:?}"))?;
    Timestamp::try_from(modified)
        .with_context(|| format!("mtime out of range: {path:?}"))
        .map(Some)
}

/// Check whether the file exists.
///
/// Returns `false` if there is an error checking whether the path exists.
/// Note that this sort of check is prone to race conditions - if you plan
/// to do anything with the file after checking, you should probably
/// just try to do the operation and handle the case of the file not existing.
#[instrument]
pub async fn exists(path: impl AsRef<Path> + StdDebug) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Walk files in a directory recursively.
///
/// Only emits regular files; symbolic links and directories are not emitted
/// in the stream. A missing root yields an empty stream.
#[instrument]
pub fn walk_files(root: &Path) -> impl Stream<Item = Result<PathBuf>> + Unpin {
    let (tx, rx) = flume::bounded::<Result<PathBuf>>(0);
    let root = root.to_path_buf();

    spawn_blocking(move || {
        if !root.is_dir() {
            return;
        }
        for entry in jwalk::WalkDir::new(&root).skip_hidden(false) {
            let entry = match entry.with_context(|| format!("walk files in {root:?}")) {
                Ok(entry) => entry,
                Err(err) => {
                    if tx.send(Err(err)).is_err() {
                        error!("walker output channel closed");
                        return;
                    }
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            if tx.send(Ok(entry.path())).is_err() {
                error!("walker output channel closed");
                return;
            }
        }
    });

    rx.into_stream().pipe(Box::pin)
}

/// Hash the contents of the file at the specified path.
#[instrument]
pub async fn hash_file(path: &Path) -> Result<Md5> {
    let mut file = open_file(path).await.context("open file")?;
    let mut hasher = Md5Hasher::new();
    let mut data = vec![0; LOCAL_BUFFER_SIZE];
    let mut bytes = 0;
    loop {
        let len = file.read(&mut data).await.context("read chunk")?;
        if len == 0 {
            break;
        }
        hasher.update(&data[..len]);
        bytes += len;
    }
    let digest = Md5::from_hasher(hasher);
    trace!(?path, md5 = %digest, ?bytes, "hash file");
    Ok(digest)
}

/// Write a file atomically and synchronously: the content goes to a `.tmp`
/// sibling which is then renamed over the destination, so readers observe
/// either the previous snapshot or the new one, never a truncated file.
#[allow(
    clippy::disallowed_methods,
    reason = "the hashes store requires synchronous writes"
)]
#[instrument(skip(content))]
pub fn write_atomic_sync(path: &Path, content: impl AsRef<[u8]>) -> Result<()> {
    let content = content.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create dir: {parent:?}"))?;
    }

    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, content).with_context(|| format!("write file: {tmp:?}"))?;
    if path.exists() {
        std::fs::remove_file(path).with_context(|| format!("remove file: {path:?}"))?;
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {tmp:?} -> {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "atomic write"))
}

/// Remove now-empty directories from `from` up to (but not including) `until`.
///
/// Used after deleting artifact files so renames don't leave hollow folder
/// chains behind. Stops at the first non-empty directory.
#[instrument]
pub async fn prune_empty_dirs(from: &Path, until: &Path) -> Result<()> {
    let mut current = Some(from.to_path_buf());
    while let Some(dir) = current {
        if dir == until || !dir.starts_with(until) {
            break;
        }
        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => {
                trace!(?dir, "pruned empty directory");
                current = dir.parent().map(Path::to_path_buf);
            }
            // Non-empty or already gone: either way, stop walking up.
            Err(_) => break,
        }
    }
    Ok(())
}
