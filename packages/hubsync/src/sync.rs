//! Sync flows composing the lower layers into list/pull/push/delete.
//!
//! Each artifact type is described by a static [`ArtifactDescriptor`] and
//! served by a [`helper::SyncHelper`] instance that is generic over the
//! remote store, so tests run the full flows against an in-memory hub.

pub mod artifacts;
pub mod helper;

use std::sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
};

use tokio_util::sync::CancellationToken;

use clients::hub::v1::Item;

use crate::{events::EventSink, retry::RetryItem};

/// Static description of one artifact type: where it lives remotely, how it
/// is laid out locally, and how its flows behave.
#[derive(Debug)]
pub struct ArtifactDescriptor {
    /// Configuration scope and event label, e.g. `types`.
    pub service_name: &'static str,
    /// Remote API path below the tenant base URL.
    pub api_path: &'static str,
    /// Virtual folder below the working directory.
    pub folder_name: &'static str,
    /// On-disk filename suffix, e.g. `_tmd.json`.
    pub extension: &'static str,
    /// Search-index classification for this type.
    pub classification: &'static str,
    /// Task-pool width unless overridden per service.
    pub default_concurrency: usize,
    /// Whether the type supports remote deletion at all. Renditions are
    /// append-only and reject every delete.
    pub can_delete: bool,
    /// Whether updates alias to creates (renditions again).
    pub update_as_create: bool,
    /// Service error codes that make a 400 push response retriable for this
    /// type, on top of the generic reference-not-found range.
    pub transient_push_codes: &'static [u32],
    /// Server-only fields stripped before an item is persisted to disk.
    pub pruned_fields: &'static [&'static str],
}

/// A delete that failed on a reference violation, queued for the next pass.
#[derive(Debug)]
pub struct DeleteRetry {
    pub item: Item,
    pub error: String,
}

/// Mutable state shared by the tasks of one flow invocation.
///
/// Flows never fail fast once a batch has started: item errors are counted
/// here and surfaced as events, and the flow resolves with its successes.
#[derive(Debug)]
pub struct SyncContext {
    pub events: EventSink,
    pub cancel: CancellationToken,
    errors: AtomicUsize,
    retry_push: Mutex<Vec<RetryItem>>,
    retry_delete: Mutex<Vec<DeleteRetry>>,
}

impl SyncContext {
    pub fn new(events: EventSink) -> Self {
        Self {
            events,
            cancel: CancellationToken::new(),
            errors: AtomicUsize::new(0),
            retry_push: Mutex::new(Vec::new()),
            retry_delete: Mutex::new(Vec::new()),
        }
    }

    /// Count one failed item.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn add_retry_push(&self, item: RetryItem) {
        self.retry_push
            .lock()
            .expect("retry mutex poisoned")
            .push(item);
    }

    pub fn take_retry_push(&self) -> Vec<RetryItem> {
        std::mem::take(&mut *self.retry_push.lock().expect("retry mutex poisoned"))
    }

    pub fn add_retry_delete(&self, retry: DeleteRetry) {
        self.retry_delete
            .lock()
            .expect("retry mutex poisoned")
            .push(retry);
    }

    pub fn take_retry_delete(&self) -> Vec<DeleteRetry> {
        std::mem::take(&mut *self.retry_delete.lock().expect("retry mutex poisoned"))
    }
}

impl Default for SyncContext {
    fn default() -> Self {
        Self::new(EventSink::disabled())
    }
}
