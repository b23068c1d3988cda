//! Synchronization engine for content hub authoring artifacts.
//!
//! The engine moves typed artifacts (content items, types, assets and their
//! binary resources, taxonomies, renditions, image profiles, layouts, sites,
//! pages, publishing definitions) between a local working directory and a
//! multi-tenant content hub, with bounded concurrency, per-tenant change
//! tracking, deletion-aware reconciliation, retry with exponential backoff,
//! and atomic conflict-aware local writes.
//!
//! The CLI that drives this engine lives elsewhere; this library exposes the
//! flows (`list`, `pull`, `push`, `delete` per artifact type) and an event
//! channel the caller drains for progress reporting.

pub mod assets;
pub mod config;
pub mod events;
pub mod fs;
pub mod hashes;
pub mod local;
pub mod manifest;
pub mod names;
pub mod pager;
pub mod remote;
pub mod retry;
pub mod sync;
pub mod throttle;
