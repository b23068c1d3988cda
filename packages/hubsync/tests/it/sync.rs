//! End-to-end flow tests for the generic sync helper, run against the
//! in-memory fake hub. These cover the pull/push/delete lifecycles,
//! modification tracking, rename reconciliation, retry behavior, and
//! manifest scoping.

use std::path::Path;

use color_eyre::Result;
use pretty_assertions::assert_eq;
use serde_json::json;

use clients::hub::v1::Item;
use hubsync::{
    config::Options,
    events::{Event, EventSink},
    fs,
    hashes::{Hashes, ModFlags, TimestampScope},
    local::LocalStore,
    sync::{SyncContext, artifacts, helper::SyncHelper},
};

use crate::{fake::FakeHub, open_hashes, options_with, temporary_directory, test_options};

fn content_helper(
    fake: &FakeHub,
    dir: &Path,
    hashes: Hashes,
    options: Options,
) -> SyncHelper<FakeHub> {
    let local = LocalStore::new(dir, &artifacts::CONTENT, &options).with_read_cache();
    SyncHelper::new(&artifacts::CONTENT, fake.clone(), local, hashes, options)
}

fn context() -> (SyncContext, flume::Receiver<Event>) {
    let (sink, rx) = EventSink::channel(4096);
    (SyncContext::new(sink), rx)
}

fn count<F: Fn(&Event) -> bool>(rx: &flume::Receiver<Event>, pred: F) -> usize {
    rx.drain().filter(|event| pred(event)).count()
}

async fn edit_file(dir: &Path, rel: &str) {
    let path = dir.join(rel);
    let content = fs::must_read_buffered(&path).await.unwrap();
    let mut value: serde_json::Value = serde_json::from_slice(&content).unwrap();
    value["edited"] = json!(true);
    fs::write(&path, serde_json::to_vec_pretty(&value).unwrap())
        .await
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn pull_all_into_empty_store() -> Result<()> {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    for id in ["a", "b", "c"] {
        fake.seed(json!({"id": id, "name": format!("item {id}")}));
    }
    let options = test_options();
    let hashes = open_hashes(&dir, &options).await;
    let helper = content_helper(&fake, &dir, hashes.clone(), options);
    let (ctx, events) = context();

    let summary = helper.pull_all(&ctx).await?;
    assert_eq!(summary.items.len(), 3);
    assert_eq!(summary.errors, 0);
    assert_eq!(count(&events, |e| matches!(e, Event::Pulled { .. })), 3);

    for id in ["a", "b", "c"] {
        let rel = format!("content/{id}_cmd.json");
        assert!(fs::exists(&dir.join(&rel)).await, "{rel} should exist");
        let entry = hashes.get_entry(id).expect("hashes entry");
        assert_eq!(entry.rev.as_deref(), Some("1"));
        assert_eq!(entry.path.as_deref(), Some(rel.as_str()));
    }
    assert!(hashes.last_pull_timestamp(TimestampScope::All).is_some());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn second_pull_sees_nothing_modified() -> Result<()> {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    for id in ["a", "b", "c"] {
        fake.seed(json!({"id": id, "name": format!("item {id}")}));
    }
    let options = test_options();
    let hashes = open_hashes(&dir, &options).await;
    let helper = content_helper(&fake, &dir, hashes.clone(), options);
    let (ctx, events) = context();

    helper.pull_all(&ctx).await?;
    let first_watermark = hashes.last_pull_timestamp(TimestampScope::All);
    count(&events, |_| true);

    // Nothing changed server-side: the modified pull is empty.
    let summary = helper.pull_modified(&ctx).await?;
    assert_eq!(summary.items.len(), 0);
    assert_eq!(count(&events, |e| matches!(e, Event::Pulled { .. })), 0);

    // A second full pull rewrites the same bytes and advances the watermark.
    let summary = helper.pull_all(&ctx).await?;
    assert_eq!(summary.items.len(), 3);
    assert_eq!(hashes.get_entry("a").unwrap().rev.as_deref(), Some("1"));
    assert!(hashes.last_pull_timestamp(TimestampScope::All) >= first_watermark);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn pull_reconciles_local_renames() -> Result<()> {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    fake.seed(json!({"id": "a", "name": "item a"}));
    let options = test_options();
    let hashes = open_hashes(&dir, &options).await;
    let helper = content_helper(&fake, &dir, hashes.clone(), options);
    let (ctx, _events) = context();

    helper.pull_all(&ctx).await?;

    // The user renames the file; the id inside still claims "a".
    fs::rename(
        &dir.join("content/a_cmd.json"),
        &dir.join("content/renamed_cmd.json"),
    )
    .await?;

    helper.pull_all(&ctx).await?;
    assert!(fs::exists(&dir.join("content/a_cmd.json")).await);
    assert!(!fs::exists(&dir.join("content/renamed_cmd.json")).await);
    assert_eq!(
        hashes.get_entry("a").unwrap().path.as_deref(),
        Some("content/a_cmd.json")
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn push_retries_transient_failures_within_the_concurrency_cap() -> Result<()> {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    let ids = (0..10).map(|n| format!("item-{n}")).collect::<Vec<_>>();
    for id in &ids {
        fake.seed(json!({"id": id, "name": id}));
    }
    let options = options_with(json!({"concurrent-limit": 3}));
    let hashes = open_hashes(&dir, &options).await;
    let helper = content_helper(&fake, &dir, hashes.clone(), options);
    let (ctx, events) = context();

    helper.pull_all(&ctx).await?;
    count(&events, |_| true);
    {
        let mut state = fake.state();
        state.max_in_flight = 0;
        state.write_calls.clear();
    }

    // Item #4 fails twice with a 500 before succeeding.
    fake.fail_next("item-4", &[(500, &[]), (500, &[])]);

    let summary = helper.push_all(&ctx).await?;
    assert_eq!(summary.items.len(), 10);
    assert_eq!(summary.errors, 0);
    assert_eq!(count(&events, |e| matches!(e, Event::Pushed { .. })), 10);
    assert_eq!(fake.write_calls("item-4"), 3);
    assert!(
        fake.max_in_flight() <= 3,
        "in-flight peak {} exceeded the cap",
        fake.max_in_flight()
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn push_gives_up_when_attempts_run_out() -> Result<()> {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    fake.seed(json!({"id": "ok", "name": "ok"}));
    fake.seed(json!({"id": "flaky", "name": "flaky"}));
    let options = test_options();
    let hashes = open_hashes(&dir, &options).await;
    let helper = content_helper(&fake, &dir, hashes.clone(), options);
    let (ctx, events) = context();

    helper.pull_all(&ctx).await?;
    count(&events, |_| true);
    fake.state().write_calls.clear();

    // More failures than retryMaxAttempts allows.
    fake.fail_next("flaky", &[(500, &[]), (500, &[]), (500, &[]), (500, &[])]);

    let summary = helper.push_all(&ctx).await?;
    assert_eq!(summary.items.len(), 1);
    assert_eq!(summary.errors, 1);
    assert_eq!(fake.write_calls("flaky"), 3);
    assert_eq!(count(&events, |e| matches!(e, Event::PushedError { .. })), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn delete_all_drains_a_reference_cycle() -> Result<()> {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    fake.seed(json!({"id": "A", "name": "a"}));
    fake.seed(json!({"id": "B", "name": "b"}));
    {
        let mut state = fake.state();
        state.references.insert("A".into(), ["B".to_string()].into());
        state.references.insert("B".into(), ["A".to_string()].into());
    }
    let options = test_options();
    let hashes = open_hashes(&dir, &options).await;
    let helper = content_helper(&fake, &dir, hashes.clone(), options);
    let (ctx, events) = context();

    let summary = helper.delete_all(&ctx).await?;
    assert_eq!(summary.items.len(), 2);
    assert_eq!(summary.errors, 0);
    assert_eq!(count(&events, |e| matches!(e, Event::Deleted { .. })), 2);
    assert_eq!(fake.item_count(), 0);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn conflicting_push_saves_the_server_copy() -> Result<()> {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    fake.seed(json!({"id": "a", "name": "item a"}));
    let options = test_options();
    let hashes = open_hashes(&dir, &options).await;
    let helper = content_helper(&fake, &dir, hashes.clone(), options);
    let (ctx, events) = context();

    helper.pull_all(&ctx).await?;
    count(&events, |_| true);
    edit_file(&dir, "content/a_cmd.json").await;
    fake.fail_next("a", &[(409, &[])]);

    let summary = helper.push_all(&ctx).await?;
    assert_eq!(summary.items.len(), 0);
    assert_eq!(summary.errors, 1);
    assert_eq!(count(&events, |e| matches!(e, Event::PushedError { .. })), 1);
    assert!(fs::exists(&dir.join("content/a_cmd.json.conflict")).await);
    // The conflicting local file itself is untouched.
    let local: serde_json::Value = serde_json::from_slice(
        &fs::must_read_buffered(&dir.join("content/a_cmd.json")).await?,
    )?;
    assert_eq!(local["edited"], json!(true));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn push_modified_only_pushes_edited_files() -> Result<()> {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    fake.seed(json!({"id": "a", "name": "item a"}));
    fake.seed(json!({"id": "b", "name": "item b"}));
    let options = test_options();
    let hashes = open_hashes(&dir, &options).await;
    let helper = content_helper(&fake, &dir, hashes.clone(), options);
    let (ctx, events) = context();

    helper.pull_all(&ctx).await?;
    count(&events, |_| true);
    fake.state().write_calls.clear();

    edit_file(&dir, "content/a_cmd.json").await;

    let modified = helper.list_modified_local(ModFlags::NEW_AND_MODIFIED).await?;
    assert_eq!(modified.len(), 1);
    assert_eq!(modified[0].id.as_deref(), Some("a"));

    let summary = helper.push_modified(&ctx).await?;
    assert_eq!(summary.items.len(), 1);
    assert_eq!(fake.write_calls("a"), 1);
    assert_eq!(fake.write_calls("b"), 0);

    // The push refreshed hashes, so nothing is modified any more.
    let modified = helper.list_modified_local(ModFlags::NEW_AND_MODIFIED).await?;
    assert!(modified.is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn renditions_reject_delete() {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    let options = test_options();
    let hashes = open_hashes(&dir, &options).await;
    let local = LocalStore::new(&dir, &artifacts::RENDITIONS, &options);
    let helper = SyncHelper::new(&artifacts::RENDITIONS, fake.clone(), local, hashes, options);
    let (ctx, _events) = context();

    let err = helper.delete_all(&ctx).await.unwrap_err();
    assert!(err.to_string().contains("does not support delete"));
}

#[test_log::test(tokio::test)]
async fn full_pull_reports_local_only_files() -> Result<()> {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    fake.seed(json!({"id": "a", "name": "item a"}));
    let options = options_with(json!({"deletions": true}));
    let hashes = open_hashes(&dir, &options).await;
    let helper = content_helper(&fake, &dir, hashes.clone(), options);
    let (ctx, events) = context();

    fs::write(
        &dir.join("content/extra_cmd.json"),
        serde_json::to_vec(&json!({"id": "extra", "name": "extra"}))?,
    )
    .await?;

    helper.pull_all(&ctx).await?;

    let local_only = events
        .drain()
        .filter_map(|event| match event {
            Event::LocalOnly { item } => Some(item),
            _ => None,
        })
        .collect::<Vec<Item>>();
    assert_eq!(local_only.len(), 1);
    assert_eq!(local_only[0].id(), Some("extra"));
    // Reconciliation only reports; the engine never deletes local files.
    assert!(fs::exists(&dir.join("content/extra_cmd.json")).await);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn failed_pull_suppresses_local_only_reporting() -> Result<()> {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    fake.seed(json!({"id": "a", "name": "item a"}));
    // An item with no usable identity fails its local write during the pull.
    fake.seed(json!({"id": ""}));
    let options = options_with(json!({"deletions": true}));
    let hashes = open_hashes(&dir, &options).await;
    let helper = content_helper(&fake, &dir, hashes.clone(), options);
    let (ctx, events) = context();

    fs::write(
        &dir.join("content/extra_cmd.json"),
        serde_json::to_vec(&json!({"id": "extra", "name": "extra"}))?,
    )
    .await?;

    let summary = helper.pull_all(&ctx).await?;
    assert_eq!(summary.errors, 1);

    // The pull was not error-free, so nothing is reported as local-only:
    // the failed item would otherwise masquerade as a deletion candidate.
    assert_eq!(count(&events, |e| matches!(e, Event::LocalOnly { .. })), 0);
    assert!(fs::exists(&dir.join("content/extra_cmd.json")).await);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn modified_listing_manifest_excludes_unmodified_items() -> Result<()> {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    fake.seed(json!({"id": "a", "name": "item a"}));
    fake.seed(json!({"id": "b", "name": "item b"}));

    let options = test_options();
    let hashes = open_hashes(&dir, &options).await;
    let helper = content_helper(&fake, &dir, hashes.clone(), options);
    let (ctx, _events) = context();
    helper.pull_all(&ctx).await?;
    drop(helper);

    // "b" disappears server-side; list the modifications into a manifest.
    fake.state().items.retain(|item| item.id() != Some("b"));
    let options = options_with(json!({"writeManifest": "mods"}));
    let hashes = open_hashes(&dir, &options).await;
    let helper = content_helper(&fake, &dir, hashes, options);

    let listed = helper.list_modified_remote(ModFlags::ALL).await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id(), Some("b"));

    // Deriving the deleted names pages the full remote listing internally,
    // but only the modified set plus tombstones lands in the manifest.
    let recorded: serde_json::Value =
        serde_json::from_slice(&fs::must_read_buffered(&dir.join("mods.json")).await?)?;
    assert!(recorded["content"]["b"].is_object());
    assert!(recorded["content"].get("a").is_none());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn manifests_scope_and_record_flows() -> Result<()> {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    fake.seed(json!({"id": "a", "name": "item a"}));
    fake.seed(json!({"id": "b", "name": "item b"}));

    fs::write(
        &dir.join("release.json"),
        serde_json::to_vec(&json!({"content": {"a": {}}}))?,
    )
    .await?;

    let options = options_with(json!({"manifest": "release", "writeManifest": "result"}));
    let hashes = open_hashes(&dir, &options).await;
    let helper = content_helper(&fake, &dir, hashes.clone(), options);
    let (ctx, _events) = context();

    // Input manifest scopes the pull to item "a".
    let summary = helper.pull_by_manifest(&ctx).await?;
    assert_eq!(summary.items.len(), 1);
    assert!(fs::exists(&dir.join("content/a_cmd.json")).await);
    assert!(!fs::exists(&dir.join("content/b_cmd.json")).await);

    // The output manifest records the successes.
    let recorded: serde_json::Value =
        serde_json::from_slice(&fs::must_read_buffered(&dir.join("result.json")).await?)?;
    assert!(recorded["content"]["a"].is_object());
    assert!(recorded["content"].get("b").is_none());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn remote_modified_listing_reports_deletions() -> Result<()> {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    fake.seed(json!({"id": "a", "name": "item a"}));
    fake.seed(json!({"id": "b", "name": "item b"}));
    let options = test_options();
    let hashes = open_hashes(&dir, &options).await;
    let helper = content_helper(&fake, &dir, hashes.clone(), options);
    let (ctx, _events) = context();

    helper.pull_all(&ctx).await?;

    // "b" disappears server-side.
    fake.state().items.retain(|item| item.id() != Some("b"));

    let listed = helper.list_modified_remote(ModFlags::ALL).await?;
    let tombstones = listed
        .iter()
        .filter(|item| item.id() == Some("b"))
        .collect::<Vec<_>>();
    assert_eq!(tombstones.len(), 1);
    Ok(())
}
