//! End-to-end flow tests for the assets helper: the content/web duality,
//! digest verification, resource reconciliation, and ready-before-draft
//! push ordering.

use std::path::Path;

use color_eyre::Result;
use pretty_assertions::assert_eq;
use serde_json::json;

use clients::hub::v1::Md5;
use hubsync::{
    assets::AssetsHelper,
    config::Options,
    events::{Event, EventSink},
    fs,
    hashes::Hashes,
    sync::SyncContext,
};

use crate::{fake::FakeHub, open_hashes, options_with, temporary_directory, test_options};

fn assets_helper(
    fake: &FakeHub,
    dir: &Path,
    hashes: Hashes,
    options: Options,
) -> AssetsHelper<FakeHub> {
    AssetsHelper::new(fake.clone(), dir, hashes, options)
}

fn context() -> (SyncContext, flume::Receiver<Event>) {
    let (sink, rx) = EventSink::channel(4096);
    (SyncContext::new(sink), rx)
}

fn count<F: Fn(&Event) -> bool>(rx: &flume::Receiver<Event>, pred: F) -> usize {
    rx.drain().filter(|event| pred(event)).count()
}

#[test_log::test(tokio::test)]
async fn pull_writes_both_asset_forms() -> Result<()> {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    fake.seed_asset("/dxdam/brand/logo.png", "ready", b"png-bytes");
    fake.seed_asset("/css/site.css", "ready", b"body {}");
    let options = test_options();
    let hashes = open_hashes(&dir, &options).await;
    let helper = assets_helper(&fake, &dir, hashes.clone(), options);
    let (ctx, events) = context();

    let summary = helper.pull_all(&ctx).await?;
    assert_eq!(summary.items.len(), 2);
    assert_eq!(summary.errors, 0);
    assert_eq!(count(&events, |e| matches!(e, Event::Pulled { .. })), 2);

    // Content asset: binary plus sidecar metadata.
    let binary = dir.join("assets/dxdam/brand/logo.png");
    let sidecar = dir.join("assets/dxdam/brand/logo.png_amd.json");
    assert_eq!(fs::must_read_buffered(&binary).await?, b"png-bytes");
    let metadata: serde_json::Value = serde_json::from_slice(&fs::must_read_buffered(&sidecar).await?)?;
    assert_eq!(metadata["path"], json!("/dxdam/brand/logo.png"));

    // Web asset: the file itself, no sidecar.
    let web = dir.join("assets/css/site.css");
    assert_eq!(fs::must_read_buffered(&web).await?, b"body {}");
    assert!(!fs::exists(&dir.join("assets/css/site.css_amd.json")).await);

    // Hashes bookkeeping: content assets track the sidecar as the entry
    // path and the binary through the resource fields.
    assert!(
        hashes
            .get_md5("assets/dxdam/brand/logo.png_amd.json")
            .is_some()
    );
    assert_eq!(
        hashes.get_resource_md5("assets/dxdam/brand/logo.png"),
        Some(Md5::from_buffer(b"png-bytes").to_base64())
    );
    assert!(hashes.get_md5("assets/css/site.css").is_some());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn digest_mismatch_rejects_the_pull() -> Result<()> {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    let item = fake.seed_asset("/dxdam/brand/logo.png", "ready", b"png-bytes");
    let resource_id = item.resource().unwrap().to_string();
    fake.state().corrupt.insert(resource_id);

    let options = options_with(json!({"disablePushPullResources": true}));
    let hashes = open_hashes(&dir, &options).await;
    let helper = assets_helper(&fake, &dir, hashes.clone(), options);
    let (ctx, events) = context();

    let summary = helper.pull_all(&ctx).await?;
    assert_eq!(summary.items.len(), 0);
    assert_eq!(summary.errors, 1);
    assert_eq!(count(&events, |e| matches!(e, Event::PulledError { .. })), 1);

    // The staging file stays for inspection; the real path was never
    // created and hashes were not touched.
    assert!(fs::exists(&dir.join("assets/dxdam/brand/logo.png.partial")).await);
    assert!(!fs::exists(&dir.join("assets/dxdam/brand/logo.png")).await);
    assert!(hashes.get_resource_md5("assets/dxdam/brand/logo.png").is_none());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn changed_binary_replaces_the_content_resource() -> Result<()> {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    fake.seed_asset("/dxdam/brand/logo.png", "ready", b"png-bytes-v1");
    let options = test_options();
    let hashes = open_hashes(&dir, &options).await;
    let helper = assets_helper(&fake, &dir, hashes.clone(), options);
    let (ctx, events) = context();

    helper.pull_all(&ctx).await?;
    count(&events, |_| true);

    // The binary changes locally while the metadata document persists.
    fs::write(&dir.join("assets/dxdam/brand/logo.png"), b"png-bytes-v2").await?;

    let modified = helper
        .list_modified_local(hubsync::hashes::ModFlags::NEW_AND_MODIFIED)
        .await?;
    assert_eq!(modified.len(), 1);

    let summary = helper.push_modified(&ctx).await?;
    assert_eq!(summary.items.len(), 1);
    assert_eq!(summary.errors, 0);
    assert_eq!(count(&events, |e| matches!(e, Event::Pushed { .. })), 1);

    // The server was told to mint a fresh resource for the new bytes.
    assert_eq!(
        fake.state().replace_flags.get("/dxdam/brand/logo.png"),
        Some(&true)
    );
    assert_eq!(
        hashes.get_resource_md5("assets/dxdam/brand/logo.png"),
        Some(Md5::from_buffer(b"png-bytes-v2").to_base64())
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn ready_assets_push_before_drafts() -> Result<()> {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    let options = options_with(json!({"disablePushPullResources": true}));
    let hashes = open_hashes(&dir, &options).await;
    let helper = assets_helper(&fake, &dir, hashes.clone(), options);
    let (ctx, events) = context();

    fs::write(&dir.join("assets/css/one.css"), b"one").await?;
    fs::write(&dir.join("assets/css/two.css"), b"two").await?;
    fs::write(&dir.join("assets/css/two_wchdraft.css"), b"two draft").await?;
    fs::write(&dir.join("assets/css/three_wchdraft.css"), b"three draft").await?;

    let summary = helper.push_all(&ctx).await?;
    assert_eq!(summary.items.len(), 4);
    assert_eq!(count(&events, |e| matches!(e, Event::Pushed { .. })), 4);

    // The ready batch (one.css, two.css) fully settles before any draft is
    // pushed; drafts travel under their ready path.
    let order = fake.state().push_order.clone();
    assert_eq!(order.len(), 4);
    let mut ready_batch = order[..2].to_vec();
    ready_batch.sort();
    assert_eq!(ready_batch, vec!["/css/one.css", "/css/two.css"]);
    let mut draft_batch = order[2..].to_vec();
    draft_batch.sort();
    assert_eq!(draft_batch, vec!["/css/three.css", "/css/two.css"]);

    // Drafts carry draft status server-side.
    let drafts = fake
        .state()
        .items
        .iter()
        .filter(|item| item.is_draft())
        .count();
    assert_eq!(drafts, 2);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn decoupled_resources_round_trip() -> Result<()> {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    fake.state()
        .resources
        .insert(String::from("deadbeef1234"), b"orphan-bytes".to_vec());

    let options = test_options();
    let hashes = open_hashes(&dir, &options).await;
    let helper = assets_helper(&fake, &dir, hashes.clone(), options);
    let (ctx, events) = context();

    // Pull brings the orphaned resource into resources/<shard>/<id>/.
    helper.pull_all(&ctx).await?;
    assert_eq!(count(&events, |e| matches!(e, Event::ResourcePulled { .. })), 1);
    let pulled = dir.join("resources/de/deadbeef1234/download.bin");
    assert_eq!(fs::must_read_buffered(&pulled).await?, b"orphan-bytes");
    assert_eq!(
        hashes.get_path_for_resource("deadbeef1234").as_deref(),
        Some("resources/de/deadbeef1234/download.bin")
    );

    // A second pull sees the resource as already known.
    helper.pull_all(&ctx).await?;
    assert_eq!(count(&events, |e| matches!(e, Event::ResourcePulled { .. })), 0);

    // A new local resource pushes back up.
    fs::write(
        &dir.join("resources/ab/abcd1234/custom.bin"),
        b"local-resource",
    )
    .await?;
    helper.push_all(&ctx).await?;
    assert_eq!(count(&events, |e| matches!(e, Event::ResourcePushed { .. })), 1);
    assert_eq!(
        fake.state().resources.get("abcd1234").map(Vec::as_slice),
        Some(b"local-resource".as_slice())
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn pull_by_path_scans_pages() -> Result<()> {
    let (_guard, dir) = temporary_directory();
    let fake = FakeHub::new();
    for n in 0..7 {
        fake.seed_asset(&format!("/css/file-{n}.css"), "ready", format!("css {n}").as_bytes());
    }
    let options = options_with(json!({
        "assets": {"limit": 3},
        "disablePushPullResources": true,
    }));
    let hashes = open_hashes(&dir, &options).await;
    let helper = assets_helper(&fake, &dir, hashes.clone(), options);
    let (ctx, _events) = context();

    let found = helper.pull_by_path(&ctx, "css/file-5.css").await?;
    assert_eq!(found.unwrap().path(), Some("/css/file-5.css"));
    assert!(fs::exists(&dir.join("assets/css/file-5.css")).await);
    assert!(!fs::exists(&dir.join("assets/css/file-1.css")).await);

    let missing = helper.pull_by_path(&ctx, "css/absent.css").await?;
    assert!(missing.is_none());
    Ok(())
}
