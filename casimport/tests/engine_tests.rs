use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use casimport::cas::{EMPTY_HASH, LO_ETAG, MIME_FILE, MIME_LARGE, cas_path};
use casimport::{Settings, migrate};
use common::progress::Progress;
use swift::Method;
use swift::testutils::MemoryStore;
use tracing_test::traced_test;

fn md5_hex(data: &str) -> String {
    format!("{:x}", md5::compute(data))
}

fn progress() -> &'static Progress {
    Box::leak(Box::new(Progress::new()))
}

fn settings() -> Settings {
    Settings {
        copy_retries: 5,
        copy_retry_interval: Duration::from_millis(1),
        ..Default::default()
    }
}

async fn contexts(store: &MemoryStore) -> Result<(Arc<swift::Context>, Arc<swift::Context>)> {
    let src = store.context("src").await?;
    let dst = store.context("dst").await?;
    Ok((Arc::new(src), Arc::new(dst)))
}

fn head_requests(store: &MemoryStore, path: &str) -> usize {
    store
        .requests()
        .iter()
        .filter(|request| request.method == Method::HEAD && request.path == path)
        .count()
}

fn seed(store: &MemoryStore) {
    store.insert_object("src", "files", "docs/a.txt", "alpha");
    store.insert_object("src", "files", "docs/b.txt", "bravo");
    store.insert_object("src", "files", "copy-of-a.txt", "alpha");
    store.insert_object("src", "files", "empty", "");
    store.insert_object("src", "segments", "big/0001", "hello ");
    store.insert_object("src", "segments", "big/0002", "world");
    store.insert_dlo("src", "files", "big", "segments/big/");
}

#[tokio::test]
#[traced_test]
async fn migrates_files_and_large_objects() -> Result<()> {
    let store = MemoryStore::new();
    seed(&store);
    let (src, dst) = contexts(&store).await?;
    let containers = vec!["files".to_string(), "segments".to_string()];
    let summary = migrate(progress(), src, dst, &containers, "cas", &settings()).await?;
    assert_eq!(summary.objects_listed, 7);
    // alpha, bravo, the empty object and both segments
    assert_eq!(summary.objects_copied, 5);
    assert_eq!(summary.objects_skipped, 1);
    assert_eq!(summary.manifests_uploaded, 1);
    assert_eq!(summary.objects_failed, 0);
    for content in ["alpha", "bravo", "", "hello ", "world"] {
        let object = store
            .object("dst", "cas", &cas_path(&md5_hex(content))?)
            .ok_or_else(|| anyhow::anyhow!("{:?} was not copied", content))?;
        assert_eq!(&object.data[..], content.as_bytes());
        assert_eq!(object.content_type, MIME_FILE);
    }
    assert!(store.object("dst", "cas", &cas_path(EMPTY_HASH)?).is_some());
    let lo_etag = md5_hex("hello world");
    let manifest = store
        .object("dst", "cas", &cas_path(&lo_etag)?)
        .ok_or_else(|| anyhow::anyhow!("manifest was not uploaded"))?;
    assert_eq!(manifest.content_type, MIME_LARGE);
    assert_eq!(
        manifest.slo_segments,
        Some(vec![
            format!("cas/{}", cas_path(&md5_hex("hello "))?),
            format!("cas/{}", cas_path(&md5_hex("world"))?),
        ])
    );
    let etags = format!("{}{}", md5_hex("hello "), md5_hex("world"));
    assert_eq!(manifest.etag, md5_hex(&etags));
    // the content hash is cached on the source and the pointer survives the update
    let big = store
        .object("src", "files", "big")
        .ok_or_else(|| anyhow::anyhow!("source manifest vanished"))?;
    assert_eq!(big.meta.get(LO_ETAG), Some(&lo_etag));
    assert_eq!(big.dlo_manifest.as_deref(), Some("segments/big/"));
    Ok(())
}

#[tokio::test]
async fn second_run_uploads_nothing() -> Result<()> {
    let store = MemoryStore::new();
    seed(&store);
    let containers = vec!["files".to_string(), "segments".to_string()];
    let (src, dst) = contexts(&store).await?;
    migrate(progress(), src, dst, &containers, "cas", &settings()).await?;
    let before = store.object_names("dst", "cas");
    store.clear_requests();
    let (src, dst) = contexts(&store).await?;
    let summary = migrate(progress(), src, dst, &containers, "cas", &settings()).await?;
    assert_eq!(store.count(&Method::PUT), 0);
    assert_eq!(store.count(&Method::POST), 0);
    assert_eq!(summary.objects_skipped, 7);
    assert_eq!(summary.objects_copied + summary.manifests_uploaded, 0);
    assert_eq!(store.object_names("dst", "cas"), before);
    Ok(())
}

#[tokio::test]
async fn known_hash_is_skipped_without_requests() -> Result<()> {
    let store = MemoryStore::new();
    store.insert_object("src", "files", "a.txt", "alpha");
    store.insert_object("dst", "cas", &cas_path(&md5_hex("alpha"))?, "alpha");
    let (src, dst) = contexts(&store).await?;
    store.clear_requests();
    let prog_track = progress();
    let summary = migrate(
        prog_track,
        src,
        dst,
        &["files".to_string()],
        "cas",
        &settings(),
    )
    .await?;
    assert_eq!(summary.objects_skipped, 1);
    assert_eq!(prog_track.objects_skipped.get(), 1);
    assert_eq!(head_requests(&store, "/v1/AUTH_src/files/a.txt"), 0);
    assert_eq!(store.count(&Method::HEAD), 0);
    assert_eq!(store.count(&Method::PUT), 0);
    Ok(())
}

#[tokio::test]
async fn timed_out_copy_waits_for_visibility() -> Result<()> {
    let store = MemoryStore::new();
    store.insert_object("src", "files", "a.txt", "alpha");
    store.create_container("dst", "cas");
    store.fail_next_copies(1, 3);
    let (src, dst) = contexts(&store).await?;
    let prog_track = progress();
    let summary = migrate(
        prog_track,
        src,
        dst,
        &["files".to_string()],
        "cas",
        &settings(),
    )
    .await?;
    assert_eq!(summary.objects_copied, 1);
    assert_eq!(summary.copies_retried, 1);
    assert_eq!(prog_track.copies_retried.get(), 1);
    let path = format!("/v1/AUTH_dst/cas/{}", cas_path(&md5_hex("alpha"))?);
    // three pending answers, then the object shows up
    assert_eq!(head_requests(&store, &path), 4);
    let object = store
        .object("dst", "cas", &cas_path(&md5_hex("alpha"))?)
        .ok_or_else(|| anyhow::anyhow!("object was not copied"))?;
    assert_eq!(object.content_type, MIME_FILE);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn exhausted_visibility_wait_names_the_hash() -> Result<()> {
    let store = MemoryStore::new();
    store.insert_object("src", "files", "a.txt", "alpha");
    store.insert_object("src", "files", "b.txt", "bravo");
    store.create_container("dst", "cas");
    store.fail_next_copies(1, 100);
    let settings = Settings {
        concurrency: 1,
        copy_retries: 3,
        ..settings()
    };
    let (src, dst) = contexts(&store).await?;
    let error = migrate(progress(), src, dst, &["files".to_string()], "cas", &settings)
        .await
        .unwrap_err();
    assert_eq!(error.summary.objects_failed, 1);
    // the other object is still copied
    assert_eq!(error.summary.objects_copied, 1);
    assert_eq!(error.summary.failures.len(), 1);
    let failure = &error.summary.failures[0];
    assert_eq!(failure.container, "files");
    let hash = store
        .object("src", "files", &failure.name)
        .map(|object| object.etag)
        .ok_or_else(|| anyhow::anyhow!("unknown failed object"))?;
    assert!(failure.reason.contains(&format!("Cannot fetch {hash}")));
    assert!(error.to_string().contains("1 object(s) failed"));
    assert!(error.summary.to_string().contains("objects failed: 1"));
    Ok(())
}

#[tokio::test]
async fn fail_early_stops_the_run() -> Result<()> {
    let store = MemoryStore::new();
    for i in 0..5 {
        store.insert_object("src", "files", &format!("{i}.txt"), format!("content {i}"));
    }
    store.create_container("dst", "cas");
    store.fail_next_copies(5, 100);
    let settings = Settings {
        concurrency: 1,
        copy_retries: 1,
        fail_early: true,
        ..settings()
    };
    let (src, dst) = contexts(&store).await?;
    let error = migrate(progress(), src, dst, &["files".to_string()], "cas", &settings)
        .await
        .unwrap_err();
    assert_eq!(error.summary.objects_failed, 1);
    assert_eq!(store.count(&Method::PUT), 1);
    Ok(())
}

#[tokio::test]
async fn dry_run_writes_nothing() -> Result<()> {
    let store = MemoryStore::new();
    seed(&store);
    let (src, dst) = contexts(&store).await?;
    store.clear_requests();
    let settings = Settings {
        dry_run: true,
        ..settings()
    };
    let containers = vec!["files".to_string(), "segments".to_string()];
    let summary = migrate(progress(), src, dst, &containers, "cas", &settings).await?;
    assert_eq!(store.count(&Method::PUT), 0);
    assert_eq!(store.count(&Method::POST), 0);
    assert!(store.object_names("dst", "cas").is_empty());
    // alpha, bravo, the empty object, both segments and the large object
    assert_eq!(summary.dry_run, 6);
    assert_eq!(summary.objects_skipped, 1);
    Ok(())
}
