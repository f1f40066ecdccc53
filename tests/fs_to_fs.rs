use std::time::Duration;

use blobsync::config::parse_error_mask;
use blobsync::driver::{SyncDriver, SyncStatus};
use blobsync::pipeline::collection;
use blobsync::pipeline::stage::Stage;
use blobsync::pipeline::Group;
use blobsync::storage::factory;
use blobsync::types::token::create_pipeline_cancellation_token;

mod common;

use common::{build_tree, fs_to_fs_config, read_tree, xattr_available};

#[tokio::test(flavor = "multi_thread")]
async fn full_copy() {
    let source = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    build_tree(
        source.path(),
        &[("a", b"A"), ("d/b", b"BB"), ("d/e/c", b"CCC")],
    );

    let config = fs_to_fs_config(source.path(), target.path());
    let status = SyncDriver::new(config, create_pipeline_cancellation_token())
        .run()
        .await
        .unwrap();

    assert_eq!(status, SyncStatus::Ok);
    assert_eq!(
        read_tree(target.path()),
        vec![
            ("a".to_string(), b"A".to_vec()),
            ("d/b".to_string(), b"BB".to_vec()),
            ("d/e/c".to_string(), b"CCC".to_vec()),
        ]
    );

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(target.path().join("a"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    // with the metadata record in place the recorded mtime matches the source
    #[cfg(unix)]
    if xattr_available(target.path()) {
        let source_mtime = std::fs::metadata(source.path().join("a"))
            .unwrap()
            .modified()
            .unwrap();
        let data = xattr::get(target.path().join("a"), "user.s3sync.meta")
            .unwrap()
            .expect("metadata record must be stored");
        let record: serde_json::Value = serde_json::from_slice(&data).unwrap();
        let recorded = chrono::DateTime::parse_from_rfc3339(record["mtime"].as_str().unwrap())
            .unwrap()
            .timestamp();
        let expected = chrono::DateTime::<chrono::Utc>::from(source_mtime).timestamp();
        assert!((recorded - expected).abs() <= 1);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn extension_filter() {
    let source = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    build_tree(
        source.path(),
        &[("img.png", b"PNG"), ("doc.txt", b"TXT"), ("note.md", b"MD")],
    );

    let mut config = fs_to_fs_config(source.path(), target.path());
    config.filters.include_exts = vec![".png".to_string(), ".md".to_string()];

    let status = SyncDriver::new(config, create_pipeline_cancellation_token())
        .run()
        .await
        .unwrap();

    assert_eq!(status, SyncStatus::Ok);
    assert_eq!(
        read_tree(target.path()),
        vec![
            ("img.png".to_string(), b"PNG".to_vec()),
            ("note.md".to_string(), b"MD".to_vec()),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn modified_filter_reuploads_only_changed_objects() {
    let source = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    if !xattr_available(target.path()) {
        // without stored metadata the target cannot reproduce source ETags
        return;
    }

    build_tree(source.path(), &[("x", b"hello")]);

    let mut config = fs_to_fs_config(source.path(), target.path());
    config.filters.modified_only = true;

    let status = SyncDriver::new(config.clone(), create_pipeline_cancellation_token())
        .run()
        .await
        .unwrap();
    assert_eq!(status, SyncStatus::Ok);

    // second run with one extra source object: only the new key transfers
    build_tree(source.path(), &[("y", b"world")]);

    let token = create_pipeline_cancellation_token();
    let pair = factory::create_storage_pair(&config, token.clone()).await.unwrap();
    let mut group = Group::new(token);
    group.set_source(pair.source);
    group.set_target(pair.target);
    group.add_stage(Stage::new("ListSource", collection::list_source).with_chan_size(1000));
    group.add_stage(Stage::new("LoadObjMeta", collection::load_object_meta).with_workers(4));
    group.add_stage(Stage::new(
        "FilterObjectsModified",
        collection::filter_modified,
    ));
    group.add_stage(Stage::new("LoadObjData", collection::load_object_data).with_workers(4));
    group.add_stage(Stage::new("UploadObj", collection::upload_object_data).with_workers(4));
    group.add_stage(Stage::new("Terminator", collection::terminator));

    let running = group.run();
    let errors = running.errors();
    while let Ok(event) = errors.recv().await {
        if event.is_none() {
            break;
        }
        panic!("unexpected pipeline error: {:?}", event);
    }

    let upload_info = running.stage_info(4);
    assert_eq!(upload_info.name, "UploadObj");
    assert_eq!(upload_info.stats.output, 1);

    assert_eq!(
        read_tree(target.path()),
        vec![
            ("x".to_string(), b"hello".to_vec()),
            ("y".to_string(), b"world".to_vec()),
        ]
    );
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn tolerated_listing_errors_skip_the_node() {
    let source = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    build_tree(source.path(), &[("a", b"A"), ("b", b"B")]);
    // a broken symlink fails the walk unless the mask tolerates not-found
    std::os::unix::fs::symlink(source.path().join("gone"), source.path().join("dangling"))
        .unwrap();

    let mut config = fs_to_fs_config(source.path(), target.path());
    config.error_mask = parse_error_mask(1);
    config.fs.list_error_mask = parse_error_mask(1);

    let status = SyncDriver::new(config, create_pipeline_cancellation_token())
        .run()
        .await
        .unwrap();

    assert_eq!(status, SyncStatus::Ok);
    assert_eq!(
        read_tree(target.path()),
        vec![
            ("a".to_string(), b"A".to_vec()),
            ("b".to_string(), b"B".to_vec()),
        ]
    );
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn fatal_listing_errors_fail_the_sync() {
    let source = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    build_tree(source.path(), &[("a", b"A")]);
    std::os::unix::fs::symlink(source.path().join("gone"), source.path().join("dangling"))
        .unwrap();

    let config = fs_to_fs_config(source.path(), target.path());

    let status = SyncDriver::new(config, create_pipeline_cancellation_token())
        .run()
        .await
        .unwrap();

    assert_eq!(status, SyncStatus::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_mid_run_aborts_within_bounds() {
    let source = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();

    let entries: Vec<(String, Vec<u8>)> = (0..200)
        .map(|i| (format!("obj-{i:03}"), vec![b'x'; 1024]))
        .collect();
    for (key, content) in &entries {
        std::fs::write(source.path().join(key), content).unwrap();
    }

    let mut config = fs_to_fs_config(source.path(), target.path());
    // throttled transfers keep the run going long enough to cancel
    config.rate_limit_bandwidth = Some(4096);
    config.worker_size = 2;

    let token = create_pipeline_cancellation_token();
    let driver = SyncDriver::new(config, token.clone());
    let run = tokio::spawn(driver.run());

    tokio::time::sleep(Duration::from_millis(300)).await;
    token.cancel();

    let status = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("the pipeline must terminate shortly after cancellation")
        .unwrap()
        .unwrap();

    assert_eq!(status, SyncStatus::Aborted);
    assert!(read_tree(target.path()).len() < 200);
}

static VANISHING_SOURCE_DIR: std::sync::OnceLock<std::path::PathBuf> = std::sync::OnceLock::new();

// test stage: the object named "k" disappears from the source right after
// listing, before the data load can read it
fn drop_source_k(
    ctx: blobsync::pipeline::stage::StageContext,
) -> futures_util::future::BoxFuture<'static, ()> {
    Box::pin(async move {
        let input = ctx.input.clone().unwrap();
        while let Ok(object) = input.recv().await {
            if object.key == "k" {
                let _ = std::fs::remove_file(VANISHING_SOURCE_DIR.get().unwrap().join("k"));
            }
            if !ctx.send(object).await {
                return;
            }
        }
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_object_between_list_and_load_is_skipped_with_mask() {
    let source = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    build_tree(source.path(), &[("a", b"A"), ("b", b"B"), ("k", b"K")]);
    VANISHING_SOURCE_DIR
        .set(source.path().to_path_buf())
        .unwrap();

    let config = fs_to_fs_config(source.path(), target.path());
    let token = create_pipeline_cancellation_token();
    let pair = factory::create_storage_pair(&config, token.clone()).await.unwrap();

    let mut group = Group::new(token);
    group.set_source(pair.source);
    group.set_target(pair.target);
    group.add_stage(Stage::new("ListSource", collection::list_source).with_chan_size(1000));
    group.add_stage(Stage::new("DropSourceObject", drop_source_k));
    group.add_stage(Stage::new("LoadObjData", collection::load_object_data));
    group.add_stage(Stage::new("UploadObj", collection::upload_object_data));
    group.add_stage(Stage::new("Terminator", collection::terminator));

    let running = group.run();
    let errors = running.errors();
    let mut object_errors = vec![];
    while let Ok(event) = errors.recv().await {
        match event {
            Some(e) => object_errors.push(e),
            None => break,
        }
    }

    assert_eq!(object_errors.len(), 1);
    let object_error = object_errors[0]
        .cause
        .downcast_ref::<blobsync::types::error::ObjectError>()
        .unwrap();
    assert_eq!(object_error.key, "k");

    let kind = blobsync::types::error::classify_error(&object_error.cause);
    assert_eq!(kind, blobsync::types::error::StorageErrorKind::NotFound);
    assert!(parse_error_mask(1).tolerates(kind));

    // the other objects are unaffected
    assert_eq!(
        read_tree(target.path()),
        vec![
            ("a".to_string(), b"A".to_vec()),
            ("b".to_string(), b"B".to_vec()),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupted_atomic_write_recovers_on_rerun() {
    let source = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    build_tree(source.path(), &[("k", b"fresh content")]);

    // leftovers of an interrupted atomic write: the temp file exists, the
    // destination does not
    std::fs::write(target.path().join("k.temp.0a1b2c3d"), b"partial").unwrap();

    let mut config = fs_to_fs_config(source.path(), target.path());
    config.fs.atomic_write = true;

    let status = SyncDriver::new(config, create_pipeline_cancellation_token())
        .run()
        .await
        .unwrap();

    assert_eq!(status, SyncStatus::Ok);
    assert_eq!(
        std::fs::read(target.path().join("k")).unwrap(),
        b"fresh content"
    );
}
