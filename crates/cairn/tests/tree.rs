use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tempfile::tempdir;

use cairn::{
    CasError, ContentId, ObjectType, ProgressTracker, RefreshOptions, Store, StoreError,
    TreeConfig, TreeIndex, bytes_to_id, codec,
};

fn populate(root: &Path) {
    fs::write(root.join("one"), "same content").unwrap();
    fs::write(root.join("two"), "same content").unwrap();
    fs::create_dir(root.join("sub")).unwrap();
    fs::write(root.join("sub/three"), "different content").unwrap();
}

fn touch_later(path: &Path) {
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(10))
        .unwrap();
}

fn cid(index: &TreeIndex, path: &str) -> Option<ContentId> {
    index.get_by_path(path).and_then(|record| record.cid.clone())
}

#[test]
fn test_first_refresh_indexes_everything() {
    let dir = tempdir().unwrap();
    populate(dir.path());

    let mut index = TreeIndex::new(dir.path());
    let stats = index.refresh(RefreshOptions::default()).unwrap();

    assert_eq!(stats.new_entries, 4);
    assert_eq!(stats.refreshed_entries, 4);
    assert_eq!(stats.failed_entries, 0);
    assert!(!stats.interrupted);
    assert_eq!(index.len(), 4);

    let paths: Vec<&str> = index.records().map(|r| r.path.as_str()).collect();
    assert_eq!(paths, ["one", "sub", "sub/three", "two"]);

    let same = bytes_to_id(b"same content");
    assert_eq!(cid(&index, "one"), Some(same.clone()));
    assert_eq!(cid(&index, "two"), Some(same.clone()));
    assert_eq!(cid(&index, "sub/three"), Some(bytes_to_id(b"different content")));
    assert_eq!(cid(&index, "sub"), None);
    assert_eq!(
        index.get_by_path("sub").unwrap().otype,
        Some(ObjectType::Directory)
    );

    let by_id = index.get_by_id(&same).unwrap();
    assert!(by_id.path == "one" || by_id.path == "two");
    assert!(index.records().all(|r| !r.stale));
}

#[test]
fn test_unchanged_tree_does_no_work() {
    let dir = tempdir().unwrap();
    populate(dir.path());

    let mut index = TreeIndex::new(dir.path());
    index.refresh(RefreshOptions::default()).unwrap();
    let stats = index.refresh(RefreshOptions::default()).unwrap();

    assert_eq!(stats.new_entries, 0);
    assert_eq!(stats.changed_entries, 0);
    assert_eq!(stats.vanished_entries, 0);
    assert_eq!(stats.refreshed_entries, 0);
}

#[test]
fn test_force_recomputes_everything() {
    let dir = tempdir().unwrap();
    populate(dir.path());

    let mut index = TreeIndex::new(dir.path());
    index.refresh(RefreshOptions::default()).unwrap();
    let stats = index
        .refresh(RefreshOptions {
            force: true,
            ..Default::default()
        })
        .unwrap();

    assert_eq!(stats.changed_entries, 4);
    assert_eq!(stats.refreshed_entries, 4);
    assert_eq!(cid(&index, "one"), Some(bytes_to_id(b"same content")));
}

#[test]
fn test_rename_keeps_identity_and_content() {
    let dir = tempdir().unwrap();
    populate(dir.path());

    let mut index = TreeIndex::new(dir.path());
    index.refresh(RefreshOptions::default()).unwrap();
    let before = index.get_by_path("sub/three").unwrap().clone();

    fs::rename(dir.path().join("sub/three"), dir.path().join("three")).unwrap();
    let stats = index.refresh(RefreshOptions::default()).unwrap();

    assert_eq!(stats.new_entries, 0);
    assert_eq!(stats.vanished_entries, 0);
    assert!(index.get_by_path("sub/three").is_none());

    let after = index.get_by_path("three").unwrap();
    assert_eq!(after.fileid, before.fileid);
    assert_eq!(after.cid, before.cid);
    assert_eq!(index.len(), 4);
}

#[test]
fn test_edit_changes_content_id() {
    let dir = tempdir().unwrap();
    populate(dir.path());

    let mut index = TreeIndex::new(dir.path());
    index.refresh(RefreshOptions::default()).unwrap();
    let before = index.get_by_path("sub/three").unwrap().clone();

    let path = dir.path().join("sub/three");
    fs::write(&path, "edited content that is longer").unwrap();
    touch_later(&path);
    let stats = index.refresh(RefreshOptions::default()).unwrap();

    assert_eq!(stats.changed_entries, 1);
    assert_eq!(stats.refreshed_entries, 1);

    let after = index.get_by_path("sub/three").unwrap();
    assert_eq!(after.fileid, before.fileid);
    assert_eq!(after.cid, Some(bytes_to_id(b"edited content that is longer")));
    assert!(index.get_by_id(&bytes_to_id(b"different content")).is_none());
    assert!(
        index
            .get_by_id(&bytes_to_id(b"edited content that is longer"))
            .is_some()
    );
}

#[test]
fn test_removed_entries_vanish() {
    let dir = tempdir().unwrap();
    populate(dir.path());

    let mut index = TreeIndex::new(dir.path());
    index.refresh(RefreshOptions::default()).unwrap();
    let fileid = index.get_by_path("sub/three").unwrap().fileid;

    fs::remove_file(dir.path().join("sub/three")).unwrap();
    let stats = index.refresh(RefreshOptions::default()).unwrap();

    assert_eq!(stats.vanished_entries, 1);
    assert_eq!(stats.vanished_bytes, "different content".len() as u64);
    assert!(index.get_by_path("sub/three").is_none());
    assert!(index.get_by_fileid(fileid).is_none());
    assert!(index.get_by_id(&bytes_to_id(b"different content")).is_none());
    assert_eq!(index.len(), 3);
}

#[test]
fn test_removing_a_duplicate_keeps_the_other() {
    let dir = tempdir().unwrap();
    populate(dir.path());

    let mut index = TreeIndex::new(dir.path());
    index.refresh(RefreshOptions::default()).unwrap();
    let same = bytes_to_id(b"same content");
    let kept = index.get_by_id(&same).unwrap().path.clone();
    let other = if kept == "one" { "two" } else { "one" };

    fs::remove_file(dir.path().join(other)).unwrap();
    index.refresh(RefreshOptions::default()).unwrap();
    assert_eq!(index.get_by_id(&same).unwrap().path, kept);
}

#[test]
fn test_symlinks_are_not_followed() {
    let dir = tempdir().unwrap();
    populate(dir.path());
    std::os::unix::fs::symlink("sub", dir.path().join("link")).unwrap();

    let mut index = TreeIndex::new(dir.path());
    index.refresh(RefreshOptions::default()).unwrap();

    let link = index.get_by_path("link").unwrap();
    assert_eq!(link.otype, Some(ObjectType::Symlink));
    assert_eq!(link.cid, Some(bytes_to_id(b"sub")));
    assert!(index.get_by_path("link/three").is_none());
}

#[test]
fn test_save_load_roundtrip() {
    let dir = tempdir().unwrap();
    populate(dir.path());

    let mut index = TreeIndex::new(dir.path());
    index.refresh(RefreshOptions::default()).unwrap();
    index.save().unwrap();
    assert!(dir.path().join(".cas").exists());

    let mut loaded = TreeIndex::new(dir.path());
    assert!(loaded.load().unwrap());
    let summary = |index: &TreeIndex| {
        index
            .records()
            .map(|r| (r.path.clone(), r.cid.clone(), r.fileid))
            .collect::<Vec<_>>()
    };
    assert_eq!(summary(&loaded), summary(&index));

    let stats = loaded.refresh(RefreshOptions::default()).unwrap();
    assert_eq!(stats.new_entries, 0);
    assert_eq!(stats.refreshed_entries, 0);
}

#[test]
fn test_metadata_files_are_not_indexed() {
    let dir = tempdir().unwrap();
    populate(dir.path());

    let mut index = TreeIndex::new(dir.path());
    index.refresh(RefreshOptions::default()).unwrap();
    index.save().unwrap();
    index.save().unwrap();
    assert!(dir.path().join(".cas.bak").exists());

    let stats = index.refresh(RefreshOptions::default()).unwrap();
    assert_eq!(stats.new_entries, 0);
    assert!(index.get_by_path(".cas").is_none());
    assert!(index.get_by_path(".cas.bak").is_none());
}

#[test]
fn test_custom_metadata_location() {
    let dir = tempdir().unwrap();
    let elsewhere = tempdir().unwrap();
    populate(dir.path());

    let config = TreeConfig {
        metadata: elsewhere.path().join("tree.cas"),
        ..TreeConfig::default()
    };
    let index = TreeIndex::open(dir.path(), config.clone()).unwrap();
    assert_eq!(index.len(), 4);
    index.save().unwrap();
    assert!(elsewhere.path().join("tree.cas").exists());
    assert!(!dir.path().join(".cas").exists());

    let reopened = TreeIndex::open(dir.path(), config).unwrap();
    assert_eq!(reopened.len(), 4);
}

#[test]
fn test_checkpoint_saves_during_refresh() {
    let dir = tempdir().unwrap();
    populate(dir.path());

    let mut index = TreeIndex::new(dir.path());
    index
        .refresh(RefreshOptions {
            checkpoint: Some(Duration::ZERO),
            ..Default::default()
        })
        .unwrap();

    let saved = codec::load(&dir.path().join(".cas")).unwrap().unwrap();
    assert_eq!(saved.len(), 4);
}

#[test]
fn test_checkpoint_failure_aborts() {
    let dir = tempdir().unwrap();
    populate(dir.path());

    let config = TreeConfig {
        metadata: dir.path().join("missing/dir/.cas"),
        ..TreeConfig::default()
    };
    let mut index = TreeIndex::with_config(dir.path(), config);
    let result = index.refresh(RefreshOptions {
        checkpoint: Some(Duration::from_secs(60)),
        ..Default::default()
    });
    assert!(matches!(result, Err(CasError::Checkpoint { .. })));
}

#[test]
fn test_stale_records_survive_save() {
    let dir = tempdir().unwrap();
    populate(dir.path());

    let mut index = TreeIndex::new(dir.path());
    index.refresh(RefreshOptions::default()).unwrap();

    let mut records: Vec<_> = index.records().cloned().collect();
    for record in records.iter_mut().filter(|r| r.path == "one") {
        record.cid = None;
        record.stale = true;
    }
    codec::save(index.metadata_path(), &records).unwrap();

    let mut resumed = TreeIndex::new(dir.path());
    assert!(resumed.load().unwrap());
    assert!(resumed.get_by_path("one").unwrap().stale);

    let stats = resumed.refresh(RefreshOptions::default()).unwrap();
    assert_eq!(stats.refreshed_entries, 1);
    assert_eq!(cid(&resumed, "one"), Some(bytes_to_id(b"same content")));
}

#[test]
fn test_refresh_on_tracker() {
    let dir = tempdir().unwrap();
    populate(dir.path());

    let tracker = ProgressTracker::new(|progress, mut index: TreeIndex| {
        let stats = index.refresh_with_progress(RefreshOptions::default(), progress);
        (index, stats)
    })
    .with_poll_interval(Duration::from_millis(20));

    let (index, stats) = tracker.run(TreeIndex::new(dir.path())).unwrap().unwrap();
    let stats = stats.unwrap();
    assert_eq!(stats.refreshed_entries, 4);
    assert_eq!(index.len(), 4);

    let sample = tracker.sample();
    assert_eq!(sample.steps, 4);
    assert_eq!(sample.done, 4);
    assert_eq!(sample.percent, 100);
}

#[test]
fn test_tree_store_is_read_only() {
    let dir = tempdir().unwrap();
    populate(dir.path());

    let mut index = TreeIndex::new(dir.path());
    index.refresh(RefreshOptions::default()).unwrap();

    let same = bytes_to_id(b"same content");
    assert!(index.contains(&same));
    assert!(index.contains_str(&same.to_string()).unwrap());
    assert_eq!(index.ids().count(), 3);
    assert!(matches!(index.get(&same), Err(StoreError::Unsupported)));
    assert!(matches!(
        index.put(b"new", None, None),
        Err(StoreError::ReadOnly)
    ));
}
