use super::{ResultCache, CACHE_FILE_NAME};
use std::fs;
use tempfile::tempdir;

const SUMMARY: &str = "   read: IOPS=12.3k, BW=48.1MiB/s (50.4MB/s)(2887MiB/60001msec)";

#[test]
pub fn missing_file_is_empty_cache() {
    let dir = tempdir().unwrap();
    let mut cache = ResultCache::in_dir(dir.path(), false);

    cache.load().unwrap();

    assert!(cache.is_empty());
    assert_eq!(cache.lookup("fio --bs=4k"), None);
}

#[test]
pub fn survives_reload() {
    let dir = tempdir().unwrap();
    let mut cache = ResultCache::in_dir(dir.path(), false);
    cache.load().unwrap();
    cache.store("fio --rw=read --bs=4k", SUMMARY.to_string()).unwrap();

    let mut reloaded = ResultCache::in_dir(dir.path(), false);
    reloaded.load().unwrap();

    assert_eq!(reloaded.lookup("fio --rw=read --bs=4k"), Some(SUMMARY));
    assert!(dir.path().join(CACHE_FILE_NAME).is_file());
}

#[test]
pub fn reordered_command_hits() {
    let dir = tempdir().unwrap();
    let mut cache = ResultCache::in_dir(dir.path(), false);
    cache.store("fio --rw=read --bs=4k", SUMMARY.to_string()).unwrap();

    let mut reloaded = ResultCache::in_dir(dir.path(), false);
    reloaded.load().unwrap();

    assert_eq!(reloaded.lookup("fio --bs=4k --rw=read"), Some(SUMMARY));
    assert_eq!(reloaded.lookup("fio --bs=8k --rw=read"), None);
}

#[test]
pub fn update_cache_never_hits() {
    let dir = tempdir().unwrap();
    let mut cache = ResultCache::in_dir(dir.path(), false);
    cache.store("fio --bs=4k", SUMMARY.to_string()).unwrap();

    let mut refreshing = ResultCache::in_dir(dir.path(), true);
    refreshing.load().unwrap();

    assert_eq!(refreshing.len(), 1);
    assert_eq!(refreshing.lookup("fio --bs=4k"), None);

    refreshing.store("fio --bs=4k", String::from("   new")).unwrap();

    let mut reloaded = ResultCache::in_dir(dir.path(), false);
    reloaded.load().unwrap();
    assert_eq!(reloaded.lookup("fio --bs=4k"), Some("   new"));
}

#[test]
pub fn reordered_store_replaces_previous_entry() {
    let dir = tempdir().unwrap();
    let mut cache = ResultCache::in_dir(dir.path(), false);
    cache.store("fio --rw=read --bs=4k", String::from("first")).unwrap();
    cache.store("fio --bs=4k --rw=read", String::from("second")).unwrap();

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.lookup("fio --rw=read --bs=4k"), Some("second"));

    let mut reloaded = ResultCache::in_dir(dir.path(), false);
    reloaded.load().unwrap();
    assert_eq!(
        reloaded.entries().collect::<Vec<_>>(),
        vec![("fio --bs=4k --rw=read", "second")]
    );
}

#[test]
pub fn creates_missing_run_directory() {
    let dir = tempdir().unwrap();
    let nested = dir.path().join("data").join("aks-benchmark-kata-2");
    let mut cache = ResultCache::in_dir(&nested, false);

    cache.store("fio", String::from("result")).unwrap();

    assert!(nested.join(CACHE_FILE_NAME).is_file());
}

#[test]
pub fn corrupt_file_is_an_error() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join(CACHE_FILE_NAME), "[not, a, mapping").unwrap();

    let mut cache = ResultCache::in_dir(dir.path(), false);

    assert!(cache.load().is_err());
}

#[test]
pub fn empty_file_is_empty_cache() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join(CACHE_FILE_NAME), "").unwrap();

    let mut cache = ResultCache::in_dir(dir.path(), false);
    cache.load().unwrap();

    assert!(cache.is_empty());
}

#[test]
pub fn load_collapses_reordered_duplicates() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join(CACHE_FILE_NAME),
        "fio --rw=read --bs=4k: first\nfio --bs=4k --rw=read: second\n",
    )
    .unwrap();

    let mut cache = ResultCache::in_dir(dir.path(), false);
    cache.load().unwrap();

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.lookup("fio --rw=read --bs=4k"), Some("second"));
    assert_eq!(cache.lookup("fio --bs=4k --rw=read"), Some("second"));

    cache.store("fio --rw=read --bs=4k", String::from("third")).unwrap();

    let mut reloaded = ResultCache::in_dir(dir.path(), false);
    reloaded.load().unwrap();
    assert_eq!(
        reloaded.entries().collect::<Vec<_>>(),
        vec![("fio --rw=read --bs=4k", "third")]
    );
}
