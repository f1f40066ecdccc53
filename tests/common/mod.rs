use std::path::Path;

use blobsync::config::{parse_storage_url, SyncConfig};

pub fn build_tree(dir: &Path, entries: &[(&str, &[u8])]) {
    for (key, content) in entries {
        let path = dir.join(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
}

pub fn read_tree(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let mut entries = vec![];
    for entry in walkdir_sorted(dir) {
        let key = entry
            .strip_prefix(dir)
            .unwrap()
            .to_string_lossy()
            .to_string();
        entries.push((key, std::fs::read(&entry).unwrap()));
    }
    entries
}

fn walkdir_sorted(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files = vec![];
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

pub fn fs_to_fs_config(source: &Path, target: &Path) -> SyncConfig {
    let mut config = SyncConfig::new(
        parse_storage_url(source.to_str().unwrap()).unwrap(),
        parse_storage_url(target.to_str().unwrap()).unwrap(),
    );
    // small worker pools keep the test runtime lean
    config.worker_size = 4;
    config
}

/// Whether the filesystem under this directory stores user extended
/// attributes. Some tmpfs mounts do not.
#[cfg(unix)]
pub fn xattr_available(dir: &Path) -> bool {
    let probe = dir.join(".xattr-probe");
    std::fs::write(&probe, b"probe").unwrap();
    let supported = xattr::set(&probe, "user.blobsync.probe", b"1").is_ok();
    let _ = std::fs::remove_file(&probe);
    supported
}

#[cfg(not(unix))]
pub fn xattr_available(_dir: &Path) -> bool {
    false
}
