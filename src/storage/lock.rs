// src/storage/lock.rs

use crate::error::Result;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::warn;

const LOCK_POLL: Duration = Duration::from_millis(10);
/// A lock file older than this is assumed to belong to a dead process.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// Exclusive cross-process advisory lock on a sibling `<path>.lock` file.
///
/// Acquisition blocks (sleep-poll); it never fails with "locked". The guard
/// releases on drop on all exit paths. Not re-entrant: a caller holding the
/// lock must not acquire it again.
#[derive(Debug)]
pub struct FileLock {
    lock_path: PathBuf,
}

impl FileLock {
    pub fn acquire(target: &Path) -> Result<Self> {
        let lock_path = lock_path_for(target);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    // Owner pid, for post-mortem inspection only.
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self { lock_path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    reap_if_stale(&lock_path);
                    thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.lock_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.lock_path.display(), error = %e, "Failed to release file lock");
            }
        }
    }
}

fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}

fn reap_if_stale(lock_path: &Path) {
    let Ok(meta) = fs::metadata(lock_path) else {
        return;
    };
    let Ok(modified) = meta.modified() else {
        return;
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default();
    if age > LOCK_STALE_AFTER {
        warn!(path = %lock_path.display(), age_secs = age.as_secs(), "Removing stale lock file");
        let _ = fs::remove_file(lock_path);
    }
}

/// Writes `content` atomically: temp sibling, fsync, rename over the target.
/// Parent directories are created lazily. With `enforce_permissions`, new
/// directories get `0o700` and the file `0o600` on Unix.
pub fn atomic_write(path: &Path, content: &[u8], enforce_permissions: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
        if enforce_permissions {
            harden_dir(parent);
        }
    }
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);

    if enforce_permissions {
        harden_file(&tmp_path);
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(unix)]
pub(crate) fn harden_dir(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o700));
}

#[cfg(unix)]
pub(crate) fn harden_file(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
pub(crate) fn harden_dir(_path: &Path) {}

#[cfg(not(unix))]
pub(crate) fn harden_file(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_guard_creates_and_removes_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state.json");
        let lock_file = dir.path().join("state.json.lock");
        {
            let _guard = FileLock::acquire(&target).unwrap();
            assert!(lock_file.exists());
        }
        assert!(!lock_file.exists());
    }

    #[test]
    fn lock_blocks_until_holder_releases() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state.json");
        let guard = FileLock::acquire(&target).unwrap();

        let target_clone = target.clone();
        let handle = thread::spawn(move || {
            let _second = FileLock::acquire(&target_clone).unwrap();
        });
        // Give the second acquirer a moment to start polling.
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        drop(guard);
        handle.join().unwrap();
    }

    #[test]
    fn atomic_write_creates_parents_and_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        atomic_write(&path, b"first", true).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");
        atomic_write(&path, b"second", true).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!path.with_file_name("state.json.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn atomic_write_hardens_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secure").join("state.json");
        atomic_write(&path, b"{}", true).unwrap();
        let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn unwritable_parent_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        // Parent path is a regular file; directory creation must fail.
        let result = atomic_write(&blocker.join("state.json"), b"{}", false);
        assert!(result.is_err());
    }
}
