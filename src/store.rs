//! Content-addressed cache of node outputs.
//!
//! Every node output lives in its own directory, `<root>/<operator>.<hex>`,
//! where `<hex>` is the node fingerprint. A directory at that path always
//! holds a completed build: outputs are produced in a sibling `.tmp`
//! directory and renamed into place only after the build succeeded.

use std::fs::{self, File, OpenOptions};

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;

use crate::core::Fingerprint;
use crate::error::StoreError;

/// How a materialization was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialized {
    /// The directory already existed; the build was not invoked.
    Cached,
    /// The build ran and its output was published.
    Built,
}

/// Failure of [`Store::materialize`]: either the cache itself or the build.
#[derive(Debug)]
pub enum Failure<E> {
    Store(StoreError),
    Build(E),
}

impl<E> From<StoreError> for Failure<E> {
    fn from(err: StoreError) -> Self {
        Failure::Store(err)
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
    lock: bool,
}

impl Store {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: true,
        }
    }

    /// Enables or disables per-fingerprint file locks. Locks are only needed
    /// when several processes share one cache root.
    pub fn with_locking(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The output directory of a node running `operator` with `fingerprint`.
    pub fn location(&self, operator: &str, fingerprint: Fingerprint) -> Utf8PathBuf {
        self.root.join(format!("{operator}.{fingerprint}"))
    }

    /// Ensures `final_dir` exists and holds a completed build, calling `build`
    /// at most once to produce it.
    ///
    /// An existing `final_dir` is trusted as is. Otherwise `build` is given a
    /// fresh scratch directory (`<final_dir>.tmp`), which is renamed onto
    /// `final_dir` once `build` succeeds. A failed build leaves its scratch
    /// directory behind for inspection; the next attempt clears it.
    pub fn materialize<F, E>(&self, final_dir: &Utf8Path, build: F) -> Result<Materialized, Failure<E>>
    where
        F: FnOnce(&Utf8Path) -> Result<(), E>,
    {
        if is_present(final_dir)? {
            tracing::debug!(dir = %final_dir, "cache hit");
            return Ok(Materialized::Cached);
        }

        if let Some(parent) = final_dir.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::new("create cache directory", parent, e))?;
        }

        let _guard = if self.lock {
            Some(LockGuard::acquire(&sibling(final_dir, "lock"))?)
        } else {
            None
        };

        // Another process may have published while we waited for the lock.
        if self.lock && is_present(final_dir)? {
            tracing::debug!(dir = %final_dir, "cache hit after lock");
            return Ok(Materialized::Cached);
        }

        let temp = sibling(final_dir, "tmp");

        if is_present(&temp)? {
            tracing::warn!(dir = %temp, "clearing leftover scratch directory");
            fs::remove_dir_all(&temp)
                .map_err(|e| StoreError::new("remove stale scratch directory", &temp, e))?;
        }

        fs::create_dir_all(&temp)
            .map_err(|e| StoreError::new("create scratch directory", &temp, e))?;

        build(&temp).map_err(Failure::Build)?;

        fs::rename(&temp, final_dir)
            .map_err(|e| StoreError::new("publish build output to", final_dir, e))?;

        Ok(Materialized::Built)
    }
}

/// `<path>.<suffix>`, next to `path`.
fn sibling(path: &Utf8Path, suffix: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{path}.{suffix}"))
}

fn is_present(path: &Utf8Path) -> Result<bool, StoreError> {
    path.try_exists()
        .map_err(|e| StoreError::new("check", path, e))
}

/// Exclusive advisory lock, released when dropped.
struct LockGuard(File);

impl LockGuard {
    fn acquire(path: &Utf8Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StoreError::new("open lock file", path, e))?;

        file.lock_exclusive()
            .map_err(|e| StoreError::new("lock", path, e))?;

        Ok(Self(file))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn root() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, Store::new(path.join("cache")))
    }

    #[test]
    fn test_location_layout() {
        let store = Store::new("/data");
        let fp = Fingerprint::from([0u8; 32]);

        assert_eq!(
            store.location("Const", fp),
            Utf8PathBuf::from(format!("/data/Const.{}", "0".repeat(64)))
        );
    }

    #[test]
    fn test_build_then_hit() {
        let (_dir, store) = root();
        let target = store.root().join("Op.aa");
        let calls = Cell::new(0);

        let build = |scratch: &Utf8Path| -> Result<(), std::io::Error> {
            calls.set(calls.get() + 1);
            fs::write(scratch.join("out.txt"), "done")
        };

        let first = store.materialize(&target, build).unwrap();
        let second = store.materialize(&target, build).unwrap();

        assert_eq!(first, Materialized::Built);
        assert_eq!(second, Materialized::Cached);
        assert_eq!(calls.get(), 1);
        assert_eq!(fs::read_to_string(target.join("out.txt")).unwrap(), "done");
        assert!(!sibling(&target, "tmp").exists());
    }

    #[test]
    fn test_failed_build_is_not_published() {
        let (_dir, store) = root();
        let target = store.root().join("Op.bb");

        let result = store.materialize(&target, |scratch: &Utf8Path| {
            fs::write(scratch.join("partial.txt"), "half").unwrap();
            Err("boom")
        });

        assert!(matches!(result, Err(Failure::Build("boom"))));
        assert!(!target.exists());
        // kept for postmortem
        assert!(sibling(&target, "tmp").join("partial.txt").exists());

        let retried = store
            .materialize(&target, |scratch: &Utf8Path| {
                assert!(!scratch.join("partial.txt").exists());
                fs::write(scratch.join("full.txt"), "whole")
            })
            .unwrap();

        assert_eq!(retried, Materialized::Built);
        assert!(target.join("full.txt").exists());
        assert!(!target.join("partial.txt").exists());
    }

    #[test]
    fn test_existing_directory_is_trusted() {
        let (_dir, store) = root();
        let target = store.root().join("Op.cc");
        fs::create_dir_all(&target).unwrap();

        let result = store.materialize(&target, |_: &Utf8Path| -> Result<(), ()> {
            panic!("build must not run on a cache hit")
        });

        assert!(matches!(result, Ok(Materialized::Cached)));
    }

    #[test]
    fn test_without_locking() {
        let (_dir, store) = root();
        let store = store.with_locking(false);
        let target = store.root().join("Op.dd");

        store
            .materialize(&target, |_: &Utf8Path| Ok::<_, ()>(()))
            .unwrap();

        assert!(target.is_dir());
        assert!(!sibling(&target, "lock").exists());
    }
}
