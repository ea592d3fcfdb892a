//! Content-addressed cache (component C3): per-entry directory layout,
//! locking, completion markers, atomic promotion, and crash recovery
//! (spec §3, §4.3).
//!
//! ```text
//! <cache_root>/<identity>/<platform>-<arch>/<hash_prefix>/
//!     entry/{fetch,stage,tmp,install}/
//!     asset
//!     envy-fetch-complete
//!     envy-install-complete
//!     .lock
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::fs_util;
use crate::locking::{EntryLock as RawEntryLock, LockRegistry};
use crate::platform::{Arch, Platform};

const FETCH_COMPLETE_MARKER: &str = "envy-fetch-complete";
const INSTALL_COMPLETE_MARKER: &str = "envy-install-complete";
const ASSET_DIR: &str = "asset";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_root: PathBuf,
}

/// Fully-addressed cache entry coordinates: identity plus the hardware
/// tuple plus the cache-address hash prefix (spec §4.3).
#[derive(Debug, Clone)]
pub struct CacheAddress {
    pub identity: String,
    pub platform: Platform,
    pub arch: Arch,
    pub hash_prefix: String,
}

impl CacheAddress {
    fn entry_root(&self, cache_root: &Path) -> PathBuf {
        cache_root
            .join(&self.identity)
            .join(format!("{}-{}", self.platform, self.arch))
            .join(&self.hash_prefix)
    }
}

/// The outcome of `ensure_asset`/`ensure_spec`: either a cache hit (a
/// finished `pkg_path`, no lock) or a miss (a held lock to build under).
pub struct EnsureResult {
    pub pkg_path: Option<PathBuf>,
    pub lock: Option<ScopedEntryLock>,
}

pub struct Cache {
    config: CacheConfig,
    locks: LockRegistry,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Self {
        Cache {
            config,
            locks: LockRegistry::new(),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.config.cache_root
    }

    /// `ensure_asset(identity, platform, arch, hash_prefix)` (spec §4.3).
    /// Acquires the entry lock (in-process, then OS file lock). If the
    /// entry is already complete, releases the lock immediately and
    /// returns the finished asset path. Otherwise removes any crashed
    /// in-progress leftovers and returns a live lock for the caller to
    /// build under.
    pub fn ensure_asset(&self, address: &CacheAddress) -> Result<EnsureResult> {
        let entry_root = address.entry_root(&self.config.cache_root);
        self.ensure_entry(&entry_root)
    }

    /// `ensure_spec(identity)`: the same entry protocol, addressed only by
    /// identity — used to cache a fetched recipe script (and bundle
    /// archives) independent of options/platform/arch.
    pub fn ensure_spec(&self, identity: &str) -> Result<EnsureResult> {
        let entry_root = self.config.cache_root.join("_specs").join(identity);
        self.ensure_entry(&entry_root)
    }

    fn ensure_entry(&self, entry_root: &Path) -> Result<EnsureResult> {
        let entry_dir = entry_root.join("entry");
        let asset_dir = entry_root.join(ASSET_DIR);
        let install_complete = entry_root.join(INSTALL_COMPLETE_MARKER);
        let lock_path = entry_root.join(LOCK_FILE);

        let raw_lock = self.locks.acquire(entry_root, &lock_path)?;

        if install_complete.exists() {
            if !asset_dir.exists() {
                // Marker present but asset missing: cache corruption.
                // Recovery is to remove the entry and retry once (spec §7).
                warn!(path = %entry_root.display(), "cache corruption: install marker without asset, removing");
                fs_util::remove_dir_if_exists(entry_root)?;
                drop(raw_lock);
                return self.ensure_entry(entry_root);
            }
            debug!(path = %entry_root.display(), "cache hit");
            drop(raw_lock);
            return Ok(EnsureResult {
                pkg_path: Some(asset_dir),
                lock: None,
            });
        }

        if entry_dir.exists() {
            // entry/ present but not marked complete: a crashed prior
            // attempt. `fetch/` is left alone: its completeness is tracked
            // by the fetch marker at entry_root, which survives this wipe,
            // so removing fetch/ out from under it would leave the marker
            // claiming a fetch that no longer has any content on disk.
            info!(path = %entry_dir.display(), "removing crashed in-progress entry (preserving fetch/)");
            for sub in ["stage", "tmp", "install"] {
                fs_util::remove_dir_if_exists(&entry_dir.join(sub))?;
            }
        }

        for sub in ["fetch", "stage", "tmp", "install"] {
            fs::create_dir_all(entry_dir.join(sub))?;
        }

        debug!(path = %entry_root.display(), "cache miss, lock acquired");
        Ok(EnsureResult {
            pkg_path: None,
            lock: Some(ScopedEntryLock::new(entry_root.to_path_buf(), raw_lock)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockOutcome {
    InstallComplete,
    UserManaged,
    Abort,
}

/// A held cache entry lock. Its destruction policy (spec §4.3) depends on
/// which terminal method, if any, was called before it is dropped:
/// `mark_install_complete` promotes `install/` to `asset/`; `mark_user_managed`
/// removes the whole entry; neither (abort/panic/error) removes `entry/`.
pub struct ScopedEntryLock {
    entry_root: PathBuf,
    raw: Option<RawEntryLock>,
    outcome: LockOutcome,
    fetch_complete: bool,
}

impl ScopedEntryLock {
    fn new(entry_root: PathBuf, raw: RawEntryLock) -> Self {
        let fetch_complete = entry_root_has_fetch_marker(&entry_root);
        ScopedEntryLock {
            entry_root,
            raw: Some(raw),
            outcome: LockOutcome::Abort,
            fetch_complete,
        }
    }

    pub fn entry_dir(&self) -> PathBuf {
        self.entry_root.join("entry")
    }

    pub fn fetch_dir(&self) -> PathBuf {
        self.entry_dir().join("fetch")
    }

    pub fn stage_dir(&self) -> PathBuf {
        self.entry_dir().join("stage")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.entry_dir().join("tmp")
    }

    pub fn install_dir(&self) -> PathBuf {
        self.entry_dir().join("install")
    }

    /// The entry's working directory for shell-invoked phase verbs; the
    /// install directory once it exists, otherwise the entry root.
    pub fn work_dir(&self) -> PathBuf {
        self.entry_root.clone()
    }

    pub fn is_fetch_complete(&self) -> bool {
        self.fetch_complete
    }

    pub fn mark_fetch_complete(&mut self) -> Result<()> {
        fs::write(self.entry_root.join(FETCH_COMPLETE_MARKER), b"")?;
        self.fetch_complete = true;
        Ok(())
    }

    pub fn mark_install_complete(&mut self) {
        self.outcome = LockOutcome::InstallComplete;
    }

    pub fn mark_user_managed(&mut self) {
        self.outcome = LockOutcome::UserManaged;
    }

    /// Finish the lock, applying its destruction policy and returning the
    /// final asset path when install completed. Prefer this over relying
    /// on `Drop` so I/O errors during promotion are observable; `Drop`
    /// still applies the same policy (best-effort) if this is skipped.
    pub fn finish(mut self) -> Result<Option<PathBuf>> {
        let result = self.apply_outcome();
        self.raw.take();
        result
    }

    fn apply_outcome(&mut self) -> Result<Option<PathBuf>> {
        match self.outcome {
            LockOutcome::InstallComplete => {
                let asset_dir = self.entry_root.join(ASSET_DIR);
                fs_util::move_dir_atomic(&self.install_dir(), &asset_dir)?;
                fs::write(self.entry_root.join(INSTALL_COMPLETE_MARKER), b"")?;
                let entry_dir = self.entry_dir();
                let _ = fs_util::remove_dir_if_exists(&entry_dir.join("fetch"));
                let _ = fs_util::remove_dir_if_exists(&entry_dir.join("stage"));
                let _ = fs_util::remove_dir_if_exists(&entry_dir.join("tmp"));
                info!(path = %asset_dir.display(), "install complete, promoted to asset");
                Ok(Some(asset_dir))
            }
            LockOutcome::UserManaged => {
                fs_util::remove_dir_if_exists(&self.entry_root)?;
                Ok(None)
            }
            LockOutcome::Abort => {
                // Leave fetch/ alone: its completeness is tracked by the
                // fetch marker at entry_root, which outlives this wipe (see
                // `ensure_entry`'s crash-recovery path for the same rule).
                let entry_dir = self.entry_dir();
                for sub in ["stage", "tmp", "install"] {
                    fs_util::remove_dir_if_exists(&entry_dir.join(sub))?;
                }
                Ok(None)
            }
        }
    }
}

impl Drop for ScopedEntryLock {
    fn drop(&mut self) {
        if self.raw.is_some() {
            let _ = self.apply_outcome();
        }
    }
}

fn entry_root_has_fetch_marker(entry_root: &Path) -> bool {
    entry_root.join(FETCH_COMPLETE_MARKER).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_address(dir: &TempDir) -> (Cache, CacheAddress) {
        let cache = Cache::new(CacheConfig {
            cache_root: dir.path().to_path_buf(),
        });
        let address = CacheAddress {
            identity: "foo.hello@v1".into(),
            platform: Platform::Linux,
            arch: Arch::X86_64,
            hash_prefix: "abcdef0123456789".into(),
        };
        (cache, address)
    }

    #[test]
    fn miss_then_install_then_hit() {
        let dir = TempDir::new().unwrap();
        let (cache, address) = test_address(&dir);

        let result = cache.ensure_asset(&address).unwrap();
        assert!(result.pkg_path.is_none());
        let mut lock = result.lock.unwrap();
        fs::write(lock.install_dir().join("marker"), b"ok").unwrap();
        lock.mark_install_complete();
        let asset_path = lock.finish().unwrap().unwrap();
        assert_eq!(fs::read(asset_path.join("marker")).unwrap(), b"ok");

        let result2 = cache.ensure_asset(&address).unwrap();
        assert!(result2.lock.is_none());
        assert!(result2.pkg_path.unwrap().join("marker").exists());
    }

    #[test]
    fn abort_leaves_no_partial_state() {
        let dir = TempDir::new().unwrap();
        let (cache, address) = test_address(&dir);

        {
            let result = cache.ensure_asset(&address).unwrap();
            let lock = result.lock.unwrap();
            fs::write(lock.stage_dir().join("partial"), b"x").unwrap();
            // dropped without calling mark_install_complete: treated as abort.
        }

        let entry_root = address.entry_root(dir.path());
        assert!(!entry_root.join("entry").exists());
    }

    #[test]
    fn user_managed_leaves_no_entry() {
        let dir = TempDir::new().unwrap();
        let (cache, address) = test_address(&dir);

        let result = cache.ensure_asset(&address).unwrap();
        let mut lock = result.lock.unwrap();
        lock.mark_user_managed();
        let asset = lock.finish().unwrap();
        assert!(asset.is_none());

        let entry_root = address.entry_root(dir.path());
        assert!(!entry_root.exists());
    }

    #[test]
    fn crashed_in_progress_entry_is_removed_on_reacquire() {
        let dir = TempDir::new().unwrap();
        let (cache, address) = test_address(&dir);
        let entry_root = address.entry_root(dir.path());

        // Simulate a crash: entry/ present, no install-complete marker.
        fs::create_dir_all(entry_root.join("entry/install")).unwrap();
        fs::write(entry_root.join("entry/install/stale"), b"x").unwrap();

        let result = cache.ensure_asset(&address).unwrap();
        assert!(result.pkg_path.is_none());
        let lock = result.lock.unwrap();
        assert!(!lock.install_dir().join("stale").exists());
    }

    #[test]
    fn fetch_complete_marker_persists_across_acquisitions() {
        let dir = TempDir::new().unwrap();
        let (cache, address) = test_address(&dir);

        {
            let result = cache.ensure_asset(&address).unwrap();
            let mut lock = result.lock.unwrap();
            assert!(!lock.is_fetch_complete());
            std::fs::write(lock.fetch_dir().join("downloaded.tar.gz"), b"payload").unwrap();
            lock.mark_fetch_complete().unwrap();
            // Dropped without completing install: stage/tmp/install are
            // removed, but fetch/ and its marker both survive, so the next
            // acquisition sees a consistent "fetch already complete" state.
        }

        let entry_root = address.entry_root(dir.path());
        assert!(entry_root.join(FETCH_COMPLETE_MARKER).exists());
        assert!(entry_root.join("entry").join("fetch").join("downloaded.tar.gz").exists());
        assert!(!entry_root.join("entry").join("stage").exists());

        let result = cache.ensure_asset(&address).unwrap();
        let lock = result.lock.unwrap();
        assert!(lock.is_fetch_complete());
        assert!(lock.fetch_dir().join("downloaded.tar.gz").exists());
    }
}
