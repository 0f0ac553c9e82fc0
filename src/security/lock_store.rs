// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-tab persistence of the screen-lock state.
//!
//! A lock must survive a reload of the same console but must not leak into
//! another one, so the file is keyed by a tab id: `CLINICGATE_TAB_ID` when
//! set, otherwise the parent process (the terminal session).
//!
//! Writes use an exclusive lock on a sidecar `.lock` file plus temp-file and
//! atomic rename, so a crash mid-write leaves either the old or the new
//! state. A state file that cannot be parsed restores as *locked*.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::thread;
use std::time::{Duration, Instant};

use super::lock_guard::LockState;
use super::locks::{resilient_read, resilient_write};

/// Environment variable naming the current tab.
pub const TAB_ID_ENV: &str = "CLINICGATE_TAB_ID";

const LOCK_TIMEOUT: Duration = Duration::from_secs(2);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Storage for the lock state of one tab.
pub trait LockStore: Send + Sync {
    fn load(&self) -> Result<Option<LockState>>;
    fn save(&self, state: &LockState) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Identifier scoping persisted lock state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabId(String);

impl TabId {
    pub fn new(raw: &str) -> Self {
        let cleaned: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .take(64)
            .collect();
        if cleaned.is_empty() {
            Self("default".to_string())
        } else {
            Self(cleaned)
        }
    }

    /// Tab of the running process.
    pub fn current() -> Self {
        match std::env::var(TAB_ID_ENV) {
            Ok(id) if !id.trim().is_empty() => Self::new(&id),
            _ => Self(format!("ppid-{}", parent_process_id())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(unix)]
fn parent_process_id() -> u32 {
    std::os::unix::process::parent_id()
}

#[cfg(not(unix))]
fn parent_process_id() -> u32 {
    std::process::id()
}

/// File-backed store under the runtime (or cache) directory.
#[derive(Debug, Clone)]
pub struct FileLockStore {
    path: PathBuf,
}

impl FileLockStore {
    /// Store for `tab` in the default location.
    pub fn for_tab(tab: &TabId) -> Result<Self> {
        let base = dirs::runtime_dir()
            .or_else(dirs::cache_dir)
            .context("Could not find a runtime or cache directory")?;
        Ok(Self::at(
            base.join("clinicgate")
                .join("locks")
                .join(format!("{}.json", tab.as_str())),
        ))
    }

    /// Store at an explicit path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn open_lock_file(&self) -> Result<File> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file: {:?}", lock_path))
    }

    fn acquire(&self, exclusive: bool) -> Result<File> {
        let file = self.open_lock_file()?;
        let start = Instant::now();
        loop {
            let attempt = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match attempt {
                Ok(()) => return Ok(file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= LOCK_TIMEOUT {
                        bail!(
                            "Timed out waiting for lock on {:?} after {:?}",
                            self.lock_path(),
                            LOCK_TIMEOUT
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to lock {:?}", self.lock_path()));
                }
            }
        }
    }
}

impl LockStore for FileLockStore {
    fn load(&self) -> Result<Option<LockState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let _guard = self.acquire(false)?;

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read lock state {:?}", self.path))?;

        match serde_json::from_str::<LockState>(&content) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                tracing::warn!(
                    path = ?self.path,
                    error = %e,
                    "unreadable lock state; restoring as locked"
                );
                Ok(Some(LockState::corrupt_fallback()))
            }
        }
    }

    fn save(&self, state: &LockState) -> Result<()> {
        let _guard = self.acquire(true)?;
        let temp_path = self.path.with_extension("tmp");

        let content = serde_json::to_string_pretty(state)
            .context("Failed to serialize lock state")?;

        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file
                .write_all(content.as_bytes())
                .context("Failed to write lock state")?;
            temp_file.sync_all().context("Failed to sync lock state")?;
        }

        fs::rename(&temp_path, &self.path).with_context(|| {
            format!("Failed to move lock state into place: {:?} -> {:?}", temp_path, self.path)
        })?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let _guard = self.acquire(true)?;
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("Failed to remove lock state {:?}", self.path))?;
        }
        Ok(())
    }
}

/// In-process store, used when persistence is not wanted.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    state: RwLock<Option<LockState>>,
}

impl LockStore for MemoryLockStore {
    fn load(&self) -> Result<Option<LockState>> {
        Ok(resilient_read(&self.state).clone())
    }

    fn save(&self, state: &LockState) -> Result<()> {
        *resilient_write(&self.state) = Some(state.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *resilient_write(&self.state) = None;
        Ok(())
    }
}
