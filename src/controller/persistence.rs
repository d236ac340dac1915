//! Atomic file-based storage of the controller snapshot.
//!
//! The snapshot exists for crash visibility. On restart only the token
//! budget buckets are restored; the controller itself always starts `idle`.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::state::ControllerState;
use crate::error::{ForemanError, Result};
use crate::usage::UsageSnapshot;

/// Default state file name.
const STATE_FILE: &str = "state.json";

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file suffix for concurrent access prevention.
const LOCK_SUFFIX: &str = ".lock";

/// Current schema version of the snapshot file.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// On-disk snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub pid: u32,
    pub state: ControllerState,
    pub usage: UsageSnapshot,
}

impl PersistedState {
    #[must_use]
    pub fn new(state: ControllerState, usage: UsageSnapshot) -> Self {
        Self {
            version: STATE_SCHEMA_VERSION,
            saved_at: Utc::now(),
            pid: std::process::id(),
            state,
            usage,
        }
    }
}

/// Snapshot store rooted at a directory (normally `.foreman/`).
#[derive(Debug, Clone)]
pub struct StatePersistence {
    dir: PathBuf,
}

impl StatePersistence {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn state_file_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    #[must_use]
    pub fn tmp_file_path(&self) -> PathBuf {
        self.dir.join(format!("{STATE_FILE}{TMP_SUFFIX}"))
    }

    #[must_use]
    pub fn lock_file_path(&self) -> PathBuf {
        self.dir.join(format!("{STATE_FILE}{LOCK_SUFFIX}"))
    }

    /// Write the snapshot atomically (tmp file + rename under a lock).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory, lock or file cannot be written.
    pub fn save(&self, snapshot: &PersistedState) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let lock_file = File::create(self.lock_file_path())?;
        FileExt::lock_exclusive(&lock_file)
            .map_err(|e| ForemanError::store(format!("Failed to acquire state lock: {e}")))?;

        let tmp_path = self.tmp_file_path();
        let json = serde_json::to_string_pretty(snapshot)?;

        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;

        fs::rename(&tmp_path, self.state_file_path())?;

        Ok(())
    }

    /// Load the snapshot, if a readable one exists.
    ///
    /// Corrupted or incompatible files are reported and ignored.
    ///
    /// # Errors
    ///
    /// Returns an error only on I/O failures other than a missing file.
    pub fn load(&self) -> Result<Option<PersistedState>> {
        let state_path = self.state_file_path();

        if !state_path.exists() {
            return Ok(None);
        }

        let lock_path = self.lock_file_path();
        if lock_path.exists() {
            let lock_file = File::open(&lock_path)?;
            FileExt::lock_shared(&lock_file)
                .map_err(|e| ForemanError::store(format!("Failed to acquire state lock: {e}")))?;
        }

        let mut file = match File::open(&state_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let snapshot: PersistedState = match serde_json::from_str(&contents) {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    "Ignoring corrupted state file at {}: {}",
                    state_path.display(),
                    e
                );
                return Ok(None);
            }
        };

        if snapshot.version != STATE_SCHEMA_VERSION {
            warn!(
                "Ignoring state file with schema version {} (expected {})",
                snapshot.version, STATE_SCHEMA_VERSION
            );
            return Ok(None);
        }

        Ok(Some(snapshot))
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.state_file_path().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::state::ControllerStatus;
    use crate::usage::{TokenUsageTracker, UsageLimitConfig};
    use tempfile::TempDir;

    fn test_persistence() -> (StatePersistence, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let persistence = StatePersistence::new(temp_dir.path().join(".foreman"));
        (persistence, temp_dir)
    }

    fn snapshot() -> PersistedState {
        let mut tracker = TokenUsageTracker::new(UsageLimitConfig::default(), Utc::now());
        tracker.update(1200, 300, None, Utc::now());
        let mut state = ControllerState::new(&tracker);
        state.status = ControllerStatus::Running;
        state.processed_count = 4;
        PersistedState::new(state, tracker.snapshot())
    }

    #[test]
    fn test_load_returns_none_when_missing() {
        let (persistence, _temp_dir) = test_persistence();
        assert!(persistence.load().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let (persistence, _temp_dir) = test_persistence();
        let saved = snapshot();
        persistence.save(&saved).unwrap();

        assert!(persistence.exists());
        assert!(!persistence.tmp_file_path().exists());

        let loaded = persistence.load().unwrap().unwrap();
        assert_eq!(loaded.state.processed_count, 4);
        assert_eq!(loaded.usage.hourly.total(), 1500);
    }

    #[test]
    fn test_corrupted_file_is_ignored() {
        let (persistence, _temp_dir) = test_persistence();
        fs::create_dir_all(&persistence.dir).unwrap();
        fs::write(persistence.state_file_path(), "not valid json {{{").unwrap();

        assert!(persistence.load().unwrap().is_none());
    }

    #[test]
    fn test_incompatible_version_is_ignored() {
        let (persistence, _temp_dir) = test_persistence();
        let mut saved = snapshot();
        saved.version = 999;
        persistence.save(&saved).unwrap();

        assert!(persistence.load().unwrap().is_none());
    }
}
