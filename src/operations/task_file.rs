//! JSON file task store.

use crate::task::{Task, TaskUpdate};
use crate::testing::TaskStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// On-disk layout of the tasks file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub tasks: Vec<Task>,
}

/// Task store backed by a single JSON file.
///
/// Every update is a read-modify-write under an exclusive `fs2` lock, and the
/// file is replaced atomically so other readers never see a partial write.
/// A missing file reads as an empty backlog.
///
/// The async trait methods run the file work on the blocking pool, so a lock
/// held by another process (say `foreman tasks sweep`) never stalls the
/// runtime.
#[derive(Debug, Clone)]
pub struct JsonFileTaskStore {
    path: PathBuf,
}

impl JsonFileTaskStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn lock(&self, exclusive: bool) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = File::create(self.lock_path()).context("Failed to open task lock file")?;
        if exclusive {
            FileExt::lock_exclusive(&file).context("Failed to lock tasks file")?;
        } else {
            FileExt::lock_shared(&file).context("Failed to lock tasks file")?;
        }
        Ok(file)
    }

    /// Read the file without locking.
    fn read_unlocked(&self) -> Result<TaskFile> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No tasks file at {}", self.path.display());
                return Ok(TaskFile::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }

    fn write_unlocked(&self, file: &TaskFile) -> Result<()> {
        let json = serde_json::to_string_pretty(file)?;
        let tmp_path = self.tmp_path();
        let mut tmp = File::create(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        tmp.write_all(json.as_bytes())?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// Load every task under a shared lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<Vec<Task>> {
        let _lock = self.lock(false)?;
        Ok(self.read_unlocked()?.tasks)
    }

    /// Replace the whole backlog.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, tasks: &[Task]) -> Result<()> {
        let _lock = self.lock(true)?;
        self.write_unlocked(&TaskFile {
            tasks: tasks.to_vec(),
        })
    }

    /// Apply one update under an exclusive lock.
    fn update_locked(&self, id: &str, update: TaskUpdate) -> Result<Option<Task>> {
        let _lock = self.lock(true)?;
        let mut file = self.read_unlocked()?;
        let Some(task) = file.tasks.iter_mut().find(|t| t.id == id) else {
            return Ok(None);
        };
        update.apply(task, Utc::now());
        let updated = task.clone();
        self.write_unlocked(&file)?;
        debug!("Updated task {} in {}", id, self.path.display());
        Ok(Some(updated))
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(JsonFileTaskStore) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(store))
            .await
            .context("Task store worker panicked")?
    }
}

#[async_trait]
impl TaskStore for JsonFileTaskStore {
    async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.blocking(|store| store.load()).await
    }

    async fn get(&self, id: &str) -> Result<Option<Task>> {
        let id = id.to_string();
        self.blocking(move |store| Ok(store.load()?.into_iter().find(|t| t.id == id)))
            .await
    }

    async fn update(&self, id: &str, update: TaskUpdate) -> Result<Option<Task>> {
        let id = id.to_string();
        self.blocking(move |store| store.update_locked(&id, update))
            .await
    }
}
