//! Migration records and their persistence.

use crate::instance::Instance;
use crate::job_info::JobInfo;
use crate::{MigrationError, Result, log_debug};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_POSTCOPY: &str = "running (post-copy)";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_CANCELLED: &str = "cancelled";
pub const STATUS_ERROR: &str = "error";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    pub id: Uuid,
    pub instance_uuid: Uuid,
    pub source_compute: String,
    pub dest_compute: String,
    /// Free-form; `running` and `running (post-copy)` drive policy.
    pub status: String,
    #[serde(default)]
    pub memory_total: u64,
    #[serde(default)]
    pub memory_processed: u64,
    #[serde(default)]
    pub memory_remaining: u64,
    #[serde(default)]
    pub disk_total: u64,
    #[serde(default)]
    pub disk_processed: u64,
    #[serde(default)]
    pub disk_remaining: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Migration {
    pub fn new(instance: &Instance, dest_compute: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            instance_uuid: instance.uuid,
            source_compute: instance.host.clone(),
            dest_compute: dest_compute.to_string(),
            status: STATUS_QUEUED.to_string(),
            memory_total: 0,
            memory_processed: 0,
            memory_remaining: 0,
            disk_total: 0,
            disk_processed: 0,
            disk_remaining: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: &str) {
        self.status = status.to_string();
        self.updated_at = Utc::now();
    }

    pub fn is_postcopy(&self) -> bool {
        self.status == STATUS_POSTCOPY
    }

    pub fn apply_job_info(&mut self, info: &JobInfo) {
        self.memory_total = info.memory_total;
        self.memory_processed = info.memory_processed;
        self.memory_remaining = info.memory_remaining;
        self.disk_total = info.disk_total;
        self.disk_processed = info.disk_processed;
        self.disk_remaining = info.disk_remaining;
        self.updated_at = Utc::now();
    }
}

/// Durable storage for migration and instance records.
#[async_trait]
pub trait Recorder: Send + Sync {
    async fn save_migration(&self, migration: &Migration) -> Result<()>;

    async fn save_instance(&self, instance: &Instance) -> Result<()>;

    /// Persist both records of one poll tick.
    async fn save_progress(&self, migration: &Migration, instance: &Instance) -> Result<()> {
        self.save_migration(migration).await?;
        self.save_instance(instance).await
    }
}

/// Stores records as JSON files below a state directory.
pub struct JsonFileRecorder {
    root: PathBuf,
}

impl JsonFileRecorder {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn migration_path(&self, id: &Uuid) -> PathBuf {
        self.root.join("migrations").join(format!("{}.json", id))
    }

    fn instance_path(&self, uuid: &Uuid) -> PathBuf {
        self.root.join("instances").join(format!("{}.json", uuid))
    }

    async fn write_atomic(path: &Path, payload: Vec<u8>) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, path).await?;
        log_debug!("Saved record {}", path.display());
        Ok(())
    }

    async fn read(path: &Path) -> Result<Vec<u8>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(MigrationError::RecordNotFound(path.display().to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn load_migration(&self, id: &Uuid) -> Result<Migration> {
        let bytes = Self::read(&self.migration_path(id)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn load_instance(&self, uuid: &Uuid) -> Result<Instance> {
        let bytes = Self::read(&self.instance_path(uuid)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl Recorder for JsonFileRecorder {
    async fn save_migration(&self, migration: &Migration) -> Result<()> {
        let payload = serde_json::to_vec_pretty(migration)?;
        Self::write_atomic(&self.migration_path(&migration.id), payload).await
    }

    async fn save_instance(&self, instance: &Instance) -> Result<()> {
        let payload = serde_json::to_vec_pretty(instance)?;
        Self::write_atomic(&self.instance_path(&instance.uuid), payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn json_recorder_round_trips_records() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let recorder = JsonFileRecorder::new(dir.path());

        let mut instance = Instance::new("db-1".into(), "src".into(), 4096);
        instance.set_progress_from_remaining(40);
        let mut migration = Migration::new(&instance, "dst");
        migration.set_status(STATUS_POSTCOPY);
        migration.memory_total = 1 << 30;

        recorder.save_progress(&migration, &instance).await.unwrap();

        let loaded = recorder.load_migration(&migration.id).await.unwrap();
        assert!(loaded.is_postcopy());
        assert_eq!(loaded.memory_total, 1 << 30);
        assert_eq!(loaded.dest_compute, "dst");

        let loaded = recorder.load_instance(&instance.uuid).await.unwrap();
        assert_eq!(loaded.progress, 60);
    }

    #[tokio::test]
    async fn missing_record_is_reported() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let recorder = JsonFileRecorder::new(dir.path());

        let err = recorder.load_migration(&Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, MigrationError::RecordNotFound(_)));
    }
}
