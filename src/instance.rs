use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Migrating,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub uuid: Uuid,
    pub name: String,
    pub host: String,
    pub memory_mb: u64,
    /// Migration progress, 0-100.
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub task_state: Option<TaskState>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Instance {
    pub fn new(name: String, host: String, memory_mb: u64) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            name,
            host,
            memory_mb,
            progress: 0,
            task_state: None,
            created_at: now,
            last_updated: now,
        }
    }

    /// Set progress from the percentage of memory still to copy.
    pub fn set_progress_from_remaining(&mut self, remaining_percent: u8) {
        self.progress = 100 - remaining_percent.min(100);
        self.last_updated = Utc::now();
    }

    pub fn update_task_state(&mut self, task_state: Option<TaskState>) {
        self.task_state = task_state;
        self.last_updated = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_complement_of_remaining() {
        let mut instance = Instance::new("web".into(), "src-host".into(), 2048);
        instance.set_progress_from_remaining(75);
        assert_eq!(instance.progress, 25);

        instance.set_progress_from_remaining(130);
        assert_eq!(instance.progress, 0);
    }
}
