use crate::hypervisor::MigrateFlags;
use crate::{MigrationError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DOWNTIME_MIN_MS: u64 = 100;
pub const DOWNTIME_STEPS_MIN: u32 = 3;
pub const DOWNTIME_DELAY_MIN_SECS: u64 = 10;

const STATE_DIR_FALLBACK: &str = "/var/lib/vmigrate";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Connection to the local hypervisor
    #[serde(default = "default_connection_uri")]
    pub connection_uri: String,
    /// Target URI template; `%s` is replaced with the destination host
    #[serde(default = "default_live_migration_uri")]
    pub live_migration_uri: String,
    /// Bandwidth cap in MiB/s, 0 lets the hypervisor choose
    #[serde(default)]
    pub bandwidth_mib: u64,
    /// Maximum permitted switchover downtime
    #[serde(default = "default_downtime_ms")]
    pub downtime_ms: u64,
    /// Increments used to reach `downtime_ms`
    #[serde(default = "default_downtime_steps")]
    pub downtime_steps: u32,
    /// Seconds between downtime increments, per GiB transferred
    #[serde(default = "default_downtime_delay_secs")]
    pub downtime_delay_secs: u64,
    /// Seconds per GiB before the migration is aborted; 0 disables
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: i64,
    /// Seconds without forward progress before aborting; 0 disables
    #[serde(default = "default_progress_timeout_secs")]
    pub progress_timeout_secs: i64,
    #[serde(default)]
    pub permit_post_copy: bool,
    #[serde(default)]
    pub permit_auto_converge: bool,
    #[serde(default)]
    pub tunnelled: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_connection_uri() -> String {
    "qemu:///system".to_string()
}

fn default_live_migration_uri() -> String {
    "qemu+tcp://%s/system".to_string()
}

fn default_downtime_ms() -> u64 {
    500
}

fn default_downtime_steps() -> u32 {
    10
}

fn default_downtime_delay_secs() -> u64 {
    75
}

fn default_completion_timeout_secs() -> i64 {
    800
}

fn default_progress_timeout_secs() -> i64 {
    150
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_state_dir() -> PathBuf {
    if let Some(mut dir) = dirs::data_dir() {
        dir.push("vmigrate");
        dir
    } else {
        PathBuf::from(STATE_DIR_FALLBACK)
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            connection_uri: default_connection_uri(),
            live_migration_uri: default_live_migration_uri(),
            bandwidth_mib: 0,
            downtime_ms: default_downtime_ms(),
            downtime_steps: default_downtime_steps(),
            downtime_delay_secs: default_downtime_delay_secs(),
            completion_timeout_secs: default_completion_timeout_secs(),
            progress_timeout_secs: default_progress_timeout_secs(),
            permit_post_copy: false,
            permit_auto_converge: false,
            tunnelled: false,
            poll_interval_ms: default_poll_interval_ms(),
            state_dir: default_state_dir(),
        }
    }
}

impl MigrationConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let config: MigrationConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).map_err(|_e| MigrationError::InvalidConfig)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(MigrationError::ConfigError(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if !self.live_migration_uri.contains("%s") {
            return Err(MigrationError::ConfigError(format!(
                "live_migration_uri '{}' has no %s placeholder for the destination",
                self.live_migration_uri
            )));
        }
        Ok(())
    }

    pub fn migration_uri(&self, dest: &str) -> String {
        self.live_migration_uri.replace("%s", dest)
    }

    pub fn effective_downtime(&self) -> u64 {
        self.downtime_ms.max(DOWNTIME_MIN_MS)
    }

    pub fn effective_steps(&self) -> u32 {
        self.downtime_steps.max(DOWNTIME_STEPS_MIN)
    }

    pub fn effective_delay(&self) -> u64 {
        self.downtime_delay_secs.max(DOWNTIME_DELAY_MIN_SECS)
    }

    pub fn migrate_flags(&self, block_migration: bool) -> MigrateFlags {
        MigrateFlags {
            live: true,
            peer2peer: true,
            tunnelled: self.tunnelled,
            persist_dest: true,
            undefine_source: true,
            non_shared_inc: block_migration,
            auto_converge: self.permit_auto_converge && !self.permit_post_copy,
            postcopy: self.permit_post_copy,
        }
    }
}
