pub mod config;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod fake;
pub mod guest;
pub mod hypervisor;
pub mod instance;
pub mod job_info;
pub mod logger;
pub mod migration;
pub mod monitor;
pub mod records;
pub mod tasks;
pub mod virsh;
pub mod xml_patch;

pub use error::MigrationError;
pub use instance::{Instance, TaskState};

pub type Result<T> = std::result::Result<T, MigrationError>;

// Convenience re-exports for callers driving a migration
pub use config::MigrationConfig;
pub use guest::Guest;
pub use monitor::{MigrationMonitor, MigrationOutcome, MigrationRequest};
pub use records::{JsonFileRecorder, Migration, Recorder};
pub use xml_patch::{ConnectionInfoResolver, LiveMigrateData};
