//! Hypervisor binding surface.
//!
//! `Domain` is the thin per-guest binding a hypervisor connection hands out
//! (the `virsh` shell-out in [`crate::virsh`], the scripted fake in the
//! `fake` module). Everything above it talks to [`crate::guest::Guest`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub type HvResult<T> = std::result::Result<T, HypervisorError>;

/// Raw extensible job statistics, keyed by the hypervisor's field names.
pub type JobStats = HashMap<String, u64>;

/// Legacy fixed-field job info: type, time elapsed/remaining, then
/// data, memory and disk as total/processed/remaining triples.
pub type LegacyJobInfo = [u64; 12];

/// A local or remote hypervisor connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub uri: String,
}

impl Host {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new("qemu:///system")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NoSupport,
    NoDomain,
    OperationInvalid,
    Internal,
    Other(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypervisorError {
    pub code: ErrorCode,
    pub message: String,
}

impl HypervisorError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for HypervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.code, self.message)
    }
}

impl std::error::Error for HypervisorError {}

/// Background job classification reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JobType {
    #[default]
    None,
    Bounded,
    Unbounded,
    Completed,
    Failed,
    Cancelled,
}

impl JobType {
    pub fn from_code(code: u64) -> Self {
        match code {
            1 => JobType::Bounded,
            2 => JobType::Unbounded,
            3 => JobType::Completed,
            4 => JobType::Failed,
            5 => JobType::Cancelled,
            _ => JobType::None,
        }
    }

    pub fn code(&self) -> u64 {
        match self {
            JobType::None => 0,
            JobType::Bounded => 1,
            JobType::Unbounded => 2,
            JobType::Completed => 3,
            JobType::Failed => 4,
            JobType::Cancelled => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    NoState,
    Running,
    Paused,
    Shutdown,
    Crashed,
    Suspended,
}

/// Flags controlling how a migration is performed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateFlags {
    pub live: bool,
    pub peer2peer: bool,
    pub tunnelled: bool,
    pub persist_dest: bool,
    pub undefine_source: bool,
    pub non_shared_inc: bool,
    pub auto_converge: bool,
    pub postcopy: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XmlFlags {
    pub inactive: bool,
    pub secure: bool,
    pub migratable: bool,
}

impl XmlFlags {
    pub fn migratable() -> Self {
        Self {
            migratable: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrateParams {
    pub migrate_uri: Option<String>,
    pub destination_xml: Option<String>,
    pub bandwidth_mib: u64,
    pub migrate_disks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateRequest {
    pub destination: String,
    pub params: Option<MigrateParams>,
    pub flags: MigrateFlags,
    pub domain_xml: Option<String>,
    pub bandwidth_mib: u64,
}

/// Per-domain hypervisor calls. Implementations are expected to block for
/// as long as the underlying operation does.
#[async_trait]
pub trait Domain: Send + Sync {
    fn name(&self) -> &str;

    async fn job_stats(&self) -> HvResult<JobStats>;

    async fn job_info(&self) -> HvResult<LegacyJobInfo>;

    async fn is_active(&self) -> HvResult<bool>;

    async fn state(&self, host: &Host) -> HvResult<PowerState>;

    async fn suspend(&self) -> HvResult<()>;

    async fn resume(&self) -> HvResult<()>;

    async fn abort_job(&self) -> HvResult<()>;

    async fn migrate_set_max_downtime(&self, downtime_ms: u64) -> HvResult<()>;

    async fn migrate_start_post_copy(&self) -> HvResult<()>;

    async fn migrate(&self, request: &MigrateRequest) -> HvResult<()>;

    async fn xml_desc(&self, flags: XmlFlags) -> HvResult<String>;
}

/// Call sites whose failures are not uniformly fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    JobStats,
    LegacyJobInfo,
    SetMaxDowntime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The domain is gone after a migration; report the job as completed.
    TreatAsCompleted,
    /// The extensible stats call is missing; switch to the legacy call for good.
    FallbackToLegacy,
    LogAndContinue,
    Propagate,
}

pub fn disposition(operation: Operation, code: &ErrorCode) -> Disposition {
    match (operation, code) {
        (Operation::JobStats, ErrorCode::NoSupport) => Disposition::FallbackToLegacy,
        (
            Operation::JobStats | Operation::LegacyJobInfo,
            ErrorCode::NoDomain | ErrorCode::OperationInvalid,
        ) => Disposition::TreatAsCompleted,
        (Operation::SetMaxDowntime, _) => Disposition::LogAndContinue,
        _ => Disposition::Propagate,
    }
}
