//! In-memory doubles for the hypervisor and the record store.
//!
//! `FakeDomain` responses are queued per call; when only one queued response
//! is left it is repeated, so a script can end on a steady state.

use crate::Result;
use crate::hypervisor::{
    Domain, HvResult, HypervisorError, Host, JobStats, JobType, LegacyJobInfo, MigrateRequest,
    PowerState, XmlFlags,
};
use crate::instance::Instance;
use crate::records::{Migration, Recorder};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainCall {
    JobStats,
    JobInfo,
    IsActive,
    State,
    Suspend,
    Resume,
    AbortJob,
    SetMaxDowntime(u64),
    StartPostCopy,
    Migrate(String),
    XmlDesc,
}

struct FakeState {
    job_stats: VecDeque<HvResult<JobStats>>,
    job_info: VecDeque<HvResult<LegacyJobInfo>>,
    active: HvResult<bool>,
    power_state: HvResult<PowerState>,
    downtime_error: Option<HypervisorError>,
    postcopy_error: Option<HypervisorError>,
    abort_error: Option<HypervisorError>,
    migrate_result: HvResult<()>,
    xml: String,
    max_downtime: Option<u64>,
    last_migrate: Option<MigrateRequest>,
    calls: Vec<DomainCall>,
}

pub struct FakeDomain {
    name: String,
    state: Mutex<FakeState>,
}

fn next_response<T: Clone>(queue: &mut VecDeque<HvResult<T>>, default: T) -> HvResult<T> {
    match queue.len() {
        0 => Ok(default),
        1 => queue[0].clone(),
        _ => queue.pop_front().unwrap_or(Ok(default)),
    }
}

impl FakeDomain {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(FakeState {
                job_stats: VecDeque::new(),
                job_info: VecDeque::new(),
                active: Ok(true),
                power_state: Ok(PowerState::Running),
                downtime_error: None,
                postcopy_error: None,
                abort_error: None,
                migrate_result: Ok(()),
                xml: "<domain type=\"kvm\"><name>fake</name><devices/></domain>".to_string(),
                max_downtime: None,
                last_migrate: None,
                calls: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: DomainCall) -> MutexGuard<'_, FakeState> {
        let mut state = self.lock();
        state.calls.push(call);
        state
    }

    pub fn push_job_stats(&self, response: HvResult<JobStats>) {
        self.lock().job_stats.push_back(response);
    }

    /// Queue an extensible stats response built from a job type and counters.
    pub fn push_stats(&self, job_type: JobType, counters: &[(&str, u64)]) {
        let mut stats: JobStats = counters
            .iter()
            .map(|(key, value)| (key.to_string(), *value))
            .collect();
        stats.insert("type".to_string(), job_type.code());
        self.push_job_stats(Ok(stats));
    }

    pub fn push_job_info(&self, response: HvResult<LegacyJobInfo>) {
        self.lock().job_info.push_back(response);
    }

    pub fn set_active(&self, active: HvResult<bool>) {
        self.lock().active = active;
    }

    pub fn set_power_state(&self, state: HvResult<PowerState>) {
        self.lock().power_state = state;
    }

    pub fn fail_downtime(&self, err: HypervisorError) {
        self.lock().downtime_error = Some(err);
    }

    pub fn fail_postcopy(&self, err: HypervisorError) {
        self.lock().postcopy_error = Some(err);
    }

    pub fn fail_abort(&self, err: HypervisorError) {
        self.lock().abort_error = Some(err);
    }

    pub fn set_migrate_result(&self, result: HvResult<()>) {
        self.lock().migrate_result = result;
    }

    pub fn set_xml(&self, xml: &str) {
        self.lock().xml = xml.to_string();
    }

    pub fn max_downtime(&self) -> Option<u64> {
        self.lock().max_downtime
    }

    pub fn last_migrate(&self) -> Option<MigrateRequest> {
        self.lock().last_migrate.clone()
    }

    pub fn calls(&self) -> Vec<DomainCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, call: DomainCall) -> usize {
        self.lock().calls.iter().filter(|c| **c == call).count()
    }
}

#[async_trait]
impl Domain for FakeDomain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn job_stats(&self) -> HvResult<JobStats> {
        let mut state = self.record(DomainCall::JobStats);
        next_response(&mut state.job_stats, JobStats::new())
    }

    async fn job_info(&self) -> HvResult<LegacyJobInfo> {
        let mut state = self.record(DomainCall::JobInfo);
        next_response(&mut state.job_info, [0; 12])
    }

    async fn is_active(&self) -> HvResult<bool> {
        self.record(DomainCall::IsActive).active.clone()
    }

    async fn state(&self, _host: &Host) -> HvResult<PowerState> {
        self.record(DomainCall::State).power_state.clone()
    }

    async fn suspend(&self) -> HvResult<()> {
        let mut state = self.record(DomainCall::Suspend);
        state.power_state = Ok(PowerState::Paused);
        Ok(())
    }

    async fn resume(&self) -> HvResult<()> {
        let mut state = self.record(DomainCall::Resume);
        state.power_state = Ok(PowerState::Running);
        Ok(())
    }

    async fn abort_job(&self) -> HvResult<()> {
        let mut state = self.record(DomainCall::AbortJob);
        if let Some(err) = state.abort_error.clone() {
            return Err(err);
        }
        state.job_stats.clear();
        state.job_stats.push_back(Ok([("type".to_string(), JobType::Cancelled.code())]
            .into_iter()
            .collect()));
        Ok(())
    }

    async fn migrate_set_max_downtime(&self, downtime_ms: u64) -> HvResult<()> {
        let mut state = self.record(DomainCall::SetMaxDowntime(downtime_ms));
        if let Some(err) = state.downtime_error.clone() {
            return Err(err);
        }
        state.max_downtime = Some(downtime_ms);
        Ok(())
    }

    async fn migrate_start_post_copy(&self) -> HvResult<()> {
        let state = self.record(DomainCall::StartPostCopy);
        match state.postcopy_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn migrate(&self, request: &MigrateRequest) -> HvResult<()> {
        let mut state = self.record(DomainCall::Migrate(request.destination.clone()));
        state.last_migrate = Some(request.clone());
        state.migrate_result.clone()
    }

    async fn xml_desc(&self, _flags: XmlFlags) -> HvResult<String> {
        Ok(self.record(DomainCall::XmlDesc).xml.clone())
    }
}

/// Keeps every saved record in memory, oldest first.
#[derive(Default)]
pub struct MemoryRecorder {
    migrations: Mutex<Vec<Migration>>,
    instances: Mutex<Vec<Instance>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn migrations(&self) -> Vec<Migration> {
        self.migrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Recorder for MemoryRecorder {
    async fn save_migration(&self, migration: &Migration) -> Result<()> {
        self.migrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(migration.clone());
        Ok(())
    }

    async fn save_instance(&self, instance: &Instance) -> Result<()> {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(instance.clone());
        Ok(())
    }
}
