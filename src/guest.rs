use crate::hypervisor::{
    Disposition, Domain, HvResult, Host, JobType, MigrateFlags, MigrateParams, MigrateRequest,
    Operation, PowerState, XmlFlags, disposition,
};
use crate::job_info::JobInfo;
use crate::log_debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Handle on one running domain.
///
/// Owns the job-stats capability flag: once the extensible stats call reports
/// "not supported" this guest uses the legacy call for the rest of its life.
pub struct Guest {
    domain: Arc<dyn Domain>,
    have_job_stats: AtomicBool,
}

impl Guest {
    pub fn new(domain: Arc<dyn Domain>) -> Self {
        Self {
            domain,
            have_job_stats: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        self.domain.name()
    }

    pub fn has_job_stats(&self) -> bool {
        self.have_job_stats.load(Ordering::Acquire)
    }

    /// Poll the current background job.
    ///
    /// A vanished domain is reported as `JobType::Completed`. That also covers
    /// a domain destroyed from outside, so callers must confirm success by
    /// other means.
    pub async fn get_job_info(&self) -> HvResult<JobInfo> {
        if !self.has_job_stats() {
            return self.legacy_job_info().await;
        }

        match self.domain.job_stats().await {
            Ok(stats) => Ok(JobInfo::from_stats(&stats)),
            Err(err) => match disposition(Operation::JobStats, &err.code) {
                Disposition::FallbackToLegacy => {
                    log_debug!("Missing extensible job stats on '{}': {}", self.name(), err);
                    self.have_job_stats.store(false, Ordering::Release);
                    self.legacy_job_info().await
                }
                Disposition::TreatAsCompleted => {
                    log_debug!("Domain '{}' has shut down or gone away: {}", self.name(), err);
                    Ok(JobInfo::with_type(JobType::Completed))
                }
                _ => {
                    log_debug!("Failed to get job stats for '{}': {}", self.name(), err);
                    Err(err)
                }
            },
        }
    }

    async fn legacy_job_info(&self) -> HvResult<JobInfo> {
        match self.domain.job_info().await {
            Ok(info) => Ok(JobInfo::from_legacy(&info)),
            Err(err) => match disposition(Operation::LegacyJobInfo, &err.code) {
                Disposition::TreatAsCompleted => {
                    log_debug!("Domain '{}' has shut down or gone away: {}", self.name(), err);
                    Ok(JobInfo::with_type(JobType::Completed))
                }
                _ => {
                    log_debug!("Failed to get job info for '{}': {}", self.name(), err);
                    Err(err)
                }
            },
        }
    }

    pub async fn is_active(&self) -> HvResult<bool> {
        self.domain.is_active().await
    }

    pub async fn get_power_state(&self, host: &Host) -> HvResult<PowerState> {
        self.domain.state(host).await
    }

    pub async fn pause(&self) -> HvResult<()> {
        self.domain.suspend().await
    }

    pub async fn resume(&self) -> HvResult<()> {
        self.domain.resume().await
    }

    pub async fn abort_job(&self) -> HvResult<()> {
        self.domain.abort_job().await
    }

    pub async fn migrate_configure_max_downtime(&self, downtime_ms: u64) -> HvResult<()> {
        self.domain.migrate_set_max_downtime(downtime_ms).await
    }

    pub async fn migrate_start_postcopy(&self) -> HvResult<()> {
        self.domain.migrate_start_post_copy().await
    }

    pub async fn migrate(
        &self,
        destination: &str,
        params: Option<MigrateParams>,
        flags: MigrateFlags,
        domain_xml: Option<String>,
        bandwidth_mib: u64,
    ) -> HvResult<()> {
        let request = MigrateRequest {
            destination: destination.to_string(),
            params,
            flags,
            domain_xml,
            bandwidth_mib,
        };
        self.domain.migrate(&request).await
    }

    pub async fn get_xml_desc(&self, flags: XmlFlags) -> HvResult<String> {
        self.domain.xml_desc(flags).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{DomainCall, FakeDomain};
    use crate::hypervisor::{ErrorCode, HypervisorError, JobStats};

    fn stats(job_type: JobType, remaining: u64) -> JobStats {
        let mut stats = JobStats::new();
        stats.insert("type".into(), job_type.code());
        stats.insert("data_remaining".into(), remaining);
        stats
    }

    #[tokio::test]
    async fn uses_extensible_stats_when_available() {
        let domain = Arc::new(FakeDomain::new("inst-1"));
        domain.push_job_stats(Ok(stats(JobType::Unbounded, 42)));
        let guest = Guest::new(domain.clone());

        let info = guest.get_job_info().await.unwrap();
        assert_eq!(info.job_type, JobType::Unbounded);
        assert_eq!(info.data_remaining, 42);
        assert!(guest.has_job_stats());
        assert_eq!(domain.count(DomainCall::JobInfo), 0);
    }

    #[tokio::test]
    async fn falls_back_to_legacy_for_good() {
        let domain = Arc::new(FakeDomain::new("inst-1"));
        domain.push_job_stats(Err(HypervisorError::new(
            ErrorCode::NoSupport,
            "this function is not supported",
        )));
        domain.push_job_info(Ok([2, 10, 0, 0, 0, 7, 0, 0, 0, 0, 0, 0]));
        domain.push_job_info(Ok([3, 20, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]));
        let guest = Guest::new(domain.clone());

        let first = guest.get_job_info().await.unwrap();
        assert_eq!(first.job_type, JobType::Unbounded);
        assert_eq!(first.data_remaining, 7);
        assert!(!guest.has_job_stats());

        let second = guest.get_job_info().await.unwrap();
        assert_eq!(second.job_type, JobType::Completed);
        assert_eq!(domain.count(DomainCall::JobStats), 1);
        assert_eq!(domain.count(DomainCall::JobInfo), 2);
    }

    #[tokio::test]
    async fn vanished_domain_reads_as_completed() {
        for code in [ErrorCode::NoDomain, ErrorCode::OperationInvalid] {
            let domain = Arc::new(FakeDomain::new("inst-1"));
            domain.push_job_stats(Err(HypervisorError::new(code, "gone")));
            let guest = Guest::new(domain);

            let info = guest.get_job_info().await.unwrap();
            assert_eq!(info.job_type, JobType::Completed);
            assert!(guest.has_job_stats());
        }
    }

    #[tokio::test]
    async fn vanished_domain_on_legacy_path_reads_as_completed() {
        let domain = Arc::new(FakeDomain::new("inst-1"));
        domain.push_job_stats(Err(HypervisorError::new(ErrorCode::NoSupport, "old")));
        domain.push_job_info(Err(HypervisorError::new(ErrorCode::NoDomain, "gone")));
        let guest = Guest::new(domain);

        let info = guest.get_job_info().await.unwrap();
        assert_eq!(info.job_type, JobType::Completed);
    }

    #[tokio::test]
    async fn other_errors_propagate() {
        let domain = Arc::new(FakeDomain::new("inst-1"));
        domain.push_job_stats(Err(HypervisorError::new(ErrorCode::Internal, "boom")));
        let guest = Guest::new(domain);

        let err = guest.get_job_info().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
    }
}
