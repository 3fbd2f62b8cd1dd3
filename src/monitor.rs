use crate::config::MigrationConfig;
use crate::guest::Guest;
use crate::hypervisor::{Host, JobType, MigrateParams};
use crate::instance::{Instance, TaskState};
use crate::migration::{
    data_gb, downtime_steps, find_job_type, remaining_percent, run_recover_tasks, run_tasks,
    save_stats, should_abort, should_switch_to_postcopy, trigger_postcopy_switch,
    update_downtime,
};
use crate::records::{
    Migration, Recorder, STATUS_CANCELLED, STATUS_COMPLETED, STATUS_ERROR, STATUS_FAILED,
    STATUS_RUNNING,
};
use crate::tasks::{ActiveMigrations, MigrationTask, RecoveryQueue};
use crate::xml_patch::{LiveMigrateData, VolumeConfigResolver, get_updated_guest_xml};
use crate::{Result, log_debug, log_error, log_info, log_warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::{Duration, Instant, sleep};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// What the caller knows about the migration before it starts.
#[derive(Debug, Clone, Default)]
pub struct MigrationRequest {
    /// Destination compute host name.
    pub dest: String,
    pub migrate_data: LiveMigrateData,
    /// Target devs of local disks to copy in a block migration.
    pub migrate_disks: Vec<String>,
    /// Sizes in bytes of the disks being copied.
    pub disk_sizes: Vec<u64>,
}

/// Drives live migrations and accepts operator requests against them.
pub struct MigrationMonitor {
    config: MigrationConfig,
    host: Host,
    recorder: Arc<dyn Recorder>,
    active_migrations: Arc<ActiveMigrations>,
}

impl MigrationMonitor {
    pub fn new(config: MigrationConfig, recorder: Arc<dyn Recorder>) -> Self {
        let host = Host::new(config.connection_uri.clone());
        Self {
            config,
            host,
            recorder,
            active_migrations: Arc::new(ActiveMigrations::new()),
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn active_migrations(&self) -> Arc<ActiveMigrations> {
        self.active_migrations.clone()
    }

    /// Ask the running migration of `instance_uuid` to finish as soon as possible.
    pub fn force_complete(&self, instance_uuid: &Uuid) -> Result<()> {
        self.active_migrations
            .push(instance_uuid, MigrationTask::ForceComplete)?;
        log_info!("Queued force-complete for instance {}", instance_uuid);
        Ok(())
    }

    /// Cancel the guest's running job. The monitor loop sees the cancellation
    /// on its next tick.
    pub async fn abort(&self, guest: &Guest) -> Result<()> {
        log_info!("Aborting migration job of '{}'", guest.name());
        guest.abort_job().await?;
        Ok(())
    }

    /// Start migrating `guest` and monitor it until the job ends.
    ///
    /// Both records are saved on every tick and once more with the final
    /// status. Recovery tasks have run by the time a non-success result is
    /// returned.
    pub async fn live_migration(
        &self,
        guest: Arc<Guest>,
        instance: &mut Instance,
        migration: &mut Migration,
        request: MigrationRequest,
        resolver: &dyn VolumeConfigResolver,
    ) -> Result<MigrationOutcome> {
        log_info!(
            "Starting live migration of '{}' to '{}'",
            instance.name,
            request.dest
        );

        self.active_migrations.register(instance.uuid);
        let on_migration_failure = RecoveryQueue::new();

        let result = self
            .start_and_monitor(guest.clone(), instance, migration, request, resolver, &on_migration_failure)
            .await;

        let leftover = self.active_migrations.unregister(&instance.uuid);
        if !leftover.is_empty() {
            log_debug!(
                "Dropping {} unprocessed task(s) for '{}'",
                leftover.len(),
                instance.name
            );
        }

        let status = match &result {
            Ok(MigrationOutcome::Completed) => {
                instance.set_progress_from_remaining(0);
                STATUS_COMPLETED
            }
            Ok(MigrationOutcome::Failed) => STATUS_FAILED,
            Ok(MigrationOutcome::Cancelled) => STATUS_CANCELLED,
            Err(e) => {
                log_error!("Live migration of '{}' failed: {}", instance.name, e);
                if let Err(recover_err) =
                    run_recover_tasks(&self.host, &guest, instance, &on_migration_failure).await
                {
                    log_error!(
                        "Recovery after failed migration of '{}' failed: {}",
                        instance.name,
                        recover_err
                    );
                }
                STATUS_ERROR
            }
        };

        migration.set_status(status);
        instance.update_task_state(None);

        let saved = self.recorder.save_progress(migration, instance).await;
        match result {
            Ok(outcome) => {
                saved?;
                log_info!(
                    "Live migration of '{}' finished: {}",
                    instance.name,
                    migration.status
                );
                Ok(outcome)
            }
            Err(e) => {
                if let Err(save_err) = saved {
                    log_warn!("Failed to save final records of '{}': {}", instance.name, save_err);
                }
                Err(e)
            }
        }
    }

    async fn start_and_monitor(
        &self,
        guest: Arc<Guest>,
        instance: &mut Instance,
        migration: &mut Migration,
        request: MigrationRequest,
        resolver: &dyn VolumeConfigResolver,
        on_migration_failure: &RecoveryQueue,
    ) -> Result<MigrationOutcome> {
        migration.set_status(STATUS_RUNNING);
        instance.update_task_state(Some(TaskState::Migrating));
        self.recorder.save_progress(migration, instance).await?;

        let data = &request.migrate_data;
        let xml = get_updated_guest_xml(&guest, data, resolver).await?;

        let destination = self.config.migration_uri(&request.dest);
        let flags = self.config.migrate_flags(data.block_migration);
        let migrate_disks = if data.block_migration {
            request.migrate_disks.clone()
        } else {
            Vec::new()
        };
        let params = MigrateParams {
            migrate_uri: data
                .target_connect_addr
                .as_ref()
                .map(|addr| format!("tcp://{}", addr)),
            destination_xml: Some(xml.clone()),
            bandwidth_mib: self.config.bandwidth_mib,
            migrate_disks,
        };

        let finished = Arc::new(AtomicBool::new(false));
        let migrate_op = {
            let guest = guest.clone();
            let finished = finished.clone();
            let bandwidth = self.config.bandwidth_mib;
            tokio::spawn(async move {
                let result = guest
                    .migrate(&destination, Some(params), flags, Some(xml), bandwidth)
                    .await;
                if let Err(e) = &result {
                    log_error!("Live migration operation of '{}' failed: {}", guest.name(), e);
                }
                finished.store(true, Ordering::Release);
                result
            })
        };

        let disk_sizes: &[u64] = if data.block_migration {
            &request.disk_sizes
        } else {
            &[]
        };
        let data_gb = data_gb(instance.memory_mb, disk_sizes);

        let outcome = self
            .monitor(&guest, instance, migration, data_gb, &finished, on_migration_failure)
            .await;

        if outcome.is_ok() {
            if let Err(e) = migrate_op.await {
                log_warn!("Migration operation task of '{}' did not finish cleanly: {}", instance.name, e);
            }
        }
        outcome
    }

    async fn monitor(
        &self,
        guest: &Guest,
        instance: &mut Instance,
        migration: &mut Migration,
        data_gb: f64,
        finished: &AtomicBool,
        on_migration_failure: &RecoveryQueue,
    ) -> Result<MigrationOutcome> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let completion_timeout_ms =
            (self.config.completion_timeout_secs as f64 * data_gb * 1000.0) as i64;
        let progress_timeout_ms = self.config.progress_timeout_secs.saturating_mul(1000);
        let steps = downtime_steps(&self.config, data_gb);
        let allow_postcopy = self.config.permit_post_copy;

        let start = Instant::now();
        let mut progress_time = start;
        let mut progress_watermark: Option<u64> = None;
        let mut current_downtime: Option<u64> = None;
        let mut n: u64 = 0;

        loop {
            let mut info = guest.get_job_info().await?;

            if info.job_type == JobType::None {
                if finished.load(Ordering::Acquire) {
                    info.job_type = find_job_type(guest, instance).await;
                } else {
                    log_debug!("Migration of '{}' not running yet", instance.name);
                }
            }

            match info.job_type {
                JobType::None => {}
                JobType::Bounded | JobType::Unbounded => {
                    run_tasks(
                        guest,
                        instance,
                        &self.active_migrations,
                        on_migration_failure,
                        migration,
                        allow_postcopy,
                    )
                    .await?;

                    let now = Instant::now();
                    let elapsed_ms = now.duration_since(start).as_millis() as i64;

                    if progress_watermark
                        .is_none_or(|mark| mark == 0 || mark > info.data_remaining)
                    {
                        progress_watermark = Some(info.data_remaining);
                        progress_time = now;
                    }
                    let progress_time_ms = progress_time.duration_since(start).as_millis() as i64;

                    if !migration.is_postcopy()
                        && should_abort(
                            instance,
                            elapsed_ms,
                            progress_time_ms,
                            progress_timeout_ms,
                            elapsed_ms,
                            completion_timeout_ms,
                            &migration.status,
                        )
                    {
                        if let Err(e) = guest.abort_job().await {
                            log_error!("Failed to abort migration of '{}': {}", instance.name, e);
                            return Err(e.into());
                        }
                    }

                    if allow_postcopy
                        && should_switch_to_postcopy(
                            info.memory_iteration,
                            info.data_remaining,
                            info.data_processed,
                            &migration.status,
                        )
                    {
                        trigger_postcopy_switch(guest, instance, migration).await;
                    }

                    let remaining = remaining_percent(&info);
                    save_stats(instance, migration, &info, remaining, self.recorder.as_ref())
                        .await?;

                    current_downtime = update_downtime(
                        guest,
                        instance,
                        current_downtime,
                        &steps,
                        elapsed_ms as u64,
                    )
                    .await?;

                    if n % 10 == 0 {
                        let secs = elapsed_ms / 1000;
                        if n % 60 == 0 {
                            log_info!(
                                "Migration of '{}' running for {} secs, memory {}% remaining; \
                                 (bytes processed={}, remaining={}, total={})",
                                instance.name,
                                secs,
                                remaining,
                                info.data_processed,
                                info.data_remaining,
                                info.data_total
                            );
                        } else {
                            log_debug!(
                                "Migration of '{}' running for {} secs, memory {}% remaining",
                                instance.name,
                                secs,
                                remaining
                            );
                        }
                    }
                    n += 1;
                }
                JobType::Completed => {
                    log_info!("Migration of '{}' operation has completed", instance.name);
                    return Ok(MigrationOutcome::Completed);
                }
                JobType::Failed => {
                    log_error!("Migration of '{}' operation has failed", instance.name);
                    run_recover_tasks(&self.host, guest, instance, on_migration_failure).await?;
                    return Ok(MigrationOutcome::Failed);
                }
                JobType::Cancelled => {
                    log_info!("Migration of '{}' operation was cancelled", instance.name);
                    run_recover_tasks(&self.host, guest, instance, on_migration_failure).await?;
                    return Ok(MigrationOutcome::Cancelled);
                }
            }

            sleep(poll_interval).await;
        }
    }
}
