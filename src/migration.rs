//! Live-migration policy: job classification, abort and post-copy decisions,
//! the downtime ramp, stats persistence and queued task handling.

use crate::config::MigrationConfig;
use crate::guest::Guest;
use crate::hypervisor::{
    Disposition, ErrorCode, Host, JobType, Operation, PowerState, disposition,
};
use crate::instance::Instance;
use crate::job_info::JobInfo;
use crate::records::{Migration, Recorder, STATUS_POSTCOPY};
use crate::tasks::{ActiveMigrations, MigrationTask, RecoveryQueue, RecoveryTask};
use crate::{Result, log_debug, log_info, log_warn};

const GIB: f64 = (1u64 << 30) as f64;
const MIN_DATA_GB: f64 = 2.0;

/// Work out how a migration ended when job stats are no longer available.
///
/// A domain still active after the migrate call returned means it failed; an
/// inactive or vanished domain means it completed.
pub async fn find_job_type(guest: &Guest, instance: &Instance) -> JobType {
    log_debug!("Checking if migration of '{}' has finished", instance.name);
    match guest.is_active().await {
        Ok(true) => {
            log_debug!("VM of '{}' is still active, migration failed", instance.name);
            JobType::Failed
        }
        Ok(false) => {
            log_debug!("VM of '{}' is no longer active", instance.name);
            JobType::Completed
        }
        Err(err) if err.code == ErrorCode::NoDomain => {
            log_debug!("VM of '{}' has gone away: {}", instance.name, err);
            JobType::Completed
        }
        Err(err) => {
            log_debug!("Error checking domain status of '{}': {}", instance.name, err);
            JobType::Failed
        }
    }
}

/// Decide whether a running migration should be aborted.
///
/// All times and timeouts share one unit. A timeout of zero or less disables
/// that check. The migration status does not currently affect the decision.
pub fn should_abort(
    instance: &Instance,
    now: i64,
    progress_time: i64,
    progress_timeout: i64,
    elapsed: i64,
    completion_timeout: i64,
    _migration_status: &str,
) -> bool {
    if progress_timeout > 0 && (now - progress_time) > progress_timeout {
        log_warn!(
            "Live migration of '{}' stuck for {} without progress",
            instance.name,
            now - progress_time
        );
        return true;
    }

    if completion_timeout > 0 && elapsed > completion_timeout {
        log_warn!(
            "Live migration of '{}' not completed after {}",
            instance.name,
            completion_timeout
        );
        return true;
    }

    false
}

/// Post-copy is worth it once a full memory pass is done and more data is
/// left than has been sent.
pub fn should_switch_to_postcopy(
    memory_iteration: u64,
    data_remaining: u64,
    data_processed: u64,
    migration_status: &str,
) -> bool {
    if migration_status == STATUS_POSTCOPY {
        return false;
    }
    if memory_iteration < 2 {
        return false;
    }
    data_remaining > data_processed
}

/// Best-effort switch to post-copy; marks the migration on success.
pub async fn trigger_postcopy_switch(guest: &Guest, instance: &Instance, migration: &mut Migration) {
    match guest.migrate_start_postcopy().await {
        Ok(()) => {
            log_info!("Switching migration of '{}' to post-copy mode", instance.name);
            migration.set_status(STATUS_POSTCOPY);
        }
        Err(err) => {
            log_warn!(
                "Failed to switch migration of '{}' to post-copy: {}",
                instance.name,
                err
            );
        }
    }
}

/// Apply the downtime step for the current elapsed time.
///
/// `steps` must be ascending by threshold. Returns the downtime now in force;
/// a tolerated hypervisor failure is logged and the new value still returned.
pub async fn update_downtime(
    guest: &Guest,
    instance: &Instance,
    current: Option<u64>,
    steps: &[(u64, u64)],
    elapsed_ms: u64,
) -> Result<Option<u64>> {
    log_debug!(
        "Current downtime {:?} elapsed {} ms steps {:?}",
        current,
        elapsed_ms,
        steps
    );

    let Some(&(threshold, downtime)) = steps.iter().rev().find(|(t, _)| *t <= elapsed_ms) else {
        return Ok(current);
    };

    if current == Some(downtime) {
        return Ok(current);
    }

    log_info!(
        "Increasing downtime of '{}' to {} ms after {} ms elapsed (step at {} ms)",
        instance.name,
        downtime,
        elapsed_ms,
        threshold
    );

    if let Err(err) = guest.migrate_configure_max_downtime(downtime).await {
        match disposition(Operation::SetMaxDowntime, &err.code) {
            Disposition::LogAndContinue => log_warn!(
                "Unable to increase max downtime of '{}' to {} ms: {}",
                instance.name,
                downtime,
                err
            ),
            _ => return Err(err.into()),
        }
    }

    Ok(Some(downtime))
}

/// The configured downtime ramp as `(elapsed_ms, downtime_ms)` pairs.
pub fn downtime_steps(config: &MigrationConfig, data_gb: f64) -> Vec<(u64, u64)> {
    let downtime = config.effective_downtime() as f64;
    let steps = config.effective_steps();
    let delay_secs = (config.effective_delay() as f64 * data_gb).floor() as u64;

    let base = downtime / steps as f64;
    let offset = (downtime - base) / steps as f64;

    (0..=steps)
        .map(|i| {
            (
                delay_secs * i as u64 * 1000,
                (base + offset * i as f64) as u64,
            )
        })
        .collect()
}

/// GiB to transfer: guest RAM plus each disk, each counted as at least 2 GiB.
pub fn data_gb(memory_mb: u64, disk_sizes: &[u64]) -> f64 {
    let ram_gb = (memory_mb as f64 / 1024.0).max(MIN_DATA_GB);
    let disk_gb: f64 = disk_sizes
        .iter()
        .map(|size| (*size as f64 / GIB).max(MIN_DATA_GB))
        .sum();
    ram_gb + disk_gb
}

/// Percentage of guest memory still to copy.
pub fn remaining_percent(info: &JobInfo) -> u8 {
    if info.memory_total == 0 {
        return 100;
    }
    let percent = (info.memory_remaining as f64 * 100.0 / info.memory_total as f64).round();
    percent.clamp(0.0, 100.0) as u8
}

/// Mirror job counters into the migration, derive instance progress and
/// persist both records.
pub async fn save_stats(
    instance: &mut Instance,
    migration: &mut Migration,
    info: &JobInfo,
    remaining_percent: u8,
    recorder: &dyn Recorder,
) -> Result<()> {
    migration.apply_job_info(info);
    instance.set_progress_from_remaining(remaining_percent);
    recorder.save_progress(migration, instance).await
}

/// Run every forward task queued for this instance.
pub async fn run_tasks(
    guest: &Guest,
    instance: &Instance,
    active_migrations: &ActiveMigrations,
    on_migration_failure: &RecoveryQueue,
    migration: &mut Migration,
    allow_postcopy: bool,
) -> Result<()> {
    let Some(tasks) = active_migrations.drain(&instance.uuid) else {
        return Ok(());
    };

    for task in tasks {
        match task {
            MigrationTask::ForceComplete => {
                if migration.is_postcopy() {
                    log_debug!(
                        "Migration of '{}' already in post-copy, ignoring force-complete",
                        instance.name
                    );
                } else if allow_postcopy {
                    log_info!("Forcing migration of '{}' into post-copy", instance.name);
                    guest.migrate_start_postcopy().await?;
                    migration.set_status(STATUS_POSTCOPY);
                } else {
                    log_warn!(
                        "Pausing '{}' to force migration to complete",
                        instance.name
                    );
                    guest.pause().await?;
                    on_migration_failure.push(RecoveryTask::Unpause);
                }
            }
            MigrationTask::Other(token) => {
                log_warn!("Unknown migration task '{}' for '{}'", token, instance.name);
            }
        }
    }

    Ok(())
}

/// Undo side effects of forward tasks after a failed migration.
pub async fn run_recover_tasks(
    host: &Host,
    guest: &Guest,
    instance: &Instance,
    on_migration_failure: &RecoveryQueue,
) -> Result<()> {
    while let Some(task) = on_migration_failure.pop() {
        if let Err(err) = run_recover_task(host, guest, instance, &task).await {
            // Keep it queued so a later pass can retry.
            on_migration_failure.push_front(task);
            return Err(err);
        }
    }

    Ok(())
}

async fn run_recover_task(
    host: &Host,
    guest: &Guest,
    instance: &Instance,
    task: &RecoveryTask,
) -> Result<()> {
    match task {
        RecoveryTask::Unpause => {
            let state = guest.get_power_state(host).await?;
            if state == PowerState::Paused {
                log_info!("Resuming '{}' after failed migration", instance.name);
                guest.resume().await?;
            } else {
                log_debug!(
                    "'{}' is {:?}, nothing to resume",
                    instance.name,
                    state
                );
            }
        }
        RecoveryTask::Other(token) => {
            log_warn!("Unknown recovery task '{}' for '{}'", token, instance.name);
        }
    }
    Ok(())
}
