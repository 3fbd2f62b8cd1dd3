use crate::hypervisor::{JobStats, JobType, LegacyJobInfo};
use serde::{Deserialize, Serialize};

/// Snapshot of a hypervisor background job. Absent counters are zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_type: JobType,
    pub time_elapsed: u64,
    pub time_remaining: u64,
    pub downtime: u64,
    pub setup_time: u64,
    pub data_total: u64,
    pub data_processed: u64,
    pub data_remaining: u64,
    pub memory_total: u64,
    pub memory_processed: u64,
    pub memory_remaining: u64,
    pub memory_iteration: u64,
    pub memory_constant: u64,
    pub memory_normal: u64,
    pub memory_normal_bytes: u64,
    pub memory_bps: u64,
    pub disk_total: u64,
    pub disk_processed: u64,
    pub disk_remaining: u64,
    pub disk_bps: u64,
    pub compression_cache: u64,
    pub compression_bytes: u64,
    pub compression_pages: u64,
    pub compression_cache_misses: u64,
    pub compression_overflow: u64,
}

impl JobInfo {
    pub fn with_type(job_type: JobType) -> Self {
        Self {
            job_type,
            ..Self::default()
        }
    }

    /// Build from the extensible stats map; unknown keys are ignored.
    pub fn from_stats(stats: &JobStats) -> Self {
        let get = |key: &str| stats.get(key).copied().unwrap_or(0);

        Self {
            job_type: JobType::from_code(get("type")),
            time_elapsed: get("time_elapsed"),
            time_remaining: get("time_remaining"),
            downtime: get("downtime"),
            setup_time: get("setup_time"),
            data_total: get("data_total"),
            data_processed: get("data_processed"),
            data_remaining: get("data_remaining"),
            memory_total: get("memory_total"),
            memory_processed: get("memory_processed"),
            memory_remaining: get("memory_remaining"),
            memory_iteration: get("memory_iteration"),
            memory_constant: get("memory_constant"),
            memory_normal: get("memory_normal"),
            memory_normal_bytes: get("memory_normal_bytes"),
            memory_bps: get("memory_bps"),
            disk_total: get("disk_total"),
            disk_processed: get("disk_processed"),
            disk_remaining: get("disk_remaining"),
            disk_bps: get("disk_bps"),
            compression_cache: get("compression_cache"),
            compression_bytes: get("compression_bytes"),
            compression_pages: get("compression_pages"),
            compression_cache_misses: get("compression_cache_misses"),
            compression_overflow: get("compression_overflow"),
        }
    }

    /// Build from the legacy fixed-field job info.
    pub fn from_legacy(info: &LegacyJobInfo) -> Self {
        Self {
            job_type: JobType::from_code(info[0]),
            time_elapsed: info[1],
            time_remaining: info[2],
            data_total: info[3],
            data_processed: info[4],
            data_remaining: info[5],
            memory_total: info[6],
            memory_processed: info[7],
            memory_remaining: info[8],
            disk_total: info[9],
            disk_processed: info[10],
            disk_remaining: info[11],
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_and_legacy_agree_on_shared_fields() {
        let legacy: LegacyJobInfo = [2, 1000, 500, 30, 10, 20, 16, 6, 10, 14, 4, 10];
        let stats: JobStats = [
            ("type", 2),
            ("time_elapsed", 1000),
            ("time_remaining", 500),
            ("data_total", 30),
            ("data_processed", 10),
            ("data_remaining", 20),
            ("memory_total", 16),
            ("memory_processed", 6),
            ("memory_remaining", 10),
            ("disk_total", 14),
            ("disk_processed", 4),
            ("disk_remaining", 10),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        assert_eq!(JobInfo::from_stats(&stats), JobInfo::from_legacy(&legacy));
    }

    #[test]
    fn missing_stats_default_to_zero() {
        let mut stats = JobStats::new();
        stats.insert("type".into(), 3);
        stats.insert("memory_iteration".into(), 4);
        stats.insert("some_future_counter".into(), 99);

        let info = JobInfo::from_stats(&stats);
        assert_eq!(info.job_type, JobType::Completed);
        assert_eq!(info.memory_iteration, 4);
        assert_eq!(info.data_remaining, 0);
        assert_eq!(info.compression_overflow, 0);
    }
}
