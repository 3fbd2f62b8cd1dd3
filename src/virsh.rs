use crate::hypervisor::{
    Domain, ErrorCode, HvResult, Host, HypervisorError, JobStats, JobType, LegacyJobInfo,
    MigrateRequest, PowerState, XmlFlags,
};
use crate::{log_debug, log_warn};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use uuid::Uuid;

/// A domain driven through the `virsh` command line tool.
pub struct VirshDomain {
    name: String,
    host: Host,
}

impl VirshDomain {
    pub fn new(name: &str, host: Host) -> Self {
        Self {
            name: name.to_string(),
            host,
        }
    }

    async fn virsh(&self, uri: &str, args: &[&str]) -> HvResult<String> {
        log_debug!("virsh -c {} {}", uri, args.join(" "));

        let output = Command::new("virsh")
            .arg("-c")
            .arg(uri)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                HypervisorError::new(ErrorCode::Internal, format!("failed to run virsh: {}", e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(HypervisorError::new(classify_error(&stderr), stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run(&self, args: &[&str]) -> HvResult<String> {
        self.virsh(&self.host.uri, args).await
    }
}

/// Map virsh's stderr text onto the hypervisor error codes the monitor cares about.
pub fn classify_error(stderr: &str) -> ErrorCode {
    let msg = stderr.to_ascii_lowercase();
    if msg.contains("domain not found")
        || msg.contains("failed to get domain")
        || msg.contains("no domain with matching")
    {
        ErrorCode::NoDomain
    } else if msg.contains("requested operation is not valid") || msg.contains("not running") {
        ErrorCode::OperationInvalid
    } else if msg.contains("not supported")
        || msg.contains("unsupported")
        || msg.contains("unknown option")
    {
        ErrorCode::NoSupport
    } else {
        ErrorCode::Internal
    }
}

fn job_type_from_name(name: &str) -> JobType {
    match name.trim().to_ascii_lowercase().as_str() {
        "bounded" => JobType::Bounded,
        "unbounded" => JobType::Unbounded,
        "completed" => JobType::Completed,
        "failed" => JobType::Failed,
        "cancelled" => JobType::Cancelled,
        _ => JobType::None,
    }
}

/// Parse `domjobinfo --rawstats` output. Non-numeric values are skipped.
pub fn parse_raw_stats(output: &str) -> JobStats {
    let mut stats = JobStats::new();
    let mut named_type = None;

    for line in output.lines() {
        if let Some((key, value)) = line.split_once('=') {
            if let Ok(value) = value.trim().parse::<u64>() {
                stats.insert(key.trim().to_string(), value);
            }
        } else if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case("job type") {
                named_type = Some(job_type_from_name(value));
            }
        }
    }

    if let Some(job_type) = named_type {
        stats.entry("type".to_string()).or_insert(job_type.code());
    }
    stats
}

/// Parse a human readable quantity such as `1.500 GiB` or `1234 ms`.
fn parse_quantity(value: &str) -> Option<u64> {
    let mut parts = value.split_whitespace();
    let number: f64 = parts.next()?.parse().ok()?;
    let scale = match parts.next() {
        None | Some("B") | Some("ms") => 1.0,
        Some("KiB") => 1024.0,
        Some("MiB") => 1024.0 * 1024.0,
        Some("GiB") => 1024.0 * 1024.0 * 1024.0,
        Some("TiB") => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        Some(_) => return None,
    };
    Some((number * scale).round() as u64)
}

/// Parse plain `domjobinfo` output into the legacy fixed-field layout.
pub fn parse_job_info(output: &str) -> LegacyJobInfo {
    let mut info: LegacyJobInfo = [0; 12];

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        if key == "job type" {
            info[0] = job_type_from_name(value).code();
            continue;
        }

        let slot = match key.as_str() {
            "time elapsed" => 1,
            "time remaining" => 2,
            "data total" => 3,
            "data processed" => 4,
            "data remaining" => 5,
            "memory total" => 6,
            "memory processed" => 7,
            "memory remaining" => 8,
            "file total" => 9,
            "file processed" => 10,
            "file remaining" => 11,
            _ => continue,
        };
        if let Some(value) = parse_quantity(value) {
            info[slot] = value;
        }
    }
    info
}

pub fn parse_power_state(output: &str) -> PowerState {
    match output.trim() {
        "running" | "idle" | "blocked" => PowerState::Running,
        "paused" => PowerState::Paused,
        "shut off" | "in shutdown" => PowerState::Shutdown,
        "crashed" => PowerState::Crashed,
        "pmsuspended" => PowerState::Suspended,
        _ => PowerState::NoState,
    }
}

fn migrate_args(name: &str, request: &MigrateRequest, xml_file: Option<&str>) -> Vec<String> {
    let flags = &request.flags;
    let mut args = vec!["migrate".to_string()];

    for (set, flag) in [
        (flags.live, "--live"),
        (flags.peer2peer, "--p2p"),
        (flags.tunnelled, "--tunnelled"),
        (flags.persist_dest, "--persistent"),
        (flags.undefine_source, "--undefinesource"),
        (flags.non_shared_inc, "--copy-storage-inc"),
        (flags.auto_converge, "--auto-converge"),
        (flags.postcopy, "--postcopy"),
    ] {
        if set {
            args.push(flag.to_string());
        }
    }

    let mut bandwidth = request.bandwidth_mib;
    if let Some(params) = &request.params {
        if let Some(uri) = &params.migrate_uri {
            args.push("--migrateuri".to_string());
            args.push(uri.clone());
        }
        if !params.migrate_disks.is_empty() {
            args.push("--migrate-disks".to_string());
            args.push(params.migrate_disks.join(","));
        }
        if params.bandwidth_mib > 0 {
            bandwidth = params.bandwidth_mib;
        }
    }
    if bandwidth > 0 {
        args.push("--bandwidth".to_string());
        args.push(bandwidth.to_string());
    }
    if let Some(file) = xml_file {
        args.push("--xml".to_string());
        args.push(file.to_string());
    }

    args.push(name.to_string());
    args.push(request.destination.clone());
    args
}

#[async_trait]
impl Domain for VirshDomain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn job_stats(&self) -> HvResult<JobStats> {
        let output = self.run(&["domjobinfo", "--rawstats", self.name.as_str()]).await?;
        Ok(parse_raw_stats(&output))
    }

    async fn job_info(&self) -> HvResult<LegacyJobInfo> {
        let output = self.run(&["domjobinfo", self.name.as_str()]).await?;
        Ok(parse_job_info(&output))
    }

    async fn is_active(&self) -> HvResult<bool> {
        let output = self.run(&["domstate", self.name.as_str()]).await?;
        Ok(output.trim() != "shut off")
    }

    async fn state(&self, host: &Host) -> HvResult<PowerState> {
        let output = self.virsh(&host.uri, &["domstate", self.name.as_str()]).await?;
        Ok(parse_power_state(&output))
    }

    async fn suspend(&self) -> HvResult<()> {
        self.run(&["suspend", self.name.as_str()]).await.map(|_| ())
    }

    async fn resume(&self) -> HvResult<()> {
        self.run(&["resume", self.name.as_str()]).await.map(|_| ())
    }

    async fn abort_job(&self) -> HvResult<()> {
        self.run(&["domjobabort", self.name.as_str()]).await.map(|_| ())
    }

    async fn migrate_set_max_downtime(&self, downtime_ms: u64) -> HvResult<()> {
        let downtime = downtime_ms.to_string();
        self.run(&["migrate-setmaxdowntime", self.name.as_str(), downtime.as_str()])
            .await
            .map(|_| ())
    }

    async fn migrate_start_post_copy(&self) -> HvResult<()> {
        self.run(&["migrate-postcopy", self.name.as_str()]).await.map(|_| ())
    }

    async fn migrate(&self, request: &MigrateRequest) -> HvResult<()> {
        let xml = request
            .domain_xml
            .as_ref()
            .or_else(|| request.params.as_ref().and_then(|p| p.destination_xml.as_ref()));

        let xml_file: Option<PathBuf> = match xml {
            Some(xml) => {
                let path = std::env::temp_dir().join(format!("vmigrate-{}.xml", Uuid::new_v4()));
                tokio::fs::write(&path, xml).await.map_err(|e| {
                    HypervisorError::new(
                        ErrorCode::Internal,
                        format!("failed to write {}: {}", path.display(), e),
                    )
                })?;
                Some(path)
            }
            None => None,
        };

        let file_arg = xml_file.as_ref().map(|p| p.to_string_lossy().into_owned());
        let args = migrate_args(&self.name, request, file_arg.as_deref());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = self.run(&args).await.map(|_| ());

        if let Some(path) = xml_file {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                log_warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
        result
    }

    async fn xml_desc(&self, flags: XmlFlags) -> HvResult<String> {
        let mut args = vec!["dumpxml"];
        if flags.inactive {
            args.push("--inactive");
        }
        if flags.secure {
            args.push("--security-info");
        }
        if flags.migratable {
            args.push("--migratable");
        }
        args.push(self.name.as_str());
        self.run(&args).await
    }
}
