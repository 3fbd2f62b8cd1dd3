use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;
use vmigrate::{
    ConnectionInfoResolver, Guest, Instance, JsonFileRecorder, LiveMigrateData, Migration,
    MigrationConfig, MigrationMonitor, MigrationOutcome, MigrationRequest, logger,
    migration::{data_gb, downtime_steps},
    virsh::VirshDomain,
    xml_patch::update_guest_xml,
};

#[derive(Parser)]
#[command(name = "vmigrate")]
#[command(about = "Live-migrate libvirt guests and keep them converging")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML configuration
    #[arg(short, long, default_value = "vmigrate.toml")]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Live-migrate a domain. Ctrl-C once forces completion, twice aborts
    Migrate {
        /// Domain name
        domain: String,
        /// Destination compute host
        dest: String,
        /// Guest memory in MiB, used to size the downtime ramp and timeouts
        #[arg(long, default_value_t = 2048)]
        memory_mb: u64,
        /// Copy local disks along with memory
        #[arg(long)]
        block: bool,
        /// Target dev of a local disk to copy (repeatable)
        #[arg(long = "disk")]
        disks: Vec<String>,
        /// Size in bytes of each copied disk (repeatable)
        #[arg(long = "disk-size")]
        disk_sizes: Vec<u64>,
        #[command(flatten)]
        patch: PatchArgs,
    },
    /// Show the saved record of a migration
    Status {
        /// Migration id printed by `migrate`
        migration_id: Uuid,
    },
    /// Print the downtime ramp for a data size
    Steps {
        /// GiB of memory and disk to transfer
        #[arg(long)]
        data_gb: Option<f64>,
        /// Guest memory in MiB, used when --data-gb is not given
        #[arg(long, default_value_t = 2048)]
        memory_mb: u64,
    },
    /// Apply the destination rewrites to a domain XML file and print it
    PatchXml {
        /// Domain XML file
        file: PathBuf,
        #[command(flatten)]
        patch: PatchArgs,
    },
}

#[derive(Args)]
struct PatchArgs {
    /// JSON file with the full destination data; flags below override it
    #[arg(long)]
    data: Option<PathBuf>,
    #[arg(long)]
    vnc_listen: Option<String>,
    #[arg(long)]
    spice_listen: Option<String>,
    #[arg(long)]
    serial_listen: Option<String>,
    /// Address the destination accepts migration traffic on
    #[arg(long)]
    target_addr: Option<String>,
    /// Perf event supported on the destination (repeatable)
    #[arg(long = "perf-event")]
    perf_events: Vec<String>,
}

impl PatchArgs {
    fn into_migrate_data(self, block_migration: bool) -> anyhow::Result<LiveMigrateData> {
        let mut data = match &self.data {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&contents)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => LiveMigrateData::default(),
        };

        if self.vnc_listen.is_some() {
            data.graphics_listen_addr_vnc = self.vnc_listen;
        }
        if self.spice_listen.is_some() {
            data.graphics_listen_addr_spice = self.spice_listen;
        }
        if self.serial_listen.is_some() {
            data.serial_listen_addr = self.serial_listen;
        }
        if self.target_addr.is_some() {
            data.target_connect_addr = self.target_addr;
        }
        if !self.perf_events.is_empty() {
            data.supported_perf_events = self.perf_events;
        }
        data.block_migration |= block_migration;
        Ok(data)
    }
}

fn local_host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        unsafe {
            std::env::set_var("RUST_LOG", "vmigrate=debug");
        }
    }
    logger::init_logger();

    let config = if cli.config.exists() {
        MigrationConfig::from_file(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        logger::warn!(
            "Config not found at {}, using defaults",
            cli.config.display()
        );
        MigrationConfig::default()
    };

    match cli.command {
        Commands::Migrate {
            domain,
            dest,
            memory_mb,
            block,
            disks,
            disk_sizes,
            patch,
        } => {
            let migrate_data = patch.into_migrate_data(block)?;
            let recorder = Arc::new(JsonFileRecorder::new(&config.state_dir));
            let monitor = Arc::new(MigrationMonitor::new(config, recorder));
            let guest = Arc::new(Guest::new(Arc::new(VirshDomain::new(
                &domain,
                monitor.host().clone(),
            ))));

            let mut instance = Instance::new(domain.clone(), local_host_name(), memory_mb);
            let mut migration = Migration::new(&instance, &dest);
            println!("Migration {} of '{}' to '{}'", migration.id, domain, dest);

            let interrupts = {
                let monitor = monitor.clone();
                let guest = guest.clone();
                let uuid = instance.uuid;
                tokio::spawn(async move {
                    let mut presses = 0;
                    while tokio::signal::ctrl_c().await.is_ok() {
                        presses += 1;
                        if presses == 1 {
                            match monitor.force_complete(&uuid) {
                                Ok(()) => eprintln!(
                                    "Forcing migration to complete; press Ctrl-C again to abort"
                                ),
                                Err(e) => logger::warn!("Force-complete not queued: {}", e),
                            }
                        } else {
                            if let Err(e) = monitor.abort(&guest).await {
                                logger::error!("Abort failed: {}", e);
                            }
                            break;
                        }
                    }
                })
            };

            let request = MigrationRequest {
                dest,
                migrate_data,
                migrate_disks: disks,
                disk_sizes,
            };
            let result = monitor
                .live_migration(
                    guest,
                    &mut instance,
                    &mut migration,
                    request,
                    &ConnectionInfoResolver,
                )
                .await;
            interrupts.abort();

            match result.context("live migration failed")? {
                MigrationOutcome::Completed => println!("✅ Migration {} completed", migration.id),
                MigrationOutcome::Failed => anyhow::bail!("migration {} failed", migration.id),
                MigrationOutcome::Cancelled => {
                    anyhow::bail!("migration {} was cancelled", migration.id)
                }
            }
        }
        Commands::Status { migration_id } => {
            let recorder = JsonFileRecorder::new(&config.state_dir);
            let migration = recorder.load_migration(&migration_id).await?;

            println!("Migration:   {}", migration.id);
            println!("Status:      {}", migration.status);
            println!(
                "Route:       {} -> {}",
                migration.source_compute, migration.dest_compute
            );
            println!(
                "Memory:      {} processed, {} remaining of {} bytes",
                migration.memory_processed, migration.memory_remaining, migration.memory_total
            );
            println!(
                "Disk:        {} processed, {} remaining of {} bytes",
                migration.disk_processed, migration.disk_remaining, migration.disk_total
            );
            println!("Updated:     {}", migration.updated_at);

            match recorder.load_instance(&migration.instance_uuid).await {
                Ok(instance) => {
                    println!("Instance:    {} ({})", instance.name, instance.uuid);
                    println!("Progress:    {}%", instance.progress);
                }
                Err(e) => logger::warn!("Instance record unavailable: {}", e),
            }
        }
        Commands::Steps { data_gb: size, memory_mb } => {
            let size = size.unwrap_or_else(|| data_gb(memory_mb, &[]));
            println!("{:>12}  {:>10}", "elapsed ms", "downtime");
            for (threshold, downtime) in downtime_steps(&config, size) {
                println!("{:>12}  {:>8}ms", threshold, downtime);
            }
        }
        Commands::PatchXml { file, patch } => {
            let xml = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let data = patch.into_migrate_data(false)?;
            let patched = update_guest_xml(&xml, &data, &ConnectionInfoResolver)?;
            println!("{}", patched);
        }
    }

    Ok(())
}
