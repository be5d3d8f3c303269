//! gpu-partitioner: assign host GPU partitions to Hyper-V guests.
//!
//! Thin CLI over [`GpuPartitionOrchestrator`]. Progress lines and raw remote
//! output stream to stdout; logs go to stderr (and to a file with
//! `GPU_PARTITIONER_LOG=1`).

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use gpu_partitioner::config::Config;
use gpu_partitioner::disk::{Partition, candidate_partitions, parse_partitions};
use gpu_partitioner::host::powershell::PowerShell;
use gpu_partitioner::host::registry::RegExe;
use gpu_partitioner::logging;
use gpu_partitioner::paths::AppPaths;
use gpu_partitioner::remote::{ProxyEndpoint, SshClientFactory, SshCredentials};
use gpu_partitioner::{
    AssignmentRequest, CancelToken, GpuPartitionOrchestrator, HostServices, Outcome, Progress,
    ProgressKind,
};

const EXIT_REBOOT_RETRY: u8 = 2;

/// Hyper-V GPU partition assignment
#[derive(Parser, Debug)]
#[command(name = "gpu-partitioner", version, about = "Assign host GPU partitions to Hyper-V guests")]
struct Args {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the partitions of a raw device or disk image
    Partitions {
        device: PathBuf,
        /// Include small and non-OS partitions
        #[arg(long)]
        all: bool,
    },
    /// List provisionable partitions on a guest's first virtual disk
    GuestPartitions { guest: String },
    /// Attach a GPU partition to a guest and provision its drivers
    Assign(AssignArgs),
    /// List GPU partition adapters attached to a guest
    Adapters { guest: String },
    /// Remove a GPU partition adapter from a guest
    Remove { guest: String, adapter_id: String },
}

#[derive(clap::Args, Debug)]
struct AssignArgs {
    guest: String,
    /// Host PnP instance id of the GPU
    gpu_device_id: String,
    /// GPU vendor (NVIDIA guests get an offline registry patch)
    #[arg(long)]
    vendor: String,
    /// Guest disk partition index to provision
    #[arg(long)]
    partition: Option<u32>,
    /// Remote-shell host (replaced by the guest's reported IPv4 address)
    #[arg(long)]
    ssh_host: Option<String>,
    #[arg(long)]
    ssh_user: Option<String>,
    #[arg(long)]
    ssh_port: Option<u16>,
    /// Environment variable holding the remote-shell password
    #[arg(long)]
    password_env: Option<String>,
    /// HTTP proxy for the guest, as host:port
    #[arg(long)]
    proxy: Option<ProxyEndpoint>,
    /// Skip the graphics stack on Linux guests
    #[arg(long)]
    no_graphics: bool,
    /// Run the assignment once more when the guest asks for a reboot retry
    #[arg(long)]
    follow_reboot: bool,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let _log_guard = logging::init();

    let paths = AppPaths::resolve();
    if let Some(paths) = &paths {
        if let Err(e) = paths.ensure() {
            warn!(error = %e, "could not create application directories");
        }
    }
    let config_path = args
        .config
        .clone()
        .or_else(|| paths.as_ref().map(AppPaths::config_file));
    let config = match &config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("creating Tokio runtime")?;

    runtime.block_on(run(args.command, config, paths))
}

async fn run(command: Command, config: Config, paths: Option<AppPaths>) -> Result<ExitCode> {
    let scratch = paths
        .as_ref()
        .map(|p| p.cache.clone())
        .unwrap_or_else(std::env::temp_dir);
    let orchestrator = || build_orchestrator(&config, &scratch);

    match command {
        Command::Partitions { device, all } => print_device_partitions(device, all).await,
        Command::GuestPartitions { guest } => {
            let partitions = orchestrator().guest_partitions(&guest).await?;
            print_partitions(&partitions);
            Ok(ExitCode::SUCCESS)
        }
        Command::Assign(assign) => assign_gpu(&orchestrator(), &config, assign).await,
        Command::Adapters { guest } => {
            let adapters = orchestrator().assigned_adapters(&guest).await?;
            if adapters.is_empty() {
                println!("No GPU partitions attached to '{guest}'");
            }
            for adapter in adapters {
                println!(
                    "{}  {}",
                    adapter.id,
                    adapter.instance_path.as_deref().unwrap_or("(unknown device)")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Remove { guest, adapter_id } => {
            orchestrator().remove_gpu_partition(&guest, &adapter_id).await?;
            println!("Removed {adapter_id} from '{guest}'");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_orchestrator(config: &Config, scratch: &std::path::Path) -> GpuPartitionOrchestrator {
    let shell = Arc::new(
        PowerShell::new(config.host.powershell.clone())
            .with_platform_override(config.host.platform.forced()),
    );
    let services = HostServices {
        gpus: shell.clone(),
        guests: shell.clone(),
        partitions: shell.clone(),
        disks: shell,
        hives: Arc::new(RegExe::new(config.host.reg_program.clone())),
        shells: Arc::new(SshClientFactory {
            options: config.ssh.options(),
        }),
    };
    GpuPartitionOrchestrator::new(services, config.orchestrator_settings(scratch))
}

async fn print_device_partitions(device: PathBuf, all: bool) -> Result<ExitCode> {
    let partitions = tokio::task::spawn_blocking(move || -> Result<Vec<Partition>> {
        let mut file = File::open(&device).with_context(|| format!("opening {}", device.display()))?;
        Ok(parse_partitions(&mut file))
    })
    .await??;
    let partitions = if all {
        partitions
    } else {
        candidate_partitions(partitions)
    };
    print_partitions(&partitions);
    Ok(ExitCode::SUCCESS)
}

fn print_partitions(partitions: &[Partition]) {
    if partitions.is_empty() {
        println!("No partitions found");
        return;
    }
    println!("{:>5}  {:>16}  {:>16}  {:<8}  DESCRIPTION", "INDEX", "OFFSET", "SIZE", "OS");
    for p in partitions {
        println!(
            "{:>5}  {:>16}  {:>16}  {:<8}  {}",
            p.index,
            p.start_offset_bytes,
            p.size_bytes,
            format!("{:?}", p.os_class),
            p.description
        );
    }
}

async fn assign_gpu(
    orchestrator: &GpuPartitionOrchestrator,
    config: &Config,
    args: AssignArgs,
) -> Result<ExitCode> {
    let partition = match args.partition {
        Some(index) => {
            let partitions = orchestrator.guest_partitions(&args.guest).await?;
            match partitions.into_iter().find(|p| p.index == index) {
                Some(p) => Some(p),
                None => bail!("partition {index} is not a provisionable partition of '{}'", args.guest),
            }
        }
        None => None,
    };

    let request = AssignmentRequest {
        guest: args.guest.clone(),
        gpu_device_id: args.gpu_device_id.clone(),
        vendor: args.vendor.clone(),
        partition,
        credentials: credentials(&args, config)?,
    };

    let cancel = CancelToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let mut outcome = assign_once(orchestrator, &request, &cancel).await;
    if matches!(outcome, Outcome::RebootRequiredRetry { .. }) && args.follow_reboot {
        info!(guest = %request.guest, "following reboot, running the assignment again");
        outcome = assign_once(orchestrator, &request, &cancel).await;
    }

    println!("{outcome}");
    Ok(match outcome {
        Outcome::Ok { .. } => ExitCode::SUCCESS,
        Outcome::RebootRequiredRetry { .. } => ExitCode::from(EXIT_REBOOT_RETRY),
        _ => ExitCode::FAILURE,
    })
}

async fn assign_once(
    orchestrator: &GpuPartitionOrchestrator,
    request: &AssignmentRequest,
    cancel: &CancelToken,
) -> Outcome {
    let (progress, mut events) = Progress::channel();
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = events.recv().await {
            match event.kind {
                ProgressKind::Line(line) => {
                    let _ = writeln!(stdout, "[{}] {line}", event.at.format("%H:%M:%S"));
                }
                ProgressKind::Output(chunk) => {
                    let _ = write!(stdout, "{chunk}");
                }
            }
            let _ = stdout.flush();
        }
    });

    let outcome = orchestrator.add_gpu_partition(request, &progress, cancel).await;
    drop(progress);
    let _ = printer.await;
    outcome
}

fn credentials(args: &AssignArgs, config: &Config) -> Result<Option<SshCredentials>> {
    let Some(username) = args.ssh_user.clone().or_else(|| config.ssh.username.clone()) else {
        return Ok(None);
    };
    let password = match &args.password_env {
        Some(var) => Some(std::env::var(var).with_context(|| format!("reading password from ${var}"))?),
        None => None,
    };
    Ok(Some(SshCredentials {
        host: args.ssh_host.clone().unwrap_or_else(|| args.guest.clone()),
        port: args.ssh_port.unwrap_or(config.ssh.port),
        username,
        password,
        proxy: args.proxy.clone(),
        install_graphics: !args.no_graphics,
    }))
}
