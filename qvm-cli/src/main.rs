//! Entry point for the `qvm` command-line tool.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use qvm_core::{HostPlatform, InstanceId, MacAddress, Size};
use qvm_executor::{
    stop_pid, CloudInitConfig, ConfigOption, ExecutorError, InstanceConfig, InstanceHandle,
    NetworkMode, SocketPaths, StdioMode, Supervisor,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Run and supervise QEMU instances.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Start an instance and wait for it to exit (Ctrl-C stops it).
    Run(RunArgs),

    /// Watch an instance started elsewhere until it exits.
    Attach {
        /// Hypervisor process id.
        #[arg(long)]
        pid: u32,
        /// Instance name the sockets were derived from.
        #[arg(long)]
        name: InstanceId,
        /// Directory holding the instance sockets.
        #[arg(long, default_value = "/tmp")]
        runtime_dir: PathBuf,
    },

    /// Send SIGTERM to a hypervisor process.
    Stop {
        /// Hypervisor process id.
        #[arg(long)]
        pid: u32,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Disk image to boot.
    #[arg(long)]
    image: PathBuf,
    /// Instance name; used for socket, tap and hostname.
    #[arg(long, default_value = "qvm")]
    name: InstanceId,
    #[arg(long, default_value_t = 1)]
    cpus: u32,
    /// Memory size, e.g. `1G`, `2048MiB`.
    #[arg(long, default_value = "1024MiB")]
    memory: String,
    /// Disk size; the image is grown if smaller.
    #[arg(long, default_value = "40960MiB")]
    disk: String,
    /// cloud-config user data file.
    #[arg(long)]
    user_data: Option<PathBuf>,
    /// cloud-init network-config file.
    #[arg(long)]
    network_config: Option<PathBuf>,
    /// Guest MAC address (QEMU picks one when omitted).
    #[arg(long)]
    mac: Option<MacAddress>,
    /// Generate a random locally administered MAC address.
    #[arg(long, conflicts_with = "mac")]
    random_mac: bool,
    /// Append hypervisor stdout to this file.
    #[arg(long, requires = "stderr", conflicts_with = "follow")]
    stdout: Option<PathBuf>,
    /// Append hypervisor stderr to this file.
    #[arg(long, requires = "stdout", conflicts_with = "follow")]
    stderr: Option<PathBuf>,
    /// Print hypervisor output line by line.
    #[arg(long)]
    follow: bool,
    /// vmnet bridged mode on this host interface (macOS).
    #[arg(long, conflicts_with = "shared")]
    bridged: Option<String>,
    /// vmnet shared mode (macOS).
    #[arg(long)]
    shared: bool,
    #[arg(long, requires = "shared")]
    shared_start: Option<String>,
    #[arg(long, requires = "shared")]
    shared_end: Option<String>,
    #[arg(long, requires = "shared")]
    shared_mask: Option<String>,
    /// Directory for the control and guest-agent sockets.
    #[arg(long)]
    runtime_dir: Option<PathBuf>,
    /// Parent directory for the ephemeral cloud-init directory.
    #[arg(long)]
    work_dir: Option<PathBuf>,
    /// Hypervisor binary (defaults to the host's `qemu-system-*`).
    #[arg(long)]
    qemu: Option<PathBuf>,
    /// Stop the instance after this many seconds.
    #[arg(long)]
    stop_after: Option<u64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Cmd::Run(args) => run(args).await,
        Cmd::Attach {
            pid,
            name,
            runtime_dir,
        } => attach(pid, name, runtime_dir).await,
        Cmd::Stop { pid } => stop_pid(pid),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "qvm failed");
        std::process::exit(1);
    }
}

async fn run(args: RunArgs) -> Result<(), ExecutorError> {
    let host = HostPlatform::current()?;
    let config = build_config(&host, &args).await?;

    let mut supervisor = Supervisor::for_host(&host);
    if let Some(qemu) = args.qemu.clone() {
        supervisor = supervisor.with_binary(qemu);
    }

    let stdio = match (args.stdout, args.stderr) {
        (Some(stdout), Some(stderr)) => StdioMode::Files { stdout, stderr },
        _ if args.follow => StdioMode::Lines,
        _ => StdioMode::Null,
    };

    let mut handle = supervisor.start(&config, stdio).await?;
    info!(instance = %handle.id, pid = handle.pid, qmp = %handle.sockets.qmp.display(), "instance running");

    if let Some(mut stdout) = handle.take_stdout() {
        tokio::spawn(async move {
            while let Some(line) = stdout.recv().await {
                println!("{line}");
            }
        });
    }
    if let Some(mut stderr) = handle.take_stderr() {
        tokio::spawn(async move {
            while let Some(line) = stderr.recv().await {
                eprintln!("{line}");
            }
        });
    }

    let stop_after = args.stop_after;
    let deadline = async {
        match stop_after {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        completed = handle.wait() => {
            if !completed {
                tracing::warn!(instance = %handle.id, "watcher stopped before the instance completed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!(instance = %handle.id, "interrupted");
            stop_and_wait(&handle).await?;
        }
        () = deadline => {
            info!(instance = %handle.id, "stop-after deadline reached");
            stop_and_wait(&handle).await?;
        }
    }

    info!(instance = %handle.id, "instance finished");
    Ok(())
}

async fn build_config(host: &HostPlatform, args: &RunArgs) -> Result<InstanceConfig, ExecutorError> {
    let user_data = match &args.user_data {
        Some(path) => tokio::fs::read_to_string(path).await?,
        None => String::new(),
    };
    let network_config = match &args.network_config {
        Some(path) => Some(tokio::fs::read_to_string(path).await?),
        None => None,
    };

    let mut options = ConfigOption::host_defaults(host);
    options.extend([
        ConfigOption::Image(args.image.clone()),
        ConfigOption::Cpus(args.cpus),
        ConfigOption::Memory(Size::from(args.memory.as_str())),
        ConfigOption::Disk(Size::from(args.disk.as_str())),
        ConfigOption::CloudInit(CloudInitConfig {
            user_data,
            network_config,
        }),
    ]);

    let mac = if args.random_mac {
        Some(MacAddress::random())
    } else {
        args.mac
    };
    if let Some(mac) = mac {
        options.push(ConfigOption::Mac(mac));
    }

    if let Some(interface) = &args.bridged {
        options.push(ConfigOption::NetworkMode(NetworkMode::bridged(interface.clone())));
    } else if args.shared {
        let mode = match (&args.shared_start, &args.shared_end, &args.shared_mask) {
            (None, None, None) => NetworkMode::shared_default(),
            (start, end, mask) => NetworkMode {
                bridged: None,
                shared: Some(qvm_executor::SharedMode {
                    start_address: start.clone(),
                    end_address: end.clone(),
                    subnet_mask: mask.clone(),
                }),
            },
        };
        options.push(ConfigOption::NetworkMode(mode));
    }

    if let Some(dir) = &args.runtime_dir {
        options.push(ConfigOption::RuntimeDir(dir.clone()));
    }
    if let Some(dir) = &args.work_dir {
        options.push(ConfigOption::WorkDir(dir.clone()));
    }

    Ok(InstanceConfig::with_options(args.name.clone(), options))
}

async fn stop_and_wait(handle: &InstanceHandle) -> Result<(), ExecutorError> {
    match handle.stop() {
        Ok(()) => {}
        // Exited between the signal and the stop request.
        Err(ExecutorError::ProcessLookup { .. }) => {}
        Err(e) => return Err(e),
    }
    if !handle.wait().await {
        tracing::warn!(instance = %handle.id, "watcher stopped before the instance completed");
    }
    Ok(())
}

async fn attach(pid: u32, name: InstanceId, runtime_dir: PathBuf) -> Result<(), ExecutorError> {
    let sockets = SocketPaths::derive(&runtime_dir, &name);
    let handle = Supervisor::attach(pid, name, sockets)?;

    tokio::select! {
        completed = handle.wait() => {
            if completed {
                info!(instance = %handle.id, pid, "instance exited");
            } else {
                tracing::warn!(instance = %handle.id, pid, "watcher stopped before the instance exited");
            }
        }
        _ = tokio::signal::ctrl_c() => info!(instance = %handle.id, pid, "detached"),
    }
    Ok(())
}
