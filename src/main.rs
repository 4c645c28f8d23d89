//! bootvm CLI entry point.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// bootvm - run bootc OCI images as virtual machines
#[derive(Parser, Debug)]
#[command(name = "bootvm")]
#[command(about = "Boot container images as VMs with SSH access")]
#[command(
    long_about = "bootvm turns bootable container (bootc) images into running \
virtual machines.\n\n\
Disks are built once per image digest and cached; subsequent runs of the \
same digest boot immediately.\n\n\
Quick start:\n  \
bootvm run quay.io/fedora/fedora-bootc:42\n  \
bootvm list\n  \
bootvm ssh <id>"
)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Boot a bootc image as a VM
    Run(bootvm::cli::run::RunCmd),

    /// List cached VMs
    #[command(alias = "ps")]
    List(bootvm::cli::list::ListCmd),

    /// SSH into a running VM
    Ssh(bootvm::cli::ssh::SshCmd),

    /// Stop a running VM
    Stop(bootvm::cli::stop::StopCmd),

    /// Remove a cached VM
    #[command(alias = "remove")]
    Rm(bootvm::cli::rm::RmCmd),
}

fn main() {
    let cli = Cli::parse();

    init_logging();

    tracing::debug!(version = bootvm::VERSION, "starting bootvm");

    let result = match cli.command {
        Commands::Run(cmd) => cmd.run(),
        Commands::List(cmd) => cmd.run(),
        Commands::Ssh(cmd) => cmd.run(),
        Commands::Stop(cmd) => cmd.run(),
        Commands::Rm(cmd) => cmd.run(),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bootvm=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
