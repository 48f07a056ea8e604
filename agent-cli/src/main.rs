//! Process-bootstrap entry point: the operator-facing half of the command surface described
//! in the process bootstrap section, covering everything except the two long-running run
//! modes (`agent-daemon` is the binary an installed service actually execs).

mod platform;

use std::sync::Arc;

use agent_core::config::{AgentConfig, ConfigError, ConfigOverrides};
use agent_core::enrollment::{self, EnrollmentError};
use agent_core::service::ServiceInstaller;
use agent_core::supervisor::SupervisorClient;

use clap::{Parser, Subcommand};
use colored::Colorize;

#[derive(Debug, Parser)]
#[command(name = "agent-cli", version, about = "Endpoint management agent bootstrap tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Install the agent as an OS service and enroll it against the configured server.
    RegisterAsService,
    /// Remove the agent's OS service registration.
    Unregister,
    /// Print enrollment state, server endpoint, and any pending update status.
    ShowStatus,
    /// Print the installed agent version.
    ShowVersion,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Enrollment(#[from] EnrollmentError),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[tokio::main]
async fn main() {
    let exit_code = match run().await {
        Ok(()) => 0,
        Err(CliError::Permission(msg)) => {
            eprintln!("{} {msg}", "error:".red().bold());
            2
        }
        Err(e @ CliError::Config(_)) | Err(e @ CliError::Enrollment(_)) => {
            eprintln!("{} {e}", "error:".red().bold());
            1
        }
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();

    if matches!(cli.command, Commands::ShowVersion) {
        println!("agent-cli {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let data_dir = AgentConfig::default_data_dir();
    std::fs::create_dir_all(&data_dir).map_err(|e| permission_or_other(&data_dir, e))?;

    let mut config = AgentConfig::load(&cli.overrides, &data_dir)?;
    let installer: Arc<dyn ServiceInstaller> = Arc::new(platform::UnimplementedServiceInstaller);

    match cli.command {
        Commands::ShowVersion => unreachable!("handled above"),

        Commands::RegisterAsService => {
            config.require_enrollable()?;
            if !config.identity.enrolled {
                println!("enrolling against {}...", config.server_url);
                enrollment::enroll(&mut config, env!("CARGO_PKG_VERSION")).await?;
                println!(
                    "{} enrolled as device {}",
                    "ok:".green().bold(),
                    config.identity.device_id
                );
            } else {
                println!(
                    "{} already enrolled as device {}",
                    "ok:".green().bold(),
                    config.identity.device_id
                );
            }

            installer
                .register()
                .await
                .map_err(|e| CliError::Other(anyhow::anyhow!(e)))?;
            println!("{} registered as an OS service", "ok:".green().bold());
        }

        Commands::Unregister => {
            installer
                .unregister()
                .await
                .map_err(|e| CliError::Other(anyhow::anyhow!(e)))?;
            println!("{} OS service registration removed", "ok:".green().bold());
        }

        Commands::ShowStatus => {
            print_status(&config)?;
        }
    }

    Ok(())
}

fn print_status(config: &AgentConfig) -> Result<(), CliError> {
    println!("{}", "agent status".bold());
    println!("  agent id:      {}", config.identity.agent_id);
    println!("  server:        {}", config.server_url);
    if config.identity.enrolled {
        println!("  enrolled:      {} (device {})", "yes".green(), config.identity.device_id);
    } else {
        println!("  enrolled:      {}", "no".yellow());
    }

    let supervisor = SupervisorClient::new(
        config.update_request_path.clone(),
        config.update_status_path.clone(),
        config.supervisor_pipe_path.clone(),
    );
    match supervisor
        .read_status()
        .map_err(|e| CliError::Other(anyhow::anyhow!(e)))?
    {
        Some(status) => println!("  pending update: {status:?}"),
        None => println!("  pending update: none"),
    }

    Ok(())
}

fn permission_or_other(path: &std::path::Path, source: std::io::Error) -> CliError {
    if source.kind() == std::io::ErrorKind::PermissionDenied {
        CliError::Permission(format!("cannot create {}: {source}", path.display()))
    } else {
        CliError::Other(anyhow::anyhow!("failed to create {}: {source}", path.display()))
    }
}
