//! fleetctl: operator commands for a running fleet.
//!
//! ```text
//! fleetctl reload [APP] [--config PATH]
//! fleetctl stop [APP] [--config PATH]
//! fleetctl check [--config PATH]
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use rpcfleet::catalog::ServiceCatalog;
use rpcfleet::utils::bootstrap::init_cli_tracing;
use rpcfleet::{AppRuntime, Command, Config};

/// Control a fleet of gRPC apps sharing one config file.
#[derive(Parser, Debug)]
#[command(name = "fleetctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to RPCFLEET_CONFIG, then fleet.local.yaml, fleet.yaml, ...)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reload one app, or every running process when APP is omitted
    Reload { app: Option<String> },
    /// Stop one app, or every running process when APP is omitted
    Stop { app: Option<String> },
    /// Validate the config and resolve every served service
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_cli_tracing();
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Reload { app } => send(Command::Reload, app.as_deref(), &cli).await,
        Commands::Stop { app } => send(Command::Stop, app.as_deref(), &cli).await,
        Commands::Check => check(&cli),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns `Ok(false)` when any reply carried an error.
async fn send(command: Command, app: Option<&str>, cli: &Cli) -> Result<bool, rpcfleet::RuntimeError> {
    let replies = AppRuntime::send_command(command, app, cli.config.as_deref()).await?;
    if replies.is_empty() {
        println!("no running apps");
    }

    let mut ok = true;
    for reply in replies {
        if let Some(error) = reply.error {
            eprintln!("{}", error);
            ok = false;
        } else if let Some(result) = reply.result {
            println!("{}", result);
        }
    }
    Ok(ok)
}

fn check(cli: &Cli) -> Result<bool, rpcfleet::RuntimeError> {
    let config = Config::load(cli.config.as_deref())?;
    let catalog = ServiceCatalog::new();
    let snapshot = catalog.load(&config.proto_dirs, &config.proto_options, false)?;

    println!(
        "{} apps, control socket {}",
        config.apps.len(),
        config.sock_path().display()
    );

    let mut ok = true;
    for app in &config.apps {
        let role = if app.serve { "serves" } else { "hosted elsewhere" };
        println!("{} ({}) {}", app.name, app.uri, role);
        for service in &app.services {
            match snapshot.resolve(service) {
                Ok(descriptor) => println!("  {} ({} methods)", service, descriptor.methods().count()),
                Err(e) if app.serve => {
                    eprintln!("  {}: {}", service, e);
                    ok = false;
                }
                Err(e) => println!("  {}: {} (skipped by consumers)", service, e),
            }
        }
    }
    Ok(ok)
}
