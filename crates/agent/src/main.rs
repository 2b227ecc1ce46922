use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use agent::{spawn_service, ServiceConfig, ServiceError};

#[derive(Parser, Debug)]
#[command(name = "dms-agent")]
#[command(about = "Per-node mount execution agent for the Dynamic Mount Service")]
struct Cli {
    /// Path to the agent config file (TOML)
    #[arg(long, global = true)]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent, serving mount RPCs for this node
    Serve(ServeArgs),
    /// Print the agent version
    Version,
}

#[derive(Args, Debug, Clone)]
struct ServeArgs {
    /// Override the node id (default from config, then hostname)
    #[arg(long)]
    node_id: Option<String>,

    /// Directory for log files (logs to stdout only if not set)
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Version => {
            println!("dms-agent {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        Command::Serve(args) => {
            let mut config = match ServiceConfig::load(cli.config_path.as_deref()) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Error: invalid configuration: {e}");
                    return ExitCode::from(2);
                }
            };

            if let Some(node_id) = args.node_id {
                config.node_id = node_id;
            }
            if let Some(log_dir) = args.log_dir {
                config.log_dir = Some(log_dir);
            }

            match spawn_service(&config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e @ (ServiceError::Broker { .. } | ServiceError::Serve(_))) => {
                    eprintln!("Error: fatal broker failure: {e}");
                    ExitCode::from(3)
                }
                Err(e) => {
                    eprintln!("Error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
