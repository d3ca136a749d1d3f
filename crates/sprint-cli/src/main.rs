// Command-line entrypoint (spec.md's ambient CLI surface): `sprint run`,
// `sprint check-config`, `sprint version`. Grounded on the teacher's
// logging init (env_logger) and its stop-signal-on-shutdown pattern,
// generalized here to the process-wide CancelToken.

use clap::{Parser, Subcommand};
use sprint_core::config::SprintConfig;
use sprint_core::Sprint;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sprint", version, about = "Bitcoin Sprint relay core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay: tip poller, peer mesh, fan-out, HTTP surface.
    Run {
        #[arg(long, env = "SPRINT_LICENSE_STATE_FILE", default_value = "sprint-license-state.json")]
        license_state_file: PathBuf,
    },
    /// Validate configuration and print a redacted summary, then exit.
    CheckConfig,
    /// Print the binary version.
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("sprint {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::CheckConfig => {
            init_logging("info");
            match SprintConfig::from_env() {
                Ok(config) => {
                    println!("{}", serde_json::to_string_pretty(&config.redacted_summary()).unwrap());
                }
                Err(e) => {
                    eprintln!("configuration error: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Run { license_state_file } => {
            let config = match SprintConfig::from_env() {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("fatal configuration error: {e}");
                    std::process::exit(1);
                }
            };
            init_logging(&config.log_level);
            log::info!("starting sprint with config {}", config.redacted_summary());

            let sprint = Sprint::new(config, license_state_file);
            let cancel = sprint.cancel_token();

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::info!("received shutdown signal");
                    cancel.cancel();
                }
            });

            sprint.run().await;
            log::info!("sprint stopped");
        }
    }
}

fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}
