//! Exports the exporter's own metrics through a memory-mapped MMV file, and decodes existing MMV files.

#![deny(warnings)]
#![deny(missing_docs)]

use clap::Parser as _;
use mmv_app::logging::{fatal_and_exit, initialize_logging};
use tracing::{error, info};

mod config;
use self::config::{load_configuration, Action, Cli};

mod dump;
use self::dump::dump;

mod run;
use self::run::run;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.action {
        Action::Run(run_config) => {
            let config = load_configuration(run_config.config.as_deref())
                .unwrap_or_else(|e| fatal_and_exit(format!("failed to load configuration: {:#}", e)));

            if let Err(e) = initialize_logging("mmv-exporter", &config.logging) {
                fatal_and_exit(format!("failed to initialize logging: {}", e));
            }

            match run(config).await {
                Ok(()) => info!("MMV exporter stopped."),
                Err(e) => {
                    error!("{:?}", e);
                    std::process::exit(1);
                }
            }
        }
        Action::Dump(dump_config) => {
            if let Err(e) = dump(&dump_config.file) {
                fatal_and_exit(format!("failed to dump '{}': {:#}", dump_config.file.display(), e));
            }
        }
    }
}
