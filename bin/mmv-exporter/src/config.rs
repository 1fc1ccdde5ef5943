use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{ensure, Context as _};
use clap::{Args, Parser, Subcommand};
use mmv_app::{config::ConfigurationLoader, logging::LoggingConfiguration, GenericError};
use mmv_polling::MIN_UPDATE_INTERVAL;
use mmv_writer::{format::mmv::CLUSTER_ID_MASK, MmvFormatConfig};
use serde::Deserialize;

/// Prefix of environment variables that override the configuration file.
const ENV_PREFIX: &str = "MMV";

#[derive(Parser)]
#[command(about, version)]
pub struct Cli {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand)]
pub enum Action {
    /// Exports metrics to an MMV file until interrupted.
    Run(RunConfig),

    /// Decodes an MMV file and prints every metric value.
    Dump(DumpConfig),
}

#[derive(Args)]
pub struct RunConfig {
    /// Path to a YAML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Args)]
pub struct DumpConfig {
    /// Path to the MMV file.
    pub file: PathBuf,
}

/// Header flags to set on the exported file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FlagsConfiguration {
    /// Readers should not prefix metric names with the file name.
    pub no_prefix: bool,

    /// Readers should only export the file while this process is alive.
    pub process: bool,
}

/// Exporter configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ExporterConfiguration {
    /// Path to the MMV file. Defaults to `<temp dir>/mmv/<executable name>`.
    pub path: Option<PathBuf>,

    /// Cluster ID written to the file header. Must fit in 12 bits.
    pub cluster_id: u32,

    /// Header flags.
    pub flags: FlagsConfiguration,

    /// Polling interval, in milliseconds.
    pub poll_interval: u64,

    /// Names of the workers to report heartbeats for.
    pub workers: Vec<String>,

    /// Logging configuration.
    #[serde(flatten)]
    pub logging: LoggingConfiguration,
}

impl Default for ExporterConfiguration {
    fn default() -> Self {
        Self {
            path: None,
            cluster_id: 0,
            flags: FlagsConfiguration::default(),
            poll_interval: 1000,
            workers: Vec::new(),
            logging: LoggingConfiguration::default(),
        }
    }
}

impl ExporterConfiguration {
    /// Checks that every setting is within range.
    ///
    /// # Errors
    ///
    /// If the cluster ID or polling interval is out of range, an error is returned.
    pub fn validate(&self) -> Result<(), GenericError> {
        ensure!(
            self.cluster_id <= CLUSTER_ID_MASK,
            "cluster_id must fit in 12 bits (at most {}), got {}",
            CLUSTER_ID_MASK,
            self.cluster_id
        );
        ensure!(
            self.poll_interval() >= MIN_UPDATE_INTERVAL,
            "poll_interval must be at least {}ms, got {}ms",
            MIN_UPDATE_INTERVAL.as_millis(),
            self.poll_interval
        );
        Ok(())
    }

    /// Returns the path to the MMV file.
    pub fn path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            let name = std::env::current_exe()
                .ok()
                .and_then(|exe| exe.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "mmv-exporter".to_string());
            std::env::temp_dir().join("mmv").join(name)
        })
    }

    /// Returns the polling interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }

    /// Returns the format configuration for the MMV file.
    pub fn format_config(&self) -> MmvFormatConfig {
        MmvFormatConfig {
            cluster_id: self.cluster_id,
            no_prefix: self.flags.no_prefix,
            process: self.flags.process,
            process_id: None,
        }
    }
}

/// Loads the exporter configuration from the given file, if any, and then from `MMV_`-prefixed environment variables.
pub fn load_configuration(path: Option<&Path>) -> Result<ExporterConfiguration, GenericError> {
    let mut loader = ConfigurationLoader::default();
    if let Some(path) = path {
        loader = loader.from_yaml(path)?;
    }

    let config = loader
        .from_environment(ENV_PREFIX)?
        .into_typed::<ExporterConfiguration>()
        .context("Failed to deserialize exporter configuration.")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_yaml(contents: &str) -> Result<ExporterConfiguration, GenericError> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exporter.yaml");
        std::fs::write(&path, contents).unwrap();

        let config = ConfigurationLoader::default()
            .from_yaml(&path)?
            .into_typed::<ExporterConfiguration>()?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn defaults() {
        let config = load_yaml("{}").unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.cluster_id, 0);
        assert!(config.workers.is_empty());
        assert!(!config.logging.log_format_json);
        assert_eq!(config.logging.log_level.as_str(), "info");
        assert!(config.path().starts_with(std::env::temp_dir().join("mmv")));
    }

    #[test]
    fn full_configuration() {
        let config = load_yaml(
            "path: /tmp/exporter.mmv\n\
             cluster_id: 123\n\
             flags:\n  no_prefix: true\n\
             poll_interval: 250\n\
             workers: [alpha, beta]\n\
             log_level: debug\n\
             log_format_json: true\n",
        )
        .unwrap();

        assert_eq!(config.path(), PathBuf::from("/tmp/exporter.mmv"));
        assert_eq!(config.workers, ["alpha", "beta"]);
        assert!(config.logging.log_format_json);
        assert_eq!(config.logging.log_level.as_str(), "debug");

        let format = config.format_config();
        assert_eq!(format.cluster_id, 123);
        assert!(format.no_prefix);
        assert!(!format.process);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(load_yaml("cluster_id: 4096\n").is_err());
        assert!(load_yaml("cluster_id: 4095\n").is_ok());
        assert!(load_yaml("poll_interval: 100\n").is_err());
        assert!(load_yaml("log_level: 'info,x=nope'\n").is_err());
    }
}
