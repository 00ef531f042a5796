//! A parser for the command line flags and configuration file.
use crate::config::Config;
use clap::Parser;
use slog::Level;
use std::{fs::File, io, path::PathBuf};
use thiserror::Error;

/// This enum is used to represent errors that could occur while loading the config.
#[derive(Debug, Error)]
pub enum CliError {
    /// The config file could not be read.
    #[error("Failed to read the config file: {0}")]
    Io(#[from] io::Error),
    /// The config file is not a valid config document.
    #[error("Failed to deserialize the config: {0}")]
    Deserialize(#[from] serde_json::Error),
}

/// This struct is use to provide a command line interface to the harness.
#[derive(Parser)]
#[command(
    version,
    about = "Submits invalid blocks to Bitcoin nodes and checks how they react."
)]
pub struct Cli {
    /// This field contains the path to the config file.
    pub config: PathBuf,

    /// This field represents if the harness should run in verbose.
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Loads the config from the provided `config` argument.
    pub fn get_config(&self) -> Result<Config, CliError> {
        let file = File::open(&self.config)?;
        let mut config: Config = serde_json::from_reader(io::BufReader::new(file))?;
        if self.verbose {
            config.logger.level = Level::Trace;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use bitcoin::Network;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CONFIG: &str = r#"{
        "network": "signet",
        "targets": [{"p2p_address": "127.0.0.1:38333", "rpc_url": "http://127.0.0.1:38332"}],
        "logger": {"level": "warning"}
    }"#;

    fn config_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", contents).unwrap();
        file
    }

    #[test]
    fn test_cli_reads_config() {
        let file = config_file(CONFIG);
        let cli = Cli::parse_from(["block-harness", file.path().to_str().unwrap()]);
        let config = cli.get_config().unwrap();
        assert_eq!(config.network, Network::Signet);
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.logger.level, Level::Warning);
    }

    #[test]
    fn test_verbose_raises_log_level() {
        let file = config_file(CONFIG);
        let cli = Cli::parse_from(["block-harness", "-v", file.path().to_str().unwrap()]);
        assert_eq!(cli.get_config().unwrap().logger.level, Level::Trace);
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "block-harness",
            dir.path().join("missing.json").to_str().unwrap(),
        ]);
        assert_matches!(cli.get_config(), Err(CliError::Io(_)));
    }

    #[test]
    fn test_malformed_file_is_a_deserialize_error() {
        let file = config_file("{\"network\": ");
        let cli = Cli::parse_from(["block-harness", file.path().to_str().unwrap()]);
        assert_matches!(cli.get_config(), Err(CliError::Deserialize(_)));
    }
}
