use clap::Parser;
use ic_btc_block_harness::{logger::new_logger, run_targets, Cli};
use serde_json::to_string_pretty;
use slog::{error, info, warn};

#[tokio::main]
pub async fn main() {
    let cli = Cli::parse();
    let config = match cli.get_config() {
        Ok(config) => config,
        Err(err) => {
            panic!("An error occurred while getting the config: {}", err);
        }
    };
    let (logger, async_log_guard) = match new_logger(&config.logger) {
        Ok(logger) => logger,
        Err(err) => {
            panic!("An error occurred while creating the logger: {}", err);
        }
    };

    info!(
        logger,
        "Starting the block harness with config: {}",
        to_string_pretty(&config).unwrap()
    );

    let mut failed = false;
    for (target, result) in run_targets(&config, &logger).await {
        match result {
            Ok(report) if report.passed() => {
                info!(logger, "{}: all {} steps passed", target, report.steps.len());
            }
            Ok(report) => {
                failed = true;
                for step in report.failures() {
                    if let Err(err) = &step.outcome {
                        warn!(logger, "{}: step {} failed: {}", target, step.alias, err);
                    }
                }
            }
            Err(err) => {
                failed = true;
                error!(logger, "{}: run aborted: {}", target, err);
            }
        }
    }

    drop(logger);
    drop(async_log_guard);
    if failed {
        std::process::exit(1);
    }
}
