use anyhow::Context as _;
use clap::Parser as _;
use log::error;
use partaked::cli::Cli;
use partaked::Daemon;
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match cli.validate() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            eprintln!("Run with --help for more information.");
            return ExitCode::FAILURE;
        }
    };

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: &partaked::DaemonConfig) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async {
        let daemon = Daemon::bind(config)?;
        daemon.run_with_signals().await
    })?;
    Ok(())
}
