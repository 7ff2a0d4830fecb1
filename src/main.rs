use std::fs::File;

use anyhow::{anyhow, Result};
use clap::Parser;
use daemonize::Daemonize;
use log::LevelFilter;
use syslog::{BasicLogger, Facility, Formatter3164};

use pwmfand::application::Application;
use pwmfand::cli::Cli;
use pwmfand::config;

fn init_log() -> Result<()> {
    syslog::unix(Formatter3164 {
        facility: Facility::LOG_DAEMON,
        hostname: None,
        process: "pwmfand".into(),
        pid: 0,
    })
    .map_err(|e| anyhow!("{e}"))
    .and_then(|logger| {
        log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
            .map(|()| log::set_max_level(LevelFilter::Info))
            .map_err(|e| anyhow!("{e}"))
    })
}

fn into_daemon() -> Result<()> {
    File::create("/var/tmp/pwmfand.log")
        .and_then(|out| Ok((out.try_clone()?, out)))
        .map_err(|e| anyhow!("{e}"))
        .and_then(|(stderr, stdout)| {
            Daemonize::new()
                .stdout(stdout)
                .stderr(stderr)
                .start()
                .map_err(|e| anyhow!("{e}"))
        })
}

#[tokio::main]
async fn tokio_main(cli: Cli) -> Result<()> {
    let config = config::load(cli.config)?;
    Application::new(config).run().await
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_log()?;
    if cli.daemonize {
        into_daemon()?;
    }
    tokio_main(cli)
}
