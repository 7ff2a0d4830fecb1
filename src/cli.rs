use clap::Parser;
use std::path::PathBuf;

/// pwmfand — closed-loop PWM fan control daemon for Linux hwmon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML config file path (default: /etc/pwmfand/config.yml)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Detach from the terminal and run as a daemon
    #[arg(short = 'd', long = "daemonize", default_value = "false")]
    pub daemonize: bool,
}
