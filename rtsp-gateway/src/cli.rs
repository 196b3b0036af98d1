use std::path::PathBuf;

use clap::Parser;

/// RTSP camera gateway: stream lifecycle orchestration over a JSON-lines
/// control channel on stdin/stdout.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter directive, e.g. `rtsp_gateway=debug`
    #[arg(long)]
    pub log_level: Option<String>,

    /// Directory for daily-rolling log files
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    pub test_config: bool,
}
