use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// camfleet control plane - distributes process manifests to the node agents
/// and issues lifecycle commands typed at the prompt.
#[derive(Debug, Clone, Parser)]
#[command(name = "control-plane")]
#[command(version, about, long_about = None)]
pub struct Config {
    /// INI run config with [PARAMETERS], [SERVERS] and optional [GROUPS].
    #[arg(long, env = "CAMFLEET_RUN_CONFIG", default_value = "run_config.ini")]
    pub run_config: PathBuf,

    /// Directory of per-node JSON template files.
    #[arg(long, env = "CAMFLEET_TEMPLATE_DIR", default_value = "templates")]
    pub template_dir: PathBuf,

    /// Deadline for connecting to an agent and delivering its manifest.
    #[arg(
        long = "connect-timeout-ms",
        env = "CAMFLEET_CONNECT_TIMEOUT_MS",
        default_value = "3000",
        value_parser = parse_millis
    )]
    pub connect_timeout: Duration,

    /// Deadline for delivering one command to one node, reconnect included.
    #[arg(
        long = "dispatch-timeout-ms",
        env = "CAMFLEET_DISPATCH_TIMEOUT_MS",
        default_value = "5000",
        value_parser = parse_millis
    )]
    pub dispatch_timeout: Duration,

    #[arg(long, env = "CAMFLEET_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            connect_timeout: self.connect_timeout,
            dispatch_timeout: self.dispatch_timeout,
        }
    }
}

/// Per-node deadlines used by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    pub connect_timeout: Duration,
    pub dispatch_timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            dispatch_timeout: Duration::from_secs(5),
        }
    }
}

fn parse_millis(value: &str) -> Result<Duration, ParseIntError> {
    value.trim().parse().map(Duration::from_millis)
}
