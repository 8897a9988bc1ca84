//! Command-line argument parsing for the proxy binary.

use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments for the Bifrost proxy
///
/// Every option except `--config` and `--workers` overrides a value from the
/// configuration file.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "QUIC reverse proxy for game servers", long_about = None)]
pub struct Args {
    /// Configuration file path
    ///
    /// A default configuration is written here if the file doesn't exist.
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// QUIC bind address, e.g. "0.0.0.0:25577"
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Output logs in JSON format
    #[arg(long)]
    pub json_logs: bool,

    /// Number of runtime worker threads (defaults to the CPU count)
    #[arg(short, long)]
    pub workers: Option<usize>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: PathBuf::from("config.toml"),
            bind: None,
            log_level: None,
            json_logs: false,
            workers: None,
        }
    }
}

impl Args {
    /// Worker threads for the runtime, never less than one.
    pub fn worker_threads(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default() {
        let args = Args::default();
        assert_eq!(args.config, PathBuf::from("config.toml"));
        assert!(args.bind.is_none());
        assert!(args.log_level.is_none());
        assert!(!args.json_logs);
        assert!(args.worker_threads() >= 1);
    }

    #[test]
    fn test_args_parse_overrides() {
        let args = Args::try_parse_from([
            "bifrost",
            "--config",
            "proxy.toml",
            "-b",
            "127.0.0.1:9000",
            "--log-level",
            "debug",
            "--json-logs",
            "--workers",
            "0",
        ])
        .unwrap();

        assert_eq!(args.config, PathBuf::from("proxy.toml"));
        assert_eq!(args.bind.as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
        assert_eq!(args.worker_threads(), 1);
    }
}
