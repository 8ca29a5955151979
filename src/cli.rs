use std::{path::PathBuf, sync::OnceLock};

use clap::Parser;

/// Per-host container orchestration agent.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, default_value = "herdsman.toml")]
    pub config: PathBuf,

    /// Seconds between full container scans. Overrides the config file.
    #[arg(long)]
    pub scan_interval: Option<u64>,

    /// Scan once, run one reconciliation pass per service and exit.
    #[arg(long, default_value_t = false)]
    pub once: bool,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["herdsman"]);
        assert_eq!(args.config, PathBuf::from("herdsman.toml"));
        assert_eq!(args.scan_interval, None);
        assert!(!args.once);
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "herdsman",
            "-c",
            "/etc/herdsman.toml",
            "--scan-interval",
            "15",
            "--once",
        ]);
        assert_eq!(args.config, PathBuf::from("/etc/herdsman.toml"));
        assert_eq!(args.scan_interval, Some(15));
        assert!(args.once);
    }
}
