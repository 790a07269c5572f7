//! Command-line arguments shared by EMS services
//!
//! Services flatten [`ServiceArgs`] into their own parser or use it as is.

use std::path::PathBuf;

use clap::Parser;

/// Common service startup arguments
#[derive(Debug, Clone, Parser)]
#[clap(author, version, about)]
pub struct ServiceArgs {
    /// Configuration file path
    #[clap(short = 'c', long, default_value = "config/gwsrv.yaml")]
    pub config: PathBuf,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[clap(short = 'l', long, env = "RUST_LOG")]
    pub log_level: Option<String>,

    /// Disable colored output
    #[clap(long)]
    pub no_color: bool,

    /// Only validate configuration without starting service
    #[clap(long)]
    pub validate: bool,

    /// Write a daily rolling log file into this directory
    #[clap(long)]
    pub log_dir: Option<PathBuf>,
}

impl Default for ServiceArgs {
    fn default() -> Self {
        Self {
            config: PathBuf::from("config/gwsrv.yaml"),
            log_level: None,
            no_color: false,
            validate: false,
            log_dir: None,
        }
    }
}

impl ServiceArgs {
    /// Parse the log level, falling back to INFO for anything unrecognised
    pub fn parse_log_level(&self) -> tracing::Level {
        match self
            .log_level
            .as_deref()
            .unwrap_or("info")
            .to_lowercase()
            .as_str()
        {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" | "warning" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }

    /// Filter directive for the logger: CLI/env value, else `fallback`
    pub fn log_filter(&self, fallback: &str) -> String {
        match self.log_level.as_deref() {
            Some(level) if !level.trim().is_empty() => level.to_string(),
            _ => fallback.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = ServiceArgs::default();
        assert_eq!(args.config, PathBuf::from("config/gwsrv.yaml"));
        assert!(!args.validate);
        assert!(args.log_dir.is_none());
    }

    #[test]
    fn test_parse_from_cli() {
        let args = ServiceArgs::try_parse_from([
            "gwsrv",
            "--config",
            "/etc/gw.yaml",
            "--validate",
            "--no-color",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/gw.yaml"));
        assert!(args.validate);
        assert!(args.no_color);
        assert_eq!(args.parse_log_level(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_parse_log_level() {
        let args = ServiceArgs {
            log_level: Some("WARN".to_string()),
            ..Default::default()
        };
        assert_eq!(args.parse_log_level(), tracing::Level::WARN);

        let args = ServiceArgs {
            log_level: Some("invalid".to_string()),
            ..Default::default()
        };
        assert_eq!(args.parse_log_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_log_filter_fallback() {
        let args = ServiceArgs::default();
        assert_eq!(args.log_filter("warn"), "warn");

        let args = ServiceArgs {
            log_level: Some("info,gwsrv=trace".to_string()),
            ..Default::default()
        };
        assert_eq!(args.log_filter("warn"), "info,gwsrv=trace");
    }
}
