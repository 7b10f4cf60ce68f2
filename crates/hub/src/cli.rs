//! Command-line interface of the hub binary.

use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;

/// Command line arguments; every option overrides the file value.
#[derive(Debug, Clone)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub bind_address: Option<String>,
    pub log_level: Option<String>,
    pub json_logs: bool,
    /// Run against the in-memory store instead of MySQL
    pub memory_store: bool,
}

impl CliArgs {
    pub fn parse() -> Self {
        Self::from_matches(Self::command().get_matches())
    }

    fn command() -> Command {
        Command::new("Grivyzom Hub")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Player-state synchronization hub for a network of game nodes")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("hub.toml"),
            )
            .arg(
                Arg::new("bind")
                    .short('b')
                    .long("bind")
                    .value_name("ADDRESS")
                    .help("Bind address for node connections (e.g., 0.0.0.0:25590)"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(ArgAction::SetTrue),
            )
            .arg(
                Arg::new("memory-store")
                    .long("memory-store")
                    .help("Keep player data in memory instead of MySQL")
                    .action(ArgAction::SetTrue),
            )
    }

    fn from_matches(matches: clap::ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("hub.toml")),
            bind_address: matches.get_one::<String>("bind").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            memory_store: matches.get_flag("memory-store"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::from_matches(CliArgs::command().get_matches_from(args))
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["hub"]);
        assert_eq!(args.config_path, PathBuf::from("hub.toml"));
        assert!(args.bind_address.is_none());
        assert!(!args.json_logs);
        assert!(!args.memory_store);
    }

    #[test]
    fn test_overrides() {
        let args = parse(&[
            "hub",
            "--config",
            "/etc/hub.toml",
            "-b",
            "0.0.0.0:4000",
            "--log-level",
            "debug",
            "--json-logs",
            "--memory-store",
        ]);
        assert_eq!(args.config_path, PathBuf::from("/etc/hub.toml"));
        assert_eq!(args.bind_address.as_deref(), Some("0.0.0.0:4000"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
        assert!(args.memory_store);
    }
}
