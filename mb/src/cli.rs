//! Command-line interface definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Multi-backend AI inference gateway
#[derive(Debug, Parser)]
#[command(name = "mb", version, about)]
pub struct Cli {
    /// Path to a config file (default: .modelbridge.yml, then user config)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve tool calls over stdio (default)
    Serve,

    /// Print the global health view
    Health {
        /// Probe every backend first instead of reporting last-observed state
        #[arg(long)]
        probe: bool,
    },

    /// List the available roles
    Roles,

    /// One-shot prompt through the fallback router
    Ask {
        /// The prompt text
        prompt: String,

        /// Preferred backend name
        #[arg(long)]
        backend: Option<String>,

        /// Output-token budget
        #[arg(long)]
        max_tokens: Option<u32>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_none() {
        let cli = Cli::parse_from(["mb"]);
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_ask_parses() {
        let cli = Cli::parse_from(["mb", "ask", "what is 2+2", "--backend", "fast"]);
        match cli.command {
            Some(Command::Ask { prompt, backend, .. }) => {
                assert_eq!(prompt, "what is 2+2");
                assert_eq!(backend.as_deref(), Some("fast"));
            }
            other => panic!("expected Ask, got {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["mb", "health", "--probe", "--log-level", "debug"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Some(Command::Health { probe: true })));
    }
}
