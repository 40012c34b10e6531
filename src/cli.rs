// src/cli.rs
//! CLI definitions for the pkgmux client
//!
//! Command implementations live in `main.rs`; everything the user sees
//! while a flow runs is rendered by the `console` module.

use clap::{Parser, Subcommand};
use pkgmux::config::ClientConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pkgmux")]
#[command(author, version)]
#[command(about = "Client for the shared package management daemon", long_about = None)]
pub struct Cli {
    /// Client configuration file
    #[arg(short, long, global = true, default_value = ClientConfig::DEFAULT_PATH)]
    pub config: PathBuf,

    /// JSON catalog describing applications, removal warnings and licenses
    #[arg(long, global = true)]
    pub catalog: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Synchronize repositories (all of them when none are given)
    Update {
        /// Repository identifiers
        repositories: Vec<String>,

        /// Synchronize even if the repositories look up to date
        #[arg(short, long)]
        force: bool,
    },

    /// Install an application
    Install {
        /// Package identifier inside the repository
        package_id: i64,

        /// Repository the package comes from
        repository: String,

        /// Resolve and report without changing the system
        #[arg(long)]
        simulate: bool,
    },

    /// Remove an installed application
    Remove {
        /// Package identifier inside the repository
        package_id: i64,

        /// Repository the package comes from
        repository: String,

        #[arg(long)]
        simulate: bool,
    },

    /// Upgrade every installed application
    Upgrade {
        #[arg(long)]
        simulate: bool,
    },

    /// Show daemon and local resource state
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_arguments() {
        let cli = Cli::parse_from(["pkgmux", "install", "42", "main", "--simulate"]);
        match cli.command {
            Commands::Install {
                package_id,
                repository,
                simulate,
            } => {
                assert_eq!(package_id, 42);
                assert_eq!(repository, "main");
                assert!(simulate);
            }
            _ => panic!("expected install"),
        }
        assert_eq!(cli.config, PathBuf::from(ClientConfig::DEFAULT_PATH));
    }

    #[test]
    fn test_update_takes_repositories_and_force() {
        let cli = Cli::parse_from(["pkgmux", "--config", "/tmp/c.toml", "update", "-f", "a", "b"]);
        assert_eq!(cli.config, PathBuf::from("/tmp/c.toml"));
        match cli.command {
            Commands::Update {
                repositories,
                force,
            } => {
                assert_eq!(repositories, vec!["a", "b"]);
                assert!(force);
            }
            _ => panic!("expected update"),
        }
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
