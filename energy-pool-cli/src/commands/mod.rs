//! CLI Commands Module
//!
//! Command definitions for the energy pool operator CLI.

pub mod account;
pub mod order;

use clap::{Parser, Subcommand};

/// Energy Pool Operator CLI
#[derive(Parser, Debug)]
#[command(name = "energy-pool-cli")]
#[command(version)]
#[command(about = "TRON energy pool operator command line interface")]
#[command(long_about = "A command-line tool for operating the energy pool.\n\n\
    Use this tool to manage pool accounts, inspect live capacity, \
    handle orders and run the background order workers.")]
pub struct Cli {
    /// Data directory (env: ENERGY_POOL_DATA_DIR)
    #[arg(short, long, env = "ENERGY_POOL_DATA_DIR", default_value = "./energy_pool_data")]
    pub data_dir: String,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Table format (human-readable)
    #[default]
    Table,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage pool accounts
    #[command(subcommand)]
    Account(account::AccountCommands),

    /// Inspect and operate orders
    #[command(subcommand)]
    Order(order::OrderCommands),

    /// Show live pool statistics
    Stats {
        /// Resource kind (energy, bandwidth)
        #[arg(short, long, default_value = "energy")]
        kind: String,
    },

    /// Release expired reservations now
    Sweep,

    /// Run the order workers until interrupted
    Run,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_help() {
        let result = Cli::try_parse_from(["energy-pool", "--help"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_output_format_default() {
        assert_eq!(OutputFormat::default(), OutputFormat::Table);
    }

    #[test]
    fn test_parse_batch_status() {
        let cli = Cli::try_parse_from([
            "energy-pool",
            "--format",
            "json",
            "account",
            "batch-status",
            "--ids",
            "1,2,3",
            "--status",
            "maintenance",
        ])
        .unwrap();

        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Commands::Account(account::AccountCommands::BatchStatus { ids, status }) => {
                assert_eq!(ids, vec![1, 2, 3]);
                assert_eq!(status, "maintenance");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_order_cancel() {
        let cli = Cli::try_parse_from([
            "energy-pool",
            "order",
            "cancel",
            "--id",
            "5f0c3c1e-8a43-4f1e-9d55-0b6f0b5d9c11",
        ])
        .unwrap();
        match cli.command {
            Commands::Order(order::OrderCommands::Cancel { reason, .. }) => {
                assert_eq!(reason, "operator request");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
