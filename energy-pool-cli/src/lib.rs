//! Energy Pool CLI - Command Line Interface
//!
//! Operator tooling for the energy pool: account management, live
//! capacity, order inspection and the background order workers.
//!
//! # Usage
//!
//! ```text
//! energy-pool-cli [OPTIONS] <COMMAND>
//!
//! Commands:
//!   account   Manage pool accounts
//!   order     Inspect and operate orders
//!   stats     Show live pool statistics
//!   sweep     Release expired reservations now
//!   run       Run the order workers until interrupted
//!
//! Options:
//!   -d, --data-dir <DIR>   Data directory [env: ENERGY_POOL_DATA_DIR]
//!   -f, --format <FORMAT>  Output format (json, table) [default: table]
//!   -v, --verbose          Enable debug logging
//! ```
//!
//! # Examples
//!
//! ## Register an account
//! ```text
//! ENERGY_POOL_ACCOUNT_KEY=... energy-pool-cli account add \
//!   --address TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7 --priority 1
//! ```
//!
//! ## Put accounts into maintenance
//! ```text
//! energy-pool-cli account batch-status --ids 3,4 --status maintenance
//! ```
//!
//! ## Show an order by payment hash
//! ```text
//! energy-pool-cli --format json order show --payment-ref 9f2c...
//! ```

pub mod commands;
pub mod error;
pub mod handler;
pub mod output;

pub use commands::{Cli, Commands, OutputFormat};
pub use error::{CliError, CliResult};

/// CLI version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
