//! Account Commands
//!
//! Commands for managing the pool's staked accounts.

use clap::Subcommand;

/// Account subcommands
#[derive(Subcommand, Debug)]
pub enum AccountCommands {
    /// Register a staked account
    Add {
        /// TRON address (Base58)
        #[arg(short, long)]
        address: String,

        /// Signing key, hex (env: ENERGY_POOL_ACCOUNT_KEY)
        #[arg(long, env = "ENERGY_POOL_ACCOUNT_KEY", hide_env_values = true)]
        private_key: String,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,

        /// Priority, lower is used first
        #[arg(short, long, default_value = "100")]
        priority: u32,

        /// Account class (own, agent, third_party)
        #[arg(long, default_value = "own")]
        class: String,

        /// Cost per unit in TRX
        #[arg(long)]
        cost: Option<String>,

        /// Daily delegation cap in resource units
        #[arg(long)]
        daily_cap: Option<u64>,

        /// Monthly delegation cap in resource units
        #[arg(long)]
        monthly_cap: Option<u64>,
    },

    /// List all accounts
    List,

    /// Show live resources of an account, optionally changing its status
    Status {
        /// Account ID
        #[arg(short, long)]
        id: u64,

        /// New status (active, inactive, maintenance)
        #[arg(short, long)]
        set: Option<String>,
    },

    /// Change the status of several accounts at once
    BatchStatus {
        /// Comma separated account IDs
        #[arg(long, value_delimiter = ',', required = true)]
        ids: Vec<u64>,

        /// New status (active, inactive, maintenance)
        #[arg(short, long)]
        status: String,
    },

    /// Remove an account without open reservations
    Remove {
        /// Account ID
        #[arg(short, long)]
        id: u64,
    },
}
