//! Order Commands
//!
//! Commands for inspecting and operating orders.

use clap::Subcommand;

/// Order subcommands
#[derive(Subcommand, Debug)]
pub enum OrderCommands {
    /// Show an order by ID or payment reference
    Show {
        /// Order ID
        #[arg(short, long, conflicts_with = "payment_ref", required_unless_present = "payment_ref")]
        id: Option<String>,

        /// Payment transaction hash
        #[arg(long)]
        payment_ref: Option<String>,
    },

    /// List orders in one status
    List {
        /// Status (received, validated, calculated, allocated, delegated, completed, failed, cancelled)
        #[arg(short, long, default_value = "completed")]
        status: String,
    },

    /// Process a confirmed payment synchronously
    Create {
        /// Payer address
        #[arg(long)]
        from: String,

        /// Paid amount in SUN
        #[arg(long)]
        amount_sun: u64,

        /// Payment transaction hash
        #[arg(long)]
        payment_ref: String,

        /// Resource receiver, defaults to the payer
        #[arg(long)]
        receiver: Option<String>,
    },

    /// Cancel a non-terminal order
    Cancel {
        /// Order ID
        #[arg(short, long)]
        id: String,

        /// Reason recorded in the audit trail
        #[arg(short, long, default_value = "operator request")]
        reason: String,
    },
}
