//! Output Formatting
//!
//! Utilities for formatting CLI output in JSON or table form.

use crate::commands::OutputFormat;
use energy_pool::{
    AccountId, MetricsSnapshot, Order, PoolAccount, PoolStatistics, ResourceSnapshot, SweepReport,
};
use rust_decimal::Decimal;
use serde::Serialize;

/// Account as shown to operators (the encrypted key never leaves storage)
#[derive(Debug, Serialize)]
pub struct AccountView {
    pub id: AccountId,
    pub address: String,
    pub name: String,
    pub status: String,
    pub priority: u32,
    pub class: String,
    pub cost_per_unit: Decimal,
    pub daily_cap: Option<u64>,
    pub monthly_cap: Option<u64>,
    pub description: Option<String>,
}

impl From<&PoolAccount> for AccountView {
    fn from(account: &PoolAccount) -> Self {
        Self {
            id: account.id,
            address: account.address.clone(),
            name: account.name.clone(),
            status: account.status.to_string(),
            priority: account.priority,
            class: account.class.to_string(),
            cost_per_unit: account.cost_per_unit,
            daily_cap: account.daily_cap,
            monthly_cap: account.monthly_cap,
            description: account.description.clone(),
        }
    }
}

/// Format and print data based on output format
pub fn print_output<T: Serialize>(data: &T, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(data),
        // generic types have no table layout
        OutputFormat::Table => print_json(data),
    }
}

/// Print as JSON
fn print_json<T: Serialize + ?Sized>(data: &T) {
    match serde_json::to_string_pretty(data) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error formatting JSON: {}", e),
    }
}

/// Print account list
pub fn print_accounts(accounts: &[PoolAccount], format: OutputFormat) {
    let views: Vec<AccountView> = accounts.iter().map(AccountView::from).collect();
    match format {
        OutputFormat::Json => print_json(&views),
        OutputFormat::Table => {
            println!(
                "{:<6} {:<36} {:<20} {:<12} {:<8} {:<12} {}",
                "ID", "ADDRESS", "NAME", "STATUS", "PRIO", "CLASS", "CAPS (day/month)"
            );
            print_separator(110);
            for view in &views {
                println!(
                    "{:<6} {:<36} {:<20} {:<12} {:<8} {:<12} {}",
                    view.id.to_string(),
                    view.address,
                    truncate(&view.name, 20),
                    view.status,
                    view.priority,
                    view.class,
                    format_caps(view.daily_cap, view.monthly_cap)
                );
            }
            println!();
            println!("{} account(s)", views.len());
        }
    }
}

/// Print one account
pub fn print_account(account: &PoolAccount, format: OutputFormat) {
    let view = AccountView::from(account);
    match format {
        OutputFormat::Json => print_json(&view),
        OutputFormat::Table => print_account_rows(&view),
    }
}

fn print_account_rows(view: &AccountView) {
    print_row("Account ID:", &view.id.to_string());
    print_row("Address:", &view.address);
    print_row("Name:", &view.name);
    print_row("Status:", &view.status);
    print_row("Priority:", &view.priority.to_string());
    print_row("Class:", &view.class);
    print_row("Cost / unit:", &format!("{} TRX", view.cost_per_unit));
    print_row("Caps:", &format_caps(view.daily_cap, view.monthly_cap));
}

/// Print an account with its live resource snapshots
pub fn print_account_status(
    account: &PoolAccount,
    snapshots: &[ResourceSnapshot],
    format: OutputFormat,
) {
    #[derive(Serialize)]
    struct StatusView<'a> {
        account: AccountView,
        resources: &'a [ResourceSnapshot],
    }

    match format {
        OutputFormat::Json => print_json(&StatusView {
            account: AccountView::from(account),
            resources: snapshots,
        }),
        OutputFormat::Table => {
            print_account_rows(&AccountView::from(account));
            println!();
            println!(
                "{:<10} {:>14} {:>14} {:>14} {:>14} {:>14} {:>14}",
                "RESOURCE", "STAKED", "DELEGATED OUT", "DELEGATED IN", "USED", "AVAILABLE", "DELEGATABLE"
            );
            print_separator(100);
            for s in snapshots {
                println!(
                    "{:<10} {:>14} {:>14} {:>14} {:>14} {:>14} {:>14}",
                    s.kind.to_string(),
                    s.total_from_staking,
                    s.delegated_out,
                    s.delegated_in,
                    s.used,
                    s.available,
                    s.delegatable
                );
            }
        }
    }
}

/// Print pool statistics with process metrics
pub fn print_stats(stats: &PoolStatistics, metrics: &MetricsSnapshot, format: OutputFormat) {
    #[derive(Serialize)]
    struct StatsView<'a> {
        pool: &'a PoolStatistics,
        metrics: &'a MetricsSnapshot,
    }

    match format {
        OutputFormat::Json => print_json(&StatsView {
            pool: stats,
            metrics,
        }),
        OutputFormat::Table => {
            println!("Pool Statistics ({})", stats.kind);
            println!("=========================");
            print_row("Accounts:", &format!("{} ({} active)", stats.total_accounts, stats.active_accounts));
            print_row("Total capacity:", &stats.total_capacity.to_string());
            print_row("Available:", &stats.available_capacity.to_string());
            print_row("Delegated out:", &stats.delegated_out.to_string());
            print_row("Held:", &stats.held.to_string());
            print_row("Utilization:", &format!("{:.1}%", stats.utilization_rate * 100.0));
            if !stats.unreachable.is_empty() {
                let ids: Vec<String> = stats.unreachable.iter().map(|id| id.to_string()).collect();
                print_row("Unreachable:", &ids.join(", "));
            }
            println!();
            println!("Process Metrics");
            println!("===============");
            print_row("Orders completed:", &metrics.orders_completed.to_string());
            print_row("Orders failed:", &metrics.orders_failed.to_string());
            print_row("Legs delegated:", &metrics.legs_delegated.to_string());
            print_row("Legs rejected:", &metrics.legs_rejected.to_string());
            print_row("Open reservations:", &metrics.open_reservations().to_string());
        }
    }
}

/// Print a single order with its legs and audit trail
pub fn print_order(order: &Order, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(order),
        OutputFormat::Table => {
            println!("Order");
            println!("=====");
            print_row("Order ID:", &order.id.to_string());
            print_row("Status:", &order.status.to_string());
            print_row("Payment:", &order.external_ref);
            print_row("Payer:", &order.payer_address);
            print_row("Receiver:", &order.target_address);
            print_row("Paid (SUN):", &order.payment_amount_sun.to_string());
            print_row("Requested:", &format!("{} {}", order.requested_amount, order.kind));
            print_row("Price (SUN):", &order.computed_price_sun.to_string());
            if let Some(reason) = &order.failure_reason {
                print_row("Failure:", reason);
            }

            if !order.legs.is_empty() {
                println!();
                println!(
                    "{:<8} {:<36} {:>12} {:<12} {}",
                    "ACCOUNT", "ADDRESS", "AMOUNT", "STATUS", "TX"
                );
                print_separator(100);
                for leg in &order.legs {
                    println!(
                        "{:<8} {:<36} {:>12} {:<12} {}",
                        leg.account_id.to_string(),
                        leg.address,
                        leg.amount,
                        format!("{:?}", leg.status).to_lowercase(),
                        leg.tx_id.as_deref().or(leg.reason.as_deref()).unwrap_or("-")
                    );
                }
            }

            println!();
            println!("History:");
            for event in &order.processing_details {
                println!(
                    "  {} [{}] {}: {}",
                    event.at.format("%Y-%m-%d %H:%M:%S"),
                    event.status,
                    event.actor,
                    event.message
                );
            }
        }
    }
}

/// Print a list of orders
pub fn print_orders(orders: &[Order], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(orders),
        OutputFormat::Table => {
            println!(
                "{:<36} {:<12} {:>12} {:<20} {}",
                "ORDER ID", "STATUS", "AMOUNT", "UPDATED", "PAYMENT"
            );
            print_separator(110);
            for order in orders {
                println!(
                    "{:<36} {:<12} {:>12} {:<20} {}",
                    order.id.to_string(),
                    order.status.to_string(),
                    order.requested_amount,
                    order.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    order.external_ref
                );
            }
            println!();
            println!("{} order(s)", orders.len());
        }
    }
}

/// Print sweep result
pub fn print_sweep(report: &SweepReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table => {
            print_row("Scanned:", &report.scanned.to_string());
            print_row("Released:", &report.released.len().to_string());
            for id in &report.released {
                println!("  - {}", id);
            }
        }
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("{}", message);
}

/// Print a table row
pub fn print_row(key: &str, value: &str) {
    println!("{:<20} {}", key, value);
}

/// Print a separator line
pub fn print_separator(width: usize) {
    println!("{}", "-".repeat(width));
}

fn format_caps(daily: Option<u64>, monthly: Option<u64>) -> String {
    let fmt = |cap: Option<u64>| cap.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
    format!("{}/{}", fmt(daily), fmt(monthly))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_caps() {
        assert_eq!(format_caps(None, None), "-/-");
        assert_eq!(format_caps(Some(1_000), None), "1000/-");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 20), "short");
        assert_eq!(truncate("TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7", 6), "TLa2f…");
    }

    #[test]
    fn test_print_row_format() {
        print_row("Key", "Value");
    }
}
