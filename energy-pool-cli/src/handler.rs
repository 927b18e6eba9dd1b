//! Command Handlers
//!
//! Handler functions for CLI commands.

use std::str::FromStr;
use std::sync::Arc;

use energy_pool::{
    AccountClass, AccountId, AccountStatus, EnergyPoolService, NewAccount, OrderId, OrderStatus,
    PaymentEvent, PoolConfig, PoolError, ResourceKind, SledStorage, StorageConfig, TronHttpClient,
};
use rust_decimal::Decimal;
use tracing::info;

use crate::commands::{
    account::AccountCommands, order::OrderCommands, Cli, Commands, OutputFormat,
};
use crate::error::{CliError, CliResult};
use crate::output;

type Service = EnergyPoolService<SledStorage>;

/// Run the CLI with parsed arguments
pub async fn run(cli: Cli) -> CliResult<()> {
    let service = build_service(&cli).await?;
    let format = cli.format;

    let result = match cli.command {
        Commands::Account(cmd) => handle_account(&service, cmd, format).await,
        Commands::Order(cmd) => handle_order(&service, cmd, format).await,
        Commands::Stats { kind } => handle_stats(&service, &kind, format).await,
        Commands::Sweep => handle_sweep(&service, format).await,
        Commands::Run => handle_run(&service).await,
    };

    service.storage().flush()?;
    result
}

/// Build the service from environment configuration and CLI overrides
async fn build_service(cli: &Cli) -> CliResult<Service> {
    let config = PoolConfig::from_env();
    let storage_config = StorageConfig {
        data_dir: cli.data_dir.clone(),
        ..StorageConfig::from_env()
    };

    let storage = Arc::new(SledStorage::new(&storage_config)?);
    let chain = Arc::new(TronHttpClient::new(config.chain.clone())?);

    info!(
        network = %config.chain.network.id(),
        data_dir = %storage_config.data_dir,
        "Opening energy pool"
    );

    EnergyPoolService::builder()
        .config(config)
        .storage(storage)
        .chain(chain)
        .build()
        .await
        .map_err(|e| match e {
            PoolError::Configuration(message) => CliError::config(message),
            other => other.into(),
        })
}

// ==================== Accounts ====================

async fn handle_account(service: &Service, cmd: AccountCommands, format: OutputFormat) -> CliResult<()> {
    match cmd {
        AccountCommands::Add {
            address,
            private_key,
            name,
            priority,
            class,
            cost,
            daily_cap,
            monthly_cap,
        } => {
            let mut new_account = NewAccount::new(address, private_key)
                .with_priority(priority)
                .with_class(parse_class(&class)?)
                .with_caps(daily_cap, monthly_cap);
            if let Some(name) = name {
                new_account = new_account.with_name(name);
            }
            if let Some(cost) = cost {
                new_account = new_account.with_cost(parse_cost(&cost)?);
            }

            let account = service.add_account(new_account).await?;
            output::print_account(&account, format);
        }
        AccountCommands::List => {
            let accounts = service.list_accounts().await?;
            output::print_accounts(&accounts, format);
        }
        AccountCommands::Status { id, set } => {
            let id = AccountId(id);
            let account = match set {
                Some(status) => {
                    service
                        .set_account_status(id, parse_account_status(&status)?)
                        .await?
                }
                None => service.get_account(id).await?,
            };
            let snapshots = service.account_snapshots(id).await?;
            output::print_account_status(&account, &snapshots, format);
        }
        AccountCommands::BatchStatus { ids, status } => {
            let ids: Vec<AccountId> = ids.into_iter().map(AccountId).collect();
            let updated = service
                .batch_update_status(&ids, parse_account_status(&status)?)
                .await?;
            output::print_accounts(&updated, format);
        }
        AccountCommands::Remove { id } => {
            service.remove_account(AccountId(id)).await?;
            output::print_success(&format!("Account {} removed", id));
        }
    }
    Ok(())
}

// ==================== Orders ====================

async fn handle_order(service: &Service, cmd: OrderCommands, format: OutputFormat) -> CliResult<()> {
    match cmd {
        OrderCommands::Show { id, payment_ref } => {
            let order = match (id, payment_ref) {
                (Some(id), _) => service.get_order(&parse_order_id(&id)?).await?,
                (None, Some(payment_ref)) => service
                    .get_order_by_ref(&payment_ref)
                    .await?
                    .ok_or_else(|| CliError::not_found(payment_ref.clone()))?,
                (None, None) => {
                    return Err(CliError::invalid_arg("either --id or --payment-ref is required"))
                }
            };
            output::print_order(&order, format);
        }
        OrderCommands::List { status } => {
            let status = OrderStatus::parse(&status)
                .ok_or_else(|| CliError::invalid_arg(format!("unknown order status '{}'", status)))?;
            let orders = service.list_orders(status).await?;
            output::print_orders(&orders, format);
        }
        OrderCommands::Create {
            from,
            amount_sun,
            payment_ref,
            receiver,
        } => {
            let network = service.config().chain.network.id();
            let mut payment = PaymentEvent::new(from, amount_sun, payment_ref, network);
            if let Some(receiver) = receiver {
                payment = payment.with_receiver(receiver);
            }
            let order = service.create_order_from_payment(payment).await?;
            output::print_order(&order, format);
        }
        OrderCommands::Cancel { id, reason } => {
            let order = service.cancel_order(&parse_order_id(&id)?, &reason).await?;
            output::print_order(&order, format);
        }
    }
    Ok(())
}

// ==================== Pool ====================

async fn handle_stats(service: &Service, kind: &str, format: OutputFormat) -> CliResult<()> {
    let stats = service.get_pool_statistics(parse_kind(kind)?).await?;
    output::print_stats(&stats, &service.metrics(), format);
    Ok(())
}

async fn handle_sweep(service: &Service, format: OutputFormat) -> CliResult<()> {
    let report = service.sweep_expired().await?;
    output::print_sweep(&report, format);
    Ok(())
}

async fn handle_run(service: &Service) -> CliResult<()> {
    service.start().await?;
    info!("Energy pool running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    service.stop().await?;

    let metrics = service.metrics();
    info!(
        completed = metrics.orders_completed,
        failed = metrics.orders_failed,
        expired = metrics.reservations_expired,
        "Energy pool stopped"
    );
    Ok(())
}

// ==================== Argument parsing ====================

fn parse_kind(s: &str) -> CliResult<ResourceKind> {
    ResourceKind::parse(s)
        .ok_or_else(|| CliError::invalid_arg(format!("unknown resource kind '{}'", s)))
}

fn parse_account_status(s: &str) -> CliResult<AccountStatus> {
    AccountStatus::parse(s)
        .ok_or_else(|| CliError::invalid_arg(format!("unknown account status '{}'", s)))
}

fn parse_class(s: &str) -> CliResult<AccountClass> {
    AccountClass::parse(s)
        .ok_or_else(|| CliError::invalid_arg(format!("unknown account class '{}'", s)))
}

fn parse_cost(s: &str) -> CliResult<Decimal> {
    let cost = Decimal::from_str(s)
        .map_err(|e| CliError::invalid_arg(format!("cost '{}': {}", s, e)))?;
    if cost.is_sign_negative() {
        return Err(CliError::invalid_arg("cost must not be negative"));
    }
    Ok(cost)
}

fn parse_order_id(s: &str) -> CliResult<OrderId> {
    s.parse::<OrderId>()
        .map_err(|e| CliError::invalid_arg(format!("order id '{}': {}", s, e)))
}
