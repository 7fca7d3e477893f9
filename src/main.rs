//! TRC20 Gateway - operator binary
//!
//! Run modes:
//!   trc20-gateway run                  - Start the scheduler (and HTTP surface when API_PORT is set)
//!   trc20-gateway once                 - Run one reconciliation cycle and print the report
//!   trc20-gateway approve <deposit_id> - Credit a confirmed deposit (manual credit policy)
//!   trc20-gateway balance <user>       - Show a user's balance

use clap::{Parser, Subcommand};
use std::sync::Arc;

use trc20_gateway::api;
use trc20_gateway::common::{init_from_config, GatewayConfig, GatewayError};
use trc20_gateway::storage::{DepositLedger, SqliteLedger};
use trc20_gateway::types::format_units;
use trc20_gateway::Scheduler;

#[derive(Parser)]
#[clap(rename_all = "kebab-case", author, version, about = "TRC20 deposit and withdrawal gateway")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the scheduler loop
    Run,
    /// Run a single reconciliation cycle
    Once,
    /// Credit a confirmed deposit held back by the manual credit policy
    Approve { deposit_id: String },
    /// Show the balance of a user identity
    Balance { user_identity: String },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args.command).await {
        tracing::error!(error = %e, code = e.error_code(), "gateway exited with error");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<(), GatewayError> {
    let config = GatewayConfig::from_env()?;
    init_from_config(&config)?;
    config.log_summary();

    let ledger = Arc::new(SqliteLedger::new(&config.database_path)?);

    match command {
        Command::Run => run_service(&config, ledger).await,
        Command::Once => {
            let scheduler = Scheduler::from_config(&config, ledger)?;
            let report = scheduler.trigger_reconciliation_cycle().await;
            let rendered = serde_json::to_string_pretty(&report)
                .map_err(|e| GatewayError::invalid(e.to_string()))?;
            println!("{}", rendered);
            Ok(())
        }
        Command::Approve { deposit_id } => {
            let scheduler = Scheduler::from_config(&config, ledger)?;
            let outcome = scheduler.reconciler().credit().approve(&deposit_id).await?;
            println!("{}: {:?}", deposit_id, outcome);
            Ok(())
        }
        Command::Balance { user_identity } => {
            let units = ledger.balance_units(&user_identity).await?;
            println!(
                "{}: {}",
                user_identity,
                format_units(units, config.token_decimals)
            );
            Ok(())
        }
    }
}

async fn run_service(config: &GatewayConfig, ledger: Arc<SqliteLedger>) -> Result<(), GatewayError> {
    let scheduler = Arc::new(Scheduler::from_config(config, ledger)?);
    let shutdown = scheduler.shutdown_token();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested, finishing in-flight item");
                shutdown.cancel();
            }
        }
    });

    let server = config.api_port.map(|port| {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            if let Err(e) = api::start_server(scheduler, port).await {
                tracing::error!(error = %e, port, "HTTP surface stopped");
            }
        })
    });

    scheduler.run().await;

    if let Some(handle) = server {
        shutdown.cancel();
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "HTTP surface task failed");
        }
    }
    Ok(())
}
