use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mm_broker::cli::{load_policy, validate, Cli, Command, ConfigCommand};
use mm_broker::{schedulers, Broker};
use mm_domain::policy::PolicyStore;
use mm_ledger::{JsonlUsageLog, LedgerManager};
use mm_sessions::{SessionRegistry, SessionStore};
use mm_transport::TransportManager;

/// Init failure exit codes.
const EXIT_POLICY_INVALID: u8 = 2;
const EXIT_TRANSPORT_INIT_FAILED: u8 = 3;
const EXIT_STORE_UNAVAILABLE: u8 = 4;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            serve(&cli).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => match load_policy(&cli.policy) {
            Ok(doc) => {
                if validate(&doc, &cli.policy) {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::from(EXIT_POLICY_INVALID)
                }
            }
            Err(e) => {
                eprintln!("{e}");
                ExitCode::from(EXIT_POLICY_INVALID)
            }
        },
        Some(Command::Version) => {
            println!("metamcp {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,mm_broker=debug")),
        )
        .json()
        .init();
}

async fn serve(cli: &Cli) -> ExitCode {
    tracing::info!("MetaMCP broker starting");

    // ── Policy ───────────────────────────────────────────────────────
    let doc = match load_policy(&cli.policy) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::error!(error = %e, "failed to load policy");
            return ExitCode::from(EXIT_POLICY_INVALID);
        }
    };
    let policy = match PolicyStore::new(doc) {
        Ok(store) => Arc::new(store),
        Err(issues) => {
            for issue in &issues {
                tracing::error!("policy: {issue}");
            }
            return ExitCode::from(EXIT_POLICY_INVALID);
        }
    };
    let snapshot = policy.current();
    let state_path = snapshot.broker.state_path.clone();
    tracing::info!(
        name = %snapshot.broker.name,
        roles = snapshot.profiles.len(),
        servers = snapshot.servers.len(),
        "policy loaded"
    );

    // ── Stores ───────────────────────────────────────────────────────
    let usage_log = match JsonlUsageLog::open(state_path.join("usage.jsonl")) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            tracing::error!(error = %e, "usage log unavailable");
            return ExitCode::from(EXIT_STORE_UNAVAILABLE);
        }
    };
    let ledger = match LedgerManager::new(usage_log, &state_path) {
        Ok(ledger) => Arc::new(ledger),
        Err(e) => {
            tracing::error!(error = %e, "ledger store unavailable");
            return ExitCode::from(EXIT_STORE_UNAVAILABLE);
        }
    };
    let session_store = match SessionStore::new(&state_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "session store unavailable");
            return ExitCode::from(EXIT_STORE_UNAVAILABLE);
        }
    };

    // Best-effort recovery of sessions alive within the idle window.
    let idle_window = chrono::Duration::hours(snapshot.broker.session_idle_hours as i64);
    let recovered = match session_store.scan(idle_window) {
        Ok(recovered) => recovered,
        Err(e) => {
            tracing::error!(error = %e, "session store scan failed");
            return ExitCode::from(EXIT_STORE_UNAVAILABLE);
        }
    };

    let sessions = Arc::new(SessionRegistry::new(session_store));
    let transports = Arc::new(TransportManager::new(snapshot.broker.max_in_flight));

    // ── Broker ───────────────────────────────────────────────────────
    let broker = Arc::new(Broker::new(policy, sessions, ledger, transports));
    let recovered_count = broker.recover(recovered);
    if recovered_count > 0 {
        tracing::info!(recovered = recovered_count, "sessions recovered from previous run");
    }

    broker.start().await;
    if broker.status() == mm_broker::observability::BrokerStatus::Failed {
        tracing::error!("no tool server came up; refusing to serve");
        broker.shutdown().await;
        return ExitCode::from(EXIT_TRANSPORT_INIT_FAILED);
    }

    // ── Schedulers ───────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let handles = schedulers::spawn_all(broker.clone(), cancel.clone());
    tracing::info!(schedulers = handles.len(), "background schedulers running");

    // ── Run until interrupted ────────────────────────────────────────
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown signal received");

    cancel.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    broker.shutdown().await;

    ExitCode::SUCCESS
}
