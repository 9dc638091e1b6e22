//! Crank daemon entrypoint.
//!
//! Wiring order: env -> tracing -> config -> database + migrations ->
//! wallet -> chain clients -> repositories -> MPC listener -> crank
//! service -> admin surface. Teardown runs in reverse on shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use solana_sdk::signer::Signer;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crank_backend::api::{self, ApiState};
use crank_backend::chain::blockhash::{BlockhashCache, BlockhashConfig};
use crank_backend::chain::rpc::{RpcClient, DEFAULT_REQUEST_TIMEOUT_MS};
use crank_backend::chain::subscriber::{OrderCache, OrderCacheConfig};
use crank_backend::config::CrankConfig;
use crank_backend::crank::executor::{ExecutorConfig, SettlementExecutor};
use crank_backend::crank::order_locks::OrderLockManager;
use crank_backend::crank::CrankService;
use crank_backend::db::dist_lock::DistributedLockService;
use crank_backend::db::pending_ops::PendingOpRepo;
use crank_backend::db::processed::MpcProcessedRepo;
use crank_backend::db::settlements::SettlementRepo;
use crank_backend::db::tx_records::TxRecordRepo;
use crank_backend::db::Database;
use crank_backend::metrics::CrankMetrics;
use crank_backend::mpc::events::{
    CallbackProcessor, MpcCorrelator, MpcEventListener, EVENT_QUEUE_DEPTH,
};
use crank_backend::mpc::{MpcClient, MpcClientConfig};
use crank_backend::util::timeout::CancelToken;
use crank_backend::wallet::load_wallet;

const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;

#[derive(Debug, Parser)]
#[command(name = "crank", about = "Encrypted-order matching crank")]
struct Args {
    /// Start the poll loop immediately, overriding CRANK_ENABLED.
    #[arg(long)]
    force_start: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let config = CrankConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    info!("⚙️ crank backend starting");

    // Persistence first: a failed migration aborts startup.
    let db = Database::open(&config.database_path)?;
    db.migrate().await.context("database migration")?;

    let wallet = Arc::new(load_wallet(&config)?);
    let wallet_pubkey = wallet.pubkey();

    let metrics = Arc::new(CrankMetrics::new());
    let rpc = Arc::new(RpcClient::new(
        config.rpc_primary.clone(),
        config.rpc_fallbacks.clone(),
        DEFAULT_REQUEST_TIMEOUT_MS,
        Arc::clone(&metrics),
    )?);

    let blockhash = Arc::new(BlockhashCache::new(
        Arc::clone(&rpc),
        BlockhashConfig {
            refresh_interval_ms: config.blockhash_refresh_interval_ms,
            max_age_ms: config.blockhash_max_age_ms,
            prefetch_count: config.blockhash_prefetch_count,
            fetch_timeout_ms: config.blockhash_fetch_timeout_ms,
        },
        Arc::clone(&metrics),
    ));

    let order_cache = Arc::new(OrderCache::new(
        OrderCacheConfig {
            ws_url: config.rpc_ws.clone(),
            program: config.dex_program_id,
            max_ttl_ms: 60_000,
            max_reconnect_attempts: 10,
        },
        Arc::clone(&metrics),
    ));

    let instance_id = format!("crank-{}", uuid::Uuid::new_v4());
    info!(instance = %instance_id, "instance id assigned");

    let dist_locks = DistributedLockService::new(
        db.clone(),
        instance_id.clone(),
        DEFAULT_HEARTBEAT_INTERVAL_MS,
    );
    let pending_ops = PendingOpRepo::new(db.clone());
    let processed = MpcProcessedRepo::new(db.clone());
    let tx_records = TxRecordRepo::new(db.clone());
    let settlements = SettlementRepo::new(db.clone());

    // MPC callback plumbing: listener -> bounded queue -> processor.
    let correlator = Arc::new(MpcCorrelator::new());
    let listener_cancel = CancelToken::new();
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let listener = MpcEventListener::new(
        config.rpc_ws.clone(),
        config.dex_program_id,
        event_tx,
        listener_cancel.clone(),
        Arc::clone(&metrics),
    );
    let listener_handle = listener.spawn();
    let processor = CallbackProcessor::new(
        processed,
        pending_ops.clone(),
        Arc::clone(&correlator),
        listener_cancel.clone(),
        config.mpc_callback_timeout_ms,
    );
    let processor_handle = processor.spawn(event_rx);

    let mpc = Arc::new(MpcClient::new(
        Arc::clone(&rpc),
        Arc::clone(&blockhash),
        Arc::clone(&wallet),
        MpcClientConfig {
            mxe_program: config.mxe_program_id,
            dex_program: config.dex_program_id,
            cluster_offset: config.mxe_cluster_offset,
            mpc_timeout_ms: config.mpc_timeout_ms,
        },
        Arc::clone(&correlator),
        tx_records.clone(),
    ));

    let order_locks = Arc::new(OrderLockManager::new());
    let executor = Arc::new(SettlementExecutor::new(
        Arc::clone(&rpc),
        Arc::clone(&blockhash),
        Arc::clone(&mpc),
        Arc::clone(&order_locks),
        pending_ops.clone(),
        tx_records.clone(),
        settlements.clone(),
        Arc::clone(&wallet),
        Arc::clone(&metrics),
        instance_id.clone(),
        ExecutorConfig {
            dex_program: config.dex_program_id,
            use_real_mpc: config.use_real_mpc,
            settlement_timeout_ms: 60_000,
        },
        listener_cancel.clone(),
    ));

    let crank = CrankService::new(
        config.clone(),
        db.clone(),
        Arc::clone(&rpc),
        order_cache,
        blockhash,
        order_locks,
        dist_locks.clone(),
        pending_ops,
        settlements,
        executor,
        Arc::clone(&metrics),
        wallet_pubkey,
    );

    if config.enabled || args.force_start {
        crank.start().await.context("crank start")?;
    } else {
        info!("CRANK_ENABLED=false; waiting for admin start");
    }

    let api_state = ApiState {
        crank: crank.clone(),
        metrics,
        rpc,
        db,
        admin_api_key: config.admin_api_key.clone(),
    };
    let listener = TcpListener::bind(&config.admin_bind_addr)
        .await
        .with_context(|| format!("bind admin surface {}", config.admin_bind_addr))?;
    info!(addr = %config.admin_bind_addr, "🌐 admin surface listening");

    let router = api::router(api_state);
    tokio::select! {
        result = async { axum::serve(listener, router).await } => {
            result.context("admin server")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    // Teardown in reverse order: listeners, pipeline, locks.
    listener_cancel.cancel();
    crank.stop().await;
    listener_handle.abort();
    processor_handle.abort();
    if let Err(e) = dist_locks.shutdown().await {
        warn!(err = %e, "lock service shutdown failed");
    }
    info!("👋 crank backend stopped");
    Ok(())
}
