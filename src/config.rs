//! Crank configuration.
//!
//! One typed struct produced once at startup; downstream code receives the
//! struct and never reads the environment directly. Out-of-range values fall
//! back to the documented default with a warning.

use std::env;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use solana_sdk::pubkey::Pubkey;
use tracing::warn;

/// Placeholder admin key shipped in .env.example; rejected in production.
pub const DEV_ADMIN_API_KEY: &str = "dev-admin-key-change-me";

/// System program id, used as a harmless placeholder program id in
/// non-production environments.
const PLACEHOLDER_PROGRAM_ID: &str = "11111111111111111111111111111111";

#[derive(Debug, Clone)]
pub struct CrankConfig {
    /// Gates `CrankService::start` at boot; the admin API can still start it.
    pub enabled: bool,
    pub polling_interval_ms: u64,
    pub max_concurrent_matches: usize,
    /// When false, matches are synthesized without the MPC cluster (dev only).
    pub use_real_mpc: bool,
    pub mpc_timeout_ms: u64,
    pub mpc_callback_timeout_ms: u64,
    pub error_threshold: u32,
    pub pause_duration_ms: u64,

    pub blockhash_refresh_interval_ms: u64,
    pub blockhash_max_age_ms: u64,
    pub blockhash_prefetch_count: usize,
    pub blockhash_fetch_timeout_ms: u64,

    pub rpc_primary: String,
    pub rpc_fallbacks: Vec<String>,
    pub rpc_ws: String,

    pub wallet_path: Option<String>,
    pub wallet_secret_key: Option<String>,

    pub dex_program_id: Pubkey,
    pub mxe_program_id: Pubkey,
    pub mxe_cluster_offset: u64,

    pub admin_api_key: Option<String>,
    pub admin_bind_addr: String,
    pub database_path: String,
    pub log_level: String,
    pub shutdown_timeout_ms: u64,

    pub production: bool,
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON" | "yes"))
        .unwrap_or(default)
}

fn env_u64_ranged(name: &str, min: u64, max: u64, default: u64) -> u64 {
    match env::var(name).ok().and_then(|v| v.parse::<u64>().ok()) {
        Some(v) if (min..=max).contains(&v) => v,
        Some(v) => {
            warn!(option = name, value = v, min, max, "value out of range, using default");
            default
        }
        None => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_pubkey(name: &str, production: bool) -> Result<Pubkey> {
    match env::var(name) {
        Ok(v) => Pubkey::from_str(v.trim()).with_context(|| format!("invalid {name}")),
        Err(_) if production => bail!("{name} is required in production"),
        Err(_) => {
            warn!(option = name, "not set, using placeholder program id");
            Ok(Pubkey::from_str(PLACEHOLDER_PROGRAM_ID).expect("static pubkey"))
        }
    }
}

/// Derive a websocket endpoint from an HTTP RPC URL the way chain tooling
/// does: scheme swap plus port + 1 when a port is present.
fn derive_ws_url(http_url: &str) -> String {
    let swapped = if let Some(rest) = http_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return http_url.to_string();
    };

    // host:port -> host:port+1 (e.g. 8899 -> 8900 on local validators)
    if let Some((head, port)) = swapped.rsplit_once(':') {
        if let Ok(p) = port.parse::<u16>() {
            return format!("{head}:{}", p + 1);
        }
    }
    swapped
}

impl CrankConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let production = env::var("NODE_ENV")
            .map(|v| v == "production")
            .unwrap_or(false);

        let rpc_primary = env::var("CRANK_RPC_PRIMARY")
            .or_else(|_| env::var("RPC_URL"))
            .unwrap_or_else(|_| "http://127.0.0.1:8899".to_string());

        let rpc_fallbacks: Vec<String> = env::var("CRANK_RPC_FALLBACK")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let rpc_ws = env::var("CRANK_RPC_WS").unwrap_or_else(|_| derive_ws_url(&rpc_primary));

        let config = Self {
            enabled: env_bool("CRANK_ENABLED", false),
            polling_interval_ms: env_u64_ranged("CRANK_POLLING_INTERVAL_MS", 1_000, 60_000, 5_000),
            max_concurrent_matches: env_u64_ranged("CRANK_MAX_CONCURRENT_MATCHES", 1, 20, 5)
                as usize,
            use_real_mpc: env_bool("CRANK_USE_REAL_MPC", true),
            mpc_timeout_ms: env_u64_ranged("MPC_TIMEOUT_MS", 30_000, 300_000, 120_000),
            mpc_callback_timeout_ms: env_u64_ranged(
                "MPC_CALLBACK_TIMEOUT_MS",
                10_000,
                60_000,
                30_000,
            ),
            error_threshold: env_u64("CRANK_ERROR_THRESHOLD", 10) as u32,
            pause_duration_ms: env_u64("CRANK_PAUSE_DURATION_MS", 60_000),

            blockhash_refresh_interval_ms: env_u64("BLOCKHASH_REFRESH_INTERVAL_MS", 30_000),
            blockhash_max_age_ms: env_u64("BLOCKHASH_MAX_AGE_MS", 60_000),
            blockhash_prefetch_count: env_u64("BLOCKHASH_PREFETCH_COUNT", 2) as usize,
            blockhash_fetch_timeout_ms: env_u64("BLOCKHASH_FETCH_TIMEOUT_MS", 5_000),

            rpc_primary,
            rpc_fallbacks,
            rpc_ws,

            wallet_path: env::var("CRANK_WALLET_PATH").ok(),
            wallet_secret_key: env::var("CRANK_WALLET_SECRET_KEY").ok(),

            dex_program_id: env_pubkey("DEX_PROGRAM_ID", production)?,
            mxe_program_id: env_pubkey("MXE_PROGRAM_ID", production)?,
            mxe_cluster_offset: env_u64("MXE_CLUSTER_OFFSET", 0),

            admin_api_key: env::var("ADMIN_API_KEY").ok(),
            admin_bind_addr: env::var("ADMIN_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8787".to_string()),
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "./crank.db".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            shutdown_timeout_ms: env_u64("SHUTDOWN_TIMEOUT_MS", 30_000),

            production,
        };

        config.validate()?;
        Ok(config)
    }

    /// Production deployments must not run with dev placeholders.
    pub fn validate(&self) -> Result<()> {
        if !self.production {
            return Ok(());
        }

        match self.admin_api_key.as_deref() {
            None => bail!("ADMIN_API_KEY is required in production"),
            Some(DEV_ADMIN_API_KEY) => {
                bail!("ADMIN_API_KEY is the development placeholder; set a real key")
            }
            Some(key) if key.len() < 16 => {
                bail!("ADMIN_API_KEY must be at least 16 characters in production")
            }
            Some(_) => {}
        }

        if self.rpc_primary.contains("127.0.0.1") || self.rpc_primary.contains("localhost") {
            bail!("CRANK_RPC_PRIMARY or RPC_URL must point at a real node in production");
        }

        let placeholder = Pubkey::from_str(PLACEHOLDER_PROGRAM_ID).expect("static pubkey");
        if self.dex_program_id == placeholder || self.mxe_program_id == placeholder {
            bail!("DEX_PROGRAM_ID and MXE_PROGRAM_ID are required in production");
        }

        Ok(())
    }

    /// Redacted one-line summary for the status endpoint.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "enabled": self.enabled,
            "polling_interval_ms": self.polling_interval_ms,
            "max_concurrent_matches": self.max_concurrent_matches,
            "use_real_mpc": self.use_real_mpc,
            "mpc_timeout_ms": self.mpc_timeout_ms,
            "error_threshold": self.error_threshold,
            "pause_duration_ms": self.pause_duration_ms,
            "rpc_primary": self.rpc_primary,
            "rpc_fallbacks": self.rpc_fallbacks.len(),
            "dex_program_id": self.dex_program_id.to_string(),
            "mxe_program_id": self.mxe_program_id.to_string(),
            "mxe_cluster_offset": self.mxe_cluster_offset,
            "production": self.production,
        })
    }
}
