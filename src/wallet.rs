//! Crank wallet loading.
//!
//! The keypair is loaded once at startup and never re-read; its signer is
//! the single critical section for transaction signing. Secret material is
//! accepted as a JSON byte array (standard CLI keypair file), a base58
//! string, or a file containing either.

use std::fs;

use anyhow::{anyhow, bail, Context, Result};
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use tracing::info;

use crate::config::CrankConfig;

const SECRET_KEY_LEN: usize = 64;

pub fn load_wallet(config: &CrankConfig) -> Result<Keypair> {
    let keypair = if let Some(secret) = config.wallet_secret_key.as_deref() {
        parse_secret(secret.trim()).context("CRANK_WALLET_SECRET_KEY")?
    } else if let Some(path) = config.wallet_path.as_deref() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading wallet file {path}"))?;
        parse_secret(raw.trim()).with_context(|| format!("CRANK_WALLET_PATH {path}"))?
    } else {
        bail!("no wallet configured: set CRANK_WALLET_PATH or CRANK_WALLET_SECRET_KEY");
    };

    info!(pubkey = %keypair.pubkey(), "🔑 crank wallet loaded");
    Ok(keypair)
}

fn parse_secret(raw: &str) -> Result<Keypair> {
    let bytes: Vec<u8> = if raw.starts_with('[') {
        serde_json::from_str(raw).context("wallet secret is not a JSON byte array")?
    } else {
        bs58::decode(raw)
            .into_vec()
            .context("wallet secret is not valid base58")?
    };

    if bytes.len() != SECRET_KEY_LEN {
        bail!(
            "wallet secret must be {SECRET_KEY_LEN} bytes, got {}",
            bytes.len()
        );
    }

    Keypair::from_bytes(&bytes).map_err(|e| anyhow!("invalid keypair bytes: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_array_and_base58_forms() {
        let keypair = Keypair::new();
        let bytes = keypair.to_bytes();

        let json = serde_json::to_string(&bytes.to_vec()).unwrap();
        let from_json = parse_secret(&json).unwrap();
        assert_eq!(from_json.pubkey(), keypair.pubkey());

        let b58 = bs58::encode(&bytes).into_string();
        let from_b58 = parse_secret(&b58).unwrap();
        assert_eq!(from_b58.pubkey(), keypair.pubkey());
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(parse_secret("[1,2,3]").is_err());
        assert!(parse_secret("zzz-not-base58-!!").is_err());
    }
}
