//! Instruction encodings and transaction assembly.
//!
//! Every payload is a fixed little-endian layout prefixed by an 8-byte
//! discriminator: SHA-256 of `"global:<name>"` for instructions,
//! `"event:<Name>"` for events, `"account:<Name>"` for accounts.

use sha2::{Digest, Sha256};
use solana_sdk::hash::Hash;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use solana_sdk::transaction::Transaction;

pub const COMPARE_PRICES_IX: &str = "compare_prices";
pub const CALCULATE_FILL_IX: &str = "calculate_fill";
pub const MATCH_ORDERS_IX: &str = "match_orders";
pub const ADD_ENCRYPTED_IX: &str = "add_encrypted";
pub const SUB_ENCRYPTED_IX: &str = "sub_encrypted";

pub const COMPARE_PRICES_LEN: usize = 128;
pub const CALCULATE_FILL_LEN: usize = 256;
pub const MARGIN_OP_LEN: usize = 112;

fn discriminator(namespace: &str, name: &str) -> [u8; 8] {
    let digest = Sha256::digest(format!("{namespace}:{name}").as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

pub fn instruction_discriminator(name: &str) -> [u8; 8] {
    discriminator("global", name)
}

pub fn event_discriminator(name: &str) -> [u8; 8] {
    discriminator("event", name)
}

pub fn account_discriminator(name: &str) -> [u8; 8] {
    discriminator("account", name)
}

/// `compare_prices` — 128 bytes:
/// disc(8) + offset u64(8) + buy_cipher(32) + sell_cipher(32) +
/// ephemeral_pubkey(32) + nonce u128(16).
pub fn compare_prices_data(
    computation_offset: u64,
    buy_cipher: &[u8; 32],
    sell_cipher: &[u8; 32],
    ephemeral_pubkey: &[u8; 32],
    nonce: u128,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(COMPARE_PRICES_LEN);
    data.extend_from_slice(&instruction_discriminator(COMPARE_PRICES_IX));
    data.extend_from_slice(&computation_offset.to_le_bytes());
    data.extend_from_slice(buy_cipher);
    data.extend_from_slice(sell_cipher);
    data.extend_from_slice(ephemeral_pubkey);
    data.extend_from_slice(&nonce.to_le_bytes());
    debug_assert_eq!(data.len(), COMPARE_PRICES_LEN);
    data
}

/// `calculate_fill` — 256 bytes:
/// disc(8) + offset u64(8) + buy_amount(32) + sell_amount(32) +
/// buy_price(32) + sell_price(32) + buy_filled(32) + sell_filled(32) +
/// ephemeral_pubkey(32) + nonce u128(16).
#[allow(clippy::too_many_arguments)]
pub fn calculate_fill_data(
    computation_offset: u64,
    buy_amount: &[u8; 32],
    sell_amount: &[u8; 32],
    buy_price: &[u8; 32],
    sell_price: &[u8; 32],
    buy_filled: &[u8; 32],
    sell_filled: &[u8; 32],
    ephemeral_pubkey: &[u8; 32],
    nonce: u128,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(CALCULATE_FILL_LEN);
    data.extend_from_slice(&instruction_discriminator(CALCULATE_FILL_IX));
    data.extend_from_slice(&computation_offset.to_le_bytes());
    for cipher in [
        buy_amount,
        sell_amount,
        buy_price,
        sell_price,
        buy_filled,
        sell_filled,
    ] {
        data.extend_from_slice(cipher.as_slice());
    }
    data.extend_from_slice(ephemeral_pubkey);
    data.extend_from_slice(&nonce.to_le_bytes());
    debug_assert_eq!(data.len(), CALCULATE_FILL_LEN);
    data
}

/// Margin operations `add_encrypted` / `sub_encrypted` — 112 bytes:
/// disc(8) + request_id(32) + encrypted_collateral(64) + amount u64(8).
pub fn margin_op_data(
    instruction_name: &str,
    request_id: &[u8; 32],
    encrypted_collateral: &[u8; 64],
    amount: u64,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(MARGIN_OP_LEN);
    data.extend_from_slice(&instruction_discriminator(instruction_name));
    data.extend_from_slice(request_id);
    data.extend_from_slice(encrypted_collateral);
    data.extend_from_slice(&amount.to_le_bytes());
    debug_assert_eq!(data.len(), MARGIN_OP_LEN);
    data
}

/// `match_orders` settlement payload:
/// disc(8) + request_id(32) + encrypted_fill(64) + buy_fully_filled(1) +
/// sell_fully_filled(1).
pub fn match_orders_data(
    request_id: &[u8; 32],
    encrypted_fill: &[u8; 64],
    buy_fully_filled: bool,
    sell_fully_filled: bool,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(106);
    data.extend_from_slice(&instruction_discriminator(MATCH_ORDERS_IX));
    data.extend_from_slice(request_id);
    data.extend_from_slice(encrypted_fill);
    data.push(buy_fully_filled as u8);
    data.push(sell_fully_filled as u8);
    data
}

/// Accounts passed to an MPC computation instruction. Order matters: the
/// cluster routes callbacks to the trailing order accounts.
pub struct ComputationAccounts {
    pub payer: Pubkey,
    pub computation: Pubkey,
    pub computation_definition: Pubkey,
    pub cluster: Pubkey,
    pub mxe: Pubkey,
    pub buy_order: Pubkey,
    pub sell_order: Pubkey,
}

pub fn computation_instruction(
    mxe_program: &Pubkey,
    accounts: &ComputationAccounts,
    data: Vec<u8>,
) -> Instruction {
    Instruction {
        program_id: *mxe_program,
        accounts: vec![
            AccountMeta::new(accounts.payer, true),
            AccountMeta::new(accounts.computation, false),
            AccountMeta::new_readonly(accounts.computation_definition, false),
            AccountMeta::new_readonly(accounts.cluster, false),
            AccountMeta::new_readonly(accounts.mxe, false),
            AccountMeta::new(accounts.buy_order, false),
            AccountMeta::new(accounts.sell_order, false),
            AccountMeta::new_readonly(solana_sdk::system_program::id(), false),
        ],
        data,
    }
}

pub fn match_orders_instruction(
    dex_program: &Pubkey,
    payer: &Pubkey,
    buy_order: &Pubkey,
    sell_order: &Pubkey,
    pair: &Pubkey,
    data: Vec<u8>,
) -> Instruction {
    Instruction {
        program_id: *dex_program,
        accounts: vec![
            AccountMeta::new(*payer, true),
            AccountMeta::new(*buy_order, false),
            AccountMeta::new(*sell_order, false),
            AccountMeta::new_readonly(*pair, false),
        ],
        data,
    }
}

pub fn build_signed_transaction(
    instructions: &[Instruction],
    payer: &Keypair,
    blockhash: Hash,
) -> Transaction {
    Transaction::new_signed_with_payer(
        instructions,
        Some(&payer.pubkey()),
        &[payer],
        blockhash,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_serializes_little_endian() {
        let nonce: u128 = 0x1234_5678_9ABC_DEF0;
        let data = compare_prices_data(0, &[0; 32], &[0; 32], &[0; 32], nonce);
        let nonce_bytes = &data[COMPARE_PRICES_LEN - 16..];
        assert_eq!(&nonce_bytes[..8], &[0xF0, 0xDE, 0xBC, 0x9A, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(&nonce_bytes[8..], &[0u8; 8]);
    }

    #[test]
    fn instruction_discriminators_are_distinct() {
        let compare = instruction_discriminator(COMPARE_PRICES_IX);
        let fill = instruction_discriminator(CALCULATE_FILL_IX);
        assert_ne!(compare, fill);

        // The discriminator is the leading 8 bytes of the full digest.
        let digest = Sha256::digest(b"global:compare_prices");
        assert_eq!(compare.as_slice(), &digest[..8]);
    }

    #[test]
    fn compare_prices_layout_is_128_bytes() {
        let data = compare_prices_data(7, &[0x11; 32], &[0x22; 32], &[0x33; 32], 1);
        assert_eq!(data.len(), 128);
        assert_eq!(&data[8..16], &7u64.to_le_bytes());
        assert_eq!(&data[16..48], &[0x11; 32]);
        assert_eq!(&data[48..80], &[0x22; 32]);
        assert_eq!(&data[80..112], &[0x33; 32]);
    }

    #[test]
    fn calculate_fill_layout_is_256_bytes() {
        let data = calculate_fill_data(
            1,
            &[1; 32],
            &[2; 32],
            &[3; 32],
            &[4; 32],
            &[5; 32],
            &[6; 32],
            &[7; 32],
            9,
        );
        assert_eq!(data.len(), CALCULATE_FILL_LEN);
    }

    #[test]
    fn margin_op_layout_is_112_bytes() {
        let data = margin_op_data(ADD_ENCRYPTED_IX, &[9; 32], &[8; 64], 1_000);
        assert_eq!(data.len(), MARGIN_OP_LEN);
        let sub = margin_op_data(SUB_ENCRYPTED_IX, &[9; 32], &[8; 64], 1_000);
        assert_ne!(data[..8], sub[..8]);
    }

    #[test]
    fn namespaces_do_not_collide() {
        assert_ne!(
            instruction_discriminator("compare_prices"),
            event_discriminator("compare_prices"),
        );
        assert_ne!(
            event_discriminator("PriceCompareResult"),
            account_discriminator("PriceCompareResult"),
        );
    }
}
