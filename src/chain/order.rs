//! Encrypted order account layout.
//!
//! Orders are read-only projections of chain state; the crank decodes them
//! but never writes them back. The account is exactly 366 bytes with the
//! byte-exact offsets below; anything that does not match is rejected at the
//! boundary.

use solana_sdk::pubkey::Pubkey;

use crate::chain::tx::account_discriminator;
use crate::error::ValidationError;

pub const ORDER_ACCOUNT_SIZE: usize = 366;
pub const ORDER_ACCOUNT_NAME: &str = "EncryptedOrder";

const OFF_DISCRIMINATOR: usize = 0;
const OFF_MAKER: usize = 8;
const OFF_PAIR: usize = 40;
const OFF_SIDE: usize = 72;
const OFF_ORDER_ID: usize = 73;
const OFF_CREATED_AT_HOUR: usize = 81;
const OFF_ENCRYPTED_AMOUNT: usize = 89;
const OFF_ENCRYPTED_PRICE: usize = 153;
const OFF_PENDING_MATCH_REQUEST: usize = 217;
const OFF_PROOF_VERIFIED: usize = 249;
const OFF_IS_MATCHING: usize = 250;
const OFF_STATUS: usize = 266;
const OFF_ENCRYPTED_FILLED: usize = 267;
const OFF_EXPIRES_AT_HOUR: usize = 331;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn from_byte(b: u8) -> Result<Self, ValidationError> {
        match b {
            0 => Ok(Self::Buy),
            1 => Ok(Self::Sell),
            other => Err(ValidationError(format!("unknown order side tag {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Active,
    Filled,
    Cancelled,
    Expired,
    Matching,
}

impl OrderStatus {
    pub fn from_byte(b: u8) -> Result<Self, ValidationError> {
        match b {
            0 => Ok(Self::Active),
            1 => Ok(Self::Filled),
            2 => Ok(Self::Cancelled),
            3 => Ok(Self::Expired),
            4 => Ok(Self::Matching),
            other => Err(ValidationError(format!("unknown order status tag {other}"))),
        }
    }
}

/// Decoded projection of an on-chain encrypted order.
#[derive(Debug, Clone)]
pub struct Order {
    pub pda: Pubkey,
    pub order_id: u64,
    pub maker: Pubkey,
    pub pair: Pubkey,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub created_at_hour: i64,
    pub expires_at_hour: i64,
    pub eligibility_proof_verified: bool,
    pub is_matching: bool,
    pub pending_match_request: [u8; 32],
    pub encrypted_amount: [u8; 64],
    pub encrypted_price: [u8; 64],
    pub encrypted_filled: [u8; 64],
    /// Slot at which this projection was observed.
    pub slot: u64,
}

impl Order {
    pub fn is_open_for_matching(&self) -> bool {
        self.status == OrderStatus::Active && self.eligibility_proof_verified && !self.is_matching
    }
}

fn read_array<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

pub fn decode_order(pda: Pubkey, data: &[u8], slot: u64) -> Result<Order, ValidationError> {
    if data.len() != ORDER_ACCOUNT_SIZE {
        return Err(ValidationError(format!(
            "order account {pda} has {} bytes, expected {ORDER_ACCOUNT_SIZE}",
            data.len()
        )));
    }

    let discriminator: [u8; 8] = read_array(data, OFF_DISCRIMINATOR);
    if discriminator != account_discriminator(ORDER_ACCOUNT_NAME) {
        return Err(ValidationError(format!(
            "order account {pda} has wrong discriminator"
        )));
    }

    Ok(Order {
        pda,
        maker: Pubkey::new_from_array(read_array(data, OFF_MAKER)),
        pair: Pubkey::new_from_array(read_array(data, OFF_PAIR)),
        side: OrderSide::from_byte(data[OFF_SIDE])?,
        order_id: u64::from_le_bytes(read_array(data, OFF_ORDER_ID)),
        created_at_hour: i64::from_le_bytes(read_array(data, OFF_CREATED_AT_HOUR)),
        expires_at_hour: i64::from_le_bytes(read_array(data, OFF_EXPIRES_AT_HOUR)),
        encrypted_amount: read_array(data, OFF_ENCRYPTED_AMOUNT),
        encrypted_price: read_array(data, OFF_ENCRYPTED_PRICE),
        encrypted_filled: read_array(data, OFF_ENCRYPTED_FILLED),
        pending_match_request: read_array(data, OFF_PENDING_MATCH_REQUEST),
        eligibility_proof_verified: data[OFF_PROOF_VERIFIED] == 1,
        is_matching: data[OFF_IS_MATCHING] == 1,
        status: OrderStatus::from_byte(data[OFF_STATUS])?,
        slot,
    })
}

/// The MPC computations consume the leading 32 bytes of each 64-byte
/// ciphertext field; the trailing half is the encryption envelope.
pub fn cipher_body(field: &[u8; 64]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&field[..32]);
    out
}

#[cfg(test)]
pub mod test_fixtures {
    use super::*;

    /// Assemble a valid 366-byte order account for tests.
    #[allow(clippy::too_many_arguments)]
    pub fn encode_order(
        maker: &Pubkey,
        pair: &Pubkey,
        side: OrderSide,
        status: OrderStatus,
        order_id: u64,
        created_at_hour: i64,
        proof_verified: bool,
        is_matching: bool,
    ) -> Vec<u8> {
        let mut data = vec![0u8; ORDER_ACCOUNT_SIZE];
        data[OFF_DISCRIMINATOR..OFF_DISCRIMINATOR + 8]
            .copy_from_slice(&account_discriminator(ORDER_ACCOUNT_NAME));
        data[OFF_MAKER..OFF_MAKER + 32].copy_from_slice(maker.as_ref());
        data[OFF_PAIR..OFF_PAIR + 32].copy_from_slice(pair.as_ref());
        data[OFF_SIDE] = match side {
            OrderSide::Buy => 0,
            OrderSide::Sell => 1,
        };
        data[OFF_ORDER_ID..OFF_ORDER_ID + 8].copy_from_slice(&order_id.to_le_bytes());
        data[OFF_CREATED_AT_HOUR..OFF_CREATED_AT_HOUR + 8]
            .copy_from_slice(&created_at_hour.to_le_bytes());
        data[OFF_PROOF_VERIFIED] = proof_verified as u8;
        data[OFF_IS_MATCHING] = is_matching as u8;
        data[OFF_STATUS] = match status {
            OrderStatus::Active => 0,
            OrderStatus::Filled => 1,
            OrderStatus::Cancelled => 2,
            OrderStatus::Expired => 3,
            OrderStatus::Matching => 4,
        };
        data[OFF_ENCRYPTED_PRICE..OFF_ENCRYPTED_PRICE + 64].copy_from_slice(&[0x11; 64]);
        data[OFF_ENCRYPTED_AMOUNT..OFF_ENCRYPTED_AMOUNT + 64].copy_from_slice(&[0x22; 64]);
        data
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::encode_order;
    use super::*;

    #[test]
    fn decodes_round_fields() {
        let maker = Pubkey::new_unique();
        let pair = Pubkey::new_unique();
        let data = encode_order(
            &maker,
            &pair,
            OrderSide::Sell,
            OrderStatus::Active,
            42,
            481_000,
            true,
            false,
        );

        let order = decode_order(Pubkey::new_unique(), &data, 1_234).unwrap();
        assert_eq!(order.maker, maker);
        assert_eq!(order.pair, pair);
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.status, OrderStatus::Active);
        assert_eq!(order.order_id, 42);
        assert_eq!(order.created_at_hour, 481_000);
        assert!(order.eligibility_proof_verified);
        assert!(!order.is_matching);
        assert!(order.is_open_for_matching());
        assert_eq!(order.slot, 1_234);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = decode_order(Pubkey::new_unique(), &[0u8; 100], 0).unwrap_err();
        assert!(err.0.contains("100 bytes"));
    }

    #[test]
    fn rejects_wrong_discriminator() {
        let mut data = vec![0u8; ORDER_ACCOUNT_SIZE];
        data[0] = 0xFF;
        assert!(decode_order(Pubkey::new_unique(), &data, 0).is_err());
    }

    #[test]
    fn rejects_unknown_tags() {
        let maker = Pubkey::new_unique();
        let pair = Pubkey::new_unique();
        let mut data = encode_order(
            &maker,
            &pair,
            OrderSide::Buy,
            OrderStatus::Active,
            1,
            0,
            true,
            false,
        );
        data[OFF_SIDE] = 9;
        assert!(decode_order(Pubkey::new_unique(), &data, 0).is_err());
    }

    #[test]
    fn matching_orders_are_not_open() {
        let data = encode_order(
            &Pubkey::new_unique(),
            &Pubkey::new_unique(),
            OrderSide::Buy,
            OrderStatus::Active,
            1,
            0,
            true,
            true,
        );
        let order = decode_order(Pubkey::new_unique(), &data, 0).unwrap();
        assert!(!order.is_open_for_matching());
    }

    #[test]
    fn cipher_body_is_leading_half() {
        let mut field = [0u8; 64];
        field[..32].copy_from_slice(&[0xAB; 32]);
        field[32..].copy_from_slice(&[0xCD; 32]);
        assert_eq!(cipher_body(&field), [0xAB; 32]);
    }
}
