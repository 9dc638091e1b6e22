//! Match candidate selection.
//!
//! Price is ciphertext, so the selector cannot check price compatibility;
//! it only proposes pairs and the MPC compare-prices computation is
//! authoritative. Candidates are FIFO by order age with self-trade
//! prevention.

use std::collections::{BTreeMap, HashSet};

use solana_sdk::pubkey::Pubkey;

use crate::chain::order::{Order, OrderSide};

#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub buy: Order,
    pub sell: Order,
    pub pair: Pubkey,
}

impl MatchCandidate {
    /// Dedup key for the durable pending-operation queue.
    pub fn op_key(&self) -> String {
        format!("match:{}:{}", self.buy.pda, self.sell.pda)
    }
}

/// Enumerate prioritized match candidates from an order snapshot.
///
/// Filters: Active, proof verified, not already matching, not locked.
/// Within a pair: cross-product of buys x sells excluding same-maker pairs,
/// FIFO by `created_at_hour` (buy first, then sell), stable. Truncated to
/// `max_candidates`.
pub fn select_candidates(
    orders: &[Order],
    locked: &HashSet<String>,
    max_candidates: usize,
) -> Vec<MatchCandidate> {
    let mut by_pair: BTreeMap<[u8; 32], (Vec<&Order>, Vec<&Order>)> = BTreeMap::new();

    for order in orders {
        if !order.is_open_for_matching() {
            continue;
        }
        if locked.contains(&order.pda.to_string()) {
            continue;
        }
        let bucket = by_pair.entry(order.pair.to_bytes()).or_default();
        match order.side {
            OrderSide::Buy => bucket.0.push(order),
            OrderSide::Sell => bucket.1.push(order),
        }
    }

    let mut candidates = Vec::new();
    for (_, (mut buys, mut sells)) in by_pair {
        buys.sort_by_key(|o| o.created_at_hour);
        sells.sort_by_key(|o| o.created_at_hour);

        for buy in &buys {
            for sell in &sells {
                if buy.maker == sell.maker {
                    continue;
                }
                candidates.push(MatchCandidate {
                    buy: (*buy).clone(),
                    sell: (*sell).clone(),
                    pair: buy.pair,
                });
            }
        }
    }

    candidates.sort_by_key(|c| (c.buy.created_at_hour, c.sell.created_at_hour));
    candidates.truncate(max_candidates);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::order::{decode_order, test_fixtures::encode_order, OrderStatus};

    fn order(
        maker: Pubkey,
        pair: Pubkey,
        side: OrderSide,
        status: OrderStatus,
        created_at_hour: i64,
        verified: bool,
        matching: bool,
    ) -> Order {
        let data = encode_order(
            &maker,
            &pair,
            side,
            status,
            1,
            created_at_hour,
            verified,
            matching,
        );
        decode_order(Pubkey::new_unique(), &data, 1).unwrap()
    }

    #[test]
    fn candidates_pair_opposite_sides_and_exclude_self_trades() {
        let pair = Pubkey::new_unique();
        let maker_a = Pubkey::new_unique();
        let maker_b = Pubkey::new_unique();

        let orders = vec![
            order(maker_a, pair, OrderSide::Buy, OrderStatus::Active, 10, true, false),
            order(maker_a, pair, OrderSide::Sell, OrderStatus::Active, 11, true, false),
            order(maker_b, pair, OrderSide::Sell, OrderStatus::Active, 12, true, false),
        ];

        let candidates = select_candidates(&orders, &HashSet::new(), 10);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].buy.maker, maker_a);
        assert_eq!(candidates[0].sell.maker, maker_b);
        for c in &candidates {
            assert_ne!(c.buy.maker, c.sell.maker);
            assert_eq!(c.buy.status, OrderStatus::Active);
            assert_eq!(c.sell.status, OrderStatus::Active);
        }
    }

    #[test]
    fn zero_sell_orders_yields_empty() {
        let pair = Pubkey::new_unique();
        let orders = vec![
            order(Pubkey::new_unique(), pair, OrderSide::Buy, OrderStatus::Active, 1, true, false),
            order(Pubkey::new_unique(), pair, OrderSide::Buy, OrderStatus::Active, 2, true, false),
        ];
        assert!(select_candidates(&orders, &HashSet::new(), 10).is_empty());
    }

    #[test]
    fn filters_inactive_unverified_matching_and_locked() {
        let pair = Pubkey::new_unique();
        let buy = order(Pubkey::new_unique(), pair, OrderSide::Buy, OrderStatus::Active, 1, true, false);

        let filled = order(Pubkey::new_unique(), pair, OrderSide::Sell, OrderStatus::Filled, 1, true, false);
        let unverified = order(Pubkey::new_unique(), pair, OrderSide::Sell, OrderStatus::Active, 1, false, false);
        let matching = order(Pubkey::new_unique(), pair, OrderSide::Sell, OrderStatus::Active, 1, true, true);
        let locked_sell = order(Pubkey::new_unique(), pair, OrderSide::Sell, OrderStatus::Active, 1, true, false);

        let locked: HashSet<String> = [locked_sell.pda.to_string()].into();
        let orders = vec![buy, filled, unverified, matching, locked_sell];
        assert!(select_candidates(&orders, &locked, 10).is_empty());
    }

    #[test]
    fn fifo_priority_by_buy_then_sell_age() {
        let pair = Pubkey::new_unique();
        let old_buy = order(Pubkey::new_unique(), pair, OrderSide::Buy, OrderStatus::Active, 5, true, false);
        let new_buy = order(Pubkey::new_unique(), pair, OrderSide::Buy, OrderStatus::Active, 9, true, false);
        let old_sell = order(Pubkey::new_unique(), pair, OrderSide::Sell, OrderStatus::Active, 3, true, false);
        let new_sell = order(Pubkey::new_unique(), pair, OrderSide::Sell, OrderStatus::Active, 7, true, false);

        let orders = vec![new_buy.clone(), old_sell.clone(), new_sell, old_buy.clone()];
        let candidates = select_candidates(&orders, &HashSet::new(), 10);

        assert_eq!(candidates.len(), 4);
        assert_eq!(candidates[0].buy.pda, old_buy.pda);
        assert_eq!(candidates[0].sell.pda, old_sell.pda);
        assert_eq!(candidates[1].buy.pda, old_buy.pda);
        assert_eq!(candidates[3].buy.pda, new_buy.pda);
    }

    #[test]
    fn respects_max_candidates() {
        let pair = Pubkey::new_unique();
        let mut orders = Vec::new();
        for hour in 0..5 {
            orders.push(order(Pubkey::new_unique(), pair, OrderSide::Buy, OrderStatus::Active, hour, true, false));
            orders.push(order(Pubkey::new_unique(), pair, OrderSide::Sell, OrderStatus::Active, hour, true, false));
        }
        let candidates = select_candidates(&orders, &HashSet::new(), 3);
        assert_eq!(candidates.len(), 3);
    }

    #[test]
    fn orders_in_different_pairs_never_pair_up() {
        let pair_a = Pubkey::new_unique();
        let pair_b = Pubkey::new_unique();
        let orders = vec![
            order(Pubkey::new_unique(), pair_a, OrderSide::Buy, OrderStatus::Active, 1, true, false),
            order(Pubkey::new_unique(), pair_b, OrderSide::Sell, OrderStatus::Active, 1, true, false),
        ];
        assert!(select_candidates(&orders, &HashSet::new(), 10).is_empty());
    }
}
