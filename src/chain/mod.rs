//! Chain-facing layer: RPC transport, blockhash cache, account layouts,
//! instruction encodings, and the order subscription cache.

pub mod blockhash;
pub mod order;
pub mod rpc;
pub mod subscriber;
pub mod tx;
pub mod ws;
