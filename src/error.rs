//! Error taxonomy and classification.
//!
//! Failures are classified by message content because the chain node, the
//! HTTP stack and the MPC cluster all surface errors as strings. The
//! classifier lives here so the RPC client, the retry layer and the
//! settlement executor all agree on what is worth retrying.

use thiserror::Error;

use crate::util::timeout::{Cancelled, TimeoutError};

/// Error raised when an on-chain payload fails shape validation at the
/// boundary (wrong length, bad discriminator, unknown enum tag).
#[derive(Debug, Clone, Error)]
#[error("validation error: {0}")]
pub struct ValidationError(pub String);

/// JSON-RPC level failure, message preserved verbatim for classification.
#[derive(Debug, Clone, Error)]
#[error("rpc error ({method}): {message}")]
pub struct RpcError {
    pub method: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient I/O: worth another attempt after backoff.
    Retryable,
    /// On-chain or validation failures that will never succeed on retry.
    Fatal,
    /// Anything unrecognised: retried once, then treated as fatal.
    Unknown,
}

/// Message fragments that mark an error as transient. Matching is
/// case-insensitive substring search.
const RETRYABLE_FRAGMENTS: &[&str] = &[
    "connection timeout",
    "timed out",
    "connection reset",
    "socket hang up",
    "429",
    "too many requests",
    "503",
    "service unavailable",
    "blockhash not found",
    "node is behind",
    "dns error",
    "failed to lookup address",
    "rate limit",
];

/// Message fragments that mark an error as permanently failed.
const FATAL_FRAGMENTS: &[&str] = &[
    "insufficient funds",
    "account not found",
    "invalid account owner",
    "invalid account data",
    "custom program error",
    "instruction error",
    "lamport balance below rent",
];

pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    if FATAL_FRAGMENTS.iter().any(|f| lower.contains(f)) {
        return ErrorClass::Fatal;
    }
    if RETRYABLE_FRAGMENTS.iter().any(|f| lower.contains(f)) {
        return ErrorClass::Retryable;
    }
    ErrorClass::Unknown
}

/// Classify an error from any layer. Typed timeouts and cancellations are
/// transient; validation errors are fatal; everything else falls back to
/// message matching.
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    if err.downcast_ref::<TimeoutError>().is_some() || err.downcast_ref::<Cancelled>().is_some() {
        return ErrorClass::Retryable;
    }
    if err.downcast_ref::<ValidationError>().is_some() {
        return ErrorClass::Fatal;
    }
    classify_message(&format!("{err:#}"))
}

pub fn is_retryable(err: &anyhow::Error) -> bool {
    classify(err) == ErrorClass::Retryable
}

pub fn is_fatal(err: &anyhow::Error) -> bool {
    classify(err) == ErrorClass::Fatal
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn transient_messages_are_retryable() {
        for msg in [
            "HTTP status 429 Too Many Requests",
            "Blockhash not found",
            "RPC node is behind by 42 slots",
            "connection reset by peer",
            "dns error: failed to lookup address information",
        ] {
            assert_eq!(classify_message(msg), ErrorClass::Retryable, "{msg}");
        }
    }

    #[test]
    fn onchain_failures_are_fatal() {
        for msg in [
            "Transaction simulation failed: custom program error: 0x1771",
            "Attempt to debit an account but found insufficient funds",
            "account not found",
            "Transaction results in an account with lamport balance below rent-exempt minimum",
        ] {
            assert_eq!(classify_message(msg), ErrorClass::Fatal, "{msg}");
        }
    }

    #[test]
    fn unrecognised_messages_are_unknown() {
        assert_eq!(classify_message("weird new failure"), ErrorClass::Unknown);
    }

    #[test]
    fn typed_timeout_is_retryable() {
        let err: anyhow::Error = TimeoutError {
            operation: "getSlot".into(),
            timeout_ms: 30_000,
        }
        .into();
        assert!(is_retryable(&err));
    }

    #[test]
    fn validation_error_is_fatal() {
        let err: anyhow::Error = ValidationError("event payload truncated".into()).into();
        assert!(is_fatal(&err));
        assert!(!is_retryable(&anyhow!("some unknown thing")));
    }
}
