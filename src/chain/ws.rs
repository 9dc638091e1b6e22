//! WebSocket wire codec for chain pub/sub.
//!
//! Shared by the order-account subscriber and the MPC event listener. Only
//! the subscription shapes the crank uses are modeled; anything else parses
//! to `WsMessage::Other` and is ignored by callers.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use solana_sdk::pubkey::Pubkey;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn connect(url: &str) -> Result<WsStream> {
    let (stream, _response) = connect_async(url)
        .await
        .with_context(|| format!("websocket connect {url}"))?;
    Ok(stream)
}

/// `programSubscribe` filtered to accounts of an exact data size.
pub fn program_subscribe_request(id: u64, program: &Pubkey, data_size: u64) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "programSubscribe",
        "params": [program.to_string(), {
            "encoding": "base64",
            "commitment": "confirmed",
            "filters": [{"dataSize": data_size}],
        }],
    })
    .to_string()
}

/// `logsSubscribe` for transactions mentioning a program.
pub fn logs_subscribe_request(id: u64, mentions: &Pubkey) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "logsSubscribe",
        "params": [{"mentions": [mentions.to_string()]}, {"commitment": "confirmed"}],
    })
    .to_string()
}

pub fn unsubscribe_request(id: u64, method: &str, subscription: u64) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": [subscription],
    })
    .to_string()
}

#[derive(Debug, Clone)]
pub enum WsMessage {
    /// Reply to a subscribe request: request id -> subscription id.
    SubscriptionConfirmed { id: u64, subscription: u64 },
    ProgramNotification {
        subscription: u64,
        slot: u64,
        pubkey: String,
        data: Vec<u8>,
    },
    LogsNotification {
        subscription: u64,
        slot: u64,
        signature: String,
        logs: Vec<String>,
        failed: bool,
    },
    Other,
}

pub fn parse_message(text: &str) -> Result<WsMessage> {
    let value: Value = serde_json::from_str(text).context("websocket frame json")?;

    // Subscribe confirmation: {"id": N, "result": <subscription>}
    if let (Some(id), Some(result)) = (value.get("id"), value.get("result")) {
        if let (Some(id), Some(subscription)) = (id.as_u64(), result.as_u64()) {
            return Ok(WsMessage::SubscriptionConfirmed { id, subscription });
        }
        return Ok(WsMessage::Other);
    }

    let method = value.get("method").and_then(Value::as_str).unwrap_or("");
    let params = value.get("params").cloned().unwrap_or(Value::Null);
    let subscription = params
        .get("subscription")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let result = params.get("result").cloned().unwrap_or(Value::Null);
    let slot = result
        .pointer("/context/slot")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    match method {
        "programNotification" => {
            let pubkey = result
                .pointer("/value/pubkey")
                .and_then(Value::as_str)
                .context("programNotification missing pubkey")?
                .to_string();
            let encoded = result
                .pointer("/value/account/data/0")
                .and_then(Value::as_str)
                .context("programNotification missing data")?;
            let data = BASE64
                .decode(encoded.as_bytes())
                .context("programNotification data base64")?;
            Ok(WsMessage::ProgramNotification {
                subscription,
                slot,
                pubkey,
                data,
            })
        }
        "logsNotification" => {
            let signature = result
                .pointer("/value/signature")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let failed = result
                .pointer("/value/err")
                .map(|e| !e.is_null())
                .unwrap_or(false);
            let logs = result
                .pointer("/value/logs")
                .and_then(Value::as_array)
                .map(|lines| {
                    lines
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Ok(WsMessage::LogsNotification {
                subscription,
                slot,
                signature,
                logs,
                failed,
            })
        }
        _ => Ok(WsMessage::Other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscription_confirmation() {
        let msg = parse_message(r#"{"jsonrpc":"2.0","id":3,"result":22}"#).unwrap();
        match msg {
            WsMessage::SubscriptionConfirmed { id, subscription } => {
                assert_eq!(id, 3);
                assert_eq!(subscription, 22);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_program_notification() {
        let data = BASE64.encode([1u8, 2, 3]);
        let frame = format!(
            r#"{{"jsonrpc":"2.0","method":"programNotification","params":{{"subscription":7,"result":{{"context":{{"slot":99}},"value":{{"pubkey":"abc","account":{{"data":["{data}","base64"]}}}}}}}}}}"#
        );
        match parse_message(&frame).unwrap() {
            WsMessage::ProgramNotification {
                subscription,
                slot,
                pubkey,
                data,
            } => {
                assert_eq!(subscription, 7);
                assert_eq!(slot, 99);
                assert_eq!(pubkey, "abc");
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_logs_notification() {
        let frame = r#"{"jsonrpc":"2.0","method":"logsNotification","params":{"subscription":4,"result":{"context":{"slot":10},"value":{"signature":"sig","err":null,"logs":["Program log: hi"]}}}}"#;
        match parse_message(frame).unwrap() {
            WsMessage::LogsNotification {
                signature,
                logs,
                failed,
                ..
            } => {
                assert_eq!(signature, "sig");
                assert!(!failed);
                assert_eq!(logs.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_methods_are_other() {
        assert!(matches!(
            parse_message(r#"{"jsonrpc":"2.0","method":"slotNotification","params":{}}"#).unwrap(),
            WsMessage::Other
        ));
    }
}
