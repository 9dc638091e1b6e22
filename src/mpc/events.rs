//! MPC callback events.
//!
//! The cluster reports results through program log events: a `Program data:`
//! line whose payload is an 8-byte event discriminator followed by a fixed
//! little-endian layout. Anything that does not match exactly is rejected at
//! the boundary. A dedicated listener task converts log notifications into
//! messages on a bounded queue; the processor drains the queue, enforces
//! idempotency and wakes finalization waiters.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::json;
use solana_sdk::pubkey::Pubkey;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chain::tx::event_discriminator;
use crate::chain::ws;
use crate::db::pending_ops::{OpType, PendingOpRepo};
use crate::db::processed::{MpcProcessedRepo, RequestType};
use crate::metrics::CrankMetrics;
use crate::error::ValidationError;
use crate::util::timeout::{delay, CancelToken};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

pub const PRICE_COMPARE_EVENT: &str = "PriceCompareResult";
pub const FILL_CALCULATION_EVENT: &str = "FillCalculationResult";

const PROGRAM_DATA_PREFIX: &str = "Program data: ";
const PRICE_COMPARE_BODY_LEN: usize = 121;
const FILL_CALCULATION_BODY_LEN: usize = 170;
/// Bounded event queue between listener and processor.
pub const EVENT_QUEUE_DEPTH: usize = 256;

const LISTENER_INITIAL_DELAY_MS: u64 = 1_000;
const LISTENER_MAX_DELAY_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceCompareResult {
    pub computation_offset: u64,
    pub prices_match: bool,
    pub request_id: [u8; 32],
    pub buy_order: Pubkey,
    pub sell_order: Pubkey,
    pub nonce: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillCalculationResult {
    pub computation_offset: u64,
    pub encrypted_fill_amount: [u8; 64],
    pub buy_fully_filled: bool,
    pub sell_fully_filled: bool,
    pub request_id: [u8; 32],
    pub buy_order: Pubkey,
    pub sell_order: Pubkey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MpcEvent {
    PriceCompare(PriceCompareResult),
    FillCalculation(FillCalculationResult),
}

impl MpcEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MpcEvent::PriceCompare(_) => PRICE_COMPARE_EVENT,
            MpcEvent::FillCalculation(_) => FILL_CALCULATION_EVENT,
        }
    }

    pub fn computation_type(&self) -> &'static str {
        match self {
            MpcEvent::PriceCompare(_) => "compare_prices",
            MpcEvent::FillCalculation(_) => "calculate_fill",
        }
    }

    pub fn request_id(&self) -> &[u8; 32] {
        match self {
            MpcEvent::PriceCompare(e) => &e.request_id,
            MpcEvent::FillCalculation(e) => &e.request_id,
        }
    }

    pub fn computation_offset(&self) -> u64 {
        match self {
            MpcEvent::PriceCompare(e) => e.computation_offset,
            MpcEvent::FillCalculation(e) => e.computation_offset,
        }
    }

    /// Opaque JSON payload for the durable recovery queue.
    pub fn to_payload(&self) -> serde_json::Value {
        match self {
            MpcEvent::PriceCompare(e) => json!({
                "event": PRICE_COMPARE_EVENT,
                "computation_offset": e.computation_offset,
                "prices_match": e.prices_match,
                "request_id": hex::encode(e.request_id),
                "buy_order": e.buy_order.to_string(),
                "sell_order": e.sell_order.to_string(),
                "nonce": e.nonce.to_string(),
            }),
            MpcEvent::FillCalculation(e) => json!({
                "event": FILL_CALCULATION_EVENT,
                "computation_offset": e.computation_offset,
                "encrypted_fill_amount": hex::encode(e.encrypted_fill_amount),
                "buy_fully_filled": e.buy_fully_filled,
                "sell_fully_filled": e.sell_fully_filled,
                "request_id": hex::encode(e.request_id),
                "buy_order": e.buy_order.to_string(),
                "sell_order": e.sell_order.to_string(),
            }),
        }
    }

    pub fn from_payload(payload: &str) -> Result<Self, ValidationError> {
        let value: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| ValidationError(format!("callback payload json: {e}")))?;
        let field = |name: &str| -> Result<String, ValidationError> {
            value
                .get(name)
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ValidationError(format!("callback payload missing {name}")))
        };
        let pubkey = |name: &str| -> Result<Pubkey, ValidationError> {
            Pubkey::from_str(&field(name)?)
                .map_err(|e| ValidationError(format!("callback payload {name}: {e}")))
        };
        let fixed_hex = |name: &str, len: usize| -> Result<Vec<u8>, ValidationError> {
            let bytes = hex::decode(field(name)?)
                .map_err(|e| ValidationError(format!("callback payload {name}: {e}")))?;
            if bytes.len() != len {
                return Err(ValidationError(format!(
                    "callback payload {name} has {} bytes, expected {len}",
                    bytes.len()
                )));
            }
            Ok(bytes)
        };
        let offset = value
            .get("computation_offset")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| ValidationError("callback payload missing computation_offset".into()))?;

        match field("event")?.as_str() {
            PRICE_COMPARE_EVENT => Ok(MpcEvent::PriceCompare(PriceCompareResult {
                computation_offset: offset,
                prices_match: value
                    .get("prices_match")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false),
                request_id: fixed_hex("request_id", 32)?.try_into().expect("len checked"),
                buy_order: pubkey("buy_order")?,
                sell_order: pubkey("sell_order")?,
                nonce: field("nonce")?
                    .parse()
                    .map_err(|e| ValidationError(format!("callback payload nonce: {e}")))?,
            })),
            FILL_CALCULATION_EVENT => Ok(MpcEvent::FillCalculation(FillCalculationResult {
                computation_offset: offset,
                encrypted_fill_amount: fixed_hex("encrypted_fill_amount", 64)?
                    .try_into()
                    .expect("len checked"),
                buy_fully_filled: value
                    .get("buy_fully_filled")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false),
                sell_fully_filled: value
                    .get("sell_fully_filled")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false),
                request_id: fixed_hex("request_id", 32)?.try_into().expect("len checked"),
                buy_order: pubkey("buy_order")?,
                sell_order: pubkey("sell_order")?,
            })),
            other => Err(ValidationError(format!("unknown callback event '{other}'"))),
        }
    }
}

fn take<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

fn decode_bool(byte: u8, field: &str) -> Result<bool, ValidationError> {
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ValidationError(format!("{field} has invalid bool tag {other}"))),
    }
}

/// Decode a raw event payload (discriminator included). Unknown
/// discriminators return `Ok(None)`; known events with a malformed body are
/// validation errors.
pub fn decode_event_data(data: &[u8]) -> Result<Option<MpcEvent>, ValidationError> {
    if data.len() < 8 {
        return Ok(None);
    }
    let disc: [u8; 8] = take(data, 0);
    let body = &data[8..];

    if disc == event_discriminator(PRICE_COMPARE_EVENT) {
        if body.len() != PRICE_COMPARE_BODY_LEN {
            return Err(ValidationError(format!(
                "PriceCompareResult body has {} bytes, expected {PRICE_COMPARE_BODY_LEN}",
                body.len()
            )));
        }
        return Ok(Some(MpcEvent::PriceCompare(PriceCompareResult {
            computation_offset: u64::from_le_bytes(take(body, 0)),
            prices_match: decode_bool(body[8], "prices_match")?,
            request_id: take(body, 9),
            buy_order: Pubkey::new_from_array(take(body, 41)),
            sell_order: Pubkey::new_from_array(take(body, 73)),
            nonce: u128::from_le_bytes(take(body, 105)),
        })));
    }

    if disc == event_discriminator(FILL_CALCULATION_EVENT) {
        if body.len() != FILL_CALCULATION_BODY_LEN {
            return Err(ValidationError(format!(
                "FillCalculationResult body has {} bytes, expected {FILL_CALCULATION_BODY_LEN}",
                body.len()
            )));
        }
        return Ok(Some(MpcEvent::FillCalculation(FillCalculationResult {
            computation_offset: u64::from_le_bytes(take(body, 0)),
            encrypted_fill_amount: take(body, 8),
            buy_fully_filled: decode_bool(body[72], "buy_fully_filled")?,
            sell_fully_filled: decode_bool(body[73], "sell_fully_filled")?,
            request_id: take(body, 74),
            buy_order: Pubkey::new_from_array(take(body, 106)),
            sell_order: Pubkey::new_from_array(take(body, 138)),
        })));
    }

    Ok(None)
}

/// Scan one transaction's log lines for MPC events.
pub fn decode_from_logs(logs: &[String]) -> Vec<Result<MpcEvent, ValidationError>> {
    let mut events = Vec::new();
    for line in logs {
        let Some(encoded) = line.strip_prefix(PROGRAM_DATA_PREFIX) else {
            continue;
        };
        let Ok(data) = BASE64.decode(encoded.trim().as_bytes()) else {
            events.push(Err(ValidationError("event payload is not base64".into())));
            continue;
        };
        match decode_event_data(&data) {
            Ok(Some(event)) => events.push(Ok(event)),
            Ok(None) => {}
            Err(e) => events.push(Err(e)),
        }
    }
    events
}

/// Correlates finalization waiters with incoming events by computation
/// offset.
#[derive(Default)]
pub struct MpcCorrelator {
    waiters: Mutex<HashMap<u64, oneshot::Sender<MpcEvent>>>,
}

impl MpcCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, computation_offset: u64) -> oneshot::Receiver<MpcEvent> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(computation_offset, tx);
        rx
    }

    pub fn unregister(&self, computation_offset: u64) {
        self.waiters.lock().remove(&computation_offset);
    }

    /// Deliver an event to its waiter. Returns false when nobody is
    /// waiting (restart recovery path).
    pub fn complete(&self, event: MpcEvent) -> bool {
        let offset = event.computation_offset();
        match self.waiters.lock().remove(&offset) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn waiting_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

/// An event observed on chain, tagged with its transaction.
#[derive(Debug, Clone)]
pub struct ObservedEvent {
    pub event: MpcEvent,
    pub signature: String,
    pub slot: u64,
}

/// Listener task: subscribes to DEX program logs and pushes decoded events
/// onto the bounded queue. Reconnects forever with capped backoff.
pub struct MpcEventListener {
    ws_url: String,
    dex_program: Pubkey,
    queue: mpsc::Sender<ObservedEvent>,
    cancel: CancelToken,
    metrics: Arc<CrankMetrics>,
}

impl MpcEventListener {
    pub fn new(
        ws_url: String,
        dex_program: Pubkey,
        queue: mpsc::Sender<ObservedEvent>,
        cancel: CancelToken,
        metrics: Arc<CrankMetrics>,
    ) -> Self {
        Self {
            ws_url,
            dex_program,
            queue,
            cancel,
            metrics,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        let mut reconnect_delay = LISTENER_INITIAL_DELAY_MS;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.connect_and_stream().await {
                Ok(()) => {
                    reconnect_delay = LISTENER_INITIAL_DELAY_MS;
                }
                Err(e) => {
                    warn!(err = %e, delay_ms = reconnect_delay, "mpc event stream lost, reconnecting");
                    if !delay(reconnect_delay, Some(&self.cancel)).await {
                        return;
                    }
                    reconnect_delay = (reconnect_delay * 2).min(LISTENER_MAX_DELAY_MS);
                }
            }
        }
    }

    async fn connect_and_stream(&self) -> Result<()> {
        info!(url = %self.ws_url, "🔌 connecting mpc event stream");
        let mut stream = ws::connect(&self.ws_url).await?;
        stream
            .send(Message::Text(ws::logs_subscribe_request(1, &self.dex_program)))
            .await?;

        while let Some(frame) = stream.next().await {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let text = match frame? {
                Message::Text(text) => text,
                Message::Ping(payload) => {
                    stream.send(Message::Pong(payload)).await.ok();
                    continue;
                }
                Message::Close(_) => return Ok(()),
                _ => continue,
            };

            match ws::parse_message(&text) {
                Ok(ws::WsMessage::SubscriptionConfirmed { subscription, .. }) => {
                    info!(subscription, "✅ mpc event stream active");
                }
                Ok(ws::WsMessage::LogsNotification {
                    signature,
                    slot,
                    logs,
                    failed,
                    ..
                }) => {
                    if failed {
                        continue;
                    }
                    for decoded in decode_from_logs(&logs) {
                        match decoded {
                            Ok(event) => {
                                let observed = ObservedEvent {
                                    event,
                                    signature: signature.clone(),
                                    slot,
                                };
                                // Backpressure: block the listener rather
                                // than dropping callbacks.
                                if self.queue.send(observed).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Err(e) => {
                                self.metrics.record_validation_error();
                                warn!(err = %e, tx = %signature, "rejected malformed mpc event");
                            }
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(err = %e, "unparseable log frame"),
            }
        }
        Ok(())
    }
}

/// Processor task: drains the event queue in arrival order, enforces
/// idempotency, wakes waiters, and persists orphan callbacks for recovery.
pub struct CallbackProcessor {
    processed: MpcProcessedRepo,
    pending_ops: PendingOpRepo,
    correlator: Arc<MpcCorrelator>,
    cancel: CancelToken,
    /// Bound on handling a single callback end to end.
    callback_timeout_ms: u64,
}

impl CallbackProcessor {
    pub fn new(
        processed: MpcProcessedRepo,
        pending_ops: PendingOpRepo,
        correlator: Arc<MpcCorrelator>,
        cancel: CancelToken,
        callback_timeout_ms: u64,
    ) -> Self {
        Self {
            processed,
            pending_ops,
            correlator,
            cancel,
            callback_timeout_ms,
        }
    }

    pub fn spawn(self, queue: mpsc::Receiver<ObservedEvent>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(queue).await })
    }

    async fn run(self, mut queue: mpsc::Receiver<ObservedEvent>) {
        loop {
            let observed = tokio::select! {
                next = queue.recv() => match next {
                    Some(observed) => observed,
                    None => return,
                },
                _ = self.cancel.cancelled() => return,
            };
            let bounded = crate::util::timeout::with_timeout(
                "mpc callback",
                self.callback_timeout_ms,
                self.process(observed),
            )
            .await;
            if let Err(e) = bounded {
                warn!(err = %e, "mpc callback processing failed");
            }
        }
    }

    pub async fn process(&self, observed: ObservedEvent) -> Result<()> {
        let event = observed.event;
        let key = MpcProcessedRepo::event_key(event.request_id(), event.name());

        if self.processed.is_processed(&key).await? {
            debug!(key = %key, "duplicate mpc callback ignored");
            return Ok(());
        }

        let delivered = self.correlator.complete(event.clone());
        if !delivered {
            // Nobody is waiting (e.g. the submitting instance died): park
            // the callback durably so the recovery path can pick it up.
            let op_key = format!("mpc_callback:{key}");
            if !self.pending_ops.exists(&op_key).await? {
                self.pending_ops
                    .create(
                        OpType::MpcCallback,
                        &op_key,
                        &event.to_payload().to_string(),
                        3,
                    )
                    .await?;
                info!(key = %key, "orphan mpc callback queued for recovery");
            }
        }

        self.processed
            .mark_processed(
                &key,
                RequestType::Event,
                Some(event.computation_type()),
                Some(&observed.signature),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod test_fixtures {
    use super::*;

    pub fn encode_price_compare(event: &PriceCompareResult) -> Vec<u8> {
        let mut data = Vec::with_capacity(8 + PRICE_COMPARE_BODY_LEN);
        data.extend_from_slice(&event_discriminator(PRICE_COMPARE_EVENT));
        data.extend_from_slice(&event.computation_offset.to_le_bytes());
        data.push(event.prices_match as u8);
        data.extend_from_slice(&event.request_id);
        data.extend_from_slice(event.buy_order.as_ref());
        data.extend_from_slice(event.sell_order.as_ref());
        data.extend_from_slice(&event.nonce.to_le_bytes());
        data
    }

    pub fn encode_fill_calculation(event: &FillCalculationResult) -> Vec<u8> {
        let mut data = Vec::with_capacity(8 + FILL_CALCULATION_BODY_LEN);
        data.extend_from_slice(&event_discriminator(FILL_CALCULATION_EVENT));
        data.extend_from_slice(&event.computation_offset.to_le_bytes());
        data.extend_from_slice(&event.encrypted_fill_amount);
        data.push(event.buy_fully_filled as u8);
        data.push(event.sell_fully_filled as u8);
        data.extend_from_slice(&event.request_id);
        data.extend_from_slice(event.buy_order.as_ref());
        data.extend_from_slice(event.sell_order.as_ref());
        data
    }

    pub fn log_line(data: &[u8]) -> String {
        format!("{PROGRAM_DATA_PREFIX}{}", BASE64.encode(data))
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;
    use crate::db::Database;

    fn sample_compare() -> PriceCompareResult {
        PriceCompareResult {
            computation_offset: 77,
            prices_match: true,
            request_id: [9u8; 32],
            buy_order: Pubkey::new_unique(),
            sell_order: Pubkey::new_unique(),
            nonce: 0x1234_5678_9ABC_DEF0,
        }
    }

    fn sample_fill() -> FillCalculationResult {
        FillCalculationResult {
            computation_offset: 78,
            encrypted_fill_amount: [5u8; 64],
            buy_fully_filled: true,
            sell_fully_filled: false,
            request_id: [9u8; 32],
            buy_order: Pubkey::new_unique(),
            sell_order: Pubkey::new_unique(),
        }
    }

    #[test]
    fn price_compare_round_trips_through_logs() {
        let event = sample_compare();
        let logs = vec![
            "Program log: match attempt".to_string(),
            log_line(&encode_price_compare(&event)),
        ];
        let decoded = decode_from_logs(&logs);
        assert_eq!(decoded.len(), 1);
        assert_eq!(
            decoded[0].as_ref().unwrap(),
            &MpcEvent::PriceCompare(event)
        );
    }

    #[test]
    fn fill_calculation_round_trips() {
        let event = sample_fill();
        let decoded = decode_event_data(&encode_fill_calculation(&event))
            .unwrap()
            .unwrap();
        assert_eq!(decoded, MpcEvent::FillCalculation(event));
    }

    #[test]
    fn truncated_body_is_a_validation_error() {
        let mut data = encode_price_compare(&sample_compare());
        data.truncate(data.len() - 1);
        assert!(decode_event_data(&data).is_err());
    }

    #[test]
    fn unknown_discriminator_is_ignored() {
        let mut data = vec![0xFFu8; 64];
        data[..8].copy_from_slice(&event_discriminator("SomethingElse"));
        assert!(decode_event_data(&data).unwrap().is_none());
    }

    #[test]
    fn invalid_bool_tag_is_rejected() {
        let mut data = encode_price_compare(&sample_compare());
        data[16] = 7; // prices_match byte
        assert!(decode_event_data(&data).is_err());
    }

    #[test]
    fn payload_round_trip_for_recovery() {
        for event in [
            MpcEvent::PriceCompare(sample_compare()),
            MpcEvent::FillCalculation(sample_fill()),
        ] {
            let payload = event.to_payload().to_string();
            assert_eq!(MpcEvent::from_payload(&payload).unwrap(), event);
        }
    }

    #[test]
    fn correlator_delivers_by_offset() {
        let correlator = MpcCorrelator::new();
        let mut rx = correlator.register(77);
        assert_eq!(correlator.waiting_count(), 1);

        let event = MpcEvent::PriceCompare(sample_compare());
        assert!(correlator.complete(event.clone()));
        assert_eq!(rx.try_recv().unwrap(), event);
        assert_eq!(correlator.waiting_count(), 0);

        // No waiter registered: delivery reports false.
        assert!(!correlator.complete(MpcEvent::FillCalculation(sample_fill())));
    }

    #[tokio::test]
    async fn duplicate_callbacks_have_no_second_effect() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        let processed = MpcProcessedRepo::new(db.clone());
        let pending = PendingOpRepo::new(db);
        let correlator = Arc::new(MpcCorrelator::new());
        let processor = CallbackProcessor::new(
            processed.clone(),
            pending.clone(),
            Arc::clone(&correlator),
            CancelToken::new(),
            30_000,
        );

        let observed = ObservedEvent {
            event: MpcEvent::PriceCompare(sample_compare()),
            signature: "sig".to_string(),
            slot: 5,
        };
        processor.process(observed.clone()).await.unwrap();
        processor.process(observed).await.unwrap();

        // One orphan pending op, one processed row.
        let ready = pending.find_ready_to_process(None, 10).await.unwrap();
        assert_eq!(ready.len(), 1);
        let key = MpcProcessedRepo::event_key(&[9u8; 32], PRICE_COMPARE_EVENT);
        assert!(processed.is_processed(&key).await.unwrap());
    }
}
