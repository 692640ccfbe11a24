//! Delivery Protocol Wire Types
//!
//! Control messages exchanged between peers. Every message names its sender,
//! so the receiver can intern the peer regardless of which channel (batched
//! stream, bulk stream, datagram) carried the bytes. Handler payloads and
//! results travel as JSON strings inside the binary-encoded envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cluster::types::NodeIdentity;

/// Queue priority for requests.
pub const PRIORITY_REQUEST: i32 = 3;
/// Queue priority for negative acknowledgments.
pub const PRIORITY_NACK: i32 = 4;
/// Queue priority for acknowledgments carrying results.
pub const PRIORITY_ACK: i32 = 5;
/// Queue priority for final confirmations; these license peers to forget
/// state, so they jump the queue.
pub const PRIORITY_ACKACK: i32 = 6;

/// The result of executing a task: a JSON value, or an error description.
pub type TaskOutcome = Result<Value, String>;

/// A control message of the reliable delivery protocol.
///
/// - `Request`: invoke a handler on the receiver.
/// - `Ack`: the work is computed; carries the result. Resent until confirmed.
/// - `AckAck`: final confirmation; licenses the receiver to roll the task
///   into its watermark and forget it.
/// - `Nack`: the receiver has not computed the task; asks the caller to
///   resend the original request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    Request {
        task_id: u64,
        sender: NodeIdentity,
        handler: String,
        body_json: String,
    },
    Ack {
        task_id: u64,
        sender: NodeIdentity,
        result: Result<String, String>,
    },
    AckAck {
        task_id: u64,
        sender: NodeIdentity,
    },
    Nack {
        task_id: u64,
        sender: NodeIdentity,
    },
}

/// Encode an outcome for the wire.
pub fn encode_outcome(outcome: &TaskOutcome) -> Result<String, String> {
    match outcome {
        Ok(value) => Ok(value.to_string()),
        Err(error) => Err(error.clone()),
    }
}

/// Decode an outcome from the wire.
pub fn decode_outcome(wire: Result<String, String>) -> TaskOutcome {
    match wire {
        Ok(json) => serde_json::from_str(&json)
            .map_err(|e| format!("invalid reply payload: {}", e)),
        Err(error) => Err(error),
    }
}

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
