//! Signed webhook notifications.
//!
//! - [`WebhookDispatcher`]: fans a lifecycle event out to subscribed
//!   endpoints and manages endpoint registrations
//! - [`DeliveryWorker`]: performs one signed POST per job, applies the retry
//!   policy and trips the per-endpoint circuit breaker

pub mod delivery;
pub mod dispatcher;

pub use delivery::{DeliveryOutcome, DeliveryWorker};
pub use dispatcher::{EndpointUpdate, WebhookDispatcher};

use serde_json::{Map, Value};

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_HEADER: &str = "X-Webhook-Event";

/// Serialize `value` with object keys in sorted order at every level.
/// This is the exact byte sequence that gets signed and sent.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&sorted(value))
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), sorted(&map[key.as_str()]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}
