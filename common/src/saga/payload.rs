// Saga task payloads
//
// Payload schemas are additive along the chain: every step deserializes the
// fields it knows and carries everything else through untouched, so a worker
// can be inserted mid-chain without redeploying its neighbors.

use crate::trace::TraceCarrier;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Envelope fields carried through the entire saga.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SagaPayload {
    /// Name of the ServerQueue designated to synthetically fail (chaos hook).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_trigger: Option<String>,

    /// W3C trace-context carrier seeded at the head of the chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_carrier: Option<TraceCarrier>,
}

/// A step's view of the task payload: the saga envelope, the business fields
/// this template knows about, and a catch-all for fields owned by other
/// steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepPayload {
    #[serde(flatten)]
    pub saga: SagaPayload,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StepPayload {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Business fields only: the payload minus the saga envelope. The
    /// coordinator re-attaches `fail_trigger` and `trace_carrier` when it
    /// builds the downstream payload.
    pub fn business_fields(&self) -> Map<String, Value> {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        let mut fields = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        fields.remove("fail_trigger");
        fields.remove("trace_carrier");
        fields
    }

    /// Compensation payload sent upstream: `{order_id, trace_carrier}`.
    pub fn compensation(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        if let Some(order_id) = self.order_id {
            fields.insert("order_id".to_string(), Value::from(order_id));
        }
        if let Some(carrier) = &self.saga.trace_carrier {
            fields.insert(
                "trace_carrier".to_string(),
                serde_json::to_value(carrier).unwrap_or(Value::Null),
            );
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let raw = json!({
            "order_id": 7,
            "amount": 2,
            "warehouse_zone": "B2",
            "fail_trigger": "inventory",
            "trace_carrier": { "traceparent": "00-abc-def-01" },
        });

        let payload: StepPayload = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(payload.order_id, Some(7));
        assert_eq!(payload.saga.fail_trigger.as_deref(), Some("inventory"));
        assert_eq!(payload.extra["warehouse_zone"], json!("B2"));

        let round_tripped = serde_json::to_value(&payload).unwrap();
        assert_eq!(round_tripped, raw);
    }

    #[test]
    fn test_business_fields_strip_saga_envelope() {
        let payload: StepPayload = serde_json::from_value(json!({
            "order_id": 7,
            "username": "u",
            "fail_trigger": "B",
            "trace_carrier": { "traceparent": "00-abc-def-01" },
        }))
        .unwrap();

        let fields = payload.business_fields();
        assert_eq!(fields["order_id"], json!(7));
        assert_eq!(fields["username"], json!("u"));
        assert!(!fields.contains_key("fail_trigger"));
        assert!(!fields.contains_key("trace_carrier"));
    }

    #[test]
    fn test_compensation_carries_order_id_and_carrier() {
        let payload: StepPayload = serde_json::from_value(json!({
            "order_id": 7,
            "amount": 2,
            "trace_carrier": { "traceparent": "00-abc-def-01" },
        }))
        .unwrap();

        let compensation = payload.compensation();
        assert_eq!(compensation["order_id"], json!(7));
        assert_eq!(
            compensation["trace_carrier"],
            json!({ "traceparent": "00-abc-def-01" })
        );
        // compensation carries no business fields beyond the order id
        assert!(!compensation.contains_key("amount"));
    }

    #[test]
    fn test_missing_optional_fields_parse_to_none() {
        let payload = StepPayload::parse(b"{}").unwrap();
        assert!(payload.order_id.is_none());
        assert!(payload.saga.fail_trigger.is_none());
        assert!(payload.saga.trace_carrier.is_none());
        assert!(payload.extra.is_empty());
    }

    #[test]
    fn test_garbage_bytes_fail_to_parse() {
        assert!(StepPayload::parse(b"not json at all").is_err());
    }
}
