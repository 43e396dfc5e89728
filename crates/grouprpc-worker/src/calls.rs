//! `--call DST:OP:JSON` arguments and their printed outcome.

use anyhow::{anyhow, Context};
use bytes::Bytes;
use grouprpc::RpcAgent;
use serde::Serialize;
use serde_json::Value;
use std::str::FromStr;
use tracing::debug;

/// One call requested on the command line.
///
/// The destination and operation end at the first and second `:`; the rest
/// is the JSON payload and may itself contain colons. An empty payload means
/// `null`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCall {
    pub destination: String,
    pub operation: String,
    pub payload: Value,
}

impl FromStr for PlannedCall {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let mut parts = s.splitn(3, ':');
        let destination = parts
            .next()
            .filter(|part| !part.is_empty())
            .ok_or_else(|| anyhow!("call '{}' has no destination", s))?;
        let operation = parts
            .next()
            .filter(|part| !part.is_empty())
            .ok_or_else(|| anyhow!("call '{}' has no operation", s))?;
        let payload = match parts.next() {
            None | Some("") => Value::Null,
            Some(raw) => serde_json::from_str(raw)
                .with_context(|| format!("call '{}' has an invalid JSON payload", s))?,
        };

        Ok(Self {
            destination: destination.to_string(),
            operation: operation.to_string(),
            payload,
        })
    }
}

/// What gets printed for a finished call, one JSON line each.
#[derive(Debug, Serialize)]
pub struct CallOutcome {
    pub destination: String,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallOutcome {
    fn new(call: &PlannedCall, outcome: Result<Value, String>) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(message) => (None, Some(message)),
        };
        Self {
            destination: call.destination.clone(),
            operation: call.operation.clone(),
            result,
            error,
        }
    }
}

/// Run one call to completion. Failures are reported in the outcome rather
/// than returned, so one bad call does not stop the others.
pub async fn perform(agent: &dyn RpcAgent, call: &PlannedCall) -> CallOutcome {
    let payload = match serde_json::to_vec(&call.payload) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => return CallOutcome::new(call, Err(e.to_string())),
    };

    debug!("Calling '{}' on '{}'", call.operation, call.destination);
    let outcome = agent
        .invoke_sync(&call.destination, &call.operation, payload)
        .await
        .map(|reply| {
            serde_json::from_slice(reply.payload()).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(reply.payload()).into_owned())
            })
        })
        .map_err(|e| e.to_string());
    CallOutcome::new(call, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_call() {
        let call: PlannedCall = "w1:add:[2,3]".parse().unwrap();
        assert_eq!(call.destination, "w1");
        assert_eq!(call.operation, "add");
        assert_eq!(call.payload, json!([2, 3]));
    }

    #[test]
    fn test_parse_call_payload_with_colons() {
        let call: PlannedCall = r#"w1:echo:{"url":"http://x"}"#.parse().unwrap();
        assert_eq!(call.payload, json!({ "url": "http://x" }));
    }

    #[test]
    fn test_parse_call_without_payload() {
        let call: PlannedCall = "w1:ping".parse().unwrap();
        assert_eq!(call.payload, Value::Null);
        let call: PlannedCall = "w1:ping:".parse().unwrap();
        assert_eq!(call.payload, Value::Null);
    }

    #[test]
    fn test_parse_call_rejects_malformed() {
        assert!("".parse::<PlannedCall>().is_err());
        assert!("w1".parse::<PlannedCall>().is_err());
        assert!(":add:[1,2]".parse::<PlannedCall>().is_err());
        assert!("w1::[1,2]".parse::<PlannedCall>().is_err());
        assert!("w1:add:[1,".parse::<PlannedCall>().is_err());
    }

    #[test]
    fn test_outcome_serialization_skips_missing_fields() {
        let call: PlannedCall = "w1:add:[2,3]".parse().unwrap();

        let ok = CallOutcome::new(&call, Ok(json!(5)));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({ "destination": "w1", "operation": "add", "result": 5 })
        );

        let failed = CallOutcome::new(&call, Err("boom".to_string()));
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({ "destination": "w1", "operation": "add", "error": "boom" })
        );
    }
}
