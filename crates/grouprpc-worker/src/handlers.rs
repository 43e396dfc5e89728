//! Operations every worker serves.

use grouprpc::{DispatchError, OperationRegistry};
use serde_json::{json, Value};

/// Registry with `echo`, `add` and `ping`.
///
/// - `echo` returns the request payload unchanged.
/// - `add` takes a JSON pair `[a, b]` of integers and returns their sum.
/// - `ping` ignores its payload and reports which worker answered.
pub fn builtin_operations(worker_name: &str) -> OperationRegistry {
    let name = worker_name.to_string();
    let mut registry = OperationRegistry::new();
    registry
        .register("echo", Ok)
        .register_json("add", |(a, b): (i64, i64)| {
            a.checked_add(b)
                .ok_or_else(|| DispatchError::Failed(format!("{} + {} overflows", a, b)))
        })
        .register_json("ping", move |_: Value| {
            Ok(json!({ "worker": name, "pong": true }))
        });
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use grouprpc::Dispatch;

    #[test]
    fn test_builtin_operation_names() {
        assert_eq!(
            builtin_operations("w0").operations(),
            vec!["add", "echo", "ping"]
        );
    }

    #[test]
    fn test_add() {
        let result = builtin_operations("w0").dispatch("add", Bytes::from_static(b"[2,3]"));
        assert_eq!(result, Ok(Bytes::from_static(b"5")));
    }

    #[test]
    fn test_add_overflow_and_bad_payload() {
        let registry = builtin_operations("w0");

        let overflow = registry.dispatch("add", Bytes::from(format!("[{},1]", i64::MAX)));
        assert!(matches!(overflow, Err(DispatchError::Failed(_))));

        let bad = registry.dispatch("add", Bytes::from_static(b"\"two\""));
        assert!(matches!(bad, Err(DispatchError::InvalidPayload(_))));
    }

    #[test]
    fn test_ping_names_the_worker() {
        let reply = builtin_operations("w7")
            .dispatch("ping", Bytes::from_static(b"null"))
            .unwrap();
        let value: Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(value, json!({ "worker": "w7", "pong": true }));
    }

    #[test]
    fn test_echo() {
        let result = builtin_operations("w0").dispatch("echo", Bytes::from_static(b"{\"x\":1}"));
        assert_eq!(result, Ok(Bytes::from_static(b"{\"x\":1}")));
    }
}
