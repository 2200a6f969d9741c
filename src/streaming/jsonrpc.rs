//! JSON-RPC control channel (component F).
//!
//! A single POST endpoint (`/streaming_jsonrpc`, wired up in
//! [`crate::server`]) exposing `<streamId>.subscribe` and
//! `<streamId>.unsubscribe`, namespaced by the currently active stream's
//! ID. Method/param shape and the "attempt every listed signal_id, never
//! break early on failure" semantics are resolved from the original
//! JSON-RPC handler.

use serde::Deserialize;
use serde_json::{json, Value};

use super::registry::{RegistryError, SampleSource, SignalRegistry};
use super::stream::StreamHandle;

const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Vec<String>,
}

enum Action {
    Subscribe,
    Unsubscribe,
}

/// Split `"<streamId>.subscribe"` into `(streamId, Action)`. Returns `None`
/// if the method doesn't have the `.subscribe`/`.unsubscribe` suffix.
fn parse_method(method: &str) -> Option<(&str, Action)> {
    if let Some(prefix) = method.strip_suffix(".subscribe") {
        Some((prefix, Action::Subscribe))
    } else if let Some(prefix) = method.strip_suffix(".unsubscribe") {
        Some((prefix, Action::Unsubscribe))
    } else {
        None
    }
}

/// Handle one JSON-RPC request body addressed to `stream`. Returns the full
/// JSON-RPC response object (success or `-32602` error), ready to be
/// written as the HTTP response body.
pub fn handle_request(
    body: &[u8],
    registry: &SignalRegistry,
    stream: &StreamHandle,
    source: &dyn SampleSource,
) -> Value {
    let req: JsonRpcRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(_) => return error_response(Value::Null, "malformed request"),
    };

    let Some((prefix, action)) = parse_method(&req.method) else {
        return error_response(req.id, "unknown method");
    };

    if prefix != stream.stream_id() {
        return error_response(req.id, "unknown stream");
    }

    // Every listed signal_id gets the side-effecting call attempted
    // unconditionally, regardless of where an earlier one failed — the
    // original loops until the params array is exhausted and never breaks
    // early, so a failure part-way through must not suppress later calls.
    let results: Vec<Result<(), RegistryError>> = req
        .params
        .iter()
        .map(|signal_id| match action {
            Action::Subscribe => registry.subscribe(stream, signal_id, source),
            Action::Unsubscribe => registry.unsubscribe(stream, signal_id, source),
        })
        .collect();

    if results.iter().all(Result::is_ok) {
        success_response(req.id)
    } else {
        error_response(req.id, "Invalid params")
    }
}

fn success_response(id: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": true,
    })
}

fn error_response(id: Value, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": INVALID_PARAMS, "message": message },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::packet::{DataType, Rule};
    use crate::streaming::registry::{SignalDefinition, SignalType};
    use crate::streaming::stream::{SendBackend, StreamHandle};

    struct NoopSource;
    impl SampleSource for NoopSource {}

    fn stream_with_id(id: &str) -> StreamHandle {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        drop(rx);
        StreamHandle::new(1, id, SendBackend::RawTcp, tx)
    }

    #[test]
    fn s2_subscribe_via_namespaced_method_returns_true() {
        let registry = SignalRegistry::new(12, 4, 32);
        registry
            .add_signal(SignalDefinition::new(
                "v1",
                Rule::Explicit,
                DataType::Int32,
                SignalType::Value,
            ))
            .unwrap();
        let stream = stream_with_id("abc12345");
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"abc12345.subscribe","params":["v1"]}"#;
        let resp = handle_request(body, &registry, &stream, &NoopSource);
        assert_eq!(resp["result"], true);
    }

    #[test]
    fn unknown_signal_yields_invalid_params_error() {
        let registry = SignalRegistry::new(12, 4, 32);
        let stream = stream_with_id("abc12345");
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"abc12345.subscribe","params":["nope"]}"#;
        let resp = handle_request(body, &registry, &stream, &NoopSource);
        assert_eq!(resp["error"]["code"], -32602);
    }

    #[test]
    fn wrong_stream_prefix_is_rejected() {
        let registry = SignalRegistry::new(12, 4, 32);
        let stream = stream_with_id("abc12345");
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"ffffffff.subscribe","params":[]}"#;
        let resp = handle_request(body, &registry, &stream, &NoopSource);
        assert_eq!(resp["error"]["code"], -32602);
    }
}
