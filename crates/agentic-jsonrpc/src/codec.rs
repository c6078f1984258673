//! Message classification and newline-delimited framing.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{CodecError, CodecResult};
use crate::message::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    JSONRPC_VERSION,
};

/// Classify a raw decoded value into exactly one JSON-RPC shape.
///
/// The shape is decided from the keys present before any field is decoded,
/// so an object carrying both `result` and `error`, or a `method` together
/// with a `result`, is rejected instead of matching whichever variant
/// happens to deserialize first.
pub fn classify(value: Value) -> CodecResult<JsonRpcMessage> {
    let Value::Object(map) = &value else {
        return Err(CodecError::Malformed("expected a JSON object".to_string()));
    };

    match map.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(other) => return Err(CodecError::InvalidVersion(other.to_string())),
        None => {
            return Err(CodecError::Malformed(
                "missing \"jsonrpc\" field".to_string(),
            ))
        }
    }

    let has_id = map.contains_key("id");
    let has_method = map.contains_key("method");
    let has_result = map.contains_key("result");
    let has_error = map.contains_key("error");

    let message = match (has_method, has_id, has_result, has_error) {
        (true, true, false, false) => JsonRpcMessage::Request(decode::<JsonRpcRequest>(value)?),
        (true, false, false, false) => {
            JsonRpcMessage::Notification(decode::<JsonRpcNotification>(value)?)
        }
        (false, true, true, false) => JsonRpcMessage::Response(decode::<JsonRpcResponse>(value)?),
        (false, true, false, true) => JsonRpcMessage::Error(decode::<JsonRpcError>(value)?),
        _ => {
            tracing::trace!("Unclassifiable message: {value}");
            return Err(CodecError::Malformed(
                "message does not match any JSON-RPC 2.0 shape".to_string(),
            ));
        }
    };

    Ok(message)
}

fn decode<T: DeserializeOwned>(value: Value) -> CodecResult<T> {
    serde_json::from_value(value).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Parse a single line of text into a raw JSON value.
pub fn parse_line(line: &str) -> CodecResult<Value> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(CodecError::Empty);
    }

    Ok(serde_json::from_str(trimmed)?)
}

/// Parse and classify a single line.
pub fn decode_line(line: &str) -> CodecResult<JsonRpcMessage> {
    classify(parse_line(line)?)
}

/// Serialize a message to a JSON line (with trailing newline).
pub fn frame_message(message: &JsonRpcMessage) -> CodecResult<String> {
    let mut json = serde_json::to_string(message)?;
    json.push('\n');
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RequestId;
    use serde_json::json;

    #[test]
    fn test_classify_request() {
        let msg = classify(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})).unwrap();
        match msg {
            JsonRpcMessage::Request(r) => {
                assert_eq!(r.id, RequestId::Number(1));
                assert_eq!(r.method, "ping");
                assert!(r.params.is_none());
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_notification() {
        let msg = classify(json!({
            "jsonrpc": "2.0",
            "method": "notifications/cancelled",
            "params": {"requestId": "a"}
        }))
        .unwrap();
        assert!(matches!(msg, JsonRpcMessage::Notification(_)));
        assert!(msg.id().is_none());
    }

    #[test]
    fn test_classify_responses() {
        let ok = classify(json!({"jsonrpc": "2.0", "id": "x", "result": {}})).unwrap();
        assert!(matches!(ok, JsonRpcMessage::Response(_)));

        let err = classify(json!({
            "jsonrpc": "2.0",
            "id": 4,
            "error": {"code": -32601, "message": "Method not found"}
        }))
        .unwrap();
        match err {
            JsonRpcMessage::Error(e) => assert_eq!(e.error.code, -32601),
            other => panic!("expected error response, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_ambiguous_and_foreign_shapes() {
        assert!(classify(json!({"jsonrpc": "2.0", "id": 1, "result": 1, "error": {}})).is_err());
        assert!(classify(json!({"jsonrpc": "2.0", "id": 1, "method": "m", "result": 1})).is_err());
        assert!(classify(json!({"jsonrpc": "2.0"})).is_err());
        assert!(classify(json!([1, 2, 3])).is_err());
        assert!(classify(json!({"id": 1, "method": "ping"})).is_err());
        assert!(matches!(
            classify(json!({"jsonrpc": "1.0", "id": 1, "method": "ping"})),
            Err(CodecError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_rejects_null_id() {
        let result = classify(json!({"jsonrpc": "2.0", "id": null, "method": "ping"}));
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_parse_line_errors() {
        assert!(matches!(parse_line("   "), Err(CodecError::Empty)));
        let err = parse_line(r#"{"broken":"#).unwrap_err();
        assert_eq!(err.code(), -32700);
        assert!(decode_line(r#"{"jsonrpc":"2.0","id":1,"method":"#).is_err());
    }

    #[test]
    fn test_frame_message_appends_newline() {
        let msg = JsonRpcMessage::from(JsonRpcResponse::new(RequestId::Number(1), json!({})));
        let framed = frame_message(&msg).unwrap();
        assert!(framed.ends_with('\n'));
        assert_eq!(framed.matches('\n').count(), 1);
        let back = decode_line(&framed).unwrap();
        assert_eq!(back, msg);
    }
}
