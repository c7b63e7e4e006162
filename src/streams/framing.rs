//! Content-type normalization and JSON batch flattening/wrapping.

use serde_json::Value;

use super::store::StoreError;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Strip parameters (`;charset=...`) and lowercase a `Content-Type` header.
/// Empty input normalizes to [`DEFAULT_CONTENT_TYPE`].
pub fn normalize_content_type(raw: &str) -> String {
    let bare = raw.split(';').next().unwrap_or("").trim();
    if bare.is_empty() {
        DEFAULT_CONTENT_TYPE.to_string()
    } else {
        bare.to_ascii_lowercase()
    }
}

pub fn is_json_content_type(normalized: &str) -> bool {
    normalized == JSON_CONTENT_TYPE || normalized.ends_with("+json")
}

/// Split an append body into individual stored-message payloads.
///
/// For JSON streams: the body must parse as JSON. A top-level array is
/// flattened one level (each element re-serialized as its own message); any
/// other JSON value is stored as a single message. An empty top-level array
/// is rejected with [`StoreError::EmptyArrayNotAllowed`] (append path only —
/// initial-data-on-create calls this with `allow_empty_array = true`).
///
/// For non-JSON streams the body is stored verbatim as one message.
pub fn split_append_body(
    is_json: bool,
    body: Vec<u8>,
    allow_empty_array: bool,
) -> Result<Vec<Vec<u8>>, StoreError> {
    if !is_json {
        return Ok(vec![body]);
    }

    let value: Value = serde_json::from_slice(&body)
        .map_err(|e| StoreError::InvalidJson(e.to_string()))?;

    match value {
        Value::Array(items) => {
            if items.is_empty() {
                if allow_empty_array {
                    return Ok(vec![]);
                }
                return Err(StoreError::EmptyArrayNotAllowed);
            }
            items
                .into_iter()
                .map(|v| serde_json::to_vec(&v).map_err(|e| StoreError::InvalidJson(e.to_string())))
                .collect()
        }
        other => Ok(vec![
            serde_json::to_vec(&other).map_err(|e| StoreError::InvalidJson(e.to_string()))?,
        ]),
    }
}

/// Frame a read slice for the wire. JSON streams are wrapped in an outer
/// array, with commas inserted between messages; non-JSON streams are
/// concatenated verbatim.
pub fn format_response(is_json: bool, messages: &[Vec<u8>]) -> Vec<u8> {
    if !is_json {
        return messages.iter().flat_map(|m| m.iter().copied()).collect();
    }

    let mut out = Vec::with_capacity(messages.iter().map(|m| m.len() + 1).sum::<usize>() + 2);
    out.push(b'[');
    for (i, msg) in messages.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        out.extend_from_slice(msg);
    }
    out.push(b']');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_params_and_lowercases() {
        assert_eq!(
            normalize_content_type("Application/JSON; charset=utf-8"),
            "application/json"
        );
    }

    #[test]
    fn normalize_empty_is_octet_stream() {
        assert_eq!(normalize_content_type(""), DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn split_array_flattens_one_level() {
        let body = br#"[{"a":1},{"a":2}]"#.to_vec();
        let parts = split_append_body(true, body, false).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], br#"{"a":1}"#);
    }

    #[test]
    fn split_single_value_is_one_message() {
        let body = br#"{"a":1}"#.to_vec();
        let parts = split_append_body(true, body, false).unwrap();
        assert_eq!(parts.len(), 1);
    }

    #[test]
    fn split_empty_array_on_append_rejected() {
        let body = b"[]".to_vec();
        assert!(matches!(
            split_append_body(true, body, false),
            Err(StoreError::EmptyArrayNotAllowed)
        ));
    }

    #[test]
    fn split_empty_array_on_create_allowed() {
        let body = b"[]".to_vec();
        let parts = split_append_body(true, body, true).unwrap();
        assert!(parts.is_empty());
    }

    #[test]
    fn split_invalid_json_rejected() {
        let body = b"not json".to_vec();
        assert!(matches!(
            split_append_body(true, body, false),
            Err(StoreError::InvalidJson(_))
        ));
    }

    #[test]
    fn format_response_wraps_json_with_commas() {
        let messages = vec![br#"{"a":1}"#.to_vec(), br#"{"a":2}"#.to_vec()];
        let out = format_response(true, &messages);
        assert_eq!(out, br#"[{"a":1},{"a":2}]"#);
    }

    #[test]
    fn format_response_empty_json_is_empty_array() {
        let out = format_response(true, &[]);
        assert_eq!(out, b"[]");
    }

    #[test]
    fn format_response_non_json_concatenates() {
        let messages = vec![b"hello".to_vec(), b"world".to_vec()];
        let out = format_response(false, &messages);
        assert_eq!(out, b"helloworld");
    }
}
