//! JSON message codec

use crate::error::{QueueError, QueueResult};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize an application value into a message body
pub fn encode<T: Serialize + ?Sized>(message: &T) -> QueueResult<Bytes> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(QueueError::Encode)
}

/// Deserialize a message body back into an application value
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> QueueResult<T> {
    serde_json::from_slice(payload).map_err(QueueError::Decode)
}

/// Render a payload for log output without failing on binary data
pub fn display_payload(payload: &[u8]) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    #[test]
    fn test_round_trip_nested_value() {
        let original = json!({
            "name": "order-created",
            "amount": 42.5,
            "count": 7,
            "paid": true,
            "meta": { "region": "eu", "tags": ["a", "b"], "retry": null }
        });

        let bytes = encode(&original).unwrap();
        let decoded: Value = decode(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_plain_string_is_json_quoted() {
        let bytes = encode("a").unwrap();
        assert_eq!(&bytes[..], b"\"a\"");
    }

    #[test]
    fn test_encode_error() {
        // Non-string map keys cannot be represented in JSON
        let mut map = BTreeMap::new();
        map.insert(vec![1u8], 1u8);
        assert!(matches!(encode(&map), Err(QueueError::Encode(_))));
    }

    #[test]
    fn test_decode_error() {
        let result: QueueResult<Value> = decode(b"{not json");
        assert!(matches!(result, Err(QueueError::Decode(_))));
    }

    #[test]
    fn test_display_payload_binary() {
        assert_eq!(display_payload(b"ok"), "ok");
        assert_eq!(display_payload(&[0xff, b'x']), "\u{fffd}x");
    }

    proptest! {
        #[test]
        fn prop_string_map_round_trip(entries in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..16)) {
            let bytes = encode(&entries).unwrap();
            let decoded: BTreeMap<String, i64> = decode(&bytes).unwrap();
            prop_assert_eq!(decoded, entries);
        }
    }
}
