use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Serialization of structured values into frame payloads
pub trait Codec: Send + Sync + 'static {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> anyhow::Result<Bytes>;

    /// `None` if the payload is not a valid representation of `T`
    fn deserialize<T: DeserializeOwned>(&self, payload: &[u8]) -> Option<T>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> anyhow::Result<Bytes> {
        Ok(serde_json::to_vec(value)?.into())
    }

    fn deserialize<T: DeserializeOwned>(&self, payload: &[u8]) -> Option<T> {
        match serde_json::from_slice(payload) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("failed to deserialize payload: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Greeting {
        text: String,
        count: u32,
    }

    #[test]
    fn test_json() {
        let value = Greeting { text: "hi".to_string(), count: 3 };
        let payload = JsonCodec.serialize(&value).unwrap();
        assert_eq!(payload.as_ref(), br#"{"text":"hi","count":3}"#);
        assert_eq!(JsonCodec.deserialize::<Greeting>(&payload), Some(value));
    }

    #[test]
    fn test_deserialize_invalid() {
        assert_eq!(JsonCodec.deserialize::<Greeting>(b"not json"), None);
        assert_eq!(JsonCodec.deserialize::<Greeting>(br#"{"text":"hi"}"#), None);
    }
}
