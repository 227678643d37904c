//! Turning bus messages into the values a sink writes.

use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use thiserror::Error;

use crate::bus::Message;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid payload: {0}")]
    Invalid(String),
}

pub trait Decoder<T>: Send + Sync + 'static {
    fn decode(&self, message: &Message) -> Result<T, CodecError>;
}

/// Decodes the payload as JSON.
pub struct JsonDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDecoder<T> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned + 'static> Decoder<T> for JsonDecoder<T> {
    fn decode(&self, message: &Message) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(&message.payload)?)
    }
}

/// Passes the raw payload through; rejects empty payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawDecoder;

impl Decoder<Vec<u8>> for RawDecoder {
    fn decode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        if message.payload.is_empty() {
            return Err(CodecError::Invalid("empty payload".into()));
        }
        Ok(message.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Event {
        key: String,
        at: i64,
    }

    #[test]
    fn test_json_decoder() {
        let decoder = JsonDecoder::<Event>::new();
        let msg = Message::new("m1", br#"{"key":"k1","at":5}"#.to_vec());
        assert_eq!(
            decoder.decode(&msg).unwrap(),
            Event {
                key: "k1".into(),
                at: 5
            }
        );

        let bad = Message::new("m2", b"not json".to_vec());
        assert!(matches!(decoder.decode(&bad), Err(CodecError::Json(_))));
    }

    #[test]
    fn test_raw_decoder_rejects_empty() {
        assert!(RawDecoder.decode(&Message::new("m", Vec::new())).is_err());
        assert_eq!(RawDecoder.decode(&Message::new("m", b"x".to_vec())).unwrap(), b"x".to_vec());
    }
}
