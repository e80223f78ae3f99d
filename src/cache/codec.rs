//! Serialization contract between cached payloads and stored records.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Result;

/// Converts a payload to and from the JSON stored in a cache record.
///
/// A decode failure is treated by [`CacheStore`](super::CacheStore) as a
/// miss, so a codec can reject stale record shapes simply by erroring.
pub trait CacheCodec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<serde_json::Value>;
    fn decode(&self, value: serde_json::Value) -> Result<T>;
}

/// Codec for any serde-compatible payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> CacheCodec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(value)?)
    }

    fn decode(&self, value: serde_json::Value) -> Result<T> {
        Ok(serde_json::from_value(value)?)
    }
}
