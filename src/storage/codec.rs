//! Encoding of persisted values: bincode, then zstd at level 3.

use serde::{de::DeserializeOwned, Serialize};

use crate::core::errors::{Result, SchedulerError};

const COMPRESSION_LEVEL: i32 = 3;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let serialized = bincode::serialize(value)?;
    zstd::encode_all(&serialized[..], COMPRESSION_LEVEL)
        .map_err(|e| SchedulerError::Serialization(format!("compression failed: {}", e)))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let raw = zstd::decode_all(bytes)
        .map_err(|e| SchedulerError::Serialization(format!("decompression failed: {}", e)))?;
    Ok(bincode::deserialize(&raw)?)
}
