//! Built-in state codecs.

use crate::error::StateResult;
use crate::traits::{StateCodec, StateValue};

/// Compact binary encoding (default).
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl<T: StateValue> StateCodec<T> for BincodeCodec {
    fn encode(&self, value: &T) -> StateResult<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> StateResult<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// JSON encoding, for state that other tools need to read.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T: StateValue> StateCodec<T> for JsonCodec {
    fn encode(&self, value: &T) -> StateResult<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> StateResult<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
