//! Attribute encoding for physical stores

use crate::error::{CofferError, Result};
use crate::types::Attributes;

/// Converts attribute maps to and from the blobs a physical store persists.
pub trait ValueCodec: Send + Sync {
    fn encode_attributes(&self, attributes: &Attributes) -> Result<Vec<u8>>;

    fn decode_attributes(&self, bytes: &[u8]) -> Result<Attributes>;
}

/// JSON codec, the default
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn encode_attributes(&self, attributes: &Attributes) -> Result<Vec<u8>> {
        serde_json::to_vec(attributes).map_err(|e| CofferError::Serialization(e.to_string()))
    }

    fn decode_attributes(&self, bytes: &[u8]) -> Result<Attributes> {
        serde_json::from_slice(bytes).map_err(|e| CofferError::Serialization(e.to_string()))
    }
}
