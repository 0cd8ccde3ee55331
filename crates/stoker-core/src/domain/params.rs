//! Parameter codec: job parameters are stored as serialized JSON strings,
//! the same encoding the enqueue path uses.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StokerError;

pub struct ParameterCodec;

impl ParameterCodec {
    pub fn encode<T: Serialize>(name: &str, value: &T) -> Result<String, StokerError> {
        serde_json::to_string(value).map_err(|source| StokerError::Serialization {
            name: name.to_string(),
            source,
        })
    }

    pub fn decode<T: DeserializeOwned>(name: &str, raw: &str) -> Result<T, StokerError> {
        serde_json::from_str(raw).map_err(|source| StokerError::Serialization {
            name: name.to_string(),
            source,
        })
    }
}
