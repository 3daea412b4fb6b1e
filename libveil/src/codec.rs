use crate::error::VeilResult;
use serde::de::DeserializeOwned;
use serde::Serialize;

// all persisted/wire types funnel through here so the codec stays swappable

pub fn encode<T: Serialize>(value: &T) -> VeilResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> VeilResult<T> {
    Ok(bincode::deserialize(bytes)?)
}

pub fn encoded_len<T: Serialize>(value: &T) -> VeilResult<u64> {
    Ok(bincode::serialized_size(value)?)
}
