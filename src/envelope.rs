use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// The `{timestamp, data}` wrapper every value written by the cache engine
/// carries. Serialized as a self-describing JSON text record so that a
/// legacy unwrapped value (plain bytes that don't parse as an envelope) can
/// still be read back and treated as timestamp 0.
///
/// `data` and the encoded envelope are both `Bytes`: the same payload is
/// cloned once per fan-out target on every SET/Replicate, and `Bytes`
/// clones are a refcount bump rather than a copy.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub timestamp: u64,
    #[serde(with = "data_as_base64")]
    pub data: Bytes,
}

impl Envelope {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Envelope {
            timestamp: now_ms(),
            data: data.into(),
        }
    }

    pub fn with_timestamp(timestamp: u64, data: impl Into<Bytes>) -> Self {
        Envelope {
            timestamp,
            data: data.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).expect("envelope serialization is infallible"))
    }

    /// Decode bytes produced either by [`Envelope::encode`] or by a legacy
    /// writer that stored raw, unwrapped bytes. Legacy values decode with
    /// timestamp 0, per the tolerate-on-read invariant in the data model.
    pub fn decode(bytes: &Bytes) -> Envelope {
        match serde_json::from_slice::<Envelope>(bytes) {
            Ok(env) => env,
            Err(_) => Envelope {
                timestamp: 0,
                data: bytes.clone(),
            },
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as u64
}

mod data_as_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD
            .decode(&s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let env = Envelope::with_timestamp(1234, Bytes::from_static(b"hello world"));
        let bytes = env.encode();
        let decoded = Envelope::decode(&bytes);
        assert_eq!(decoded, env);
    }

    #[test]
    fn legacy_unwrapped_value_decodes_as_timestamp_zero() {
        let decoded = Envelope::decode(&Bytes::from_static(b"just some raw bytes"));
        assert_eq!(decoded.timestamp, 0);
        assert_eq!(decoded.data, Bytes::from_static(b"just some raw bytes"));
    }

    #[test]
    fn round_trips_arbitrary_binary_data() {
        let data: Bytes = (0..=255u16).map(|b| b as u8).collect::<Vec<u8>>().into();
        let env = Envelope::with_timestamp(42, data.clone());
        let decoded = Envelope::decode(&env.encode());
        assert_eq!(decoded.data, data);
    }
}
