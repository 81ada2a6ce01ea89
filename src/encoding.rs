//! Serde helpers for byte payloads in persisted JSON records.

/// Serialize `Vec<u8>` fields as standard base64 strings.
pub mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| D::Error::custom(format!("invalid base64: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        #[serde(with = "super::base64_bytes")]
        bytes: Vec<u8>,
    }

    #[test]
    fn test_bytes_encode_as_base64_string() {
        let payload = Payload {
            bytes: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"bytes":"3q2+7w=="}"#);
        assert_eq!(serde_json::from_str::<Payload>(&json).unwrap(), payload);
    }

    #[test]
    fn test_rejects_invalid_base64() {
        assert!(serde_json::from_str::<Payload>(r#"{"bytes":"***"}"#).is_err());
    }
}
