use bitcoin::hex::{DisplayHex, FromHex};
use bitcoin::secp256k1;
use rand::thread_rng;
use serde::Deserialize;
use std::time::{SystemTime, UNIX_EPOCH};

pub static EC: once_cell::sync::Lazy<secp256k1::Secp256k1<secp256k1::All>> =
    once_cell::sync::Lazy::new(|| {
        let mut ctx = secp256k1::Secp256k1::new();
        let mut rng = thread_rng();
        ctx.randomize(&mut rng);
        ctx
    });

/// Unix time in seconds, used for `time_fetched` stamps.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Serde helpers for `Option<Vec<u8>>` fields rendered as hex strings.
pub mod serde_opt_hex {
    use super::*;

    pub fn serialize<S>(
        buffer: &Option<Vec<u8>>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match buffer {
            Some(bytes) => serializer.serialize_some(&bytes.to_lower_hex_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<u8>>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let string: Option<String> = Option::deserialize(deserializer)?;
        match string {
            Some(string) => Vec::<u8>::from_hex(&string)
                .map(Some)
                .map_err(|err| Error::custom(err.to_string())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct WithHex {
        #[serde(with = "serde_opt_hex", default)]
        bytes: Option<Vec<u8>>,
    }

    #[test]
    fn test_serde_opt_hex() {
        let value = WithHex {
            bytes: Some(vec![0xde, 0xad, 0xbe, 0xef]),
        };
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"bytes":"deadbeef"}"#);
        assert_eq!(serde_json::from_str::<WithHex>(&json).unwrap(), value);

        let none = WithHex { bytes: None };
        let json = serde_json::to_string(&none).unwrap();
        assert_eq!(serde_json::from_str::<WithHex>(&json).unwrap(), none);
    }
}
