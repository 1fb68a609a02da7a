// Serde helpers for wire formats.
//
// uint256 amounts arrive from the chain as decimal strings since JSON numbers
// cannot carry 18-decimal base units. These helpers keep the in-memory type a
// plain u128 while accepting both encodings.

use serde::{de, Deserializer, Serializer};
use std::fmt;

use crate::fund::Amount;

pub mod amount_string {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Amount, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        struct AmountVisitor;

        impl<'de> de::Visitor<'de> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a decimal string or unsigned integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
                v.parse::<u128>().map_err(de::Error::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
                Ok(v as u128)
            }

            fn visit_u128<E: de::Error>(self, v: u128) -> Result<Amount, E> {
                Ok(v)
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "super::amount_string")]
        value: u128,
    }

    #[test]
    fn accepts_string_and_number() {
        let w: Wrapper = serde_json::from_str(r#"{"value": "10000000000000000000000"}"#).unwrap();
        assert_eq!(w.value, 10_000_000_000_000_000_000_000);

        let w: Wrapper = serde_json::from_str(r#"{"value": 1000}"#).unwrap();
        assert_eq!(w.value, 1000);
    }

    #[test]
    fn serializes_as_string() {
        let w = Wrapper {
            value: 42_000_000_000_000_000_000,
        };
        assert_eq!(
            serde_json::to_string(&w).unwrap(),
            r#"{"value":"42000000000000000000"}"#
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(serde_json::from_str::<Wrapper>(r#"{"value": "abc"}"#).is_err());
        assert!(serde_json::from_str::<Wrapper>(r#"{"value": -5}"#).is_err());
    }
}
