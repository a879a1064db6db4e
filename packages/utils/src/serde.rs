//! This module provides custom serde implementations.

/// Serialize a number as a string.
pub mod number_as_string {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Implements the serde `serialize` function for a number.
    /// # Errors
    /// Returns an error if the number cannot be serialized.
    pub fn serialize<T, S>(number: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: ToString,
        S: Serializer,
    {
        serializer.serialize_str(&number.to_string())
    }

    /// Implements the serde `deserialize` function for a number.
    /// # Errors
    /// Returns an error if the string cannot be deserialized to a number.
    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "super::number_as_string")]
        amount: u64,
    }

    #[test]
    fn sample_uses_string_amount() {
        let sample = Sample { amount: 2222 };
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json, serde_json::json!({ "amount": "2222" }));

        let parsed: Sample = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, sample);
    }

    #[test]
    fn non_numeric_string_is_rejected() {
        let err = serde_json::from_value::<Sample>(serde_json::json!({ "amount": "abc" }));
        assert!(err.is_err());
    }
}
