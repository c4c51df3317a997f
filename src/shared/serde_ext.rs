use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// Deserialize a string and run it through a domain parser, keeping the raw text in the error.
pub fn parse_via_string<'de, D, T, F>(deserializer: D, kind: &str, parser: F) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    F: FnOnce(&str) -> Result<T, String>,
{
    let raw = String::deserialize(deserializer)?;
    parser(&raw).map_err(|err| D::Error::custom(format!("invalid {kind} `{raw}`: {err}")))
}

/// Values that must lie in `[0, 1]`, such as agent confidence.
pub fn deserialize_unit_interval<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(D::Error::custom(format!(
            "value {value} must be within [0, 1]"
        )))
    }
}
