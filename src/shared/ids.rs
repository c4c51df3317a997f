use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const THREAD_SUFFIX_SPACE: u32 = 36 * 36 * 36 * 36;

pub fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err(format!(
        "{kind} must use only ASCII letters, digits, '-' or '_'"
    ))
}

macro_rules! define_id_type {
    ($name:ident, $kind:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> Result<Self, String> {
                validate_identifier_value($kind, raw)?;
                Ok(Self(raw.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                self.as_str()
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = String;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let raw = String::deserialize(deserializer)?;
                Self::parse(&raw).map_err(|err| {
                    D::Error::custom(format!("invalid {} `{}`: {}", $kind, raw, err))
                })
            }
        }
    };
}

define_id_type!(ThreadId, "thread id");
define_id_type!(UserId, "user id");
define_id_type!(CapabilityId, "capability id");
define_id_type!(StepId, "step id");
define_id_type!(WorkflowType, "workflow type");

fn base36_encode_u64(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut chars = Vec::new();
    while value > 0 {
        chars.push(BASE36_ALPHABET[(value % 36) as usize] as char);
        value /= 36;
    }
    chars.iter().rev().collect()
}

fn base36_encode_fixed_u32(mut value: u32, width: usize) -> String {
    let mut chars = vec!['0'; width];
    for idx in (0..width).rev() {
        chars[idx] = BASE36_ALPHABET[(value % 36) as usize] as char;
        value /= 36;
    }
    chars.into_iter().collect()
}

/// Compact, sortable-by-time thread id: `thr-<base36 millis>-<4 random base36>`.
pub fn generate_thread_id(now_ms: i64) -> Result<ThreadId, String> {
    let timestamp = u64::try_from(now_ms)
        .map_err(|_| "thread id generation requires a non-negative timestamp".to_string())?;
    let mut bytes = [0_u8; 4];
    getrandom::getrandom(&mut bytes)
        .map_err(|err| format!("failed to generate thread id randomness: {err}"))?;
    let sample = u32::from_le_bytes(bytes) % THREAD_SUFFIX_SPACE;
    ThreadId::parse(&format!(
        "thr-{}-{}",
        base36_encode_u64(timestamp),
        base36_encode_fixed_u32(sample, 4)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_reject_empty_and_punctuated_values() {
        assert!(ThreadId::parse("").is_err());
        assert!(StepId::parse("draft policy").is_err());
        assert!(CapabilityId::parse("framework_advisor-v2").is_ok());
    }

    #[test]
    fn ids_deserialize_through_validation() {
        let parsed: UserId = serde_json::from_str("\"user-7\"").expect("valid id");
        assert_eq!(parsed.as_str(), "user-7");

        let err = serde_json::from_str::<UserId>("\"user/7\"").expect_err("invalid id");
        assert!(err.to_string().contains("invalid user id"));
    }

    #[test]
    fn generated_thread_ids_are_valid_and_prefixed() {
        let id = generate_thread_id(1_700_000_000_000).expect("thread id");
        assert!(id.as_str().starts_with("thr-"));
        assert_eq!(id.as_str().rsplit('-').next().map(str::len), Some(4));
        assert!(generate_thread_id(-1).is_err());
    }
}
