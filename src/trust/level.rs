use crate::shared::serde_ext::parse_via_string;
use serde::{Deserialize, Deserializer, Serialize};

/// Ordinal autonomy tier; ordering follows declaration order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    #[default]
    Observational,
    Suggestive,
    Collaborative,
    Autonomous,
}

impl TrustLevel {
    pub const ALL: [TrustLevel; 4] = [
        TrustLevel::Observational,
        TrustLevel::Suggestive,
        TrustLevel::Collaborative,
        TrustLevel::Autonomous,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TrustLevel::Observational => "observational",
            TrustLevel::Suggestive => "suggestive",
            TrustLevel::Collaborative => "collaborative",
            TrustLevel::Autonomous => "autonomous",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == normalized)
            .ok_or_else(|| {
                "expected one of observational, suggestive, collaborative, autonomous".to_string()
            })
    }
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TrustLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        parse_via_string(deserializer, "trust level", Self::parse)
    }
}
