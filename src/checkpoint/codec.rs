use super::CheckpointError;
use crate::state::WorkflowState;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Bump when the persisted layout changes; older envelopes must stay decodable.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeRef<'a> {
    schema_version: u32,
    state: &'a WorkflowState,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default = "legacy_schema_version")]
    schema_version: u32,
    state: WorkflowState,
}

fn legacy_schema_version() -> u32 {
    1
}

pub fn encode_state(state: &WorkflowState) -> Result<String, CheckpointError> {
    serde_json::to_string(&EnvelopeRef {
        schema_version: CHECKPOINT_SCHEMA_VERSION,
        state,
    })
    .map_err(|source| CheckpointError::Encode { source })
}

pub fn decode_state(raw: &str) -> Result<WorkflowState, CheckpointError> {
    let envelope: Envelope =
        serde_json::from_str(raw).map_err(|source| CheckpointError::Decode { source })?;
    if envelope.schema_version > CHECKPOINT_SCHEMA_VERSION {
        return Err(CheckpointError::UnsupportedSchema {
            found: envelope.schema_version,
            supported: CHECKPOINT_SCHEMA_VERSION,
        });
    }
    Ok(envelope.state)
}

pub fn state_digest(encoded: &str) -> String {
    let digest = Sha256::digest(encoded.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}
