//! Serializable pipeline progress.
//!
//! A checkpoint never holds live handles. Every stage turns its own state
//! into a [`StageState`] (a JSON value whose shape only that stage knows) and
//! the chain collects them by stage name together with its execution stack.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;

/// Opaque state of one stage.
pub type StageState = serde_json::Value;

/// Progress of a whole [`PipelineChain`](crate::PipelineChain).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCheckpoint {
    /// Stage name to that stage's own state.
    pub stages: BTreeMap<String, StageState>,
    /// Names of the stages that were active, bottom of the stack first.
    pub execution_stack: Vec<String>,
    /// Bytes injected into the chain but not yet handed to the first stage.
    #[serde(with = "b64")]
    pub pending_input: Vec<u8>,
    pub input_eof: bool,
    pub eof_forwarded: bool,
    pub finished: bool,
}

impl PipelineCheckpoint {
    pub fn to_json(&self) -> Result<String, CheckpointError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CheckpointError> {
        Ok(serde_json::from_str(json)?)
    }
}

pub(crate) fn save<T: Serialize>(state: &T) -> Result<StageState, CheckpointError> {
    Ok(serde_json::to_value(state)?)
}

pub(crate) fn load<T: DeserializeOwned>(state: StageState) -> Result<T, CheckpointError> {
    Ok(serde_json::from_value(state)?)
}

/// Base64 encoding for byte buffers inside checkpoints.
pub(crate) mod b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: for<'a> From<&'a [u8]>,
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        Ok(T::from(&decoded[..]))
    }
}
