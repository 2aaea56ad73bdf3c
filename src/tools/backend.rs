use schemars::JsonSchema;
use serde::Deserialize;

/// Replace the active backend.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SwitchBackendRequest {
    /// "local" (model server on this machine) or "hosted" (remote hosted models).
    pub backend: String,
}

/// Persist the model used by `review` when none is given.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SelectModelRequest {
    /// Model name exactly as returned by `listmodels`.
    pub model: String,
}
