use schemars::JsonSchema;
use serde::Deserialize;

/// Review one saved file with the active backend.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReviewRequest {
    /// Path of the file that was just saved. Relative paths resolve against `working_directory`.
    pub file_path: String,
    /// Absolute project root used to resolve a relative `file_path`.
    pub working_directory: Option<String>,
    /// Model from `listmodels`. Defaults to the selected model, then the first listed one.
    pub model: Option<String>,
    /// Review criteria labels. When given, they replace (and persist) the current selection.
    pub criteria: Option<Vec<String>>,
}

impl ReviewRequest {
    pub fn model_override(&self) -> Option<&str> {
        self.model.as_deref().filter(|m| !m.trim().is_empty())
    }
}
