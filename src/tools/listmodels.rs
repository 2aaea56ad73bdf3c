use serde::Serialize;

use crate::dispatch::ModelId;
use crate::scope::ReviewCriterion;

#[derive(Debug, Serialize)]
pub struct ModelListing {
    pub backend: String,
    pub models: Vec<ModelId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected: Option<ModelId>,
    pub criteria: Vec<ReviewCriterion>,
}

impl ModelListing {
    /// Render as a markdown list with the selection marked.
    pub fn to_markdown(&self) -> String {
        let mut out = format!("## Models ({})\n\n", self.backend);
        if self.models.is_empty() {
            out.push_str("_no models available_\n");
        }
        for model in &self.models {
            let mark = if self.selected.as_deref() == Some(model.as_str()) {
                "(x)"
            } else {
                "( )"
            };
            out.push_str(&format!("- {mark} `{model}`\n"));
        }
        out.push_str("\n## Review criteria\n\n");
        for c in &self.criteria {
            let mark = if c.selected { "[x]" } else { "[ ]" };
            out.push_str(&format!("- {mark} {}\n", c.label));
        }
        out
    }
}
