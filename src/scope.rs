use std::sync::RwLock;

use schemars::JsonSchema;
use serde::Serialize;

/// Supplies the review criteria the user currently has checked.
pub trait ScopeProvider: Send + Sync {
    /// Labels of the selected criteria, in display order.
    fn selected_criteria(&self) -> Vec<String>;
}

/// Stock review dimensions offered to the user.
pub const DEFAULT_CRITERIA: &[&str] = &[
    "naming conventions",
    "comments",
    "exception handling",
    "duplicate code",
    "magic numbers",
    "design patterns",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct ReviewCriterion {
    pub label: String,
    pub selected: bool,
}

/// In-memory criteria list with a selection state per label.
///
/// Labels are unique; duplicates in the seed list are dropped.
#[derive(Debug)]
pub struct ReviewScope {
    items: RwLock<Vec<ReviewCriterion>>,
}

impl Default for ReviewScope {
    fn default() -> Self {
        Self::new(DEFAULT_CRITERIA.iter().copied())
    }
}

impl ReviewScope {
    /// All labels start unselected.
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut items: Vec<ReviewCriterion> = Vec::new();
        for label in labels {
            let label = label.into();
            if items.iter().any(|c| c.label == label) {
                continue;
            }
            items.push(ReviewCriterion {
                label,
                selected: false,
            });
        }
        Self {
            items: RwLock::new(items),
        }
    }

    /// Stock criteria, with `selected` labels checked. Selected labels that
    /// are not stock criteria are appended as custom criteria.
    pub fn with_selection(selected: &[String]) -> Self {
        let labels = DEFAULT_CRITERIA
            .iter()
            .map(|s| s.to_string())
            .chain(selected.iter().cloned());
        let scope = Self::new(labels);
        scope.select_only(selected);
        scope
    }

    pub fn items(&self) -> Vec<ReviewCriterion> {
        self.items.read().map(|g| g.clone()).unwrap_or_default()
    }

    /// Toggle a single label. Returns false if the label is unknown.
    pub fn set_selected(&self, label: &str, selected: bool) -> bool {
        let Ok(mut items) = self.items.write() else {
            return false;
        };
        match items.iter_mut().find(|c| c.label == label) {
            Some(item) => {
                item.selected = selected;
                true
            }
            None => false,
        }
    }

    /// Check exactly the given labels, uncheck everything else.
    pub fn select_only(&self, labels: &[String]) {
        if let Ok(mut items) = self.items.write() {
            for item in items.iter_mut() {
                item.selected = labels.contains(&item.label);
            }
        }
    }

    /// Like [`select_only`](Self::select_only), but labels not yet known are
    /// added as custom criteria first.
    pub fn replace_selection(&self, labels: &[String]) {
        if let Ok(mut items) = self.items.write() {
            for label in labels {
                if label.trim().is_empty() || items.iter().any(|c| &c.label == label) {
                    continue;
                }
                items.push(ReviewCriterion {
                    label: label.clone(),
                    selected: false,
                });
            }
            for item in items.iter_mut() {
                item.selected = labels.contains(&item.label);
            }
        }
    }
}

impl ScopeProvider for ReviewScope {
    fn selected_criteria(&self) -> Vec<String> {
        self.items
            .read()
            .map(|items| {
                items
                    .iter()
                    .filter(|c| c.selected)
                    .map(|c| c.label.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Fixed criteria list, useful for one-off reviews.
#[derive(Debug, Clone, Default)]
pub struct FixedScope(pub Vec<String>);

impl ScopeProvider for FixedScope {
    fn selected_criteria(&self) -> Vec<String> {
        self.0.clone()
    }
}
