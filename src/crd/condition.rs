//! Status conditions shared by all migration resources.
//!
//! Conditions come in two flavors: durable conditions survive reconciliation
//! and must be deleted explicitly, while non-durable conditions are rebuilt
//! every tick. The staging protocol supports the latter: a reconciler calls
//! [`Conditions::begin_staging`], re-asserts whatever still holds, and
//! [`Conditions::end_staging`] sweeps the rest.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition severity category.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum Category {
    /// The resource cannot proceed until resolved.
    Critical,
    /// Required for the resource to be considered ready.
    Required,
    /// Informational.
    #[default]
    Advisory,
    /// Something is off but not blocking.
    Warn,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Critical => write!(f, "Critical"),
            Category::Required => write!(f, "Required"),
            Category::Advisory => write!(f, "Advisory"),
            Category::Warn => write!(f, "Warn"),
        }
    }
}

/// Condition status values.
pub const TRUE: &str = "True";
pub const FALSE: &str = "False";

/// Condition describes the state of a resource at a point in time.
///
/// The `items` list substitutes into `[]` in the message when rendered,
/// letting one condition carry a variable set of subjects.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Severity category.
    #[serde(default)]
    pub category: Category,
    /// Human-readable message.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Whether this condition survives reconciliation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub durable: bool,
    /// Items substituted into the message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<String>,
    /// Last time the condition transitioned.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_transition_time: String,
    /// Staging marker, never serialized.
    #[serde(skip)]
    pub staged: bool,
}

impl Condition {
    /// Create a new condition with the transition time set to now.
    pub fn new(condition_type: &str, status: &str, category: Category) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: status.to_string(),
            category,
            last_transition_time: jiff::Timestamp::now().to_string(),
            ..Default::default()
        }
    }

    /// Builder-style reason.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Builder-style message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Builder-style durability.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Builder-style items.
    pub fn items(mut self, items: Vec<String>) -> Self {
        self.items = items;
        self
    }

    /// Whether the condition is set to "True".
    pub fn is_true(&self) -> bool {
        self.status == TRUE
    }

    /// Render the message with `[]` replaced by the joined items.
    pub fn rendered_message(&self) -> String {
        if self.items.is_empty() {
            return self.message.clone();
        }
        self.message
            .replace("[]", &format!("[{}]", self.items.join(", ")))
    }

    fn equal(&self, other: &Condition) -> bool {
        self.status == other.status
            && self.reason == other.reason
            && self.category == other.category
            && self.message == other.message
            && self.items == other.items
    }
}

/// An ordered set of conditions keyed by type.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct Conditions {
    pub list: Vec<Condition>,
}

impl Conditions {
    /// Set (add or replace) a condition. The transition time is preserved
    /// when nothing but the timestamp would change.
    pub fn set(&mut self, mut condition: Condition) {
        condition.staged = true;
        match self.list.iter_mut().find(|c| c.r#type == condition.r#type) {
            Some(existing) => {
                if existing.equal(&condition) {
                    condition.last_transition_time = existing.last_transition_time.clone();
                }
                *existing = condition;
            }
            None => self.list.push(condition),
        }
    }

    /// Delete a condition by type.
    pub fn delete(&mut self, condition_type: &str) {
        self.list.retain(|c| c.r#type != condition_type);
    }

    /// Find a condition by type.
    pub fn find(&self, condition_type: &str) -> Option<&Condition> {
        self.list.iter().find(|c| c.r#type == condition_type)
    }

    /// Whether a condition of the given type is set to "True".
    pub fn has(&self, condition_type: &str) -> bool {
        self.find(condition_type).is_some_and(Condition::is_true)
    }

    /// Whether any of the given types is set to "True".
    pub fn has_any(&self, types: &[&str]) -> bool {
        types.iter().any(|t| self.has(t))
    }

    /// Begin a staging pass: mark everything unstaged.
    pub fn begin_staging(&mut self) {
        for condition in &mut self.list {
            condition.staged = false;
        }
    }

    /// Re-assert an existing condition by type so staging keeps it.
    pub fn stage(&mut self, condition_type: &str) {
        if let Some(condition) = self.list.iter_mut().find(|c| c.r#type == condition_type) {
            condition.staged = true;
        }
    }

    /// End a staging pass: drop non-durable conditions that were not
    /// re-asserted since `begin_staging`.
    pub fn end_staging(&mut self) {
        self.list.retain(|c| c.durable || c.staged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_find() {
        let mut conditions = Conditions::default();
        conditions.set(Condition::new("Ready", TRUE, Category::Required).reason("Validated"));

        let found = conditions.find("Ready").unwrap();
        assert_eq!(found.status, TRUE);
        assert_eq!(found.reason, "Validated");
        assert!(conditions.has("Ready"));
    }

    #[test]
    fn test_replace_preserves_transition_time() {
        let mut conditions = Conditions::default();
        let mut first = Condition::new("Running", TRUE, Category::Advisory);
        first.last_transition_time = "2026-01-01T00:00:00Z".to_string();
        conditions.set(first);
        conditions.set(Condition::new("Running", TRUE, Category::Advisory));

        let found = conditions.find("Running").unwrap();
        assert_eq!(found.last_transition_time, "2026-01-01T00:00:00Z");
    }

    #[test]
    fn test_staging_sweeps_non_durable() {
        let mut conditions = Conditions::default();
        conditions.set(Condition::new("Running", TRUE, Category::Advisory));
        conditions.set(Condition::new("Failed", TRUE, Category::Critical).durable(true));

        conditions.begin_staging();
        conditions.end_staging();

        assert!(!conditions.has("Running"));
        assert!(conditions.has("Failed"));
    }

    #[test]
    fn test_staging_keeps_reasserted() {
        let mut conditions = Conditions::default();
        conditions.set(Condition::new("Running", TRUE, Category::Advisory));

        conditions.begin_staging();
        conditions.stage("Running");
        conditions.end_staging();

        assert!(conditions.has("Running"));
    }

    #[test]
    fn test_has_any() {
        let mut conditions = Conditions::default();
        conditions.set(Condition::new("Canceling", TRUE, Category::Advisory));
        assert!(conditions.has_any(&["Canceled", "Canceling"]));
        assert!(!conditions.has_any(&["Canceled", "Failed"]));
    }

    #[test]
    fn test_rendered_message_items() {
        let condition = Condition::new("StagePodsCreated", TRUE, Category::Advisory)
            .message("[] stage pods created.")
            .items(vec!["3".to_string()]);
        assert_eq!(condition.rendered_message(), "[3] stage pods created.");
    }
}
