//! The rule trait every field validator implements

use crate::error::ValidationResult;
use serde_json::Value;

/// A single constraint applied to one field value.
///
/// Rules run after the field's type check, and never see `null` for
/// nullable fields.
pub trait ValidationRule: Send + Sync {
    fn validate(&self, value: &Value, field: &str) -> ValidationResult<()>;

    fn rule_name(&self) -> &'static str;
}
