//! Length constraints for strings and arrays

use crate::error::{ValidationError, ValidationResult};
use crate::rule::ValidationRule;
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct LengthValidator {
    pub min: Option<usize>,
    pub max: Option<usize>,
    pub message: Option<String>,
}

impl LengthValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min(mut self, min: usize) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: usize) -> Self {
        self.max = Some(max);
        self
    }

    pub fn range(self, min: usize, max: usize) -> Self {
        self.min(min).max(max)
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    fn describe(&self, field: &str) -> String {
        if let Some(message) = &self.message {
            return message.clone();
        }
        match (self.min, self.max) {
            (Some(min), Some(max)) if min == max => {
                format!("{} must be exactly {} long", field, min)
            }
            (Some(min), Some(max)) => format!("{} must be between {} and {} long", field, min, max),
            (Some(min), None) => format!("{} must be at least {} long", field, min),
            (None, Some(max)) => format!("{} must be at most {} long", field, max),
            (None, None) => format!("{} has an invalid length", field),
        }
    }
}

impl ValidationRule for LengthValidator {
    fn validate(&self, value: &Value, field: &str) -> ValidationResult<()> {
        let length = match value {
            // Unicode-aware
            Value::String(s) => s.chars().count(),
            Value::Array(items) => items.len(),
            _ => {
                return Err(ValidationError::with_code(
                    field,
                    format!("{} must be a string or array for length validation", field),
                    "invalid_type",
                )
                .into())
            }
        };

        if self.min.is_some_and(|min| length < min) {
            return Err(ValidationError::with_code(field, self.describe(field), "length_min").into());
        }
        if self.max.is_some_and(|max| length > max) {
            return Err(ValidationError::with_code(field, self.describe(field), "length_max").into());
        }
        Ok(())
    }

    fn rule_name(&self) -> &'static str {
        "length"
    }
}
