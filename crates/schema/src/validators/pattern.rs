//! Regular-expression constraints for string fields

use crate::error::{ValidationError, ValidationResult};
use crate::rule::ValidationRule;
use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct PatternValidator {
    pattern: Regex,
    pub message: Option<String>,
}

impl PatternValidator {
    /// The pattern must match the whole string; anchors are added when absent.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let anchored = match (pattern.starts_with('^'), pattern.ends_with('$')) {
            (true, true) => pattern.to_string(),
            (true, false) => format!("{}$", pattern),
            (false, true) => format!("^{}", pattern),
            (false, false) => format!("^(?:{})$", pattern),
        };
        Ok(Self {
            pattern: Regex::new(&anchored)?,
            message: None,
        })
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn pattern_string(&self) -> &str {
        self.pattern.as_str()
    }
}

impl ValidationRule for PatternValidator {
    fn validate(&self, value: &Value, field: &str) -> ValidationResult<()> {
        let Some(text) = value.as_str() else {
            return Err(ValidationError::with_code(
                field,
                format!("{} must be a string for pattern validation", field),
                "invalid_type",
            )
            .into());
        };

        if self.pattern.is_match(text) {
            return Ok(());
        }
        let message = self
            .message
            .clone()
            .unwrap_or_else(|| format!("{} does not match the required pattern", field));
        Err(ValidationError::with_code(field, message, "pattern_mismatch").into())
    }

    fn rule_name(&self) -> &'static str {
        "pattern"
    }
}
