//! Numeric range constraints

use crate::error::{ValidationError, ValidationResult};
use crate::rule::ValidationRule;
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct NumericValidator {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub integer_only: bool,
    pub message: Option<String>,
}

impl NumericValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn integer_only(mut self, integer_only: bool) -> Self {
        self.integer_only = integer_only;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    fn fail(&self, field: &str, default: String, code: &str) -> ValidationResult<()> {
        let message = self.message.clone().unwrap_or(default);
        Err(ValidationError::with_code(field, message, code).into())
    }
}

impl ValidationRule for NumericValidator {
    fn validate(&self, value: &Value, field: &str) -> ValidationResult<()> {
        // Strings are not parsed: values are never coerced
        let Some(num) = value.as_f64() else {
            return Err(ValidationError::with_code(
                field,
                format!("{} must be a number", field),
                "invalid_type",
            )
            .into());
        };

        if self.integer_only && num.fract() != 0.0 {
            return self.fail(field, format!("{} must be an integer", field), "not_integer");
        }
        if let Some(min) = self.min {
            if num < min {
                return self.fail(field, format!("{} must be at least {}", field, min), "too_small");
            }
        }
        if let Some(max) = self.max {
            if num > max {
                return self.fail(field, format!("{} must be at most {}", field, max), "too_large");
            }
        }
        Ok(())
    }

    fn rule_name(&self) -> &'static str {
        "numeric"
    }
}
