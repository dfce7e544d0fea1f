//! Closure-backed rules and enumerations

use crate::error::{ValidationError, ValidationResult};
use crate::rule::ValidationRule;
use serde_json::Value;
use std::sync::Arc;

pub type ValidationFn = Arc<dyn Fn(&Value, &str) -> ValidationResult<()> + Send + Sync>;

#[derive(Clone)]
pub struct CustomValidator {
    pub name: String,
    validator: ValidationFn,
    pub message: Option<String>,
}

impl CustomValidator {
    pub fn new<F>(name: impl Into<String>, validator: F) -> Self
    where
        F: Fn(&Value, &str) -> ValidationResult<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            validator: Arc::new(validator),
            message: None,
        }
    }

    /// Replaces the message of every error the closure reports
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Accepts only the listed string values
    pub fn one_of<I, S>(name: impl Into<String>, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed: Vec<String> = allowed.into_iter().map(Into::into).collect();
        Self::new(name, move |value, field| match value.as_str() {
            Some(s) if allowed.iter().any(|a| a == s) => Ok(()),
            Some(_) => Err(ValidationError::with_code(
                field,
                format!("{} must be one of: {}", field, allowed.join(", ")),
                "not_in_list",
            )
            .into()),
            None => Err(ValidationError::with_code(
                field,
                format!("{} must be a string", field),
                "invalid_type",
            )
            .into()),
        })
    }
}

impl std::fmt::Debug for CustomValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomValidator")
            .field("name", &self.name)
            .field("message", &self.message)
            .finish()
    }
}

impl ValidationRule for CustomValidator {
    fn validate(&self, value: &Value, field: &str) -> ValidationResult<()> {
        match ((self.validator)(value, field), &self.message) {
            (Err(mut errors), Some(message)) => {
                for field_errors in errors.errors.values_mut() {
                    for error in field_errors {
                        error.message = message.clone();
                    }
                }
                Err(errors)
            }
            (result, _) => result,
        }
    }

    fn rule_name(&self) -> &'static str {
        "custom"
    }
}
