//! Object schemas: full and partial parsing of JSON objects
//!
//! A [`Schema`] is an ordered list of named fields. `parse` checks a complete
//! object, `parse_partial` checks only the keys supplied (used for updates).
//! Both reject unknown keys and stop at the first violation; neither coerces
//! or drops values.

use crate::error::{ValidationError, ValidationResult};
use crate::rule::ValidationRule;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// The JSON type a field must carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldType {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Declaration of one field: its type, presence and extra rules
#[derive(Clone)]
pub struct FieldSpec {
    pub field_type: FieldType,
    pub required: bool,
    pub nullable: bool,
    rules: Vec<Arc<dyn ValidationRule>>,
}

impl FieldSpec {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: true,
            nullable: false,
            rules: Vec::new(),
        }
    }

    pub fn string() -> Self {
        Self::new(FieldType::String)
    }

    pub fn number() -> Self {
        Self::new(FieldType::Number)
    }

    pub fn integer() -> Self {
        Self::new(FieldType::Integer)
    }

    pub fn boolean() -> Self {
        Self::new(FieldType::Boolean)
    }

    pub fn object() -> Self {
        Self::new(FieldType::Object)
    }

    pub fn array() -> Self {
        Self::new(FieldType::Array)
    }

    pub fn any() -> Self {
        Self::new(FieldType::Any)
    }

    /// May be omitted from a full object
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Accepts an explicit `null`
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn rule<R: ValidationRule + 'static>(mut self, rule: R) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    fn check(&self, field: &str, value: &Value) -> ValidationResult<()> {
        if value.is_null() {
            if self.nullable {
                return Ok(());
            }
            return Err(ValidationError::with_code(
                field,
                format!("{} must not be null", field),
                "null_value",
            )
            .into());
        }
        if !self.field_type.accepts(value) {
            return Err(ValidationError::with_code(
                field,
                format!("{} must be of type {}", field, self.field_type),
                "invalid_type",
            )
            .into());
        }
        for rule in &self.rules {
            rule.validate(value, field)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSpec")
            .field("field_type", &self.field_type)
            .field("required", &self.required)
            .field("nullable", &self.nullable)
            .field(
                "rules",
                &self.rules.iter().map(|r| r.rule_name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Validator capable of full-object and partial-object parsing
pub trait ObjectSchema: Send + Sync {
    /// Validates a complete object and returns the accepted fields
    fn parse(&self, value: &Value) -> ValidationResult<Map<String, Value>>;

    /// Validates only the keys present in `value`
    fn parse_partial(&self, value: &Value) -> ValidationResult<Map<String, Value>>;

    /// Declared field names, in declaration order
    fn field_names(&self) -> Vec<String>;
}

/// Ordered collection of [`FieldSpec`]s
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<(String, FieldSpec)>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a field; redeclaring a name replaces the earlier spec
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        let name = name.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = spec;
        } else {
            self.fields.push((name, spec));
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, spec)| spec)
    }

    fn as_object<'a>(&self, value: &'a Value) -> ValidationResult<&'a Map<String, Value>> {
        let object = value.as_object().ok_or_else(|| {
            ValidationError::with_code("$", "expected an object", "invalid_type")
        })?;
        if let Some(unknown) = object.keys().find(|key| self.get(key).is_none()) {
            return Err(ValidationError::with_code(
                unknown.as_str(),
                format!("{} is not a declared field", unknown),
                "unknown_field",
            )
            .into());
        }
        Ok(object)
    }
}

impl ObjectSchema for Schema {
    fn parse(&self, value: &Value) -> ValidationResult<Map<String, Value>> {
        let object = self.as_object(value)?;
        let mut parsed = Map::new();
        for (name, spec) in &self.fields {
            match object.get(name) {
                Some(field_value) => {
                    spec.check(name, field_value)?;
                    parsed.insert(name.clone(), field_value.clone());
                }
                None if spec.required => {
                    return Err(ValidationError::with_code(
                        name.as_str(),
                        format!("{} is required", name),
                        "required",
                    )
                    .into());
                }
                None => {}
            }
        }
        Ok(parsed)
    }

    fn parse_partial(&self, value: &Value) -> ValidationResult<Map<String, Value>> {
        let object = self.as_object(value)?;
        let mut parsed = Map::new();
        for (name, field_value) in object {
            if let Some(spec) = self.get(name) {
                spec.check(name, field_value)?;
                parsed.insert(name.clone(), field_value.clone());
            }
        }
        Ok(parsed)
    }

    fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|(name, _)| name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validators::{CustomValidator, LengthValidator};
    use serde_json::json;

    fn message_schema() -> Schema {
        Schema::new()
            .field("id", FieldSpec::string().optional())
            .field(
                "role",
                FieldSpec::string().rule(CustomValidator::one_of("role", ["user", "assistant"])),
            )
            .field("content", FieldSpec::string().rule(LengthValidator::new().max(20)))
            .field("tokens", FieldSpec::integer().optional().nullable())
    }

    #[test]
    fn test_full_parse_accepts_valid_object() {
        let parsed = message_schema()
            .parse(&json!({"role": "user", "content": "hi", "tokens": null}))
            .unwrap();
        assert_eq!(parsed.get("role"), Some(&json!("user")));
        assert_eq!(parsed.get("tokens"), Some(&Value::Null));
        assert!(!parsed.contains_key("id"));
    }

    #[test]
    fn test_full_parse_requires_fields() {
        let err = message_schema().parse(&json!({"role": "user"})).unwrap_err();
        let first = err.first().unwrap();
        assert_eq!(first.field, "content");
        assert_eq!(first.code, "required");
    }

    #[test]
    fn test_unknown_keys_rejected_not_dropped() {
        let err = message_schema()
            .parse(&json!({"role": "user", "content": "hi", "extra": 1}))
            .unwrap_err();
        assert_eq!(err.first().unwrap().code, "unknown_field");
    }

    #[test]
    fn test_no_coercion() {
        let err = message_schema()
            .parse(&json!({"role": "user", "content": "hi", "tokens": "12"}))
            .unwrap_err();
        assert_eq!(err.first().unwrap().code, "invalid_type");
    }

    #[test]
    fn test_partial_parse_checks_only_supplied_keys() {
        let schema = message_schema();
        let parsed = schema.parse_partial(&json!({"content": "Updated"})).unwrap();
        assert_eq!(parsed.len(), 1);

        let err = schema.parse_partial(&json!({"role": "robot"})).unwrap_err();
        assert_eq!(err.first().unwrap().code, "not_in_list");
    }

    #[test]
    fn test_non_object_rejected() {
        let err = message_schema().parse(&json!([1, 2])).unwrap_err();
        assert_eq!(err.first().unwrap().field, "$");
    }

    #[test]
    fn test_field_names_keep_declaration_order() {
        assert_eq!(
            message_schema().field_names(),
            vec!["id", "role", "content", "tokens"]
        );
    }
}
