//! # resource-schema
//!
//! Scalar field schemas for resource definitions. A schema validates a JSON
//! object either in full (every required field present, no unknown keys) or
//! partially (only the keys that were supplied), and never coerces values.

pub mod error;
pub mod rule;
pub mod schema;
pub mod validators;

pub use error::{ValidationError, ValidationErrors, ValidationResult};
pub use rule::ValidationRule;
pub use schema::{FieldSpec, FieldType, ObjectSchema, Schema};

pub use validators::{
    custom::CustomValidator, length::LengthValidator, numeric::NumericValidator,
    pattern::PatternValidator,
};
