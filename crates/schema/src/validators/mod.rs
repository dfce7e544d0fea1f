//! Built-in field rules

pub mod custom;
pub mod length;
pub mod numeric;
pub mod pattern;

pub use custom::CustomValidator;
pub use length::LengthValidator;
pub use numeric::NumericValidator;
pub use pattern::PatternValidator;
