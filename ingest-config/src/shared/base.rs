use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A field value violates its constraint.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
}

impl ValidationError {
    pub(crate) fn non_zero(field: &str) -> ValidationError {
        ValidationError::InvalidFieldValue {
            field: field.to_string(),
            constraint: "must be greater than 0".to_string(),
        }
    }
}
