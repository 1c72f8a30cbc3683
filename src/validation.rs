//! Structured results returned by the input guards.
//!
//! Guards never fail for expected input-shape problems; they collect every
//! problem they find into a `ValidationResult` instead.

use std::fmt;

use serde::Serialize;

/// A single problem found while validating one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Name of the offending field (e.g. `command`, `workingDirectory`).
    pub field: String,
    /// Human-readable description of the problem.
    pub message: String,
}

/// Outcome of a validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<FieldError>,
}

impl ValidationResult {
    /// A passing result with no errors.
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    /// A failing result with a single error.
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        let mut result = Self::ok();
        result.push(field, message);
        result
    }

    /// Records an error and marks the result invalid.
    pub fn push(&mut self, field: &str, message: impl Into<String>) {
        self.valid = false;
        self.errors.push(FieldError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    /// Returns the first error reported for `field`, if any.
    pub fn error_for(&self, field: &str) -> Option<&FieldError> {
        self.errors.iter().find(|e| e.field == field)
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid {
            return write!(f, "valid");
        }
        let joined = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{}", joined)
    }
}
