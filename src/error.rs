//! Error types and handling for flexshm

/// Result type alias for flexshm operations
pub type Result<T> = std::result::Result<T, ShmError>;

/// Comprehensive error types for the flexshm exchange
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// Bad type token, duplicate field, unsupported dtype
    #[error("Schema error: {message}")]
    Schema { message: String },

    /// Attach-time disagreement between the local layout and the region header
    #[error("Schema mismatch: {what}: expected {expected:#x}, found {actual:#x}")]
    SchemaMismatch {
        what: &'static str,
        expected: u64,
        actual: u64,
    },

    /// A region with this name already exists
    #[error("Region name in use: {name}")]
    NameInUse { name: String },

    /// No region with this name exists
    #[error("Region not found: {name}")]
    NotFound { name: String },

    /// Underlying shared-memory provider failure
    #[error("Provider error: {message}")]
    Provider {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Write names a field the schema does not declare
    #[error("Unknown field: {name}")]
    UnknownField { name: String },

    /// Value kind does not match the declared field kind
    #[error("Kind mismatch for field '{field}': expected {expected}, got {actual}")]
    KindMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    /// An array value is inconsistent with its own declared shape
    #[error("Shape mismatch: {message}")]
    ShapeMismatch { message: String },

    /// Snapshot retry budget exhausted while a publication was in flight
    #[error("Torn read: slot unstable after {attempts} attempts")]
    TornRead { attempts: u32 },

    /// Read deadline passed without new data
    #[error("Timeout: no data within deadline")]
    Timeout,

    /// Operation on a closed exchange
    #[error("Exchange is closed")]
    Closed,

    /// Operation not valid for the current slot mode
    #[error("Mode error: {message}")]
    Mode { message: String },
}

impl ShmError {
    /// Create a schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Create an attach-time mismatch error for one header field
    pub fn mismatch(what: &'static str, expected: u64, actual: u64) -> Self {
        Self::SchemaMismatch {
            what,
            expected,
            actual,
        }
    }

    /// Create a provider error from a standard I/O error
    pub fn provider_io(source: std::io::Error, context: &str) -> Self {
        Self::Provider {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create a provider error without an underlying cause
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            source: None,
        }
    }

    /// Create an unknown field error
    pub fn unknown_field(name: impl Into<String>) -> Self {
        Self::UnknownField { name: name.into() }
    }

    /// Create a kind mismatch error
    pub fn kind_mismatch(
        field: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::KindMismatch {
            field: field.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(message: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            message: message.into(),
        }
    }

    /// Create a mode error
    pub fn mode(message: impl Into<String>) -> Self {
        Self::Mode {
            message: message.into(),
        }
    }

    /// True for errors a caller may simply retry (torn read or timeout)
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TornRead { .. } | Self::Timeout)
    }
}

impl From<std::io::Error> for ShmError {
    fn from(err: std::io::Error) -> Self {
        Self::provider_io(err, "I/O operation failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ShmError::schema("duplicate field 'x'");
        assert!(matches!(err, ShmError::Schema { .. }));

        let err = ShmError::unknown_field("missing");
        assert!(matches!(err, ShmError::UnknownField { .. }));

        let err = ShmError::mismatch("magic", 0x4653_4D31, 0);
        assert!(matches!(err, ShmError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = ShmError::kind_mismatch("pos", "f64", "str");
        let display = format!("{}", err);
        assert!(display.contains("pos"));
        assert!(display.contains("f64"));
    }

    #[test]
    fn test_retryable() {
        assert!(ShmError::Timeout.is_retryable());
        assert!(ShmError::TornRead { attempts: 256 }.is_retryable());
        assert!(!ShmError::Closed.is_retryable());
    }
}
