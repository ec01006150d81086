use thiserror::Error;

/// Main error type for the proxy-anchor losses
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LossError {
    /// A label outside `[0, num_classes)`
    #[error("Invalid label {label}: expected a class index below {num_classes}")]
    InvalidLabel {
        label: usize,
        num_classes: usize,
    },

    /// No class in the batch has a positive sample
    #[error("Degenerate batch: {0}")]
    DegenerateBatch(String),

    /// Shape-related errors with detailed suggestions
    #[error("Shape error: {0}")]
    ShapeError(String),

    /// Overflow, NaN or infinity in the computation
    #[error("Numeric instability: {0}")]
    NumericInstability(String),

    /// Device-related errors
    #[error("Device error: {0}")]
    DeviceError(String),

    /// Operation errors with context
    #[error("Operation error: {operation} - {message}")]
    OperationError {
        operation: String,
        message: String,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Failure reported by an injected metric-learning library
    #[error("External library error: {0}")]
    ExternalLibrary(String),

    /// Internal errors that shouldn't happen
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl LossError {
    /// Create a shape error with helpful suggestions
    pub fn shape_error(expected: &str, got: &str, suggestion: Option<&str>) -> Self {
        let message = if let Some(sugg) = suggestion {
            format!("Expected {}, got {}. Suggestion: {}", expected, got, sugg)
        } else {
            format!("Expected {}, got {}", expected, got)
        };
        LossError::ShapeError(message)
    }

    /// Create an operation error with context
    pub fn operation_error(operation: &str, message: &str) -> Self {
        LossError::OperationError {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a device error with helpful context
    pub fn device_error(device: &str, message: &str) -> Self {
        LossError::DeviceError(format!("Device '{}': {}", device, message))
    }
}

impl From<std::io::Error> for LossError {
    fn from(err: std::io::Error) -> Self {
        LossError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for LossError {
    fn from(err: serde_json::Error) -> Self {
        LossError::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for LossError {
    fn from(err: bincode::Error) -> Self {
        LossError::SerializationError(err.to_string())
    }
}

/// Result type for loss operations
pub type LossResult<T> = Result<T, LossError>;

/// Error context for providing additional debugging information
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub operation: String,
    pub tensor_shapes: Vec<String>,
    pub device_info: String,
    pub suggestions: Vec<String>,
}

impl ErrorContext {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            tensor_shapes: Vec::new(),
            device_info: String::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_shape(mut self, shape: &str) -> Self {
        self.tensor_shapes.push(shape.to_string());
        self
    }

    pub fn with_device(mut self, device: &str) -> Self {
        self.device_info = device.to_string();
        self
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.suggestions.push(suggestion.to_string());
        self
    }

    pub fn to_error_message(&self) -> String {
        let mut message = format!("Operation: {}", self.operation);

        if !self.tensor_shapes.is_empty() {
            message.push_str(&format!("\nTensor shapes: {}", self.tensor_shapes.join(", ")));
        }

        if !self.device_info.is_empty() {
            message.push_str(&format!("\nDevice: {}", self.device_info));
        }

        if !self.suggestions.is_empty() {
            message.push_str("\nSuggestions:");
            for suggestion in &self.suggestions {
                message.push_str(&format!("\n  - {}", suggestion));
            }
        }

        message
    }
}

/// Helper trait for adding context to errors
pub trait WithContext<T> {
    fn with_context<F>(self, f: F) -> LossResult<T>
    where
        F: FnOnce() -> ErrorContext;
}

impl<T> WithContext<T> for LossResult<T> {
    fn with_context<F>(self, f: F) -> LossResult<T>
    where
        F: FnOnce() -> ErrorContext,
    {
        self.map_err(|e| {
            let context = f();
            match e {
                LossError::ShapeError(msg) => {
                    LossError::ShapeError(format!("{}\nContext: {}", msg, context.to_error_message()))
                }
                LossError::DeviceError(msg) => {
                    LossError::DeviceError(format!("{}\nContext: {}", msg, context.to_error_message()))
                }
                LossError::OperationError { operation, message } => LossError::OperationError {
                    operation,
                    message: format!("{}\nContext: {}", message, context.to_error_message()),
                },
                _ => e,
            }
        })
    }
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidLabel,
    DegenerateBatch,
    ShapeMismatch,
    NumericInstability,
    DeviceNotFound,
    InvalidOperation,
    ConfigInvalid,
    SerializationFailed,
    ExternalLibrary,
    InternalError,
}

impl LossError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            LossError::InvalidLabel { .. } => ErrorCode::InvalidLabel,
            LossError::DegenerateBatch(_) => ErrorCode::DegenerateBatch,
            LossError::ShapeError(_) => ErrorCode::ShapeMismatch,
            LossError::NumericInstability(_) => ErrorCode::NumericInstability,
            LossError::DeviceError(_) => ErrorCode::DeviceNotFound,
            LossError::OperationError { .. } => ErrorCode::InvalidOperation,
            LossError::ConfigurationError(_) => ErrorCode::ConfigInvalid,
            LossError::InvalidInput(_) => ErrorCode::InvalidOperation,
            LossError::SerializationError(_) => ErrorCode::SerializationFailed,
            LossError::IoError(_) => ErrorCode::SerializationFailed,
            LossError::ExternalLibrary(_) => ErrorCode::ExternalLibrary,
            LossError::InternalError(_) => ErrorCode::InternalError,
        }
    }

    /// Whether the caller can reasonably retry with a different batch.
    ///
    /// Nothing is retried inside the crate; this is a hint for the training loop.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::DegenerateBatch | ErrorCode::NumericInstability
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_error() {
        let error = LossError::shape_error("[32, 128]", "[32, 64]", Some("Check the embedding head width"));
        assert!(error.to_string().contains("Expected [32, 128], got [32, 64]"));
        assert!(error.to_string().contains("Check the embedding head width"));
    }

    #[test]
    fn test_error_context() {
        let context = ErrorContext::new("cosine_similarity")
            .with_shape("[32, 128]")
            .with_shape("[100, 64]")
            .with_device("cpu")
            .with_suggestion("Embedding dimension must match the proxies");

        let message = context.to_error_message();
        assert!(message.contains("Operation: cosine_similarity"));
        assert!(message.contains("Tensor shapes: [32, 128], [100, 64]"));
        assert!(message.contains("Device: cpu"));
        assert!(message.contains("Embedding dimension must match the proxies"));
    }

    #[test]
    fn test_with_context_only_decorates_shape_like_errors() {
        let shape: LossResult<()> = Err(LossError::ShapeError("bad".to_string()));
        let err = shape
            .with_context(|| ErrorContext::new("forward").with_shape("[2, 3]"))
            .unwrap_err();
        assert!(err.to_string().contains("Operation: forward"));

        let label: LossResult<()> = Err(LossError::InvalidLabel { label: 7, num_classes: 3 });
        let err = label.with_context(|| ErrorContext::new("forward")).unwrap_err();
        assert_eq!(err, LossError::InvalidLabel { label: 7, num_classes: 3 });
    }

    #[test]
    fn test_error_codes() {
        let err = LossError::InvalidLabel { label: 5, num_classes: 5 };
        assert_eq!(err.code(), ErrorCode::InvalidLabel);
        assert!(!err.is_recoverable());

        let err = LossError::DegenerateBatch("empty".to_string());
        assert_eq!(err.code(), ErrorCode::DegenerateBatch);
        assert!(err.is_recoverable());
    }
}
