use thiserror::Error;

/// Main error type for the human-in-the-loop optimizer
#[derive(Error, Debug)]
pub enum HitlError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Feedback error: {0}")]
    Feedback(#[from] FeedbackError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Study storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    DatabaseConnection { message: String },

    #[error("Query execution failed: {query}, error: {error}")]
    QueryFailed { query: String, error: String },

    #[error("Study not found: {name}")]
    StudyNotFound { name: String },

    #[error("Study already exists: {name}")]
    DuplicatedStudy { name: String },

    #[error("Trial {number} not found in study {study}")]
    TrialNotFound { study: String, number: usize },

    #[error("Trial {number} already finished with state {state}")]
    TrialAlreadyFinished { number: usize, state: String },

    #[error("Stored data corrupted: {message}")]
    Corruption { message: String },
}

/// Molecule parsing and image rendering errors
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Invalid SMILES at position {position}: {message}")]
    Smiles { position: usize, message: String },

    #[error("Highlighted atom {index} out of range, molecule has {atom_count} atoms")]
    AtomOutOfRange { index: usize, atom_count: usize },

    #[error("Drawing failed: {message}")]
    Draw { message: String },

    #[error("PNG encoding failed: {message}")]
    Encode { message: String },
}

/// Artifact store errors
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Artifact not found: {artifact_id}")]
    NotFound { artifact_id: String },

    #[error("Invalid artifact id: {artifact_id}")]
    InvalidId { artifact_id: String },

    #[error("Cannot read local file {path}: {message}")]
    Unreadable { path: String, message: String },
}

/// Human feedback errors
#[derive(Error, Debug)]
pub enum FeedbackError {
    #[error("Expected {expected} objective widgets, got {actual}")]
    WidgetCountMismatch { expected: usize, actual: usize },

    #[error("Invalid widget: {message}")]
    InvalidWidget { message: String },

    #[error("No objective form widgets registered for study {study}")]
    WidgetsNotRegistered { study: String },

    #[error("Choice index {index} out of range, widget has {len} choices")]
    ChoiceOutOfRange { index: usize, len: usize },

    #[error("Value {value} outside slider range [{min}, {max}]")]
    ValueOutOfRange { value: f64, min: f64, max: f64 },

    #[error("Response does not match widget kind: {message}")]
    ResponseMismatch { message: String },

    #[error("Trial {number} has no stored image referenced by its note")]
    TrialNotPresented { number: usize },
}

/// Result type alias for optimizer operations
pub type HitlResult<T> = Result<T, HitlError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::HitlError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::HitlError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::HitlError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = FeedbackError::ChoiceOutOfRange { index: 5, len: 3 };

        assert!(error.to_string().contains("Choice index 5"));
        assert!(error.to_string().contains("3 choices"));
    }

    #[test]
    fn test_error_conversion() {
        let storage_error = StorageError::TrialNotFound {
            study: "colors".to_string(),
            number: 7,
        };
        let err: HitlError = storage_error.into();

        match err {
            HitlError::Storage(StorageError::TrialNotFound { number, .. }) => assert_eq!(number, 7),
            _ => panic!("Expected Storage error"),
        }
    }

    #[test]
    fn test_macros() {
        let err = validation_error!("Invalid value: {}", 42);
        assert!(matches!(err, HitlError::Validation(ref m) if m == "Invalid value: 42"));

        let err = internal_error!("Something went wrong");
        assert!(matches!(err, HitlError::Internal(_)));

        let err = config_error!("Missing required field: {}", "n_batch");
        assert!(err.to_string().contains("n_batch"));
    }
}
