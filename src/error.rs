use thiserror::Error;

/// Exporter error types
#[derive(Debug, Error)]
pub enum ExporterError {
    /// Namespace and database must be both empty or both set
    #[error("invalid scope: namespace {namespace:?} and database {database:?} must be both empty or both non-empty")]
    InvalidScope { namespace: String, database: String },

    /// Could not open the connection to the database
    #[error("connection error: {0}")]
    Connection(String),

    /// Sign-in rejected by the server
    #[error("authentication error: {0}")]
    Authentication(String),

    /// A statement returned an error status
    #[error("query failed ({statement}): {message}")]
    Query { statement: String, message: String },

    /// Live query could not be opened or killed
    #[error("live query error: {0}")]
    Live(String),

    /// Unexpected payload from the server
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation exceeded its deadline
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The underlying connection is gone
    #[error("session closed")]
    SessionClosed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExporterError {
    /// Contract violations, as opposed to recoverable connectivity failures.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::InvalidScope { .. })
    }

    /// Server reports that the object being defined is already there.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Query { message, .. } => message.contains("already exists"),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExporterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_scope_is_configuration_error() {
        let err = ExporterError::InvalidScope {
            namespace: "ns".to_string(),
            database: String::new(),
        };
        assert!(err.is_configuration());
        assert!(!ExporterError::SessionClosed.is_configuration());
        assert!(!ExporterError::Connection("refused".to_string()).is_configuration());
    }

    #[test]
    fn test_already_exists_detection() {
        let err = ExporterError::Query {
            statement: "DEFINE EVENT stats_create ON TABLE orders".to_string(),
            message: "The event 'stats_create' already exists".to_string(),
        };
        assert!(err.is_already_exists());

        let other = ExporterError::Query {
            statement: "SELECT * FROM x".to_string(),
            message: "Parse error".to_string(),
        };
        assert!(!other.is_already_exists());
        assert!(!ExporterError::Live("already exists".to_string()).is_already_exists());
    }

    #[test]
    fn test_display_includes_statement() {
        let err = ExporterError::Query {
            statement: "INFO FOR ROOT".to_string(),
            message: "not allowed".to_string(),
        };
        assert_eq!(err.to_string(), "query failed (INFO FOR ROOT): not allowed");
    }
}
