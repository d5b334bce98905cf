use std::fmt;

/// Main error type for the reachability counting protocol
#[derive(Debug)]
pub enum CountError {
    /// Instance construction errors (missing overlay, unknown node)
    Setup(String),

    /// Configuration or CLI argument errors
    Config(String),

    /// Overlay delivery errors for a single send
    Transport(String),

    /// Packet encoding/decoding errors
    Serialization(SerializationError),

    /// Internal lock poisoning or closed channels
    Concurrency(String),

    /// A run was discarded before the root published its count
    Aborted(String),
}

/// Serialization related errors
#[derive(Debug)]
pub enum SerializationError {
    /// Binary packet encoding errors
    Encode(bincode::error::EncodeError),

    /// Binary packet decoding errors
    Decode(bincode::error::DecodeError),

    /// JSON serialization errors
    Json(serde_json::Error),
}

impl fmt::Display for CountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CountError::Setup(msg) => write!(f, "Setup error: {}", msg),
            CountError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CountError::Transport(msg) => write!(f, "Transport error: {}", msg),
            CountError::Serialization(err) => write!(f, "Serialization error: {}", err),
            CountError::Concurrency(msg) => write!(f, "Concurrency error: {}", msg),
            CountError::Aborted(msg) => write!(f, "Run aborted: {}", msg),
        }
    }
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationError::Encode(err) => write!(f, "Binary encode: {}", err),
            SerializationError::Decode(err) => write!(f, "Binary decode: {}", err),
            SerializationError::Json(err) => write!(f, "JSON: {}", err),
        }
    }
}

impl std::error::Error for CountError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CountError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl std::error::Error for SerializationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SerializationError::Encode(err) => Some(err),
            SerializationError::Decode(err) => Some(err),
            SerializationError::Json(err) => Some(err),
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, CountError>;

impl CountError {
    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            CountError::Setup(_) => "setup_error",
            CountError::Config(_) => "configuration_error",
            CountError::Transport(_) => "transport_error",
            CountError::Serialization(_) => "serialization_error",
            CountError::Concurrency(_) => "concurrency_error",
            CountError::Aborted(_) => "aborted",
        }
    }
}

// Conversions from common error types
impl From<bincode::error::EncodeError> for CountError {
    fn from(err: bincode::error::EncodeError) -> Self {
        CountError::Serialization(SerializationError::Encode(err))
    }
}

impl From<bincode::error::DecodeError> for CountError {
    fn from(err: bincode::error::DecodeError) -> Self {
        CountError::Serialization(SerializationError::Decode(err))
    }
}

impl From<serde_json::Error> for CountError {
    fn from(err: serde_json::Error) -> Self {
        CountError::Serialization(SerializationError::Json(err))
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! setup_error {
    ($msg:expr) => {
        $crate::error::CountError::Setup($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::CountError::Setup(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::CountError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::CountError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! transport_error {
    ($msg:expr) => {
        $crate::error::CountError::Transport($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::CountError::Transport(format!($fmt, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let setup_err = CountError::Setup("cannot find tree".to_string());
        assert_eq!(setup_err.to_string(), "Setup error: cannot find tree");

        let aborted = CountError::Aborted("root stopped".to_string());
        assert_eq!(aborted.to_string(), "Run aborted: root stopped");
    }

    #[test]
    fn test_error_conversion() {
        let json_err = serde_json::from_str::<u64>("not json").unwrap_err();
        let count_err: CountError = json_err.into();

        assert!(matches!(
            count_err,
            CountError::Serialization(SerializationError::Json(_))
        ));
        assert_eq!(count_err.error_type(), "serialization_error");
        assert!(std::error::Error::source(&count_err).is_some());
    }

    #[test]
    fn test_macros() {
        let err = transport_error!("{} -> {} is not a tree edge", 1, 7);
        assert_eq!(err.to_string(), "Transport error: 1 -> 7 is not a tree edge");

        let err = config_error!("spread factor must be positive");
        assert_eq!(
            err.to_string(),
            "Configuration error: spread factor must be positive"
        );

        let err = setup_error!("node {} unknown", 3);
        assert_eq!(err.error_type(), "setup_error");
    }
}
