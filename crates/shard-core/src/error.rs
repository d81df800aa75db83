//! Error types for sharded optimizer state conversion

use thiserror::Error;

/// Result type alias using the conversion Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for optimizer state conversion
#[derive(Error, Debug)]
pub enum Error {
    // Schema errors
    #[error("Invalid optimizer state dict: {message}")]
    Schema { message: String },

    #[error("Invalid optimizer input: {message}")]
    InvalidOptimInput { message: String },

    #[error("Can't find {name} from {known:?}")]
    UnknownParamName { name: String, known: Vec<String> },

    // Inconsistency errors
    #[error("Differing optimizer state names for the unflattened parameters: {param_names:?}")]
    StateNameMismatch { param_names: Vec<String> },

    #[error(
        "Differing optimizer state types for state {state_name}, values {values}, \
         and unflattened parameter names {param_names:?}"
    )]
    StateTypeMismatch {
        state_name: String,
        values: String,
        param_names: Vec<String>,
    },

    #[error(
        "All unflattened parameters comprising a single flat parameter must have \
         positive-dimension tensor state with the same dtype but got dtypes {dtypes:?} \
         for state {state_name} and unflattened parameter names {param_names:?}"
    )]
    DtypeMismatch {
        state_name: String,
        dtypes: Vec<String>,
        param_names: Vec<String>,
    },

    #[error(
        "Tensor optimizer state does not have same shape as its parameter {param_name}: \
         {actual:?} {expected:?}"
    )]
    ShapeMismatch {
        param_name: String,
        actual: Vec<usize>,
        expected: Vec<usize>,
    },

    #[error(
        "All unflattened parameters comprising a single flat parameter must have \
         scalar state with the same value and dtype but got values {values} and dtypes \
         {dtypes} for state {state_name} and unflattened parameter names {param_names:?}"
    )]
    ScalarValueMismatch {
        state_name: String,
        values: String,
        dtypes: String,
        param_names: Vec<String>,
    },

    #[error("Different ranks have different values for {state_name} of {fqn}")]
    RankValueMismatch { state_name: String, fqn: String },

    #[error("Ranks without {state_name} of {fqn} differ from the ranks without its other tensor states")]
    EmptyRankMismatch { state_name: String, fqn: String },

    #[error("Rank {rank} holds {actual} elements of {state_name} for {fqn} but its shard holds {expected}")]
    ShardSizeMismatch {
        state_name: String,
        fqn: String,
        rank: usize,
        actual: usize,
        expected: usize,
    },

    #[error("Flattened state {state_name} has {actual} elements but the flat parameter holds {expected}")]
    FlatSizeMismatch {
        state_name: String,
        actual: usize,
        expected: usize,
    },

    // Coverage errors
    #[error("{message}")]
    MissingOptimStates {
        message: String,
        /// Per-rank list of parameter name tuples without state
        missing: Vec<(usize, Vec<Vec<String>>)>,
    },

    // Unsupported shapes
    #[error("Flattening a zero-dimension parameter is not supported: {param_name}")]
    UnsupportedZeroDimFlatten { param_name: String },

    // Tensor errors
    #[error("Tensor error: {message}")]
    Tensor { message: String },

    // Collective errors
    #[error("Collective {op} failed on rank {rank}: {message}")]
    Collective {
        op: String,
        rank: usize,
        message: String,
    },

    #[error("Collective mismatch at call {seq}: rank {rank} issued {actual}, group expected {expected}")]
    CollectiveMismatch {
        seq: u64,
        rank: usize,
        actual: String,
        expected: String,
    },

    // Timeout errors
    #[error("Operation timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if this error is retryable
    ///
    /// Validation failures are data-consistency errors and are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Returns true if this error leaves the process group unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Collective { .. }
                | Error::CollectiveMismatch { .. }
                | Error::Timeout { .. }
                | Error::Internal { .. }
        )
    }

    /// Returns true if this error reports a disagreement between parameters or ranks
    pub fn is_inconsistency(&self) -> bool {
        matches!(
            self,
            Error::StateNameMismatch { .. }
                | Error::StateTypeMismatch { .. }
                | Error::DtypeMismatch { .. }
                | Error::ShapeMismatch { .. }
                | Error::ScalarValueMismatch { .. }
                | Error::RankValueMismatch { .. }
                | Error::EmptyRankMismatch { .. }
                | Error::ShardSizeMismatch { .. }
                | Error::FlatSizeMismatch { .. }
        )
    }

    pub fn tensor(message: impl Into<String>) -> Self {
        Error::Tensor {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let err = Error::Timeout {
            operation: "all_gather".to_string(),
            timeout_ms: 5000,
        };
        assert!(err.is_retryable());

        let err = Error::StateNameMismatch {
            param_names: vec!["a.weight".to_string(), "a.bias".to_string()],
        };
        assert!(!err.is_retryable());
        assert!(err.is_inconsistency());
    }

    #[test]
    fn test_error_fatal() {
        let err = Error::Collective {
            op: "broadcast".to_string(),
            rank: 1,
            message: "peer dropped".to_string(),
        };
        assert!(err.is_fatal());

        let err = Error::UnsupportedZeroDimFlatten {
            param_name: "scale".to_string(),
        };
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("scale"));
    }
}
