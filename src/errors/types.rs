//! # Error Types
//!
//! Error taxonomy for the cutover orchestrator using `thiserror`.
//!
//! The first group of variants are the ambient failures every component can
//! hit (configuration, storage, transport). The second group is the
//! orchestration taxonomy: each of those variants marks a terminal outcome
//! of a state machine and carries enough context for an operator to act on
//! it (see [`CutoverError::remediation`]).

/// Custom result type for cutover operations
pub type Result<T> = std::result::Result<T, CutoverError>;

/// Main error type for the cutover orchestrator
#[derive(thiserror::Error, Debug)]
pub enum CutoverError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Database and storage errors
    #[error("Database error: {context}")]
    Database {
        #[source]
        source: sqlx::Error,
        context: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// Connection-level failure talking to an external service
    #[error("Transport error calling {service}: {message}")]
    Transport { service: String, message: String },

    /// External service answered with a non-success status
    #[error("HTTP error from {service}: {message} (status: {status})")]
    Http { service: String, message: String, status: u16 },

    /// Resource not found errors
    #[error("Resource not found: {resource_type} with ID '{id}'")]
    NotFound { resource_type: String, id: String },

    /// Resource conflict errors (e.g., already exists)
    #[error("Resource conflict: {message}")]
    Conflict { message: String, resource_type: String },

    /// Encryption or decryption of credential material failed
    #[error("Encryption error: {message}")]
    Encryption { message: String },

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A readiness gate never became true within its retry budget
    #[error(
        "readiness gate '{gate}' not satisfied after {attempts} attempts \
         (last completed: {last_completed}, rolled back to {rolled_back_to}): {reason}"
    )]
    ReadinessTimeout {
        gate: String,
        attempts: u32,
        last_completed: String,
        rolled_back_to: String,
        reason: String,
    },

    /// Another operation owns the lock
    #[error("{scope} lock '{key}' is held by {holder}")]
    LockContention { scope: String, key: String, holder: String },

    /// Attempted restore of an unverified snapshot
    #[error("snapshot {snapshot_id} is not verified")]
    NotVerified { snapshot_id: String },

    /// Promotion attempted with lag above the safety threshold and no override
    #[error("promote blocked for '{environment}': lag {lag} > threshold {threshold}")]
    ReplicationUnsafe { environment: String, lag: u64, threshold: u64 },

    /// A failover, rollout, token or rollback step used up its retry budget.
    ///
    /// `recovery` is what an operator has to do by hand for that operation.
    #[error(
        "step '{step}' exhausted {attempts} attempt(s) (last completed: {last_completed}): {reason}"
    )]
    StepExhausted {
        step: String,
        attempts: u32,
        last_completed: String,
        reason: String,
        recovery: String,
    },

    /// Rollout metrics crossed the configured bound
    #[error(
        "{metric} {observed:.4} breached abort threshold {threshold:.4} for '{application}'"
    )]
    AbortThresholdBreached { application: String, metric: String, observed: f64, threshold: f64 },

    /// A rollout was deferred because a failover is running for the environment
    #[error("failover {event_id} is in progress for environment '{environment}'")]
    FailoverInProgress { environment: String, event_id: String },
}

impl CutoverError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Create a database error with context
    pub fn database<S: Into<String>>(source: sqlx::Error, context: S) -> Self {
        Self::Database { source, context: context.into() }
    }

    /// Create a serialization error with context
    pub fn serialization<S: Into<String>>(source: serde_json::Error, context: S) -> Self {
        Self::Serialization { source, context: context.into() }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create a validation error with field information
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>, M: Into<String>>(service: S, message: M) -> Self {
        Self::Transport { service: service.into(), message: message.into() }
    }

    /// Create an HTTP status error
    pub fn http<S: Into<String>, M: Into<String>>(service: S, message: M, status: u16) -> Self {
        Self::Http { service: service.into(), message: message.into(), status }
    }

    /// Create a not found error
    pub fn not_found<R: Into<String>, I: Into<String>>(resource_type: R, id: I) -> Self {
        Self::NotFound { resource_type: resource_type.into(), id: id.into() }
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>, R: Into<String>>(message: S, resource_type: R) -> Self {
        Self::Conflict { message: message.into(), resource_type: resource_type.into() }
    }

    /// Create an encryption error
    pub fn encryption<S: Into<String>>(message: S) -> Self {
        Self::Encryption { message: message.into() }
    }

    /// Create an I/O error with context
    pub fn io<S: Into<String>>(source: std::io::Error, context: S) -> Self {
        Self::Io { source, context: context.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Whether a caller may retry the failed operation locally.
    ///
    /// Only transport failures and 5xx/429 answers qualify; everything in the
    /// orchestration taxonomy is terminal for the operation that raised it.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Last completed step recorded on a terminal orchestration failure.
    pub fn last_completed_step(&self) -> Option<&str> {
        match self {
            Self::ReadinessTimeout { last_completed, .. }
            | Self::StepExhausted { last_completed, .. } => Some(last_completed.as_str()),
            _ => None,
        }
    }

    /// Recommended manual action for an operator, if one exists.
    pub fn remediation(&self) -> Option<String> {
        match self {
            Self::ReadinessTimeout { gate, rolled_back_to, .. } => Some(format!(
                "state was rolled back to {rolled_back_to}; inspect why '{gate}' never became \
                 ready, then rerun bootstrap"
            )),
            Self::LockContention { key, holder, .. } => Some(format!(
                "wait for {holder} to finish or for the '{key}' lease to expire, then retry"
            )),
            Self::NotVerified { snapshot_id } => Some(format!(
                "snapshot {snapshot_id} failed its self-check; investigate the backup \
                 directory before restoring from an older verified snapshot"
            )),
            Self::ReplicationUnsafe { lag, threshold, .. } => Some(format!(
                "promote blocked: lag {lag} > threshold {threshold}, rerun with --force"
            )),
            Self::StepExhausted { step, recovery, .. } => {
                Some(format!("'{step}' did not complete; {recovery}"))
            }
            Self::AbortThresholdBreached { application, .. } => Some(format!(
                "rollout of '{application}' was aborted and traffic restored to the baseline; \
                 investigate the new version before retrying"
            )),
            Self::FailoverInProgress { environment, .. } => Some(format!(
                "wait for the failover in '{environment}' to complete, then retry the rollout"
            )),
            _ => None,
        }
    }
}

impl From<validator::ValidationErrors> for CutoverError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation { message: errors.to_string(), field: None }
    }
}

impl From<::config::ConfigError> for CutoverError {
    fn from(error: ::config::ConfigError) -> Self {
        Self::Config { message: error.to_string(), source: Some(Box::new(error)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let err = CutoverError::not_found("snapshot", "abc");
        assert!(matches!(err, CutoverError::NotFound { .. }));
        assert_eq!(err.to_string(), "Resource not found: snapshot with ID 'abc'");

        let err = CutoverError::validation_field("bad weight", "weight");
        match err {
            CutoverError::Validation { field, .. } => assert_eq!(field.as_deref(), Some("weight")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(CutoverError::transport("nomad", "connection refused").is_transient());
        assert!(CutoverError::http("vault", "unavailable", 503).is_transient());
        assert!(CutoverError::http("vault", "slow down", 429).is_transient());
        assert!(!CutoverError::http("vault", "forbidden", 403).is_transient());
        assert!(!CutoverError::NotVerified { snapshot_id: "s".into() }.is_transient());
    }

    #[test]
    fn test_replication_unsafe_remediation() {
        let err = CutoverError::ReplicationUnsafe {
            environment: "production".into(),
            lag: 42,
            threshold: 10,
        };
        assert_eq!(
            err.remediation().as_deref(),
            Some("promote blocked: lag 42 > threshold 10, rerun with --force")
        );
    }

    #[test]
    fn test_last_completed_step() {
        let err = CutoverError::StepExhausted {
            step: "update_discovery".into(),
            attempts: 3,
            last_completed: "promote".into(),
            reason: "dns provider unavailable".into(),
            recovery: "point the record at the promoted secondary by hand".into(),
        };
        assert_eq!(err.last_completed_step(), Some("promote"));
        assert!(err.to_string().contains("exhausted 3 attempt(s)"));
        assert!(CutoverError::internal("x").last_completed_step().is_none());
    }

    #[test]
    fn test_step_remediation_follows_the_operation() {
        let err = CutoverError::StepExhausted {
            step: "revoke_previous_token".into(),
            attempts: 3,
            last_completed: "activate_replacement".into(),
            reason: "connection reset".into(),
            recovery: "revoke the previous token at the secret store".into(),
        };
        assert_eq!(
            err.remediation().as_deref(),
            Some("'revoke_previous_token' did not complete; revoke the previous token at the secret store")
        );
        assert!(!err.remediation().unwrap().contains("secondary"));
    }
}
