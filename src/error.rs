//! Error types
//!
//! `Error` is the crate-level error. Collaborator failures are reported as
//! [`EngineError`], rejected attribute writes as [`ConfigError`].

use std::io;

use crate::media::RunState;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("media engine: {0}")]
    Engine(#[from] EngineError),

    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),

    /// A structural link between graph stages could not be made
    #[error("link failed: {0}")]
    Link(String),

    /// The source pipeline is absent (destroyed and not yet recreated)
    #[error("source pipeline is not available")]
    NoSource,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unknown attribute '{0}'")]
    UnknownAttribute(String),

    #[error("attribute '{0}' is read-only")]
    ReadOnlyAttribute(String),

    #[error("attribute '{name}' expects {expected}")]
    AttributeType {
        name: &'static str,
        expected: &'static str,
    },

    /// A daemon was built without a required collaborator
    #[error("missing collaborator: {0}")]
    MissingCollaborator(&'static str),
}

/// Failure reported by the media engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("parameter '{name}' has the wrong type")]
    WrongType { name: String },

    #[error("encoder does not expose an attribute set")]
    NoAttributes,

    #[error("run-state change to {0:?} failed")]
    StateChange(RunState),

    #[error("muxer unavailable: {0}")]
    Muxer(String),

    #[error("{0}")]
    Other(String),
}

/// A requested attribute value the engine did not accept
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The value read back differs from the value written
    #[error("{field}: requested {requested}, engine reports {actual}")]
    NotAccepted {
        field: &'static str,
        requested: String,
        actual: String,
    },

    #[error("{0} must not be zero")]
    Zero(&'static str),

    #[error("{field}: value {value} out of range")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("{field}: {source}")]
    Engine {
        field: &'static str,
        #[source]
        source: EngineError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_mentions_field() {
        let err = ConfigError::NotAccepted {
            field: "videoBitrate",
            requested: "5000".into(),
            actual: "4000".into(),
        };
        assert_eq!(
            err.to_string(),
            "videoBitrate: requested 5000, engine reports 4000"
        );
    }

    #[test]
    fn test_engine_error_converts_into_crate_error() {
        let err: Error = EngineError::UnknownParameter("foo".into()).into();
        assert!(matches!(err, Error::Engine(EngineError::UnknownParameter(_))));
        assert_eq!(err.to_string(), "media engine: unknown parameter 'foo'");
    }
}
