use std::fmt;

use crate::params::ParamKey;

#[derive(Debug)]
pub enum Error {
    /// Login failed or the plant id could not be derived from the handshake.
    Auth(String),
    /// The resolved plant is not one of the account's gateways.
    GatewayMismatch { expected: String, found: String },
    Transport(reqwest::Error),
    Timeout,
    /// Non-200 status, non-JSON body or a body that does not fit the schema.
    MalformedResponse(String),
    Validation(ValidationError),
    ReconciliationExhausted(Vec<ParamKey>),
    Config(String),
    Stopped,
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Auth(msg) => write!(f, "authentication failed: {msg}"),
            Error::GatewayMismatch { expected, found } => {
                write!(f, "gateway mismatch: expected {expected}, account resolved {found}")
            }
            Error::Transport(e) => write!(f, "transport error: {e}"),
            Error::Timeout => write!(f, "request timed out"),
            Error::MalformedResponse(msg) => write!(f, "malformed response: {msg}"),
            Error::Validation(e) => write!(f, "validation error: {e}"),
            Error::ReconciliationExhausted(keys) => {
                let names: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
                write!(f, "writes not confirmed after retries: {}", names.join(", "))
            }
            Error::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Error::Stopped => write!(f, "engine stopped"),
            Error::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            Error::Validation(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl Error {
    /// Failures that count against the error counter and are retried by the
    /// scheduler or the write coordinator.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Auth(_) | Error::Transport(_) | Error::Timeout | Error::MalformedResponse(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else {
            Error::Transport(e)
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MalformedResponse(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::Validation(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Caller-supplied value rejected before anything is sent. Never retried.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    UnknownParameter(String),
    ReadOnly(ParamKey),
    OutOfRange { key: ParamKey, value: f64, min: f64, max: f64 },
    NotAStep { key: ParamKey, value: f64, step: f64 },
    NotAnOption { key: ParamKey, value: String, options: Vec<String> },
    WrongType { key: ParamKey, expected: &'static str },
    /// The device has not reported the bounds for this key yet.
    CapabilitiesUnknown(ParamKey),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::UnknownParameter(name) => write!(f, "unknown parameter: {name}"),
            ValidationError::ReadOnly(key) => write!(f, "{key} is read-only"),
            ValidationError::OutOfRange { key, value, min, max } => {
                write!(f, "{key}: {value} not in {min}..{max}")
            }
            ValidationError::NotAStep { key, value, step } => {
                write!(f, "{key}: {value} not a multiple of {step}")
            }
            ValidationError::NotAnOption { key, value, options } => {
                write!(f, "{key}: unknown option {value} (valid: {options:?})")
            }
            ValidationError::WrongType { key, expected } => {
                write!(f, "{key}: expected a {expected} value")
            }
            ValidationError::CapabilitiesUnknown(key) => {
                write!(f, "{key}: allowed values not known yet")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Error channel of [`crate::Engine::request_changes`].
///
/// `rejected` holds the values that failed validation in this call.
/// `unresolved` holds keys from earlier calls that were dropped without the
/// device ever confirming them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialFailure {
    pub rejected: Vec<(String, ValidationError)>,
    pub unresolved: Vec<ParamKey>,
}

impl PartialFailure {
    pub fn is_empty(&self) -> bool {
        self.rejected.is_empty() && self.unresolved.is_empty()
    }
}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} value(s) rejected, {} write(s) unresolved",
            self.rejected.len(),
            self.unresolved.len()
        )?;
        if let Some((name, err)) = self.rejected.first() {
            write!(f, " (first: {name}: {err})")?;
        }
        Ok(())
    }
}

impl std::error::Error for PartialFailure {}
