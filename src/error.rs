//! Error taxonomy for the sync engine.
//!
//! | Error | Scope | Effect |
//! |-------|-------|--------|
//! | [`SyncError::Configuration`] | before any state | surfaced to the caller, no job recorded |
//! | [`ValidationError`] | one record | record dropped from its batch, job continues |
//! | [`RemoteError`] | one batch | job marked failed, no further ticks |

/// Failure reported by the remote service or the transport in front of it.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}{}", http_suffix(.status))]
pub struct RemoteError {
    /// HTTP status, absent for transport failures (timeout, DNS, TLS).
    pub status: Option<u16>,
    pub message: String,
}

impl RemoteError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }
}

fn http_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" (HTTP {})", code)).unwrap_or_default()
}

/// A single field problem found while validating a mapped record.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("sync job was modified concurrently")]
    Conflict,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    pub fn configuration(message: impl Into<String>) -> Self {
        SyncError::Configuration(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_display_includes_status() {
        let err = RemoteError::http(422, "Invalid products");
        assert_eq!(err.to_string(), "Invalid products (HTTP 422)");
        let err = RemoteError::transport("operation timed out");
        assert_eq!(err.to_string(), "operation timed out");
    }

    #[test]
    fn validation_error_display() {
        let err = ValidationError::new("price", "price is required and must be numeric");
        assert_eq!(err.to_string(), "price: price is required and must be numeric");
    }
}
