//! Error taxonomy for capture, replay, and chat runs.

use thiserror::Error;

use crate::capture::template::TemplateKind;

/// Failure of a single replayed request.
///
/// During a search run these are recorded per item and the run continues;
/// a failing search request itself aborts the run.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("upstream request failed with HTTP {status}")]
    Status { status: u16 },
    #[error("network error: {0}")]
    Network(String),
    #[error("unusable upstream response: {0}")]
    Decode(String),
}

/// Failure reported by a model backend.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("{backend} request failed with HTTP {status}: {message}")]
    Status {
        backend: &'static str,
        status: u16,
        message: String,
    },
    #[error("{backend} network error: {message}")]
    Network {
        backend: &'static str,
        message: String,
    },
    #[error("{backend} returned an unusable response: {message}")]
    Decode {
        backend: &'static str,
        message: String,
    },
}

impl ProviderError {
    /// HTTP status carried by the error, when the backend reported one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Network { .. } | Self::Decode { .. } => None,
        }
    }
}

/// Run-level failure surfaced to the caller.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no {kind} template captured yet; browse the upstream site to record one")]
    MissingTemplate { kind: TemplateKind },
    #[error("no search query available")]
    NoQueryAvailable,
    #[error("a {what} run is already in progress")]
    RunInProgress { what: &'static str },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("provider configuration error: {0}")]
    ProviderConfig(String),
    #[error("state file error: {0}")]
    State(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_template_names_the_kind() {
        let err = CoreError::MissingTemplate {
            kind: TemplateKind::SearchQuery,
        };
        assert!(err.to_string().contains("no search template"));
        let err = CoreError::MissingTemplate {
            kind: TemplateKind::DetailFetch,
        };
        assert!(err.to_string().contains("no detail template"));
    }

    #[test]
    fn provider_status_is_exposed() {
        let err = ProviderError::Status {
            backend: "openai",
            status: 429,
            message: "slow down".into(),
        };
        assert_eq!(err.status(), Some(429));
        let err = ProviderError::Network {
            backend: "openai",
            message: "refused".into(),
        };
        assert_eq!(err.status(), None);
    }

    #[test]
    fn transport_errors_convert_into_core_errors() {
        let err = CoreError::from(TransportError::Status { status: 503 });
        assert!(matches!(
            err,
            CoreError::Transport(TransportError::Status { status: 503 })
        ));
    }
}
