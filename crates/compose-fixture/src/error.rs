use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("could not locate {name} in {} or any of its ancestors", searched_from.display())]
    ComposeFileNotFound { name: String, searched_from: PathBuf },
    #[error("invalid port specification '{spec}': {reason}")]
    InvalidPort { spec: String, reason: String },
    #[error("failed to load settings: {0}")]
    Settings(#[from] figment::Error),
    #[error("compose project {project} failed to start: {reason}")]
    Startup { project: String, reason: String },
    #[error("{probe} probe for service {service} timed out after {}ms", timeout.as_millis())]
    ProbeTimedOut {
        service: String,
        probe: &'static str,
        timeout: Duration,
    },
    #[error("readiness check for service {service} failed: {source}")]
    ProbeFault {
        service: String,
        source: anyhow::Error,
    },
    #[error("teardown of compose project {project} failed: {reason}")]
    Teardown { project: String, reason: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
}

impl ComposeError {
    /// Errors raised before any container is touched. These are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ComposeError::ComposeFileNotFound { .. }
                | ComposeError::InvalidPort { .. }
                | ComposeError::Settings(_)
        )
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ComposeError::Io {
            context: context.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_classified() {
        let missing = ComposeError::ComposeFileNotFound {
            name: "docker-compose.yml".into(),
            searched_from: PathBuf::from("/tmp"),
        };
        assert!(missing.is_configuration());
        assert!(
            missing
                .to_string()
                .contains("could not locate docker-compose.yml")
        );

        let timeout = ComposeError::ProbeTimedOut {
            service: "db".into(),
            probe: "port",
            timeout: Duration::from_millis(5000),
        };
        assert!(!timeout.is_configuration());
        assert_eq!(
            timeout.to_string(),
            "port probe for service db timed out after 5000ms"
        );
    }
}
