use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("file context error: {0}")]
    FileContext(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ReviewError {
    /// Extract provider name from structured error variants.
    /// Returns None for variants that don't carry provider context.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Upstream { provider, .. } => Some(provider),
            Self::AuthFailed { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Produce a sanitized error message safe for returning to MCP clients.
    /// Does not leak internal URLs, connection details, or upstream error bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::UnknownBackend(tag) => {
                format!("unknown backend: {tag} (expected \"local\" or \"hosted\")")
            }
            Self::Request(_) => "request to provider failed".to_string(),
            Self::Upstream {
                provider, status, ..
            } => match status {
                Some(code) => format!("upstream error from {provider} (HTTP {code})"),
                None => format!("upstream error from {provider}"),
            },
            Self::AuthFailed { provider, message } => {
                format!("authentication failed for {provider}: {message}")
            }
            Self::SchemaParse(_) => "failed to parse provider response".to_string(),
            Self::Config(msg) => format!("configuration error: {msg}"),
            Self::FileContext(msg) => format!("file context error: {msg}"),
            Self::Io(_) => "local I/O failure".to_string(),
            Self::Other(msg) => msg.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_only_for_provider_variants() {
        let upstream = ReviewError::Upstream {
            provider: "ollama".to_string(),
            message: "boom".to_string(),
            status: Some(500),
        };
        assert_eq!(upstream.provider(), Some("ollama"));
        assert_eq!(ReviewError::Other("x".to_string()).provider(), None);
    }

    #[test]
    fn user_message_hides_upstream_body() {
        let err = ReviewError::Upstream {
            provider: "github".to_string(),
            message: "secret body from http://10.0.0.1".to_string(),
            status: Some(502),
        };
        let msg = err.user_message();
        assert!(msg.contains("502"));
        assert!(!msg.contains("10.0.0.1"));
    }
}
