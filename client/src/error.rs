/// Errors surfaced by the search client.
///
/// Variants are cheap to clone so a single coalesced query result can be
/// handed to every caller waiting on it.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchError {
    /// No connectivity, 5xx or 408 on every configured host.
    Transport {
        host: String,
        status: Option<u16>,
        message: String,
    },
    /// Non-transient 4xx. Never retried.
    ClientRejection { status: u16, body: String },
    /// The request succeeded but the service flagged it; only raised in strict mode.
    ServerWarning(Vec<String>),
    /// Programmer error in query composition (operator, arity, limits).
    InvalidQuery(String),
    Config(String),
    Decode(String),
    Store(String),
    /// A coalesced request was dropped before it produced a result.
    Abandoned,
}

impl SearchError {
    pub fn invalid_query(message: impl Into<String>) -> Self {
        SearchError::InvalidQuery(message.into())
    }

    /// Whether the failure came from the network layer rather than the request itself.
    pub fn is_transport(&self) -> bool {
        matches!(self, SearchError::Transport { .. })
    }
}

impl From<serde_json::Error> for SearchError {
    fn from(err: serde_json::Error) -> Self {
        SearchError::Decode(err.to_string())
    }
}

impl From<std::io::Error> for SearchError {
    fn from(err: std::io::Error) -> Self {
        SearchError::Store(err.to_string())
    }
}

impl From<toml::de::Error> for SearchError {
    fn from(err: toml::de::Error) -> Self {
        SearchError::Config(err.to_string())
    }
}

impl std::fmt::Display for SearchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchError::Transport {
                host,
                status: Some(status),
                message,
            } => write!(f, "Transport failure ({} from {}): {}", status, host, message),
            SearchError::Transport {
                host,
                status: None,
                message,
            } => write!(f, "Transport failure ({}): {}", host, message),
            SearchError::ClientRejection { status, body } => {
                write!(f, "Request rejected with HTTP {}: {}", status, body)
            }
            SearchError::ServerWarning(warnings) => {
                write!(f, "Server warning: {}", warnings.join("; "))
            }
            SearchError::InvalidQuery(msg) => write!(f, "Invalid query: {}", msg),
            SearchError::Config(msg) => write!(f, "Config error: {}", msg),
            SearchError::Decode(msg) => write!(f, "Decode error: {}", msg),
            SearchError::Store(msg) => write!(f, "Store error: {}", msg),
            SearchError::Abandoned => write!(f, "Query abandoned before completion"),
        }
    }
}

impl std::error::Error for SearchError {}

pub type Result<T> = std::result::Result<T, SearchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_transport_with_status() {
        let err = SearchError::Transport {
            host: "https://a.example".to_string(),
            status: Some(503),
            message: "unavailable".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Transport failure (503 from https://a.example): unavailable"
        );
        assert!(err.is_transport());
    }

    #[test]
    fn test_display_rejection() {
        let err = SearchError::ClientRejection {
            status: 422,
            body: "unknown field".to_string(),
        };
        assert_eq!(err.to_string(), "Request rejected with HTTP 422: unknown field");
        assert!(!err.is_transport());
    }

    #[test]
    fn test_from_serde_json() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(SearchError::from(json_error), SearchError::Decode(_)));
    }
}
