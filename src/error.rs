use serde_json::Value as JsonValue;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The backend answered with a non-success status.
    #[error("{operation} failed with status {status}: {detail}")]
    Api {
        operation: &'static str,
        status: u16,
        detail: String,
    },
    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// No token is available for an operation that needs one.
    #[error("Not authenticated")]
    Unauthenticated,
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// HTTP status returned by the backend, if the error came from a response.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            #[cfg(feature = "http")]
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether the failure is likely to go away on retry.
    ///
    /// Network failures, timeouts, `429` and `5xx` are transient. An explicit
    /// rejection (`401`, `403`, any other `4xx`) is not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            #[cfg(feature = "http")]
            Self::Http(e) => match e.status() {
                Some(status) => status.as_u16() == 429 || status.is_server_error(),
                None => e.is_timeout() || e.is_connect() || e.is_request(),
            },
            _ => false,
        }
    }

    /// A message suitable for showing to the person at the register.
    ///
    /// Backend errors carry DRF-style bodies (`{"detail": ...}`,
    /// `{"non_field_errors": [...]}` or `{"field": ["..."]}`); the first
    /// readable message wins.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Api { detail, status, .. } => extract_detail(detail).unwrap_or_else(|| {
                match status {
                    400 | 401 => "Invalid username or password".to_string(),
                    403 => "You do not have access to this resource".to_string(),
                    _ => "The server could not complete the request".to_string(),
                }
            }),
            #[cfg(feature = "http")]
            Self::Http(_) => "Unable to reach the server".to_string(),
            Self::Unauthenticated => "Please sign in".to_string(),
            other => other.to_string(),
        }
    }
}

fn extract_detail(body: &str) -> Option<String> {
    let json: JsonValue = serde_json::from_str(body).ok()?;
    let obj = json.as_object()?;

    for key in ["detail", "error", "message"] {
        if let Some(text) = obj.get(key).and_then(first_text) {
            return Some(text);
        }
    }
    if let Some(text) = obj.get("non_field_errors").and_then(first_text) {
        return Some(text);
    }
    obj.values().find_map(first_text)
}

fn first_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
        JsonValue::Array(items) => items.iter().find_map(first_text),
        _ => None,
    }
}
