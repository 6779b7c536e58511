use thiserror::Error;

/// Classified failure of an authentication step.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// Silent acquisition cannot proceed without the user. Always recovered
    /// by the interactive or device-code branch.
    #[error("interaction required: {0}")]
    InteractionRequired(String),

    /// The identity service rejected the request. Not retried automatically.
    #[error("service error {code}: {message}")]
    Service { code: String, message: String },

    /// Local or library failure (bad configuration, no network, user cancel).
    #[error("client error {code}: {message}")]
    Client { code: String, message: String },

    /// More than one sub-step failed.
    #[error("{} errors occurred", .0.len())]
    Aggregate(Vec<AuthError>),

    /// The durable token cache could not be read or written.
    #[error("token cache unavailable: {0}")]
    CacheUnavailable(String),
}

impl AuthError {
    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn client(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Client {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_interaction_required(&self) -> bool {
        matches!(self, Self::InteractionRequired(_))
    }

    /// Combine failures; a single failure is returned unwrapped.
    pub fn aggregate(mut errors: Vec<AuthError>) -> Self {
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            Self::Aggregate(errors)
        }
    }

    /// Leaf failures, with nested aggregates flattened.
    pub fn causes(&self) -> Vec<&AuthError> {
        match self {
            Self::Aggregate(inner) => inner.iter().flat_map(|e| e.causes()).collect(),
            other => vec![other],
        }
    }

    /// Log lines describing this failure, one per cause.
    pub fn describe(&self) -> Vec<String> {
        self.causes()
            .into_iter()
            .map(|e| match e {
                Self::Service { code, message } => {
                    format!("Service error (code {}): {}", code, message)
                }
                Self::Client { code, message } => {
                    format!("Client error (code {}): {}", code, message)
                }
                other => other.to_string(),
            })
            .collect()
    }
}

impl From<std::io::Error> for AuthError {
    fn from(error: std::io::Error) -> Self {
        Self::CacheUnavailable(error.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(error: serde_json::Error) -> Self {
        Self::CacheUnavailable(format!("invalid cache snapshot: {}", error))
    }
}
