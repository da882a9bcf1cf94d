use thiserror::Error;

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("network error: {0}")]
    Network(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("action failed: {0}")]
    Action(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("authentication lost: {0}")]
    AuthenticationLost(String),
    #[error("no proxy available: {0}")]
    NoProxyAvailable(String),
    #[error("captcha unsolved: {0}")]
    CaptchaUnsolved(String),
    #[error("executor error: {0}")]
    Executor(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("telemetry error: {0}")]
    Telemetry(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ControllerError {
    /// Failures that point at the network path, and so at the identity in use.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            ControllerError::Network(_) | ControllerError::Http(_) | ControllerError::Timeout(_)
        )
    }
}

impl From<tokio::task::JoinError> for ControllerError {
    fn from(err: tokio::task::JoinError) -> Self {
        ControllerError::Executor(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ControllerError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ControllerError::Timeout(err.to_string())
    }
}
