use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, GovernanceError>;

#[derive(Error, Debug)]
pub enum GovernanceError {
    #[error("Backend : {0}")]
    Backend(String),

    #[error("Config : {0}")]
    Config(String),

    #[error("RateLimited : service {service}, info {info}")]
    RateLimited { service: String, info: String },

    #[error("Timeout : {0}")]
    Timeout(String),

    #[error("Shutdown")]
    Shutdown,

    #[error("Error : {0}")]
    Error(BoxError),
}

impl GovernanceError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, GovernanceError::RateLimited { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GovernanceError::Timeout(_))
    }
}

impl From<BoxError> for GovernanceError {
    fn from(error: BoxError) -> Self {
        GovernanceError::Error(error)
    }
}

impl From<String> for GovernanceError {
    fn from(msg: String) -> Self {
        GovernanceError::Error(msg.into())
    }
}

impl From<&str> for GovernanceError {
    fn from(msg: &str) -> Self {
        GovernanceError::Error(msg.into())
    }
}
