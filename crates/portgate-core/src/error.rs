use thiserror::Error;

/// Errors produced by the portgate engine.
#[derive(Debug, Error)]
pub enum PortgateError {
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("local port {port}/{protocol} is already claimed by rule {rule_id}")]
    PortConflict {
        protocol: String,
        port: u16,
        rule_id: String,
    },

    #[error("local port {0} is already in use")]
    PortInUse(u16),

    #[error("bind failed: {0}")]
    Bind(String),

    #[error("rule not found: {0}")]
    UnknownRule(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for PortgateError {
    fn from(e: serde_json::Error) -> Self {
        PortgateError::Codec(e.to_string())
    }
}

pub type PortgateResult<T> = Result<T, PortgateError>;
