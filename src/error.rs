use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, AdapterError>;

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Discovery record without a usable identity
    #[error("invalid discovery descriptor: {0}")]
    InvalidDescriptor(String),

    /// Command addressed a device the registry does not know
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    /// The device answered that it does not implement the request
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Transport, HTTP or SOAP level failure talking to a device
    #[error("protocol fault: {0}")]
    ProtocolFault(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, AdapterError::UnsupportedOperation(_))
    }
}

impl From<rusqlite::Error> for AdapterError {
    fn from(e: rusqlite::Error) -> Self {
        AdapterError::StoreUnavailable(e.to_string())
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        AdapterError::ProtocolFault(e.to_string())
    }
}

impl From<roxmltree::Error> for AdapterError {
    fn from(e: roxmltree::Error) -> Self {
        AdapterError::ProtocolFault(format!("malformed SOAP response: {}", e))
    }
}
