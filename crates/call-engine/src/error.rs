use thiserror::Error;

/// Balancer engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Socket-level errors; fatal to the loop that owns the socket
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Replication channel errors
    #[error("replication error: {0}")]
    Sync(#[from] siplb_cluster_sync::Error),

    /// SIP scanning errors
    #[error("sip error: {0}")]
    Sip(#[from] siplb_sip_core::Error),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Credential store errors
    #[error("registrar error: {0}")]
    Registrar(String),
}

impl Error {
    /// Create a new Config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new Registrar error
    pub fn registrar<S: Into<String>>(msg: S) -> Self {
        Self::Registrar(msg.into())
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;
