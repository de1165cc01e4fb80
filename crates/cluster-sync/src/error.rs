use thiserror::Error;

/// Replication errors
#[derive(Error, Debug)]
pub enum Error {
    /// Socket-level failure; terminal for the loop that owns the socket
    #[error("replication transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Record buffer shorter than the minimum frame
    #[error("call record too short ({0} bytes)")]
    ShortRecord(usize),

    /// Address length byte was neither 4 (IPv4) nor 16 (IPv6)
    #[error("unsupported address length {0}")]
    BadAddressLength(u8),

    /// Datagram ended in the middle of a declared field
    #[error("truncated replication datagram")]
    Truncated,

    /// A zero-count datagram without the full-sync keyword
    #[error("unknown control datagram")]
    UnknownControl,

    /// Call-ID or record too long for the one-byte length prefix
    #[error("entry too large for wire format: {0}")]
    Oversize(String),
}

/// Result type for replication operations
pub type Result<T> = std::result::Result<T, Error>;
