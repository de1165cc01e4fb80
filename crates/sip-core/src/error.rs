use thiserror::Error;

/// SIP scanning errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Datagram shorter than the minimum routable message
    #[error("datagram too short ({0} bytes)")]
    TooShort(usize),

    /// A header the current operation needs was not present
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    /// A header was present but its value could not be extracted
    #[error("malformed {0} header")]
    MalformedHeader(&'static str),
}

/// Result type for SIP scanning operations
pub type Result<T> = std::result::Result<T, Error>;
