use std::time::Duration;

/// Error taxonomy shared by the field protocol crates.
///
/// Frame- and segment-level errors are recovered locally by the engines
/// (drop and continue); fragment- and connection-level errors cancel the
/// current transaction and surface per request; session-level errors tear
/// the connection down.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    /// CRC mismatch on a received frame. The frame is dropped and reading
    /// continues.
    #[error("frame failed CRC validation")]
    FrameCorrupt,

    /// Transport segment sequence violation (gap, duplicate or overflow).
    /// Aborts the fragment under assembly only.
    #[error("transport segment sequence violation")]
    TransportDesync,

    /// Link retries exhausted or keepalive went unanswered.
    #[error("data link is down")]
    LinkDown,

    /// No response fragment within the application deadline.
    #[error("no response within {0:?}")]
    ApplicationTimeout(Duration),

    /// A response whose correlation id does not match the outstanding
    /// request. The session is considered compromised.
    #[error("response does not correlate with any outstanding request")]
    UnexpectedResponse,

    /// The codec recognizes the object but cannot materialize a typed
    /// value from this variation.
    #[error("unsupported object group {group} variation {variation}")]
    UnsupportedObject { group: u8, variation: u8 },

    /// The value cannot be converted to the point's content type. Fails
    /// the particular request; the batch continues.
    #[error("bad value: {0}")]
    BadValue(String),

    /// Transport open failed or the remote is unreachable.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Operation aborted by close or shutdown.
    #[error("operation cancelled")]
    Cancelled,

    /// Carrier for i/o failures below the protocol layers.
    #[error("i/o failure: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

impl ProtocolError {
    /// True when a later transaction may transparently retry after
    /// reopening the connection.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ProtocolError::LinkDown
                | ProtocolError::ServiceUnavailable(_)
                | ProtocolError::ApplicationTimeout(_)
                | ProtocolError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
