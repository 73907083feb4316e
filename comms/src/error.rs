use std::{error::Error, fmt, io};

/// Failures while reading a frame off the wire.
#[derive(Debug)]
pub enum RecvError {
    /// The peer closed the stream cleanly between frames.
    Closed,
    Io(io::Error),
    /// The length prefix exceeded the configured maximum, the payload was discarded.
    TooLarge { len: usize, max: usize },
    /// The stream ended before the announced payload was complete.
    Truncated { expected: usize, got: usize },
    /// The payload was read fully but is not the expected JSON document.
    Malformed(serde_json::Error),
}

impl RecvError {
    /// Whether the stream can no longer be trusted to be aligned on a frame boundary.
    ///
    /// # Returns
    /// `true` if the connection should be closed after reporting this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            RecvError::Closed | RecvError::Io(_) | RecvError::Truncated { .. } => true,
            RecvError::TooLarge { .. } | RecvError::Malformed(_) => false,
        }
    }
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvError::Closed => write!(f, "connection closed"),
            RecvError::Io(e) => write!(f, "io error: {e}"),
            RecvError::TooLarge { len, max } => {
                write!(f, "message of {len} bytes exceeds the maximum of {max} bytes")
            }
            RecvError::Truncated { expected, got } => {
                write!(f, "truncated frame: expected {expected} bytes, got {got}")
            }
            RecvError::Malformed(e) => write!(f, "invalid json: {e}"),
        }
    }
}

impl Error for RecvError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RecvError::Io(e) => Some(e),
            RecvError::Malformed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RecvError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Failures while writing a frame.
#[derive(Debug)]
pub enum SendError {
    Io(io::Error),
    /// The serialized message is larger than the configured maximum, nothing was written.
    TooLarge { len: usize, max: usize },
    Serialize(serde_json::Error),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Io(e) => write!(f, "io error: {e}"),
            SendError::TooLarge { len, max } => {
                write!(f, "message of {len} bytes exceeds the maximum of {max} bytes")
            }
            SendError::Serialize(e) => write!(f, "failed to serialize message: {e}"),
        }
    }
}

impl Error for SendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SendError::Io(e) => Some(e),
            SendError::Serialize(e) => Some(e),
            SendError::TooLarge { .. } => None,
        }
    }
}

impl From<io::Error> for SendError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for callers that only speak `io::Error`.
impl From<SendError> for io::Error {
    fn from(value: SendError) -> Self {
        match value {
            SendError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

impl From<RecvError> for io::Error {
    fn from(value: RecvError) -> Self {
        match value {
            RecvError::Io(e) => e,
            RecvError::Closed => io::Error::from(io::ErrorKind::UnexpectedEof),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
