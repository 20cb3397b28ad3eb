use thiserror::Error;

/// Per-frame decode failures. None of these condemn the link: the reader
/// logs, drops the frame, and keeps splitting the stream on the next
/// terminator.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame truncated: {0} bytes after unstuffing")]
    Truncated(usize),
    #[error("CRC mismatch: expected {expected:#06x}, got {found:#06x}")]
    CrcMismatch { expected: u16, found: u16 },
    #[error("invalid COBS framing: {0}")]
    Cobs(String),
    #[error("payload codec error: {0}")]
    Codec(String),
}

impl FrameError {
    pub fn truncated(len: usize) -> Self {
        Self::Truncated(len)
    }

    pub fn cobs(msg: &str) -> Self {
        Self::Cobs(msg.to_string())
    }

    pub fn codec(msg: impl ToString) -> Self {
        Self::Codec(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
