use std::fmt;

/// Failures that end a peer connection.
#[derive(Debug)]
pub enum PeerError {
    Io(std::io::Error),
    Timeout(&'static str),
    InvalidHandshake(String),
    InfoHashMismatch,
    UnexpectedMessage { expected: &'static str, got: String },
    MalformedMessage(String),
    FrameTooLarge(u32),
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::Io(e) => write!(f, "io: {}", e),
            PeerError::Timeout(stage) => write!(f, "timed out during {}", stage),
            PeerError::InvalidHandshake(reason) => write!(f, "invalid handshake: {}", reason),
            PeerError::InfoHashMismatch => write!(f, "info hash mismatch"),
            PeerError::UnexpectedMessage { expected, got } => {
                write!(f, "expected {}, got {}", expected, got)
            }
            PeerError::MalformedMessage(reason) => write!(f, "malformed message: {}", reason),
            PeerError::FrameTooLarge(len) => write!(f, "frame of {} bytes exceeds limit", len),
        }
    }
}

impl std::error::Error for PeerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PeerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PeerError {
    fn from(e: std::io::Error) -> Self {
        PeerError::Io(e)
    }
}

/// Why a whole download could not finish.
#[derive(Debug)]
pub enum DownloadError {
    InvalidJob(String),
    /// Every worker exited while pieces were still outstanding.
    Stalled { completed: usize, total: usize },
    /// A piece failed more attempts than the configured cap.
    Unobtainable { index: u32, failures: u32 },
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadError::InvalidJob(reason) => write!(f, "invalid job: {}", reason),
            DownloadError::Stalled { completed, total } => write!(
                f,
                "no peers left with {} of {} pieces downloaded",
                completed, total
            ),
            DownloadError::Unobtainable { index, failures } => write!(
                f,
                "piece {} could not be obtained after {} failed attempts",
                index, failures
            ),
        }
    }
}

impl std::error::Error for DownloadError {}
