use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("peer {0} already exists")]
    DuplicatePeer(String),
    #[error("peer limit reached: at most {max} peers")]
    PeerLimit { max: usize },
    #[error("sub-channel count {0} out of range 1..=8")]
    InvalidChannelCount(usize),
    #[error("buffer low threshold {low} must be below high threshold {high}")]
    InvalidThresholds { low: usize, high: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("every sub-channel is backpressured")]
    Backpressure,
    #[error("every sub-channel is closed")]
    ChannelsClosed,
    #[error("all channels blocked after {retries} retries")]
    AllChannelsBlocked { retries: usize },
    #[error("unexpected sub-channel {label}")]
    ChannelMismatch { label: String },
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Rejected before any state changed: bad configuration or a violated peer-registry rule.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::DuplicatePeer(_)
                | Error::PeerLimit { .. }
                | Error::InvalidChannelCount(_)
                | Error::InvalidThresholds { .. }
                | Error::InvalidConfig(_)
        )
    }
    /// The same call may succeed once buffers drain.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Backpressure)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
