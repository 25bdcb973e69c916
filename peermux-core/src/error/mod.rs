use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("probe timed out")]
    Timeout,
    #[error("invalid stun message: {0}")]
    InvalidStun(&'static str),
    #[error("stun transaction id mismatch")]
    TransactionMismatch,
    #[error("no stun server reachable")]
    NoStunServer,
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(e) => e,
            Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, "probe timed out"),
            e => io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
        }
    }
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
