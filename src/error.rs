use std::fmt::Display;

/// Emberstore errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The key is absent or tombstoned. Carries the timestamp bits of the
    /// tombstone, or 0 when the store has no record of the key at all.
    NotFound(u64),
    /// Writes are currently disabled, either by the user or by the disk
    /// watcher.
    Disabled,
    /// The value exceeds the configured value cap.
    TooLarge,
    /// Checksum verification failed on a read.
    Corrupt(String),
    /// Invalid data, typically decoding errors or unexpected internal values.
    InvalidData(String),
    /// An IO error.
    IO(String),
    /// Unrecoverable state; the embedding process is expected to restart.
    Fatal(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound(_) => write!(f, "not found"),
            Error::Disabled => write!(f, "writes disabled"),
            Error::TooLarge => write!(f, "value exceeds value cap"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl Error {
    /// True for either flavor of missing record.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// The timestamp bits carried by a `NotFound`, 0 otherwise.
    pub fn timestamp_bits(&self) -> u64 {
        match self {
            Error::NotFound(tsb) => *tsb,
            _ => 0,
        }
    }
}

/// An emberstore Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}
