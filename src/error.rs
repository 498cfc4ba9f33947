use std::fmt::Display;

/// Cachepress errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The Zstandard codec rejected an operation. Carries the codec's
    /// error name; compression callers store the value uncompressed,
    /// decompression callers surface the failure upstream.
    Codec(String),
    /// Configuration failed the startup sanity check. The core still
    /// starts in pass-through mode with compression disabled.
    ConfigInvalid(String),
    /// All 65,535 dictionary ids are in use or quarantined.
    IdsExhausted,
    /// Invalid data, typically manifest corruption or a corrupt frame.
    InvalidData(String),
    /// Invalid caller input, typically bad arguments or config values.
    InvalidInput(String),
    /// An IO error.
    IO(String),
    /// A compressed value references a dictionary id that is not in the
    /// current routing table. The item should be discarded upstream.
    UnknownDict(u16),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Codec(msg) => write!(f, "codec error: {msg}"),
            Error::ConfigInvalid(msg) => write!(f, "invalid configuration: {msg}"),
            Error::IdsExhausted => write!(f, "no dictionary id available"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::UnknownDict(id) => write!(f, "unknown dictionary id {id}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// A cachepress Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::num::ParseFloatError> for Error {
    fn from(err: std::num::ParseFloatError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}
