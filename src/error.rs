use std::io;

/// String like type that occupies the same space as one usize
type TinyStr = Box<String>;

#[allow(missing_docs)]
#[derive(Debug, Display, Error)]
#[display("{:?}", self)]
#[non_exhaustive]
pub enum Error {
    /// Storage failure or interrupted lock wait (`io::ErrorKind::Interrupted`).
    Io(io::Error),
    Validation(#[error(not(source))] TinyStr),
    IllegalArgument(#[error(not(source))] TinyStr),
    IllegalState(#[error(not(source))] TinyStr),
    NoSuchElement,
    StorageLocked,
}

impl Error {
    pub(crate) fn illegal_argument(msg: impl Into<String>) -> Self {
        Self::IllegalArgument(Box::new(msg.into()))
    }

    pub(crate) fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(Box::new(msg.into()))
    }

    pub(crate) fn interrupted() -> Self {
        Self::Io(io::Error::new(
            io::ErrorKind::Interrupted,
            "interrupted while waiting for the tree lock",
        ))
    }

    /// Returns whether this error was produced by an interrupted lock wait.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::Interrupted)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(value)
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        let kind = match &value {
            Error::Io(i) => i.kind(),
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Io(io::Error::new(io::ErrorKind::InvalidData, value))
    }
}

macro_rules! error_validation {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::Validation(msg.into())
    }}
}

macro_rules! io_invalid_data {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        let io_error = ::std::io::Error::new(::std::io::ErrorKind::InvalidData, msg);
        crate::Error::Io(io_error)
    }}
}

macro_rules! io_other {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        let io_error = ::std::io::Error::new(::std::io::ErrorKind::Other, msg);
        crate::Error::Io(io_error)
    }}
}

pub(crate) use error_validation;
pub(crate) use io_invalid_data;
pub(crate) use io_other;
