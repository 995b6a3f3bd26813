use std::{error::Error as StdError, fmt, io, sync::PoisonError};

pub type Result<T> = ::std::result::Result<T, Error>;

pub enum Error {
    Config(String),
    Glob(globset::Error),
    Io(io::Error),
    Json(serde_json::Error),
    Monitor(String),
    Notify(notify::Error),
    Packet(bincode::Error),
    Pipe(String),
    PoisonedLock,
    Spawn(io::Error),
}

impl StdError for Error {}

impl From<globset::Error> for Error {
    fn from(err: globset::Error) -> Self {
        Error::Glob(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        match err {
            notify::Error::Io(err) => Error::Io(err),
            other => Error::Notify(other),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Packet(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_err: PoisonError<T>) -> Self {
        Error::PoisonedLock
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (error_type, error) = match self {
            Error::Config(err) => ("Config", err.clone()),
            Error::Glob(err) => ("Globset", err.to_string()),
            Error::Io(err) => ("I/O", err.to_string()),
            Error::Json(err) => ("JSON", err.to_string()),
            Error::Monitor(err) => ("Monitor", err.clone()),
            Error::Notify(err) => ("Notify", err.to_string()),
            Error::Packet(err) => ("Packet", err.to_string()),
            Error::Pipe(err) => ("Pipe", err.clone()),
            Error::PoisonedLock => ("Internal", "poisoned lock".to_string()),
            Error::Spawn(err) => ("Spawn", format!("couldn't start the worker:\n{}", err)),
        };

        write!(f, "{} error: {}", error_type, error)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
