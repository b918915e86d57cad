use std::fmt;

/// Crate-wide error type. Every fallible operation in this proxy returns
/// one of these variants; there is no boxed/dynamic error type and no
/// downcasting anywhere in the driver.
#[derive(Debug)]
pub enum Error {
    /// The peer closed the socket or a read/write syscall failed.
    Io(std::io::Error),

    /// A length-prefixed frame was short, over-length, or left unread
    /// bytes behind after `finalize`.
    Protocol(String),

    /// Startup parameter list was missing `user`/`database`, or
    /// `database` had no `/`.
    BadStartup(String),

    /// `hostregex` rejected the parsed backend host, or client-facing
    /// SSL was required and the client skipped it.
    PolicyRejected(String),

    /// Dialing the backend, or negotiating TLS with it, failed.
    BackendUnreachable(String),

    /// TLS handshake or certificate-loading failure.
    Tls(String),

    /// Config file could not be parsed or failed validation.
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Protocol(s) => write!(f, "protocol error: {}", s),
            Error::BadStartup(s) => write!(f, "bad startup message: {}", s),
            Error::PolicyRejected(s) => write!(f, "policy rejected: {}", s),
            Error::BackendUnreachable(s) => write!(f, "backend unreachable: {}", s),
            Error::Tls(s) => write!(f, "tls error: {}", s),
            Error::Config(s) => write!(f, "config error: {}", s),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(e)
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Error {
        Error::Config(e.to_string())
    }
}

/// SQLSTATE code to report in an `ErrorResponse`.
impl Error {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            Error::Io(_) => "08006",
            Error::Protocol(_) => "08006",
            Error::BadStartup(_) => "08006",
            Error::PolicyRejected(_) => "08004",
            Error::BackendUnreachable(_) => "08001",
            Error::Tls(_) => "08001",
            Error::Config(_) => "XX000",
        }
    }
}
