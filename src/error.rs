//! Unified error types for the tickrpc server.
//!
//! A single `Error` enum that every subsystem converts into, keeping the
//! binary's startup and shutdown handling uniform. Failures that travel back
//! to clients are not errors in this sense; they are [`Failure`] payloads
//! inside a [`Response`].
//!
//! [`Failure`]: crate::rpc::messages::Failure
//! [`Response`]: crate::rpc::messages::Response

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation outside the dispatch path funnels into this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A frame could not be decoded or encoded.
    Frame(FrameError),
    /// The byte stream underneath a connection failed.
    Transport(TransportError),
    /// Configuration is invalid or could not be loaded.
    Config(ConfigError),
    /// The procedure catalogue could not be built.
    Catalogue(CatalogueError),
    /// A listener could not be bound or the I/O thread could not start.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(e) => write!(f, "frame: {e}"),
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Catalogue(e) => write!(f, "catalogue: {e}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Framing errors
// ---------------------------------------------------------------------------

/// Terminal framing failures. Running out of buffered bytes is not one of
/// these; the codec reports it as [`Decoded::InsufficientData`].
///
/// [`Decoded::InsufficientData`]: crate::rpc::codec::Decoded::InsufficientData
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The varint length prefix is longer than 10 bytes or overflows.
    BadLengthPrefix,
    /// The declared payload length exceeds the configured maximum.
    TooLarge { len: u64, max: usize },
    /// The payload did not parse into the expected message.
    Malformed(String),
    /// A message could not be serialised.
    Encode(String),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadLengthPrefix => write!(f, "malformed length prefix"),
            Self::TooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds maximum of {max}")
            }
            Self::Malformed(msg) => write!(f, "malformed message: {msg}"),
            Self::Encode(msg) => write!(f, "encode failed: {msg}"),
        }
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer closed the stream, or it was closed locally.
    Closed,
    /// The underlying I/O call failed.
    Io(std::io::ErrorKind),
    /// The peer stopped taking our output.
    Stalled,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Io(kind) => write!(f, "i/o error: {kind}"),
            Self::Stalled => write!(f, "peer is not reading"),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => Self::Closed,
            kind => Self::Io(kind),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The configuration file could not be read.
    Read(String),
    /// The configuration file is not valid JSON for [`ServerConfig`].
    ///
    /// [`ServerConfig`]: crate::config::ServerConfig
    Parse(String),
    /// A value is out of its accepted range.
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(msg) => write!(f, "cannot read config: {msg}"),
            Self::Parse(msg) => write!(f, "cannot parse config: {msg}"),
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// ---------------------------------------------------------------------------
// Catalogue errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogueError {
    /// The same (service, procedure) pair was registered twice.
    Duplicate { service: String, procedure: String },
    /// A service or procedure name is empty or contains a '.'.
    InvalidName(String),
    /// A parameter without a default follows one with a default.
    DefaultOrder { service: String, procedure: String },
}

impl fmt::Display for CatalogueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate { service, procedure } => {
                write!(f, "{service}.{procedure} registered twice")
            }
            Self::InvalidName(name) => write!(f, "invalid name '{name}'"),
            Self::DefaultOrder { service, procedure } => write!(
                f,
                "{service}.{procedure}: required parameter after a defaulted one"
            ),
        }
    }
}

impl From<CatalogueError> for Error {
    fn from(e: CatalogueError) -> Self {
        Self::Catalogue(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

impl std::error::Error for FrameError {}
impl std::error::Error for TransportError {}
impl std::error::Error for ConfigError {}
impl std::error::Error for CatalogueError {}

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
