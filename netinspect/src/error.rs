//! Error types for netinspect.
//!
//! Every failure that happens while a single device is being inspected is
//! captured as data and folded into that device's
//! [`InspectionResult`](crate::inspect::InspectionResult). Only [`Error`] ever
//! reaches the caller of [`Orchestrator::run`](crate::orchestrator::Orchestrator::run),
//! and only when the run cannot start at all.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Main error type for netinspect operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Session could not be established
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    /// A command failed on an open session
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// Artifact retrieval failed
    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    /// Datagram transfer protocol failure
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The device inventory could not be obtained
    #[error("Inventory error: {message}")]
    Inventory { message: String },

    /// Archive creation failed
    #[error("Archive error: {message}")]
    Archive { message: String },

    /// Local filesystem failure
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Classification of a failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectFailureKind {
    /// No answer within the connect timeout.
    Timeout,
    /// The device rejected the credentials.
    Authentication,
    /// The transport refused or dropped the connection.
    TransportRejected,
    /// Anything else.
    Unclassified,
}

impl ConnectFailureKind {
    /// Short label used in logs and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Authentication => "auth",
            Self::TransportRejected => "transport",
            Self::Unclassified => "unknown",
        }
    }
}

impl fmt::Display for ConnectFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure to open a management session to a device.
#[derive(Error, Debug, Clone)]
#[error("{kind} failure connecting to {host}: {message}")]
pub struct ConnectError {
    /// Device address.
    pub host: String,
    /// Failure classification.
    pub kind: ConnectFailureKind,
    /// Human-readable detail.
    pub message: String,
}

impl ConnectError {
    /// Create a connect error of the given kind.
    pub fn new(host: impl Into<String>, kind: ConnectFailureKind, message: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            kind,
            message: message.into(),
        }
    }

    /// Connection attempt timed out.
    pub fn timeout(host: impl Into<String>, after: Duration) -> Self {
        Self::new(
            host,
            ConnectFailureKind::Timeout,
            format!("no response within {after:?}"),
        )
    }

    /// Transport refused the connection.
    pub fn transport(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(host, ConnectFailureKind::TransportRejected, message)
    }

    /// Build a connect error from a transport-level failure.
    pub fn from_transport(host: impl Into<String>, err: &TransportError) -> Self {
        Self::new(host, err.classify(), err.to_string())
    }

    /// Build a connect error from a failure while waiting for the first prompt.
    pub fn from_command(host: impl Into<String>, err: &CommandError) -> Self {
        let kind = match err {
            CommandError::PromptTimeout(_) => ConnectFailureKind::Timeout,
            CommandError::LoginRejected { .. } => ConnectFailureKind::Authentication,
            CommandError::Closed => ConnectFailureKind::TransportRejected,
            CommandError::Transport(e) => e.classify(),
            CommandError::Rejected { .. } | CommandError::Elevation { .. } => {
                ConnectFailureKind::Unclassified
            }
        };
        Self::new(host, kind, err.to_string())
    }
}

/// Transport layer errors (TCP, SSH connection, authentication).
#[derive(Error, Debug)]
pub enum TransportError {
    /// Failed to connect to host
    #[error("Connection failed to {host}:{port}: {source}")]
    ConnectionFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// SSH handshake or protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Authentication failed
    #[error("Authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    /// Host key differs from the one in known_hosts
    #[error("Host key for {host}:{port} changed (known_hosts line {line})")]
    HostKeyChanged { host: String, port: u16, line: usize },

    /// Host key not in known_hosts and strict checking requested
    #[error("Host key for {host}:{port} is unknown")]
    HostKeyUnknown { host: String, port: u16 },

    /// known_hosts could not be read or written
    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    /// Connection was closed unexpectedly
    #[error("Connection disconnected")]
    Disconnected,

    /// Operation timed out
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Map a transport failure onto the connect taxonomy.
    pub fn classify(&self) -> ConnectFailureKind {
        match self {
            Self::Timeout(_) => ConnectFailureKind::Timeout,
            Self::AuthenticationFailed { .. } => ConnectFailureKind::Authentication,
            Self::ConnectionFailed { source, .. } if source.kind() == io::ErrorKind::TimedOut => {
                ConnectFailureKind::Timeout
            }
            Self::ConnectionFailed { .. }
            | Self::Ssh(_)
            | Self::HostKeyChanged { .. }
            | Self::HostKeyUnknown { .. }
            | Self::Disconnected => ConnectFailureKind::TransportRejected,
            Self::KnownHosts(_) | Self::Io(_) => ConnectFailureKind::Unclassified,
        }
    }
}

/// A single command failed on an open session. Never fatal to a flow.
#[derive(Error, Debug)]
pub enum CommandError {
    /// Prompt was not seen again in time
    #[error("Prompt not seen within {0:?}")]
    PromptTimeout(Duration),

    /// Session closed while waiting for output
    #[error("Session closed")]
    Closed,

    /// Output matched one of the vendor's failure markers
    #[error("Device reported '{pattern}'")]
    Rejected { pattern: String, output: String },

    /// In-band login was refused
    #[error("Login rejected: {message}")]
    LoginRejected { message: String },

    /// Privilege elevation did not reach the elevated prompt
    #[error("Privilege elevation failed: {message}")]
    Elevation { message: String },

    /// Underlying transport failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl CommandError {
    /// Device output captured alongside the failure, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Rejected { output, .. } if !output.is_empty() => Some(output),
            _ => None,
        }
    }
}

/// One transport's failure to fetch an artifact. Non-fatal until the whole
/// fallback chain is exhausted.
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// Transport cannot be used for this task
    #[error("Transport unavailable: {reason}")]
    Unavailable { reason: String },

    /// Connection level failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Datagram protocol failure
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Remote side refused the transfer
    #[error("Remote refused: {message}")]
    Remote { message: String },

    /// Reply did not follow the transfer protocol
    #[error("Unexpected reply: {message}")]
    Unexpected { message: String },

    /// None of the in-band viewing commands produced usable content
    #[error("No usable content from in-band commands")]
    NoContent,

    /// Transfer did not finish in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Local or socket I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure of a single datagram transfer attempt.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// No packet arrived within the receive timeout
    #[error("No packet received within {0:?}")]
    Timeout(Duration),

    /// Server sent an error packet
    #[error("Server error {code}: {message}")]
    Remote { code: u16, message: String },

    /// Data block out of sequence
    #[error("Expected block {expected}, received block {received}")]
    BlockMismatch { expected: u16, received: u16 },

    /// Packet too short or otherwise undecodable
    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// Opcode a read transfer never expects
    #[error("Unexpected opcode {0}")]
    UnexpectedOpcode(u16),

    /// Filename cannot be carried in a request packet
    #[error("Invalid filename '{0}'")]
    InvalidFilename(String),

    /// Socket or file error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure to assemble or deliver a notification mail.
#[derive(Error, Debug)]
pub enum NotifyError {
    /// Sender or recipient is not a valid mail address
    #[error("Invalid mail address '{address}': {source}")]
    Address {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },

    /// The message could not be assembled
    #[error("Cannot build message: {0}")]
    Message(#[from] lettre::error::Error),

    /// Attachment content type rejected
    #[error("Invalid content type: {0}")]
    ContentType(#[from] lettre::message::header::ContentTypeErr),

    /// Relay setup or delivery failed
    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Result type alias using netinspect's Error.
pub type Result<T> = std::result::Result<T, Error>;
