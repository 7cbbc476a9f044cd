//! Error types for kube-dnstap.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors that stop the collector. Returned from startup they are fatal.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The frame stream listener could not be bound.
    #[error("failed to bind dnstap listener on {addr}: {source}")]
    Bind {
        /// Requested listen address.
        addr: SocketAddr,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration sources could not be read or deserialized.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration was readable but invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration file watcher could not be started.
    #[error("failed to watch configuration: {0}")]
    Watch(#[from] notify::Error),

    /// Kubernetes client error.
    #[error("kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    /// The initial workload snapshot could not be taken.
    #[error("failed to load initial workload snapshot: {0}")]
    Snapshot(String),
}

/// Errors that cause a single raw record to be dropped.
#[derive(Debug, Error)]
pub enum RecordError {
    /// Protobuf decoding of the dnstap envelope failed.
    #[error("failed to decode dnstap envelope: {0}")]
    Envelope(#[from] prost::DecodeError),

    /// The dnstap frame carried something other than a `MESSAGE`.
    #[error("unsupported dnstap frame type {0}")]
    UnsupportedFrameType(i32),

    /// The dnstap frame had no `message` field.
    #[error("dnstap frame carries no message")]
    MissingMessage,

    /// Neither query nor response bytes were present.
    #[error("no DNS payload present")]
    MissingPayload,

    /// The message did not say who sent the query.
    #[error("no source address present")]
    MissingSourceAddress,

    /// The query address was not 4 or 16 bytes long.
    #[error("invalid source address of {0} bytes")]
    InvalidSourceAddress(usize),

    /// The embedded DNS message could not be unpacked.
    #[error("failed to unpack DNS message: {0}")]
    Dns(#[from] hickory_proto::ProtoError),
}

impl RecordError {
    /// Short label for the `reason` metric dimension.
    pub fn reason(&self) -> &'static str {
        match self {
            RecordError::Envelope(_) => "decode",
            RecordError::UnsupportedFrameType(_) => "frame_type",
            RecordError::MissingMessage => "no_message",
            RecordError::MissingPayload => "no_payload",
            RecordError::MissingSourceAddress | RecordError::InvalidSourceAddress(_) => {
                "source_address"
            }
            RecordError::Dns(_) => "dns_unpack",
        }
    }
}

/// Errors that close one frame stream connection.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Socket read or write failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A data frame exceeded the configured maximum.
    #[error("data frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Announced frame length.
        len: usize,
        /// Configured limit.
        max: usize,
    },

    /// A control frame exceeded the protocol maximum.
    #[error("control frame of {0} bytes exceeds protocol limit")]
    ControlFrameTooLarge(usize),

    /// A control frame could not be parsed.
    #[error("malformed control frame: {0}")]
    MalformedControl(&'static str),

    /// A control frame arrived in a state where it is not allowed.
    #[error("unexpected {got} control frame while {state}")]
    UnexpectedControl {
        /// Control frame received.
        got: &'static str,
        /// Handshake state at the time.
        state: &'static str,
    },

    /// The sender offered no content type we can decode.
    #[error("peer offered no supported content type")]
    ContentTypeMismatch,

    /// A data frame arrived before `START`.
    #[error("data frame received before START")]
    DataBeforeStart,
}
