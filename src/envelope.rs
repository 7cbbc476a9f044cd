//! dnstap envelope decoding.
//!
//! The protobuf types mirror `dnstap.proto`; only the fields the collector
//! reads or that tests need to build realistic frames are declared. Unknown
//! fields are skipped by the decoder.

use prost::Message as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::RecordError;

/// Protobuf schema for dnstap frames.
pub mod proto {
    /// Outer dnstap frame.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Dnstap {
        /// Server identity.
        #[prost(bytes = "vec", optional, tag = "1")]
        pub identity: Option<Vec<u8>>,
        /// Server version.
        #[prost(bytes = "vec", optional, tag = "2")]
        pub version: Option<Vec<u8>>,
        /// Opaque extra data.
        #[prost(bytes = "vec", optional, tag = "3")]
        pub extra: Option<Vec<u8>>,
        /// The DNS transaction, present when `type` is `MESSAGE`.
        #[prost(message, optional, tag = "14")]
        pub message: Option<Message>,
        /// Frame type.
        #[prost(enumeration = "dnstap::Type", required, tag = "15")]
        pub r#type: i32,
    }

    /// Nested types of [`Dnstap`].
    pub mod dnstap {
        /// Outer frame type.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
        #[repr(i32)]
        pub enum Type {
            /// Frame carries a [`super::Message`].
            Message = 1,
        }
    }

    /// One DNS transaction as seen by the server.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Message {
        /// Transaction kind.
        #[prost(enumeration = "message::Type", required, tag = "1")]
        pub r#type: i32,
        /// Address family of the transport.
        #[prost(enumeration = "SocketFamily", optional, tag = "2")]
        pub socket_family: Option<i32>,
        /// Transport protocol.
        #[prost(enumeration = "SocketProtocol", optional, tag = "3")]
        pub socket_protocol: Option<i32>,
        /// Address of the query initiator.
        #[prost(bytes = "vec", optional, tag = "4")]
        pub query_address: Option<Vec<u8>>,
        /// Address of the responder.
        #[prost(bytes = "vec", optional, tag = "5")]
        pub response_address: Option<Vec<u8>>,
        /// Port of the query initiator.
        #[prost(uint32, optional, tag = "6")]
        pub query_port: Option<u32>,
        /// Port of the responder.
        #[prost(uint32, optional, tag = "7")]
        pub response_port: Option<u32>,
        /// Query time, seconds.
        #[prost(uint64, optional, tag = "8")]
        pub query_time_sec: Option<u64>,
        /// Query time, nanoseconds.
        #[prost(fixed32, optional, tag = "9")]
        pub query_time_nsec: Option<u32>,
        /// Wire-format DNS query.
        #[prost(bytes = "vec", optional, tag = "10")]
        pub query_message: Option<Vec<u8>>,
        /// Zone of the query, wire-format name.
        #[prost(bytes = "vec", optional, tag = "11")]
        pub query_zone: Option<Vec<u8>>,
        /// Response time, seconds.
        #[prost(uint64, optional, tag = "12")]
        pub response_time_sec: Option<u64>,
        /// Response time, nanoseconds.
        #[prost(fixed32, optional, tag = "13")]
        pub response_time_nsec: Option<u32>,
        /// Wire-format DNS response.
        #[prost(bytes = "vec", optional, tag = "14")]
        pub response_message: Option<Vec<u8>>,
    }

    /// Nested types of [`Message`].
    pub mod message {
        /// Transaction kind.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
        #[repr(i32)]
        pub enum Type {
            /// Query received by an authoritative server.
            AuthQuery = 1,
            /// Response sent by an authoritative server.
            AuthResponse = 2,
            /// Query sent by a resolver upstream.
            ResolverQuery = 3,
            /// Response received by a resolver from upstream.
            ResolverResponse = 4,
            /// Query received from a client.
            ClientQuery = 5,
            /// Response sent to a client.
            ClientResponse = 6,
            /// Query forwarded upstream.
            ForwarderQuery = 7,
            /// Response to a forwarded query.
            ForwarderResponse = 8,
            /// Query sent by a stub resolver.
            StubQuery = 9,
            /// Response received by a stub resolver.
            StubResponse = 10,
            /// Query sent by a tool.
            ToolQuery = 11,
            /// Response received by a tool.
            ToolResponse = 12,
            /// Dynamic update query.
            UpdateQuery = 13,
            /// Dynamic update response.
            UpdateResponse = 14,
        }
    }

    /// Transport address family.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum SocketFamily {
        /// IPv4.
        Inet = 1,
        /// IPv6.
        Inet6 = 2,
    }

    /// Transport protocol.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum SocketProtocol {
        /// Plain UDP.
        Udp = 1,
        /// Plain TCP.
        Tcp = 2,
        /// DNS over TLS.
        Dot = 3,
        /// DNS over HTTPS.
        Doh = 4,
        /// DNSCrypt over UDP.
        DnsCryptUdp = 5,
        /// DNSCrypt over TCP.
        DnsCryptTcp = 6,
        /// DNS over QUIC.
        Doq = 7,
    }
}

pub use proto::message::Type as MessageKind;

/// Content type negotiated on the frame stream.
pub const CONTENT_TYPE: &[u8] = b"protobuf:dnstap.Dnstap";

/// Transaction kind as decoded from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// A known dnstap message type.
    Known(MessageKind),
    /// A value newer than this schema.
    Unknown(i32),
}

impl Kind {
    fn from_wire(value: i32) -> Self {
        MessageKind::try_from(value)
            .map(Kind::Known)
            .unwrap_or(Kind::Unknown(value))
    }

    /// True for queries as issued by a client.
    pub fn is_client_query(self) -> bool {
        self == Kind::Known(MessageKind::ClientQuery)
    }
}

/// A decoded dnstap transaction.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Transaction kind.
    pub kind: Kind,
    /// Raw address of the query initiator, as carried on the wire.
    pub query_address: Option<Vec<u8>>,
    /// Wire-format DNS query.
    pub query_message: Option<Vec<u8>>,
    /// Wire-format DNS response.
    pub response_message: Option<Vec<u8>>,
}

impl Envelope {
    /// Decode one raw frame.
    pub fn decode(raw: &[u8]) -> Result<Self, RecordError> {
        let frame = proto::Dnstap::decode(raw)?;

        if proto::dnstap::Type::try_from(frame.r#type).ok() != Some(proto::dnstap::Type::Message) {
            return Err(RecordError::UnsupportedFrameType(frame.r#type));
        }

        let message = frame.message.ok_or(RecordError::MissingMessage)?;

        Ok(Self {
            kind: Kind::from_wire(message.r#type),
            query_address: message.query_address,
            query_message: message.query_message,
            response_message: message.response_message,
        })
    }

    /// Address of the query initiator.
    ///
    /// Parsed on demand so that records which are never attributed, such
    /// as resolver responses, are not rejected for carrying no address.
    pub fn source_address(&self) -> Result<IpAddr, RecordError> {
        self.query_address
            .as_deref()
            .ok_or(RecordError::MissingSourceAddress)
            .and_then(parse_address)
    }

    /// The DNS message to extract questions from: the query when present,
    /// otherwise the response.
    pub fn dns_payload(&self) -> Result<&[u8], RecordError> {
        self.query_message
            .as_deref()
            .or(self.response_message.as_deref())
            .ok_or(RecordError::MissingPayload)
    }
}

fn parse_address(bytes: &[u8]) -> Result<IpAddr, RecordError> {
    match bytes.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(bytes);
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        len => Err(RecordError::InvalidSourceAddress(len)),
    }
}

/// Encode a client query frame.
pub fn encode_client_query(source: IpAddr, query_message: Vec<u8>) -> Vec<u8> {
    encode_message(MessageKind::ClientQuery, source, Some(query_message), None)
}

/// Encode a frame of any kind.
pub fn encode_message(
    kind: MessageKind,
    source: IpAddr,
    query_message: Option<Vec<u8>>,
    response_message: Option<Vec<u8>>,
) -> Vec<u8> {
    let (family, address) = match source {
        IpAddr::V4(v4) => (proto::SocketFamily::Inet, v4.octets().to_vec()),
        IpAddr::V6(v6) => (proto::SocketFamily::Inet6, v6.octets().to_vec()),
    };

    proto::Dnstap {
        identity: Some(b"kube-dnstap".to_vec()),
        version: None,
        extra: None,
        message: Some(proto::Message {
            r#type: kind as i32,
            socket_family: Some(family as i32),
            socket_protocol: Some(proto::SocketProtocol::Udp as i32),
            query_address: Some(address),
            query_message,
            response_message,
            ..Default::default()
        }),
        r#type: proto::dnstap::Type::Message as i32,
    }
    .encode_to_vec()
}
