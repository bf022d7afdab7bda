//! Protocol error types

use std::fmt;

/// Errors that can occur while decoding a packet received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data in buffer
    InsufficientData,
    /// Packet type a broker never sends to a client
    InvalidPacketType(u8),
    /// Invalid remaining length encoding
    InvalidRemainingLength,
    /// Invalid QoS value
    InvalidQoS(u8),
    /// Invalid UTF-8 string
    InvalidUtf8,
    /// Invalid property identifier
    InvalidPropertyId(u8),
    /// Duplicate property (not allowed)
    DuplicateProperty(u8),
    /// Invalid packet flags
    InvalidFlags,
    /// Malformed packet
    MalformedPacket(&'static str),
    /// Packet larger than this client accepts
    PacketTooLarge,
    /// Invalid reason code
    InvalidReasonCode(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::InvalidPacketType(t) => write!(f, "unexpected packet type: {}", t),
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::InvalidPropertyId(id) => write!(f, "invalid property identifier: {}", id),
            Self::DuplicateProperty(id) => write!(f, "duplicate property: {}", id),
            Self::InvalidFlags => write!(f, "invalid packet flags"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::InvalidReasonCode(r) => write!(f, "invalid reason code: {}", r),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur while encoding a packet for the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length exceeds the protocol maximum
    PacketTooLarge,
    /// String or binary field longer than 65535 bytes
    StringTooLong,
    /// Packet type a client never sends
    UnsupportedPacket(u8),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string too long"),
            Self::UnsupportedPacket(t) => write!(f, "client cannot send packet type {}", t),
        }
    }
}

impl std::error::Error for EncodeError {}
