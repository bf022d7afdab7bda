//! MQTT reason codes
//!
//! v5.0 reason codes are used for both protocol versions; v3.1.1 CONNACK
//! return codes and SUBACK return codes are mapped onto them at decode time.

use std::fmt;

use serde::Serialize;

use super::QoS;

macro_rules! reason_codes {
    ($($(#[$doc:meta])* $name:ident = $code:literal => $text:literal,)+) => {
        /// MQTT v5.0 reason code
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
        #[repr(u8)]
        pub enum ReasonCode {
            #[default]
            $($(#[$doc])* $name = $code,)+
        }

        impl ReasonCode {
            /// Create a ReasonCode from its wire value
            pub fn from_u8(v: u8) -> Option<Self> {
                match v {
                    $($code => Some(ReasonCode::$name),)+
                    _ => None,
                }
            }

            /// Human readable text from the protocol tables
            pub fn as_str(self) -> &'static str {
                match self {
                    $(ReasonCode::$name => $text,)+
                }
            }
        }
    };
}

reason_codes! {
    /// Success / Normal disconnection / Granted QoS 0
    Success = 0x00 => "Success",
    GrantedQoS1 = 0x01 => "Granted QoS 1",
    GrantedQoS2 = 0x02 => "Granted QoS 2",
    DisconnectWithWill = 0x04 => "Disconnect with Will Message",
    NoMatchingSubscribers = 0x10 => "No matching subscribers",
    NoSubscriptionExisted = 0x11 => "No subscription existed",
    ContinueAuthentication = 0x18 => "Continue authentication",
    ReAuthenticate = 0x19 => "Re-authenticate",
    UnspecifiedError = 0x80 => "Unspecified error",
    MalformedPacket = 0x81 => "Malformed Packet",
    ProtocolError = 0x82 => "Protocol Error",
    ImplementationError = 0x83 => "Implementation specific error",
    UnsupportedProtocolVersion = 0x84 => "Unsupported Protocol Version",
    ClientIdNotValid = 0x85 => "Client Identifier not valid",
    BadUserNameOrPassword = 0x86 => "Bad User Name or Password",
    NotAuthorized = 0x87 => "Not authorized",
    ServerUnavailable = 0x88 => "Server unavailable",
    ServerBusy = 0x89 => "Server busy",
    Banned = 0x8A => "Banned",
    ServerShuttingDown = 0x8B => "Server shutting down",
    BadAuthenticationMethod = 0x8C => "Bad authentication method",
    KeepAliveTimeout = 0x8D => "Keep Alive timeout",
    SessionTakenOver = 0x8E => "Session taken over",
    TopicFilterInvalid = 0x8F => "Topic Filter invalid",
    TopicNameInvalid = 0x90 => "Topic Name invalid",
    PacketIdInUse = 0x91 => "Packet Identifier in use",
    PacketIdNotFound = 0x92 => "Packet Identifier not found",
    ReceiveMaxExceeded = 0x93 => "Receive Maximum exceeded",
    TopicAliasInvalid = 0x94 => "Topic Alias invalid",
    PacketTooLarge = 0x95 => "Packet too large",
    MessageRateTooHigh = 0x96 => "Message rate too high",
    QuotaExceeded = 0x97 => "Quota exceeded",
    AdministrativeAction = 0x98 => "Administrative action",
    PayloadFormatInvalid = 0x99 => "Payload format invalid",
    RetainNotSupported = 0x9A => "Retain not supported",
    QoSNotSupported = 0x9B => "QoS not supported",
    UseAnotherServer = 0x9C => "Use another server",
    ServerMoved = 0x9D => "Server moved",
    SharedSubsNotSupported = 0x9E => "Shared Subscriptions not supported",
    ConnectionRateExceeded = 0x9F => "Connection rate exceeded",
    MaximumConnectTime = 0xA0 => "Maximum connect time",
    SubIdNotSupported = 0xA1 => "Subscription Identifiers not supported",
    WildcardSubsNotSupported = 0xA2 => "Wildcard Subscriptions not supported",
}

impl ReasonCode {
    #[inline]
    pub fn is_success(self) -> bool {
        (self as u8) < 0x80
    }

    #[inline]
    pub fn is_error(self) -> bool {
        (self as u8) >= 0x80
    }

    /// Map an MQTT v3.1.1 CONNACK return code
    pub fn from_v3_connack_code(code: u8) -> Self {
        match code {
            0x00 => ReasonCode::Success,
            0x01 => ReasonCode::UnsupportedProtocolVersion,
            0x02 => ReasonCode::ClientIdNotValid,
            0x03 => ReasonCode::ServerUnavailable,
            0x04 => ReasonCode::BadUserNameOrPassword,
            0x05 => ReasonCode::NotAuthorized,
            _ => ReasonCode::UnspecifiedError,
        }
    }

    /// Map an MQTT v3.1.1 SUBACK return code
    pub fn from_v3_suback_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(ReasonCode::Success),
            0x01 => Some(ReasonCode::GrantedQoS1),
            0x02 => Some(ReasonCode::GrantedQoS2),
            0x80 => Some(ReasonCode::UnspecifiedError),
            _ => None,
        }
    }

    /// QoS granted by a successful SUBACK entry
    pub fn granted_qos(self) -> Option<QoS> {
        match self {
            ReasonCode::Success => Some(QoS::AtMostOnce),
            ReasonCode::GrantedQoS1 => Some(QoS::AtLeastOnce),
            ReasonCode::GrantedQoS2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.as_str(), *self as u8)
    }
}
