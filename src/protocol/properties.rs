//! MQTT v5.0 properties
//!
//! Every property identifier is decoded so that unknown-to-us fields can be
//! skipped correctly, but only the fields a probe client reads or writes are
//! kept on [`Properties`].

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{
    read_binary, read_string, read_u16, read_u32, read_variable_int, variable_int_len,
    write_string, write_variable_int,
};
use crate::protocol::{DecodeError, EncodeError};

/// Property identifiers (MQTT v5.0 table 2-4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

/// Encoding of a property value on the wire
enum Wire {
    Byte,
    TwoByte,
    FourByte,
    VarInt,
    Utf8,
    Binary,
    Utf8Pair,
}

/// Decoded value before it is stored on [`Properties`]
enum Value<'a> {
    Int(u32),
    Str(&'a str),
    Bin(&'a [u8]),
    Pair(&'a str, &'a str),
}

impl PropertyId {
    pub fn from_u8(v: u8) -> Option<Self> {
        use PropertyId::*;
        let id = match v {
            0x01 => PayloadFormatIndicator,
            0x02 => MessageExpiryInterval,
            0x03 => ContentType,
            0x08 => ResponseTopic,
            0x09 => CorrelationData,
            0x0B => SubscriptionIdentifier,
            0x11 => SessionExpiryInterval,
            0x12 => AssignedClientIdentifier,
            0x13 => ServerKeepAlive,
            0x15 => AuthenticationMethod,
            0x16 => AuthenticationData,
            0x17 => RequestProblemInformation,
            0x18 => WillDelayInterval,
            0x19 => RequestResponseInformation,
            0x1A => ResponseInformation,
            0x1C => ServerReference,
            0x1F => ReasonString,
            0x21 => ReceiveMaximum,
            0x22 => TopicAliasMaximum,
            0x23 => TopicAlias,
            0x24 => MaximumQoS,
            0x25 => RetainAvailable,
            0x26 => UserProperty,
            0x27 => MaximumPacketSize,
            0x28 => WildcardSubscriptionAvailable,
            0x29 => SubscriptionIdentifierAvailable,
            0x2A => SharedSubscriptionAvailable,
            _ => return None,
        };
        Some(id)
    }

    fn wire(self) -> Wire {
        use PropertyId::*;
        match self {
            PayloadFormatIndicator
            | RequestProblemInformation
            | RequestResponseInformation
            | MaximumQoS
            | RetainAvailable
            | WildcardSubscriptionAvailable
            | SubscriptionIdentifierAvailable
            | SharedSubscriptionAvailable => Wire::Byte,
            ServerKeepAlive | ReceiveMaximum | TopicAliasMaximum | TopicAlias => Wire::TwoByte,
            MessageExpiryInterval
            | SessionExpiryInterval
            | WillDelayInterval
            | MaximumPacketSize => Wire::FourByte,
            SubscriptionIdentifier => Wire::VarInt,
            ContentType
            | ResponseTopic
            | AssignedClientIdentifier
            | AuthenticationMethod
            | ResponseInformation
            | ServerReference
            | ReasonString => Wire::Utf8,
            CorrelationData | AuthenticationData => Wire::Binary,
            UserProperty => Wire::Utf8Pair,
        }
    }

    /// Properties that may legitimately appear more than once
    fn repeatable(self) -> bool {
        matches!(
            self,
            PropertyId::UserProperty | PropertyId::SubscriptionIdentifier
        )
    }
}

/// MQTT v5.0 properties relevant to a probe client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub request_problem_information: Option<u8>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<u8>,
    pub subscription_identifier_available: Option<u8>,
    pub shared_subscription_available: Option<u8>,
    pub subscription_identifiers: Vec<u32>,
    pub server_reference: Option<String>,
    pub correlation_data: Option<Bytes>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Properties::default()
    }

    /// Encoded size of the properties, excluding the length prefix.
    ///
    /// Only the fields a client sends are encoded: session expiry, receive
    /// maximum, maximum packet size, topic alias maximum, request problem
    /// information and user properties.
    pub fn encoded_size(&self) -> usize {
        let mut size = 0;
        if self.session_expiry_interval.is_some() {
            size += 5;
        }
        if self.receive_maximum.is_some() {
            size += 3;
        }
        if self.maximum_packet_size.is_some() {
            size += 5;
        }
        if self.topic_alias_maximum.is_some() {
            size += 3;
        }
        if self.request_problem_information.is_some() {
            size += 2;
        }
        for (k, v) in &self.user_properties {
            size += 1 + 2 + k.len() + 2 + v.len();
        }
        size
    }

    /// Encode client-side properties, including the length prefix
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_variable_int(buf, self.encoded_size() as u32)?;

        if let Some(v) = self.session_expiry_interval {
            buf.put_u8(PropertyId::SessionExpiryInterval as u8);
            buf.put_u32(v);
        }
        if let Some(v) = self.receive_maximum {
            buf.put_u8(PropertyId::ReceiveMaximum as u8);
            buf.put_u16(v);
        }
        if let Some(v) = self.maximum_packet_size {
            buf.put_u8(PropertyId::MaximumPacketSize as u8);
            buf.put_u32(v);
        }
        if let Some(v) = self.topic_alias_maximum {
            buf.put_u8(PropertyId::TopicAliasMaximum as u8);
            buf.put_u16(v);
        }
        if let Some(v) = self.request_problem_information {
            buf.put_u8(PropertyId::RequestProblemInformation as u8);
            buf.put_u8(v);
        }
        for (k, v) in &self.user_properties {
            buf.put_u8(PropertyId::UserProperty as u8);
            write_string(buf, k)?;
            write_string(buf, v)?;
        }
        Ok(())
    }

    /// Length of the properties block (prefix included) when encoded
    pub fn encoded_len(&self) -> usize {
        let size = self.encoded_size();
        variable_int_len(size as u32) + size
    }

    /// Decode a properties block, returning the properties and the bytes
    /// consumed including the length prefix.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (prop_len, len_bytes) = read_variable_int(buf)?;
        let end = len_bytes + prop_len as usize;
        if buf.len() < end {
            return Err(DecodeError::InsufficientData);
        }

        let mut props = Properties::new();
        let mut seen: u64 = 0;
        let mut pos = len_bytes;

        while pos < end {
            let (raw_id, id_len) = read_variable_int(&buf[pos..end])?;
            pos += id_len;
            let id = u8::try_from(raw_id)
                .ok()
                .and_then(PropertyId::from_u8)
                .ok_or(DecodeError::InvalidPropertyId(raw_id as u8))?;

            let bit = 1u64 << (id as u8);
            if seen & bit != 0 && !id.repeatable() {
                return Err(DecodeError::DuplicateProperty(id as u8));
            }
            seen |= bit;

            let field = &buf[pos..end];
            let (value, used) = match id.wire() {
                Wire::Byte => {
                    let b = *field.first().ok_or(DecodeError::InsufficientData)?;
                    (Value::Int(b as u32), 1)
                }
                Wire::TwoByte => (Value::Int(read_u16(field)? as u32), 2),
                Wire::FourByte => (Value::Int(read_u32(field)?), 4),
                Wire::VarInt => {
                    let (v, n) = read_variable_int(field)?;
                    (Value::Int(v), n)
                }
                Wire::Utf8 => {
                    let (s, n) = read_string(field)?;
                    (Value::Str(s), n)
                }
                Wire::Binary => {
                    let (d, n) = read_binary(field)?;
                    (Value::Bin(d), n)
                }
                Wire::Utf8Pair => {
                    let (k, kn) = read_string(field)?;
                    let (v, vn) = read_string(&field[kn..])?;
                    (Value::Pair(k, v), kn + vn)
                }
            };
            pos += used;
            props.store(id, value)?;
        }

        Ok((props, end))
    }

    fn store(&mut self, id: PropertyId, value: Value<'_>) -> Result<(), DecodeError> {
        match (id, value) {
            (PropertyId::SessionExpiryInterval, Value::Int(v)) => {
                self.session_expiry_interval = Some(v)
            }
            (PropertyId::AssignedClientIdentifier, Value::Str(s)) => {
                self.assigned_client_identifier = Some(s.to_string())
            }
            (PropertyId::ServerKeepAlive, Value::Int(v)) => self.server_keep_alive = Some(v as u16),
            (PropertyId::RequestProblemInformation, Value::Int(v)) => {
                self.request_problem_information = Some(v as u8)
            }
            (PropertyId::ReasonString, Value::Str(s)) => self.reason_string = Some(s.to_string()),
            (PropertyId::ReceiveMaximum, Value::Int(v)) => {
                if v == 0 {
                    return Err(DecodeError::MalformedPacket("receive maximum cannot be 0"));
                }
                self.receive_maximum = Some(v as u16)
            }
            (PropertyId::TopicAliasMaximum, Value::Int(v)) => {
                self.topic_alias_maximum = Some(v as u16)
            }
            (PropertyId::TopicAlias, Value::Int(v)) => {
                if v == 0 {
                    return Err(DecodeError::MalformedPacket("topic alias cannot be 0"));
                }
                self.topic_alias = Some(v as u16)
            }
            (PropertyId::MaximumQoS, Value::Int(v)) => {
                if v > 1 {
                    return Err(DecodeError::MalformedPacket("maximum QoS must be 0 or 1"));
                }
                self.maximum_qos = Some(v as u8)
            }
            (PropertyId::RetainAvailable, Value::Int(v)) => self.retain_available = Some(v as u8),
            (PropertyId::UserProperty, Value::Pair(k, v)) => {
                self.user_properties.push((k.to_string(), v.to_string()))
            }
            (PropertyId::MaximumPacketSize, Value::Int(v)) => {
                if v == 0 {
                    return Err(DecodeError::MalformedPacket(
                        "maximum packet size cannot be 0",
                    ));
                }
                self.maximum_packet_size = Some(v)
            }
            (PropertyId::WildcardSubscriptionAvailable, Value::Int(v)) => {
                self.wildcard_subscription_available = Some(v as u8)
            }
            (PropertyId::SubscriptionIdentifierAvailable, Value::Int(v)) => {
                self.subscription_identifier_available = Some(v as u8)
            }
            (PropertyId::SharedSubscriptionAvailable, Value::Int(v)) => {
                self.shared_subscription_available = Some(v as u8)
            }
            (PropertyId::SubscriptionIdentifier, Value::Int(v)) => {
                if v == 0 {
                    return Err(DecodeError::MalformedPacket(
                        "subscription identifier cannot be 0",
                    ));
                }
                self.subscription_identifiers.push(v)
            }
            (PropertyId::ServerReference, Value::Str(s)) => {
                self.server_reference = Some(s.to_string())
            }
            (PropertyId::CorrelationData, Value::Bin(d)) => {
                self.correlation_data = Some(Bytes::copy_from_slice(d))
            }
            // Remaining properties are valid on the wire but carry nothing a
            // probe client acts on.
            _ => {}
        }
        Ok(())
    }
}
