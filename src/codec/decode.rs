//! Decoder for packets sent by a broker

use bytes::Bytes;

use super::{read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    Ack, ConnAck, DecodeError, Disconnect, Packet, Properties, ProtocolVersion, Publish, QoS,
    ReasonCode, SubAck,
};

/// MQTT packet decoder for one client connection
pub struct Decoder {
    max_packet_size: usize,
    protocol_version: ProtocolVersion,
}

impl Decoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
            protocol_version: version,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == ProtocolVersion::V5
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` until a complete packet is buffered, otherwise the
    /// packet and the number of bytes it occupied.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let packet_type = buf[0] >> 4;
        let flags = buf[0] & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            2 => self.decode_connack(flags, body)?,
            3 => self.decode_publish(flags, body)?,
            4 => Packet::PubAck(self.decode_ack(flags, 0x00, body)?),
            5 => Packet::PubRec(self.decode_ack(flags, 0x00, body)?),
            6 => Packet::PubRel(self.decode_ack(flags, 0x02, body)?),
            7 => Packet::PubComp(self.decode_ack(flags, 0x00, body)?),
            9 => self.decode_suback(flags, body)?,
            13 => {
                if flags != 0 || !body.is_empty() {
                    return Err(DecodeError::MalformedPacket("invalid PINGRESP"));
                }
                Packet::PingResp
            }
            14 => self.decode_disconnect(flags, body)?,
            other => return Err(DecodeError::InvalidPacketType(other)),
        };

        Ok(Some((packet, total_len)))
    }

    fn decode_connack(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if body.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        // Only bit 0 (session present) may be set
        if body[0] & 0xFE != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let session_present = body[0] & 0x01 != 0;

        let connack = if self.is_v5() {
            let reason_code =
                ReasonCode::from_u8(body[1]).ok_or(DecodeError::InvalidReasonCode(body[1]))?;
            // Some brokers omit the property length on a refusal
            let properties = if body.len() > 2 {
                Properties::decode(&body[2..])?.0
            } else {
                Properties::default()
            };
            ConnAck {
                session_present,
                reason_code,
                properties,
            }
        } else {
            ConnAck {
                session_present,
                reason_code: ReasonCode::from_v3_connack_code(body[1]),
                properties: Properties::default(),
            }
        };

        Ok(Packet::ConnAck(connack))
    }

    fn decode_publish(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        let dup = flags & 0x08 != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = flags & 0x01 != 0;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        let (topic, mut pos) = read_string(body)?;

        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            let id = read_u16(&body[pos..])?;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        };

        let properties = if self.is_v5() {
            let (props, len) = Properties::decode(&body[pos..])?;
            pos += len;
            props
        } else {
            Properties::default()
        };

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(&body[pos..]),
            properties,
        }))
    }

    /// PUBACK, PUBREC, PUBREL and PUBCOMP share one layout; PUBREL carries
    /// fixed header flags 0010.
    fn decode_ack(&self, flags: u8, expected_flags: u8, body: &[u8]) -> Result<Ack, DecodeError> {
        if flags != expected_flags {
            return Err(DecodeError::InvalidFlags);
        }
        let mut ack = Ack::new(read_u16(body)?);

        if self.is_v5() && body.len() > 2 {
            ack.reason_code =
                ReasonCode::from_u8(body[2]).ok_or(DecodeError::InvalidReasonCode(body[2]))?;
            if body.len() > 3 {
                ack.properties = Properties::decode(&body[3..])?.0;
            }
        }

        Ok(ack)
    }

    fn decode_suback(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let packet_id = read_u16(body)?;
        let mut pos = 2;

        let properties = if self.is_v5() {
            let (props, len) = Properties::decode(&body[pos..])?;
            pos += len;
            props
        } else {
            Properties::default()
        };

        let reason_codes = body[pos..]
            .iter()
            .map(|&code| {
                let reason = if self.is_v5() {
                    ReasonCode::from_u8(code)
                } else {
                    ReasonCode::from_v3_suback_code(code)
                };
                reason.ok_or(DecodeError::InvalidReasonCode(code))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if reason_codes.is_empty() {
            return Err(DecodeError::MalformedPacket("SUBACK without reason codes"));
        }

        Ok(Packet::SubAck(SubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_disconnect(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        // A v3.1.1 broker never sends DISCONNECT; v5 may, with an optional
        // reason code and properties.
        if !self.is_v5() {
            return Err(DecodeError::InvalidPacketType(14));
        }

        let mut disconnect = Disconnect::default();
        if let Some(&code) = body.first() {
            disconnect.reason_code =
                ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?;
            if body.len() > 1 {
                disconnect.properties = Properties::decode(&body[1..])?.0;
            }
        }

        Ok(Packet::Disconnect(disconnect))
    }
}
