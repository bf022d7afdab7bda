//! Encoder for packets sent by a client

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    Ack, Connect, Disconnect, EncodeError, Packet, ProtocolVersion, Publish, QoS, ReasonCode,
    Subscribe,
};

/// MQTT packet encoder for one client connection
pub struct Encoder {
    protocol_version: ProtocolVersion,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            protocol_version: version,
        }
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == ProtocolVersion::V5
    }

    /// Append the encoded packet to `buf`
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PubAck(ack) => self.encode_ack(0x40, ack, buf),
            Packet::PubRec(ack) => self.encode_ack(0x50, ack, buf),
            Packet::PubRel(ack) => self.encode_ack(0x62, ack, buf),
            Packet::PubComp(ack) => self.encode_ack(0x70, ack, buf),
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::Disconnect(p) => self.encode_disconnect(p, buf),
            other => Err(EncodeError::UnsupportedPacket(other.packet_type())),
        }
    }

    /// Size the encoded packet would occupy on the wire
    pub fn encoded_len(&self, packet: &Packet) -> Result<usize, EncodeError> {
        let mut buf = BytesMut::new();
        self.encode(packet, &mut buf)?;
        Ok(buf.len())
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let is_v5 = packet.protocol_version == ProtocolVersion::V5;

        // "MQTT" + level + flags + keep alive
        let mut remaining_length = 6 + 1 + 1 + 2;
        if is_v5 {
            remaining_length += packet.properties.encoded_len();
        }
        remaining_length += 2 + packet.client_id.len();
        if let Some(ref username) = packet.username {
            remaining_length += 2 + username.len();
        }
        if let Some(ref password) = packet.password {
            remaining_length += 2 + password.len();
        }

        buf.put_u8(0x10);
        write_variable_int(buf, remaining_length as u32)?;
        write_string(buf, "MQTT")?;
        buf.put_u8(packet.protocol_version as u8);

        let mut connect_flags: u8 = 0;
        if packet.clean_start {
            connect_flags |= 0x02;
        }
        if packet.password.is_some() {
            connect_flags |= 0x40;
        }
        if packet.username.is_some() {
            connect_flags |= 0x80;
        }
        buf.put_u8(connect_flags);
        buf.put_u16(packet.keep_alive);

        if is_v5 {
            packet.properties.encode(buf)?;
        }

        write_string(buf, &packet.client_id)?;
        if let Some(ref username) = packet.username {
            write_string(buf, username)?;
        }
        if let Some(ref password) = packet.password {
            write_binary(buf, password)?;
        }

        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining_length = 2 + packet.topic.len();
        if packet.qos != QoS::AtMostOnce {
            remaining_length += 2;
        }
        if self.is_v5() {
            remaining_length += packet.properties.encoded_len();
        }
        remaining_length += packet.payload.len();

        let mut first_byte: u8 = 0x30 | ((packet.qos as u8) << 1);
        if packet.dup {
            first_byte |= 0x08;
        }
        if packet.retain {
            first_byte |= 0x01;
        }
        buf.put_u8(first_byte);
        write_variable_int(buf, remaining_length as u32)?;

        write_string(buf, &packet.topic)?;
        if packet.qos != QoS::AtMostOnce {
            buf.put_u16(packet.packet_id.unwrap_or_default());
        }
        if self.is_v5() {
            packet.properties.encode(buf)?;
        }
        buf.put_slice(&packet.payload);

        Ok(())
    }

    /// PUBACK / PUBREC / PUBREL / PUBCOMP. On v5 the reason code and
    /// properties are omitted when the reason is Success and there are no
    /// properties.
    fn encode_ack(&self, first_byte: u8, ack: &Ack, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(first_byte);

        let short = !self.is_v5()
            || (ack.reason_code == ReasonCode::Success && ack.properties.is_empty());
        if short {
            buf.put_u8(0x02);
            buf.put_u16(ack.packet_id);
            return Ok(());
        }

        let has_props = !ack.properties.is_empty();
        let mut remaining_length = 2 + 1;
        if has_props {
            remaining_length += ack.properties.encoded_len();
        }
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(ack.packet_id);
        buf.put_u8(ack.reason_code as u8);
        if has_props {
            ack.properties.encode(buf)?;
        }
        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining_length = 2;
        if self.is_v5() {
            remaining_length += packet.properties.encoded_len();
        }
        for sub in &packet.subscriptions {
            remaining_length += 2 + sub.filter.len() + 1;
        }

        buf.put_u8(0x82);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        if self.is_v5() {
            packet.properties.encode(buf)?;
        }
        for sub in &packet.subscriptions {
            write_string(buf, &sub.filter)?;
            // v5 subscription options with no-local, retain-as-published and
            // retain handling all zero share the v3.1.1 layout.
            buf.put_u8(sub.qos as u8);
        }

        Ok(())
    }

    fn encode_disconnect(
        &self,
        packet: &Disconnect,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        buf.put_u8(0xE0);

        if !self.is_v5()
            || (packet.reason_code == ReasonCode::Success && packet.properties.is_empty())
        {
            buf.put_u8(0x00);
            return Ok(());
        }

        let remaining_length = 1 + packet.properties.encoded_len();
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u8(packet.reason_code as u8);
        packet.properties.encode(buf)?;
        Ok(())
    }
}
