//! Packet codec.
//!
//! 20-byte big-endian fixed header, optional extension chain, payload:
//!
//! ```text
//! byte 0:      (type << 4) | version
//! byte 1:      first extension id (0 = none)
//! bytes 2-3:   connection_id
//! bytes 4-7:   timestamp_micros
//! bytes 8-11:  timestamp_diff_micros
//! bytes 12-15: wnd_size
//! bytes 16-17: seq_nr
//! bytes 18-19: ack_nr
//! [next_ext(1) | len(1) | data(len)]*
//! payload...
//! ```

use crate::error::{Result, UtpError};
use crate::protocol::{
    EXTENSION_NONE, EXTENSION_SELECTIVE_ACK, HEADER_SIZE, PacketType,
    SelectiveAck, VERSION,
};
use bytes::{BufMut, Bytes, BytesMut};
use opal_binary::{BinaryError, BinaryReader, BinaryWriter, Readable, Writable};

/// One wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub connection_id: u16,
    pub timestamp_micros: u32,
    pub timestamp_diff_micros: u32,
    pub wnd_size: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
    pub selective_ack: Option<SelectiveAck>,
    pub payload: Bytes,
}

impl Packet {
    /// A header-only packet; timestamps and window are stamped at send.
    pub fn new(packet_type: PacketType, connection_id: u16, seq_nr: u16, ack_nr: u16) -> Self {
        Self {
            packet_type,
            connection_id,
            timestamp_micros: 0,
            timestamp_diff_micros: 0,
            wnd_size: 0,
            seq_nr,
            ack_nr,
            selective_ack: None,
            payload: Bytes::new(),
        }
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        let ext = if self.selective_ack.is_some() { 6 } else { 0 };
        HEADER_SIZE + ext + self.payload.len()
    }

    /// Serializes into a fresh buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        // Writes into BytesMut cannot fail.
        self.write(&mut buf).expect("infallible encode");
        buf.freeze()
    }

    /// Parses one packet, consuming the whole datagram.
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let first = buf.read_u8()?;
        let version = first & 0x0F;
        if version != VERSION {
            return Err(UtpError::UnsupportedVersion(version));
        }
        let packet_type = PacketType::from_u8(first >> 4)
            .ok_or(UtpError::UnknownPacketType(first >> 4))?;

        let mut next_ext = buf.read_u8()?;
        let connection_id = buf.read_u16_be()?;
        let timestamp_micros = buf.read_u32_be()?;
        let timestamp_diff_micros = buf.read_u32_be()?;
        let wnd_size = buf.read_u32_be()?;
        let seq_nr = buf.read_u16_be()?;
        let ack_nr = buf.read_u16_be()?;

        // Walk the extension chain until the terminating 0 id. Unknown
        // extensions are skipped by their declared length.
        let mut selective_ack = None;
        while next_ext != EXTENSION_NONE {
            let current = next_ext;
            next_ext = buf.read_u8()?;
            let len = buf.read_u8()? as usize;
            let data = buf.read_bytes(len)?;
            if current == EXTENSION_SELECTIVE_ACK {
                if len < 4 {
                    return Err(UtpError::Binary(BinaryError::InvalidData(format!(
                        "selective ack extension too short: {len} bytes"
                    ))));
                }
                let mut mask = [0u8; 4];
                mask.copy_from_slice(&data[..4]);
                selective_ack = Some(SelectiveAck::from_mask(mask));
            }
        }

        Ok(Self {
            packet_type,
            connection_id,
            timestamp_micros,
            timestamp_diff_micros,
            wnd_size,
            seq_nr,
            ack_nr,
            selective_ack,
            payload: buf.read_rest(),
        })
    }
}

impl Writable for Packet {
    fn write<B: BufMut>(&self, writer: &mut B) -> opal_binary::Result<()> {
        let first_ext = if self.selective_ack.is_some() {
            EXTENSION_SELECTIVE_ACK
        } else {
            EXTENSION_NONE
        };
        writer.write_u8(((self.packet_type as u8) << 4) | VERSION)?;
        writer.write_u8(first_ext)?;
        writer.write_u16_be(self.connection_id)?;
        writer.write_u32_be(self.timestamp_micros)?;
        writer.write_u32_be(self.timestamp_diff_micros)?;
        writer.write_u32_be(self.wnd_size)?;
        writer.write_u16_be(self.seq_nr)?;
        writer.write_u16_be(self.ack_nr)?;
        if let Some(ack) = &self.selective_ack {
            writer.write_u8(EXTENSION_NONE)?;
            writer.write_u8(4)?;
            ack.write(writer)?;
        }
        writer.write_bytes(&self.payload)?;
        Ok(())
    }
}

impl Readable for Packet {
    fn read<B: bytes::Buf>(reader: &mut B) -> opal_binary::Result<Self> {
        let rest = reader.read_rest();
        Packet::decode(rest).map_err(|err| match err {
            UtpError::Binary(inner) => inner,
            other => BinaryError::InvalidData(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_DATA_PAYLOAD;

    #[test]
    fn test_header_golden_bytes() {
        let mut packet = Packet::new(PacketType::Data, 0x1234, 0x0102, 0x0304);
        packet.timestamp_micros = 0xAABBCCDD;
        packet.timestamp_diff_micros = 0x00000042;
        packet.wnd_size = 0x00100000;
        packet.payload = Bytes::from_static(b"hi");

        let encoded = packet.encode();
        let expected: &[u8] = &[
            0x01, // Data << 4 | version 1
            0x00, // no extensions
            0x12, 0x34, // connection id
            0xAA, 0xBB, 0xCC, 0xDD, // timestamp
            0x00, 0x00, 0x00, 0x42, // timestamp diff
            0x00, 0x10, 0x00, 0x00, // window
            0x01, 0x02, // seq
            0x03, 0x04, // ack
            b'h', b'i',
        ];
        assert_eq!(&encoded[..], expected);
    }

    #[test]
    fn test_selective_ack_wire_layout() {
        let mut packet = Packet::new(PacketType::State, 9, 100, 50);
        packet.selective_ack =
            Some(SelectiveAck::from_received(50, |seq| seq == 52 || seq == 83));

        let encoded = packet.encode();
        assert_eq!(encoded.len(), HEADER_SIZE + 6);
        assert_eq!(encoded[0], 0x21); // State << 4 | version
        assert_eq!(encoded[1], EXTENSION_SELECTIVE_ACK);
        assert_eq!(encoded[HEADER_SIZE], EXTENSION_NONE); // chain terminator
        assert_eq!(encoded[HEADER_SIZE + 1], 4); // mask length
        // Offsets 0 and 31 sit on flat bits 7 and 24.
        assert_eq!(&encoded[HEADER_SIZE + 2..], &[0x01, 0x00, 0x00, 0x80]);
    }

    #[test]
    fn test_round_trip_all_types() {
        for ty in [
            PacketType::Syn,
            PacketType::State,
            PacketType::Data,
            PacketType::Fin,
            PacketType::Reset,
        ] {
            let mut packet = Packet::new(ty, 77, 1000, 2000);
            packet.timestamp_micros = 123_456;
            packet.timestamp_diff_micros = 7_890;
            packet.wnd_size = 48_000;
            if ty == PacketType::Data {
                packet.payload = Bytes::from(vec![0xAB; MAX_DATA_PAYLOAD]);
            }
            if ty == PacketType::State {
                packet.selective_ack =
                    Some(SelectiveAck::from_received(2000, |seq| seq % 3 == 0));
            }

            let encoded = packet.encode();
            let decoded = Packet::decode(encoded.clone()).unwrap();
            assert_eq!(decoded, packet);
            // Byte-identical re-encode.
            assert_eq!(decoded.encode(), encoded);
        }
    }

    #[test]
    fn test_readable_trait_matches_decode() {
        let mut packet = Packet::new(PacketType::Data, 5, 10, 20);
        packet.payload = Bytes::from_static(b"abc");
        let encoded = packet.encode();

        let mut buf = encoded.clone();
        let via_trait = Packet::read(&mut buf).unwrap();
        assert_eq!(via_trait, Packet::decode(encoded).unwrap());
    }

    #[test]
    fn test_rejects_bad_version() {
        let mut encoded = BytesMut::from(&Packet::new(PacketType::Syn, 1, 2, 3).encode()[..]);
        encoded[0] = (4 << 4) | 0x02;
        let err = Packet::decode(encoded.freeze()).unwrap_err();
        assert!(matches!(err, UtpError::UnsupportedVersion(2)));
    }

    #[test]
    fn test_rejects_unknown_type() {
        let mut encoded = BytesMut::from(&Packet::new(PacketType::Syn, 1, 2, 3).encode()[..]);
        encoded[0] = (7 << 4) | VERSION;
        let err = Packet::decode(encoded.freeze()).unwrap_err();
        assert!(matches!(err, UtpError::UnknownPacketType(7)));
    }

    #[test]
    fn test_rejects_truncated_header() {
        let encoded = Packet::new(PacketType::State, 1, 2, 3).encode();
        let err = Packet::decode(encoded.slice(..HEADER_SIZE - 3)).unwrap_err();
        assert!(matches!(err, UtpError::Binary(BinaryError::UnexpectedEof { .. })));
    }

    #[test]
    fn test_rejects_truncated_extension_chain() {
        let mut raw = BytesMut::from(&Packet::new(PacketType::State, 1, 2, 3).encode()[..]);
        raw[1] = EXTENSION_SELECTIVE_ACK;
        // Chain promises data that is not there.
        raw.put_u8(EXTENSION_NONE);
        raw.put_u8(4);
        raw.put_u8(0xFF);
        let err = Packet::decode(raw.freeze()).unwrap_err();
        assert!(matches!(err, UtpError::Binary(BinaryError::UnexpectedEof { .. })));
    }

    #[test]
    fn test_skips_unknown_extension() {
        let mut raw = BytesMut::from(&Packet::new(PacketType::Data, 1, 2, 3).encode()[..]);
        raw[1] = 0x77; // some extension we do not understand
        raw.put_u8(EXTENSION_NONE);
        raw.put_u8(3);
        raw.put_slice(&[9, 9, 9]);
        raw.put_slice(b"payload");

        let decoded = Packet::decode(raw.freeze()).unwrap();
        assert_eq!(decoded.selective_ack, None);
        assert_eq!(decoded.payload, Bytes::from_static(b"payload"));
    }
}
