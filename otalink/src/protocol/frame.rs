//! OTA frame format and codec.
//!
//! Every message on the link is one self-delimited frame:
//!
//! ```text
//! +-----+------+--------+-----------------+---------+-----+
//! | SOF | Type | Length |     Payload     |  CRC32  | EOF |
//! +-----+------+--------+-----------------+---------+-----+
//! |  1  |  1   |   2    |   Length bytes  |    4    |  1  |
//! +-----+------+--------+-----------------+---------+-----+
//! ```
//!
//! Multi-byte fields are little-endian. The CRC covers the payload only.
//! There is no byte stuffing: the length is explicit, so marker values inside
//! the payload need no escaping.
//!
//! Framing constants differ between protocol revisions, so they live in a
//! [`FrameProtocol`] value instead of being hard-coded.

use crate::image::FirmwareImage;
use crate::protocol::crc::crc32;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use thiserror::Error;

/// Bytes before the payload: SOF(1) + Type(1) + Length(2).
pub const HEADER_LEN: usize = 4;

/// Bytes after the payload: CRC32(4) + EOF(1).
pub const TRAILER_LEN: usize = 5;

/// Constant per-frame overhead.
pub const FRAME_OVERHEAD: usize = HEADER_LEN + TRAILER_LEN;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Length of a RESP frame (single status byte payload).
pub const RESP_FRAME_LEN: usize = FRAME_OVERHEAD + 1;

/// Length of a CMD frame carrying one opcode.
pub const CMD_FRAME_LEN: usize = FRAME_OVERHEAD + 1;

/// Length of the HEADER frame payload.
pub const HEADER_PAYLOAD_LEN: usize = 16;

/// Frame decoding/encoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// The bytes do not form a valid frame for the active protocol.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Payload does not fit in the 16-bit length field.
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_LEN}-byte frame limit")]
    PayloadTooLarge(usize),
}

/// Logical packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PacketType {
    /// Command (START/END opcode).
    Cmd,
    /// Firmware header (size, image CRC, version).
    Header,
    /// Firmware data chunk.
    Data,
    /// Device response (ACK/NACK status).
    Resp,
}

/// Wire codes for each packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PacketCodes {
    /// Code for [`PacketType::Cmd`].
    pub cmd: u8,
    /// Code for [`PacketType::Header`].
    pub header: u8,
    /// Code for [`PacketType::Data`].
    pub data: u8,
    /// Code for [`PacketType::Resp`].
    pub resp: u8,
}

impl PacketCodes {
    /// Wire code for a packet type.
    pub fn code(&self, packet_type: PacketType) -> u8 {
        match packet_type {
            PacketType::Cmd => self.cmd,
            PacketType::Header => self.header,
            PacketType::Data => self.data,
            PacketType::Resp => self.resp,
        }
    }

    /// Packet type for a wire code, if known.
    pub fn packet_type(&self, code: u8) -> Option<PacketType> {
        [
            PacketType::Cmd,
            PacketType::Header,
            PacketType::Data,
            PacketType::Resp,
        ]
        .into_iter()
        .find(|t| self.code(*t) == code)
    }
}

/// Framing constants for one protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameProtocol {
    /// Start-of-frame marker.
    pub start_marker: u8,
    /// End-of-frame marker.
    pub end_marker: u8,
    /// Packet type codes.
    pub packet_codes: PacketCodes,
    /// CMD opcode that opens a session.
    pub start_opcode: u8,
    /// CMD opcode that closes a session.
    pub end_opcode: u8,
    /// RESP status for a positive acknowledgment.
    pub ack_status: u8,
    /// RESP status for a negative acknowledgment.
    pub nack_status: u8,
    /// Whether outgoing frames carry a real CRC (zero otherwise).
    pub checksum_enabled: bool,
    /// Whether response frames must carry a valid CRC to be accepted.
    pub verify_response_checksum: bool,
}

impl FrameProtocol {
    /// Revision with CRC-32 trailers and ACK/NACK responses (SOF `0xA5`, EOF `0xB6`).
    pub const fn standard() -> Self {
        Self {
            start_marker: 0xA5,
            end_marker: 0xB6,
            packet_codes: PacketCodes {
                cmd: 0x01,
                header: 0x02,
                data: 0x03,
                resp: 0x04,
            },
            start_opcode: 0xA0,
            end_opcode: 0xA1,
            ack_status: 0xAB,
            nack_status: 0xCD,
            checksum_enabled: true,
            verify_response_checksum: false,
        }
    }

    /// Earlier revision (SOF `0xAA`, EOF `0xBB`) with zeroed checksums.
    pub const fn legacy() -> Self {
        Self {
            start_marker: 0xAA,
            end_marker: 0xBB,
            packet_codes: PacketCodes {
                cmd: 0x00,
                header: 0x02,
                data: 0x01,
                resp: 0x03,
            },
            start_opcode: 0xA0,
            end_opcode: 0xA1,
            ack_status: 0xAB,
            nack_status: 0xCD,
            checksum_enabled: false,
            verify_response_checksum: false,
        }
    }

    /// Look up a preset by name (`standard` or `legacy`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "standard" | "default" => Some(Self::standard()),
            "legacy" => Some(Self::legacy()),
            _ => None,
        }
    }

    /// Trailer checksum for a payload under this revision.
    pub fn checksum(&self, payload: &[u8]) -> u32 {
        if self.checksum_enabled {
            crc32(payload)
        } else {
            0
        }
    }
}

impl Default for FrameProtocol {
    fn default() -> Self {
        Self::standard()
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Packet type.
    pub packet_type: PacketType,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Checksum as carried on the wire.
    pub checksum: u32,
}

impl Frame {
    /// Whether the carried checksum matches the payload under `protocol`.
    pub fn checksum_ok(&self, protocol: &FrameProtocol) -> bool {
        self.checksum == protocol.checksum(&self.payload)
    }
}

/// Encoder/decoder for frames of one protocol revision.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    protocol: FrameProtocol,
}

impl FrameCodec {
    /// Create a codec for the given protocol revision.
    pub fn new(protocol: FrameProtocol) -> Self {
        Self { protocol }
    }

    /// The protocol revision this codec speaks.
    pub fn protocol(&self) -> &FrameProtocol {
        &self.protocol
    }

    /// Encode a payload into a complete frame.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(
        &self,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<Vec<u8>, FramingError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FramingError::PayloadTooLarge(payload.len()));
        }

        let mut buf = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
        buf.push(self.protocol.start_marker);
        buf.push(self.protocol.packet_codes.code(packet_type));
        // Safe cast: length checked against MAX_PAYLOAD_LEN above
        buf.write_u16::<LittleEndian>(payload.len() as u16)
            .unwrap();
        buf.extend_from_slice(payload);
        buf.write_u32::<LittleEndian>(self.protocol.checksum(payload))
            .unwrap();
        buf.push(self.protocol.end_marker);

        Ok(buf)
    }

    /// Decode one frame from the start of `data`.
    ///
    /// Returns the frame and the number of bytes it occupied. The checksum is
    /// not verified here; see [`Frame::checksum_ok`].
    pub fn decode(&self, data: &[u8]) -> Result<(Frame, usize), FramingError> {
        if data.len() < FRAME_OVERHEAD {
            return Err(FramingError::Malformed(format!(
                "{} bytes is shorter than the {FRAME_OVERHEAD}-byte frame overhead",
                data.len()
            )));
        }

        if data[0] != self.protocol.start_marker {
            return Err(FramingError::Malformed(format!(
                "expected start marker {:#04X}, found {:#04X}",
                self.protocol.start_marker, data[0]
            )));
        }

        let packet_type = self
            .protocol
            .packet_codes
            .packet_type(data[1])
            .ok_or_else(|| FramingError::Malformed(format!("unknown packet type {:#04X}", data[1])))?;

        let length = usize::from(LittleEndian::read_u16(&data[2..4]));
        let total = FRAME_OVERHEAD + length;
        if data.len() < total {
            return Err(FramingError::Malformed(format!(
                "declared length {length} runs past available data ({} bytes)",
                data.len()
            )));
        }

        let end = data[total - 1];
        if end != self.protocol.end_marker {
            return Err(FramingError::Malformed(format!(
                "expected end marker {:#04X}, found {end:#04X}",
                self.protocol.end_marker
            )));
        }

        let payload = data[HEADER_LEN..HEADER_LEN + length].to_vec();
        let checksum = LittleEndian::read_u32(&data[HEADER_LEN + length..total - 1]);

        Ok((
            Frame {
                packet_type,
                payload,
                checksum,
            },
            total,
        ))
    }

    /// Build a CMD frame carrying a single opcode.
    pub fn command(&self, opcode: u8) -> Vec<u8> {
        self.encode_small(PacketType::Cmd, &[opcode])
    }

    /// Build the START command frame.
    pub fn start(&self) -> Vec<u8> {
        self.command(self.protocol.start_opcode)
    }

    /// Build the END command frame.
    pub fn end(&self) -> Vec<u8> {
        self.command(self.protocol.end_opcode)
    }

    /// Build the HEADER frame describing a firmware image.
    ///
    /// Payload: size(4) + image CRC32(4) + version(4) + reserved zeros(4).
    pub fn header(&self, image: &FirmwareImage) -> Vec<u8> {
        self.encode_small(PacketType::Header, &header_payload(image))
    }

    /// Build a DATA frame for one firmware chunk.
    pub fn data(&self, chunk: &[u8]) -> Result<Vec<u8>, FramingError> {
        self.encode(PacketType::Data, chunk)
    }

    /// Build a RESP frame with the given status byte.
    pub fn response(&self, status: u8) -> Vec<u8> {
        self.encode_small(PacketType::Resp, &[status])
    }

    #[allow(clippy::unwrap_used)] // Payloads built here are far below MAX_PAYLOAD_LEN
    fn encode_small(&self, packet_type: PacketType, payload: &[u8]) -> Vec<u8> {
        self.encode(packet_type, payload).unwrap()
    }
}

/// Serialize the HEADER payload for an image.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn header_payload(image: &FirmwareImage) -> [u8; HEADER_PAYLOAD_LEN] {
    let mut buf = Vec::with_capacity(HEADER_PAYLOAD_LEN);
    buf.write_u32::<LittleEndian>(image.size()).unwrap();
    buf.write_u32::<LittleEndian>(image.checksum()).unwrap();
    buf.write_u32::<LittleEndian>(image.version()).unwrap();
    buf.extend_from_slice(&[0u8; 4]);

    let mut out = [0u8; HEADER_PAYLOAD_LEN];
    out.copy_from_slice(&buf);
    out
}
