/// QSY wire protocol — the fixed 16-byte frame spoken by every node.
///
/// The same frame travels over UDP multicast (discovery hellos) and over
/// the per-node TCP connections (commands, touches, keep-alives). All
/// multi-byte fields are big-endian. The codec is pure: no I/O, no state.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of an encoded QSY frame in bytes.
pub const PACKET_SIZE: usize = 16;

/// The three signature bytes every frame starts with.
pub const SIGNATURE: &[u8; 3] = b"QSY";

// Field offsets within a frame.
const TYPE_OFFSET: usize = 0x03;
const ID_OFFSET: usize = 0x04;
const COLOR_OFFSET: usize = 0x06;
const DELAY_OFFSET: usize = 0x08;
const STEP_OFFSET: usize = 0x0C;
const CONFIG_OFFSET: usize = 0x0E;

// Config field bits.
const CONFIG_DISTANCE: u16 = 1 << 0;
const CONFIG_SOUND: u16 = 1 << 1;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Node discovery announcement, multicast over UDP.
    Hello = 0x00,
    Command = 0x01,
    /// Node was touched in the current step.
    Touche = 0x02,
    /// TCP liveness heartbeat; never surfaced past the connection layer.
    KeepAlive = 0x03,
}

impl PacketType {
    fn from_wire(raw: u8) -> Option<PacketType> {
        match raw {
            0x00 => Some(PacketType::Hello),
            0x01 => Some(PacketType::Command),
            0x02 => Some(PacketType::Touche),
            0x03 => Some(PacketType::KeepAlive),
            _ => None,
        }
    }
}

/// Node light color palette and its 16-bit wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Red,
    Green,
    Blue,
    Cyan,
    Magenta,
    Yellow,
    White,
    None,
}

impl Color {
    pub fn to_wire(self) -> u16 {
        match self {
            Color::Red => 0xF000,
            Color::Green => 0x0F00,
            Color::Blue => 0x00F0,
            Color::Cyan => 0x0FF0,
            Color::Magenta => 0xF0F0,
            Color::Yellow => 0xFF00,
            Color::White => 0xFFF0,
            Color::None => 0x0000,
        }
    }

    /// Ingress frames (hello, touche, keep-alive) carry no meaningful
    /// color, so values outside the palette decode as `None`.
    pub fn from_wire(raw: u16) -> Color {
        match raw {
            0xF000 => Color::Red,
            0x0F00 => Color::Green,
            0x00F0 => Color::Blue,
            0x0FF0 => Color::Cyan,
            0xF0F0 => Color::Magenta,
            0xFF00 => Color::Yellow,
            0xFFF0 => Color::White,
            _ => Color::None,
        }
    }
}

/// Why a byte buffer failed to decode as a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame too short: {0} bytes")]
    ShortFrame(usize),
    #[error("bad signature {0:02X?}")]
    BadSignature([u8; 3]),
    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),
}

/// A decoded QSY frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    /// Wire id of the addressed or originating node.
    pub id: u16,
    pub color: Color,
    pub delay_ms: u32,
    /// Step number the frame belongs to; 0 for out-of-band frames.
    pub step: u16,
    /// Config bit 1: node beeps when lit.
    pub sound: bool,
    /// Config bit 0: node triggers on proximity instead of contact.
    pub distance: bool,
}

impl Packet {
    /// Encode into the fixed wire layout. Never fails.
    pub fn encode(&self) -> [u8; PACKET_SIZE] {
        let mut frame = [0u8; PACKET_SIZE];
        frame[..TYPE_OFFSET].copy_from_slice(SIGNATURE);
        frame[TYPE_OFFSET] = self.kind as u8;
        frame[ID_OFFSET..COLOR_OFFSET].copy_from_slice(&self.id.to_be_bytes());
        frame[COLOR_OFFSET..DELAY_OFFSET].copy_from_slice(&self.color.to_wire().to_be_bytes());
        frame[DELAY_OFFSET..STEP_OFFSET].copy_from_slice(&self.delay_ms.to_be_bytes());
        frame[STEP_OFFSET..CONFIG_OFFSET].copy_from_slice(&self.step.to_be_bytes());
        let mut config = 0u16;
        if self.sound {
            config |= CONFIG_SOUND;
        }
        if self.distance {
            config |= CONFIG_DISTANCE;
        }
        frame[CONFIG_OFFSET..].copy_from_slice(&config.to_be_bytes());
        frame
    }

    /// Decode a received buffer. The signature must read `QSY` and the
    /// type tag must be known; anything else is a dropped frame.
    pub fn decode(raw: &[u8]) -> Result<Packet, DecodeError> {
        if raw.len() < PACKET_SIZE {
            return Err(DecodeError::ShortFrame(raw.len()));
        }
        if &raw[..TYPE_OFFSET] != SIGNATURE {
            return Err(DecodeError::BadSignature([raw[0], raw[1], raw[2]]));
        }
        let kind =
            PacketType::from_wire(raw[TYPE_OFFSET]).ok_or(DecodeError::UnknownType(raw[TYPE_OFFSET]))?;
        let config = u16::from_be_bytes([raw[CONFIG_OFFSET], raw[CONFIG_OFFSET + 1]]);
        Ok(Packet {
            kind,
            id: u16::from_be_bytes([raw[ID_OFFSET], raw[ID_OFFSET + 1]]),
            color: Color::from_wire(u16::from_be_bytes([raw[COLOR_OFFSET], raw[COLOR_OFFSET + 1]])),
            delay_ms: u32::from_be_bytes([
                raw[DELAY_OFFSET],
                raw[DELAY_OFFSET + 1],
                raw[DELAY_OFFSET + 2],
                raw[DELAY_OFFSET + 3],
            ]),
            step: u16::from_be_bytes([raw[STEP_OFFSET], raw[STEP_OFFSET + 1]]),
            sound: config & CONFIG_SOUND != 0,
            distance: config & CONFIG_DISTANCE != 0,
        })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Type: {:?} - ID: {}", self.kind, self.id)
    }
}
