use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use linkstats::{LinkAddr, LINK_ADDR_LEN};

pub const FRAME_TYPE_DATA: u16 = 1;
pub const FRAME_TYPE_ACK: u16 = 2;

/// Frame-control bit requesting an acknowledgment.
const FCF_ACK_REQUEST: u16 = 1 << 5;
const FCF_TYPE_MASK: u16 = 0x7;

/// Frame control field (2 bytes) + sequence number (1 byte) + two
/// link-layer addresses.
pub const HEADER_LEN: usize = 3 + 2 * LINK_ADDR_LEN;
/// Upper bound the MAC subtracts from the radio payload budget.
pub const MAX_HEADER_LEN: usize = 21;

/// An acknowledgment is exactly three bytes, the third echoing the DSN of
/// the acknowledged frame.
pub const ACK_LEN: usize = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated ({0} bytes)")]
    Truncated(usize),

    #[error("unsupported frame type {0}")]
    UnsupportedType(u16),
}

/// A parsed data frame. The sequence number sits at byte offset 2 so that
/// acknowledgment matching can read the DSN from a fixed position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ack_required: bool,
    pub seqno: u8,
    pub dest: LinkAddr,
    pub src: LinkAddr,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Broadcast frames carry the null address as their receiver.
    pub fn is_broadcast(&self) -> bool {
        self.dest.is_null()
    }

    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        let mut fcf = FRAME_TYPE_DATA;
        if self.ack_required {
            fcf |= FCF_ACK_REQUEST;
        }
        buf.extend_from_slice(&fcf.to_le_bytes());
        buf.push(self.seqno);
        buf.extend_from_slice(self.dest.as_bytes());
        buf.extend_from_slice(self.src.as_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Truncated(bytes.len()));
        }
        let mut cursor = Cursor::new(bytes);
        let fcf = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| FrameError::Truncated(bytes.len()))?;
        if fcf & FCF_TYPE_MASK != FRAME_TYPE_DATA {
            return Err(FrameError::UnsupportedType(fcf & FCF_TYPE_MASK));
        }
        let seqno = bytes[2];
        let mut dest = [0u8; LINK_ADDR_LEN];
        dest.copy_from_slice(&bytes[3..3 + LINK_ADDR_LEN]);
        let mut src = [0u8; LINK_ADDR_LEN];
        src.copy_from_slice(&bytes[3 + LINK_ADDR_LEN..HEADER_LEN]);
        Ok(Self {
            ack_required: fcf & FCF_ACK_REQUEST != 0,
            seqno,
            dest: LinkAddr::new(dest),
            src: LinkAddr::new(src),
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

pub fn build_ack(seqno: u8) -> [u8; ACK_LEN] {
    let mut ack = [0u8; ACK_LEN];
    ack[..2].copy_from_slice(&FRAME_TYPE_ACK.to_le_bytes());
    ack[2] = seqno;
    ack
}

/// Extract the echoed DSN from an acknowledgment frame.
pub fn parse_ack(bytes: &[u8]) -> Option<u8> {
    if bytes.len() != ACK_LEN {
        return None;
    }
    let fcf = u16::from_le_bytes([bytes[0], bytes[1]]);
    if fcf & FCF_TYPE_MASK != FRAME_TYPE_ACK {
        return None;
    }
    Some(bytes[2])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> LinkAddr {
        LinkAddr::new([0, 0, 0, 0, 0, 0, 0, last])
    }

    #[test]
    fn roundtrips_for_valid_frames() {
        let frame = Frame {
            ack_required: true,
            seqno: 42,
            dest: addr(2),
            src: addr(1),
            payload: vec![0xDE, 0xAD, 0xBE, 0xEF],
        };
        let bytes = frame.build();
        assert_eq!(Frame::parse(&bytes).unwrap(), frame);

        let broadcast = Frame {
            ack_required: false,
            seqno: 7,
            dest: LinkAddr::NULL,
            src: addr(1),
            payload: Vec::new(),
        };
        let parsed = Frame::parse(&broadcast.build()).unwrap();
        assert!(parsed.is_broadcast());
        assert_eq!(parsed, broadcast);
    }

    #[test]
    fn seqno_sits_at_byte_two() {
        let frame = Frame {
            ack_required: true,
            seqno: 0x5A,
            dest: addr(2),
            src: addr(1),
            payload: Vec::new(),
        };
        assert_eq!(frame.build()[2], 0x5A);
    }

    #[test]
    fn rejects_short_and_foreign_frames() {
        assert_eq!(Frame::parse(&[1, 2, 3]), Err(FrameError::Truncated(3)));
        let mut bytes = Frame {
            ack_required: false,
            seqno: 1,
            dest: addr(2),
            src: addr(1),
            payload: Vec::new(),
        }
        .build();
        bytes[0] = 0x04;
        assert!(matches!(
            Frame::parse(&bytes),
            Err(FrameError::UnsupportedType(4))
        ));
    }

    #[test]
    fn ack_echoes_the_dsn() {
        let ack = build_ack(42);
        assert_eq!(ack.len(), ACK_LEN);
        assert_eq!(ack[2], 42);
        assert_eq!(parse_ack(&ack), Some(42));
        assert_eq!(parse_ack(&ack[..2]), None);
    }
}
