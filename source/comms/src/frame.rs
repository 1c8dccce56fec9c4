//! Module-bus frame codec
//!
//! A frame on the module bus is eight bytes: two start bytes, a four-byte
//! payload of `src`, `dst`, type code, and parameter, then two end bytes.
//! The payload is fixed-size, so the reader commits after seeing two
//! consecutive start bytes and consumes exactly four more bytes. End bytes
//! are never part of a frame; the scanner skips them like any other
//! non-start byte.

use crate::{Error, Hal, END_BYTE, START_BYTE};

/// On-the-wire size of a module frame.
pub const FRAME_LEN: usize = 8;

/// Frame type codes
///
/// The six commands that travel on the module bus. Any other value in the
/// type slot fails conversion and the whole frame is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[repr(u8)]
pub enum FrameKind {
    /// Master probing for modules; a slave hello carries the detecting
    /// child port letter (or 0) in the parameter slot.
    Hello = 200,
    /// Master assigning the ID in the parameter slot to the destination.
    IdAssign = 201,
    /// Module acknowledging an ID assignment.
    IdAssignOk = 202,
    /// Ping request or ping reply, depending on direction.
    Ping = 203,
    /// Master asking the destination (or everyone) to drop its
    /// configuration.
    ClearConfig = 204,
    /// Module acknowledging a directly-addressed configuration clear.
    ConfigCleared = 205,
}

/// Frame type error
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum FrameKindError {
    /// The type slot held a value outside the command set
    Unknown,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameKindError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            200 => Ok(FrameKind::Hello),
            201 => Ok(FrameKind::IdAssign),
            202 => Ok(FrameKind::IdAssignOk),
            203 => Ok(FrameKind::Ping),
            204 => Ok(FrameKind::ClearConfig),
            205 => Ok(FrameKind::ConfigCleared),
            _ => Err(FrameKindError::Unknown),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(val: FrameKind) -> Self {
        val as u8
    }
}

/// One module-bus frame, header and trailer stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct Frame {
    /// Sender ID.
    pub src: u8,
    /// Destination ID.
    pub dst: u8,
    /// Command type.
    pub kind: FrameKind,
    /// Command parameter; zero where the type carries none.
    pub param: u8,
}

impl Frame {
    /// Lay the frame out on the wire.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        [
            START_BYTE,
            START_BYTE,
            self.src,
            self.dst,
            self.kind.into(),
            self.param,
            END_BYTE,
            END_BYTE,
        ]
    }

    /// Parse the four payload bytes following a committed start sequence.
    pub(crate) fn from_payload(payload: [u8; 4]) -> Result<Self, FrameKindError> {
        Ok(Frame {
            src: payload[0],
            dst: payload[1],
            kind: FrameKind::try_from(payload[2])?,
            param: payload[3],
        })
    }
}

/// Read the next well-formed frame from the current receive lane.
///
/// Scans byte-by-byte: a start byte followed by anything other than a
/// second start byte is discarded, two consecutive start bytes commit the
/// reader to the four payload bytes. Frames with an unknown type code are
/// dropped and the scan continues. Never returns on a quiet bus; callers
/// that need a bound wrap this in a timeout.
pub(crate) async fn read_frame<H: Hal>(hal: &mut H) -> Result<Frame, Error<H::SerError>> {
    loop {
        if hal.recv_byte().await?.byte != START_BYTE {
            continue;
        }
        if hal.recv_byte().await?.byte != START_BYTE {
            continue;
        }
        let mut payload = [0u8; 4];
        for slot in payload.iter_mut() {
            *slot = hal.recv_byte().await?.byte;
        }
        match Frame::from_payload(payload) {
            Ok(frame) => return Ok(frame),
            Err(_) => {
                rev_warn!("dropping frame with unknown type {=u8}", payload[2]);
                continue;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DEFAULT_ID, MASTER_ID};

    #[test]
    fn hello_reply_layout() {
        let frame = Frame {
            src: DEFAULT_ID,
            dst: MASTER_ID,
            kind: FrameKind::Hello,
            param: 0,
        };
        assert_eq!(
            frame.encode(),
            [0xF8, 0xF8, 0xFB, 0x00, 0xC8, 0x00, 0x55, 0x55]
        );
    }

    #[test]
    fn payload_round_trip() {
        let frame = Frame {
            src: 5,
            dst: 0,
            kind: FrameKind::Ping,
            param: 17,
        };
        let wire = frame.encode();
        let payload = [wire[2], wire[3], wire[4], wire[5]];
        assert_eq!(Frame::from_payload(payload), Ok(frame));
    }

    #[test]
    fn every_kind_survives_the_byte_slot() {
        for kind in [
            FrameKind::Hello,
            FrameKind::IdAssign,
            FrameKind::IdAssignOk,
            FrameKind::Ping,
            FrameKind::ClearConfig,
            FrameKind::ConfigCleared,
        ] {
            assert_eq!(FrameKind::try_from(u8::from(kind)), Ok(kind));
        }
    }

    #[test]
    fn unknown_type_codes_rejected() {
        for code in (0u8..200).chain(206u8..=255) {
            assert_eq!(FrameKind::try_from(code), Err(FrameKindError::Unknown));
        }
    }
}
