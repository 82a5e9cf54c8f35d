//! Raw (packed) TBF frames.
//!
//! A TBF frame is a 24-byte header followed by 12 channels x 256 stands x 2
//! polarisations of 4+4-bit complex samples. Only the header fields needed to
//! multiplex frames are decoded; the payload is carried untouched.

use hifitime::Epoch;
use thiserror::Error;

use crate::buffer::{BufferedFrame, ChannelId};

/// The size of a TBF frame header \[bytes\].
pub const HEADER_SIZE: usize = 24;

/// The number of frequency channels carried by a single frame.
pub const CHANNELS_PER_FRAME: u32 = 12;

/// The size of a TBF frame's payload \[bytes\].
pub const PAYLOAD_SIZE: usize = CHANNELS_PER_FRAME as usize * 256 * 2;

/// The size of a full TBF frame \[bytes\].
pub const FRAME_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;

/// The marker every frame starts with.
pub const SYNC_WORD: [u8; 4] = [0xDE, 0xC0, 0xDE, 0x5C];

/// The sampling rate that time tags count in \[Hz\].
pub const SAMPLE_RATE_HZ: f64 = 196e6;

/// Ways in which some bytes can fail to be a TBF frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Expected {expected} bytes for a TBF frame, got {got}")]
    WrongSize { expected: usize, got: usize },

    #[error("Bad sync word {found:02X?}")]
    BadSync { found: [u8; 4] },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTbfFrame {
    contents: Vec<u8>,
}

impl RawTbfFrame {
    /// Validate and wrap the bytes of a frame.
    pub fn from_bytes(contents: Vec<u8>) -> Result<RawTbfFrame, FrameError> {
        if contents.len() != FRAME_SIZE {
            return Err(FrameError::WrongSize {
                expected: FRAME_SIZE,
                got: contents.len(),
            });
        }
        if contents[..4] != SYNC_WORD {
            return Err(FrameError::BadSync {
                found: [contents[0], contents[1], contents[2], contents[3]],
            });
        }
        Ok(RawTbfFrame { contents })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.contents
    }

    /// The time tag of this frame, in ticks of [`SAMPLE_RATE_HZ`] since the
    /// Unix epoch.
    pub fn timetag(&self) -> u64 {
        let mut bytes = [0; 8];
        bytes.copy_from_slice(&self.contents[16..24]);
        u64::from_be_bytes(bytes)
    }

    pub fn set_timetag(&mut self, timetag: u64) {
        self.contents[16..24].copy_from_slice(&timetag.to_be_bytes());
    }

    /// The first frequency channel carried by this frame.
    pub fn first_chan(&self) -> u16 {
        u16::from_be_bytes([self.contents[12], self.contents[13]])
    }

    pub fn set_first_chan(&mut self, chan: u16) {
        self.contents[12..14].copy_from_slice(&chan.to_be_bytes());
    }

    pub fn payload(&self) -> &[u8] {
        &self.contents[HEADER_SIZE..]
    }

    /// The time tag as an [`Epoch`].
    pub fn epoch(&self) -> Epoch {
        Epoch::from_unix_seconds(self.timetag() as f64 / SAMPLE_RATE_HZ)
    }
}

impl BufferedFrame for RawTbfFrame {
    fn sequence_key(&self) -> u64 {
        self.timetag()
    }

    fn channel_id(&self) -> ChannelId {
        ChannelId::from(self.first_chan())
    }

    fn to_fill(&self, key: u64, channel: ChannelId) -> RawTbfFrame {
        let mut fill = self.clone();
        fill.set_timetag(key);
        // Channels only come from decoded frames, so they always fit.
        fill.set_first_chan(channel as u16);
        fill.contents[HEADER_SIZE..].fill(0);
        fill
    }
}
