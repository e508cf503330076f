//! Basic frames and their fragments
//!
//! Every payload transferred over a channel is framed with the basic information frame header:
//! the payload length and the channel identifier, both 16 bit little endian. A frame larger
//! than the interface's transfer size is sliced into [`Fragment`]s; the first fragment of a
//! frame is tagged as a start fragment, the rest as continuation fragments. The header itself
//! receives no special treatment, it may be split across fragments like any other bytes.

use crate::cid::ChannelId;
use core::fmt;

/// A basic information frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicFrame {
    channel_id: ChannelId,
    payload: Vec<u8>,
}

impl BasicFrame {
    /// The size of the basic frame header
    pub const HEADER_SIZE: usize = 4;

    /// Create a new `BasicFrame`
    ///
    /// # Panic
    /// The payload length must not be larger than the maximum `u16` number
    pub fn new(channel_id: ChannelId, payload: Vec<u8>) -> Self {
        assert!(payload.len() <= <u16>::MAX.into());

        BasicFrame { channel_id, payload }
    }

    pub fn get_channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn get_payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Convert the frame into its header prefixed transfer format
    pub fn into_packet(self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(Self::HEADER_SIZE + self.payload.len());

        packet.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        packet.extend_from_slice(&self.channel_id.to_raw().to_le_bytes());
        packet.extend_from_slice(&self.payload);

        packet
    }

    /// Attempt to decode a complete basic frame
    pub fn try_from_slice(raw: &[u8]) -> Result<Self, BasicFrameError> {
        if raw.len() < Self::HEADER_SIZE {
            return Err(BasicFrameError::RawDataTooSmall);
        }

        let length = <u16>::from_le_bytes([raw[0], raw[1]]) as usize;

        let channel_id = ChannelId::try_from_raw(<u16>::from_le_bytes([raw[2], raw[3]]))
            .map_err(|invalid| BasicFrameError::InvalidChannelId(invalid.0))?;

        if raw.len() - Self::HEADER_SIZE != length {
            return Err(BasicFrameError::PayloadLengthMismatch {
                expected: length,
                actual: raw.len() - Self::HEADER_SIZE,
            });
        }

        Ok(BasicFrame {
            channel_id,
            payload: raw[Self::HEADER_SIZE..].to_vec(),
        })
    }
}

/// Error from decoding a basic frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicFrameError {
    RawDataTooSmall,
    PayloadLengthMismatch { expected: usize, actual: usize },
    InvalidChannelId(u16),
}

impl fmt::Display for BasicFrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BasicFrameError::RawDataTooSmall => {
                f.write_str("raw data is too small to contain a basic frame header")
            }
            BasicFrameError::PayloadLengthMismatch { expected, actual } => write!(
                f,
                "the payload length field is {} but {} payload bytes were recombined",
                expected, actual
            ),
            BasicFrameError::InvalidChannelId(raw) => {
                write!(f, "invalid channel identifier {:#06x}", raw)
            }
        }
    }
}

impl std::error::Error for BasicFrameError {}

/// A fragment of a basic frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    start_fragment: bool,
    data: Vec<u8>,
}

impl Fragment {
    pub fn new(start_fragment: bool, data: Vec<u8>) -> Self {
        Fragment { start_fragment, data }
    }

    pub fn is_start_fragment(&self) -> bool {
        self.start_fragment
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Fragment a basic frame
///
/// The frame's transfer format is sliced into fragments of at most `fragment_size` bytes. Every
/// frame produces at least one fragment, and only the first is tagged as a start fragment.
///
/// # Panic
/// `fragment_size` must not be zero.
pub fn fragment(frame: BasicFrame, fragment_size: usize) -> Vec<Fragment> {
    assert_ne!(0, fragment_size, "a fragment must be able to carry at least one byte");

    frame
        .into_packet()
        .chunks(fragment_size)
        .enumerate()
        .map(|(index, chunk)| Fragment::new(index == 0, chunk.to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_round_trip() {
        let frame = BasicFrame::new(ChannelId::AttributeProtocol, vec![0x0A, 0x01, 0x00]);

        let packet = frame.clone().into_packet();

        assert_eq!(vec![0x03, 0x00, 0x04, 0x00, 0x0A, 0x01, 0x00], packet);
        assert_eq!(frame, BasicFrame::try_from_slice(&packet).unwrap());
    }

    #[test]
    fn fragments_cover_the_packet_in_order() {
        let frame = BasicFrame::new(ChannelId::AttributeProtocol, (0..10).collect());

        let fragments = fragment(frame.clone(), 4);

        assert_eq!(4, fragments.len());
        assert!(fragments[0].is_start_fragment());
        assert!(fragments[1..].iter().all(|f| !f.is_start_fragment()));

        let recombined: Vec<u8> = fragments.iter().flat_map(|f| f.get_data().iter().copied()).collect();

        assert_eq!(frame.into_packet(), recombined);
    }

    #[test]
    fn small_frame_is_one_start_fragment() {
        let frame = BasicFrame::new(ChannelId::SecurityManager, vec![1]);

        let fragments = fragment(frame, 27);

        assert_eq!(1, fragments.len());
        assert!(fragments[0].is_start_fragment());
        assert_eq!(5, fragments[0].get_data().len());
    }

    #[test]
    fn length_mismatch_is_an_error() {
        let raw = [0x05, 0x00, 0x04, 0x00, 0x01];

        assert_eq!(
            Err(BasicFrameError::PayloadLengthMismatch { expected: 5, actual: 1 }),
            BasicFrame::try_from_slice(&raw)
        );
    }
}
