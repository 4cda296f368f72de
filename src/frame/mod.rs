//! Frames exchanged between the two halves of a proxied stream.
//!
//! Decoding is done through flyweight views (see [`FrameView`]) that alias the source buffer,
//!  encoding goes through the [`Frame`] sum type which borrows payload and extension octets from
//!  wherever they currently live. Forwarding a frame therefore copies payload bytes exactly once,
//!  from the inbound buffer into the outbound write buffer.
//!
//! See the crate level documentation for the wire layout.

mod extension;
mod flyweight;

pub use extension::*;
pub use flyweight::*;

use bitflags::bitflags;
use bytes::BufMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::safe_converter::PrecheckedCast;

pub(crate) const TYPE_ID_OFFSET: usize = 0;
pub(crate) const ORIGIN_ID_OFFSET: usize = 4;
pub(crate) const ROUTED_ID_OFFSET: usize = 12;
pub(crate) const STREAM_ID_OFFSET: usize = 20;
pub(crate) const SEQUENCE_OFFSET: usize = 28;
pub(crate) const ACKNOWLEDGE_OFFSET: usize = 36;
pub(crate) const MAXIMUM_OFFSET: usize = 44;
pub(crate) const TRACE_ID_OFFSET: usize = 48;
pub(crate) const AUTHORIZATION_OFFSET: usize = 56;

/// length of the header that is shared by all frame kinds
pub const HEADER_LENGTH: usize = 64;

/// fixed part of a Data frame after the header: budget id, reserved, flags, payload length
pub(crate) const DATA_FIXED_LENGTH: usize = 8 + 4 + 1 + 4;
pub(crate) const FLUSH_FIXED_LENGTH: usize = 8 + 4;
pub(crate) const BEGIN_FIXED_LENGTH: usize = 8;
pub(crate) const WINDOW_FIXED_LENGTH: usize = 8 + 4 + 1;
pub(crate) const EXTENSION_LENGTH_PREFIX: usize = 4;

/// The smallest possible encoded Data frame, i.e. a Data frame without payload or extension.
pub const DATA_FRAME_MIN_LENGTH: usize = HEADER_LENGTH + DATA_FIXED_LENGTH + EXTENSION_LENGTH_PREFIX;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum FrameType {
    Begin = 0x0000_0001,
    Data = 0x0000_0002,
    End = 0x0000_0003,
    Abort = 0x0000_0004,
    Flush = 0x0000_0005,
    Reset = 0x4000_0001,
    Window = 0x4000_0002,
}
impl FrameType {
    /// Reset and Window travel against the direction of the stream they refer to
    pub fn is_control(&self) -> bool {
        matches!(self, FrameType::Reset | FrameType::Window)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DataFlags: u8 {
        /// last fragment of a message
        const FIN = 0x01;
        /// first fragment of a message
        const INIT = 0x02;
        const INCOMPLETE = 0x04;
        const SKIP = 0x08;
    }
}
impl DataFlags {
    /// a complete message in a single frame
    pub const COMPLETE: DataFlags = DataFlags::INIT.union(DataFlags::FIN);
}

/// The fields shared by all frame kinds: identity, flow control state and tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub origin_id: u64,
    pub routed_id: u64,
    pub stream_id: u64,
    pub sequence: u64,
    pub acknowledge: u64,
    pub maximum: u32,
    pub trace_id: u64,
    pub authorization: u64,
}
impl FrameHeader {
    fn ser(&self, frame_type: FrameType, buf: &mut impl BufMut) {
        buf.put_u32(frame_type.into());
        buf.put_u64(self.origin_id);
        buf.put_u64(self.routed_id);
        buf.put_u64(self.stream_id);
        buf.put_u64(self.sequence);
        buf.put_u64(self.acknowledge);
        buf.put_u32(self.maximum);
        buf.put_u64(self.trace_id);
        buf.put_u64(self.authorization);
    }
}

/// A frame to be encoded. Payload and extension octets are borrowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    Begin {
        header: FrameHeader,
        affinity: u64,
        extension: &'a [u8],
    },
    Data {
        header: FrameHeader,
        budget_id: u64,
        reserved: u32,
        flags: DataFlags,
        payload: &'a [u8],
        extension: &'a [u8],
    },
    Flush {
        header: FrameHeader,
        budget_id: u64,
        reserved: u32,
        extension: &'a [u8],
    },
    End {
        header: FrameHeader,
        extension: &'a [u8],
    },
    Abort {
        header: FrameHeader,
        extension: &'a [u8],
    },
    Reset {
        header: FrameHeader,
        extension: &'a [u8],
    },
    Window {
        header: FrameHeader,
        budget_id: u64,
        padding: u32,
        capabilities: u8,
    },
}

impl<'a> Frame<'a> {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Begin { .. } => FrameType::Begin,
            Frame::Data { .. } => FrameType::Data,
            Frame::Flush { .. } => FrameType::Flush,
            Frame::End { .. } => FrameType::End,
            Frame::Abort { .. } => FrameType::Abort,
            Frame::Reset { .. } => FrameType::Reset,
            Frame::Window { .. } => FrameType::Window,
        }
    }

    pub fn header(&self) -> &FrameHeader {
        match self {
            Frame::Begin { header, .. } |
            Frame::Data { header, .. } |
            Frame::Flush { header, .. } |
            Frame::End { header, .. } |
            Frame::Abort { header, .. } |
            Frame::Reset { header, .. } |
            Frame::Window { header, .. } => header,
        }
    }

    pub fn encoded_len(&self) -> usize {
        let body = match self {
            Frame::Begin { extension, .. } => BEGIN_FIXED_LENGTH + EXTENSION_LENGTH_PREFIX + extension.len(),
            Frame::Data { payload, extension, .. } => DATA_FIXED_LENGTH + payload.len() + EXTENSION_LENGTH_PREFIX + extension.len(),
            Frame::Flush { extension, .. } => FLUSH_FIXED_LENGTH + EXTENSION_LENGTH_PREFIX + extension.len(),
            Frame::End { extension, .. } |
            Frame::Abort { extension, .. } |
            Frame::Reset { extension, .. } => EXTENSION_LENGTH_PREFIX + extension.len(),
            Frame::Window { .. } => WINDOW_FIXED_LENGTH,
        };
        HEADER_LENGTH + body
    }

    /// Writes this frame into `buffer` starting at `offset`, returning the number of bytes
    ///  written.
    ///
    /// Panics if the buffer is too small to hold the frame: sizing the destination is the
    ///  caller's responsibility.
    pub fn encode(&self, buffer: &mut [u8], offset: usize) -> usize {
        let len = self.encoded_len();
        assert!(offset <= buffer.len() && buffer.len() - offset >= len,
                "this is a bug: {:?} frame of {} bytes does not fit into buffer of {} bytes at offset {}",
                self.frame_type(), len, buffer.len(), offset);

        let mut dst = &mut buffer[offset..offset + len];
        self.header().ser(self.frame_type(), &mut dst);
        match self {
            Frame::Begin { affinity, extension, .. } => {
                dst.put_u64(*affinity);
                put_extension(&mut dst, extension);
            }
            Frame::Data { budget_id, reserved, flags, payload, extension, .. } => {
                dst.put_u64(*budget_id);
                dst.put_u32(*reserved);
                dst.put_u8(flags.bits());
                dst.put_u32(payload.len().prechecked_cast());
                dst.put_slice(payload);
                put_extension(&mut dst, extension);
            }
            Frame::Flush { budget_id, reserved, extension, .. } => {
                dst.put_u64(*budget_id);
                dst.put_u32(*reserved);
                put_extension(&mut dst, extension);
            }
            Frame::End { extension, .. } |
            Frame::Abort { extension, .. } |
            Frame::Reset { extension, .. } => {
                put_extension(&mut dst, extension);
            }
            Frame::Window { budget_id, padding, capabilities, .. } => {
                dst.put_u64(*budget_id);
                dst.put_u32(*padding);
                dst.put_u8(*capabilities);
            }
        }
        debug_assert!(dst.is_empty());
        len
    }

    /// Convenience for tests and diagnostics: encodes into a freshly allocated buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut result = vec![0; self.encoded_len()];
        self.encode(&mut result, 0);
        result
    }
}

fn put_extension(buf: &mut impl BufMut, extension: &[u8]) {
    buf.put_u32(extension.len().prechecked_cast());
    buf.put_slice(extension);
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn header() -> FrameHeader {
        FrameHeader {
            origin_id: 0x0102_0304_0506_0708,
            routed_id: 9,
            stream_id: 11,
            sequence: 1000,
            acknowledge: 900,
            maximum: 8192,
            trace_id: 77,
            authorization: 0x8000_0000_0000_0001,
        }
    }

    #[test]
    fn test_header_layout() {
        let frame = Frame::End { header: header(), extension: &[] };
        let buf = frame.to_vec();

        assert_eq!(buf.len(), HEADER_LENGTH + 4);
        assert_eq!(&buf[TYPE_ID_OFFSET..4], &[0, 0, 0, 3]);
        assert_eq!(&buf[ORIGIN_ID_OFFSET..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&buf[STREAM_ID_OFFSET..28], &[0, 0, 0, 0, 0, 0, 0, 11]);
        assert_eq!(&buf[MAXIMUM_OFFSET..48], &[0, 0, 0x20, 0]);
        assert_eq!(&buf[AUTHORIZATION_OFFSET..64], &[0x80, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&buf[64..], &[0, 0, 0, 0]);
    }

    #[rstest]
    #[case::begin(Frame::Begin { header: header(), affinity: 5, extension: b"" }, 64 + 12)]
    #[case::begin_ext(Frame::Begin { header: header(), affinity: 5, extension: b"ext" }, 64 + 15)]
    #[case::data(Frame::Data { header: header(), budget_id: 3, reserved: 10, flags: DataFlags::FIN, payload: b"hello", extension: b"" }, 64 + 17 + 5 + 4)]
    #[case::data_empty(Frame::Data { header: header(), budget_id: 0, reserved: 0, flags: DataFlags::empty(), payload: b"", extension: b"" }, DATA_FRAME_MIN_LENGTH)]
    #[case::flush(Frame::Flush { header: header(), budget_id: 3, reserved: 2, extension: b"x" }, 64 + 12 + 5)]
    #[case::abort(Frame::Abort { header: header(), extension: b"" }, 64 + 4)]
    #[case::reset(Frame::Reset { header: header(), extension: b"why" }, 64 + 7)]
    #[case::window(Frame::Window { header: header(), budget_id: 8, padding: 12, capabilities: 1 }, 64 + 13)]
    fn test_encoded_len(#[case] frame: Frame, #[case] expected: usize) {
        assert_eq!(frame.encoded_len(), expected);
        assert_eq!(frame.to_vec().len(), expected);
    }

    #[test]
    fn test_encode_at_offset() {
        let frame = Frame::Window { header: header(), budget_id: 8, padding: 12, capabilities: 1 };

        let mut buf = vec![0xff; 100];
        let len = frame.encode(&mut buf, 10);

        assert_eq!(len, 77);
        assert_eq!(&buf[..10], &[0xff; 10]);
        assert_eq!(&buf[10..87], frame.to_vec().as_slice());
        assert_eq!(&buf[87..], &[0xff; 13]);
    }

    #[test]
    #[should_panic]
    fn test_encode_overflow() {
        let frame = Frame::Data { header: header(), budget_id: 0, reserved: 5, flags: DataFlags::FIN, payload: b"hello", extension: b"" };
        let mut buf = vec![0; frame.encoded_len() - 1];
        frame.encode(&mut buf, 0);
    }

    #[test]
    #[should_panic]
    fn test_encode_offset_beyond_buffer() {
        let frame = Frame::End { header: header(), extension: b"" };
        let mut buf = vec![0; 200];
        frame.encode(&mut buf, 201);
    }

    #[rstest]
    #[case::fin(0x01, DataFlags::FIN)]
    #[case::init(0x02, DataFlags::INIT)]
    #[case::complete(0x03, DataFlags::COMPLETE)]
    #[case::incomplete(0x04, DataFlags::INCOMPLETE)]
    #[case::skip(0x08, DataFlags::SKIP)]
    fn test_data_flags(#[case] bits: u8, #[case] expected: DataFlags) {
        assert_eq!(DataFlags::from_bits_retain(bits), expected);
        assert_eq!(expected.bits(), bits);
    }

    #[rstest]
    #[case::begin(FrameType::Begin, false)]
    #[case::data(FrameType::Data, false)]
    #[case::end(FrameType::End, false)]
    #[case::reset(FrameType::Reset, true)]
    #[case::window(FrameType::Window, true)]
    fn test_is_control(#[case] frame_type: FrameType, #[case] expected: bool) {
        assert_eq!(frame_type.is_control(), expected);
    }
}
