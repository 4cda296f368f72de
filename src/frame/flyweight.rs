//! Read-only views on encoded frames. A view aliases the buffer it was wrapped around, so the
//!  borrow checker guarantees that nobody reuses the buffer while a view on it is alive.
//!
//! `wrap` functions validate the complete frame up front and return `None` for anything that is
//!  not a well-formed frame of the expected kind. Accessors can then read fixed offsets without
//!  further checks.

use bytes::Buf;
use crate::frame::*;
use crate::safe_converter::SafeCast;

fn u32_at(buffer: &[u8], offset: usize) -> Option<u32> {
    let mut b = buffer.get(offset..offset.checked_add(4)?)?;
    Some(b.get_u32())
}

/// Reads a length-prefixed extension at `offset`, returning the extension octets and the offset
///  immediately after them.
fn extension_at(buffer: &[u8], offset: usize) -> Option<(&[u8], usize)> {
    let len: usize = u32_at(buffer, offset)?.safe_cast();
    let start = offset + EXTENSION_LENGTH_PREFIX;
    let end = start.checked_add(len)?;
    Some((buffer.get(start..end)?, end))
}

/// The header part that all frame kinds share. This can be wrapped around a frame whose body
///  is malformed, allowing the frame to be attributed to a stream nonetheless.
#[derive(Clone, Copy)]
pub struct FrameHeaderView<'a> {
    buffer: &'a [u8],
}
impl<'a> FrameHeaderView<'a> {
    pub fn wrap(buffer: &'a [u8], offset: usize, length: usize) -> Option<FrameHeaderView<'a>> {
        let buffer = buffer.get(offset..offset.checked_add(length)?)?;
        if buffer.len() < HEADER_LENGTH {
            return None;
        }
        Some(FrameHeaderView { buffer })
    }

    fn u64_at(&self, offset: usize) -> u64 {
        (&self.buffer[offset..]).get_u64()
    }
    fn u32_at(&self, offset: usize) -> u32 {
        (&self.buffer[offset..]).get_u32()
    }

    pub fn type_id(&self) -> u32 {
        self.u32_at(TYPE_ID_OFFSET)
    }
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::try_from(self.type_id()).ok()
    }
    pub fn origin_id(&self) -> u64 {
        self.u64_at(ORIGIN_ID_OFFSET)
    }
    pub fn routed_id(&self) -> u64 {
        self.u64_at(ROUTED_ID_OFFSET)
    }
    pub fn stream_id(&self) -> u64 {
        self.u64_at(STREAM_ID_OFFSET)
    }
    pub fn sequence(&self) -> u64 {
        self.u64_at(SEQUENCE_OFFSET)
    }
    pub fn acknowledge(&self) -> u64 {
        self.u64_at(ACKNOWLEDGE_OFFSET)
    }
    pub fn maximum(&self) -> u32 {
        self.u32_at(MAXIMUM_OFFSET)
    }
    pub fn trace_id(&self) -> u64 {
        self.u64_at(TRACE_ID_OFFSET)
    }
    pub fn authorization(&self) -> u64 {
        self.u64_at(AUTHORIZATION_OFFSET)
    }

    pub fn to_header(&self) -> FrameHeader {
        FrameHeader {
            origin_id: self.origin_id(),
            routed_id: self.routed_id(),
            stream_id: self.stream_id(),
            sequence: self.sequence(),
            acknowledge: self.acknowledge(),
            maximum: self.maximum(),
            trace_id: self.trace_id(),
            authorization: self.authorization(),
        }
    }

    fn of_type(buffer: &'a [u8], offset: usize, length: usize, frame_type: FrameType) -> Option<FrameHeaderView<'a>> {
        let header = FrameHeaderView::wrap(buffer, offset, length)?;
        if header.type_id() != u32::from(frame_type) {
            return None;
        }
        Some(header)
    }

    /// narrows the view to the first `limit` bytes, i.e. to the actual frame
    fn limited(&self, limit: usize) -> FrameHeaderView<'a> {
        FrameHeaderView { buffer: &self.buffer[..limit] }
    }
}

macro_rules! header_accessors {
    () => {
        pub fn header(&self) -> FrameHeaderView<'a> {
            self.header
        }
        pub fn origin_id(&self) -> u64 {
            self.header.origin_id()
        }
        pub fn routed_id(&self) -> u64 {
            self.header.routed_id()
        }
        pub fn stream_id(&self) -> u64 {
            self.header.stream_id()
        }
        pub fn sequence(&self) -> u64 {
            self.header.sequence()
        }
        pub fn acknowledge(&self) -> u64 {
            self.header.acknowledge()
        }
        pub fn maximum(&self) -> u32 {
            self.header.maximum()
        }
        pub fn trace_id(&self) -> u64 {
            self.header.trace_id()
        }
        pub fn authorization(&self) -> u64 {
            self.header.authorization()
        }
        /// number of bytes this frame occupies in the underlying buffer
        pub fn limit(&self) -> usize {
            self.header.buffer.len()
        }
        /// the encoded frame, aliasing the underlying buffer
        pub fn as_bytes(&self) -> &'a [u8] {
            self.header.buffer
        }
    };
}

#[derive(Clone, Copy)]
pub struct BeginFrame<'a> {
    header: FrameHeaderView<'a>,
    extension: &'a [u8],
}
impl<'a> BeginFrame<'a> {
    pub fn wrap(buffer: &'a [u8], offset: usize, length: usize) -> Option<BeginFrame<'a>> {
        let header = FrameHeaderView::of_type(buffer, offset, length, FrameType::Begin)?;
        let (extension, limit) = extension_at(header.buffer, HEADER_LENGTH + BEGIN_FIXED_LENGTH)?;
        Some(BeginFrame { header: header.limited(limit), extension })
    }

    header_accessors!();

    pub fn affinity(&self) -> u64 {
        self.header.u64_at(HEADER_LENGTH)
    }
    pub fn extension(&self) -> &'a [u8] {
        self.extension
    }

    pub fn to_frame(&self) -> Frame<'a> {
        Frame::Begin {
            header: self.header.to_header(),
            affinity: self.affinity(),
            extension: self.extension,
        }
    }
}

#[derive(Clone, Copy)]
pub struct DataFrame<'a> {
    header: FrameHeaderView<'a>,
    payload: &'a [u8],
    extension: &'a [u8],
}
impl<'a> DataFrame<'a> {
    pub fn wrap(buffer: &'a [u8], offset: usize, length: usize) -> Option<DataFrame<'a>> {
        let header = FrameHeaderView::of_type(buffer, offset, length, FrameType::Data)?;
        let payload_len_offset = HEADER_LENGTH + 8 + 4 + 1;
        let payload_len: usize = u32_at(header.buffer, payload_len_offset)?.safe_cast();
        let payload_start = payload_len_offset + 4;
        let payload_end = payload_start.checked_add(payload_len)?;
        let payload = header.buffer.get(payload_start..payload_end)?;
        let (extension, limit) = extension_at(header.buffer, payload_end)?;
        Some(DataFrame { header: header.limited(limit), payload, extension })
    }

    header_accessors!();

    pub fn budget_id(&self) -> u64 {
        self.header.u64_at(HEADER_LENGTH)
    }
    pub fn reserved(&self) -> u32 {
        self.header.u32_at(HEADER_LENGTH + 8)
    }
    pub fn flags(&self) -> DataFlags {
        DataFlags::from_bits_retain(self.header.buffer[HEADER_LENGTH + 12])
    }
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
    pub fn extension(&self) -> &'a [u8] {
        self.extension
    }

    pub fn to_frame(&self) -> Frame<'a> {
        Frame::Data {
            header: self.header.to_header(),
            budget_id: self.budget_id(),
            reserved: self.reserved(),
            flags: self.flags(),
            payload: self.payload,
            extension: self.extension,
        }
    }
}

#[derive(Clone, Copy)]
pub struct FlushFrame<'a> {
    header: FrameHeaderView<'a>,
    extension: &'a [u8],
}
impl<'a> FlushFrame<'a> {
    pub fn wrap(buffer: &'a [u8], offset: usize, length: usize) -> Option<FlushFrame<'a>> {
        let header = FrameHeaderView::of_type(buffer, offset, length, FrameType::Flush)?;
        let (extension, limit) = extension_at(header.buffer, HEADER_LENGTH + FLUSH_FIXED_LENGTH)?;
        Some(FlushFrame { header: header.limited(limit), extension })
    }

    header_accessors!();

    pub fn budget_id(&self) -> u64 {
        self.header.u64_at(HEADER_LENGTH)
    }
    pub fn reserved(&self) -> u32 {
        self.header.u32_at(HEADER_LENGTH + 8)
    }
    pub fn extension(&self) -> &'a [u8] {
        self.extension
    }

    pub fn to_frame(&self) -> Frame<'a> {
        Frame::Flush {
            header: self.header.to_header(),
            budget_id: self.budget_id(),
            reserved: self.reserved(),
            extension: self.extension,
        }
    }
}

/// End, Abort and Reset share their layout and differ only in their type id
macro_rules! terminal_frame {
    ($name:ident, $frame_type:ident) => {
        #[derive(Clone, Copy)]
        pub struct $name<'a> {
            header: FrameHeaderView<'a>,
            extension: &'a [u8],
        }
        impl<'a> $name<'a> {
            pub fn wrap(buffer: &'a [u8], offset: usize, length: usize) -> Option<$name<'a>> {
                let header = FrameHeaderView::of_type(buffer, offset, length, FrameType::$frame_type)?;
                let (extension, limit) = extension_at(header.buffer, HEADER_LENGTH)?;
                Some($name { header: header.limited(limit), extension })
            }

            header_accessors!();

            pub fn extension(&self) -> &'a [u8] {
                self.extension
            }

            pub fn to_frame(&self) -> Frame<'a> {
                Frame::$frame_type {
                    header: self.header.to_header(),
                    extension: self.extension,
                }
            }
        }
    };
}

terminal_frame!(EndFrame, End);
terminal_frame!(AbortFrame, Abort);
terminal_frame!(ResetFrame, Reset);

#[derive(Clone, Copy)]
pub struct WindowFrame<'a> {
    header: FrameHeaderView<'a>,
}
impl<'a> WindowFrame<'a> {
    pub fn wrap(buffer: &'a [u8], offset: usize, length: usize) -> Option<WindowFrame<'a>> {
        let header = FrameHeaderView::of_type(buffer, offset, length, FrameType::Window)?;
        let limit = HEADER_LENGTH + WINDOW_FIXED_LENGTH;
        if header.buffer.len() < limit {
            return None;
        }
        Some(WindowFrame { header: header.limited(limit) })
    }

    header_accessors!();

    pub fn budget_id(&self) -> u64 {
        self.header.u64_at(HEADER_LENGTH)
    }
    pub fn padding(&self) -> u32 {
        self.header.u32_at(HEADER_LENGTH + 8)
    }
    pub fn capabilities(&self) -> u8 {
        self.header.buffer[HEADER_LENGTH + 12]
    }

    pub fn to_frame(&self) -> Frame<'a> {
        Frame::Window {
            header: self.header.to_header(),
            budget_id: self.budget_id(),
            padding: self.padding(),
            capabilities: self.capabilities(),
        }
    }
}

/// A decoded frame of any kind, dispatched on the leading type id
#[derive(Clone, Copy)]
pub enum FrameView<'a> {
    Begin(BeginFrame<'a>),
    Data(DataFrame<'a>),
    Flush(FlushFrame<'a>),
    End(EndFrame<'a>),
    Abort(AbortFrame<'a>),
    Reset(ResetFrame<'a>),
    Window(WindowFrame<'a>),
}
impl<'a> FrameView<'a> {
    pub fn wrap(buffer: &'a [u8], offset: usize, length: usize) -> Option<FrameView<'a>> {
        let header = FrameHeaderView::wrap(buffer, offset, length)?;
        let result = match header.frame_type()? {
            FrameType::Begin => FrameView::Begin(BeginFrame::wrap(buffer, offset, length)?),
            FrameType::Data => FrameView::Data(DataFrame::wrap(buffer, offset, length)?),
            FrameType::Flush => FrameView::Flush(FlushFrame::wrap(buffer, offset, length)?),
            FrameType::End => FrameView::End(EndFrame::wrap(buffer, offset, length)?),
            FrameType::Abort => FrameView::Abort(AbortFrame::wrap(buffer, offset, length)?),
            FrameType::Reset => FrameView::Reset(ResetFrame::wrap(buffer, offset, length)?),
            FrameType::Window => FrameView::Window(WindowFrame::wrap(buffer, offset, length)?),
        };
        Some(result)
    }

    pub fn header(&self) -> FrameHeaderView<'a> {
        match self {
            FrameView::Begin(f) => f.header(),
            FrameView::Data(f) => f.header(),
            FrameView::Flush(f) => f.header(),
            FrameView::End(f) => f.header(),
            FrameView::Abort(f) => f.header(),
            FrameView::Reset(f) => f.header(),
            FrameView::Window(f) => f.header(),
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            FrameView::Begin(_) => FrameType::Begin,
            FrameView::Data(_) => FrameType::Data,
            FrameView::Flush(_) => FrameType::Flush,
            FrameView::End(_) => FrameType::End,
            FrameView::Abort(_) => FrameType::Abort,
            FrameView::Reset(_) => FrameType::Reset,
            FrameView::Window(_) => FrameType::Window,
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.header().stream_id()
    }

    pub fn limit(&self) -> usize {
        self.header().buffer.len()
    }

    pub fn to_frame(&self) -> Frame<'a> {
        match self {
            FrameView::Begin(f) => f.to_frame(),
            FrameView::Data(f) => f.to_frame(),
            FrameView::Flush(f) => f.to_frame(),
            FrameView::End(f) => f.to_frame(),
            FrameView::Abort(f) => f.to_frame(),
            FrameView::Reset(f) => f.to_frame(),
            FrameView::Window(f) => f.to_frame(),
        }
    }
}

impl std::fmt::Debug for FrameView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.to_frame().fmt(f)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn header(stream_id: u64) -> FrameHeader {
        FrameHeader {
            origin_id: 1,
            routed_id: 2,
            stream_id,
            sequence: 30,
            acknowledge: 20,
            maximum: 100,
            trace_id: 4,
            authorization: 5,
        }
    }

    const EXT_17: &[u8] = b"seventeen octets!";

    #[rstest]
    #[case::begin(Frame::Begin { header: header(1), affinity: 99, extension: b"" })]
    #[case::begin_ext(Frame::Begin { header: header(1), affinity: 99, extension: EXT_17 })]
    #[case::data(Frame::Data { header: header(1), budget_id: 7, reserved: 12, flags: DataFlags::FIN, payload: b"hello", extension: b"" })]
    #[case::data_ext(Frame::Data { header: header(1), budget_id: 7, reserved: 12, flags: DataFlags::INIT, payload: b"hello", extension: b"e" })]
    #[case::data_empty(Frame::Data { header: header(1), budget_id: 0, reserved: 0, flags: DataFlags::empty(), payload: b"", extension: b"" })]
    #[case::flush(Frame::Flush { header: header(1), budget_id: 7, reserved: 3, extension: EXT_17 })]
    #[case::end(Frame::End { header: header(1), extension: b"" })]
    #[case::abort(Frame::Abort { header: header(1), extension: b"a" })]
    #[case::reset(Frame::Reset { header: header(1), extension: EXT_17 })]
    #[case::window(Frame::Window { header: header(1), budget_id: 7, padding: 2, capabilities: 3 })]
    fn test_wrap_reencode(#[case] frame: Frame) {
        let bytes = frame.to_vec();

        let view = FrameView::wrap(&bytes, 0, bytes.len()).unwrap();
        assert_eq!(view.frame_type(), frame.frame_type());
        assert_eq!(view.limit(), bytes.len());
        assert_eq!(view.to_frame(), frame);
        assert_eq!(view.to_frame().to_vec(), bytes);
    }

    #[test]
    fn test_view_aliases_buffer() {
        let frame = Frame::Data { header: header(3), budget_id: 0, reserved: 5, flags: DataFlags::FIN, payload: b"hello", extension: b"" };
        let mut buf = vec![0u8; 10];
        buf.extend_from_slice(&frame.to_vec());

        let data = DataFrame::wrap(&buf, 10, buf.len() - 10).unwrap();
        let payload_ptr = data.payload().as_ptr() as usize;
        let buf_ptr = buf.as_ptr() as usize;
        assert!(payload_ptr >= buf_ptr && payload_ptr + 5 <= buf_ptr + buf.len());
        assert_eq!(payload_ptr - buf_ptr, 10 + HEADER_LENGTH + 17);
        assert_eq!(data.payload(), b"hello");
        assert_eq!(data.stream_id(), 3);
        assert_eq!(data.reserved(), 5);
        assert_eq!(data.flags(), DataFlags::FIN);
    }

    #[test]
    fn test_wrap_with_trailing_bytes() {
        let first = Frame::End { header: header(1), extension: b"x" }.to_vec();
        let second = Frame::Abort { header: header(2), extension: b"" }.to_vec();
        let mut buf = first.clone();
        buf.extend_from_slice(&second);

        let end = FrameView::wrap(&buf, 0, buf.len()).unwrap();
        assert_eq!(end.frame_type(), FrameType::End);
        assert_eq!(end.limit(), first.len());

        let abort = FrameView::wrap(&buf, end.limit(), buf.len() - end.limit()).unwrap();
        assert_eq!(abort.frame_type(), FrameType::Abort);
        assert_eq!(abort.stream_id(), 2);
    }

    #[rstest]
    #[case::empty(0)]
    #[case::header_only(HEADER_LENGTH)]
    #[case::missing_payload_byte(HEADER_LENGTH + 17 + 4)]
    #[case::missing_extension_length(HEADER_LENGTH + 17 + 5 + 3)]
    fn test_wrap_truncated(#[case] len: usize) {
        let bytes = Frame::Data { header: header(1), budget_id: 0, reserved: 5, flags: DataFlags::FIN, payload: b"hello", extension: b"" }.to_vec();
        assert!(FrameView::wrap(&bytes, 0, len).is_none());
        assert!(DataFrame::wrap(&bytes, 0, len).is_none());
    }

    #[test]
    fn test_wrap_length_beyond_buffer() {
        let bytes = Frame::End { header: header(1), extension: b"" }.to_vec();
        assert!(FrameView::wrap(&bytes, 0, bytes.len() + 1).is_none());
        assert!(FrameView::wrap(&bytes, 1, bytes.len()).is_none());
        assert!(FrameView::wrap(&bytes, usize::MAX, 2).is_none());
    }

    #[test]
    fn test_wrap_unknown_type() {
        let mut bytes = Frame::End { header: header(1), extension: b"" }.to_vec();
        bytes[3] = 0x77;

        assert!(FrameView::wrap(&bytes, 0, bytes.len()).is_none());
        let header = FrameHeaderView::wrap(&bytes, 0, bytes.len()).unwrap();
        assert_eq!(header.frame_type(), None);
        assert_eq!(header.stream_id(), 1);
    }

    #[test]
    fn test_wrap_wrong_kind() {
        let bytes = Frame::End { header: header(1), extension: b"" }.to_vec();
        assert!(AbortFrame::wrap(&bytes, 0, bytes.len()).is_none());
        assert!(EndFrame::wrap(&bytes, 0, bytes.len()).is_some());
    }

    #[test]
    fn test_header_of_malformed_body() {
        let mut bytes = Frame::Data { header: header(42), budget_id: 0, reserved: 5, flags: DataFlags::FIN, payload: b"hello", extension: b"" }.to_vec();
        // payload length pointing beyond the frame
        bytes[HEADER_LENGTH + 13] = 0xff;

        assert!(FrameView::wrap(&bytes, 0, bytes.len()).is_none());
        let header = FrameHeaderView::wrap(&bytes, 0, bytes.len()).unwrap();
        assert_eq!(header.frame_type(), Some(FrameType::Data));
        assert_eq!(header.stream_id(), 42);
        assert_eq!(header.to_header(), self::header(42));
    }
}
