use tracing::trace;
use crate::buffers::fixed_buffer::FixedBuf;
use crate::frame::Frame;
use crate::message_consumer::MessageConsumer;

/// Encodes outbound frames into a reusable scratch buffer and hands them to a consumer. The
///  buffer is sized once; a frame that does not fit is a bug in the caller.
pub struct FrameWriter<W> {
    consumer: W,
    buffer: FixedBuf,
}

impl<W: MessageConsumer> FrameWriter<W> {
    pub fn new(consumer: W, capacity: usize) -> FrameWriter<W> {
        FrameWriter {
            consumer,
            buffer: FixedBuf::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn fits(&self, frame: &Frame<'_>) -> bool {
        frame.encoded_len() <= self.buffer.capacity()
    }

    pub fn write(&mut self, frame: &Frame<'_>) {
        trace!("writing {:?} on stream {}", frame.frame_type(), frame.header().stream_id);
        let len = frame.encode(self.buffer.as_full_mut(), 0);
        self.consumer.on_message(frame.frame_type().into(), &self.buffer.as_full_mut()[..len]);
    }

    pub fn consumer(&self) -> &W {
        &self.consumer
    }

    pub fn consumer_mut(&mut self) -> &mut W {
        &mut self.consumer
    }
}


#[cfg(test)]
mod tests {
    use crate::frame::{FrameHeader, FrameType};
    use crate::message_consumer::MockMessageConsumer;
    use super::*;

    #[test]
    fn test_write() {
        let frame = Frame::End { header: FrameHeader { stream_id: 3, ..Default::default() }, extension: b"x" };
        let expected = frame.to_vec();

        let mut consumer = MockMessageConsumer::new();
        consumer.expect_on_message()
            .withf(move |type_id, buffer| *type_id == u32::from(FrameType::End) && buffer == expected.as_slice())
            .once()
            .return_const(());

        let mut writer = FrameWriter::new(consumer, 100);
        assert!(writer.fits(&frame));
        writer.write(&frame);
    }

    #[test]
    fn test_fits() {
        let writer = FrameWriter::new(MockMessageConsumer::new(), 70);
        let header = FrameHeader::default();
        assert!(writer.fits(&Frame::End { header, extension: b"" }));
        assert!(!writer.fits(&Frame::End { header, extension: b"1234567" }));
    }

    #[test]
    #[should_panic]
    fn test_write_too_big() {
        let mut writer = FrameWriter::new(MockMessageConsumer::new(), 70);
        writer.write(&Frame::End { header: FrameHeader::default(), extension: b"1234567" });
    }
}
