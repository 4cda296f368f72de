//! Helpers for tests that look at the frames an engine writes

use std::cell::RefCell;
use std::rc::Rc;
use crate::frame::{DataFlags, FrameHeader, FrameType, FrameView};
use crate::message_consumer::MessageConsumer;

/// Keeps every frame it receives. Clones share the recorded frames, so a test can hold on to one
///  while an engine owns the other.
#[derive(Clone, Default)]
pub struct RecordingConsumer {
    frames: Rc<RefCell<Vec<Vec<u8>>>>,
}
impl RecordingConsumer {
    pub fn new() -> RecordingConsumer {
        Default::default()
    }

    pub fn frames(&self) -> Rc<RefCell<Vec<Vec<u8>>>> {
        self.frames.clone()
    }

    /// decodes and removes all frames recorded so far
    pub fn take(&self) -> Vec<Recorded> {
        self.frames.borrow_mut()
            .drain(..)
            .map(|f| Recorded::decode(&f))
            .collect()
    }
}
impl MessageConsumer for RecordingConsumer {
    fn on_message(&mut self, type_id: u32, buffer: &[u8]) {
        assert_eq!(Some(type_id), FrameView::wrap(buffer, 0, buffer.len()).map(|f| f.frame_type().into()),
                   "written frame does not decode to its type id");
        self.frames.borrow_mut().push(buffer.to_vec());
    }
}

/// An owned, flattened copy of a frame, with zero / empty values for fields its kind does
///  not have
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub frame_type: FrameType,
    pub header: FrameHeader,
    pub affinity: u64,
    pub budget_id: u64,
    pub reserved: u32,
    pub padding: u32,
    pub capabilities: u8,
    pub flags: DataFlags,
    pub payload: Vec<u8>,
    pub extension: Vec<u8>,
}
impl Recorded {
    pub fn decode(buffer: &[u8]) -> Recorded {
        let Some(frame) = FrameView::wrap(buffer, 0, buffer.len()) else {
            panic!("not a valid frame: {:?}", buffer);
        };
        let mut result = Recorded {
            frame_type: frame.frame_type(),
            header: frame.header().to_header(),
            affinity: 0,
            budget_id: 0,
            reserved: 0,
            padding: 0,
            capabilities: 0,
            flags: DataFlags::empty(),
            payload: vec![],
            extension: vec![],
        };
        match frame {
            FrameView::Begin(f) => {
                result.affinity = f.affinity();
                result.extension = f.extension().to_vec();
            }
            FrameView::Data(f) => {
                result.budget_id = f.budget_id();
                result.reserved = f.reserved();
                result.flags = f.flags();
                result.payload = f.payload().to_vec();
                result.extension = f.extension().to_vec();
            }
            FrameView::Flush(f) => {
                result.budget_id = f.budget_id();
                result.reserved = f.reserved();
                result.extension = f.extension().to_vec();
            }
            FrameView::End(f) => result.extension = f.extension().to_vec(),
            FrameView::Abort(f) => result.extension = f.extension().to_vec(),
            FrameView::Reset(f) => result.extension = f.extension().to_vec(),
            FrameView::Window(f) => {
                result.budget_id = f.budget_id();
                result.padding = f.padding();
                result.capabilities = f.capabilities();
            }
        }
        result
    }

    pub fn stream_id(&self) -> u64 {
        self.header.stream_id
    }

    pub fn kind(&self) -> (FrameType, u64) {
        (self.frame_type, self.header.stream_id)
    }
}

/// header for a frame sent to an engine
pub fn header(routed_id: u64, stream_id: u64, sequence: u64, acknowledge: u64, maximum: u32) -> FrameHeader {
    FrameHeader {
        origin_id: 0,
        routed_id,
        stream_id,
        sequence,
        acknowledge,
        maximum,
        trace_id: 0,
        authorization: 0,
    }
}
