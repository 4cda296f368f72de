use crate::flow_window::FlowWindow;
use crate::frame::{DataFlags, Frame, FrameHeader};
use crate::frame_writer::FrameWriter;
use crate::message_consumer::MessageConsumer;
use crate::stream_state::{Direction, StreamState};

/// One side of a proxied stream pair: either the stream accepted from a client, or a stream the
///  proxy opened towards a target.
///
/// Both sides look the same from the frame level. The accepting side receives the initial
///  direction and sends the reply direction, the connecting side does the opposite. Which frames
///  a half sends in a direction is up to the caller; the `do_*` methods only keep state and flow
///  control consistent with what is written, and never write a terminal frame twice.
#[derive(Debug)]
pub(crate) struct StreamHalf {
    pub(crate) origin_id: u64,
    pub(crate) routed_id: u64,
    pub(crate) initial_id: u64,
    pub(crate) reply_id: u64,
    pub(crate) authorization: u64,
    pub(crate) affinity: u64,
    pub(crate) state: StreamState,
    pub(crate) initial: FlowWindow,
    pub(crate) reply: FlowWindow,
}

impl StreamHalf {
    pub fn new(origin_id: u64, routed_id: u64, initial_id: u64, reply_id: u64, authorization: u64, affinity: u64) -> StreamHalf {
        StreamHalf {
            origin_id,
            routed_id,
            initial_id,
            reply_id,
            authorization,
            affinity,
            state: StreamState::default(),
            initial: FlowWindow::default(),
            reply: FlowWindow::default(),
        }
    }

    pub fn stream_id(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Initial => self.initial_id,
            Direction::Reply => self.reply_id,
        }
    }

    pub fn window(&self, direction: Direction) -> &FlowWindow {
        match direction {
            Direction::Initial => &self.initial,
            Direction::Reply => &self.reply,
        }
    }

    pub fn window_mut(&mut self, direction: Direction) -> &mut FlowWindow {
        match direction {
            Direction::Initial => &mut self.initial,
            Direction::Reply => &mut self.reply,
        }
    }

    /// `true` once both directions are closed
    pub fn is_closed(&self) -> bool {
        self.state.closed()
    }

    /// Back to a pristine state for a stream that is opened again under the same ids
    pub fn reopen(&mut self) {
        self.state.reset();
        self.initial.reopen();
        self.reply.reopen();
    }

    fn header(&self, direction: Direction, trace_id: u64) -> FrameHeader {
        let window = self.window(direction);
        FrameHeader {
            origin_id: self.origin_id,
            routed_id: self.routed_id,
            stream_id: self.stream_id(direction),
            sequence: window.seq(),
            acknowledge: window.ack(),
            maximum: window.max(),
            trace_id,
            authorization: self.authorization,
        }
    }

    /// `true` if the peer knows about this stream, i.e. if a Begin went either way
    fn is_known_to_peer(&self) -> bool {
        self.state.is_opening(Direction::Initial) || self.state.is_opening(Direction::Reply)
    }

    pub fn do_begin<W: MessageConsumer>(&mut self, writer: &mut FrameWriter<W>, direction: Direction, trace_id: u64, extension: &[u8]) {
        self.state.set_opening(direction);
        writer.write(&Frame::Begin {
            header: self.header(direction, trace_id),
            affinity: self.affinity,
            extension,
        });
    }

    /// Callers must have checked available credit
    #[allow(clippy::too_many_arguments)]
    pub fn do_data<W: MessageConsumer>(&mut self, writer: &mut FrameWriter<W>, direction: Direction, trace_id: u64, flags: DataFlags, reserved: u32, payload: &[u8], extension: &[u8]) {
        let header = self.header(direction, trace_id);
        let window = self.window_mut(direction);
        let budget_id = window.budget_id();
        window.advance_sequence(reserved);

        writer.write(&Frame::Data {
            header,
            budget_id,
            reserved,
            flags,
            payload,
            extension,
        });
    }

    pub fn do_flush<W: MessageConsumer>(&mut self, writer: &mut FrameWriter<W>, direction: Direction, trace_id: u64, reserved: u32, extension: &[u8]) {
        let header = self.header(direction, trace_id);
        let window = self.window_mut(direction);
        let budget_id = window.budget_id();
        window.advance_sequence(reserved);

        writer.write(&Frame::Flush {
            header,
            budget_id,
            reserved,
            extension,
        });
    }

    /// Closes `direction`, sending End only if it was opened and is not closed yet
    pub fn do_end<W: MessageConsumer>(&mut self, writer: &mut FrameWriter<W>, direction: Direction, trace_id: u64, extension: &[u8]) {
        if self.state.is_closed(direction) {
            return;
        }
        let opening = self.state.is_opening(direction);
        self.state.set_closed(direction);
        if opening {
            writer.write(&Frame::End {
                header: self.header(direction, trace_id),
                extension,
            });
        }
    }

    /// Closes `direction`, sending Abort only if it was opened and is not closed yet
    pub fn do_abort<W: MessageConsumer>(&mut self, writer: &mut FrameWriter<W>, direction: Direction, trace_id: u64) {
        if self.state.is_closed(direction) {
            return;
        }
        let opening = self.state.is_opening(direction);
        self.state.set_closed(direction);
        if opening {
            writer.write(&Frame::Abort {
                header: self.header(direction, trace_id),
                extension: &[],
            });
        }
    }

    pub fn do_window<W: MessageConsumer>(&mut self, writer: &mut FrameWriter<W>, direction: Direction, trace_id: u64, capabilities: u8) {
        let window = self.window(direction);
        writer.write(&Frame::Window {
            header: self.header(direction, trace_id),
            budget_id: window.budget_id(),
            padding: window.padding(),
            capabilities,
        });
    }

    /// Closes `direction` from the receiving end, sending Reset unless it is closed already or
    ///  the peer never heard of this stream
    pub fn do_reset<W: MessageConsumer>(&mut self, writer: &mut FrameWriter<W>, direction: Direction, trace_id: u64) {
        if self.state.is_closed(direction) {
            return;
        }
        let known = self.is_known_to_peer();
        self.state.set_closed(direction);
        if known {
            writer.write(&Frame::Reset {
                header: self.header(direction, trace_id),
                extension: &[],
            });
        }
    }
}
