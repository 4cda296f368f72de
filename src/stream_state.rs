use bitflags::bitflags;

bitflags! {
    /// Lifecycle of both directions of a stream. Transitions only ever add bits, so a direction
    ///  never leaves `Closed` except through an explicit [`StreamState::reset`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StreamState: u8 {
        const REPLY_OPENING = 0x01;
        const REPLY_OPENED = 0x02;
        const REPLY_CLOSING = 0x04;
        const REPLY_CLOSED = 0x08;
        const INITIAL_OPENING = 0x10;
        const INITIAL_OPENED = 0x20;
        const INITIAL_CLOSING = 0x40;
        const INITIAL_CLOSED = 0x80;
    }
}

/// the two directions of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// client to target
    Initial,
    /// target to client
    Reply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfState {
    Unopened,
    Opening,
    Open,
    Closing,
    Closed,
}

impl StreamState {
    /// the state bits for one direction: opening, opened, closing, closed
    fn direction_bits(direction: Direction) -> [StreamState; 4] {
        match direction {
            Direction::Initial => [StreamState::INITIAL_OPENING, StreamState::INITIAL_OPENED, StreamState::INITIAL_CLOSING, StreamState::INITIAL_CLOSED],
            Direction::Reply => [StreamState::REPLY_OPENING, StreamState::REPLY_OPENED, StreamState::REPLY_CLOSING, StreamState::REPLY_CLOSED],
        }
    }

    pub fn half(&self, direction: Direction) -> HalfState {
        let [opening, opened, closing, closed] = Self::direction_bits(direction);
        if self.contains(closed) {
            HalfState::Closed
        }
        else if self.contains(closing) {
            HalfState::Closing
        }
        else if self.contains(opened) {
            HalfState::Open
        }
        else if self.contains(opening) {
            HalfState::Opening
        }
        else {
            HalfState::Unopened
        }
    }

    pub fn set_opening(&mut self, direction: Direction) {
        let [opening, ..] = Self::direction_bits(direction);
        self.insert(opening);
    }
    pub fn set_opened(&mut self, direction: Direction) {
        let [opening, opened, ..] = Self::direction_bits(direction);
        self.insert(opening | opened);
    }
    pub fn set_closing(&mut self, direction: Direction) {
        let [_, _, closing, _] = Self::direction_bits(direction);
        self.insert(closing);
    }
    pub fn set_closed(&mut self, direction: Direction) {
        let [_, _, closing, closed] = Self::direction_bits(direction);
        self.insert(closing | closed);
    }

    pub fn is_opening(&self, direction: Direction) -> bool {
        self.contains(Self::direction_bits(direction)[0])
    }
    pub fn is_opened(&self, direction: Direction) -> bool {
        self.contains(Self::direction_bits(direction)[1])
    }
    pub fn is_closing(&self, direction: Direction) -> bool {
        self.contains(Self::direction_bits(direction)[2])
    }
    pub fn is_closed(&self, direction: Direction) -> bool {
        self.contains(Self::direction_bits(direction)[3])
    }

    /// both directions closed
    pub fn closed(&self) -> bool {
        self.contains(StreamState::INITIAL_CLOSED | StreamState::REPLY_CLOSED)
    }

    /// back to `Unopened` in both directions, for a stream that is explicitly reopened
    pub fn reset(&mut self) {
        *self = StreamState::empty();
    }
}
