/// Allocates ids for the streams an engine opens.
///
/// Initial stream ids are odd and a reply stream id is derived from its initial stream id, so
///  the two directions of a stream can always be told apart by their id.
pub trait StreamIdSupplier {
    fn supply_initial_id(&mut self, routed_id: u64) -> u64;

    fn supply_reply_id(&self, initial_id: u64) -> u64 {
        initial_id ^ 1
    }

    fn supply_trace_id(&mut self) -> u64;

    fn is_initial(&self, stream_id: u64) -> bool {
        stream_id & 1 == 1
    }
}

/// Hands out ids sequentially. The top 16 bits hold a namespace so that engines which exchange
///  frames with each other never allocate the same id.
pub struct SequentialIdSupplier {
    namespace: u64,
    next_initial: u64,
    next_trace: u64,
}

impl SequentialIdSupplier {
    const COUNTER_MASK: u64 = (1 << 48) - 1;

    pub fn new(namespace: u16) -> SequentialIdSupplier {
        SequentialIdSupplier {
            namespace: (namespace as u64) << 48,
            next_initial: 1,
            next_trace: 1,
        }
    }
}

impl StreamIdSupplier for SequentialIdSupplier {
    fn supply_initial_id(&mut self, _routed_id: u64) -> u64 {
        let id = self.namespace | (self.next_initial & Self::COUNTER_MASK);
        // stays odd when wrapping at 48 bits
        self.next_initial = (self.next_initial + 2) & Self::COUNTER_MASK;
        id
    }

    fn supply_trace_id(&mut self) -> u64 {
        let id = self.namespace | (self.next_trace & Self::COUNTER_MASK);
        self.next_trace = (self.next_trace + 1) & Self::COUNTER_MASK;
        id
    }
}
