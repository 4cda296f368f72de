use tracing::{debug, trace};
use crate::buffers::fixed_buffer::FixedBuf;

/// Handle for a slot acquired from a [`SlotPool`]. A stream that holds no slot keeps `None`
///  where it would keep its `SlotId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

struct Slot {
    /// allocated on first use and kept for reuse after that
    buffer: Option<FixedBuf>,
    owner: Option<u64>,
}

/// A fixed number of fixed-capacity buffers shared by all streams of an engine. Acquisition never
///  blocks: a caller that gets no slot has to reject the stream that needed it.
pub struct SlotPool {
    slot_capacity: usize,
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl SlotPool {
    pub fn new(slot_count: usize, slot_capacity: usize) -> SlotPool {
        SlotPool {
            slot_capacity,
            slots: (0..slot_count)
                .map(|_| Slot { buffer: None, owner: None })
                .collect(),
            // lowest indexes are handed out first
            free: (0..slot_count).rev().collect(),
        }
    }

    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn acquired(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn acquire(&mut self, owner_stream_id: u64) -> Option<SlotId> {
        let Some(idx) = self.free.pop() else {
            debug!("no slot available for stream {}", owner_stream_id);
            return None;
        };

        let slot = &mut self.slots[idx];
        if slot.buffer.is_none() {
            trace!("allocating buffer for slot {}", idx);
            slot.buffer = Some(FixedBuf::new(self.slot_capacity));
        }
        slot.owner = Some(owner_stream_id);
        trace!("slot {} acquired by stream {}", idx, owner_stream_id);
        Some(SlotId(idx))
    }

    pub fn release(&mut self, slot_id: SlotId) {
        let slot = &mut self.slots[slot_id.0];
        let owner = slot.owner.take();
        assert!(owner.is_some(), "this is a bug: slot {} was released twice", slot_id.0);

        if let Some(buffer) = slot.buffer.as_mut() {
            buffer.clear();
        }
        self.free.push(slot_id.0);
        trace!("slot {} released by stream {:?}", slot_id.0, owner);
    }

    pub fn owner(&self, slot_id: SlotId) -> Option<u64> {
        self.slots[slot_id.0].owner
    }

    fn acquired_slot(&self, slot_id: SlotId) -> &Slot {
        let slot = &self.slots[slot_id.0];
        assert!(slot.owner.is_some(), "this is a bug: access to slot {} which is not acquired", slot_id.0);
        slot
    }

    pub fn buffer(&self, slot_id: SlotId) -> &FixedBuf {
        match &self.acquired_slot(slot_id).buffer {
            Some(buffer) => buffer,
            None => unreachable!("acquired slots always have a buffer"),
        }
    }

    pub fn buffer_mut(&mut self, slot_id: SlotId) -> &mut FixedBuf {
        self.acquired_slot(slot_id);
        match &mut self.slots[slot_id.0].buffer {
            Some(buffer) => buffer,
            None => unreachable!("acquired slots always have a buffer"),
        }
    }
}


#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use super::*;

    #[test]
    fn test_acquire_release() {
        let mut pool = SlotPool::new(2, 16);
        assert_eq!(pool.available(), 2);

        let a = pool.acquire(1).unwrap();
        let b = pool.acquire(3).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.acquire(5), None);
        assert_eq!(pool.acquired(), 2);
        assert_eq!(pool.owner(a), Some(1));
        assert_eq!(pool.owner(b), Some(3));

        pool.buffer_mut(a).put_slice(b"abc");
        assert_eq!(pool.buffer(a).as_ref(), b"abc");
        assert_eq!(pool.buffer(a).capacity(), 16);

        pool.release(a);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.owner(a), None);

        // the released slot is reused, and it is empty
        let c = pool.acquire(5).unwrap();
        assert_eq!(c, a);
        assert!(pool.buffer(c).is_empty());
    }

    #[test]
    #[should_panic]
    fn test_double_release() {
        let mut pool = SlotPool::new(2, 16);
        let a = pool.acquire(1).unwrap();
        pool.release(a);
        pool.release(a);
    }

    #[test]
    #[should_panic]
    fn test_access_released() {
        let mut pool = SlotPool::new(2, 16);
        let a = pool.acquire(1).unwrap();
        pool.release(a);
        pool.buffer(a);
    }

    #[test]
    fn test_empty_pool() {
        let mut pool = SlotPool::new(0, 16);
        assert_eq!(pool.acquire(1), None);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.acquired(), 0);
    }
}
