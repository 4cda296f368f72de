use std::collections::VecDeque;
use anyhow::{anyhow, bail};
use bytes::BufMut;
use tracing::trace;
use crate::buffers::slot_pool::{SlotId, SlotPool};
use crate::frame::DataFlags;
use crate::safe_converter::{PrecheckedCast, SafeCast};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CompleteMessage {
    len: usize,
    /// credit the sender reserved for all fragments of this message
    reserved: u64,
}

#[derive(Debug, Default)]
struct PartialMessage {
    len: usize,
    reserved: u64,
    /// declared length minus bytes seen so far
    deferred: Option<u32>,
}

/// Reassembles messages that arrive as a sequence of Data fragments into a slot.
///
/// A message is complete when a fragment carries `FIN`, or when the length declared on its first
///  fragment has been received. Complete messages stay in the slot until they are taken out one
///  at a time, and fragments of the next message can keep arriving behind them. The slot is
///  acquired with the first fragment and released as soon as it holds nothing anymore.
#[derive(Debug, Default)]
pub struct Reassembler {
    slot: Option<SlotId>,
    complete: VecDeque<CompleteMessage>,
    partial: Option<PartialMessage>,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Default::default()
    }

    /// Appends a fragment, returning `true` if it completed a message. Errors (no slot available,
    ///  slot capacity exceeded, inconsistent declared length) are fatal for the stream, and the
    ///  caller is expected to clean up, releasing the slot through [`Reassembler::release`].
    pub fn append(&mut self, slots: &mut SlotPool, owner_stream_id: u64, fragment: &[u8], reserved: u32, flags: DataFlags, declared_length: Option<u32>) -> anyhow::Result<bool> {
        let slot = match self.slot {
            Some(slot) => slot,
            None => {
                let slot = slots.acquire(owner_stream_id)
                    .ok_or_else(|| anyhow!("no slot available to reassemble a message"))?;
                self.slot = Some(slot);
                slot
            }
        };

        let buffer = slots.buffer_mut(slot);
        if fragment.len() > buffer.remaining_capacity() {
            bail!("message fragment of {} bytes exceeds the remaining slot capacity of {} bytes", fragment.len(), buffer.remaining_capacity());
        }

        let partial = self.partial.get_or_insert_with(|| PartialMessage {
            deferred: declared_length,
            ..Default::default()
        });

        if let Some(deferred) = partial.deferred {
            let fragment_len: u32 = fragment.len().prechecked_cast();
            if fragment_len > deferred {
                bail!("message exceeds its declared length by {} bytes", fragment_len - deferred);
            }
            partial.deferred = Some(deferred - fragment_len);
        }

        buffer.put_slice(fragment);
        partial.len += fragment.len();
        let reserved: u64 = reserved.safe_cast();
        partial.reserved += reserved;

        let fin = flags.contains(DataFlags::FIN);
        match partial.deferred {
            Some(deferred) if fin && deferred > 0 => {
                bail!("message ended {} bytes short of its declared length", deferred);
            }
            Some(0) => {}
            _ if fin => {}
            _ => return Ok(false),
        }

        let complete = CompleteMessage {
            len: partial.len,
            reserved: partial.reserved,
        };
        self.partial = None;
        trace!("stream {}: message of {} bytes complete, {} queued", owner_stream_id, complete.len, self.complete.len() + 1);
        self.complete.push_back(complete);
        Ok(true)
    }

    /// The oldest complete message, if any. The slice aliases the slot.
    pub fn front<'a>(&self, slots: &'a SlotPool) -> Option<&'a [u8]> {
        let message = self.complete.front()?;
        let slot = self.slot?;
        Some(&slots.buffer(slot).as_ref()[..message.len])
    }

    /// Removes the oldest complete message, returning the credit the sender had reserved for
    ///  it. The slot is released if nothing remains in it.
    pub fn pop_front(&mut self, slots: &mut SlotPool) -> Option<u64> {
        let message = self.complete.pop_front()?;
        let slot = self.slot?;

        slots.buffer_mut(slot).consume(message.len);
        if self.complete.is_empty() && self.partial.is_none() {
            slots.release(slot);
            self.slot = None;
        }
        Some(message.reserved)
    }

    pub fn has_complete(&self) -> bool {
        !self.complete.is_empty()
    }

    pub fn num_complete(&self) -> usize {
        self.complete.len()
    }

    /// `true` while a message is partially received
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    pub fn holds_slot(&self) -> bool {
        self.slot.is_some()
    }

    /// Discards everything and releases the slot. Calling this more than once is harmless.
    pub fn release(&mut self, slots: &mut SlotPool) {
        if let Some(slot) = self.slot.take() {
            slots.release(slot);
        }
        self.complete.clear();
        self.partial = None;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    const MESSAGE: &[u8] = b"select * from the_table where answer = 42";

    #[rstest]
    #[case::unfragmented(vec![MESSAGE.len()])]
    #[case::two(vec![10, MESSAGE.len() - 10])]
    #[case::uneven(vec![1, 2, 30, MESSAGE.len() - 33])]
    #[case::single_bytes(vec![1; MESSAGE.len()])]
    #[case::empty_fragments(vec![0, 20, 0, MESSAGE.len() - 20])]
    fn test_fragmented_with_fin(#[case] fragment_lengths: Vec<usize>) {
        let mut slots = SlotPool::new(1, 64);
        let mut reassembler = Reassembler::new();

        let mut offset = 0;
        for (i, len) in fragment_lengths.iter().enumerate() {
            let last = i == fragment_lengths.len() - 1;
            let flags = match (i == 0, last) {
                (true, true) => DataFlags::COMPLETE,
                (true, false) => DataFlags::INIT,
                (false, true) => DataFlags::FIN,
                (false, false) => DataFlags::empty(),
            };

            let completed = reassembler.append(&mut slots, 1, &MESSAGE[offset..offset + len], (*len as u32) + 2, flags, None).unwrap();
            assert_eq!(completed, last);
            offset += len;
        }

        assert_eq!(reassembler.front(&slots), Some(MESSAGE));
        assert_eq!(reassembler.pop_front(&mut slots), Some(MESSAGE.len() as u64 + 2 * fragment_lengths.len() as u64));
        assert_eq!(reassembler.front(&slots), None);
        assert!(!reassembler.holds_slot());
        assert_eq!(slots.available(), 1);
    }

    #[rstest]
    #[case::single(vec![MESSAGE.len()])]
    #[case::two(vec![10, MESSAGE.len() - 10])]
    #[case::three(vec![5, 5, MESSAGE.len() - 10])]
    fn test_fragmented_with_declared_length(#[case] fragment_lengths: Vec<usize>) {
        let mut slots = SlotPool::new(1, 64);
        let mut reassembler = Reassembler::new();

        let mut offset = 0;
        for (i, len) in fragment_lengths.iter().enumerate() {
            let declared = if i == 0 { Some(MESSAGE.len() as u32) } else { None };
            let completed = reassembler.append(&mut slots, 1, &MESSAGE[offset..offset + len], *len as u32, DataFlags::empty(), declared).unwrap();
            assert_eq!(completed, i == fragment_lengths.len() - 1);
            offset += len;
        }

        assert_eq!(reassembler.front(&slots), Some(MESSAGE));
    }

    #[test]
    fn test_queued_messages() {
        let mut slots = SlotPool::new(1, 64);
        let mut reassembler = Reassembler::new();

        assert!(reassembler.append(&mut slots, 1, b"first", 5, DataFlags::COMPLETE, None).unwrap());
        assert!(!reassembler.append(&mut slots, 1, b"sec", 3, DataFlags::INIT, None).unwrap());
        assert!(reassembler.append(&mut slots, 1, b"ond", 3, DataFlags::FIN, None).unwrap());
        assert!(!reassembler.append(&mut slots, 1, b"thi", 3, DataFlags::INIT, None).unwrap());

        assert_eq!(reassembler.num_complete(), 2);
        assert!(reassembler.in_progress());

        assert_eq!(reassembler.front(&slots), Some(&b"first"[..]));
        assert_eq!(reassembler.pop_front(&mut slots), Some(5));
        assert_eq!(reassembler.front(&slots), Some(&b"second"[..]));
        assert_eq!(reassembler.pop_front(&mut slots), Some(6));

        // the partial message keeps the slot
        assert_eq!(reassembler.front(&slots), None);
        assert!(reassembler.holds_slot());

        assert!(reassembler.append(&mut slots, 1, b"rd", 2, DataFlags::FIN, None).unwrap());
        assert_eq!(reassembler.front(&slots), Some(&b"third"[..]));
        assert_eq!(reassembler.pop_front(&mut slots), Some(5));
        assert!(!reassembler.holds_slot());
        assert_eq!(reassembler.pop_front(&mut slots), None);
    }

    #[test]
    fn test_slot_exhausted() {
        let mut slots = SlotPool::new(1, 64);
        let mut first = Reassembler::new();
        let mut second = Reassembler::new();

        assert!(!first.append(&mut slots, 1, b"abc", 3, DataFlags::INIT, None).unwrap());
        assert!(second.append(&mut slots, 3, b"xyz", 3, DataFlags::INIT, None).is_err());
        assert!(!second.holds_slot());

        // the first stream is unaffected
        assert!(first.append(&mut slots, 1, b"def", 3, DataFlags::FIN, None).unwrap());
        assert_eq!(first.front(&slots), Some(&b"abcdef"[..]));
    }

    #[rstest]
    #[case::capacity_exceeded(b"0123456789abcdefg", DataFlags::FIN, None)]
    #[case::longer_than_declared(b"0123", DataFlags::empty(), Some(3))]
    #[case::shorter_than_declared(b"0123", DataFlags::FIN, Some(5))]
    fn test_invalid(#[case] fragment: &[u8], #[case] flags: DataFlags, #[case] declared: Option<u32>) {
        let mut slots = SlotPool::new(1, 16);
        let mut reassembler = Reassembler::new();

        assert!(reassembler.append(&mut slots, 1, fragment, 20, flags, declared).is_err());

        reassembler.release(&mut slots);
        reassembler.release(&mut slots);
        assert_eq!(slots.available(), 1);
    }
}
