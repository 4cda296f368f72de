use anyhow::bail;
use crate::safe_converter::SafeCast;

/// Flow control state for one direction of a stream.
///
/// The same ledger is used on both ends of a direction: the sender advances `seq` by the
///  reserved bytes of every Data / Flush frame it sends and observes the receiver's Window frames,
///  the receiver validates incoming frames against the window it advertised and grants more
///  credit by moving `ack` and `max`.
///
/// `ack <= seq <= ack + max` holds after every operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowWindow {
    seq: u64,
    ack: u64,
    max: u32,
    budget_id: u64,
    padding: u32,
}

/// Read-only copy of a [`FlowWindow`], used by one half of a stream pair to derive the window
///  it advertises from its peer's window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowSnapshot {
    pub seq: u64,
    pub ack: u64,
    pub max: u32,
    pub budget_id: u64,
    pub padding: u32,
}

impl FlowWindow {
    /// highest sequence a direction can begin at, so that `ack + max` always fits
    pub const MAX_OPEN_SEQUENCE: u64 = u64::MAX - u32::MAX as u64;

    pub fn seq(&self) -> u64 {
        self.seq
    }
    pub fn ack(&self) -> u64 {
        self.ack
    }
    pub fn max(&self) -> u32 {
        self.max
    }
    pub fn budget_id(&self) -> u64 {
        self.budget_id
    }
    pub fn padding(&self) -> u32 {
        self.padding
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            seq: self.seq,
            ack: self.ack,
            max: self.max,
            budget_id: self.budget_id,
            padding: self.padding,
        }
    }

    /// unacknowledged bytes
    pub fn in_flight(&self) -> u64 {
        self.seq - self.ack
    }

    /// `max - (seq - ack)`, clamped to zero
    pub fn available_credit(&self) -> i64 {
        let max: i64 = self.max.safe_cast();
        (max - self.in_flight() as i64).max(0)
    }

    /// The number of payload bytes that can be sent in a single frame, i.e. available credit
    ///  minus per-frame padding
    pub fn payload_credit(&self) -> i64 {
        let padding: i64 = self.padding.safe_cast();
        (self.available_credit() - padding).max(0)
    }

    /// Sender side: account for the reserved bytes of a frame that is being sent. Callers must
    ///  have checked available credit before.
    pub fn advance_sequence(&mut self, by: u32) {
        let by: u64 = by.safe_cast();
        self.seq += by;
        debug_assert!(self.seq <= self.ack + self.max as u64,
                      "this is a bug: sent beyond the window: seq={} ack={} max={}", self.seq, self.ack, self.max);
    }

    /// Sender side: checks a Window frame from the receiver before it is applied. A failure is
    ///  a protocol violation by the peer.
    pub fn validate_window(&self, ack: u64, max: u32) -> anyhow::Result<()> {
        if ack > self.seq {
            bail!("window acknowledges {} which is beyond sequence {}", ack, self.seq);
        }
        if ack < self.ack {
            bail!("window acknowledge regressed from {} to {}", self.ack, ack);
        }
        if max < self.max {
            bail!("window maximum shrank from {} to {}", self.max, max);
        }
        Ok(())
    }

    /// Sender side: apply a (validated) Window frame
    pub fn observe_window(&mut self, ack: u64, max: u32, budget_id: u64, padding: u32) {
        debug_assert!(ack >= self.ack, "this is a bug: acknowledge regressed from {} to {}", self.ack, ack);
        debug_assert!(max >= self.max, "this is a bug: maximum shrank from {} to {}", self.max, max);
        debug_assert!(ack <= self.seq, "this is a bug: acknowledge {} beyond sequence {}", ack, self.seq);

        self.ack = ack;
        self.max = max;
        self.budget_id = budget_id;
        self.padding = padding;
    }

    /// Receiver side: a Begin frame opens the direction, adopting the sender's position
    pub fn receive_open(&mut self, seq: u64, ack: u64) -> anyhow::Result<()> {
        if ack > seq {
            bail!("acknowledge {} is beyond sequence {}", ack, seq);
        }
        if seq > Self::MAX_OPEN_SEQUENCE {
            bail!("sequence {} leaves no room for a window", seq);
        }
        if seq < self.seq {
            bail!("sequence regressed from {} to {}", self.seq, seq);
        }
        if ack < self.ack {
            bail!("acknowledge regressed from {} to {}", self.ack, ack);
        }
        self.seq = seq;
        self.ack = ack;
        Ok(())
    }

    /// Receiver side: a Data or Flush frame consumes `reserved` bytes of the advertised window
    pub fn receive(&mut self, seq: u64, ack: u64, reserved: u32) -> anyhow::Result<()> {
        self.check_position(seq, ack)?;

        let reserved: u64 = reserved.safe_cast();
        let Some(new_seq) = seq.checked_add(reserved) else {
            bail!("flow control violation: sequence {} + reserved {} overflows", seq, reserved);
        };
        self.check_limit(new_seq)?;
        self.seq = new_seq;
        Ok(())
    }

    /// Receiver side: a Data frame must reserve its payload plus the padding this ledger
    ///  advertised
    pub fn check_reserved(&self, reserved: u32, length: usize) -> anyhow::Result<()> {
        let length: u64 = length.safe_cast();
        let padding: u64 = self.padding.safe_cast();
        if u64::from(reserved) < length + padding {
            bail!("flow control violation: {} reserved bytes for a payload of {} with padding {}", reserved, length, self.padding);
        }
        Ok(())
    }

    /// Receiver side: End and Abort carry the final sequence without reserving anything
    pub fn receive_close(&mut self, seq: u64, ack: u64) -> anyhow::Result<()> {
        self.check_position(seq, ack)?;
        self.check_limit(seq)?;
        self.seq = seq;
        Ok(())
    }

    fn check_limit(&self, seq: u64) -> anyhow::Result<()> {
        let max: u64 = self.max.safe_cast();
        if seq > self.ack.saturating_add(max) {
            bail!("flow control violation: sequence {} exceeds acknowledge {} + maximum {}", seq, self.ack, self.max);
        }
        Ok(())
    }

    fn check_position(&self, seq: u64, ack: u64) -> anyhow::Result<()> {
        if ack > seq {
            bail!("acknowledge {} is beyond sequence {}", ack, seq);
        }
        if seq < self.seq {
            bail!("sequence regressed from {} to {}", self.seq, seq);
        }
        if ack > self.ack {
            bail!("acknowledge {} is beyond the advertised acknowledge {}", ack, self.ack);
        }
        Ok(())
    }

    /// Receiver side: advertise a new window. Returns `true` if anything changed, i.e. if a
    ///  Window frame should be sent.
    pub fn grant(&mut self, ack: u64, max: u32, budget_id: u64, padding: u32) -> bool {
        debug_assert!(ack <= self.seq, "this is a bug: granting acknowledge {} beyond sequence {}", ack, self.seq);

        let ack = ack.max(self.ack);
        let max = max.max(self.max);
        let changed = ack != self.ack || max != self.max || budget_id != self.budget_id || padding != self.padding;

        self.ack = ack;
        self.max = max;
        self.budget_id = budget_id;
        self.padding = padding;
        changed
    }

    /// Receiver side: acknowledge everything received so far without changing the window size
    pub fn acknowledge_all(&mut self) -> bool {
        let (max, budget_id, padding) = (self.max, self.budget_id, self.padding);
        self.grant(self.seq, max, budget_id, padding)
    }

    /// explicit reset for a stream that is reopened
    pub fn reopen(&mut self) {
        *self = FlowWindow::default();
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(seq: u64, ack: u64, max: u32) -> FlowWindow {
        FlowWindow { seq, ack, max, budget_id: 0, padding: 0 }
    }
}
