//! The core of a protocol bridge: streams accepted on one binding are proxied to streams on
//!  other bindings, with per-stream flow control, message reassembly, request correlation and
//!  cleanup that is contained to the stream that failed.
//!
//! ## Design goals
//!
//! * Single threaded and event driven: every frame is handled to completion before the next one,
//!    so there are no locks in the core. Several engines can run side by side, each with its own
//!    stream id namespace.
//! * Frames are decoded in place through flyweight views and copied once, into the outbound
//!    write buffer
//! * Both sides of a proxy speak the same frame protocol, so engines can be chained
//! * A failure only ever terminates the stream it happened on: a misbehaving peer gets a Reset
//!    or Abort, and every resource the stream held is returned
//! * Protocol specific behavior (routing conditions, correlation, Begin extensions) lives in a
//!    [`binding::Binding`], the stream bookkeeping exists exactly once
//!
//! ## Streams
//!
//! A stream has an initial direction (from the side that began it) and a reply direction, each
//!  with its own stream id. Initial stream ids are odd, the matching reply id is the initial id
//!  with the lowest bit cleared.
//!
//! Each direction is flow controlled by its receiver: the sender may send Data and Flush frames
//!  as long as `seq + reserved <= ack + max`, where `ack` and `max` are from the receiver's last
//!  Window. `reserved` is the payload length plus the padding the receiver asked for.
//!
//! A direction ends with End (regular) or Abort (sender gives up). The receiver can end it with
//!  Reset. Reset and Window travel against the direction they refer to.
//!
//! ## Wire format
//!
//! All numbers are big-endian. Every frame starts with the same header:
//!
//! ```ascii
//!  0: type id (u32)
//!       Begin=0x00000001 Data=0x00000002 End=0x00000003 Abort=0x00000004 Flush=0x00000005
//!       Reset=0x40000001 Window=0x40000002
//!  4: origin id (u64) - binding the frame's stream came from
//! 12: routed id (u64) - binding the frame's stream is routed to
//! 20: stream id (u64)
//! 28: sequence (u64)
//! 36: acknowledge (u64)
//! 44: maximum (u32)
//! 48: trace id (u64)
//! 56: authorization (u64)
//! ```
//!
//! followed by a kind specific part:
//!
//! ```ascii
//! Begin:               affinity (u64), extension
//! Data:                budget id (u64), reserved (u32), flags (u8), payload length (u32),
//!                       payload, extension
//! Flush:               budget id (u64), reserved (u32), extension
//! End / Abort / Reset: extension
//! Window:              budget id (u64), padding (u32), capabilities (u8)
//!
//! extension:           length (u32), octets
//! ```
//!
//! Data flags: `FIN` 0x01 (last fragment of a message), `INIT` 0x02 (first fragment),
//!  `INCOMPLETE` 0x04, `SKIP` 0x08.
//!
//! Typed extensions start with their own type id (u32), see [`frame::Extension`].

pub mod binding;
pub mod budget;
pub mod buffers;
pub mod config;
pub mod correlation;
pub mod driver;
pub mod flow_window;
pub mod frame;
pub mod frame_writer;
pub mod id_supplier;
pub mod message_consumer;
pub mod network;
pub mod proxy;
pub mod safe_converter;
pub mod stream_state;
pub mod util;

#[cfg(test)]
mod test_util;
