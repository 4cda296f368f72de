//! Protocol specific policy for a proxy. The paired stream state machines, flow control and
//!  cleanup are generic; a binding only decides how a stream's Begin extension is interpreted,
//!  which route applies, what the connecting streams begin with and how requests are correlated.

pub mod proxy;
pub mod raw;

use crate::config::RouteConfig;
use crate::correlation::CorrelationKey;
use crate::frame::{BeginFrame, DataFlags, DataFrame, Extension, MessageDataEx};

pub trait Binding {
    type BeginEx: Extension;

    /// `true` if `route` applies to a stream that began with `begin_ex`
    fn matches(&self, route: &RouteConfig, begin_ex: Option<&Self::BeginEx>) -> bool;

    /// the Begin extension for the connecting stream to `exit`
    fn connect_ex(&self, _route: &RouteConfig, _exit: u64, begin_ex: Option<&Self::BeginEx>) -> Option<Self::BeginEx> {
        begin_ex.cloned()
    }

    fn correlate(&self, begin: &BeginFrame<'_>, _begin_ex: Option<&Self::BeginEx>) -> CorrelationKey {
        CorrelationKey::Stream(begin.stream_id())
    }

    /// The total length of a message, declared on its first fragment. Reassembly of a message
    ///  with a declared length completes without a FIN flag.
    fn declared_length(&self, data: &DataFrame<'_>) -> Option<u32> {
        if !data.flags().contains(DataFlags::INIT) {
            return None;
        }
        MessageDataEx::decode(data.extension())
            .ok()
            .flatten()
            .map(|ex| ex.length)
    }
}
