//! The paired stream proxy.
//!
//! A [`ProxyEngine`] accepts streams that begin on one of its attached bindings, resolves a route
//!  for each and opens one stream per route exit towards the targets. From then on it relays
//!  frames between the accepted stream and the connecting stream(s), translating stream ids and
//!  flow control positions, until every direction on both sides is closed.
//!
//! ```ascii
//!   client                        engine                          target(s)
//!             initial_id  ->  [ StreamPair ]  ->  connect initial_id
//!             reply_id    <-  [            ]  <-  connect reply_id
//! ```
//!
//! Frames are handled one at a time through [`MessageConsumer::on_message`], and everything the
//!  engine produces is written synchronously to the consumer it was created with. An engine is
//!  single threaded; several engines can be run side by side with separate id namespaces.

pub(crate) mod half;
mod pair;

use std::sync::Arc;
use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace};
use crate::binding::Binding;
use crate::buffers::slot_pool::SlotPool;
use crate::config::{BindingConfig, EngineConfig, ForwardMode};
use crate::correlation::{CorrelationKey, Correlator};
use crate::frame::{BeginFrame, Extension, Frame, FrameHeader, FrameHeaderView, FrameView};
use crate::frame_writer::FrameWriter;
use crate::id_supplier::StreamIdSupplier;
use crate::message_consumer::MessageConsumer;
use crate::proxy::half::StreamHalf;
use crate::proxy::pair::StreamPair;
use crate::stream_state::Direction;

/// What a stream id refers to within its pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    AcceptInitial,
    AcceptReply,
    ConnectInitial(usize),
    ConnectReply(usize),
}

#[derive(Debug, Clone, Copy)]
struct StreamRef {
    pair_id: u64,
    role: Role,
}

/// Engine wide resources that the handlers of a stream pair work with
pub(crate) struct ProxyContext<W> {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) writer: FrameWriter<W>,
    pub(crate) slots: SlotPool,
    /// in-flight requests, keyed by correlation and referring to the accepted stream's id
    pub(crate) correlator: Correlator<u64>,
}

/// connecting streams for a newly accepted stream, not registered yet
struct Opening {
    connects: Vec<StreamHalf>,
    extensions: Vec<Bytes>,
    mode: ForwardMode,
    correlation: CorrelationKey,
}

pub struct ProxyEngine<B: Binding, W: MessageConsumer> {
    binding: B,
    bindings: FxHashMap<u64, BindingConfig>,
    ids: Box<dyn StreamIdSupplier + Send>,
    streams: FxHashMap<u64, StreamRef>,
    /// keyed by the accepted stream's initial id
    pairs: FxHashMap<u64, StreamPair>,
    extension: BytesMut,
    ctx: ProxyContext<W>,
}

impl<B: Binding, W: MessageConsumer> ProxyEngine<B, W> {
    pub fn new(config: Arc<EngineConfig>, binding: B, ids: Box<dyn StreamIdSupplier + Send>, consumer: W) -> anyhow::Result<ProxyEngine<B, W>> {
        config.validate()?;

        Ok(ProxyEngine {
            binding,
            bindings: FxHashMap::default(),
            ids,
            streams: FxHashMap::default(),
            pairs: FxHashMap::default(),
            extension: BytesMut::new(),
            ctx: ProxyContext {
                writer: FrameWriter::new(consumer, config.write_buffer_capacity),
                slots: SlotPool::new(config.slot_count, config.slot_capacity),
                correlator: Correlator::new(),
                config,
            },
        })
    }

    /// Makes a binding available for new streams
    pub fn attach(&mut self, binding: BindingConfig) -> anyhow::Result<()> {
        binding.validate()?;
        if self.bindings.contains_key(&binding.id) {
            bail!("binding {} is already attached", binding.id);
        }
        info!("attaching binding {} with {} route(s) in {:?} mode", binding.id, binding.routes.len(), binding.mode);
        self.bindings.insert(binding.id, binding);
        Ok(())
    }

    /// Stops accepting new streams on a binding. Streams that are already proxied are not
    ///  affected.
    pub fn detach(&mut self, binding_id: u64) -> Option<BindingConfig> {
        let result = self.bindings.remove(&binding_id);
        if result.is_some() {
            info!("detached binding {}", binding_id);
        }
        result
    }

    pub fn consumer(&self) -> &W {
        self.ctx.writer.consumer()
    }

    pub fn consumer_mut(&mut self) -> &mut W {
        self.ctx.writer.consumer_mut()
    }

    /// number of stream pairs that are not completely closed
    pub fn active_streams(&self) -> usize {
        self.pairs.len()
    }

    pub fn outstanding_slots(&self) -> usize {
        self.ctx.slots.acquired()
    }

    pub fn outstanding_correlations(&self) -> usize {
        self.ctx.correlator.len()
    }

    /// Cleans up the pair that `stream_id` belongs to. Timeouts are scheduled externally, and a
    ///  timeout for a stream that is gone in the meantime is ignored.
    pub fn on_timeout(&mut self, stream_id: u64, trace_id: u64) {
        let Some(stream) = self.streams.get(&stream_id).copied() else {
            trace!("ignoring timeout for unknown stream {}", stream_id);
            return;
        };
        debug!("stream {}: timed out", stream_id);
        self.cleanup(stream.pair_id, trace_id);
    }

    fn dispatch(&mut self, type_id: u32, buffer: &[u8]) {
        let Some(header) = FrameHeaderView::wrap(buffer, 0, buffer.len()) else {
            debug!("dropping message of {} bytes: too short for a frame", buffer.len());
            return;
        };
        let stream_id = header.stream_id();

        let capacity = self.ctx.writer.capacity();
        let frame = FrameView::wrap(buffer, 0, buffer.len())
            .filter(|f| u32::from(f.frame_type()) == type_id)
            .filter(|f| f.limit() <= capacity);

        match (self.streams.get(&stream_id).copied(), frame) {
            (Some(stream), Some(frame)) => self.on_stream_frame(stream, frame),
            (Some(stream), None) => {
                debug!("stream {}: malformed frame of type {:#x}", stream_id, type_id);
                self.cleanup(stream.pair_id, header.trace_id());
            }
            (None, Some(FrameView::Begin(begin))) => self.on_new_stream(&begin),
            (None, Some(frame)) => trace!("dropping {:?} for unknown stream {}", frame.frame_type(), stream_id),
            (None, None) => debug!("dropping malformed frame of type {:#x} for unknown stream {}", type_id, stream_id),
        }
    }

    fn on_new_stream(&mut self, begin: &BeginFrame<'_>) {
        let initial_id = begin.stream_id();
        if !self.ids.is_initial(initial_id) {
            trace!("dropping Begin for unknown reply stream {}", initial_id);
            return;
        }
        let reply_id = self.ids.supply_reply_id(initial_id);
        if self.streams.contains_key(&reply_id) {
            debug!("stream {}: rejected, reply stream id {} is not available", initial_id, reply_id);
            self.reject(begin);
            return;
        }

        let opening = match self.open_connects(begin) {
            Ok(opening) => opening,
            Err(e) => {
                debug!("stream {}: rejected: {}", initial_id, e);
                self.reject(begin);
                return;
            }
        };
        debug!("stream {}: accepted on binding {}, connecting to {:?}", initial_id, begin.routed_id(),
            opening.connects.iter().map(|c| c.routed_id).collect::<Vec<_>>());

        let accept = StreamHalf::new(begin.origin_id(), begin.routed_id(), initial_id, reply_id, begin.authorization(), begin.affinity());
        let pair = StreamPair::new(accept, opening.connects, opening.mode, opening.correlation);
        self.begin_pair(pair, begin, &opening.extensions);
    }

    /// A Begin on an accepted stream id that is known already: legitimate only if the previous
    ///  initial stream under that id is closed
    fn on_reopen(&mut self, pair_id: u64, begin: &BeginFrame<'_>) {
        let Some(mut pair) = self.pairs.remove(&pair_id) else {
            return;
        };
        let trace_id = begin.trace_id();

        if !pair.accept.state.is_closed(Direction::Initial) {
            debug!("stream {}: Begin on a stream that is open", pair_id);
            pair.cleanup(&mut self.ctx, trace_id);
            self.pairs.insert(pair_id, pair);
            self.remove_if_closed(pair_id);
            return;
        }

        debug!("stream {}: reopened", pair_id);
        pair.cleanup(&mut self.ctx, trace_id);
        self.unregister(&pair);
        self.release_correlation(&pair);

        match self.open_connects(begin) {
            Ok(opening) => {
                pair.reopen(opening.connects, opening.mode, opening.correlation);
                self.begin_pair(pair, begin, &opening.extensions);
            }
            Err(e) => {
                debug!("stream {}: rejected on reopen: {}", pair_id, e);
                self.reject(begin);
            }
        }
    }

    fn begin_pair(&mut self, mut pair: StreamPair, begin: &BeginFrame<'_>, extensions: &[Bytes]) {
        let pair_id = pair.id();
        self.register(&pair);
        if let Err(e) = pair.on_accept_begin(&mut self.ctx, begin, extensions) {
            debug!("stream {}: {} - cleaning up", pair_id, e);
            pair.cleanup(&mut self.ctx, begin.trace_id());
        }
        self.pairs.insert(pair_id, pair);
        self.remove_if_closed(pair_id);
    }

    /// Resolves the route for an accepted stream and prepares its connecting streams. Nothing is
    ///  registered or written unless this succeeds.
    fn open_connects(&mut self, begin: &BeginFrame<'_>) -> anyhow::Result<Opening> {
        let binding_id = begin.routed_id();
        let binding_config = self.bindings.get(&binding_id)
            .ok_or_else(|| anyhow!("no binding {}", binding_id))?;

        let begin_ex = B::BeginEx::decode(begin.extension())?;
        let binding = &self.binding;
        let route = binding_config.resolve(begin.authorization(), |r| binding.matches(r, begin_ex.as_ref()))
            .ok_or_else(|| anyhow!("no route on binding {}", binding_id))?;

        if binding_config.mode == ForwardMode::Message && self.ctx.slots.available() == 0 {
            bail!("no slot available for reassembly");
        }

        let correlation = binding.correlate(begin, begin_ex.as_ref());
        self.ctx.correlator.begin_request(correlation, begin.stream_id())?;

        let mut connects = Vec::with_capacity(route.exits.len());
        let mut extensions = Vec::with_capacity(route.exits.len());
        for &exit in &route.exits {
            let initial_id = self.ids.supply_initial_id(exit);
            let reply_id = self.ids.supply_reply_id(initial_id);
            connects.push(StreamHalf::new(binding_id, exit, initial_id, reply_id, begin.authorization(), begin.affinity()));

            self.extension.clear();
            if let Some(ex) = binding.connect_ex(route, exit, begin_ex.as_ref()) {
                ex.encode(&mut self.extension);
            }
            extensions.push(self.extension.split().freeze());
        }

        Ok(Opening {
            connects,
            extensions,
            mode: binding_config.mode,
            correlation,
        })
    }

    fn reject(&mut self, begin: &BeginFrame<'_>) {
        self.ctx.writer.write(&Frame::Reset {
            header: FrameHeader {
                origin_id: begin.origin_id(),
                routed_id: begin.routed_id(),
                stream_id: begin.stream_id(),
                sequence: begin.sequence(),
                acknowledge: begin.acknowledge(),
                maximum: 0,
                trace_id: begin.trace_id(),
                authorization: begin.authorization(),
            },
            extension: &[],
        });
    }

    fn on_stream_frame(&mut self, stream: StreamRef, frame: FrameView<'_>) {
        if let (Role::AcceptInitial, FrameView::Begin(begin)) = (stream.role, frame) {
            self.on_reopen(stream.pair_id, &begin);
            return;
        }

        let Some(pair) = self.pairs.get_mut(&stream.pair_id) else {
            return;
        };
        let ctx = &mut self.ctx;

        let result = match (stream.role, frame) {
            (Role::AcceptInitial, FrameView::Data(data)) => pair.on_accept_data(ctx, &self.binding, &data),
            (Role::AcceptInitial, FrameView::Flush(flush)) => pair.on_accept_flush(ctx, &flush),
            (Role::AcceptInitial, FrameView::End(end)) => pair.on_accept_end(ctx, &end),
            (Role::AcceptInitial, FrameView::Abort(abort)) => pair.on_accept_abort(ctx, &abort),
            (Role::AcceptReply, FrameView::Window(window)) => pair.on_accept_window(ctx, &window),
            (Role::AcceptReply, FrameView::Reset(reset)) => pair.on_accept_reset(ctx, &reset),
            (Role::ConnectInitial(idx), FrameView::Window(window)) => pair.on_connect_window(ctx, idx, &window),
            (Role::ConnectInitial(idx), FrameView::Reset(reset)) => pair.on_connect_reset(ctx, idx, &reset),
            (Role::ConnectReply(idx), FrameView::Begin(begin)) => pair.on_connect_begin(ctx, idx, &begin),
            (Role::ConnectReply(idx), FrameView::Data(data)) => pair.on_connect_data(ctx, idx, &data),
            (Role::ConnectReply(idx), FrameView::Flush(flush)) => pair.on_connect_flush(ctx, idx, &flush),
            (Role::ConnectReply(idx), FrameView::End(end)) => pair.on_connect_end(ctx, idx, &end),
            (Role::ConnectReply(idx), FrameView::Abort(abort)) => pair.on_connect_abort(ctx, idx, &abort),
            (role, frame) => Err(anyhow!("unexpected {:?} in role {:?}", frame.frame_type(), role)),
        };

        if let Err(e) = result {
            debug!("stream {}: {} - cleaning up", frame.stream_id(), e);
            pair.cleanup(ctx, frame.header().trace_id());
        }
        self.remove_if_closed(stream.pair_id);
    }

    fn cleanup(&mut self, pair_id: u64, trace_id: u64) {
        if let Some(pair) = self.pairs.get_mut(&pair_id) {
            pair.cleanup(&mut self.ctx, trace_id);
        }
        self.remove_if_closed(pair_id);
    }

    fn register(&mut self, pair: &StreamPair) {
        let pair_id = pair.id();
        self.streams.insert(pair.accept.initial_id, StreamRef { pair_id, role: Role::AcceptInitial });
        self.streams.insert(pair.accept.reply_id, StreamRef { pair_id, role: Role::AcceptReply });
        for (idx, connect) in pair.connects.iter().enumerate() {
            self.streams.insert(connect.initial_id, StreamRef { pair_id, role: Role::ConnectInitial(idx) });
            self.streams.insert(connect.reply_id, StreamRef { pair_id, role: Role::ConnectReply(idx) });
        }
    }

    fn unregister(&mut self, pair: &StreamPair) {
        self.streams.remove(&pair.accept.initial_id);
        self.streams.remove(&pair.accept.reply_id);
        for connect in &pair.connects {
            self.streams.remove(&connect.initial_id);
            self.streams.remove(&connect.reply_id);
        }
    }

    /// abandons the pair's request unless it completed, or the key belongs to a newer request
    fn release_correlation(&mut self, pair: &StreamPair) {
        if self.ctx.correlator.get(&pair.correlation) == Some(&pair.id()) {
            self.ctx.correlator.abandon(&pair.correlation);
        }
    }

    fn remove_if_closed(&mut self, pair_id: u64) {
        if !self.pairs.get(&pair_id).is_some_and(|p| p.is_closed()) {
            return;
        }
        if let Some(mut pair) = self.pairs.remove(&pair_id) {
            // nothing is written for a closed pair, this only returns its slot
            pair.cleanup(&mut self.ctx, 0);
            self.unregister(&pair);
            self.release_correlation(&pair);
            debug!("stream {}: closed", pair_id);
        }
    }
}

impl<B: Binding, W: MessageConsumer> MessageConsumer for ProxyEngine<B, W> {
    fn on_message(&mut self, type_id: u32, buffer: &[u8]) {
        self.dispatch(type_id, buffer);
    }
}
