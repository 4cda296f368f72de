use anyhow::bail;
use bytes::Bytes;
use tracing::{debug, trace};
use crate::binding::Binding;
use crate::buffers::reassembly::Reassembler;
use crate::config::ForwardMode;
use crate::correlation::CorrelationKey;
use crate::frame::{AbortFrame, BeginFrame, DataFlags, DataFrame, EndFrame, FlushFrame, ResetFrame, WindowFrame};
use crate::message_consumer::MessageConsumer;
use crate::proxy::half::StreamHalf;
use crate::proxy::ProxyContext;
use crate::safe_converter::PrecheckedCast;
use crate::stream_state::Direction::{Initial, Reply};

/// An accepted stream and the stream(s) it is proxied to.
///
/// The first connecting stream is the primary: its reply is forwarded to the client. Any further
///  connecting streams get a copy of the initial direction, and their replies are consumed here.
///
/// Handlers return an error for protocol violations by either peer. The caller then runs
///  [`StreamPair::cleanup`], which is idempotent.
pub(crate) struct StreamPair {
    pub(crate) accept: StreamHalf,
    pub(crate) connects: Vec<StreamHalf>,
    mode: ForwardMode,
    pub(crate) correlation: CorrelationKey,
    /// sequence the client's initial stream began at; connecting streams begin at zero
    initial_base: u64,
    /// sequence the primary target's reply began at; the accepted reply begins at zero
    reply_base: u64,
    reassembler: Reassembler,
    /// extension of a client End that arrived while reassembled messages were still queued
    end_deferred: Option<Bytes>,
    capabilities: u8,
}

impl StreamPair {
    pub fn new(accept: StreamHalf, connects: Vec<StreamHalf>, mode: ForwardMode, correlation: CorrelationKey) -> StreamPair {
        assert!(!connects.is_empty(), "this is a bug: stream pair without connecting stream");
        StreamPair {
            accept,
            connects,
            mode,
            correlation,
            initial_base: 0,
            reply_base: 0,
            reassembler: Reassembler::new(),
            end_deferred: None,
            capabilities: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.accept.initial_id
    }

    pub fn is_closed(&self) -> bool {
        self.accept.is_closed() && self.connects.iter().all(|c| c.is_closed())
    }

    /// Prepares a pair whose accepted stream was closed for a new Begin under the same ids,
    ///  replacing the connecting streams
    pub fn reopen(&mut self, connects: Vec<StreamHalf>, mode: ForwardMode, correlation: CorrelationKey) {
        assert!(!connects.is_empty(), "this is a bug: stream pair without connecting stream");
        debug_assert!(!self.reassembler.holds_slot());

        self.accept.reopen();
        self.connects = connects;
        self.mode = mode;
        self.correlation = correlation;
        self.initial_base = 0;
        self.reply_base = 0;
        self.end_deferred = None;
        self.capabilities = 0;
    }

    pub fn on_accept_begin<W: MessageConsumer>(&mut self, ctx: &mut ProxyContext<W>, begin: &BeginFrame<'_>, connect_exs: &[Bytes]) -> anyhow::Result<()> {
        self.accept.state.set_opening(Initial);
        self.accept.initial.receive_open(begin.sequence(), begin.acknowledge())?;
        self.initial_base = begin.sequence();

        for (connect, ex) in self.connects.iter_mut().zip(connect_exs) {
            connect.do_begin(&mut ctx.writer, Initial, begin.trace_id(), ex);
        }
        Ok(())
    }

    pub fn on_accept_data<W: MessageConsumer, B: Binding>(&mut self, ctx: &mut ProxyContext<W>, binding: &B, data: &DataFrame<'_>) -> anyhow::Result<()> {
        if self.accept.state.is_closed(Initial) {
            trace!("stream {}: dropping Data after close", self.id());
            return Ok(());
        }
        self.accept.initial.check_reserved(data.reserved(), data.payload().len())?;
        self.accept.initial.receive(data.sequence(), data.acknowledge(), data.reserved())?;

        let trace_id = data.trace_id();
        match self.mode {
            ForwardMode::Stream => {
                for connect in &mut self.connects {
                    connect.do_data(&mut ctx.writer, Initial, trace_id, data.flags(), data.reserved(), data.payload(), data.extension());
                }
            }
            ForwardMode::Message => {
                let declared_length = binding.declared_length(data);
                let complete = self.reassembler.append(&mut ctx.slots, self.accept.initial_id, data.payload(), data.reserved(), data.flags(), declared_length)?;
                if complete {
                    self.flush_messages(ctx, trace_id)?;
                }
            }
        }
        Ok(())
    }

    pub fn on_accept_flush<W: MessageConsumer>(&mut self, ctx: &mut ProxyContext<W>, flush: &FlushFrame<'_>) -> anyhow::Result<()> {
        if self.accept.state.is_closed(Initial) {
            trace!("stream {}: dropping Flush after close", self.id());
            return Ok(());
        }
        self.accept.initial.receive(flush.sequence(), flush.acknowledge(), flush.reserved())?;

        let trace_id = flush.trace_id();
        match self.mode {
            ForwardMode::Stream => {
                for connect in &mut self.connects {
                    connect.do_flush(&mut ctx.writer, Initial, trace_id, flush.reserved(), flush.extension());
                }
            }
            ForwardMode::Message => {
                // nothing is forwarded, so the reserved credit is returned right away
                if !self.accept.state.is_opened(Initial) {
                    return Ok(());
                }
                let ack = self.message_ack(flush.reserved().into());
                let window = &self.accept.initial;
                let (max, budget_id, padding) = (window.max(), window.budget_id(), window.padding());
                self.grant_accept_window(ctx, trace_id, ack, max, budget_id, padding);
            }
        }
        Ok(())
    }

    pub fn on_accept_end<W: MessageConsumer>(&mut self, ctx: &mut ProxyContext<W>, end: &EndFrame<'_>) -> anyhow::Result<()> {
        if self.accept.state.is_closed(Initial) {
            trace!("stream {}: dropping End after close", self.id());
            return Ok(());
        }
        self.accept.initial.receive_close(end.sequence(), end.acknowledge())?;
        if self.reassembler.in_progress() {
            bail!("stream ended in the middle of a message");
        }
        self.accept.state.set_closed(Initial);

        if self.reassembler.has_complete() {
            trace!("stream {}: deferring End until {} queued messages are forwarded", self.id(), self.reassembler.num_complete());
            self.end_deferred = Some(Bytes::copy_from_slice(end.extension()));
            return Ok(());
        }
        for connect in &mut self.connects {
            connect.do_end(&mut ctx.writer, Initial, end.trace_id(), end.extension());
        }
        Ok(())
    }

    pub fn on_accept_abort<W: MessageConsumer>(&mut self, ctx: &mut ProxyContext<W>, abort: &AbortFrame<'_>) -> anyhow::Result<()> {
        if self.accept.state.is_closed(Initial) {
            trace!("stream {}: dropping Abort after close", self.id());
            return Ok(());
        }
        self.accept.state.set_closed(Initial);
        self.reassembler.release(&mut ctx.slots);
        self.end_deferred = None;

        for connect in &mut self.connects {
            connect.do_abort(&mut ctx.writer, Initial, abort.trace_id());
        }
        Ok(())
    }

    pub fn on_accept_window<W: MessageConsumer>(&mut self, ctx: &mut ProxyContext<W>, window: &WindowFrame<'_>) -> anyhow::Result<()> {
        if self.accept.state.is_closed(Reply) {
            trace!("stream {}: dropping Window after close", self.id());
            return Ok(());
        }
        if !self.accept.state.is_opening(Reply) {
            bail!("Window for a reply that was not begun");
        }
        self.accept.reply.validate_window(window.acknowledge(), window.maximum())?;
        self.accept.reply.observe_window(window.acknowledge(), window.maximum(), window.budget_id(), window.padding());
        self.accept.state.set_opened(Reply);

        let reply = self.accept.reply.snapshot();
        let ack = self.reply_base + reply.ack;
        let padding = reply.padding + ctx.config.proxy_padding;

        let primary = &mut self.connects[0];
        if primary.state.is_closed(Reply) {
            return Ok(());
        }
        let changed = primary.reply.grant(ack, reply.max, reply.budget_id, padding);
        if changed || !primary.state.is_opened(Reply) {
            primary.state.set_opened(Reply);
            primary.do_window(&mut ctx.writer, Reply, window.trace_id(), window.capabilities());
        }
        Ok(())
    }

    pub fn on_accept_reset<W: MessageConsumer>(&mut self, ctx: &mut ProxyContext<W>, reset: &ResetFrame<'_>) -> anyhow::Result<()> {
        if self.accept.state.is_closed(Reply) {
            return Ok(());
        }
        debug!("stream {}: client reset the reply", self.id());
        self.accept.state.set_closed(Reply);
        self.cleanup(ctx, reset.trace_id());
        Ok(())
    }

    pub fn on_connect_begin<W: MessageConsumer>(&mut self, ctx: &mut ProxyContext<W>, idx: usize, begin: &BeginFrame<'_>) -> anyhow::Result<()> {
        let connect = &mut self.connects[idx];
        if connect.state.is_opening(Reply) {
            bail!("duplicate Begin for reply stream {}", connect.reply_id);
        }
        connect.state.set_opening(Reply);
        connect.reply.receive_open(begin.sequence(), begin.acknowledge())?;

        if idx == 0 {
            self.reply_base = begin.sequence();
            self.accept.do_begin(&mut ctx.writer, Reply, begin.trace_id(), begin.extension());
        }
        else {
            // replies of secondary targets are consumed here
            connect.reply.grant(begin.sequence(), ctx.config.fan_out_reply_window, 0, 0);
            connect.state.set_opened(Reply);
            connect.do_window(&mut ctx.writer, Reply, begin.trace_id(), 0);
        }
        Ok(())
    }

    pub fn on_connect_data<W: MessageConsumer>(&mut self, ctx: &mut ProxyContext<W>, idx: usize, data: &DataFrame<'_>) -> anyhow::Result<()> {
        let connect = &mut self.connects[idx];
        if connect.state.is_closed(Reply) {
            trace!("stream {}: dropping Data after close", connect.reply_id);
            return Ok(());
        }
        connect.reply.check_reserved(data.reserved(), data.payload().len())?;
        connect.reply.receive(data.sequence(), data.acknowledge(), data.reserved())?;

        if idx == 0 {
            self.accept.do_data(&mut ctx.writer, Reply, data.trace_id(), data.flags(), data.reserved(), data.payload(), data.extension());
        }
        else if connect.reply.acknowledge_all() {
            connect.do_window(&mut ctx.writer, Reply, data.trace_id(), 0);
        }
        Ok(())
    }

    pub fn on_connect_flush<W: MessageConsumer>(&mut self, ctx: &mut ProxyContext<W>, idx: usize, flush: &FlushFrame<'_>) -> anyhow::Result<()> {
        let connect = &mut self.connects[idx];
        if connect.state.is_closed(Reply) {
            trace!("stream {}: dropping Flush after close", connect.reply_id);
            return Ok(());
        }
        connect.reply.receive(flush.sequence(), flush.acknowledge(), flush.reserved())?;

        if idx == 0 {
            self.accept.do_flush(&mut ctx.writer, Reply, flush.trace_id(), flush.reserved(), flush.extension());
        }
        else if connect.reply.acknowledge_all() {
            connect.do_window(&mut ctx.writer, Reply, flush.trace_id(), 0);
        }
        Ok(())
    }

    pub fn on_connect_end<W: MessageConsumer>(&mut self, ctx: &mut ProxyContext<W>, idx: usize, end: &EndFrame<'_>) -> anyhow::Result<()> {
        let connect = &mut self.connects[idx];
        if connect.state.is_closed(Reply) {
            trace!("stream {}: dropping End after close", connect.reply_id);
            return Ok(());
        }
        connect.reply.receive_close(end.sequence(), end.acknowledge())?;
        connect.state.set_closed(Reply);

        if idx == 0 {
            self.accept.do_end(&mut ctx.writer, Reply, end.trace_id(), end.extension());

            if ctx.correlator.get(&self.correlation) == Some(&self.accept.initial_id) {
                if let Some(completion) = ctx.correlator.complete(&self.correlation, Bytes::copy_from_slice(end.extension())) {
                    debug!("stream {}: {:?} completed with {} response bytes", completion.request, completion.handle, completion.response.len());
                }
            }
        }
        Ok(())
    }

    pub fn on_connect_abort<W: MessageConsumer>(&mut self, ctx: &mut ProxyContext<W>, idx: usize, abort: &AbortFrame<'_>) -> anyhow::Result<()> {
        let connect = &mut self.connects[idx];
        if connect.state.is_closed(Reply) {
            trace!("stream {}: dropping Abort after close", connect.reply_id);
            return Ok(());
        }
        connect.state.set_closed(Reply);

        if idx == 0 {
            self.accept.do_abort(&mut ctx.writer, Reply, abort.trace_id());
        }
        Ok(())
    }

    pub fn on_connect_window<W: MessageConsumer>(&mut self, ctx: &mut ProxyContext<W>, idx: usize, window: &WindowFrame<'_>) -> anyhow::Result<()> {
        let connect = &mut self.connects[idx];
        if connect.state.is_closed(Initial) {
            trace!("stream {}: dropping Window after close", connect.initial_id);
            return Ok(());
        }
        connect.initial.validate_window(window.acknowledge(), window.maximum())?;
        connect.initial.observe_window(window.acknowledge(), window.maximum(), window.budget_id(), window.padding());
        connect.state.set_opened(Initial);
        self.capabilities = window.capabilities();

        self.update_accept_window(ctx, window.trace_id())
    }

    pub fn on_connect_reset<W: MessageConsumer>(&mut self, ctx: &mut ProxyContext<W>, idx: usize, reset: &ResetFrame<'_>) -> anyhow::Result<()> {
        let connect = &mut self.connects[idx];
        if connect.state.is_closed(Initial) {
            return Ok(());
        }
        debug!("stream {}: target reset stream {}", self.accept.initial_id, connect.initial_id);
        connect.state.set_closed(Initial);
        self.cleanup(ctx, reset.trace_id());
        Ok(())
    }

    /// Resets / aborts every direction that is still open, each at most once, and releases the
    ///  pair's slot
    pub fn cleanup<W: MessageConsumer>(&mut self, ctx: &mut ProxyContext<W>, trace_id: u64) {
        self.accept.do_reset(&mut ctx.writer, Initial, trace_id);
        self.accept.do_abort(&mut ctx.writer, Reply, trace_id);
        for connect in &mut self.connects {
            connect.do_abort(&mut ctx.writer, Initial, trace_id);
            connect.do_reset(&mut ctx.writer, Reply, trace_id);
        }
        self.reassembler.release(&mut ctx.slots);
        self.end_deferred = None;
    }

    fn all_connects_opened(&self) -> bool {
        self.connects.iter().all(|c| c.state.is_opened(Initial))
    }

    /// Derives the client's initial window from the connecting streams' windows once all of
    ///  them are known
    fn update_accept_window<W: MessageConsumer>(&mut self, ctx: &mut ProxyContext<W>, trace_id: u64) -> anyhow::Result<()> {
        if !self.all_connects_opened() {
            return Ok(());
        }

        match self.mode {
            ForwardMode::Stream => {
                // every connecting stream saw the same initial data
                let ack = self.connects.iter().map(|c| c.initial.ack()).min().unwrap_or(0);
                let max = self.connects.iter().map(|c| c.initial.max()).min().unwrap_or(0);
                let padding = self.connects.iter().map(|c| c.initial.padding()).max().unwrap_or(0);
                let budget_id = self.connects[0].initial.budget_id();

                self.grant_accept_window(ctx, trace_id, self.initial_base + ack, max, budget_id, padding + ctx.config.proxy_padding);
                Ok(())
            }
            ForwardMode::Message => self.flush_messages(ctx, trace_id),
        }
    }

    fn grant_accept_window<W: MessageConsumer>(&mut self, ctx: &mut ProxyContext<W>, trace_id: u64, ack: u64, max: u32, budget_id: u64, padding: u32) {
        if self.accept.state.is_closed(Initial) {
            return;
        }
        let changed = self.accept.initial.grant(ack, max, budget_id, padding);
        if changed || !self.accept.state.is_opened(Initial) {
            self.accept.state.set_opened(Initial);
            self.accept.do_window(&mut ctx.writer, Initial, trace_id, self.capabilities);
        }
    }

    /// acknowledge position for the client in message mode after `acked` more bytes were consumed
    fn message_ack(&self, acked: u64) -> u64 {
        self.accept.initial.ack().max(self.initial_base) + acked
    }

    /// Forwards queued messages for as long as every connecting stream has credit for the next
    ///  one, returning the credit of forwarded messages to the client.
    ///
    /// The client's window is no larger than what the smallest connecting window can take in a
    ///  single message, and never larger than a slot. A message that no connecting window can
    ///  ever take (because a target raised its padding later) is a failure of the stream.
    fn flush_messages<W: MessageConsumer>(&mut self, ctx: &mut ProxyContext<W>, trace_id: u64) -> anyhow::Result<()> {
        if !self.all_connects_opened() {
            return Ok(());
        }

        let mut acked = 0;
        while let Some(message) = self.reassembler.front(&ctx.slots) {
            let len: u32 = message.len().prechecked_cast();
            if let Some(connect) = self.connects.iter().find(|c| u64::from(len) + u64::from(c.initial.padding()) > u64::from(c.initial.max())) {
                bail!("message of {} bytes can never fit the window of stream {}", len, connect.initial_id);
            }
            if !self.connects.iter().all(|c| !c.state.is_closed(Initial) && c.initial.payload_credit() >= len as i64) {
                trace!("stream {}: waiting for credit to forward a message of {} bytes", self.id(), len);
                break;
            }
            for connect in &mut self.connects {
                let reserved = len + connect.initial.padding();
                connect.do_data(&mut ctx.writer, Initial, trace_id, DataFlags::COMPLETE, reserved, message, &[]);
            }
            acked += self.reassembler.pop_front(&mut ctx.slots).unwrap_or(0);
        }

        let ack = self.message_ack(acked);
        let slot_capacity: u32 = ctx.slots.slot_capacity().prechecked_cast();
        let max = self.connects.iter()
            .map(|c| c.initial.max().saturating_sub(c.initial.padding()))
            .min()
            .unwrap_or(0)
            .min(slot_capacity);
        self.grant_accept_window(ctx, trace_id, ack, max, 0, 0);

        if !self.reassembler.has_complete() {
            if let Some(extension) = self.end_deferred.take() {
                for connect in &mut self.connects {
                    connect.do_end(&mut ctx.writer, Initial, trace_id, &extension);
                }
            }
        }
        Ok(())
    }
}
