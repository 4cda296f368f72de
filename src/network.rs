//! The byte stream end of a bridge: a [`NetworkServer`] terminates connections from the network
//!  and turns each of them into a stream towards an engine.
//!
//! Bytes read from a connection become Data frames on the stream's initial direction, limited by
//!  the window the engine granted and optionally by a shared budget. Reply Data is written to the
//!  connection, and its credit is only returned once the bytes were accepted by the channel. If
//!  the channel accepts a partial write, the remainder is parked in a pool slot until the channel
//!  becomes writable again.
//!
//! Readiness is tracked outside: the server announces the events it is interested in through
//!  [`NetworkChannel::set_interest`] and expects [`NetworkServer::on_readable`] and
//!  [`NetworkServer::on_writable`] calls for them.

use std::io;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use anyhow::{anyhow, bail};
use bitflags::bitflags;
use bytes::BufMut;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace};
use crate::budget::{BudgetDebitor, NO_BUDGET};
use crate::buffers::slot_pool::{SlotId, SlotPool};
use crate::config::EngineConfig;
use crate::frame::{BeginFrame, DataFlags, DataFrame, EndFrame, FlushFrame, FrameHeaderView, FrameView, WindowFrame};
use crate::frame_writer::FrameWriter;
use crate::id_supplier::StreamIdSupplier;
use crate::message_consumer::MessageConsumer;
use crate::proxy::half::StreamHalf;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::stream_state::Direction::{Initial, Reply};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Interest: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
    }
}

/// A non-blocking byte stream
#[cfg_attr(test, mockall::automock)]
pub trait NetworkChannel {
    /// `Ok(0)` is the end of input. [`ErrorKind::WouldBlock`] means that nothing can be read
    ///  right now.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// returns the number of bytes accepted, or [`ErrorKind::WouldBlock`] if there were none
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn shutdown_input(&mut self) -> io::Result<()>;
    fn shutdown_output(&mut self) -> io::Result<()>;

    /// the readiness events the channel's owner should report from now on
    fn set_interest(&mut self, interest: Interest);
}

/// [`NetworkChannel`] for a TCP connection. The socket is switched to non-blocking mode, and the
///  interest is kept for an external poller to pick up.
pub struct SocketChannel {
    stream: TcpStream,
    interest: Interest,
}
impl SocketChannel {
    pub fn new(stream: TcpStream) -> anyhow::Result<SocketChannel> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(SocketChannel {
            stream,
            interest: Interest::empty(),
        })
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}
impl NetworkChannel for SocketChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn shutdown_input(&mut self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Read)
    }

    fn shutdown_output(&mut self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Write)
    }

    fn set_interest(&mut self, interest: Interest) {
        self.interest = interest;
    }
}

struct NetworkContext<W> {
    writer: FrameWriter<W>,
    slots: SlotPool,
    budgets: BudgetDebitor,
    read_buffer: Vec<u8>,
}

impl<W> NetworkContext<W> {
    /// returns budget that was claimed but not used
    fn refund(&mut self, budget_id: u64, amount: u32) {
        if budget_id != NO_BUDGET && amount > 0 {
            self.budgets.credit(budget_id, amount.safe_cast());
        }
    }
}

struct Connection<C> {
    channel: C,
    half: StreamHalf,
    interest: Interest,
    /// reply bytes that the channel did not accept yet
    pending: Option<SlotId>,
    /// reserved bytes of reply frames, acknowledged when `pending` is written
    pending_reserved: u64,
    shutdown_deferred: bool,
    input_shut: bool,
    output_shut: bool,
}

impl<C: NetworkChannel> Connection<C> {
    fn new(channel: C, half: StreamHalf) -> Connection<C> {
        Connection {
            channel,
            half,
            interest: Interest::empty(),
            pending: None,
            pending_reserved: 0,
            shutdown_deferred: false,
            input_shut: false,
            output_shut: false,
        }
    }

    fn id(&self) -> u64 {
        self.half.initial_id
    }

    fn is_closed(&self) -> bool {
        self.half.is_closed() && self.pending.is_none()
    }

    fn set_interest(&mut self, interest: Interest) {
        if interest != self.interest {
            trace!("connection {}: interest {:?}", self.id(), interest);
            self.interest = interest;
            self.channel.set_interest(interest);
        }
    }

    fn add_interest(&mut self, interest: Interest) {
        self.set_interest(self.interest | interest);
    }

    fn remove_interest(&mut self, interest: Interest) {
        self.set_interest(self.interest - interest);
    }

    fn shutdown_input(&mut self) {
        if !self.input_shut {
            self.input_shut = true;
            if let Err(e) = self.channel.shutdown_input() {
                trace!("connection {}: shutting down input failed: {}", self.id(), e);
            }
        }
    }

    fn shutdown_output(&mut self) {
        if !self.output_shut {
            self.output_shut = true;
            if let Err(e) = self.channel.shutdown_output() {
                trace!("connection {}: shutting down output failed: {}", self.id(), e);
            }
        }
    }

    fn on_readable<W: MessageConsumer>(&mut self, ctx: &mut NetworkContext<W>, trace_id: u64) -> anyhow::Result<()> {
        let state = self.half.state;
        if !state.is_opened(Initial) || state.is_closed(Initial) {
            self.remove_interest(Interest::READ);
            return Ok(());
        }

        let window = self.half.initial;
        let padding = window.padding();
        let credit: u32 = window.payload_credit().prechecked_cast();
        let limit = credit.min(u32::try_from(ctx.read_buffer.len()).unwrap_or(u32::MAX));
        if limit == 0 {
            trace!("connection {}: waiting for credit", self.id());
            self.remove_interest(Interest::READ);
            return Ok(());
        }

        let budget_id = window.budget_id();
        let claimed = ctx.budgets.claim(budget_id, self.id(), padding + 1, limit + padding);
        if claimed == 0 {
            trace!("connection {}: waiting for budget {}", self.id(), budget_id);
            self.remove_interest(Interest::READ);
            return Ok(());
        }

        let max_len: usize = (claimed - padding).safe_cast();
        match self.channel.read(&mut ctx.read_buffer[..max_len]) {
            Ok(0) => {
                ctx.refund(budget_id, claimed);
                debug!("connection {}: end of input", self.id());
                self.remove_interest(Interest::READ);
                self.shutdown_input();
                self.half.do_end(&mut ctx.writer, Initial, trace_id, &[]);
            }
            Ok(n) => {
                let len: u32 = n.prechecked_cast();
                let reserved = len + padding;
                ctx.refund(budget_id, claimed - reserved);
                trace!("connection {}: read {} bytes", self.id(), n);
                self.half.do_data(&mut ctx.writer, Initial, trace_id, DataFlags::COMPLETE, reserved, &ctx.read_buffer[..n], &[]);
                self.add_interest(Interest::READ);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                ctx.refund(budget_id, claimed);
                self.add_interest(Interest::READ);
            }
            Err(e) => {
                ctx.refund(budget_id, claimed);
                bail!("read failed: {}", e);
            }
        }
        Ok(())
    }

    fn on_writable<W: MessageConsumer>(&mut self, ctx: &mut NetworkContext<W>, trace_id: u64) -> anyhow::Result<()> {
        let Some(slot) = self.pending else {
            self.remove_interest(Interest::WRITE);
            return Ok(());
        };

        let buffer = ctx.slots.buffer_mut(slot);
        match self.channel.write(buffer.as_ref()) {
            Ok(n) => {
                trace!("connection {}: wrote {} of {} pending bytes", self.id(), n, buffer.len());
                buffer.consume(n);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(e) => bail!("write failed: {}", e),
        }
        if !buffer.is_empty() {
            return Ok(());
        }

        ctx.slots.release(slot);
        self.pending = None;
        self.remove_interest(Interest::WRITE);

        let reserved = std::mem::take(&mut self.pending_reserved);
        self.acknowledge(ctx, trace_id, reserved);
        if self.shutdown_deferred {
            self.shutdown_output();
        }
        Ok(())
    }

    /// `true` if all of `payload` was accepted by the channel
    fn write_reply<W: MessageConsumer>(&mut self, ctx: &mut NetworkContext<W>, payload: &[u8]) -> anyhow::Result<bool> {
        let (slot, remainder) = match self.pending {
            Some(slot) => (slot, payload),
            None => {
                let written = match self.channel.write(payload) {
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => 0,
                    Err(e) => bail!("write failed: {}", e),
                };
                if written == payload.len() {
                    return Ok(true);
                }
                let slot = ctx.slots.acquire(self.id())
                    .ok_or_else(|| anyhow!("no slot available for {} pending bytes", payload.len() - written))?;
                self.pending = Some(slot);
                self.add_interest(Interest::WRITE);
                (slot, &payload[written..])
            }
        };

        let buffer = ctx.slots.buffer_mut(slot);
        if buffer.remaining_capacity() < remainder.len() {
            bail!("{} pending bytes exceed the remaining capacity of {}", remainder.len(), buffer.remaining_capacity());
        }
        buffer.put_slice(remainder);
        trace!("connection {}: {} bytes pending", self.id(), buffer.len());
        Ok(false)
    }

    fn acknowledge<W: MessageConsumer>(&mut self, ctx: &mut NetworkContext<W>, trace_id: u64, reserved: u64) {
        if reserved == 0 || self.half.state.is_closed(Reply) {
            return;
        }
        let reply = self.half.reply;
        if self.half.reply.grant(reply.ack() + reserved, reply.max(), reply.budget_id(), reply.padding()) {
            self.half.do_window(&mut ctx.writer, Reply, trace_id, 0);
        }
    }

    fn release_pending<W>(&mut self, ctx: &mut NetworkContext<W>) {
        if let Some(slot) = self.pending.take() {
            ctx.slots.release(slot);
        }
        self.pending_reserved = 0;
        self.shutdown_deferred = false;
        self.remove_interest(Interest::WRITE);
    }

    fn on_initial_window(&mut self, window: &WindowFrame<'_>) -> anyhow::Result<()> {
        if self.half.state.is_closed(Initial) {
            trace!("connection {}: dropping Window after close", self.id());
            return Ok(());
        }
        self.half.initial.validate_window(window.acknowledge(), window.maximum())?;
        self.half.initial.observe_window(window.acknowledge(), window.maximum(), window.budget_id(), window.padding());
        self.half.state.set_opened(Initial);
        self.add_interest(Interest::READ);
        Ok(())
    }

    fn on_initial_reset<W: MessageConsumer>(&mut self, ctx: &mut NetworkContext<W>, trace_id: u64) {
        if self.half.state.is_closed(Initial) {
            return;
        }
        debug!("connection {}: reset by peer", self.id());
        self.half.state.set_closed(Initial);
        self.cleanup(ctx, trace_id);
    }

    fn on_reply_begin<W: MessageConsumer>(&mut self, ctx: &mut NetworkContext<W>, begin: &BeginFrame<'_>) -> anyhow::Result<()> {
        if self.half.state.is_opening(Reply) {
            bail!("duplicate Begin for reply stream {}", self.half.reply_id);
        }
        self.half.state.set_opening(Reply);
        self.half.reply.receive_open(begin.sequence(), begin.acknowledge())?;

        // pending writes never exceed a single slot
        let max: u32 = ctx.slots.slot_capacity().prechecked_cast();
        self.half.reply.grant(begin.sequence(), max, NO_BUDGET, 0);
        self.half.state.set_opened(Reply);
        self.half.do_window(&mut ctx.writer, Reply, begin.trace_id(), 0);
        Ok(())
    }

    fn on_reply_data<W: MessageConsumer>(&mut self, ctx: &mut NetworkContext<W>, data: &DataFrame<'_>) -> anyhow::Result<()> {
        if self.half.state.is_closed(Reply) {
            trace!("connection {}: dropping Data after close", self.id());
            return Ok(());
        }
        if !self.half.state.is_opened(Reply) {
            bail!("Data before Begin");
        }
        self.half.reply.check_reserved(data.reserved(), data.payload().len())?;
        self.half.reply.receive(data.sequence(), data.acknowledge(), data.reserved())?;

        let reserved: u64 = data.reserved().safe_cast();
        if self.write_reply(ctx, data.payload())? {
            self.acknowledge(ctx, data.trace_id(), reserved);
        }
        else {
            self.pending_reserved += reserved;
        }
        Ok(())
    }

    fn on_reply_flush<W: MessageConsumer>(&mut self, ctx: &mut NetworkContext<W>, flush: &FlushFrame<'_>) -> anyhow::Result<()> {
        if self.half.state.is_closed(Reply) {
            trace!("connection {}: dropping Flush after close", self.id());
            return Ok(());
        }
        if !self.half.state.is_opened(Reply) {
            bail!("Flush before Begin");
        }
        self.half.reply.receive(flush.sequence(), flush.acknowledge(), flush.reserved())?;

        let reserved: u64 = flush.reserved().safe_cast();
        if self.pending.is_some() {
            self.pending_reserved += reserved;
        }
        else {
            self.acknowledge(ctx, flush.trace_id(), reserved);
        }
        Ok(())
    }

    fn on_reply_end(&mut self, end: &EndFrame<'_>) -> anyhow::Result<()> {
        if self.half.state.is_closed(Reply) {
            trace!("connection {}: dropping End after close", self.id());
            return Ok(());
        }
        self.half.reply.receive_close(end.sequence(), end.acknowledge())?;
        self.half.state.set_closed(Reply);

        if self.pending.is_some() {
            self.shutdown_deferred = true;
        }
        else {
            self.shutdown_output();
        }
        Ok(())
    }

    fn on_reply_abort<W>(&mut self, ctx: &mut NetworkContext<W>) {
        if self.half.state.is_closed(Reply) {
            trace!("connection {}: dropping Abort after close", self.id());
            return;
        }
        debug!("connection {}: reply aborted", self.id());
        self.half.state.set_closed(Reply);
        self.release_pending(ctx);
        self.shutdown_output();
    }

    /// aborts / resets both directions if they are still open, and shuts the channel down
    fn cleanup<W: MessageConsumer>(&mut self, ctx: &mut NetworkContext<W>, trace_id: u64) {
        self.half.do_abort(&mut ctx.writer, Initial, trace_id);
        self.half.do_reset(&mut ctx.writer, Reply, trace_id);
        self.release_pending(ctx);
        ctx.budgets.release(self.half.initial.budget_id(), self.id());
        self.set_interest(Interest::empty());
        self.shutdown_input();
        self.shutdown_output();
    }
}

/// Accepts connections for one binding, opening a stream towards `routed_id` for each of them.
///  Frames for those streams come back through [`MessageConsumer::on_message`].
pub struct NetworkServer<C: NetworkChannel, W: MessageConsumer> {
    binding_id: u64,
    routed_id: u64,
    ids: Box<dyn StreamIdSupplier + Send>,
    /// keyed by the initial stream id
    connections: FxHashMap<u64, Connection<C>>,
    /// initial and reply stream ids, referring to their connection
    streams: FxHashMap<u64, u64>,
    ctx: NetworkContext<W>,
}

impl<C: NetworkChannel, W: MessageConsumer> NetworkServer<C, W> {
    pub fn new(config: Arc<EngineConfig>, binding_id: u64, routed_id: u64, ids: Box<dyn StreamIdSupplier + Send>, consumer: W) -> anyhow::Result<NetworkServer<C, W>> {
        config.validate()?;
        info!("network server for binding {} routing to {}", binding_id, routed_id);

        Ok(NetworkServer {
            binding_id,
            routed_id,
            ids,
            connections: FxHashMap::default(),
            streams: FxHashMap::default(),
            ctx: NetworkContext {
                writer: FrameWriter::new(consumer, config.write_buffer_capacity),
                slots: SlotPool::new(config.slot_count, config.slot_capacity),
                budgets: BudgetDebitor::new(),
                read_buffer: vec![0; config.network_read_capacity],
            },
        })
    }

    /// Opens a stream for a new connection, returning the id that identifies the connection from
    ///  now on. Reading starts when the stream's first Window arrives.
    pub fn accept(&mut self, channel: C, authorization: u64) -> u64 {
        let initial_id = self.ids.supply_initial_id(self.routed_id);
        let reply_id = self.ids.supply_reply_id(initial_id);
        let trace_id = self.ids.supply_trace_id();

        let half = StreamHalf::new(self.binding_id, self.routed_id, initial_id, reply_id, authorization, 0);
        let mut connection = Connection::new(channel, half);
        connection.half.do_begin(&mut self.ctx.writer, Initial, trace_id, &[]);
        debug!("connection {}: accepted", initial_id);

        self.streams.insert(initial_id, initial_id);
        self.streams.insert(reply_id, initial_id);
        self.connections.insert(initial_id, connection);
        initial_id
    }

    pub fn on_readable(&mut self, connection_id: u64) {
        let trace_id = self.ids.supply_trace_id();
        self.with_connection(connection_id, trace_id, |c, ctx| c.on_readable(ctx, trace_id));
    }

    pub fn on_writable(&mut self, connection_id: u64) {
        let trace_id = self.ids.supply_trace_id();
        self.with_connection(connection_id, trace_id, |c, ctx| c.on_writable(ctx, trace_id));
    }

    /// An I/O failure reported by the channel's owner, handled like a Reset from the peer
    pub fn on_error(&mut self, connection_id: u64, error: io::Error) {
        let trace_id = self.ids.supply_trace_id();
        self.with_connection(connection_id, trace_id, |_, _| Err(anyhow!("channel failed: {}", error)));
    }

    /// Adds credit to a shared budget, and lets connections that were waiting for it read again
    pub fn credit_budget(&mut self, budget_id: u64, amount: u64) {
        self.ctx.budgets.credit(budget_id, amount);
        for connection_id in self.ctx.budgets.flush(budget_id) {
            self.on_readable(connection_id);
        }
    }

    pub fn interest(&self, connection_id: u64) -> Option<Interest> {
        self.connections.get(&connection_id)
            .map(|c| c.interest)
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn outstanding_slots(&self) -> usize {
        self.ctx.slots.acquired()
    }

    pub fn consumer(&self) -> &W {
        self.ctx.writer.consumer()
    }

    fn with_connection(&mut self, connection_id: u64, trace_id: u64, f: impl FnOnce(&mut Connection<C>, &mut NetworkContext<W>) -> anyhow::Result<()>) {
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            trace!("ignoring event for unknown connection {}", connection_id);
            return;
        };
        if let Err(e) = f(connection, &mut self.ctx) {
            debug!("connection {}: {} - cleaning up", connection_id, e);
            connection.cleanup(&mut self.ctx, trace_id);
        }

        if connection.is_closed() {
            let reply_id = connection.half.reply_id;
            self.connections.remove(&connection_id);
            self.streams.remove(&connection_id);
            self.streams.remove(&reply_id);
            debug!("connection {}: closed", connection_id);
        }
    }

    fn dispatch(&mut self, type_id: u32, buffer: &[u8]) {
        let Some(header) = FrameHeaderView::wrap(buffer, 0, buffer.len()) else {
            debug!("dropping message of {} bytes: too short for a frame", buffer.len());
            return;
        };
        let stream_id = header.stream_id();
        let trace_id = header.trace_id();
        let Some(connection_id) = self.streams.get(&stream_id).copied() else {
            trace!("dropping frame of type {:#x} for unknown stream {}", type_id, stream_id);
            return;
        };

        let frame = FrameView::wrap(buffer, 0, buffer.len())
            .filter(|f| u32::from(f.frame_type()) == type_id);
        let initial = stream_id == connection_id;

        self.with_connection(connection_id, trace_id, |c, ctx| match (initial, frame) {
            (_, None) => Err(anyhow!("malformed frame of type {:#x}", type_id)),
            (true, Some(FrameView::Window(window))) => c.on_initial_window(&window),
            (true, Some(FrameView::Reset(_))) => {
                c.on_initial_reset(ctx, trace_id);
                Ok(())
            }
            (false, Some(FrameView::Begin(begin))) => c.on_reply_begin(ctx, &begin),
            (false, Some(FrameView::Data(data))) => c.on_reply_data(ctx, &data),
            (false, Some(FrameView::Flush(flush))) => c.on_reply_flush(ctx, &flush),
            (false, Some(FrameView::End(end))) => c.on_reply_end(&end),
            (false, Some(FrameView::Abort(_))) => {
                c.on_reply_abort(ctx);
                Ok(())
            }
            (_, Some(frame)) => Err(anyhow!("unexpected {:?} on stream {}", frame.frame_type(), stream_id)),
        });
    }
}

impl<C: NetworkChannel, W: MessageConsumer> MessageConsumer for NetworkServer<C, W> {
    fn on_message(&mut self, type_id: u32, buffer: &[u8]) {
        self.dispatch(type_id, buffer);
    }
}
