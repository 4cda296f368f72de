//! Runs a [`ProxyEngine`] on a tokio task.
//!
//! The engine itself is synchronous and single threaded. The driver owns it and feeds it one event
//!  at a time from an unbounded channel, so frames from the network, timeouts and configuration
//!  changes are all serialized through the same queue. Everything the engine writes goes to the
//!  engine's own consumer, typically a [`ChannelConsumer`].

use std::time::Duration;
use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};
use crate::binding::Binding;
use crate::config::BindingConfig;
use crate::message_consumer::MessageConsumer;
use crate::proxy::ProxyEngine;

#[derive(Debug)]
pub enum EngineEvent {
    Message { type_id: u32, buffer: Vec<u8> },
    Timeout { stream_id: u64, trace_id: u64 },
    Attach(BindingConfig),
    Detach(u64),
}

/// Cloneable entry point into a running engine
#[derive(Clone, Debug)]
pub struct EngineHandle {
    send: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineHandle {
    pub fn send(&self, event: EngineEvent) -> anyhow::Result<()> {
        self.send.send(event)
            .map_err(|e| anyhow!("engine is not running any more, dropping {:?}", e.0))
    }

    pub fn message(&self, type_id: u32, buffer: &[u8]) -> anyhow::Result<()> {
        self.send(EngineEvent::Message { type_id, buffer: buffer.to_vec() })
    }

    pub fn attach(&self, binding: BindingConfig) -> anyhow::Result<()> {
        self.send(EngineEvent::Attach(binding))
    }

    pub fn detach(&self, binding_id: u64) -> anyhow::Result<()> {
        self.send(EngineEvent::Detach(binding_id))
    }

    /// Cleans up the stream after `delay` unless the returned handle is aborted before. A timeout
    ///  for a stream that is closed by then has no effect.
    pub fn schedule_timeout(&self, stream_id: u64, trace_id: u64, delay: Duration) -> JoinHandle<()> {
        let send = self.send.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            trace!("timeout for stream {} fired", stream_id);
            if send.send(EngineEvent::Timeout { stream_id, trace_id }).is_err() {
                debug!("timeout for stream {}: engine is not running any more", stream_id);
            }
        })
    }
}

/// Forwards everything an engine writes to a channel, e.g. towards the network task
pub struct ChannelConsumer {
    send: mpsc::UnboundedSender<(u32, Vec<u8>)>,
}
impl ChannelConsumer {
    pub fn new() -> (ChannelConsumer, mpsc::UnboundedReceiver<(u32, Vec<u8>)>) {
        let (send, recv) = mpsc::unbounded_channel();
        (ChannelConsumer { send }, recv)
    }
}
impl MessageConsumer for ChannelConsumer {
    fn on_message(&mut self, type_id: u32, buffer: &[u8]) {
        if self.send.send((type_id, buffer.to_vec())).is_err() {
            debug!("dropping outbound frame of type {:#x}: receiver is gone", type_id);
        }
    }
}

/// Spawns the event loop for `engine`. The loop ends when every [`EngineHandle`] is dropped, and
///  the task then returns the engine.
pub fn spawn_engine<B, W>(engine: ProxyEngine<B, W>) -> (EngineHandle, JoinHandle<ProxyEngine<B, W>>)
where
    B: Binding + Send + 'static,
    W: MessageConsumer + Send + 'static,
{
    let (send, recv) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run_engine(engine, recv));
    (EngineHandle { send }, handle)
}

pub async fn run_engine<B: Binding, W: MessageConsumer>(mut engine: ProxyEngine<B, W>, mut recv: mpsc::UnboundedReceiver<EngineEvent>) -> ProxyEngine<B, W> {
    info!("starting proxy engine");

    while let Some(event) = recv.recv().await {
        on_event(&mut engine, event);
    }

    warn!("proxy engine lost its event source, stopping with {} active stream(s)", engine.active_streams());
    engine
}

fn on_event<B: Binding, W: MessageConsumer>(engine: &mut ProxyEngine<B, W>, event: EngineEvent) {
    use EngineEvent::*;

    match event {
        Message { type_id, buffer } => engine.on_message(type_id, &buffer),
        Timeout { stream_id, trace_id } => engine.on_timeout(stream_id, trace_id),
        Attach(binding) => {
            let binding_id = binding.id;
            if let Err(e) = engine.attach(binding) {
                warn!("could not attach binding {}: {}", binding_id, e);
            }
        }
        Detach(binding_id) => {
            if engine.detach(binding_id).is_none() {
                debug!("binding {} was not attached", binding_id);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use tokio::runtime::Builder;
    use crate::binding::raw::RawBinding;
    use crate::config::{EngineConfig, ForwardMode, RouteConfig};
    use crate::frame::{Frame, FrameType};
    use crate::id_supplier::SequentialIdSupplier;
    use crate::test_util::{header, Recorded};
    use super::*;
    use FrameType::*;

    const C1: u64 = (1 << 48) | 1;
    const R1: u64 = 1 << 48;

    fn engine() -> (ProxyEngine<RawBinding, ChannelConsumer>, mpsc::UnboundedReceiver<(u32, Vec<u8>)>) {
        let (consumer, recv) = ChannelConsumer::new();
        let engine = ProxyEngine::new(Arc::new(EngineConfig::default_config()), RawBinding, Box::new(SequentialIdSupplier::new(1)), consumer).unwrap();
        (engine, recv)
    }

    fn binding() -> BindingConfig {
        BindingConfig { id: 1, mode: ForwardMode::Stream, routes: vec![RouteConfig::to_exit(2)] }
    }

    fn send(handle: &EngineHandle, frame: Frame<'_>) {
        handle.message(frame.frame_type().into(), &frame.to_vec()).unwrap();
    }

    async fn next(recv: &mut mpsc::UnboundedReceiver<(u32, Vec<u8>)>) -> (FrameType, u64) {
        let (type_id, buffer) = recv.recv().await.unwrap();
        let recorded = Recorded::decode(&buffer);
        assert_eq!(type_id, u32::from(recorded.frame_type));
        recorded.kind()
    }

    #[test]
    fn test_timeout() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async move {
            let (engine, mut out) = engine();
            let (handle, join_handle) = spawn_engine(engine);

            handle.attach(binding()).unwrap();
            send(&handle, Frame::Begin { header: header(1, 11, 0, 0, 0), affinity: 0, extension: b"" });
            assert_eq!(next(&mut out).await, (Begin, C1));

            let start = time::Instant::now();
            handle.schedule_timeout(11, 3, Duration::from_secs(5));

            assert_eq!(next(&mut out).await, (Reset, 11));
            assert!(time::Instant::now().duration_since(start) >= Duration::from_secs(5));
            assert_eq!(next(&mut out).await, (Abort, C1));
            assert_eq!(next(&mut out).await, (Reset, R1));

            drop(handle);
            let engine = join_handle.await.unwrap();
            assert_eq!(engine.active_streams(), 0);
            assert!(out.try_recv().is_err());
        });
    }

    #[test]
    fn test_aborted_timeout() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async move {
            let (engine, mut out) = engine();
            let (handle, join_handle) = spawn_engine(engine);

            handle.attach(binding()).unwrap();
            send(&handle, Frame::Begin { header: header(1, 11, 0, 0, 0), affinity: 0, extension: b"" });
            assert_eq!(next(&mut out).await, (Begin, C1));

            let timeout = handle.schedule_timeout(11, 3, Duration::from_secs(5));
            time::sleep(Duration::from_secs(1)).await;
            timeout.abort();
            time::sleep(Duration::from_secs(10)).await;

            drop(handle);
            let engine = join_handle.await.unwrap();
            assert_eq!(engine.active_streams(), 1);
            assert!(out.try_recv().is_err());
        });
    }

    #[test]
    fn test_detach() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async move {
            let (engine, mut out) = engine();
            let (handle, join_handle) = spawn_engine(engine);

            handle.attach(binding()).unwrap();
            handle.detach(1).unwrap();
            send(&handle, Frame::Begin { header: header(1, 11, 0, 0, 0), affinity: 0, extension: b"" });
            assert_eq!(next(&mut out).await, (Reset, 11));

            drop(handle);
            let engine = join_handle.await.unwrap();
            assert_eq!(engine.active_streams(), 0);
        });
    }

    #[test]
    fn test_send_after_stop() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let (send, recv) = mpsc::unbounded_channel();
            let handle = EngineHandle { send };
            drop(recv);

            assert!(handle.detach(1).is_err());
        });
    }
}
