use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use crate::messaging::message::Message;
use crate::messaging::transport::{InboundSocket, OutboundSocket, Transport};

/// A [Transport] connecting nodes in the same process, with the same pub/sub semantics as the
///  TCP transport. All nodes of a test share one instance.
///
/// It keeps a copy of every message that passes through it so that tests can check what was
///  actually sent.
#[derive(Default)]
pub struct InMemoryTransport {
    bus: Arc<Mutex<Bus>>,
}

#[derive(Default)]
struct Bus {
    inbound: Option<mpsc::UnboundedSender<Bytes>>,
    subscribers: Vec<Subscription>,
    pushed: Vec<Message>,
    published: Vec<(String, Message)>,
    num_outbound_connects: usize,
}

struct Subscription {
    topics: Vec<String>,
    frames: mpsc::UnboundedSender<Bytes>,
}

impl InMemoryTransport {
    pub fn new() -> InMemoryTransport {
        Default::default()
    }

    /// messages pushed by clients since the previous call
    pub async fn take_pushed(&self) -> Vec<Message> {
        std::mem::take(&mut self.bus.lock().await.pushed)
    }

    /// messages published by the broker since the previous call, with their topic
    pub async fn take_published(&self) -> Vec<(String, Message)> {
        std::mem::take(&mut self.bus.lock().await.published)
    }

    pub async fn num_outbound_connects(&self) -> usize {
        self.bus.lock().await.num_outbound_connects
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn bind_in(&self) -> anyhow::Result<Box<dyn InboundSocket>> {
        let (send, recv) = mpsc::unbounded_channel();
        self.bus.lock().await.inbound = Some(send);
        Ok(Box::new(InMemoryInboundSocket { frames: recv }))
    }

    async fn bind_out(&self) -> anyhow::Result<Box<dyn OutboundSocket>> {
        Ok(Box::new(InMemoryPublishSocket { bus: self.bus.clone() }))
    }

    async fn connect_in(&self, topics: &[String]) -> anyhow::Result<Box<dyn InboundSocket>> {
        let (send, recv) = mpsc::unbounded_channel();
        self.bus.lock().await.subscribers.push(Subscription {
            topics: topics.to_vec(),
            frames: send,
        });
        Ok(Box::new(InMemoryInboundSocket { frames: recv }))
    }

    async fn connect_out(&self) -> anyhow::Result<Box<dyn OutboundSocket>> {
        self.bus.lock().await.num_outbound_connects += 1;
        Ok(Box::new(InMemoryPushSocket { bus: self.bus.clone() }))
    }
}

struct InMemoryInboundSocket {
    frames: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl InboundSocket for InMemoryInboundSocket {
    async fn recv(&mut self) -> anyhow::Result<Bytes> {
        self.frames.recv().await
            .ok_or_else(|| anyhow!("in-memory socket is closed"))
    }
}

struct InMemoryPublishSocket {
    bus: Arc<Mutex<Bus>>,
}

#[async_trait]
impl OutboundSocket for InMemoryPublishSocket {
    async fn send(&mut self, addressee: &str, payload: Bytes) -> anyhow::Result<()> {
        let mut bus = self.bus.lock().await;
        if let Ok(msg) = Message::deser(&payload) {
            trace!("publishing {:?} to {}", msg, addressee);
            bus.published.push((addressee.to_string(), msg));
        }

        bus.subscribers.retain(|s| {
            if s.topics.iter().any(|t| t == addressee) {
                s.frames.send(payload.clone()).is_ok()
            }
            else {
                !s.frames.is_closed()
            }
        });
        Ok(())
    }
}

struct InMemoryPushSocket {
    bus: Arc<Mutex<Bus>>,
}

#[async_trait]
impl OutboundSocket for InMemoryPushSocket {
    async fn send(&mut self, _addressee: &str, payload: Bytes) -> anyhow::Result<()> {
        let mut bus = self.bus.lock().await;
        if let Ok(msg) = Message::deser(&payload) {
            bus.pushed.push(msg);
        }

        match &bus.inbound {
            Some(inbound) => inbound.send(payload)
                .map_err(|_| anyhow!("broker is gone")),
            None => Err(anyhow!("no broker is bound")),
        }
    }
}
