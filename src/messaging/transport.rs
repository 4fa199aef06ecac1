pub mod tcp;

use bytes::Bytes;

/// The receiving end of a node's connection to the pub/sub layer: the broker's pull socket that
///  merges everything clients push, or a client's subscription to its own name and the heartbeat
///  topic.
#[async_trait::async_trait]
pub trait InboundSocket: Send {
    /// Waits for the next frame. An error means that nothing could be read right now; callers
    ///  are expected to retry.
    async fn recv(&mut self) -> anyhow::Result<Bytes>;
}

/// The sending end: the broker publishes with the addressee as the topic, a client pushes
///  everything to the broker and ignores the addressee.
#[async_trait::async_trait]
pub trait OutboundSocket: Send {
    async fn send(&mut self, addressee: &str, payload: Bytes) -> anyhow::Result<()>;
}

/// Creates sockets. The broker binds, clients connect.
///
/// Binding is the only step where transport problems are fatal to a node. Connecting is not
///  expected to fail if the broker is not (yet) running: implementations connect lazily and
///  retry in the background.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn bind_in(&self) -> anyhow::Result<Box<dyn InboundSocket>>;
    async fn bind_out(&self) -> anyhow::Result<Box<dyn OutboundSocket>>;

    async fn connect_in(&self, topics: &[String]) -> anyhow::Result<Box<dyn InboundSocket>>;
    async fn connect_out(&self) -> anyhow::Result<Box<dyn OutboundSocket>>;
}
