use std::sync::Arc;

use bytes::BytesMut;
use tokio::select;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, trace, warn};

use crate::messaging::message::Message;
use crate::messaging::transport::{OutboundSocket, Transport};
use crate::util::shutdown::Shutdown;


/// The producing end of a node's outbound queue. Messages are transmitted in the order they were
///  pushed, by a single sender task per node, so that the transport is never written
///  concurrently.
#[derive(Clone, Debug)]
pub struct OutboundQueue {
    sender: mpsc::UnboundedSender<Message>,
}
impl OutboundQueue {
    pub fn new() -> (OutboundQueue, mpsc::UnboundedReceiver<Message>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (OutboundQueue { sender }, receiver)
    }

    /// returns `false` if the sender task is gone
    pub fn push(&self, msg: Message) -> bool {
        self.sender.send(msg).is_ok()
    }
}


/// Requests to tear down a client's outbound socket and create a fresh one, discarding whatever
///  is still queued. Requests coalesce: several requests before the sender task gets to them
///  cause a single reset.
#[derive(Clone, Default)]
pub struct SocketReset {
    notify: Arc<Notify>,
}
impl SocketReset {
    pub fn request(&self) {
        self.notify.notify_one();
    }
}

/// A client's sender can recreate its socket, the broker's can not.
pub struct Reconnect {
    pub reset: SocketReset,
    pub transport: Arc<dyn Transport>,
}

async fn reset_requested(reconnect: &Option<Reconnect>) {
    match reconnect {
        Some(r) => r.reset.notify.notified().await,
        None => std::future::pending().await,
    }
}


#[tracing::instrument(name="sender", skip_all, fields(node=%node_name))]
pub async fn run_sender(
    node_name: String,
    socket: Box<dyn OutboundSocket>,
    mut queue: mpsc::UnboundedReceiver<Message>,
    reconnect: Option<Reconnect>,
    mut shutdown: Shutdown,
) {
    let mut socket = Some(socket);

    loop {
        select! {
            biased;
            _ = shutdown.wait() => break,
            _ = reset_requested(&reconnect) => {
                if let Some(reconnect) = &reconnect {
                    socket = reset_socket(&mut queue, socket, reconnect.transport.as_ref()).await;
                }
            }
            msg = queue.recv() => {
                match msg {
                    Some(msg) => {
                        if socket.is_none() {
                            if let Some(reconnect) = &reconnect {
                                socket = connect(reconnect.transport.as_ref()).await;
                            }
                        }
                        match &mut socket {
                            Some(socket) => transmit(socket.as_mut(), &msg).await,
                            None => warn!("no outbound socket - dropping {} message to {}", msg.msg_type, msg.addressee),
                        }
                    }
                    None => break,
                }
            }
        }
    }
    info!("sender terminated");
}

async fn transmit(socket: &mut dyn OutboundSocket, msg: &Message) {
    trace!(msg_type=%msg.msg_type, to=%msg.addressee, id=msg.id, "sending message");

    let mut buf = BytesMut::new();
    msg.ser(&mut buf);
    if let Err(e) = socket.send(&msg.addressee, buf.freeze()).await {
        debug!("error sending {} message to {}: {}", msg.msg_type, msg.addressee, e);
    }
}

async fn reset_socket(queue: &mut mpsc::UnboundedReceiver<Message>, old_socket: Option<Box<dyn OutboundSocket>>, transport: &dyn Transport) -> Option<Box<dyn OutboundSocket>> {
    drop(old_socket);

    let mut num_discarded = 0usize;
    while queue.try_recv().is_ok() {
        num_discarded += 1;
    }
    if num_discarded > 0 {
        info!("discarded {} queued messages", num_discarded);
    }

    debug!("recreating outbound socket");
    connect(transport).await
}

async fn connect(transport: &dyn Transport) -> Option<Box<dyn OutboundSocket>> {
    match transport.connect_out().await {
        Ok(socket) => Some(socket),
        Err(e) => {
            error!("error creating outbound socket: {}", e);
            None
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;
    use serde_json::json;
    use tokio::time::sleep;

    use crate::messaging::message::MessageType;
    use crate::test_util::transport::InMemoryTransport;
    use crate::util::shutdown::ShutdownTrigger;
    use super::*;

    fn msg(id: u64) -> Message {
        Message::new(MessageType::Update, "M1", "S1", id, json!(id))
    }

    #[tokio::test(start_paused = true)]
    async fn test_transmits_in_order() {
        let transport = Arc::new(InMemoryTransport::new());
        let socket = transport.connect_out().await.unwrap();
        let (queue, receiver) = OutboundQueue::new();
        let (trigger, shutdown) = ShutdownTrigger::new();

        for id in 0..5 {
            assert!(queue.push(msg(id)));
        }
        let handle = tokio::spawn(run_sender("M1".to_string(), socket, receiver, None, shutdown));
        sleep(Duration::from_millis(10)).await;

        let pushed = transport.take_pushed().await;
        assert_eq!(pushed, (0..5).map(msg).collect::<Vec<_>>());

        trigger.trigger();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminates_when_queue_is_dropped() {
        let transport = Arc::new(InMemoryTransport::new());
        let socket = transport.connect_out().await.unwrap();
        let (queue, receiver) = OutboundQueue::new();
        let (_trigger, shutdown) = ShutdownTrigger::new();

        let handle = tokio::spawn(run_sender("M1".to_string(), socket, receiver, None, shutdown));
        drop(queue);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_discards_queued_messages() {
        let transport = Arc::new(InMemoryTransport::new());
        let socket = transport.connect_out().await.unwrap();
        let (queue, receiver) = OutboundQueue::new();
        let (trigger, shutdown) = ShutdownTrigger::new();
        let reset = SocketReset::default();

        queue.push(msg(1));
        queue.push(msg(2));
        reset.request();
        reset.request();

        let reconnect = Reconnect {
            reset: reset.clone(),
            transport: transport.clone(),
        };
        let handle = tokio::spawn(run_sender("M1".to_string(), socket, receiver, Some(reconnect), shutdown));
        sleep(Duration::from_millis(10)).await;

        assert!(transport.take_pushed().await.is_empty());
        assert_eq!(transport.num_outbound_connects().await, 2);

        queue.push(msg(3));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.take_pushed().await, vec![msg(3)]);
        assert_eq!(transport.num_outbound_connects().await, 2);

        trigger.trigger();
        handle.await.unwrap();
    }
}
