use tokio::sync::broadcast;
use tracing::trace;

/// Changes of a client's connection to the broker
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    /// the first heartbeat from a broker arrived
    Connected(ConnectedData),
    /// no heartbeat arrived within twice the heartbeat interval
    Disconnected(DisconnectedData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectedData {
    pub broker: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DisconnectedData {
    pub broker: String,
}


pub struct ConnectionEventNotifier {
    sender: broadcast::Sender<ConnectionEvent>,
}
impl ConnectionEventNotifier {
    pub fn new() -> ConnectionEventNotifier {
        let (sender, _) = broadcast::channel(128);

        ConnectionEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ConnectionEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
