use std::time::Duration;

use anyhow::anyhow;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::messaging::message::{from_content, to_content, HeartbeatData, HeartbeatResponseData, Message, MessageType, Role};
use crate::util::clock::{format_millis, now_millis};

/// What a client knows about the broker it is connected to
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BrokerInfo {
    pub name: String,
    /// as advertised by the broker in its heartbeats
    pub heartbeat_interval: Duration,
    pub last_seen: Instant,
}
impl BrokerInfo {
    /// the broker is considered gone if no heartbeat arrives before this point in time
    pub fn deadline(&self) -> Instant {
        self.last_seen + 2 * self.heartbeat_interval
    }
}

/// The result of a heartbeat from the broker
#[derive(Debug, PartialEq)]
pub struct HeartbeatOutcome {
    /// to be sent back to the broker
    pub reply: Message,
    /// `true` if the client was disconnected before this heartbeat
    pub connected: bool,
}


/// A client's view of its connection to the broker, driven by heartbeats and timeouts. There is
///  no I/O here: the heartbeat worker feeds events in and acts on the outcomes.
///
/// Disconnected (initial) -> Connected on a heartbeat, Connected -> Disconnected when no
///  heartbeat arrives within twice the broker's heartbeat interval.
pub struct BrokerConnection {
    client_name: String,
    role: Role,
    broker: Option<BrokerInfo>,
}
impl BrokerConnection {
    pub fn new(client_name: &str, role: Role) -> BrokerConnection {
        BrokerConnection {
            client_name: client_name.to_string(),
            role,
            broker: None,
        }
    }

    pub fn broker(&self) -> Option<&BrokerInfo> {
        self.broker.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.broker.is_some()
    }

    /// `None` while disconnected: the first heartbeat is waited for indefinitely
    pub fn deadline(&self) -> Option<Instant> {
        self.broker.as_ref()
            .map(|b| b.deadline())
    }

    pub fn on_heartbeat(&mut self, heartbeat: &Message) -> anyhow::Result<HeartbeatOutcome> {
        let data: HeartbeatData = from_content(&heartbeat.content)?;
        if data.interval_millis == 0 {
            return Err(anyhow!("heartbeat from {} advertises a zero interval", heartbeat.sender));
        }
        let heartbeat_interval = Duration::from_millis(data.interval_millis);

        let connected = match &self.broker {
            None => {
                info!("connected to broker {} (broker clock: {})", heartbeat.sender, format_millis(data.timestamp_millis));
                true
            }
            Some(broker) if broker.name != heartbeat.sender => {
                warn!("broker changed from {} to {}", broker.name, heartbeat.sender);
                true
            }
            Some(_) => false,
        };

        self.broker = Some(BrokerInfo {
            name: heartbeat.sender.clone(),
            heartbeat_interval,
            last_seen: Instant::now(),
        });

        let response = HeartbeatResponseData {
            role: self.role,
            broker_timestamp_millis: data.timestamp_millis,
            timestamp_millis: now_millis(),
        };
        Ok(HeartbeatOutcome {
            reply: heartbeat.reply(MessageType::Heartbeat, &self.client_name, to_content(&response)),
            connected,
        })
    }

    /// Returns the broker the client was connected to, or `None` if it was disconnected
    ///  already. Calling this repeatedly is harmless.
    pub fn on_timeout(&mut self) -> Option<BrokerInfo> {
        let broker = self.broker.take();
        if let Some(broker) = &broker {
            warn!("no heartbeat from broker {} for {:?} - disconnected", broker.name, broker.last_seen.elapsed());
        }
        broker
    }
}
