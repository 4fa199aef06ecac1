use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio::{select, time};
use tracing::{debug, info, trace, warn};

use crate::broker::registry::ClientRegistry;
use crate::messaging::message::{from_content, to_content, HeartbeatData, HeartbeatResponseData, Message, MessageType, HEARTBEAT_TOPIC};
use crate::messaging::sender::OutboundQueue;
use crate::node_config::NodeConfig;
use crate::util::clock::now_millis;
use crate::util::shutdown::Shutdown;


/// Creates the periodic heartbeat broadcasts, numbering them from 0
pub struct BrokerHeartbeat {
    broker_name: String,
    interval: Duration,
    counter: u64,
}
impl BrokerHeartbeat {
    pub fn new(broker_name: &str, interval: Duration) -> BrokerHeartbeat {
        BrokerHeartbeat {
            broker_name: broker_name.to_string(),
            interval,
            counter: 0,
        }
    }

    pub fn new_heartbeat_message(&mut self) -> Message {
        let id = self.counter;
        self.counter += 1;

        let data = HeartbeatData {
            timestamp_millis: now_millis(),
            interval_millis: self.interval.as_millis() as u64,
        };
        Message::new(MessageType::Heartbeat, &self.broker_name, HEARTBEAT_TOPIC, id, to_content(&data))
    }
}


/// Broadcasts a heartbeat every heartbeat interval, removing clients that did not answer for
///  twice that interval before each broadcast. Clients' heartbeat responses arrive through
///  `responses`.
#[tracing::instrument(name="heartbeat", skip_all, fields(node=%config.name))]
pub async fn run_heartbeat(
    config: Arc<NodeConfig>,
    registry: Arc<RwLock<ClientRegistry>>,
    outbound: OutboundQueue,
    mut responses: mpsc::UnboundedReceiver<Message>,
    mut shutdown: Shutdown,
) {
    let mut heartbeat = BrokerHeartbeat::new(&config.name, config.heartbeat_interval);

    let mut heartbeat_ticks = time::interval(config.heartbeat_interval);
    heartbeat_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            biased;
            _ = shutdown.wait() => break,
            msg = responses.recv() => {
                match msg {
                    Some(msg) => on_heartbeat_response(registry.as_ref(), msg).await,
                    None => break,
                }
            }
            _ = heartbeat_ticks.tick() => {
                do_heartbeat(&config, registry.as_ref(), &mut heartbeat, &outbound).await
            }
        }
    }
    info!("heartbeat terminated");
}

async fn on_heartbeat_response(registry: &RwLock<ClientRegistry>, msg: Message) {
    match from_content::<HeartbeatResponseData>(&msg.content) {
        Ok(data) => {
            trace!("heartbeat response #{} from {}: round trip {}ms", msg.id, msg.sender, now_millis() - data.broker_timestamp_millis);
            registry.write().await
                .on_heartbeat(&msg.sender, data.role);
        }
        Err(e) => {
            warn!("invalid heartbeat response from {} - ignoring: {}", msg.sender, e);
        }
    }
}

async fn do_heartbeat(config: &NodeConfig, registry: &RwLock<ClientRegistry>, heartbeat: &mut BrokerHeartbeat, outbound: &OutboundQueue) {
    let removed = registry.write().await
        .remove_stale(config.liveness_timeout());
    if !removed.is_empty() {
        debug!("removed stale clients {:?}", removed);
    }

    let msg = heartbeat.new_heartbeat_message();
    debug!("broadcasting heartbeat #{}", msg.id);
    outbound.push(msg);
}
