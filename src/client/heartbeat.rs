use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio::{select, time};
use tracing::{debug, info, warn};

use crate::client::broker_connection::BrokerConnection;
use crate::client::events::{ConnectedData, ConnectionEvent, ConnectionEventNotifier, DisconnectedData};
use crate::messaging::message::Message;
use crate::messaging::sender::{OutboundQueue, SocketReset};
use crate::util::shutdown::Shutdown;


/// Answers the broker's heartbeats and detects a lost broker. When no heartbeat arrives in time,
///  the outbound socket is reset, discarding messages that were queued for the lost broker.
#[tracing::instrument(name="heartbeat", skip_all, fields(node=%node_name))]
pub async fn run_heartbeat(
    node_name: String,
    connection: Arc<RwLock<BrokerConnection>>,
    outbound: OutboundQueue,
    reset: SocketReset,
    events: Arc<ConnectionEventNotifier>,
    mut heartbeats: mpsc::UnboundedReceiver<Message>,
    mut shutdown: Shutdown,
) {
    loop {
        let deadline = connection.read().await.deadline();

        select! {
            biased;
            _ = shutdown.wait() => break,
            msg = heartbeats.recv() => {
                match msg {
                    Some(msg) => on_heartbeat(connection.as_ref(), &outbound, events.as_ref(), msg).await,
                    None => break,
                }
            }
            _ = wait_until(deadline) => {
                on_timeout(connection.as_ref(), &reset, events.as_ref()).await
            }
        }
    }
    info!("heartbeat terminated");
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn on_heartbeat(connection: &RwLock<BrokerConnection>, outbound: &OutboundQueue, events: &ConnectionEventNotifier, msg: Message) {
    let outcome = connection.write().await
        .on_heartbeat(&msg);

    match outcome {
        Ok(outcome) => {
            debug!("heartbeat #{} from {}", msg.id, msg.sender);
            outbound.push(outcome.reply);
            if outcome.connected {
                events.send_event(ConnectionEvent::Connected(ConnectedData { broker: msg.sender }));
            }
        }
        Err(e) => {
            warn!("invalid heartbeat from {} - ignoring: {}", msg.sender, e);
        }
    }
}

async fn on_timeout(connection: &RwLock<BrokerConnection>, reset: &SocketReset, events: &ConnectionEventNotifier) {
    let lost = connection.write().await
        .on_timeout();

    // the socket is reset regardless, resets are idempotent
    reset.request();
    if let Some(broker) = lost {
        events.send_event(ConnectionEvent::Disconnected(DisconnectedData { broker: broker.name }));
    }
}
