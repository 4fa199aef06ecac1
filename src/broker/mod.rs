//! The broker is the central node every client connects to. It tracks connected clients through
//!  heartbeats, answers `status` requests, and routes all other messages between clients,
//!  enforcing which message types may go to which clients.

pub mod heartbeat;
pub mod registry;
pub mod routing;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, trace};

use crate::broker::heartbeat::run_heartbeat;
use crate::broker::registry::{ClientRegistry, ClientStatus};
use crate::broker::routing::route;
use crate::messaging::message::{Message, MessageType};
use crate::messaging::receiver::{run_receiver, MessageDispatcher};
use crate::messaging::sender::{run_sender, OutboundQueue};
use crate::messaging::transport::Transport;
use crate::node_config::NodeConfig;
use crate::util::shutdown::ShutdownTrigger;

/// A running broker with its three worker tasks (sender, receiver and heartbeat).
///
/// Dropping a broker without calling [Broker::shutdown] stops the workers as well, but without
///  waiting for them to finish.
pub struct Broker {
    config: Arc<NodeConfig>,
    registry: Arc<RwLock<ClientRegistry>>,
    shutdown: ShutdownTrigger,
    workers: Vec<JoinHandle<()>>,
}

impl Broker {
    /// Binds the broker's sockets and starts its workers. Failure to bind and a zero heartbeat
    ///  interval are the only fatal errors.
    pub async fn start(config: NodeConfig, transport: Arc<dyn Transport>) -> anyhow::Result<Broker> {
        if config.heartbeat_interval.is_zero() {
            return Err(anyhow!("broker {}: heartbeat interval must be greater than zero", config.name));
        }

        let config = Arc::new(config);
        let inbound = transport.bind_in().await?;
        let outbound_socket = transport.bind_out().await?;

        let registry: Arc<RwLock<ClientRegistry>> = Default::default();
        let (outbound, outbound_recv) = OutboundQueue::new();
        let (heartbeat_send, heartbeat_recv) = mpsc::unbounded_channel();
        let (shutdown, _) = ShutdownTrigger::new();

        let dispatcher = Arc::new(BrokerDispatcher {
            name: config.name.clone(),
            registry: registry.clone(),
            outbound: outbound.clone(),
            heartbeat_responses: heartbeat_send,
        });

        let workers = vec![
            tokio::spawn(run_sender(config.name.clone(), outbound_socket, outbound_recv, None, shutdown.subscribe())),
            tokio::spawn(run_receiver(config.name.clone(), inbound, dispatcher, config.poll_timeout, shutdown.subscribe())),
            tokio::spawn(run_heartbeat(config.clone(), registry.clone(), outbound, heartbeat_recv, shutdown.subscribe())),
        ];

        info!("broker {} started", config.name);
        Ok(Broker {
            config,
            registry,
            shutdown,
            workers,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// a snapshot of the currently registered clients
    pub async fn clients(&self) -> BTreeMap<String, ClientStatus> {
        self.registry.read().await
            .clients()
            .clone()
    }

    /// stops all workers and waits for them to terminate
    pub async fn shutdown(self) -> anyhow::Result<()> {
        info!("shutting down broker {}", self.config.name);
        self.shutdown.trigger();
        for worker in self.workers {
            worker.await?;
        }
        Ok(())
    }
}


struct BrokerDispatcher {
    name: String,
    registry: Arc<RwLock<ClientRegistry>>,
    outbound: OutboundQueue,
    heartbeat_responses: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl MessageDispatcher for BrokerDispatcher {
    async fn on_message(&self, msg: Message) {
        if msg.msg_type == MessageType::Heartbeat {
            let _ = self.heartbeat_responses.send(msg);
            return;
        }

        let routed = {
            let registry = self.registry.read().await;
            route(&self.name, &registry, msg)
        };
        for msg in routed {
            trace!("publishing {} to {}", msg.msg_type, msg.addressee);
            self.outbound.push(msg);
        }
    }
}
