//! Clients connect to a broker and exchange messages with other clients through it. A client is
//!  either a servant (executing commands) or a master (issuing them); both share the connection
//!  handling, request / response correlation and dispatch implemented here.

pub mod broker_connection;
pub mod correlator;
pub mod events;
pub mod heartbeat;
pub mod master;
pub mod servant;

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info};

use crate::client::broker_connection::BrokerConnection;
use crate::client::correlator::{Response, ResponseCorrelator};
use crate::client::events::{ConnectionEvent, ConnectionEventNotifier};
use crate::client::heartbeat::run_heartbeat;
use crate::messaging::message::{Message, MessageType, Role, HEARTBEAT_TOPIC};
use crate::messaging::receiver::{run_receiver, MessageDispatcher};
use crate::messaging::sender::{run_sender, OutboundQueue, Reconnect, SocketReset};
use crate::messaging::transport::Transport;
use crate::node_config::NodeConfig;
use crate::util::shutdown::ShutdownTrigger;

pub const REASON_RESPONSE_TIMEOUT: &str = "response timeout";
pub const REASON_BROKER_NOT_AVAILABLE: &str = "broker not available";


/// Application specific handling of the messages a client receives: everything except
///  heartbeats and responses to the client's own requests.
///
/// This is called from the client's receive loop, which also delivers heartbeats and responses, and
///  holds it up until it returns. Work that takes a while or waits for a response of its own
///  should be spawned onto a task with a clone of the `ClientHandle`, see the servant.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn process_message(&self, msg: Message, client: &ClientHandle);
}


/// A cheaply cloneable handle for sending messages through a running client
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: Arc<NodeConfig>,
    role: Role,
    outbound: OutboundQueue,
    correlator: ResponseCorrelator,
    connection: Arc<RwLock<BrokerConnection>>,
    events: Arc<ConnectionEventNotifier>,
    next_id: AtomicU64,
}

impl ClientHandle {
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.connection.read().await
            .is_connected()
    }

    /// the name of the broker this client is connected to
    pub async fn broker_name(&self) -> Option<String> {
        self.inner.connection.read().await
            .broker()
            .map(|b| b.name.clone())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Queues a message with a fresh id without waiting for a response. Returns `false` if the
    ///  client is not connected to a broker, in which case nothing is queued.
    pub async fn send(&self, msg_type: MessageType, addressee: &str, content: Value) -> bool {
        self.send_with_id(msg_type, addressee, self.next_id(), content).await
    }

    async fn send_with_id(&self, msg_type: MessageType, addressee: &str, id: u64, content: Value) -> bool {
        self.enqueue(Message::new(msg_type, self.name(), addressee, id, content)).await
    }

    async fn enqueue(&self, msg: Message) -> bool {
        if !self.is_connected().await {
            debug!("not connected - not sending {} message to {}", msg.msg_type, msg.addressee);
            return false;
        }
        self.inner.outbound.push(msg)
    }

    /// Answers a received request, echoing its id
    pub async fn reply(&self, request: &Message, msg_type: MessageType, content: Value) -> bool {
        self.enqueue(request.reply(msg_type, self.name(), content)).await
    }

    /// Sends a request and waits for the response, for up to the configured response timeout
    pub async fn send_request(&self, msg_type: MessageType, addressee: &str, content: Value) -> Response {
        self.send_request_with_timeout(msg_type, addressee, content, self.inner.config.response_timeout).await
    }

    /// Sends a request and waits for the `ok` or `fail` message with the same id. This never
    ///  fails: timeouts and an unavailable broker are reported as a failed [Response].
    pub async fn send_request_with_timeout(&self, msg_type: MessageType, addressee: &str, content: Value, timeout: Duration) -> Response {
        let id = self.next_id();
        let slot = self.inner.correlator.register(id).await;

        if !self.send_with_id(msg_type, addressee, id, content).await {
            self.inner.correlator.remove(id).await;
            return Response::failed(REASON_BROKER_NOT_AVAILABLE);
        }

        match time::timeout(timeout, slot).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Response::failed(REASON_BROKER_NOT_AVAILABLE),
            Err(_) => {
                debug!("no response to request #{} within {:?}", id, timeout);
                self.inner.correlator.remove(id).await;
                Response::failed(REASON_RESPONSE_TIMEOUT)
            }
        }
    }
}


/// A running client with its three worker tasks (sender, receiver and heartbeat). It
///  dereferences to its [ClientHandle] for sending.
pub struct Client {
    handle: ClientHandle,
    shutdown: ShutdownTrigger,
    workers: Vec<JoinHandle<()>>,
}

impl Client {
    /// Creates the client's sockets and starts its workers. The client starts out disconnected
    ///  and connects when the first heartbeat from a broker arrives.
    pub async fn start(config: NodeConfig, role: Role, transport: Arc<dyn Transport>, handler: Arc<dyn MessageHandler>) -> anyhow::Result<Client> {
        let config = Arc::new(config);
        let topics = vec![config.name.clone(), HEARTBEAT_TOPIC.to_string()];
        let inbound = transport.connect_in(&topics).await?;
        let outbound_socket = transport.connect_out().await?;

        let (outbound, outbound_recv) = OutboundQueue::new();
        let (heartbeat_send, heartbeat_recv) = mpsc::unbounded_channel();
        let (shutdown, _) = ShutdownTrigger::new();
        let connection = Arc::new(RwLock::new(BrokerConnection::new(&config.name, role)));
        let events = Arc::new(ConnectionEventNotifier::new());
        let reset = SocketReset::default();

        let handle = ClientHandle {
            inner: Arc::new(ClientInner {
                config: config.clone(),
                role,
                outbound: outbound.clone(),
                correlator: Default::default(),
                connection: connection.clone(),
                events: events.clone(),
                next_id: AtomicU64::new(0),
            }),
        };

        let dispatcher = Arc::new(ClientDispatcher {
            client: handle.clone(),
            handler,
            heartbeats: heartbeat_send,
        });
        let reconnect = Reconnect {
            reset: reset.clone(),
            transport,
        };

        let workers = vec![
            tokio::spawn(run_sender(config.name.clone(), outbound_socket, outbound_recv, Some(reconnect), shutdown.subscribe())),
            tokio::spawn(run_receiver(config.name.clone(), inbound, dispatcher, config.poll_timeout, shutdown.subscribe())),
            tokio::spawn(run_heartbeat(config.name.clone(), connection, outbound, reset, events, heartbeat_recv, shutdown.subscribe())),
        ];

        info!("{} {} started", role, config.name);
        Ok(Client {
            handle,
            shutdown,
            workers,
        })
    }

    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    /// stops all workers and waits for them to terminate
    pub async fn shutdown(self) -> anyhow::Result<()> {
        info!("shutting down {}", self.handle.name());
        self.shutdown.trigger();
        for worker in self.workers {
            worker.await?;
        }
        Ok(())
    }
}

impl Deref for Client {
    type Target = ClientHandle;

    fn deref(&self) -> &ClientHandle {
        &self.handle
    }
}


struct ClientDispatcher {
    client: ClientHandle,
    handler: Arc<dyn MessageHandler>,
    heartbeats: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl MessageDispatcher for ClientDispatcher {
    async fn on_message(&self, msg: Message) {
        if msg.msg_type == MessageType::Heartbeat {
            let _ = self.heartbeats.send(msg);
        }
        else if msg.msg_type.is_response() {
            self.client.inner.correlator.resolve(msg).await;
        }
        else {
            debug!("{} message #{} from {}", msg.msg_type, msg.id, msg.sender);
            self.handler.process_message(msg, &self.client).await;
        }
    }
}
