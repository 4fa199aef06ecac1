use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::client::correlator::Response;
use crate::client::{Client, ClientHandle, MessageHandler, REASON_BROKER_NOT_AVAILABLE};
use crate::messaging::message::{Message, MessageType, Role};
use crate::messaging::transport::Transport;
use crate::node_config::NodeConfig;

/// A client with role `master`: it queries the broker and sends commands to servants.
pub struct Master {
    client: Client,
    updates: Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl Master {
    pub async fn start(config: NodeConfig, transport: Arc<dyn Transport>) -> anyhow::Result<Master> {
        let (send, recv) = mpsc::unbounded_channel();
        let client = Client::start(config, Role::Master, transport, Arc::new(MasterHandler { updates: send })).await?;
        Ok(Master {
            client,
            updates: Mutex::new(recv),
        })
    }

    /// the broker's registry of connected clients
    pub async fn status(&self) -> Response {
        match self.broker_name().await {
            Some(broker) => self.send_request(MessageType::Status, &broker, Value::Null).await,
            None => Response::failed(REASON_BROKER_NOT_AVAILABLE),
        }
    }

    pub async fn list_commands(&self, servant: &str) -> Response {
        self.send_request(MessageType::ListCommands, servant, Value::Null).await
    }

    pub async fn run_command(&self, servant: &str, content: Value) -> Response {
        self.send_request(MessageType::RunCommand, servant, content).await
    }

    /// Sends an update to another client. The response is the broker's acknowledgement: it
    ///  does not mean that the addressee exists.
    pub async fn update(&self, addressee: &str, content: Value) -> Response {
        self.send_request(MessageType::Update, addressee, content).await
    }

    /// Waits for the next `update` message sent to this master. Returns `None` after shutdown.
    pub async fn next_update(&self) -> Option<Message> {
        self.updates.lock().await
            .recv().await
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.client.shutdown().await
    }
}

impl Deref for Master {
    type Target = ClientHandle;

    fn deref(&self) -> &ClientHandle {
        self.client.handle()
    }
}


struct MasterHandler {
    updates: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl MessageHandler for MasterHandler {
    async fn process_message(&self, msg: Message, _client: &ClientHandle) {
        match msg.msg_type {
            MessageType::Update => {
                let _ = self.updates.send(msg);
            }
            _ => {
                debug!("ignoring {} message from {}", msg.msg_type, msg.sender);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;
    use serde_json::json;
    use tokio::time::sleep;

    use crate::broker::routing::{REASON_NOT_SERVANT, REASON_UNKNOWN_ADDRESSEE};
    use crate::broker::Broker;
    use crate::test_util::transport::InMemoryTransport;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_master_requests() {
        let transport = Arc::new(InMemoryTransport::new());
        let broker = Broker::start(NodeConfig::new("broker"), transport.clone()).await.unwrap();
        let m1 = Master::start(NodeConfig::new("M1"), transport.clone()).await.unwrap();
        let m2 = Master::start(NodeConfig::new("M2"), transport.clone()).await.unwrap();
        sleep(Duration::from_millis(10)).await;

        let status = m1.status().await;
        assert!(status.success);
        assert_eq!(status.content["M1"]["role"], json!("master"));
        assert_eq!(status.content["M2"]["role"], json!("master"));

        assert_eq!(m1.run_command("M2", json!({"cmd": "ls"})).await, Response::failed(REASON_NOT_SERVANT));
        assert_eq!(m1.list_commands("S9").await, Response::failed(REASON_UNKNOWN_ADDRESSEE));

        assert_eq!(m1.update("M2", json!("hello")).await, Response::ok(Value::Null));
        let update = m2.next_update().await.unwrap();
        assert_eq!(update.sender, "M1");
        assert_eq!(update.content, json!("hello"));

        broker.shutdown().await.unwrap();
        m1.shutdown().await.unwrap();
        m2.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_without_broker() {
        let transport = Arc::new(InMemoryTransport::new());
        let m1 = Master::start(NodeConfig::new("M1"), transport).await.unwrap();
        assert_eq!(m1.status().await, Response::failed(REASON_BROKER_NOT_AVAILABLE));
        m1.shutdown().await.unwrap();
    }
}
