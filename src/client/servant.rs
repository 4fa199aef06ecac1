use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use serde_json::Value;
use tracing::{debug, info};

use crate::client::{Client, ClientHandle, MessageHandler};
use crate::messaging::message::{Message, MessageType, Role};
use crate::messaging::transport::Transport;
use crate::node_config::NodeConfig;

/// What a servant actually does when asked: the application part of a servant.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandExecutor: Send + Sync + 'static {
    /// answer to `list-commands`
    async fn list_commands(&self) -> Value;

    /// Executes a `run-command` request. The result is sent back as `ok`, an error as `fail`
    ///  with the error's message.
    async fn run_command(&self, content: &Value) -> anyhow::Result<Value>;

    async fn on_update(&self, _content: &Value) {}
}


/// A client with role `servant`, executing commands sent by masters
pub struct Servant {
    client: Client,
}

impl Servant {
    pub async fn start(config: NodeConfig, transport: Arc<dyn Transport>, executor: Arc<dyn CommandExecutor>) -> anyhow::Result<Servant> {
        let handler = Arc::new(ServantHandler { executor });
        let client = Client::start(config, Role::Servant, transport, handler).await?;
        Ok(Servant { client })
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.client.shutdown().await
    }
}

impl Deref for Servant {
    type Target = ClientHandle;

    fn deref(&self) -> &ClientHandle {
        self.client.handle()
    }
}


struct ServantHandler {
    executor: Arc<dyn CommandExecutor>,
}

impl ServantHandler {
    async fn execute(executor: Arc<dyn CommandExecutor>, msg: Message, client: ClientHandle) {
        if msg.msg_type == MessageType::ListCommands {
            let commands = executor.list_commands().await;
            client.reply(&msg, MessageType::Ok, commands).await;
            return;
        }

        debug!("running command #{} from {}: {}", msg.id, msg.sender, msg.content);
        match executor.run_command(&msg.content).await {
            Ok(result) => {
                client.reply(&msg, MessageType::Ok, result).await;
            }
            Err(e) => {
                info!("command #{} from {} failed: {}", msg.id, msg.sender, e);
                client.reply(&msg, MessageType::Fail, Value::String(e.to_string())).await;
            }
        }
    }
}

#[async_trait]
impl MessageHandler for ServantHandler {
    async fn process_message(&self, msg: Message, client: &ClientHandle) {
        match msg.msg_type {
            MessageType::ListCommands | MessageType::RunCommand => {
                // a command may run for longer than the broker's liveness timeout, and the receive
                //  loop must keep processing heartbeats meanwhile
                tokio::spawn(Self::execute(self.executor.clone(), msg, client.clone()));
            }
            MessageType::Update => {
                debug!("update from {}: {}", msg.sender, msg.content);
                self.executor.on_update(&msg.content).await;
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
    use anyhow::anyhow;
    use mockall::predicate::eq;
    use serde_json::json;
    use tokio::time::sleep;

    use crate::broker::Broker;
    use crate::client::correlator::Response;
    use crate::client::master::Master;
    use crate::test_util::transport::InMemoryTransport;
    use super::*;

    async fn setup(executor: MockCommandExecutor) -> (Broker, Servant, Master) {
        let transport = Arc::new(InMemoryTransport::new());
        let broker = Broker::start(NodeConfig::new("broker"), transport.clone()).await.unwrap();
        let servant = Servant::start(NodeConfig::new("S1"), transport.clone(), Arc::new(executor)).await.unwrap();
        let master = Master::start(NodeConfig::new("M1"), transport).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        (broker, servant, master)
    }

    async fn teardown(broker: Broker, servant: Servant, master: Master) {
        broker.shutdown().await.unwrap();
        servant.shutdown().await.unwrap();
        master.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_commands() {
        let mut executor = MockCommandExecutor::new();
        executor.expect_list_commands()
            .times(1)
            .return_const(json!(["ls", "uptime"]));

        let (broker, servant, master) = setup(executor).await;
        let response = master.list_commands("S1").await;
        assert_eq!(response, Response::ok(json!(["ls", "uptime"])));
        teardown(broker, servant, master).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_command() {
        let mut executor = MockCommandExecutor::new();
        executor.expect_run_command()
            .with(eq(json!({"cmd": "ls"})))
            .times(1)
            .returning(|_| Ok(json!("a.txt")));
        executor.expect_run_command()
            .with(eq(json!({"cmd": "rm"})))
            .times(1)
            .returning(|_| Err(anyhow!("not permitted")));

        let (broker, servant, master) = setup(executor).await;
        assert_eq!(master.run_command("S1", json!({"cmd": "ls"})).await, Response::ok(json!("a.txt")));
        assert_eq!(master.run_command("S1", json!({"cmd": "rm"})).await, Response::failed("not permitted"));
        teardown(broker, servant, master).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_update() {
        let mut executor = MockCommandExecutor::new();
        executor.expect_on_update()
            .with(eq(json!({"progress": 50})))
            .times(1)
            .return_const(());

        let (broker, servant, master) = setup(executor).await;
        // acknowledged by the broker, not the servant
        assert_eq!(master.update("S1", json!({"progress": 50})).await, Response::ok(Value::Null));
        sleep(Duration::from_millis(10)).await;
        teardown(broker, servant, master).await;
    }

    struct SlowExecutor {
        duration: Duration,
    }

    #[async_trait]
    impl CommandExecutor for SlowExecutor {
        async fn list_commands(&self) -> Value {
            json!(["sleep"])
        }

        async fn run_command(&self, _content: &Value) -> anyhow::Result<Value> {
            sleep(self.duration).await;
            Ok(json!("done"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_outlasting_liveness_timeout() {
        let transport = Arc::new(InMemoryTransport::new());
        let broker = Broker::start(NodeConfig::new("broker"), transport.clone()).await.unwrap();
        let executor = Arc::new(SlowExecutor { duration: Duration::from_secs(15) });
        let servant = Servant::start(NodeConfig::new("S1"), transport.clone(), executor).await.unwrap();
        let mut master_config = NodeConfig::new("M1");
        master_config.response_timeout = Duration::from_secs(30);
        let master = Master::start(master_config, transport).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        let mut events = servant.subscribe_events();

        // 15s is longer than twice the heartbeat interval
        assert_eq!(master.run_command("S1", json!("sleep 15")).await, Response::ok(json!("done")));
        assert!(servant.is_connected().await);
        assert!(broker.clients().await.contains_key("S1"));
        assert!(events.try_recv().is_err());

        // requests are answered while a command is running
        let handle = (*master).clone();
        let running = tokio::spawn(async move {
            handle.send_request(MessageType::RunCommand, "S1", json!("sleep 15")).await
        });
        sleep(Duration::from_secs(1)).await;
        assert_eq!(master.list_commands("S1").await, Response::ok(json!(["sleep"])));
        assert_eq!(running.await.unwrap(), Response::ok(json!("done")));

        teardown(broker, servant, master).await;
    }
}
