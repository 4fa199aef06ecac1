//! End-to-end scenarios with a broker, servants and masters in one process

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::{self, sleep};

use crate::broker::routing::REASON_UNKNOWN_ADDRESSEE;
use crate::broker::Broker;
use crate::client::correlator::Response;
use crate::client::master::Master;
use crate::client::servant::Servant;
use crate::messaging::message::{from_content, HeartbeatResponseData, MessageType, Role, HEARTBEAT_TOPIC};
use crate::messaging::transport::tcp::TcpTransport;
use crate::node_config::NodeConfig;
use crate::test_util::executor::RecordingExecutor;
use crate::test_util::transport::InMemoryTransport;

struct Setup {
    transport: Arc<InMemoryTransport>,
    broker: Broker,
    executor: Arc<RecordingExecutor>,
    s1: Servant,
    m1: Master,
}
impl Setup {
    async fn start() -> Setup {
        let transport = Arc::new(InMemoryTransport::new());
        let broker = Broker::start(NodeConfig::new("broker"), transport.clone()).await.unwrap();
        let executor = Arc::new(RecordingExecutor::new(&["ls", "uptime"]));
        let s1 = Servant::start(NodeConfig::new("S1"), transport.clone(), executor.clone()).await.unwrap();
        let m1 = Master::start(NodeConfig::new("M1"), transport.clone()).await.unwrap();
        sleep(Duration::from_millis(10)).await;

        Setup { transport, broker, executor, s1, m1 }
    }

    async fn shutdown(self) {
        self.broker.shutdown().await.unwrap();
        self.s1.shutdown().await.unwrap();
        self.m1.shutdown().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_servant_registers_and_runs_command() {
    let setup = Setup::start().await;

    let published = setup.transport.take_published().await;
    let first_heartbeat = published.iter()
        .find(|(topic, _)| topic == HEARTBEAT_TOPIC)
        .map(|(_, msg)| msg.clone())
        .unwrap();
    assert_eq!(first_heartbeat.id, 0);

    let heartbeat_reply = setup.transport.take_pushed().await
        .into_iter()
        .find(|msg| msg.msg_type == MessageType::Heartbeat && msg.sender == "S1")
        .unwrap();
    assert_eq!(heartbeat_reply.id, 0);
    assert_eq!(from_content::<HeartbeatResponseData>(&heartbeat_reply.content).unwrap().role, Role::Servant);

    assert_eq!(setup.broker.clients().await.get("S1").unwrap().role, Role::Servant);

    let response = setup.m1.run_command("S1", json!({"cmd": "ls"})).await;
    assert_eq!(response, Response::ok(json!({"cmd": "ls", "done": true})));
    assert_eq!(*setup.executor.commands_run.lock().await, vec![json!({"cmd": "ls"})]);

    let forwarded = setup.transport.take_published().await
        .into_iter()
        .find(|(topic, msg)| topic == "S1" && msg.msg_type == MessageType::RunCommand)
        .unwrap();
    assert_eq!(forwarded.1.sender, "M1");
    assert_eq!(forwarded.1.content, json!({"cmd": "ls"}));

    setup.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_command_to_unknown_servant() {
    let setup = Setup::start().await;

    let response = setup.m1.run_command("S2", json!({"cmd": "ls"})).await;
    assert_eq!(response, Response::failed(REASON_UNKNOWN_ADDRESSEE));
    assert!(setup.executor.commands_run.lock().await.is_empty());

    setup.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_command() {
    let setup = Setup::start().await;

    let response = setup.m1.run_command("S1", json!({"cmd": "reboot"})).await;
    assert!(!response.success);
    assert_eq!(response.content, json!("unknown command \"reboot\""));

    assert_eq!(setup.m1.list_commands("S1").await, Response::ok(json!(["ls", "uptime"])));

    setup.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_servant_is_removed() {
    let Setup { transport: _transport, broker, executor: _, s1, m1 } = Setup::start().await;

    // heartbeats keep both clients registered
    sleep(Duration::from_secs(60)).await;
    assert_eq!(broker.clients().await.len(), 2);

    // S1's last heartbeat reply was at 60s, so it is stale after 70s and removed by the tick at 75s
    let stopped = time::Instant::now();
    s1.shutdown().await.unwrap();
    sleep(Duration::from_secs(9)).await;
    assert!(broker.clients().await.contains_key("S1"));
    sleep(Duration::from_secs(6)).await;
    assert!(!broker.clients().await.contains_key("S1"));
    assert!(broker.clients().await.contains_key("M1"));
    assert!(stopped.elapsed() <= Duration::from_secs(15) + Duration::from_millis(100));

    let response = m1.run_command("S1", json!({"cmd": "ls"})).await;
    assert_eq!(response, Response::failed(REASON_UNKNOWN_ADDRESSEE));

    broker.shutdown().await.unwrap();
    m1.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_update_between_master_and_servant() {
    let setup = Setup::start().await;

    assert_eq!(setup.m1.update("S1", json!({"progress": 50})).await, Response::ok(serde_json::Value::Null));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(*setup.executor.updates.lock().await, vec![json!({"progress": 50})]);

    // servants may send updates to masters as well
    assert!(setup.s1.send(MessageType::Update, "M1", json!("halfway")).await);
    let update = setup.m1.next_update().await.unwrap();
    assert_eq!(update.sender, "S1");
    assert_eq!(update.content, json!("halfway"));

    setup.shutdown().await;
}

#[tokio::test]
async fn test_over_tcp() {
    let config = |name: &str| {
        let mut config = NodeConfig::new(name);
        config.in_port = 47410;
        config.out_port = 47411;
        config.heartbeat_interval = Duration::from_millis(200);
        config.reconnect_interval = Duration::from_millis(50);
        config
    };

    let broker_config = config("broker");
    let broker = Broker::start(broker_config.clone(), Arc::new(TcpTransport::new(&broker_config))).await.unwrap();

    let executor = Arc::new(RecordingExecutor::new(&["ls"]));
    let s1_config = config("S1");
    let s1 = Servant::start(s1_config.clone(), Arc::new(TcpTransport::new(&s1_config)), executor.clone()).await.unwrap();
    let m1_config = config("M1");
    let m1 = Master::start(m1_config.clone(), Arc::new(TcpTransport::new(&m1_config))).await.unwrap();

    time::timeout(Duration::from_secs(5), async {
        while broker.clients().await.len() < 2 || !m1.is_connected().await {
            sleep(Duration::from_millis(50)).await;
        }
    }).await.unwrap();

    let response = m1.run_command("S1", json!({"cmd": "ls"})).await;
    assert_eq!(response, Response::ok(json!({"cmd": "ls", "done": true})));

    let status = m1.status().await;
    assert_eq!(status.content["S1"]["role"], json!("servant"));

    m1.shutdown().await.unwrap();
    s1.shutdown().await.unwrap();
    broker.shutdown().await.unwrap();
}
