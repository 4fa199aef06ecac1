use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use recone::broker::Broker;
use recone::client::master::Master;
use recone::client::servant::{CommandExecutor, Servant};
use recone::messaging::message::Role;
use recone::messaging::transport::tcp::TcpTransport;
use recone::node_config::NodeConfig;
use serde_json::{json, Value};
use tokio::{select, time};
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    /// broker, servant or master
    role: String,
    name: String,

    #[clap(long, default_value = "127.0.0.1")]
    host: String,

    /// name of the servant a master sends its commands to
    #[clap(long, default_value = "S1")]
    servant: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

/// knows only `echo` and `uptime`
struct DemoExecutor {
    started: time::Instant,
}

#[async_trait]
impl CommandExecutor for DemoExecutor {
    async fn list_commands(&self) -> Value {
        json!(["echo", "uptime"])
    }

    async fn run_command(&self, content: &Value) -> anyhow::Result<Value> {
        match content.get("cmd").and_then(Value::as_str) {
            Some("echo") => Ok(content.get("args").cloned().unwrap_or(Value::Null)),
            Some("uptime") => Ok(json!(self.started.elapsed().as_secs())),
            other => Err(anyhow!("unsupported command {:?}", other)),
        }
    }

    async fn on_update(&self, content: &Value) {
        info!("update: {}", content);
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = NodeConfig::new(args.name);
    config.host = args.host;
    let transport = Arc::new(TcpTransport::new(&config));

    if args.role == "broker" {
        let broker = Broker::start(config, transport).await?;
        tokio::signal::ctrl_c().await?;
        return broker.shutdown().await;
    }

    match args.role.parse::<Role>()? {
        Role::Servant => {
            let executor = Arc::new(DemoExecutor { started: time::Instant::now() });
            let servant = Servant::start(config, transport, executor).await?;
            tokio::signal::ctrl_c().await?;
            servant.shutdown().await
        }
        Role::Master => {
            let master = Master::start(config, transport).await?;
            select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = run_master(&master, &args.servant) => {}
            }
            master.shutdown().await
        }
    }
}

async fn run_master(master: &Master, servant: &str) {
    let mut ticks = time::interval(Duration::from_secs(3));
    loop {
        ticks.tick().await;
        if !master.is_connected().await {
            info!("waiting for the broker");
            continue;
        }

        info!("status: {:?}", master.status().await);
        info!("commands of {}: {:?}", servant, master.list_commands(servant).await);
        info!("uptime of {}: {:?}", servant, master.run_command(servant, json!({"cmd": "uptime"})).await);
        info!("update: {:?}", master.update(servant, json!({"from": "demo"})).await);
    }
}
