use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::client::servant::CommandExecutor;

/// A [CommandExecutor] that knows a fixed list of commands and records every request. A
///  `run-command` request is expected to have content `{"cmd": <name>, ...}`; known commands
///  succeed with `{"cmd": <name>, "done": true}`, everything else fails.
pub struct RecordingExecutor {
    commands: Vec<String>,
    pub commands_run: Mutex<Vec<Value>>,
    pub updates: Mutex<Vec<Value>>,
}

impl RecordingExecutor {
    pub fn new(commands: &[&str]) -> RecordingExecutor {
        RecordingExecutor {
            commands: commands.iter().map(|c| c.to_string()).collect(),
            commands_run: Default::default(),
            updates: Default::default(),
        }
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn list_commands(&self) -> Value {
        json!(self.commands)
    }

    async fn run_command(&self, content: &Value) -> anyhow::Result<Value> {
        self.commands_run.lock().await
            .push(content.clone());

        match content.get("cmd").and_then(Value::as_str) {
            Some(cmd) if self.commands.iter().any(|c| c == cmd) => Ok(json!({"cmd": cmd, "done": true})),
            Some(cmd) => Err(anyhow!("unknown command {:?}", cmd)),
            None => Err(anyhow!("no command")),
        }
    }

    async fn on_update(&self, content: &Value) {
        self.updates.lock().await
            .push(content.clone());
    }
}
