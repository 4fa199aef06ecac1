use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use crc::Crc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::buf::{put_bytes, put_string, put_u64_varint, try_get_bytes, try_get_string, try_get_u64, try_get_u64_varint};

/// Heartbeats from the broker are published to this topic, which every client subscribes to in
///  addition to its own name.
pub const HEARTBEAT_TOPIC: &str = ".heartbeat";


/// The closed taxonomy of message types. The wire representation is a case-sensitive string;
///  strings outside the taxonomy are preserved as [MessageType::Unknown] so that the broker can
///  reject them explicitly.
#[derive(Clone, Eq, PartialEq, Hash)]
pub enum MessageType {
    Heartbeat,
    Status,
    Update,
    Ok,
    Fail,
    ListCommands,
    RunCommand,
    Unknown(String),
}
impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Heartbeat => "heartbeat",
            MessageType::Status => "status",
            MessageType::Update => "update",
            MessageType::Ok => "ok",
            MessageType::Fail => "fail",
            MessageType::ListCommands => "list-commands",
            MessageType::RunCommand => "run-command",
            MessageType::Unknown(s) => s,
        }
    }

    /// `ok` and `fail` answer a previous request, all other types start an interaction
    pub fn is_response(&self) -> bool {
        matches!(self, MessageType::Ok | MessageType::Fail)
    }
}
impl From<&str> for MessageType {
    fn from(value: &str) -> Self {
        match value {
            "heartbeat" => MessageType::Heartbeat,
            "status" => MessageType::Status,
            "update" => MessageType::Update,
            "ok" => MessageType::Ok,
            "fail" => MessageType::Fail,
            "list-commands" => MessageType::ListCommands,
            "run-command" => MessageType::RunCommand,
            other => MessageType::Unknown(other.to_string()),
        }
    }
}
impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
impl Debug for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}


/// The role a client plays: only servants receive commands, masters issue them.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Servant,
    Master,
}
impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Servant => "servant",
            Role::Master => "master",
        }
    }
}
impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "servant" => Ok(Role::Servant),
            "master" => Ok(Role::Master),
            other => Err(anyhow!("invalid role {:?}", other)),
        }
    }
}


/// The unit of communication between nodes. `id` is allocated by the sender and pairs a request
///  with its response: a response echoes the request's id.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub msg_type: MessageType,
    pub sender: String,
    pub addressee: String,
    pub id: u64,
    pub content: Value,
}
impl Message {
    pub fn new(msg_type: MessageType, sender: impl Into<String>, addressee: impl Into<String>, id: u64, content: Value) -> Message {
        Message {
            msg_type,
            sender: sender.into(),
            addressee: addressee.into(),
            id,
            content,
        }
    }

    /// a message sent back to this message's sender, with the same id
    pub fn reply(&self, msg_type: MessageType, from: &str, content: Value) -> Message {
        Message {
            msg_type,
            sender: from.to_string(),
            addressee: self.sender.clone(),
            id: self.id,
            content,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::new();
        put_string(&mut body, self.msg_type.as_str());
        put_string(&mut body, &self.sender);
        put_string(&mut body, &self.addressee);
        put_u64_varint(&mut body, self.id);
        // serializing a Value can not fail
        let content = serde_json::to_vec(&self.content).unwrap_or_default();
        put_bytes(&mut body, &content);

        buf.put_u64(checksum(&body));
        buf.extend_from_slice(&body);
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<Message> {
        let mut buf = buf;
        let expected_checksum = try_get_u64(&mut buf)?;
        let actual_checksum = checksum(buf);
        if expected_checksum != actual_checksum {
            return Err(anyhow!("checksum error: expected {:016x}, was {:016x}", expected_checksum, actual_checksum));
        }

        let msg_type = MessageType::from(try_get_string(&mut buf)?.as_str());
        let sender = try_get_string(&mut buf)?;
        let addressee = try_get_string(&mut buf)?;
        let id = try_get_u64_varint(&mut buf)?;
        let content = serde_json::from_slice(&try_get_bytes(&mut buf)?)?;

        if buf.has_remaining() {
            return Err(anyhow!("{} trailing bytes after message", buf.remaining()));
        }

        Ok(Message {
            msg_type,
            sender,
            addressee,
            id,
            content,
        })
    }
}

fn checksum(body: &[u8]) -> u64 {
    Crc::<u64>::new(&crc::CRC_64_REDIS).checksum(body)
}


/// content of the heartbeats the broker broadcasts
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatData {
    pub timestamp_millis: i64,
    pub interval_millis: u64,
}

/// content of a client's answer to a broker heartbeat
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponseData {
    pub role: Role,
    /// the broker's timestamp, echoed back
    pub broker_timestamp_millis: i64,
    pub timestamp_millis: i64,
}

/// convenience for typed content: serialization to a [Value] does not fail for plain data types
pub fn to_content<T: Serialize>(data: &T) -> Value {
    serde_json::to_value(data).unwrap_or(Value::Null)
}

pub fn from_content<T: for<'de> Deserialize<'de>>(content: &Value) -> anyhow::Result<T> {
    Ok(T::deserialize(content)?)
}
