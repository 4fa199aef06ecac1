use serde_json::Value;
use tracing::debug;

use crate::broker::registry::ClientRegistry;
use crate::messaging::message::{Message, MessageType, Role};

pub const REASON_NOT_BROKER: &str = "addressee is not broker";
pub const REASON_UNKNOWN_ADDRESSEE: &str = "addressee unknown";
pub const REASON_NOT_SERVANT: &str = "addressee is not servant";
pub const REASON_INVALID_MESSAGE_TYPE: &str = "invalid message type";

/// Decides what the broker sends in reaction to a (non-heartbeat) message. The broker is a pure
///  router and gatekeeper: it answers `status` itself and forwards everything else unchanged,
///  or rejects it with a `fail` reply to the sender.
///
/// Each returned message is published to its addressee.
pub fn route(broker_name: &str, registry: &ClientRegistry, msg: Message) -> Vec<Message> {
    let msg_type = msg.msg_type.clone();
    match msg_type {
        MessageType::Status => {
            if msg.addressee == broker_name {
                vec![msg.reply(MessageType::Ok, broker_name, registry.snapshot())]
            }
            else {
                vec![reject(broker_name, &msg, REASON_NOT_BROKER)]
            }
        }
        MessageType::Update => {
            // forwarding and acknowledging are independent, the addressee is not checked
            let ack = msg.reply(MessageType::Ok, broker_name, Value::Null);
            debug!("forwarding update from {} to {}", msg.sender, msg.addressee);
            vec![msg, ack]
        }
        MessageType::Ok | MessageType::Fail => {
            // responses are forwarded regardless of the addressee's role
            if registry.get(&msg.addressee).is_some() {
                debug!("forwarding {} from {} to {}", msg.msg_type, msg.sender, msg.addressee);
                vec![msg]
            }
            else {
                vec![reject(broker_name, &msg, REASON_UNKNOWN_ADDRESSEE)]
            }
        }
        MessageType::ListCommands | MessageType::RunCommand => {
            match registry.role_of(&msg.addressee) {
                Some(Role::Servant) => {
                    debug!("forwarding {} from {} to {}", msg.msg_type, msg.sender, msg.addressee);
                    vec![msg]
                }
                Some(_) => vec![reject(broker_name, &msg, REASON_NOT_SERVANT)],
                None => vec![reject(broker_name, &msg, REASON_UNKNOWN_ADDRESSEE)],
            }
        }
        // heartbeats never get here, they go to the heartbeat worker
        MessageType::Heartbeat | MessageType::Unknown(_) => {
            vec![reject(broker_name, &msg, REASON_INVALID_MESSAGE_TYPE)]
        }
    }
}

fn reject(broker_name: &str, msg: &Message, reason: &str) -> Message {
    debug!("rejecting {} message from {} to {}: {}", msg.msg_type, msg.sender, msg.addressee, reason);
    msg.reply(MessageType::Fail, broker_name, Value::String(reason.to_string()))
}
