use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace};

use crate::messaging::message::{Message, MessageType};

/// The outcome of a request: `success` is `true` for an `ok` response, and `content` holds the
///  response's content or the reason of a failure.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub success: bool,
    pub content: Value,
}
impl Response {
    pub fn ok(content: Value) -> Response {
        Response {
            success: true,
            content,
        }
    }

    pub fn failed(reason: &str) -> Response {
        Response {
            success: false,
            content: Value::String(reason.to_string()),
        }
    }
}


/// Pairs incoming `ok` / `fail` messages with the requests waiting for them, by message id.
///  Each pending request has a one-shot slot that is completed at most once.
#[derive(Default)]
pub struct ResponseCorrelator {
    pending: Mutex<FxHashMap<u64, oneshot::Sender<Response>>>,
}
impl ResponseCorrelator {
    /// Registers a request before it is sent, so that even an immediate response finds it
    pub async fn register(&self, id: u64) -> oneshot::Receiver<Response> {
        let (send, recv) = oneshot::channel();
        self.pending.lock().await
            .insert(id, send);
        recv
    }

    /// Completes the pending request with the response's id. Returns `false` if there is none,
    ///  e.g. because the request timed out already.
    pub async fn resolve(&self, response: Message) -> bool {
        let slot = self.pending.lock().await
            .remove(&response.id);

        match slot {
            Some(slot) => {
                trace!("response #{} from {}", response.id, response.sender);
                let response = Response {
                    success: response.msg_type == MessageType::Ok,
                    content: response.content,
                };
                // the waiting call may have given up in the meantime
                let _ = slot.send(response);
                true
            }
            None => {
                debug!("no pending request for {} #{} from {} - dropping", response.msg_type, response.id, response.sender);
                false
            }
        }
    }

    pub async fn remove(&self, id: u64) {
        self.pending.lock().await
            .remove(&id);
    }

    pub async fn num_pending(&self) -> usize {
        self.pending.lock().await
            .len()
    }
}
