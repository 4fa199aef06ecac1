use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::{select, time};
use tracing::{debug, info, trace, warn};

use crate::messaging::message::Message;
use crate::messaging::transport::InboundSocket;
use crate::util::shutdown::Shutdown;


/// Node specific handling of received messages.
///
/// This is called from the central receive loop, holding it up until it returns. Non-trivial
///  work should be offloaded, and in particular an implementation must not wait for another
///  message to arrive.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, msg: Message);
}

/// Reads frames until shutdown, decodes them and hands them to the dispatcher. Transport errors
///  are not fatal: they are treated as 'nothing to read right now', and the loop retries after
///  `poll_timeout`.
#[tracing::instrument(name="receiver", skip_all, fields(node=%node_name))]
pub async fn run_receiver(
    node_name: String,
    mut socket: Box<dyn InboundSocket>,
    dispatcher: Arc<dyn MessageDispatcher>,
    poll_timeout: Duration,
    mut shutdown: Shutdown,
) {
    loop {
        select! {
            biased;
            _ = shutdown.wait() => break,
            frame = socket.recv() => {
                match frame {
                    Ok(frame) => {
                        match Message::deser(&frame) {
                            Ok(msg) => {
                                trace!(msg_type=%msg.msg_type, from=%msg.sender, id=msg.id, "received message");
                                dispatcher.on_message(msg).await;
                            }
                            Err(e) => {
                                warn!("received an invalid frame - discarding: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        debug!("error receiving: {}", e);
                        select! {
                            _ = shutdown.wait() => break,
                            _ = time::sleep(poll_timeout) => {}
                        }
                    }
                }
            }
        }
    }
    info!("receiver terminated");
}
