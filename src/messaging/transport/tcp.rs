//! Pub/sub over plain TCP connections. Every frame on the wire is a big-endian u32 length
//!  followed by that many bytes.
//!
//! * The broker's inbound socket accepts any number of pushing clients and merges their frames.
//! * The broker's outbound socket accepts subscribers. A subscriber's first frame lists the topics
//!    it subscribes to; after that, the broker sends it every published frame with a matching
//!    topic, prefixed by the topic.
//! * Clients connect lazily and reconnect when the connection is lost, so they can be started
//!    before the broker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashSet;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::{select, time};
use tracing::{debug, info, trace, warn};

use crate::messaging::transport::{InboundSocket, OutboundSocket, Transport};
use crate::node_config::NodeConfig;
use crate::util::buf::{put_string, put_u64_varint, try_get_string, try_get_u64_varint};


pub const MAX_FRAME_SIZE: usize = 256*1024;

const INBOUND_BUFFER_SIZE: usize = 1024;

pub struct TcpTransport {
    in_addr: String,
    out_addr: String,
    reconnect_interval: Duration,
}
impl TcpTransport {
    pub fn new(config: &NodeConfig) -> TcpTransport {
        TcpTransport {
            in_addr: config.in_addr(),
            out_addr: config.out_addr(),
            reconnect_interval: config.reconnect_interval,
        }
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn bind_in(&self) -> anyhow::Result<Box<dyn InboundSocket>> {
        let listener = TcpListener::bind(&self.in_addr).await?;
        info!("inbound socket listening on {}", self.in_addr);

        let (send, recv) = mpsc::channel(INBOUND_BUFFER_SIZE);
        let accept_task = tokio::spawn(accept_pushing_clients(listener, send));
        Ok(Box::new(TcpPullSocket {
            frames: recv,
            accept_task,
        }))
    }

    async fn bind_out(&self) -> anyhow::Result<Box<dyn OutboundSocket>> {
        let listener = TcpListener::bind(&self.out_addr).await?;
        info!("outbound socket listening on {}", self.out_addr);

        let subscribers: Arc<Mutex<Vec<Subscriber>>> = Default::default();
        let accept_task = tokio::spawn(accept_subscribers(listener, subscribers.clone()));
        Ok(Box::new(TcpPublishSocket {
            subscribers,
            accept_task,
        }))
    }

    async fn connect_in(&self, topics: &[String]) -> anyhow::Result<Box<dyn InboundSocket>> {
        let (send, recv) = mpsc::channel(INBOUND_BUFFER_SIZE);
        let connect_task = tokio::spawn(run_subscription(self.out_addr.clone(), topics.to_vec(), self.reconnect_interval, send));
        Ok(Box::new(TcpSubscribeSocket {
            frames: recv,
            connect_task,
        }))
    }

    async fn connect_out(&self) -> anyhow::Result<Box<dyn OutboundSocket>> {
        Ok(Box::new(TcpPushSocket {
            addr: self.in_addr.clone(),
            stream: None,
        }))
    }
}


async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> anyhow::Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(anyhow!("frame of {} bytes exceeds the maximum of {} bytes", payload.len(), MAX_FRAME_SIZE));
    }
    w.write_u32(payload.len() as u32).await?;
    w.write_all(payload).await?;
    w.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<Bytes> {
    let len = r.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(anyhow!("announced frame of {} bytes exceeds the maximum of {} bytes", len, MAX_FRAME_SIZE));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf.into())
}

fn ser_subscription(topics: &[String]) -> BytesMut {
    let mut buf = BytesMut::new();
    put_u64_varint(&mut buf, topics.len() as u64);
    for topic in topics {
        put_string(&mut buf, topic);
    }
    buf
}

fn deser_subscription(mut buf: &[u8]) -> anyhow::Result<FxHashSet<String>> {
    let num_topics = try_get_u64_varint(&mut buf)?;
    let mut result = FxHashSet::default();
    for _ in 0..num_topics {
        result.insert(try_get_string(&mut buf)?);
    }
    Ok(result)
}


struct TcpPullSocket {
    frames: mpsc::Receiver<Bytes>,
    accept_task: JoinHandle<()>,
}
impl Drop for TcpPullSocket {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait::async_trait]
impl InboundSocket for TcpPullSocket {
    async fn recv(&mut self) -> anyhow::Result<Bytes> {
        self.frames.recv().await
            .ok_or_else(|| anyhow!("inbound socket is closed"))
    }
}

async fn accept_pushing_clients(listener: TcpListener, frames: mpsc::Sender<Bytes>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("accepted inbound connection from {:?}", peer);
                tokio::spawn(read_pushed_frames(stream, peer, frames.clone()));
            }
            Err(e) => {
                warn!("error accepting inbound connection: {}", e);
            }
        }
    }
}

async fn read_pushed_frames(mut stream: TcpStream, peer: SocketAddr, frames: mpsc::Sender<Bytes>) {
    loop {
        select! {
            _ = frames.closed() => break,
            frame = read_frame(&mut stream) => {
                match frame {
                    Ok(frame) => {
                        trace!("received frame of {} bytes from {:?}", frame.len(), peer);
                        if frames.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("inbound connection from {:?} closed: {}", peer, e);
                        break;
                    }
                }
            }
        }
    }
}


struct Subscriber {
    peer: SocketAddr,
    topics: FxHashSet<String>,
    frames: mpsc::UnboundedSender<Bytes>,
}

struct TcpPublishSocket {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    accept_task: JoinHandle<()>,
}
impl Drop for TcpPublishSocket {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait::async_trait]
impl OutboundSocket for TcpPublishSocket {
    async fn send(&mut self, addressee: &str, payload: Bytes) -> anyhow::Result<()> {
        let mut frame = BytesMut::new();
        put_string(&mut frame, addressee);
        frame.extend_from_slice(&payload);
        let frame = frame.freeze();

        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|s| {
            if !s.topics.contains(addressee) {
                return !s.frames.is_closed();
            }
            match s.frames.send(frame.clone()) {
                Ok(()) => true,
                Err(_) => {
                    debug!("subscriber {:?} is gone", s.peer);
                    false
                }
            }
        });
        Ok(())
    }
}

async fn accept_subscribers(listener: TcpListener, subscribers: Arc<Mutex<Vec<Subscriber>>>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("accepted subscriber connection from {:?}", peer);
                tokio::spawn(serve_subscriber(stream, peer, subscribers.clone()));
            }
            Err(e) => {
                warn!("error accepting subscriber connection: {}", e);
            }
        }
    }
}

async fn serve_subscriber(mut stream: TcpStream, peer: SocketAddr, subscribers: Arc<Mutex<Vec<Subscriber>>>) {
    let topics = match read_frame(&mut stream).await
        .and_then(|frame| deser_subscription(&frame))
    {
        Ok(topics) => topics,
        Err(e) => {
            warn!("invalid subscription from {:?} - closing connection: {}", peer, e);
            return;
        }
    };
    debug!("{:?} subscribed to {:?}", peer, topics);

    let (send, mut recv) = mpsc::unbounded_channel::<Bytes>();
    subscribers.lock().await
        .push(Subscriber {
            peer,
            topics,
            frames: send,
        });

    while let Some(frame) = recv.recv().await {
        if let Err(e) = write_frame(&mut stream, &frame).await {
            debug!("subscriber connection to {:?} closed: {}", peer, e);
            break;
        }
    }
}


struct TcpSubscribeSocket {
    frames: mpsc::Receiver<Bytes>,
    connect_task: JoinHandle<()>,
}
impl Drop for TcpSubscribeSocket {
    fn drop(&mut self) {
        self.connect_task.abort();
    }
}

#[async_trait::async_trait]
impl InboundSocket for TcpSubscribeSocket {
    async fn recv(&mut self) -> anyhow::Result<Bytes> {
        self.frames.recv().await
            .ok_or_else(|| anyhow!("subscription is closed"))
    }
}

async fn run_subscription(addr: String, topics: Vec<String>, reconnect_interval: Duration, frames: mpsc::Sender<Bytes>) {
    let subscription = ser_subscription(&topics);

    while !frames.is_closed() {
        match TcpStream::connect(&addr).await {
            Ok(mut stream) => {
                debug!("connected to {} for topics {:?}", addr, topics);
                if let Err(e) = receive_subscribed_frames(&mut stream, &subscription, &topics, &frames).await {
                    debug!("subscription connection to {} lost: {}", addr, e);
                }
            }
            Err(e) => {
                trace!("could not connect to {}: {}", addr, e);
            }
        }
        time::sleep(reconnect_interval).await;
    }
}

async fn receive_subscribed_frames(stream: &mut TcpStream, subscription: &[u8], topics: &[String], frames: &mpsc::Sender<Bytes>) -> anyhow::Result<()> {
    write_frame(stream, subscription).await?;
    loop {
        let frame = read_frame(stream).await?;
        let mut buf: &[u8] = &frame;
        let topic = try_get_string(&mut buf)?;
        if !topics.contains(&topic) {
            warn!("received frame for topic {:?} without subscribing to it - ignoring", topic);
            continue;
        }

        frames.send(Bytes::copy_from_slice(buf)).await?;
    }
}


struct TcpPushSocket {
    addr: String,
    stream: Option<TcpStream>,
}

#[async_trait::async_trait]
impl OutboundSocket for TcpPushSocket {
    async fn send(&mut self, _addressee: &str, payload: Bytes) -> anyhow::Result<()> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                let stream = TcpStream::connect(&self.addr).await?;
                debug!("connected to {}", self.addr);
                stream
            }
        };

        // a failed connection is dropped, the next send reconnects
        write_frame(&mut stream, &payload).await?;
        self.stream = Some(stream);
        Ok(())
    }
}
