use std::time::Duration;

/// Configuration shared by broker and clients. Ports are named from the broker's perspective:
///  the broker binds `in_port` and `out_port`, clients push to `in_port` and subscribe to
///  `out_port`.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// operator-assigned name, unique within a broker's domain
    pub name: String,

    pub host: String,
    pub in_port: u16,
    pub out_port: u16,

    /// The broker heartbeats at this interval. Clients use the interval advertised by the broker
    ///  once they received a heartbeat.
    pub heartbeat_interval: Duration,
    /// default bound for `send_request`
    pub response_timeout: Duration,
    /// back-off of the receiver loop after a transport error
    pub poll_timeout: Duration,
    /// delay between connection attempts of client sockets
    pub reconnect_interval: Duration,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> NodeConfig {
        NodeConfig {
            name: name.into(),
            host: "127.0.0.1".to_string(),
            in_port: 5555,
            out_port: 5556,
            heartbeat_interval: Duration::from_secs(5),
            response_timeout: Duration::from_secs(10),
            poll_timeout: Duration::from_millis(100),
            reconnect_interval: Duration::from_secs(1),
        }
    }

    pub fn in_addr(&self) -> String {
        format!("{}:{}", self.host, self.in_port)
    }

    pub fn out_addr(&self) -> String {
        format!("{}:{}", self.host, self.out_port)
    }

    /// a node is considered gone if it was not heard from for this long
    pub fn liveness_timeout(&self) -> Duration {
        2 * self.heartbeat_interval
    }
}
