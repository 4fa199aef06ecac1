use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::messaging::message::Role;
use crate::util::clock::format_timestamp;

/// The broker's view of a connected client. It is rebuilt from heartbeats only, nothing about it
///  survives a broker restart.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientStatus {
    pub role: Role,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    last_heartbeat: Instant,
}
impl ClientStatus {
    fn new(role: Role) -> ClientStatus {
        let now = Utc::now();
        ClientStatus {
            role,
            first_seen: now,
            last_seen: now,
            last_heartbeat: Instant::now(),
        }
    }

    /// time since the most recent heartbeat, based on a monotonic clock
    pub fn since_last_heartbeat(&self) -> Duration {
        self.last_heartbeat.elapsed()
    }

    fn to_content(&self) -> Value {
        json!({
            "role": self.role.as_str(),
            "first_seen": format_timestamp(&self.first_seen),
            "last_seen": format_timestamp(&self.last_seen),
        })
    }
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: BTreeMap<String, ClientStatus>,
}
impl ClientRegistry {
    /// Registers a client on its first heartbeat, refreshes it on every subsequent one. A client
    ///  may change its role between heartbeats, the most recent one wins.
    pub fn on_heartbeat(&mut self, name: &str, role: Role) {
        match self.clients.entry(name.to_string()) {
            Entry::Occupied(mut e) => {
                let status = e.get_mut();
                if status.role != role {
                    warn!("client {} changed its role from {} to {}", name, status.role, role);
                    status.role = role;
                }
                status.last_seen = Utc::now();
                status.last_heartbeat = Instant::now();
            }
            Entry::Vacant(e) => {
                info!("client {} registered as {}", name, role);
                e.insert(ClientStatus::new(role));
            }
        }
    }

    /// removes all clients that did not send a heartbeat for longer than `max_age`, returning
    ///  their names
    pub fn remove_stale(&mut self, max_age: Duration) -> Vec<String> {
        let stale = self.clients.iter()
            .filter(|(_, status)| status.since_last_heartbeat() > max_age)
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();

        for name in &stale {
            if let Some(status) = self.clients.remove(name) {
                warn!("client {} ({}) missed its heartbeats since {} - removing it", name, status.role, format_timestamp(&status.last_seen));
            }
        }
        stale
    }

    pub fn get(&self, name: &str) -> Option<&ClientStatus> {
        self.clients.get(name)
    }

    pub fn role_of(&self, name: &str) -> Option<Role> {
        self.get(name).map(|s| s.role)
    }

    pub fn clients(&self) -> &BTreeMap<String, ClientStatus> {
        &self.clients
    }

    /// the content of a reply to a `status` request: client name -> role and timestamps
    pub fn snapshot(&self) -> Value {
        let clients = self.clients.iter()
            .map(|(name, status)| (name.clone(), status.to_content()))
            .collect::<Map<_, _>>();
        Value::Object(clients)
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::advance;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_clients_registered() {
        let max_age = Duration::from_secs(10);
        let mut registry = ClientRegistry::default();
        registry.on_heartbeat("S1", Role::Servant);

        for _ in 0..10 {
            advance(Duration::from_secs(5)).await;
            registry.on_heartbeat("S1", Role::Servant);
            assert!(registry.remove_stale(max_age).is_empty());
        }
        assert_eq!(registry.role_of("S1"), Some(Role::Servant));

        advance(Duration::from_secs(10)).await;
        assert!(registry.remove_stale(max_age).is_empty());
        advance(Duration::from_millis(1)).await;
        assert_eq!(registry.remove_stale(max_age), vec!["S1".to_string()]);
        assert_eq!(registry.role_of("S1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_stale() {
        let max_age = Duration::from_secs(10);
        let mut registry = ClientRegistry::default();
        registry.on_heartbeat("S1", Role::Servant);
        advance(Duration::from_secs(4)).await;
        registry.on_heartbeat("M1", Role::Master);

        advance(Duration::from_secs(6)).await;
        assert!(registry.remove_stale(max_age).is_empty());

        advance(Duration::from_millis(1)).await;
        assert_eq!(registry.remove_stale(max_age), vec!["S1".to_string()]);
        assert!(registry.get("S1").is_none());
        assert!(registry.get("M1").is_some());

        advance(Duration::from_secs(4)).await;
        assert_eq!(registry.remove_stale(max_age), vec!["M1".to_string()]);
        assert!(registry.clients().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_role_change_and_first_seen() {
        let mut registry = ClientRegistry::default();
        registry.on_heartbeat("N1", Role::Servant);
        let first_seen = registry.get("N1").unwrap().first_seen;

        registry.on_heartbeat("N1", Role::Master);
        let status = registry.get("N1").unwrap();
        assert_eq!(status.role, Role::Master);
        assert_eq!(status.first_seen, first_seen);
        assert!(status.last_seen >= first_seen);
    }

    #[test]
    fn test_snapshot() {
        let mut registry = ClientRegistry::default();
        assert_eq!(registry.snapshot(), json!({}));

        registry.on_heartbeat("S1", Role::Servant);
        registry.on_heartbeat("M1", Role::Master);

        let snapshot = registry.snapshot();
        let s1 = registry.get("S1").unwrap();
        assert_eq!(snapshot["S1"]["role"], json!("servant"));
        assert_eq!(snapshot["S1"]["first_seen"], json!(format_timestamp(&s1.first_seen)));
        assert_eq!(snapshot["S1"]["last_seen"], json!(format_timestamp(&s1.last_seen)));
        assert_eq!(snapshot["M1"]["role"], json!("master"));
        assert_eq!(snapshot.as_object().unwrap().len(), 2);
    }
}
