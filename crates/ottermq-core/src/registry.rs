//! The broker registry: vhosts, the connection table, and the
//! administrative snapshot surface.
//!
//! The registry is the only cross-connection shared state. It is created at
//! startup and passed explicitly to every connection engine; tests spin up
//! isolated instances, there is no global.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

use crate::{
    auth::{Authenticator, PlainAuthenticator},
    config::BrokerConfig,
    error::{AmqpException, ReplyCode},
    lock_unpoisoned, read_unpoisoned,
    vhost::VHost,
    wal::{NoopWal, Wal},
    write_unpoisoned,
};

/// Live state of one connection, kept for the admin surface.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    /// Peer address, e.g. `127.0.0.1:54122`
    pub peer_addr: String,
    /// Vhost opened, once the handshake finishes
    pub vhost: Option<String>,
    /// Authenticated user
    pub user: Option<String>,
    /// Handshake/running/closing, as display text
    pub state: &'static str,
    /// Open channels
    pub channels: usize,
    /// Negotiated `(channel_max, frame_max, heartbeat)`
    pub tuning: (u16, u32, u16),
    /// Seconds since epoch at accept time
    pub connected_at_secs: u64,
    /// Seconds since epoch of the last heartbeat frame received
    pub last_heartbeat_secs: Option<u64>,
}

/// Admin snapshot of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    /// Connection id
    pub id: u64,
    /// Peer address
    pub name: String,
    /// Vhost name, if open
    pub vhost_name: Option<String>,
    /// Authenticated user, if any
    pub username: Option<String>,
    /// Lifecycle state text
    pub state: String,
    /// Always `AMQP 0-9-1`
    pub protocol: &'static str,
    /// Open channel count
    pub channels: usize,
    /// Accept time, seconds since epoch
    pub connected_at: u64,
    /// Last heartbeat received, seconds since epoch
    pub last_heartbeat: Option<u64>,
}

/// Admin snapshot of one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExchangeInfo {
    /// Vhost id
    pub vhost_id: u64,
    /// Vhost name
    pub vhost_name: String,
    /// Exchange name
    pub name: String,
    /// Type string
    pub kind: String,
    /// Declared durable
    pub durable: bool,
    /// Declared auto-delete
    pub auto_delete: bool,
    /// Declared internal
    pub internal: bool,
}

/// Admin snapshot of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    /// Vhost id
    pub vhost_id: u64,
    /// Vhost name
    pub vhost_name: String,
    /// Queue name
    pub name: String,
    /// Ready messages
    pub messages: usize,
    /// Attached consumers
    pub consumers: usize,
    /// Declared durable
    pub durable: bool,
    /// Declared exclusive
    pub exclusive: bool,
    /// Declared auto-delete
    pub auto_delete: bool,
}

/// Admin snapshot of one binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingInfo {
    /// Source exchange
    pub exchange: String,
    /// Bound queue
    pub queue: String,
    /// Routing key
    pub routing_key: String,
}

/// The process-wide broker state.
pub struct Broker {
    config: BrokerConfig,
    auth: Arc<dyn Authenticator>,
    wal: Arc<dyn Wal>,
    vhosts: RwLock<HashMap<String, Arc<VHost>>>,
    connections: Mutex<HashMap<u64, ConnectionEntry>>,
    next_connection_id: AtomicU64,
    next_vhost_id: AtomicU64,
}

impl Broker {
    /// Build a broker with explicit collaborators. The default vhost is
    /// created and the bootstrap user permitted on it.
    #[must_use]
    pub fn new(config: BrokerConfig, auth: Arc<dyn Authenticator>, wal: Arc<dyn Wal>) -> Self {
        let broker = Self {
            config,
            auth,
            wal,
            vhosts: RwLock::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            next_vhost_id: AtomicU64::new(1),
        };

        let default_vhost = broker.config.default_vhost.clone();
        let default_user = broker.config.default_user.clone();
        if let Ok(vhost) = broker.create_vhost(&default_vhost) {
            vhost.permit_user(default_user);
        }
        broker
    }

    /// Build a broker with PLAIN auth seeded from the config and no WAL.
    #[must_use]
    pub fn with_defaults(config: BrokerConfig) -> Arc<Self> {
        let auth = PlainAuthenticator::new()
            .with_user(config.default_user.clone(), config.default_pass.clone());
        Arc::new(Self::new(config, Arc::new(auth), Arc::new(NoopWal)))
    }

    /// Startup configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The authentication collaborator.
    #[must_use]
    pub fn auth(&self) -> &Arc<dyn Authenticator> {
        &self.auth
    }

    /// The WAL collaborator.
    #[must_use]
    pub fn wal(&self) -> &Arc<dyn Wal> {
        &self.wal
    }

    /// Look up a vhost by name.
    #[must_use]
    pub fn vhost(&self, name: &str) -> Option<Arc<VHost>> {
        read_unpoisoned(&self.vhosts).get(name).cloned()
    }

    /// Create a vhost (administrative).
    pub fn create_vhost(&self, name: &str) -> Result<Arc<VHost>, AmqpException> {
        let mut vhosts = write_unpoisoned(&self.vhosts);
        if vhosts.contains_key(name) {
            return Err(AmqpException::connection(
                ReplyCode::PreconditionFailed,
                format!("vhost '{name}' already exists"),
            ));
        }
        let id = self.next_vhost_id.fetch_add(1, Ordering::Relaxed);
        let vhost = Arc::new(VHost::new(id, name));
        vhosts.insert(name.to_string(), Arc::clone(&vhost));
        Ok(vhost)
    }

    /// Delete a vhost (administrative). Only empty vhosts go.
    pub fn delete_vhost(&self, name: &str) -> Result<(), AmqpException> {
        let mut vhosts = write_unpoisoned(&self.vhosts);
        let Some(vhost) = vhosts.get(name) else {
            return Err(AmqpException::connection(
                ReplyCode::NotFound,
                format!("no vhost '{name}'"),
            ));
        };
        if !vhost.is_empty() {
            return Err(AmqpException::connection(
                ReplyCode::PreconditionFailed,
                format!("vhost '{name}' is not empty"),
            ));
        }
        vhosts.remove(name);
        Ok(())
    }

    /// Allocate a connection id and register the accept-time entry.
    pub fn register_connection(&self, peer_addr: impl Into<String>) -> u64 {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let entry = ConnectionEntry {
            peer_addr: peer_addr.into(),
            vhost: None,
            user: None,
            state: "handshake",
            channels: 0,
            tuning: (0, 0, 0),
            connected_at_secs: epoch_secs(),
            last_heartbeat_secs: None,
        };
        lock_unpoisoned(&self.connections).insert(id, entry);
        id
    }

    /// Mutate a connection's admin entry in place.
    pub fn update_connection(&self, id: u64, update: impl FnOnce(&mut ConnectionEntry)) {
        if let Some(entry) = lock_unpoisoned(&self.connections).get_mut(&id) {
            update(entry);
        }
    }

    /// Note a heartbeat frame from the peer.
    pub fn touch_heartbeat(&self, id: u64) {
        self.update_connection(id, |entry| entry.last_heartbeat_secs = Some(epoch_secs()));
    }

    /// Drop a connection's admin entry.
    pub fn unregister_connection(&self, id: u64) {
        lock_unpoisoned(&self.connections).remove(&id);
    }

    /// Open connections, for tests and the admin surface.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        lock_unpoisoned(&self.connections).len()
    }

    /// Admin: snapshot every connection.
    #[must_use]
    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        let connections = lock_unpoisoned(&self.connections);
        let mut list: Vec<ConnectionInfo> = connections
            .iter()
            .map(|(id, entry)| ConnectionInfo {
                id: *id,
                name: entry.peer_addr.clone(),
                vhost_name: entry.vhost.clone(),
                username: entry.user.clone(),
                state: entry.state.to_string(),
                protocol: "AMQP 0-9-1",
                channels: entry.channels,
                connected_at: entry.connected_at_secs,
                last_heartbeat: entry.last_heartbeat_secs,
            })
            .collect();
        list.sort_by_key(|c| c.id);
        list
    }

    /// Admin: snapshot every exchange across vhosts.
    #[must_use]
    pub fn list_exchanges(&self) -> Vec<ExchangeInfo> {
        let vhosts = read_unpoisoned(&self.vhosts);
        let mut list: Vec<ExchangeInfo> = vhosts
            .values()
            .flat_map(|vhost| {
                vhost.exchanges_snapshot().into_iter().map(|ex| ExchangeInfo {
                    vhost_id: vhost.id(),
                    vhost_name: vhost.name().to_string(),
                    name: ex.name.clone(),
                    kind: ex.kind.as_str().to_string(),
                    durable: ex.durable,
                    auto_delete: ex.auto_delete,
                    internal: ex.internal,
                })
            })
            .collect();
        list.sort_by(|a, b| (&a.vhost_name, &a.name).cmp(&(&b.vhost_name, &b.name)));
        list
    }

    /// Admin: snapshot every queue across vhosts.
    #[must_use]
    pub fn list_queues(&self) -> Vec<QueueInfo> {
        let vhosts = read_unpoisoned(&self.vhosts);
        let mut list: Vec<QueueInfo> = vhosts
            .values()
            .flat_map(|vhost| {
                vhost.queues_snapshot().into_iter().map(|queue| QueueInfo {
                    vhost_id: vhost.id(),
                    vhost_name: vhost.name().to_string(),
                    name: queue.name().to_string(),
                    messages: queue.len(),
                    consumers: queue.consumer_count(),
                    durable: queue.attrs().durable,
                    exclusive: queue.attrs().exclusive,
                    auto_delete: queue.attrs().auto_delete,
                })
            })
            .collect();
        list.sort_by(|a, b| (&a.vhost_name, &a.name).cmp(&(&b.vhost_name, &b.name)));
        list
    }

    /// Admin: snapshot one exchange's bindings. `None` if the vhost or
    /// exchange does not exist.
    #[must_use]
    pub fn list_bindings(&self, vhost: &str, exchange: &str) -> Option<Vec<BindingInfo>> {
        let vhost = self.vhost(vhost)?;
        let bindings = vhost.bindings_snapshot(exchange)?;
        Some(
            bindings
                .into_iter()
                .map(|b| BindingInfo {
                    exchange: exchange.to_string(),
                    queue: b.queue,
                    routing_key: b.routing_key,
                })
                .collect(),
        )
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("vhosts", &read_unpoisoned(&self.vhosts).len())
            .field("connections", &lock_unpoisoned(&self.connections).len())
            .finish_non_exhaustive()
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use ottermq_proto::FieldTable;

    use super::*;

    fn broker() -> Arc<Broker> {
        Broker::with_defaults(BrokerConfig::default())
    }

    #[test]
    fn default_vhost_exists_with_bootstrap_user() {
        let broker = broker();
        let vhost = broker.vhost("/").unwrap();
        assert!(vhost.is_permitted("guest"));
        assert!(broker.vhost("ghost").is_none());
    }

    #[test]
    fn duplicate_vhost_rejected() {
        let broker = broker();
        let err = broker.create_vhost("/").unwrap_err();
        assert_eq!(err.code, ReplyCode::PreconditionFailed);
    }

    #[test]
    fn delete_vhost_requires_empty() {
        let broker = broker();
        broker.create_vhost("staging").unwrap();

        let vhost = broker.vhost("staging").unwrap();
        vhost
            .declare_exchange("ex", "direct", false, false, false, false, FieldTable::new())
            .unwrap();

        let err = broker.delete_vhost("staging").unwrap_err();
        assert_eq!(err.code, ReplyCode::PreconditionFailed);

        vhost.delete_exchange("ex", false).unwrap();
        broker.delete_vhost("staging").unwrap();
        assert!(broker.vhost("staging").is_none());
    }

    #[test]
    fn connection_ids_are_unique_and_tracked() {
        let broker = broker();
        let a = broker.register_connection("127.0.0.1:1000");
        let b = broker.register_connection("127.0.0.1:1001");
        assert_ne!(a, b);
        assert_eq!(broker.connection_count(), 2);

        broker.update_connection(a, |entry| {
            entry.state = "running";
            entry.user = Some("guest".into());
        });

        let list = broker.list_connections();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].state, "running");
        assert_eq!(list[0].protocol, "AMQP 0-9-1");

        broker.unregister_connection(a);
        assert_eq!(broker.connection_count(), 1);
    }

    #[test]
    fn exchange_and_queue_snapshots() {
        let broker = broker();
        let vhost = broker.vhost("/").unwrap();
        vhost
            .declare_exchange("ex1", "fanout", false, true, false, false, FieldTable::new())
            .unwrap();
        vhost.declare_queue("q1", false, false, false, false, FieldTable::new(), 1).unwrap();
        vhost.bind_queue("q1", "ex1", "", FieldTable::new(), 1).unwrap();

        let exchanges = broker.list_exchanges();
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].kind, "fanout");
        assert!(exchanges[0].durable);

        let queues = broker.list_queues();
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].name, "q1");
        assert_eq!(queues[0].messages, 0);

        let bindings = broker.list_bindings("/", "ex1").unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].queue, "q1");

        assert!(broker.list_bindings("/", "missing").is_none());
        assert!(broker.list_bindings("nope", "ex1").is_none());
    }
}
