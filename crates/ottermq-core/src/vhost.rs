//! Virtual hosts: the namespace owning exchanges, queues and bindings.
//!
//! One `RwLock` guards a vhost's exchange and queue tables; writers
//! (declare, delete, bind, unbind) take it exclusively, routing takes it
//! shared. Queue mutexes nest under the vhost lock (lock order
//! `vhost > exchange > queue`, never reversed); queue dispatch never takes
//! a vhost lock.
//!
//! The default exchange is not stored: publishing through the empty name
//! resolves the routing key directly as a queue name, which is exactly the
//! auto-bind-every-queue-to-its-own-name semantics without the bookkeeping.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use ottermq_proto::FieldTable;

use crate::{
    error::{AmqpException, ReplyCode},
    exchange::{Binding, Exchange, ExchangeType},
    queue::{Queue, QueueAttrs},
    read_unpoisoned, write_unpoisoned,
};

/// Outcome of resolving a publish against the binding index.
#[derive(Debug)]
pub enum RouteResult {
    /// Enqueue to these queues, in binding insertion order
    Routed(Vec<Arc<Queue>>),
    /// The exchange exists but nothing matched
    NoRoute,
    /// No such exchange
    NoExchange,
}

#[derive(Debug, Default)]
struct VHostInner {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Arc<Queue>>,
}

/// A named namespace of exchanges and queues with its permitted users.
#[derive(Debug)]
pub struct VHost {
    id: u64,
    name: String,
    users: RwLock<HashSet<String>>,
    inner: RwLock<VHostInner>,
}

impl VHost {
    /// Create an empty vhost.
    #[must_use]
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            users: RwLock::new(HashSet::new()),
            inner: RwLock::new(VHostInner::default()),
        }
    }

    /// Stable vhost id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Human name, e.g. `/`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allow `user` to open connections against this vhost.
    pub fn permit_user(&self, user: impl Into<String>) {
        write_unpoisoned(&self.users).insert(user.into());
    }

    /// Whether `user` may use this vhost.
    #[must_use]
    pub fn is_permitted(&self, user: &str) -> bool {
        read_unpoisoned(&self.users).contains(user)
    }

    /// True when the vhost holds no exchanges or queues (deletable).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let inner = read_unpoisoned(&self.inner);
        inner.exchanges.is_empty() && inner.queues.is_empty()
    }

    /// `exchange.declare` semantics.
    pub fn declare_exchange(
        &self,
        name: &str,
        kind: &str,
        passive: bool,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        arguments: FieldTable,
    ) -> Result<(), AmqpException> {
        if name.is_empty() || name.starts_with("amq.") {
            return Err(AmqpException::channel(
                ReplyCode::AccessRefused,
                format!("exchange name '{name}' is reserved"),
            ));
        }

        let Some(kind) = ExchangeType::parse(kind) else {
            return Err(AmqpException::channel(
                ReplyCode::CommandInvalid,
                format!("unknown exchange type '{kind}'"),
            ));
        };

        let mut inner = write_unpoisoned(&self.inner);
        match inner.exchanges.get(name) {
            Some(existing) => {
                if existing.same_shape(kind, durable, auto_delete, internal, &arguments) {
                    Ok(())
                } else {
                    Err(AmqpException::channel(
                        ReplyCode::PreconditionFailed,
                        format!("exchange '{name}' exists with different properties"),
                    ))
                }
            },
            None if passive => Err(AmqpException::channel(
                ReplyCode::NotFound,
                format!("no exchange '{name}' in vhost '{}'", self.name),
            )),
            None => {
                inner.exchanges.insert(
                    name.to_string(),
                    Exchange::new(name, kind, durable, auto_delete, internal, arguments),
                );
                Ok(())
            },
        }
    }

    /// `exchange.delete` semantics.
    pub fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<(), AmqpException> {
        let mut inner = write_unpoisoned(&self.inner);
        let Some(exchange) = inner.exchanges.get(name) else {
            return Err(AmqpException::channel(
                ReplyCode::NotFound,
                format!("no exchange '{name}' in vhost '{}'", self.name),
            ));
        };
        if if_unused && !exchange.is_unused() {
            return Err(AmqpException::channel(
                ReplyCode::PreconditionFailed,
                format!("exchange '{name}' still has bindings"),
            ));
        }
        inner.exchanges.remove(name);
        Ok(())
    }

    /// `queue.declare` semantics. Returns `(name, message_count,
    /// consumer_count)` for the Declare-Ok.
    pub fn declare_queue(
        &self,
        name: &str,
        passive: bool,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        arguments: FieldTable,
        connection_id: u64,
    ) -> Result<(String, u32, u32), AmqpException> {
        if name.starts_with("amq.") {
            return Err(AmqpException::channel(
                ReplyCode::AccessRefused,
                format!("queue name '{name}' is reserved"),
            ));
        }

        let mut inner = write_unpoisoned(&self.inner);

        if !name.is_empty() {
            if let Some(existing) = inner.queues.get(name) {
                existing.check_access(connection_id)?;
                let attrs = existing.attrs();
                if !(attrs.durable == durable
                    && attrs.exclusive == exclusive
                    && attrs.auto_delete == auto_delete
                    && attrs.arguments == arguments)
                {
                    return Err(AmqpException::channel(
                        ReplyCode::PreconditionFailed,
                        format!("queue '{name}' exists with different properties"),
                    ));
                }
                return Ok((
                    name.to_string(),
                    existing.len() as u32,
                    existing.consumer_count() as u32,
                ));
            }
        }

        if passive {
            return Err(AmqpException::channel(
                ReplyCode::NotFound,
                format!("no queue '{name}' in vhost '{}'", self.name),
            ));
        }

        let name = if name.is_empty() { generated_queue_name() } else { name.to_string() };
        let attrs = QueueAttrs { durable, exclusive, auto_delete, arguments };
        let owner = exclusive.then_some(connection_id);
        inner.queues.insert(name.clone(), Arc::new(Queue::new(name.clone(), attrs, owner)));
        Ok((name, 0, 0))
    }

    /// `queue.bind` semantics.
    pub fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
        connection_id: u64,
    ) -> Result<(), AmqpException> {
        if exchange.is_empty() {
            return Err(AmqpException::channel(
                ReplyCode::AccessRefused,
                "cannot bind to the default exchange",
            ));
        }

        let mut inner = write_unpoisoned(&self.inner);
        let Some(target) = inner.queues.get(queue) else {
            return Err(AmqpException::channel(
                ReplyCode::NotFound,
                format!("no queue '{queue}' in vhost '{}'", self.name),
            ));
        };
        target.check_access(connection_id)?;

        let Some(ex) = inner.exchanges.get_mut(exchange) else {
            return Err(AmqpException::channel(
                ReplyCode::NotFound,
                format!("no exchange '{exchange}' in vhost '{}'", self.name),
            ));
        };
        ex.bind(queue, routing_key, arguments);
        Ok(())
    }

    /// `queue.unbind` semantics.
    pub fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpException> {
        let mut inner = write_unpoisoned(&self.inner);
        let Some(ex) = inner.exchanges.get_mut(exchange) else {
            return Err(AmqpException::channel(
                ReplyCode::NotFound,
                format!("no exchange '{exchange}' in vhost '{}'", self.name),
            ));
        };
        if !ex.unbind(queue, routing_key) {
            return Err(AmqpException::channel(
                ReplyCode::NotFound,
                format!("no binding {exchange} -> {queue} under '{routing_key}'"),
            ));
        }
        if ex.auto_delete && ex.is_unused() {
            inner.exchanges.remove(exchange);
        }
        Ok(())
    }

    /// `queue.purge` semantics. Returns how many messages were dropped.
    pub fn purge_queue(&self, name: &str, connection_id: u64) -> Result<u32, AmqpException> {
        let queue = self.queue(name).ok_or_else(|| {
            AmqpException::channel(
                ReplyCode::NotFound,
                format!("no queue '{name}' in vhost '{}'", self.name),
            )
        })?;
        queue.check_access(connection_id)?;
        Ok(queue.purge())
    }

    /// `queue.delete` semantics. Returns the number of messages discarded.
    pub fn delete_queue(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
        connection_id: u64,
    ) -> Result<u32, AmqpException> {
        let mut inner = write_unpoisoned(&self.inner);
        let Some(queue) = inner.queues.get(name) else {
            return Err(AmqpException::channel(
                ReplyCode::NotFound,
                format!("no queue '{name}' in vhost '{}'", self.name),
            ));
        };
        queue.check_access(connection_id)?;

        if if_unused && queue.consumer_count() > 0 {
            return Err(AmqpException::channel(
                ReplyCode::PreconditionFailed,
                format!("queue '{name}' still has consumers"),
            ));
        }
        if if_empty && !queue.is_empty() {
            return Err(AmqpException::channel(
                ReplyCode::PreconditionFailed,
                format!("queue '{name}' is not empty"),
            ));
        }

        let message_count = queue.len() as u32;
        inner.queues.remove(name);
        Self::unbind_everywhere(&mut inner, name);
        Ok(message_count)
    }

    fn unbind_everywhere(inner: &mut VHostInner, queue: &str) {
        let mut emptied = Vec::new();
        for (name, exchange) in &mut inner.exchanges {
            exchange.unbind_queue(queue);
            if exchange.auto_delete && exchange.is_unused() {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            inner.exchanges.remove(&name);
        }
    }

    /// Look up a queue.
    #[must_use]
    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        read_unpoisoned(&self.inner).queues.get(name).cloned()
    }

    /// Resolve a publish to its destination queues.
    ///
    /// The empty exchange name is the default exchange: the routing key is
    /// the queue name.
    ///
    /// # Errors
    ///
    /// 403 ACCESS-REFUSED when publishing directly to an internal exchange.
    pub fn route(&self, exchange: &str, routing_key: &str) -> Result<RouteResult, AmqpException> {
        let inner = read_unpoisoned(&self.inner);

        if exchange.is_empty() {
            return Ok(match inner.queues.get(routing_key) {
                Some(queue) => RouteResult::Routed(vec![Arc::clone(queue)]),
                None => RouteResult::NoRoute,
            });
        }

        let Some(ex) = inner.exchanges.get(exchange) else {
            return Ok(RouteResult::NoExchange);
        };
        if ex.internal {
            return Err(AmqpException::channel(
                ReplyCode::AccessRefused,
                format!("exchange '{exchange}' is internal"),
            ));
        }

        let queues: Vec<Arc<Queue>> = ex
            .route(routing_key)
            .iter()
            .filter_map(|name| inner.queues.get(*name).cloned())
            .collect();

        if queues.is_empty() { Ok(RouteResult::NoRoute) } else { Ok(RouteResult::Routed(queues)) }
    }

    /// Delete the exclusive queues owned by a closing connection. Returns
    /// their names.
    pub fn remove_connection(&self, connection_id: u64) -> Vec<String> {
        let mut inner = write_unpoisoned(&self.inner);
        let doomed: Vec<String> = inner
            .queues
            .values()
            .filter(|q| q.owner() == Some(connection_id))
            .map(|q| q.name().to_string())
            .collect();
        for name in &doomed {
            inner.queues.remove(name);
            Self::unbind_everywhere(&mut inner, name);
        }
        doomed
    }

    /// Delete `name` if it is auto-delete and its last consumer just
    /// detached. Returns true if the queue was removed.
    pub fn reap_auto_delete(&self, name: &str) -> bool {
        let mut inner = write_unpoisoned(&self.inner);
        let Some(queue) = inner.queues.get(name) else { return false };
        if !queue.attrs().auto_delete || queue.consumer_count() > 0 {
            return false;
        }
        inner.queues.remove(name);
        Self::unbind_everywhere(&mut inner, name);
        true
    }

    /// Snapshot of all exchanges (without bindings), for the admin surface.
    #[must_use]
    pub fn exchanges_snapshot(&self) -> Vec<Exchange> {
        read_unpoisoned(&self.inner).exchanges.values().cloned().collect()
    }

    /// Snapshot of one exchange's bindings.
    #[must_use]
    pub fn bindings_snapshot(&self, exchange: &str) -> Option<Vec<Binding>> {
        read_unpoisoned(&self.inner).exchanges.get(exchange).map(|ex| ex.bindings().to_vec())
    }

    /// Snapshot of all queues, for the admin surface.
    #[must_use]
    pub fn queues_snapshot(&self) -> Vec<Arc<Queue>> {
        read_unpoisoned(&self.inner).queues.values().cloned().collect()
    }
}

/// Server-generated queue name, in the `amq.gen-` namespace clients cannot
/// declare into.
///
/// # Panics
///
/// Panics if the OS RNG fails.
#[allow(clippy::expect_used)]
fn generated_queue_name() -> String {
    let mut bytes = [0u8; 8];
    getrandom::fill(&mut bytes).expect("invariant: OS RNG failure is unrecoverable");
    let mut name = String::with_capacity(24);
    name.push_str("amq.gen-");
    for byte in bytes {
        let _ = std::fmt::Write::write_fmt(&mut name, format_args!("{byte:02x}"));
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vhost() -> VHost {
        VHost::new(1, "/")
    }

    fn declare_direct(vh: &VHost, name: &str) {
        vh.declare_exchange(name, "direct", false, false, false, false, FieldTable::new())
            .unwrap();
    }

    fn declare_plain_queue(vh: &VHost, name: &str) {
        vh.declare_queue(name, false, false, false, false, FieldTable::new(), 1).unwrap();
    }

    #[test]
    fn declare_is_idempotent_for_identical_shape() {
        let vh = vhost();
        declare_direct(&vh, "ex1");
        declare_direct(&vh, "ex1");
        assert_eq!(vh.exchanges_snapshot().len(), 1);
    }

    #[test]
    fn declare_mismatch_is_precondition_failed() {
        let vh = vhost();
        declare_direct(&vh, "ex1");
        let err = vh
            .declare_exchange("ex1", "fanout", false, false, false, false, FieldTable::new())
            .unwrap_err();
        assert_eq!(err.code, ReplyCode::PreconditionFailed);
    }

    #[test]
    fn passive_declare_of_missing_exchange_is_not_found() {
        let vh = vhost();
        let err = vh
            .declare_exchange("ghost", "direct", true, false, false, false, FieldTable::new())
            .unwrap_err();
        assert_eq!(err.code, ReplyCode::NotFound);
    }

    #[test]
    fn reserved_exchange_names_are_refused() {
        let vh = vhost();
        for name in ["", "amq.direct"] {
            let err = vh
                .declare_exchange(name, "direct", false, false, false, false, FieldTable::new())
                .unwrap_err();
            assert_eq!(err.code, ReplyCode::AccessRefused);
        }
    }

    #[test]
    fn unknown_exchange_type_is_command_invalid() {
        let vh = vhost();
        let err = vh
            .declare_exchange("ex", "quantum", false, false, false, false, FieldTable::new())
            .unwrap_err();
        assert_eq!(err.code, ReplyCode::CommandInvalid);
    }

    #[test]
    fn queue_declare_generates_a_name_when_empty() {
        let vh = vhost();
        let (name, messages, consumers) = vh
            .declare_queue("", false, false, false, false, FieldTable::new(), 1)
            .unwrap();
        assert!(name.starts_with("amq.gen-"));
        assert_eq!((messages, consumers), (0, 0));
        assert!(vh.queue(&name).is_some());
    }

    #[test]
    fn queue_redeclare_reports_counts() {
        let vh = vhost();
        declare_plain_queue(&vh, "q1");
        let queue = vh.queue("q1").unwrap();
        queue.publish(
            crate::message::Message::new("", "q1", ottermq_proto::BasicProperties::default(), "x"),
            std::time::Instant::now(),
        );

        let (_, messages, _) = vh
            .declare_queue("q1", true, false, false, false, FieldTable::new(), 1)
            .unwrap();
        assert_eq!(messages, 1);
    }

    #[test]
    fn exclusive_queue_is_locked_to_its_owner() {
        let vh = vhost();
        vh.declare_queue("qx", false, false, true, false, FieldTable::new(), 1).unwrap();

        let err = vh
            .declare_queue("qx", false, false, true, false, FieldTable::new(), 2)
            .unwrap_err();
        assert_eq!(err.code, ReplyCode::ResourceLocked);
    }

    #[test]
    fn bind_requires_both_ends() {
        let vh = vhost();
        declare_direct(&vh, "ex1");
        let err =
            vh.bind_queue("ghost", "ex1", "rk", FieldTable::new(), 1).unwrap_err();
        assert_eq!(err.code, ReplyCode::NotFound);

        declare_plain_queue(&vh, "q1");
        let err =
            vh.bind_queue("q1", "ghost", "rk", FieldTable::new(), 1).unwrap_err();
        assert_eq!(err.code, ReplyCode::NotFound);

        vh.bind_queue("q1", "ex1", "rk", FieldTable::new(), 1).unwrap();
    }

    #[test]
    fn route_direct_and_default_exchange() {
        let vh = vhost();
        declare_direct(&vh, "ex1");
        declare_plain_queue(&vh, "q1");
        vh.bind_queue("q1", "ex1", "rk1", FieldTable::new(), 1).unwrap();

        match vh.route("ex1", "rk1").unwrap() {
            RouteResult::Routed(queues) => {
                assert_eq!(queues.len(), 1);
                assert_eq!(queues[0].name(), "q1");
            },
            other => panic!("expected route, got {other:?}"),
        }

        // Default exchange: routing key is the queue name
        assert!(matches!(vh.route("", "q1").unwrap(), RouteResult::Routed(_)));
        assert!(matches!(vh.route("", "missing").unwrap(), RouteResult::NoRoute));
        assert!(matches!(vh.route("ghost", "rk").unwrap(), RouteResult::NoExchange));
    }

    #[test]
    fn internal_exchange_refuses_direct_publish() {
        let vh = vhost();
        vh.declare_exchange("int", "direct", false, false, false, true, FieldTable::new())
            .unwrap();
        let err = vh.route("int", "rk").unwrap_err();
        assert_eq!(err.code, ReplyCode::AccessRefused);
    }

    #[test]
    fn delete_queue_drops_its_bindings() {
        let vh = vhost();
        declare_direct(&vh, "ex1");
        declare_plain_queue(&vh, "q1");
        vh.bind_queue("q1", "ex1", "rk", FieldTable::new(), 1).unwrap();

        vh.delete_queue("q1", false, false, 1).unwrap();
        assert!(matches!(vh.route("ex1", "rk").unwrap(), RouteResult::NoRoute));
    }

    #[test]
    fn delete_queue_if_empty_guard() {
        let vh = vhost();
        declare_plain_queue(&vh, "q1");
        vh.queue("q1").unwrap().publish(
            crate::message::Message::new("", "q1", ottermq_proto::BasicProperties::default(), "x"),
            std::time::Instant::now(),
        );

        let err = vh.delete_queue("q1", false, true, 1).unwrap_err();
        assert_eq!(err.code, ReplyCode::PreconditionFailed);

        assert_eq!(vh.delete_queue("q1", false, false, 1).unwrap(), 1);
    }

    #[test]
    fn unbind_missing_binding_is_not_found() {
        let vh = vhost();
        declare_direct(&vh, "ex1");
        declare_plain_queue(&vh, "q1");
        let err = vh.unbind_queue("q1", "ex1", "rk").unwrap_err();
        assert_eq!(err.code, ReplyCode::NotFound);
    }

    #[test]
    fn remove_connection_reaps_exclusive_queues() {
        let vh = vhost();
        vh.declare_queue("mine", false, false, true, false, FieldTable::new(), 7).unwrap();
        declare_plain_queue(&vh, "shared");

        let doomed = vh.remove_connection(7);
        assert_eq!(doomed, vec!["mine".to_string()]);
        assert!(vh.queue("mine").is_none());
        assert!(vh.queue("shared").is_some());
    }

    #[test]
    fn vhost_permissions() {
        let vh = vhost();
        assert!(!vh.is_permitted("guest"));
        vh.permit_user("guest");
        assert!(vh.is_permitted("guest"));
    }
}
