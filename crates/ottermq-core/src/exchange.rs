//! Exchanges and their binding indexes.

use ottermq_proto::FieldTable;

/// The four AMQP exchange types. Only direct and fanout route here;
/// topic and headers are recognised structurally and hold bindings, but
/// their matching rules are not implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    /// Route on exact routing-key match
    Direct,
    /// Route to every bound queue
    Fanout,
    /// Pattern matching (structural only)
    Topic,
    /// Header matching (structural only)
    Headers,
}

impl ExchangeType {
    /// Parse the wire type string.
    #[must_use]
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "direct" => Some(Self::Direct),
            "fanout" => Some(Self::Fanout),
            "topic" => Some(Self::Topic),
            "headers" => Some(Self::Headers),
            _ => None,
        }
    }

    /// The wire type string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        }
    }
}

/// One binding: a queue attached to this exchange under a routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Target queue name (same vhost by construction)
    pub queue: String,
    /// Routing key; ignored by fanout matching
    pub routing_key: String,
    /// Binding arguments
    pub arguments: FieldTable,
}

/// An exchange and its binding index.
///
/// Bindings are stored as an insertion-ordered list of name pairs; all queue
/// lookups go back through the vhost, so no reference cycle between
/// exchanges and queues can form.
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Exchange name (empty for the default exchange)
    pub name: String,
    /// Exchange type
    pub kind: ExchangeType,
    /// Survive broker restart (stored, not enforced here)
    pub durable: bool,
    /// Deleted when the last binding is removed
    pub auto_delete: bool,
    /// Refuses direct publishes
    pub internal: bool,
    /// Declaration arguments
    pub arguments: FieldTable,
    bindings: Vec<Binding>,
}

impl Exchange {
    /// Create an exchange with no bindings.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        kind: ExchangeType,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        arguments: FieldTable,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            durable,
            auto_delete,
            internal,
            arguments,
            bindings: Vec::new(),
        }
    }

    /// Attributes compared on redeclare (everything but the bindings).
    #[must_use]
    pub fn same_shape(
        &self,
        kind: ExchangeType,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        arguments: &FieldTable,
    ) -> bool {
        self.kind == kind
            && self.durable == durable
            && self.auto_delete == auto_delete
            && self.internal == internal
            && self.arguments == *arguments
    }

    /// Add a binding. Identical bindings are idempotent.
    pub fn bind(&mut self, queue: &str, routing_key: &str, arguments: FieldTable) {
        let exists = self
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !exists {
            self.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
                arguments,
            });
        }
    }

    /// Remove a binding. Returns true if one was removed.
    pub fn unbind(&mut self, queue: &str, routing_key: &str) -> bool {
        let before = self.bindings.len();
        self.bindings.retain(|b| !(b.queue == queue && b.routing_key == routing_key));
        self.bindings.len() != before
    }

    /// Drop every binding that targets `queue` (queue deletion).
    pub fn unbind_queue(&mut self, queue: &str) {
        self.bindings.retain(|b| b.queue != queue);
    }

    /// Queue names this exchange routes `routing_key` to, in binding
    /// insertion order. Fanout ignores the key and dedups queues bound
    /// under several keys.
    #[must_use]
    pub fn route(&self, routing_key: &str) -> Vec<&str> {
        match self.kind {
            ExchangeType::Direct => self
                .bindings
                .iter()
                .filter(|b| b.routing_key == routing_key)
                .map(|b| b.queue.as_str())
                .collect(),
            ExchangeType::Fanout => {
                let mut queues: Vec<&str> = Vec::new();
                for binding in &self.bindings {
                    if !queues.contains(&binding.queue.as_str()) {
                        queues.push(binding.queue.as_str());
                    }
                }
                queues
            },
            // Recognised but not routed
            ExchangeType::Topic | ExchangeType::Headers => Vec::new(),
        }
    }

    /// All bindings, in insertion order.
    #[must_use]
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// True when no bindings remain.
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct() -> Exchange {
        Exchange::new("ex", ExchangeType::Direct, false, false, false, FieldTable::new())
    }

    #[test]
    fn type_strings_round_trip() {
        for kind in
            [ExchangeType::Direct, ExchangeType::Fanout, ExchangeType::Topic, ExchangeType::Headers]
        {
            assert_eq!(ExchangeType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ExchangeType::parse("x-delayed"), None);
    }

    #[test]
    fn direct_routes_by_exact_key_in_insertion_order() {
        let mut ex = direct();
        ex.bind("q2", "rk", FieldTable::new());
        ex.bind("q1", "rk", FieldTable::new());
        ex.bind("q3", "other", FieldTable::new());

        assert_eq!(ex.route("rk"), vec!["q2", "q1"]);
        assert_eq!(ex.route("other"), vec!["q3"]);
        assert!(ex.route("missing").is_empty());
    }

    #[test]
    fn fanout_routes_everything_once() {
        let mut ex =
            Exchange::new("fx", ExchangeType::Fanout, false, false, false, FieldTable::new());
        ex.bind("a", "", FieldTable::new());
        ex.bind("b", "k1", FieldTable::new());
        ex.bind("a", "k2", FieldTable::new());

        assert_eq!(ex.route("anything"), vec!["a", "b"]);
    }

    #[test]
    fn topic_is_structural_only() {
        let mut ex =
            Exchange::new("tx", ExchangeType::Topic, false, false, false, FieldTable::new());
        ex.bind("q", "a.b.*", FieldTable::new());
        assert!(ex.route("a.b.c").is_empty());
        assert_eq!(ex.bindings().len(), 1);
    }

    #[test]
    fn duplicate_bindings_are_idempotent() {
        let mut ex = direct();
        ex.bind("q", "rk", FieldTable::new());
        ex.bind("q", "rk", FieldTable::new());
        assert_eq!(ex.bindings().len(), 1);
    }

    #[test]
    fn unbind_removes_exactly_one_pair() {
        let mut ex = direct();
        ex.bind("q", "rk1", FieldTable::new());
        ex.bind("q", "rk2", FieldTable::new());

        assert!(ex.unbind("q", "rk1"));
        assert!(!ex.unbind("q", "rk1"));
        assert_eq!(ex.route("rk2"), vec!["q"]);
        assert!(ex.route("rk1").is_empty());
    }

    #[test]
    fn unbind_queue_clears_all_keys() {
        let mut ex = direct();
        ex.bind("q", "rk1", FieldTable::new());
        ex.bind("q", "rk2", FieldTable::new());
        ex.bind("other", "rk1", FieldTable::new());

        ex.unbind_queue("q");
        assert_eq!(ex.route("rk1"), vec!["other"]);
        assert!(!ex.is_unused());
    }
}
