//! Write-ahead log collaborator.
//!
//! Persistence is out of scope for the broker itself; this trait is the
//! seam an implementation would plug into. Every state-changing operation
//! appends a record. With [`NoopWal`] (the default) all state is ephemeral.

use std::sync::Mutex;

use thiserror::Error;

use crate::lock_unpoisoned;

/// One state change worth persisting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// A message was enqueued
    MessagePublished {
        /// Vhost name
        vhost: String,
        /// Destination queue
        queue: String,
        /// Message identity, hex form
        message_id: String,
    },
    /// A delivery was acknowledged (or discarded by reject)
    MessageAcked {
        /// Vhost name
        vhost: String,
        /// Source queue
        queue: String,
        /// Message identity, hex form
        message_id: String,
    },
    /// A queue came into existence
    QueueDeclared {
        /// Vhost name
        vhost: String,
        /// Queue name
        queue: String,
    },
    /// An exchange came into existence
    ExchangeDeclared {
        /// Vhost name
        vhost: String,
        /// Exchange name
        exchange: String,
    },
    /// A binding was added or removed
    BindingChanged {
        /// Vhost name
        vhost: String,
        /// Exchange side of the binding
        exchange: String,
        /// Queue side of the binding
        queue: String,
        /// Routing key
        routing_key: String,
        /// True for bind, false for unbind
        bound: bool,
    },
}

/// Errors from a WAL backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalError {
    /// Backend could not persist the record
    #[error("wal append failed: {0}")]
    Append(String),
}

/// Receives broker state changes. Implementations must tolerate being
/// called from any connection task.
pub trait Wal: Send + Sync + 'static {
    /// Persist one record.
    fn append(&self, record: WalRecord) -> Result<(), WalError>;
}

/// The default collaborator: state is ephemeral.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWal;

impl Wal for NoopWal {
    fn append(&self, _record: WalRecord) -> Result<(), WalError> {
        Ok(())
    }
}

/// In-memory WAL that keeps every record, for tests and inspection.
#[derive(Debug, Default)]
pub struct MemoryWal {
    records: Mutex<Vec<WalRecord>>,
}

impl MemoryWal {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything appended so far.
    #[must_use]
    pub fn records(&self) -> Vec<WalRecord> {
        lock_unpoisoned(&self.records).clone()
    }
}

impl Wal for MemoryWal {
    fn append(&self, record: WalRecord) -> Result<(), WalError> {
        lock_unpoisoned(&self.records).push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_wal_keeps_order() {
        let wal = MemoryWal::new();
        wal.append(WalRecord::QueueDeclared { vhost: "/".into(), queue: "q1".into() }).unwrap();
        wal.append(WalRecord::ExchangeDeclared { vhost: "/".into(), exchange: "e1".into() })
            .unwrap();

        let records = wal.records();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], WalRecord::QueueDeclared { .. }));
        assert!(matches!(records[1], WalRecord::ExchangeDeclared { .. }));
    }

    #[test]
    fn noop_wal_accepts_everything() {
        let wal = NoopWal;
        assert!(
            wal.append(WalRecord::MessagePublished {
                vhost: "/".into(),
                queue: "q".into(),
                message_id: "00".into(),
            })
            .is_ok()
        );
    }
}
