//! Sans-IO broker core.
//!
//! Everything stateful about the AMQP broker lives here, with no sockets
//! and no async: the server crate feeds decoded frames and `Instant`s into
//! [`connection::ConnectionEngine`] and writes out whatever lands in the
//! connection's outbound mailbox. Tests drive the same engines directly.
//!
//! # Components
//!
//! - [`connection`]: per-connection handshake, dispatch and teardown
//! - [`channel`]: content assembly, consumers, delivery tags and prefetch
//! - [`registry`]: the broker-wide vhost and connection tables
//! - [`vhost`] / [`exchange`] / [`queue`]: the routing data model
//! - [`auth`] / [`wal`]: collaborator seams (PLAIN login, persistence)
//!
//! # Locking
//!
//! Lock order is `vhost > exchange > queue > channel-link`, never
//! reversed. Exchanges have no lock of their own (the vhost lock covers
//! them); queues and channel links are leaf mutexes. Poisoned locks are
//! recovered, not propagated: a panicking connection task must not take
//! the broker down with it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod channel;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod exchange;
pub mod message;
pub mod queue;
pub mod registry;
pub mod vhost;
pub mod wal;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use auth::{AuthError, Authenticator, PlainAuthenticator, User};
pub use channel::{ChannelEngine, ChannelInput, ChannelLink, UnackedRecord};
pub use config::BrokerConfig;
pub use connection::{ConnectionAction, ConnectionEngine, ConnectionState, Tuning};
pub use error::{AmqpException, ErrorScope, ReplyCode};
pub use exchange::{Binding, Exchange, ExchangeType};
pub use message::{Message, MessageId};
pub use queue::{Consumer, Queue, QueueAttrs};
pub use registry::{
    BindingInfo, Broker, ConnectionEntry, ConnectionInfo, ExchangeInfo, QueueInfo,
};
pub use vhost::{RouteResult, VHost};
pub use wal::{MemoryWal, NoopWal, Wal, WalError, WalRecord};

/// Lock a mutex, recovering from poisoning instead of propagating it.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared-lock an `RwLock`, recovering from poisoning.
pub(crate) fn read_unpoisoned<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive-lock an `RwLock`, recovering from poisoning.
pub(crate) fn write_unpoisoned<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
