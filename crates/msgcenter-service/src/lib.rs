//! Connection lifecycle manager for a message-center client.
//!
//! Keeps at most one live connection to a message-center server, reuses it
//! when identity and token match, and replaces it otherwise. Outbound
//! operations run through a bounded retry loop that reconnects between
//! attempts. The push-notification subscription on the server is kept in
//! line with the user's subscribe and visibility preferences.
//!
//! The wire protocol is not implemented here: the host provides a
//! [`Connector`] that performs the handshake and returns a [`Session`] plus a
//! [`Reader`]. Results and inbound traffic are delivered through a
//! [`Handler`].
//!
//! # Features
//! - Idempotent connect, replacement on identity or token change
//! - Retry with randomized exponential backoff and forced reconnect
//! - Bounded teardown of the reader task
//! - Subscription reconciliation against a persistent store
//! - Command dispatch with one task per request

pub mod client;
pub mod config;
mod dispatch;
mod error;
mod handler;
mod identity;
mod manager;
mod push;
mod reconcile;
mod registry;
pub mod retry;
mod store;

pub use client::{Connector, Established, Message, Reader, Session, SubscribeParams};
pub use config::ServiceConfig;
pub use dispatch::{Command, Dispatcher};
pub use error::{Error, Result};
pub use handler::{Handler, HandlerFactory, SingleHandler};
pub use identity::{ConnectionInfo, ConnectionPreferences, DEFAULT_PORT, Identity, Token};
pub use manager::{ConnState, ConnectionManager};
pub use push::{NoPush, PushRegistrar};
pub use reconcile::{Reconciled, Reconciler};
pub use registry::{Account, Registry};
pub use retry::RetryPolicy;
pub use store::{FileStore, MemoryStore, SubscriptionStore};
