//! Seams to the external message-center client library.
//!
//! The protocol handshake, framing and encryption live behind these traits;
//! this crate only decides when to call them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::handler::Handler;
use crate::identity::{Identity, Token};

/// Opaque application message: a header map and a body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub header: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl Message {
    pub fn with_body(body: impl Into<Vec<u8>>) -> Self {
        Self {
            header: BTreeMap::new(),
            body: body.into(),
        }
    }
}

/// Parameters of a push subscribe/unsubscribe call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeParams {
    pub push_service_type: String,
    pub service: String,
    pub subscriber: String,
    pub reg_id: String,
}

impl SubscribeParams {
    /// Flatten into the key/value form the server expects.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("pushservicetype".to_string(), self.push_service_type.clone()),
            ("service".to_string(), self.service.clone()),
            ("subscriber".to_string(), self.subscriber.clone()),
            ("regid".to_string(), self.reg_id.clone()),
        ])
    }
}

/// Result of a successful handshake.
pub struct Established {
    pub session: Arc<dyn Session>,
    pub reader: Box<dyn Reader>,
}

/// Performs the protocol handshake for one identity.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Fails with `Error::Network` on I/O problems and `Error::Auth` when the
    /// server rejects the credentials.
    async fn connect(
        &self,
        identity: &Identity,
        token: &Token,
        events: Arc<dyn Handler>,
    ) -> Result<Established>;
}

/// Inbound side of a connection. Runs on its own task until `stop` fires or
/// the connection dies.
#[async_trait]
pub trait Reader: Send {
    async fn run(self: Box<Self>, stop: CancellationToken) -> Result<()>;
}

/// Outbound calls on an established connection.
#[async_trait]
pub trait Session: Send + Sync {
    async fn send_to_server(&self, msg: &Message) -> Result<()>;
    async fn send_to_user(&self, service: &str, user: &str, msg: &Message, ttl: u32) -> Result<()>;
    async fn request_message(&self, msg_id: &str) -> Result<()>;
    async fn request_all_cached(&self) -> Result<()>;
    async fn config(
        &self,
        digest_threshold: i32,
        compress_threshold: i32,
        digest_fields: &[String],
    ) -> Result<()>;
    async fn set_visibility(&self, visible: bool) -> Result<()>;
    async fn subscribe(&self, params: &SubscribeParams) -> Result<()>;
    async fn unsubscribe(&self, params: &SubscribeParams) -> Result<()>;
    /// Ask the server side to close. The reader observes the closure.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_params_use_wire_keys() {
        let params = SubscribeParams {
            push_service_type: "gcm".into(),
            service: "chat".into(),
            subscriber: "alice".into(),
            reg_id: "reg-1".into(),
        };
        let map = params.to_map();
        assert_eq!(map.get("pushservicetype").map(String::as_str), Some("gcm"));
        assert_eq!(map.get("regid").map(String::as_str), Some("reg-1"));
        assert_eq!(map.len(), 4);
    }
}
