//! Callbacks into the host application.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::client::Message;
use crate::error::Error;
use crate::identity::Identity;

/// Receives operation results and inbound traffic.
///
/// `on_result` fires once per correlation id > 0; `on_error` fires for
/// failures of uncorrelated operations (id <= 0) and for runtime errors
/// reported by the reader.
pub trait Handler: Send + Sync {
    fn on_result(&self, id: i64, error: Option<&Error>);
    fn on_error(&self, error: &Error);
    fn on_service_destroyed(&self) {}
    fn on_missing_account(&self) {}

    fn on_message_from_server(&self, _service: &str, _user: &str, _id: &str, _msg: &Message) {}
    fn on_message_from_user(
        &self,
        _service: &str,
        _user: &str,
        _src_service: &str,
        _src_user: &str,
        _id: &str,
        _msg: &Message,
    ) {
    }
    fn on_message_digest_from_server(
        &self,
        _service: &str,
        _user: &str,
        _size: usize,
        _id: &str,
        _params: &BTreeMap<String, String>,
    ) {
    }
    #[allow(clippy::too_many_arguments)]
    fn on_message_digest_from_user(
        &self,
        _service: &str,
        _user: &str,
        _src_service: &str,
        _src_user: &str,
        _size: usize,
        _id: &str,
        _params: &BTreeMap<String, String>,
    ) {
    }
    fn on_close_start(&self) {}
    fn on_closed(&self) {}
}

/// Supplies handlers at initialization time.
pub trait HandlerFactory: Send + Sync {
    /// Handler for a connection to `identity`, used when a connect request
    /// does not bring its own.
    fn handler_for(&self, identity: &Identity) -> Arc<dyn Handler>;

    /// Handler used when no account is known yet.
    fn fallback(&self) -> Arc<dyn Handler>;
}

/// A factory that hands out the same handler for every identity.
pub struct SingleHandler(pub Arc<dyn Handler>);

impl HandlerFactory for SingleHandler {
    fn handler_for(&self, _identity: &Identity) -> Arc<dyn Handler> {
        Arc::clone(&self.0)
    }

    fn fallback(&self) -> Arc<dyn Handler> {
        Arc::clone(&self.0)
    }
}
