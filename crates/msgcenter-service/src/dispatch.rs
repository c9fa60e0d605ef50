//! Named operations submitted by the host, one worker task each.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::client::Message;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::identity::{ConnectionInfo, Token};
use crate::manager::ConnectionManager;

/// A request from the host application. Outcomes are reported through the
/// handler under the correlation id passed to [`Dispatcher::submit`].
pub enum Command {
    /// Connect, or reuse the live connection. Without a handler the factory
    /// supplies one for the identity.
    Connect {
        info: ConnectionInfo,
        token: Token,
        handler: Option<Arc<dyn Handler>>,
    },
    SendToServer {
        msg: Message,
    },
    SendToUser {
        service: String,
        user: String,
        msg: Message,
        ttl: u32,
    },
    RequestMessage {
        msg_id: String,
    },
    RequestAllCached,
    Config {
        digest_threshold: i32,
        compress_threshold: i32,
        digest_fields: Vec<String>,
    },
    SetVisibility {
        visible: bool,
    },
    Subscribe,
    Unsubscribe {
        reg_id: String,
    },
    /// A digest delivered out of band, e.g. inside a push notification.
    /// Handed to the current handler without touching the connection.
    MessageDigest {
        service: String,
        user: String,
        /// Set when the message came from another user rather than the server.
        from: Option<(String, String)>,
        size: usize,
        msg_id: String,
        params: BTreeMap<String, String>,
    },
    /// The push provider produced a registration id.
    RegistrationReady {
        reg_id: String,
    },
    Teardown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::SendToServer { .. } => "send_to_server",
            Command::SendToUser { .. } => "send_to_user",
            Command::RequestMessage { .. } => "request_message",
            Command::RequestAllCached => "request_all_cached",
            Command::Config { .. } => "config",
            Command::SetVisibility { .. } => "set_visibility",
            Command::Subscribe => "subscribe",
            Command::Unsubscribe { .. } => "unsubscribe",
            Command::MessageDigest { .. } => "message_digest",
            Command::RegistrationReady { .. } => "registration_ready",
            Command::Teardown => "teardown",
        }
    }

    /// Argument checks that do not need a connection. Connect requests carry
    /// an [`Identity`](crate::identity::Identity), which is valid by
    /// construction.
    pub fn validate(&self) -> Result<()> {
        match self {
            Command::SendToUser { service, user, .. } => {
                if service.is_empty() {
                    return Err(Error::Validation("send_to_user needs a service".into()));
                }
                if user.is_empty() {
                    return Err(Error::Validation("send_to_user needs a user".into()));
                }
                Ok(())
            }
            Command::RequestMessage { msg_id } if msg_id.is_empty() => {
                Err(Error::Validation("empty message id".into()))
            }
            Command::Unsubscribe { reg_id } | Command::RegistrationReady { reg_id }
                if reg_id.is_empty() =>
            {
                Err(Error::Validation("empty registration id".into()))
            }
            Command::Config { digest_fields, .. } if digest_fields.iter().any(|f| f.is_empty()) => {
                Err(Error::Validation("empty digest field name".into()))
            }
            _ => Ok(()),
        }
    }
}

/// Runs each submitted command on its own task against a shared manager.
#[derive(Clone)]
pub struct Dispatcher {
    manager: Arc<ConnectionManager>,
}

impl Dispatcher {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Spawn a worker for `command`. The returned handle completes once the
    /// outcome has been reported.
    pub fn submit(&self, id: i64, command: Command) -> JoinHandle<()> {
        let manager = Arc::clone(&self.manager);
        tracing::debug!(id, command = command.name(), "dispatching command");
        tokio::spawn(async move { execute(&manager, id, command).await })
    }
}

async fn execute(manager: &ConnectionManager, id: i64, command: Command) {
    if let Err(e) = command.validate() {
        tracing::warn!(id, command = command.name(), error = %e, "rejected command");
        manager.reject(id, e);
        return;
    }

    // Outcomes are delivered through the handler; the returned copies are
    // only of interest to direct callers of the manager.
    match command {
        Command::Connect {
            info,
            token,
            handler,
        } => {
            let handler =
                handler.unwrap_or_else(|| manager.handlers().handler_for(&info.identity));
            let _ = manager.connect(id, info, token, handler).await;
        }
        Command::SendToServer { msg } => {
            let _ = manager.send_to_server(id, &msg).await;
        }
        Command::SendToUser {
            service,
            user,
            msg,
            ttl,
        } => {
            let _ = manager.send_to_user(id, &service, &user, &msg, ttl).await;
        }
        Command::RequestMessage { msg_id } => {
            let _ = manager.request_message(id, &msg_id).await;
        }
        Command::RequestAllCached => {
            let _ = manager.request_all_cached(id).await;
        }
        Command::Config {
            digest_threshold,
            compress_threshold,
            digest_fields,
        } => {
            let _ = manager
                .config(id, digest_threshold, compress_threshold, &digest_fields)
                .await;
        }
        Command::SetVisibility { visible } => {
            let _ = manager.set_visibility(id, visible).await;
        }
        Command::Subscribe => {
            let _ = manager.subscribe(id).await;
        }
        Command::Unsubscribe { reg_id } => {
            let _ = manager.unsubscribe(id, &reg_id).await;
        }
        Command::MessageDigest {
            service,
            user,
            from,
            size,
            msg_id,
            params,
        } => {
            let handler = manager.current_handler();
            match from {
                Some((src_service, src_user)) => handler.on_message_digest_from_user(
                    &service,
                    &user,
                    &src_service,
                    &src_user,
                    size,
                    &msg_id,
                    &params,
                ),
                None => {
                    handler.on_message_digest_from_server(&service, &user, size, &msg_id, &params)
                }
            }
        }
        Command::RegistrationReady { reg_id } => {
            manager.on_registration_ready(&reg_id).await;
        }
        Command::Teardown => {
            manager.teardown().await;
            if id > 0 {
                manager.current_handler().on_result(id, None);
            }
        }
    }
}
