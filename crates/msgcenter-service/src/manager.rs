//! Connection lifecycle: reuse or replace the single active connection,
//! reconnect on demand, and run operations through the retry executor.
//!
//! Shared state sits behind one `RwLock`. Replacing or clearing the active
//! connection takes it exclusively; operations on the live session hold it
//! shared for the duration of the call. Connect and disconnect transitions are
//! additionally serialized so a reconnect never interleaves with another.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{Connector, Message, Reader, Session};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::handler::{Handler, HandlerFactory};
use crate::identity::{ConnectionInfo, ConnectionPreferences, Identity, Token};
use crate::push::PushRegistrar;
use crate::reconcile::{Reconciled, Reconciler};
use crate::registry::{Account, Registry};
use crate::retry::{self, RetryPolicy};
use crate::store::SubscriptionStore;

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

struct ActiveConnection {
    generation: u64,
    identity: Identity,
    token: Token,
    handler: Arc<dyn Handler>,
    session: Arc<dyn Session>,
    reader: JoinHandle<()>,
    stop: CancellationToken,
    applied: ConnectionPreferences,
}

impl ActiveConnection {
    fn serves(&self, identity: &Identity, token: &Token) -> bool {
        !self.reader.is_finished() && self.identity == *identity && self.token == *token
    }

    fn live(&self) -> LiveConnection {
        LiveConnection {
            session: Arc::clone(&self.session),
            identity: self.identity.clone(),
            applied: self.applied.clone(),
        }
    }
}

/// What an operation sees of the installed connection while it holds the
/// shared lock.
struct LiveConnection {
    session: Arc<dyn Session>,
    identity: Identity,
    applied: ConnectionPreferences,
}

#[derive(Default)]
struct Shared {
    active: Option<ActiveConnection>,
}

pub struct ConnectionManager {
    me: Weak<ConnectionManager>,
    config: ServiceConfig,
    connector: Arc<dyn Connector>,
    handlers: Arc<dyn HandlerFactory>,
    registry: Arc<Registry>,
    reconciler: Reconciler,
    shared: RwLock<Shared>,
    transition: Mutex<()>,
    generation: AtomicU64,
    state_tx: watch::Sender<ConnState>,
    /// Parent of every retry loop's cancellation token; replaced on teardown.
    cancel: StdMutex<CancellationToken>,
}

impl ConnectionManager {
    pub fn new(
        config: ServiceConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn SubscriptionStore>,
        push: Arc<dyn PushRegistrar>,
        handlers: Arc<dyn HandlerFactory>,
    ) -> Arc<Self> {
        Self::with_registry(
            config,
            connector,
            store,
            push,
            handlers,
            Arc::new(Registry::new()),
        )
    }

    /// Build a manager around a registry owned by the host process.
    pub fn with_registry(
        config: ServiceConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn SubscriptionStore>,
        push: Arc<dyn PushRegistrar>,
        handlers: Arc<dyn HandlerFactory>,
        registry: Arc<Registry>,
    ) -> Arc<Self> {
        let reconciler = Reconciler::new(store, push, config.push_service_type.clone());
        let (state_tx, _) = watch::channel(ConnState::Disconnected);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            connector,
            handlers,
            registry,
            reconciler,
            shared: RwLock::new(Shared::default()),
            transition: Mutex::new(()),
            generation: AtomicU64::new(0),
            state_tx,
            cancel: StdMutex::new(CancellationToken::new()),
        })
    }

    pub fn state(&self) -> ConnState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnState> {
        self.state_tx.subscribe()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn handlers(&self) -> &Arc<dyn HandlerFactory> {
        &self.handlers
    }

    /// Identity of the installed connection, if any.
    pub async fn active_identity(&self) -> Option<Identity> {
        let shared = self.shared.read().await;
        shared.active.as_ref().map(|a| a.identity.clone())
    }

    fn set_state(&self, state: ConnState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            tracing::debug!(from = ?prev, to = ?state, "connection state changed");
        }
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .map(|c| c.child_token())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Connect / disconnect
    // -----------------------------------------------------------------------

    /// Connect as `info.identity`, reusing the live connection when identity
    /// and token match. The outcome is reported to `handler` under `id`.
    pub async fn connect(
        &self,
        id: i64,
        info: ConnectionInfo,
        token: Token,
        handler: Arc<dyn Handler>,
    ) -> Result<()> {
        let account = Account {
            info,
            token,
            handler: Arc::clone(&handler),
        };
        self.registry.remember(account.clone());
        let result = self.establish(&account).await;
        finish(handler.as_ref(), id, result)
    }

    /// Ensure a connection for `account`, reusing or replacing as needed.
    async fn establish(&self, account: &Account) -> Result<()> {
        if let Some(result) = self.reuse(account).await {
            return result;
        }
        let replaced = {
            let _transition = self.transition.lock().await;
            if self.serves(account).await {
                None
            } else {
                Some(self.replace(account, &self.config.connect_retry).await)
            }
        };
        match replaced {
            None => self.reuse_confirmed(account).await,
            Some(Ok(())) => {
                self.reconcile_quietly().await;
                Ok(())
            }
            Some(Err(e)) => Err(e),
        }
    }

    async fn serves(&self, account: &Account) -> bool {
        let shared = self.shared.read().await;
        shared
            .active
            .as_ref()
            .is_some_and(|a| a.serves(&account.info.identity, &account.token))
    }

    /// Reuse the live connection when it serves `account`. Preference changes
    /// are pushed to the server without reconnecting.
    async fn reuse(&self, account: &Account) -> Option<Result<()>> {
        let (generation, applied) = {
            let shared = self.shared.read().await;
            let active = shared.active.as_ref()?;
            if !active.serves(&account.info.identity, &account.token) {
                return None;
            }
            (active.generation, active.applied.clone())
        };

        let wanted = &account.info.prefs;
        if applied == *wanted {
            tracing::debug!(identity = %account.info.identity, "reusing live connection");
            return Some(Ok(()));
        }

        tracing::info!(identity = %account.info.identity, "updating preferences on live connection");
        let seen = AtomicU64::new(generation);
        let outcome = self
            .with_retry(&self.config.retry, &seen, |session| {
                let applied = applied.clone();
                async move { apply_prefs(session.as_ref(), &applied, wanted).await }
            })
            .await;
        match outcome {
            Some(Ok(())) => {
                self.record_applied(seen.load(Ordering::SeqCst), |p| *p = wanted.clone())
                    .await;
                self.reconcile_quietly().await;
                Some(Ok(()))
            }
            Some(Err(e)) => Some(Err(e)),
            None => Some(Err(Error::Cancelled)),
        }
    }

    /// Reuse a connection that was seen serving `account` under the transition
    /// lock. If it is gone by now the caller is not connected.
    async fn reuse_confirmed(&self, account: &Account) -> Result<()> {
        self.reuse(account)
            .await
            .unwrap_or(Err(Error::NotConnected))
    }

    /// Tear down whatever is installed and connect `account` afresh. The
    /// caller holds the transition lock.
    async fn replace(&self, account: &Account, policy: &RetryPolicy) -> Result<()> {
        let old = self.shared.write().await.active.take();
        if let Some(old) = old {
            tracing::info!(
                old = %old.identity,
                new = %account.info.identity,
                "replacing connection"
            );
            self.shut_down(old, Teardown::Replace).await;
        }

        self.set_state(ConnState::Connecting);
        let cancel = self.cancel_token();
        let outcome = retry::run_with_retry(
            policy,
            &cancel,
            || self.handshake_and_install(account),
            || async { Ok(()) },
        )
        .await;

        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                tracing::warn!(identity = %account.info.identity, error = %e, "connect failed");
                self.set_state(ConnState::Disconnected);
                Err(e)
            }
            None => {
                self.set_state(ConnState::Disconnected);
                Err(Error::Cancelled)
            }
        }
    }

    async fn handshake_and_install(&self, account: &Account) -> Result<()> {
        let identity = &account.info.identity;
        tracing::info!(%identity, "connecting");
        let established = self
            .connector
            .connect(identity, &account.token, Arc::clone(&account.handler))
            .await?;

        let server_defaults = ConnectionPreferences::default();
        if let Err(e) =
            apply_prefs(established.session.as_ref(), &server_defaults, &account.info.prefs).await
        {
            let _ = established.session.close().await;
            return Err(e);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let stop = CancellationToken::new();
        {
            let mut shared = self.shared.write().await;
            let reader = self.spawn_reader(
                established.reader,
                stop.clone(),
                generation,
                Arc::clone(&account.handler),
            );
            shared.active = Some(ActiveConnection {
                generation,
                identity: identity.clone(),
                token: account.token.clone(),
                handler: Arc::clone(&account.handler),
                session: established.session,
                reader,
                stop,
                applied: account.info.prefs.clone(),
            });
        }
        self.set_state(ConnState::Connected);
        tracing::info!(%identity, generation, "connected");
        Ok(())
    }

    fn spawn_reader(
        &self,
        reader: Box<dyn Reader>,
        stop: CancellationToken,
        generation: u64,
        handler: Arc<dyn Handler>,
    ) -> JoinHandle<()> {
        let manager = self.me.clone();
        tokio::spawn(async move {
            let result = reader.run(stop.clone()).await;
            if stop.is_cancelled() {
                return;
            }
            match result {
                Ok(()) => tracing::info!(generation, "reader finished, connection closed"),
                Err(e) => {
                    tracing::warn!(generation, error = %e, "reader failed");
                    handler.on_error(&e);
                }
            }
            // Detached: a teardown joining this task may hold the transition
            // lock that `reader_exited` waits for.
            if let Some(manager) = manager.upgrade() {
                tokio::spawn(async move { manager.reader_exited(generation).await });
            }
        })
    }

    /// The reader of `generation` stopped on its own: drop that connection if
    /// it is still the installed one. Serialized with connect and disconnect so
    /// the published state never trails a newer connection.
    async fn reader_exited(&self, generation: u64) {
        let _transition = self.transition.lock().await;
        let old = {
            let mut shared = self.shared.write().await;
            if shared
                .active
                .as_ref()
                .is_some_and(|a| a.generation == generation)
            {
                shared.active.take()
            } else {
                None
            }
        };
        if let Some(old) = old {
            self.shut_down(old, Teardown::ReaderExited).await;
        }
    }

    /// Stop the active connection, if any. Idempotent.
    pub async fn disconnect(&self) {
        let _transition = self.transition.lock().await;
        let old = self.shared.write().await.active.take();
        match old {
            Some(old) => self.shut_down(old, Teardown::Disconnect).await,
            None => tracing::debug!("disconnect with no active connection"),
        }
    }

    /// Cancel all in-flight operations and disconnect. The manager stays
    /// usable afterwards.
    pub async fn teardown(&self) {
        if let Ok(mut cancel) = self.cancel.lock() {
            let old = std::mem::take(&mut *cancel);
            old.cancel();
        }
        self.disconnect().await;
    }

    async fn shut_down(&self, old: ActiveConnection, why: Teardown) {
        self.set_state(ConnState::Disconnecting);
        old.stop.cancel();
        if let Err(e) = old.session.close().await {
            tracing::debug!(identity = %old.identity, error = %e, "close request failed");
        }

        // The reader calls back into us when it exits on its own; joining it
        // from that path would wait on ourselves.
        if why != Teardown::ReaderExited {
            let timeout = self.config.teardown_timeout();
            match tokio::time::timeout(timeout, old.reader).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(identity = %old.identity, "reader task failed: {e}"),
                Err(_) => tracing::warn!(
                    identity = %old.identity,
                    timeout_ms = timeout.as_millis() as u64,
                    "reader did not stop in time, detaching it"
                ),
            }
        }

        if why == Teardown::Disconnect {
            old.handler.on_service_destroyed();
        }
        self.set_state(ConnState::Disconnected);
        tracing::info!(identity = %old.identity, reason = ?why, "connection torn down");
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    pub async fn send_to_server(&self, id: i64, msg: &Message) -> Result<()> {
        self.run_op(id, "send_to_server", |s| async move {
            s.send_to_server(msg).await
        })
        .await
    }

    pub async fn send_to_user(
        &self,
        id: i64,
        service: &str,
        user: &str,
        msg: &Message,
        ttl: u32,
    ) -> Result<()> {
        self.run_op(id, "send_to_user", |s| async move {
            s.send_to_user(service, user, msg, ttl).await
        })
        .await
    }

    pub async fn request_message(&self, id: i64, msg_id: &str) -> Result<()> {
        self.run_op(id, "request_message", |s| async move {
            s.request_message(msg_id).await
        })
        .await
    }

    pub async fn request_all_cached(&self, id: i64) -> Result<()> {
        self.run_op(id, "request_all_cached", |s| async move {
            s.request_all_cached().await
        })
        .await
    }

    pub async fn config(
        &self,
        id: i64,
        digest_threshold: i32,
        compress_threshold: i32,
        digest_fields: &[String],
    ) -> Result<()> {
        let result = self
            .run_op_inner("config", |s| async move {
                s.config(digest_threshold, compress_threshold, digest_fields)
                    .await
            })
            .await;
        if let Ok(generation) = result {
            let update = |p: &mut ConnectionPreferences| {
                p.digest_threshold = digest_threshold;
                p.compress_threshold = compress_threshold;
                p.digest_fields = digest_fields.to_vec();
            };
            self.record_applied(generation, &update).await;
            self.registry.update_prefs(|info| update(&mut info.prefs));
        }
        self.report(id, result.map(|_| ()))
    }

    /// Change visibility on the live connection and reconcile the push
    /// subscription. Never forces a reconnect by itself.
    pub async fn set_visibility(&self, id: i64, visible: bool) -> Result<()> {
        let result = self
            .run_op_inner("set_visibility", |s| async move {
                s.set_visibility(visible).await
            })
            .await;
        if let Ok(generation) = result {
            self.record_applied(generation, |p| p.visible = visible)
                .await;
            self.registry.update_prefs(|info| info.prefs.visible = visible);
        }
        let result = self.report(id, result.map(|_| ()));
        if result.is_ok() {
            self.reconcile_quietly().await;
        }
        result
    }

    /// Run a reconciliation pass now, connecting first if needed.
    pub async fn subscribe(&self, id: i64) -> Result<()> {
        let result = match self.ensure_connected().await {
            Ok(_) => self.reconcile().await.map(|_| ()),
            Err(e) => Err(e),
        };
        self.report(id, result)
    }

    /// Drop a specific push registration on the server.
    pub async fn unsubscribe(&self, id: i64, reg_id: &str) -> Result<()> {
        if reg_id.is_empty() {
            return self.report(id, Err(Error::Validation("empty registration id".into())));
        }
        let result = match self.ensure_connected().await {
            Ok(_) => {
                let seen = AtomicU64::new(0);
                let reconciler = &self.reconciler;
                self.with_retry_shared(&self.config.subscribe_retry, &seen, |live| async move {
                    reconciler
                        .unsubscribe_registration(live.session.as_ref(), &live.identity, reg_id)
                        .await
                })
                .await
                .unwrap_or(Err(Error::Cancelled))
            }
            Err(e) => Err(e),
        };
        self.report(id, result)
    }

    /// The push registration id became available.
    pub async fn on_registration_ready(&self, reg_id: &str) {
        self.reconciler.set_registration_id(reg_id);
        if self.registry.current().is_some() {
            let _ = self.subscribe(0).await;
        }
    }

    /// Report a result for an operation rejected before it ran.
    pub fn reject(&self, id: i64, error: Error) {
        let _ = self.report(id, Err(error));
    }

    /// Handler of the current account, or the factory's fallback.
    pub fn current_handler(&self) -> Arc<dyn Handler> {
        match self.registry.current() {
            Some(account) => account.handler,
            None => self.handlers.fallback(),
        }
    }

    fn report(&self, id: i64, result: Result<()>) -> Result<()> {
        let handler = self.current_handler();
        if matches!(result, Err(Error::MissingAccount)) {
            handler.on_missing_account();
        }
        finish(handler.as_ref(), id, result)
    }

    async fn run_op<F, Fut>(&self, id: i64, name: &'static str, call: F) -> Result<()>
    where
        F: Fn(Arc<dyn Session>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let result = self.run_op_inner(name, call).await.map(|_| ());
        self.report(id, result)
    }

    /// Ensure a connection, then run `call` with retries. Returns the
    /// generation of the connection the call succeeded on.
    async fn run_op_inner<F, Fut>(&self, name: &'static str, call: F) -> Result<u64>
    where
        F: Fn(Arc<dyn Session>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.ensure_connected().await?;
        tracing::debug!(op = name, "running operation");
        let seen = AtomicU64::new(0);
        match self.with_retry(&self.config.retry, &seen, call).await {
            Some(Ok(())) => Ok(seen.load(Ordering::SeqCst)),
            Some(Err(e)) => {
                tracing::warn!(op = name, error = %e, "operation failed");
                Err(e)
            }
            None => Err(Error::Cancelled),
        }
    }

    /// Reconnect on demand with the last known account.
    async fn ensure_connected(&self) -> Result<Account> {
        let account = self.registry.current().ok_or(Error::MissingAccount)?;
        self.establish(&account).await?;
        Ok(account)
    }

    /// Run `call` against the live session under the shared lock, retrying
    /// with a forced reconnect between attempts.
    async fn with_retry<F, Fut>(
        &self,
        policy: &RetryPolicy,
        seen: &AtomicU64,
        call: F,
    ) -> Option<Result<()>>
    where
        F: Fn(Arc<dyn Session>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let call = &call;
        self.with_retry_shared(policy, seen, move |live| call(live.session))
            .await
    }

    async fn with_retry_shared<F, Fut>(
        &self,
        policy: &RetryPolicy,
        seen: &AtomicU64,
        call: F,
    ) -> Option<Result<()>>
    where
        F: Fn(LiveConnection) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let cancel = self.cancel_token();
        let call = &call;
        retry::run_with_retry(
            policy,
            &cancel,
            move || async move {
                let shared = self.shared.read().await;
                let active = shared.active.as_ref().ok_or(Error::NotConnected)?;
                seen.store(active.generation, Ordering::SeqCst);
                call(active.live()).await
            },
            move || self.reconnect(seen.load(Ordering::SeqCst)),
        )
        .await
    }

    /// Replace the connection an operation failed on. Skipped when another
    /// task already installed a newer one.
    ///
    /// Reconnects made here do not reconcile: the server keeps subscriptions
    /// across connections of the same account.
    async fn reconnect(&self, failed_generation: u64) -> Result<()> {
        let account = self.registry.current().ok_or(Error::MissingAccount)?;
        let _transition = self.transition.lock().await;
        let fresh = {
            let shared = self.shared.read().await;
            shared.active.as_ref().is_some_and(|a| {
                a.generation != failed_generation
                    && a.serves(&account.info.identity, &account.token)
            })
        };
        if fresh {
            tracing::debug!("connection already replaced, skipping reconnect");
            return Ok(());
        }
        tracing::info!(identity = %account.info.identity, "reconnecting before retry");
        self.replace(&account, &RetryPolicy::once()).await
    }

    async fn record_applied(&self, generation: u64, update: impl FnOnce(&mut ConnectionPreferences)) {
        let mut shared = self.shared.write().await;
        if let Some(active) = shared.active.as_mut()
            && active.generation == generation
        {
            update(&mut active.applied);
        }
    }

    // -----------------------------------------------------------------------
    // Subscription reconciliation
    // -----------------------------------------------------------------------

    async fn reconcile(&self) -> Result<Reconciled> {
        let seen = AtomicU64::new(0);
        let outcome = StdMutex::new(Reconciled::Unchanged);
        let reconciler = &self.reconciler;
        let slot = &outcome;
        let result = self
            .with_retry_shared(&self.config.subscribe_retry, &seen, |live| async move {
                let done = reconciler
                    .reconcile(
                        live.session.as_ref(),
                        &live.identity,
                        live.applied.wants_push(),
                    )
                    .await?;
                if let Ok(mut slot) = slot.lock() {
                    *slot = done;
                }
                Ok(())
            })
            .await
            .unwrap_or(Err(Error::Cancelled));
        result?;
        Ok(outcome
            .into_inner()
            .unwrap_or(Reconciled::Unchanged))
    }

    /// Reconcile after a state change; failures go to `on_error`.
    async fn reconcile_quietly(&self) {
        match self.reconcile().await {
            Ok(done) => tracing::debug!(outcome = ?done, "reconciled push subscription"),
            Err(Error::Cancelled) => {}
            Err(e) => {
                tracing::warn!(error = %e, "push subscription reconciliation failed");
                self.current_handler().on_error(&e);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Disconnect,
    Replace,
    ReaderExited,
}

/// Report `result` unless it is a cancellation, then hand it back.
fn finish(handler: &dyn Handler, id: i64, result: Result<()>) -> Result<()> {
    if !matches!(result, Err(Error::Cancelled)) {
        retry::report(handler, id, &result);
    }
    result
}

/// Push the difference between `from` and `to` to the server.
async fn apply_prefs(
    session: &dyn Session,
    from: &ConnectionPreferences,
    to: &ConnectionPreferences,
) -> Result<()> {
    if from.needs_reconfig(to) {
        session
            .config(to.digest_threshold, to.compress_threshold, &to.digest_fields)
            .await?;
    }
    if from.visible != to.visible {
        session.set_visibility(to.visible).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::client::{Established, SubscribeParams};
    use crate::handler::SingleHandler;
    use crate::push::NoPush;
    use crate::store::MemoryStore;

    struct Idle;

    #[async_trait]
    impl Session for Idle {
        async fn send_to_server(&self, _msg: &Message) -> Result<()> {
            Ok(())
        }
        async fn send_to_user(&self, _s: &str, _u: &str, _m: &Message, _ttl: u32) -> Result<()> {
            Ok(())
        }
        async fn request_message(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn request_all_cached(&self) -> Result<()> {
            Ok(())
        }
        async fn config(&self, _d: i32, _c: i32, _f: &[String]) -> Result<()> {
            Ok(())
        }
        async fn set_visibility(&self, _visible: bool) -> Result<()> {
            Ok(())
        }
        async fn subscribe(&self, _params: &SubscribeParams) -> Result<()> {
            Ok(())
        }
        async fn unsubscribe(&self, _params: &SubscribeParams) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Reader for Idle {
        async fn run(self: Box<Self>, stop: CancellationToken) -> Result<()> {
            stop.cancelled().await;
            Ok(())
        }
    }

    struct IdleConnector;

    #[async_trait]
    impl Connector for IdleConnector {
        async fn connect(
            &self,
            _identity: &Identity,
            _token: &Token,
            _events: Arc<dyn Handler>,
        ) -> Result<Established> {
            Ok(Established {
                session: Arc::new(Idle),
                reader: Box::new(Idle),
            })
        }
    }

    struct Quiet;

    impl Handler for Quiet {
        fn on_result(&self, _id: i64, _error: Option<&Error>) {}
        fn on_error(&self, _error: &Error) {}
    }

    fn manager() -> Arc<ConnectionManager> {
        ConnectionManager::new(
            ServiceConfig::default(),
            Arc::new(IdleConnector),
            Arc::new(MemoryStore::new()),
            Arc::new(NoPush),
            Arc::new(SingleHandler(Arc::new(Quiet))),
        )
    }

    #[tokio::test]
    async fn vanished_connection_is_not_reported_as_reused() {
        let manager = manager();
        let info = ConnectionInfo::new(Identity::new("srv", 0, "chat", "alice").unwrap());
        manager
            .connect(1, info, Token::new("t1"), Arc::new(Quiet))
            .await
            .unwrap();
        let account = manager.registry().current().unwrap();
        assert_eq!(manager.reuse_confirmed(&account).await, Ok(()));

        // Connection dropped after the caller saw it serving the account.
        let gone = manager.shared.write().await.active.take().unwrap();
        gone.stop.cancel();

        assert_eq!(
            manager.reuse_confirmed(&account).await,
            Err(Error::NotConnected)
        );
    }

    #[tokio::test]
    async fn reader_exit_of_a_replaced_generation_is_ignored() {
        let manager = manager();
        let info = ConnectionInfo::new(Identity::new("srv", 0, "chat", "alice").unwrap());
        manager
            .connect(1, info.clone(), Token::new("t1"), Arc::new(Quiet))
            .await
            .unwrap();
        manager
            .connect(2, info, Token::new("t2"), Arc::new(Quiet))
            .await
            .unwrap();

        manager.reader_exited(1).await;

        assert_eq!(manager.state(), ConnState::Connected);
        assert!(manager.active_identity().await.is_some());
    }
}
