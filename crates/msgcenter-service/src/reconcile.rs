//! Keeps the server-side push subscription in line with the user's preference.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;

use crate::client::{Session, SubscribeParams};
use crate::error::Result;
use crate::identity::Identity;
use crate::push::PushRegistrar;
use crate::store::SubscriptionStore;

/// What a reconciliation pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Unchanged,
    Subscribed,
    Unsubscribed,
    /// No registration id yet; registration was requested.
    Deferred,
}

pub struct Reconciler {
    store: Arc<dyn SubscriptionStore>,
    push: Arc<dyn PushRegistrar>,
    push_service_type: String,
    /// Registration id delivered through the readiness signal.
    ready_reg_id: StdMutex<Option<String>>,
    /// Serializes check-and-act so concurrent passes cannot both call out.
    pass: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        push: Arc<dyn PushRegistrar>,
        push_service_type: impl Into<String>,
    ) -> Self {
        Self {
            store,
            push,
            push_service_type: push_service_type.into(),
            ready_reg_id: StdMutex::new(None),
            pass: Mutex::new(()),
        }
    }

    pub fn set_registration_id(&self, reg_id: impl Into<String>) {
        let reg_id = reg_id.into();
        if reg_id.is_empty() {
            return;
        }
        if let Ok(mut slot) = self.ready_reg_id.lock() {
            *slot = Some(reg_id);
        }
    }

    fn registration_id(&self) -> Option<String> {
        let ready = self.ready_reg_id.lock().ok().and_then(|r| r.clone());
        ready
            .or_else(|| self.push.registration_id())
            .filter(|id| !id.is_empty())
    }

    fn params(&self, identity: &Identity, reg_id: String) -> SubscribeParams {
        SubscribeParams {
            push_service_type: self.push_service_type.clone(),
            service: identity.service().to_string(),
            subscriber: identity.user().to_string(),
            reg_id,
        }
    }

    /// One check-and-act pass. The caller holds the shared connection lock
    /// for `session` for the whole call.
    pub async fn reconcile(
        &self,
        session: &dyn Session,
        identity: &Identity,
        desired: bool,
    ) -> Result<Reconciled> {
        let _pass = self.pass.lock().await;
        let (service, user) = (identity.service(), identity.user());
        let recorded = self.store.is_subscribed(service, user);

        if desired == recorded {
            tracing::debug!(%identity, subscribed = recorded, "subscription already in sync");
            return Ok(Reconciled::Unchanged);
        }

        let Some(reg_id) = self.registration_id() else {
            if desired {
                tracing::info!(%identity, "no push registration yet, requesting one");
                self.push.register(&self.store.sender_ids());
            } else {
                tracing::info!(%identity, "no push registration id, deferring unsubscribe");
            }
            return Ok(Reconciled::Deferred);
        };

        let params = self.params(identity, reg_id);
        if desired {
            session.subscribe(&params).await?;
            self.store.set_subscribed(service, user, true)?;
            tracing::info!(%identity, "subscribed to push notifications");
            Ok(Reconciled::Subscribed)
        } else {
            session.unsubscribe(&params).await?;
            self.store.set_subscribed(service, user, false)?;
            tracing::info!(%identity, "unsubscribed from push notifications");
            Ok(Reconciled::Unsubscribed)
        }
    }

    /// Unsubscribe a specific registration id regardless of the stored record,
    /// e.g. after the push provider rotated it.
    pub async fn unsubscribe_registration(
        &self,
        session: &dyn Session,
        identity: &Identity,
        reg_id: &str,
    ) -> Result<()> {
        let _pass = self.pass.lock().await;
        let params = self.params(identity, reg_id.to_string());
        session.unsubscribe(&params).await?;
        self.store
            .set_subscribed(identity.service(), identity.user(), false)?;
        tracing::info!(%identity, "unsubscribed registration");
        Ok(())
    }
}
