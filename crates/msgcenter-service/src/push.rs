//! Push-provider registration seam.

/// Device registration with the push provider. The registration protocol
/// itself is outside this crate.
pub trait PushRegistrar: Send + Sync {
    /// `None` while the device has not been registered yet.
    fn registration_id(&self) -> Option<String>;

    /// Start registration with the given sender ids. Completion is signalled
    /// back through `ConnectionManager::on_registration_ready`.
    fn register(&self, sender_ids: &[String]);
}

/// Registrar for hosts without a push provider; reconciliation stays deferred.
pub struct NoPush;

impl PushRegistrar for NoPush {
    fn registration_id(&self) -> Option<String> {
        None
    }

    fn register(&self, sender_ids: &[String]) {
        tracing::debug!(senders = sender_ids.len(), "push registration unavailable");
    }
}
