//! Connection parameters known to the host process.

use std::sync::{Arc, RwLock};

use crate::handler::Handler;
use crate::identity::{ConnectionInfo, Token};

/// The last account a connect request was made for. Operations that need a
/// connection reconnect with it on demand.
#[derive(Clone)]
pub struct Account {
    pub info: ConnectionInfo,
    pub token: Token,
    pub handler: Arc<dyn Handler>,
}

/// Holds the current default account. Tokens are held in memory only.
#[derive(Default)]
pub struct Registry {
    current: RwLock<Option<Account>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `account` the default for reconnects.
    pub fn remember(&self, account: Account) {
        if let Ok(mut current) = self.current.write() {
            *current = Some(account);
        }
    }

    pub fn current(&self) -> Option<Account> {
        self.current.read().ok().and_then(|c| c.clone())
    }

    /// Record preferences applied outside of a connect request so the next
    /// reconnect carries them.
    pub fn update_prefs(&self, f: impl FnOnce(&mut ConnectionInfo)) {
        if let Ok(mut current) = self.current.write()
            && let Some(account) = current.as_mut()
        {
            f(&mut account.info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::identity::Identity;

    struct Quiet;

    impl Handler for Quiet {
        fn on_result(&self, _id: i64, _error: Option<&Error>) {}
        fn on_error(&self, _error: &Error) {}
    }

    fn account(user: &str, token: &str) -> Account {
        Account {
            info: ConnectionInfo::new(Identity::new("srv", 8964, "chat", user).unwrap()),
            token: Token::new(token),
            handler: Arc::new(Quiet),
        }
    }

    #[test]
    fn remember_replaces_current() {
        let registry = Registry::new();
        assert!(registry.current().is_none());

        registry.remember(account("alice", "t1"));
        registry.remember(account("bob", "t2"));

        let current = registry.current().unwrap();
        assert_eq!(current.info.identity.user(), "bob");
        assert_eq!(current.token, Token::new("t2"));
    }

    #[test]
    fn update_prefs_changes_current_account() {
        let registry = Registry::new();
        registry.update_prefs(|info| info.prefs.visible = false);
        assert!(registry.current().is_none());

        registry.remember(account("alice", "t1"));
        registry.update_prefs(|info| info.prefs.visible = false);
        assert!(!registry.current().unwrap().info.prefs.visible);
    }
}
