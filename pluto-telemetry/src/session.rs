//! Process-wide session state.
//!
//! A [`SessionStore`] is created when the control center starts, handed to every
//! component that needs the credential, and cleared on logout. At most one
//! [`Credential`] is current at any time; "no session" is `None`, never an empty token.

use chrono::{DateTime, Utc};
use std::{fmt, sync::Arc};
use tokio::sync::watch;
use tracing::info;

/// Bearer token obtained from the auth service.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    pub acquired_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(token: impl Into<String>, acquired_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            acquired_at,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

/// Shared handle to the current credential. Cloning shares the same session.
#[derive(Debug, Clone)]
pub struct SessionStore {
    current: Arc<watch::Sender<Option<Arc<Credential>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            current: Arc::new(tx),
        }
    }

    pub fn current(&self) -> Option<Arc<Credential>> {
        self.current.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.current.borrow().is_some()
    }

    /// Receiver notified whenever the credential is installed, replaced or cleared.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Credential>>> {
        self.current.subscribe()
    }

    /// Install a credential supplied interactively, replacing any current one.
    pub fn login(&self, credential: Credential) {
        info!(acquired_at = %credential.acquired_at, "session credential installed");
        self.current.send_replace(Some(Arc::new(credential)));
    }

    /// Install a credential only if no other path has supplied one first.
    ///
    /// Returns `false` when a credential was already current, in which case the
    /// existing one is kept.
    pub fn publish_if_absent(&self, credential: Credential) -> bool {
        self.current.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(Arc::new(credential));
            true
        })
    }

    pub fn logout(&self) {
        if self.current.send_replace(None).is_some() {
            info!("session credential cleared");
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_if_absent_never_overwrites() {
        let session = SessionStore::new();
        assert!(!session.is_authenticated());

        assert!(session.publish_if_absent(Credential::new("bootstrap", Utc::now())));
        assert!(!session.publish_if_absent(Credential::new("late", Utc::now())));
        assert_eq!(session.current().unwrap().token(), "bootstrap");

        session.login(Credential::new("interactive", Utc::now()));
        assert_eq!(session.current().unwrap().token(), "interactive");

        session.logout();
        assert!(session.current().is_none());
    }

    #[test]
    fn test_clones_share_state_and_notify_subscribers() {
        let session = SessionStore::new();
        let mut rx = session.clone().subscribe();

        session.login(Credential::new("token", Utc::now()));

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().token(), "token");
    }

    #[test]
    fn test_debug_redacts_token() {
        let credential = Credential::new("super-secret-jwt", Utc::now());
        let debug = format!("{credential:?}");

        assert!(!debug.contains("super-secret-jwt"));
        assert!(debug.contains("<redacted>"));
    }
}
