//! Bearer credential sources for the push channel.
//!
//! The connection manager asks its [`CredentialProvider`] on every connect and
//! again before every scheduled reconnect. Returning `None` makes the manager
//! fail fast and stops the reconnect loop, which is how a logout or an expired
//! session ends automatic recovery.

// Rust guideline compliant 2026-02

use std::sync::{Arc, RwLock};

/// Supplies the current bearer credential, if any.
pub trait CredentialProvider: Send + Sync + std::fmt::Debug {
    /// The credential to authenticate with, or `None` when logged out.
    fn credential(&self) -> Option<String>;
}

/// A credential fixed at construction time.
#[derive(Clone, Default)]
pub struct StaticCredential(Option<String>);

impl StaticCredential {
    /// Wrap `token`; empty strings count as no credential.
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        Self((!token.is_empty()).then_some(token))
    }

    /// No credential at all.
    pub fn none() -> Self {
        Self(None)
    }
}

impl std::fmt::Debug for StaticCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StaticCredential")
            .field(&self.0.as_ref().map(|_| "***"))
            .finish()
    }
}

impl CredentialProvider for StaticCredential {
    fn credential(&self) -> Option<String> {
        self.0.clone()
    }
}

/// A credential that can be replaced or cleared at runtime.
///
/// Clones share the same slot, so the login flow can hold one clone and the
/// connection manager another.
#[derive(Clone, Default)]
pub struct SharedCredential {
    slot: Arc<RwLock<Option<String>>>,
}

impl SharedCredential {
    /// Start with `token` (or logged out when `None`).
    pub fn new(token: Option<String>) -> Self {
        Self {
            slot: Arc::new(RwLock::new(token.filter(|t| !t.is_empty()))),
        }
    }

    /// Replace the credential (after login or refresh).
    pub fn set(&self, token: impl Into<String>) {
        let token = token.into();
        *self.slot.write().expect("SharedCredential lock poisoned") =
            (!token.is_empty()).then_some(token);
    }

    /// Remove the credential (logout, unauthorized).
    pub fn clear(&self) {
        *self.slot.write().expect("SharedCredential lock poisoned") = None;
    }
}

impl std::fmt::Debug for SharedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let present = self
            .slot
            .read()
            .map(|slot| slot.is_some())
            .unwrap_or(false);
        f.debug_struct("SharedCredential")
            .field("present", &present)
            .finish()
    }
}

impl CredentialProvider for SharedCredential {
    fn credential(&self) -> Option<String> {
        self.slot
            .read()
            .expect("SharedCredential lock poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_credential_empty_is_none() {
        assert_eq!(StaticCredential::new("").credential(), None);
        assert_eq!(StaticCredential::none().credential(), None);
        assert_eq!(
            StaticCredential::new("tok").credential().as_deref(),
            Some("tok")
        );
    }

    #[test]
    fn test_shared_credential_clones_share_slot() {
        let login = SharedCredential::new(None);
        let manager_side = login.clone();
        assert_eq!(manager_side.credential(), None);

        login.set("abc");
        assert_eq!(manager_side.credential().as_deref(), Some("abc"));

        login.clear();
        assert_eq!(manager_side.credential(), None);
    }

    #[test]
    fn test_debug_never_prints_token() {
        let rendered = format!("{:?} {:?}", StaticCredential::new("secret"), SharedCredential::new(Some("secret".into())));
        assert!(!rendered.contains("secret"));
    }
}
