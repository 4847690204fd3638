//! Identity provider seam.

use std::sync::{Arc, RwLock};

use crate::model::Identity;

/// Source of the authenticated actor. `None` means nobody is signed in.
pub trait IdentityProvider: Send + Sync {
    fn current(&self) -> Option<Identity>;
}

/// Identity fixed at construction, switchable for sign-in/sign-out flows.
#[derive(Clone, Default)]
pub struct StaticIdentity {
    identity: Arc<RwLock<Option<Identity>>>,
}

impl StaticIdentity {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity: Arc::new(RwLock::new(Some(identity))),
        }
    }

    /// A provider with nobody signed in.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, identity: Identity) {
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = Some(identity);
    }

    pub fn sign_out(&self) {
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl IdentityProvider for StaticIdentity {
    fn current(&self) -> Option<Identity> {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_sign_in_out() {
        let provider = StaticIdentity::anonymous();
        assert!(provider.current().is_none());

        let identity = Identity::new(Uuid::new_v4(), "Mira");
        provider.sign_in(identity.clone());
        assert_eq!(provider.current(), Some(identity));

        provider.sign_out();
        assert!(provider.current().is_none());
    }
}
