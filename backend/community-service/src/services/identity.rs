use parking_lot::RwLock;

use crate::domain::Identity;

/// Supplies the signed-in caller, if any
pub trait IdentityProvider: Send + Sync {
    fn current_identity(&self) -> Option<Identity>;
}

/// Identity that can be switched between signed in and signed out at runtime
#[derive(Debug, Default)]
pub struct StaticIdentity {
    current: RwLock<Option<Identity>>,
}

impl StaticIdentity {
    pub fn signed_in(identity: Identity) -> Self {
        Self {
            current: RwLock::new(Some(identity)),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, identity: Identity) {
        *self.current.write() = Some(identity);
    }

    pub fn sign_out(&self) {
        *self.current.write() = None;
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_identity(&self) -> Option<Identity> {
        self.current.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_in_and_out() {
        let provider = StaticIdentity::signed_out();
        assert!(provider.current_identity().is_none());

        provider.sign_in(Identity::new("u1", "Uma"));
        assert_eq!(provider.current_identity().unwrap().user_id, "u1");

        provider.sign_out();
        assert!(provider.current_identity().is_none());
    }
}
