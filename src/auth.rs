//! The authenticated principal that scopes remote rows.

use std::future::Future;
use std::sync::{Arc, RwLock};

pub trait AuthProvider: Send + Sync + 'static {
    /// The signed-in principal's id, or `None` when signed out.
    fn current_principal(&self) -> impl Future<Output = Option<String>> + Send;
}

/// Holds the principal of the current session. Clones share the session.
#[derive(Clone, Default)]
pub struct SessionAuth {
    principal: Arc<RwLock<Option<String>>>,
}

impl SessionAuth {
    pub fn new(principal: Option<String>) -> Self {
        Self {
            principal: Arc::new(RwLock::new(principal)),
        }
    }

    pub fn signed_in(principal: impl Into<String>) -> Self {
        Self::new(Some(principal.into()))
    }

    pub fn sign_in(&self, principal: impl Into<String>) {
        *self.principal.write().unwrap_or_else(|e| e.into_inner()) = Some(principal.into());
    }

    pub fn sign_out(&self) {
        *self.principal.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn principal(&self) -> Option<String> {
        self.principal
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl AuthProvider for SessionAuth {
    async fn current_principal(&self) -> Option<String> {
        self.principal()
    }
}
