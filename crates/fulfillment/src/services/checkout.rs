//! Checkout collaborator trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::{CheckoutSessionId, UserId};
use domain::{CheckoutSession, CheckoutStatus};
use tokio::sync::RwLock;

use crate::error::ServiceError;

/// Read/update access to checkout sessions.
#[async_trait]
pub trait CheckoutService: Send + Sync {
    /// Returns the session only if it is `pending` and owned by `user_id`.
    async fn find_pending_session(
        &self,
        session_id: CheckoutSessionId,
        user_id: UserId,
    ) -> Result<Option<CheckoutSession>, ServiceError>;

    /// Moves a session from `pending` to `processing`.
    async fn mark_processing(&self, session_id: CheckoutSessionId) -> Result<(), ServiceError>;
}

#[async_trait]
impl<T: CheckoutService + ?Sized> CheckoutService for Arc<T> {
    async fn find_pending_session(
        &self,
        session_id: CheckoutSessionId,
        user_id: UserId,
    ) -> Result<Option<CheckoutSession>, ServiceError> {
        (**self).find_pending_session(session_id, user_id).await
    }

    async fn mark_processing(&self, session_id: CheckoutSessionId) -> Result<(), ServiceError> {
        (**self).mark_processing(session_id).await
    }
}

/// In-memory checkout service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckoutService {
    sessions: Arc<RwLock<HashMap<CheckoutSessionId, CheckoutSession>>>,
    fail_on_mark_processing: Arc<AtomicBool>,
}

impl InMemoryCheckoutService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_session(&self, session: CheckoutSession) {
        self.sessions.write().await.insert(session.id, session);
    }

    /// Configures `mark_processing` to fail.
    pub fn set_fail_on_mark_processing(&self, fail: bool) {
        self.fail_on_mark_processing.store(fail, Ordering::SeqCst);
    }

    pub async fn session_status(&self, session_id: CheckoutSessionId) -> Option<CheckoutStatus> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .map(|session| session.status)
    }
}

#[async_trait]
impl CheckoutService for InMemoryCheckoutService {
    async fn find_pending_session(
        &self,
        session_id: CheckoutSessionId,
        user_id: UserId,
    ) -> Result<Option<CheckoutSession>, ServiceError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(&session_id)
            .filter(|s| s.user_id == user_id && s.status == CheckoutStatus::Pending)
            .cloned())
    }

    async fn mark_processing(&self, session_id: CheckoutSessionId) -> Result<(), ServiceError> {
        if self.fail_on_mark_processing.load(Ordering::SeqCst) {
            return Err(ServiceError::Upstream {
                status: 503,
                message: "checkout store unavailable".to_string(),
            });
        }
        if let Some(session) = self.sessions.write().await.get_mut(&session_id) {
            session.status = CheckoutStatus::Processing;
        }
        Ok(())
    }
}
