use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::TimeDelta;
use shared::domain::{CartSession, PlanIntent, SessionId};
use storage::SlotStore;
use thiserror::Error;
use tracing::{debug, info};

use crate::{clock::Clock, pricing::Pricer, pricing::PricingError};

pub const ACTIVE_SESSION_KEY: &str = "cart_session.active";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cart session {0} no longer exists")]
    SessionNotFound(SessionId),
    #[error("cart session {0} expired")]
    SessionExpired(SessionId),
    #[error(transparent)]
    Pricing(#[from] PricingError),
    #[error("stored cart session is unreadable: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("session backend failure: {source}")]
    Backend { source: anyhow::Error },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Backend { .. } => true,
            StoreError::SessionNotFound(_)
            | StoreError::SessionExpired(_)
            | StoreError::Pricing(_)
            | StoreError::Corrupt(_) => false,
        }
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(source: anyhow::Error) -> Self {
        StoreError::Backend { source }
    }
}

#[async_trait]
pub trait CartSessionStore: Send + Sync {
    /// The stored session while `expires_at > now`. Expired records are
    /// reported as absent but left in place.
    async fn get_active(&self) -> Result<Option<CartSession>, StoreError>;
    async fn create_or_update(&self, intent: &PlanIntent) -> Result<CartSession, StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct SessionStoreConfig {
    pub slot_key: String,
    pub session_ttl: TimeDelta,
    /// Simulated round trip between reading the slot and writing it back.
    pub latency: Duration,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            slot_key: ACTIVE_SESSION_KEY.to_string(),
            session_ttl: TimeDelta::hours(24),
            latency: Duration::ZERO,
        }
    }
}

pub struct SessionStore {
    backend: Arc<dyn SlotStore>,
    pricer: Pricer,
    clock: Arc<dyn Clock>,
    config: SessionStoreConfig,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SlotStore>, pricer: Pricer, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(backend, pricer, clock, SessionStoreConfig::default())
    }

    pub fn with_config(
        backend: Arc<dyn SlotStore>,
        pricer: Pricer,
        clock: Arc<dyn Clock>,
        config: SessionStoreConfig,
    ) -> Self {
        Self {
            backend,
            pricer,
            clock,
            config,
        }
    }

    pub async fn load(&self) -> Result<Option<CartSession>, StoreError> {
        let Some(raw) = self.backend.get(&self.config.slot_key).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    async fn save(&self, session: &CartSession) -> Result<(), StoreError> {
        let raw = serde_json::to_string(session)?;
        self.backend.set(&self.config.slot_key, &raw).await?;
        Ok(())
    }

    pub async fn create(&self, intent: &PlanIntent) -> Result<CartSession, StoreError> {
        let pricing = self.pricer.quote(intent)?;
        let now = self.clock.now();
        let session = CartSession {
            id: SessionId::new(),
            intent: *intent,
            pricing,
            created_at: now,
            updated_at: now,
            expires_at: now + self.config.session_ttl,
        };
        self.save(&session).await?;
        info!(
            session_id = %session.id,
            tier = %intent.tier,
            seat_count = intent.seat_count,
            total = session.pricing.total,
            "store: cart session created"
        );
        Ok(session)
    }

    pub async fn update(
        &self,
        id: SessionId,
        intent: &PlanIntent,
    ) -> Result<CartSession, StoreError> {
        let mut session = match self.load().await? {
            Some(session) if session.id == id => session,
            _ => return Err(StoreError::SessionNotFound(id)),
        };
        let now = self.clock.now();
        if session.is_expired_at(now) {
            return Err(StoreError::SessionExpired(id));
        }

        session.pricing = self.pricer.quote(intent)?;
        session.intent = *intent;
        session.updated_at = now;
        self.save(&session).await?;
        info!(
            session_id = %session.id,
            tier = %intent.tier,
            seat_count = intent.seat_count,
            total = session.pricing.total,
            "store: cart session repriced"
        );
        Ok(session)
    }

    async fn simulate_latency(&self) {
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
    }
}

#[async_trait]
impl CartSessionStore for SessionStore {
    async fn get_active(&self) -> Result<Option<CartSession>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .load()
            .await?
            .filter(|session| !session.is_expired_at(now)))
    }

    async fn create_or_update(&self, intent: &PlanIntent) -> Result<CartSession, StoreError> {
        let active = self.get_active().await?;
        if let Some(session) = &active {
            if session.intent == *intent {
                debug!(session_id = %session.id, "store: intent unchanged; reusing session");
                return Ok(session.clone());
            }
        }

        self.simulate_latency().await;
        match active {
            Some(session) => self.update(session.id, intent).await,
            None => self.create(intent).await,
        }
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.backend.remove(&self.config.slot_key).await?;
        debug!("store: cart session cleared");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/session_store_tests.rs"]
mod tests;
