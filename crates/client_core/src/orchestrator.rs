use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{
    domain::{CartSession, PlanIntent, SessionId},
    error::{CartError, ErrorCode},
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    connectivity::Connectivity,
    retry::{RetryError, RetryPolicy},
    session_store::{CartSessionStore, StoreError},
};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct OrchestratorState {
    pub status: SessionStatus,
    pub session: Option<CartSession>,
    pub error: Option<CartError>,
    pub is_offline: bool,
    pub is_expired: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub attempt_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    /// Debounced intent change; may reuse a matching session.
    Auto,
    Retry,
    Refresh,
    Renewal,
}

impl PassReason {
    fn as_str(self) -> &'static str {
        match self {
            PassReason::Auto => "auto",
            PassReason::Retry => "retry",
            PassReason::Refresh => "refresh",
            PassReason::Renewal => "renewal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub debounce: Duration,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Default)]
struct Control {
    intent: Option<PlanIntent>,
    request_id: u64,
    pass: Option<CancellationToken>,
    debounce: Option<CancellationToken>,
    expiry: Option<CancellationToken>,
}

impl Control {
    fn cancel_all(&mut self) {
        for token in [self.pass.take(), self.debounce.take(), self.expiry.take()]
            .into_iter()
            .flatten()
        {
            token.cancel();
        }
    }
}

struct Inner {
    store: Arc<dyn CartSessionStore>,
    clock: Arc<dyn Clock>,
    connectivity: Connectivity,
    config: OrchestratorConfig,
    shutdown: CancellationToken,
    control: Mutex<Control>,
    state: watch::Sender<OrchestratorState>,
}

/// Must be created inside a tokio runtime. Dropping it disposes it.
pub struct CartOrchestrator {
    inner: Arc<Inner>,
}

impl CartOrchestrator {
    pub fn new(
        store: Arc<dyn CartSessionStore>,
        clock: Arc<dyn Clock>,
        connectivity: Connectivity,
        config: OrchestratorConfig,
    ) -> Self {
        let initial = OrchestratorState {
            is_offline: !connectivity.is_online(),
            ..OrchestratorState::default()
        };
        let (state, _) = watch::channel(initial);
        let inner = Arc::new(Inner {
            store,
            clock,
            connectivity,
            config,
            shutdown: CancellationToken::new(),
            control: Mutex::new(Control::default()),
            state,
        });
        inner.spawn_connectivity_watch();
        Self { inner }
    }

    pub fn state(&self) -> OrchestratorState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.inner.state.subscribe()
    }

    pub fn set_intent(&self, intent: PlanIntent) {
        let inner = &self.inner;
        let token = {
            let mut control = inner.control();
            if inner.shutdown.is_cancelled() || control.intent == Some(intent) {
                return;
            }
            control.intent = Some(intent);
            let token = inner.shutdown.child_token();
            if let Some(previous) = control.debounce.replace(token.clone()) {
                previous.cancel();
            }
            token
        };

        debug!(
            tier = %intent.tier,
            billing_period = %intent.billing_period,
            seat_count = intent.seat_count,
            "cart: intent changed; debouncing"
        );
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(inner.config.debounce) => {
                    inner.reconcile(PassReason::Auto).await;
                }
            }
        });
    }

    pub async fn retry(&self) {
        self.inner.reconcile(PassReason::Retry).await;
    }

    pub async fn refresh(&self) {
        self.inner.reconcile(PassReason::Refresh).await;
    }

    pub async fn clear(&self) {
        let inner = &self.inner;
        {
            let mut control = inner.control();
            if inner.shutdown.is_cancelled() {
                return;
            }
            control.request_id += 1;
            control.cancel_all();
            inner.state.send_replace(OrchestratorState {
                is_offline: !inner.connectivity.is_online(),
                ..OrchestratorState::default()
            });
        }
        info!("cart: session cleared");
        if let Err(err) = inner.store.clear().await {
            warn!(error = %err, "cart: failed to clear stored session");
        }
    }

    pub fn dispose(&self) {
        let mut control = self.inner.control();
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        control.cancel_all();
        self.inner.shutdown.cancel();
        debug!("cart: orchestrator disposed");
    }
}

impl Drop for CartOrchestrator {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Inner {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_pass(&self) -> Option<(u64, CancellationToken, PlanIntent)> {
        let mut control = self.control();
        if self.shutdown.is_cancelled() {
            return None;
        }
        let intent = control.intent?;
        control.request_id += 1;
        let token = self.shutdown.child_token();
        if let Some(previous) = control.pass.replace(token.clone()) {
            previous.cancel();
        }
        self.state.send_modify(|state| {
            state.status = SessionStatus::Loading;
            state.error = None;
            state.attempt_count = 0;
        });
        Some((control.request_id, token, intent))
    }

    fn is_current(&self, request_id: u64) -> bool {
        !self.shutdown.is_cancelled() && self.control().request_id == request_id
    }

    fn apply_if_current(
        &self,
        request_id: u64,
        update: impl FnOnce(&mut OrchestratorState),
    ) -> bool {
        let control = self.control();
        if self.shutdown.is_cancelled() || control.request_id != request_id {
            debug!(
                request_id,
                current = control.request_id,
                "cart: discarding superseded result"
            );
            return false;
        }
        self.state.send_modify(update);
        true
    }

    async fn reconcile(self: &Arc<Self>, reason: PassReason) {
        let Some((request_id, cancel, intent)) = self.begin_pass() else {
            return;
        };
        info!(
            request_id,
            reason = reason.as_str(),
            tier = %intent.tier,
            billing_period = %intent.billing_period,
            seat_count = intent.seat_count,
            "cart: reconciliation pass started"
        );

        if !self.connectivity.is_online() {
            warn!(request_id, "cart: offline; skipping reconciliation");
            self.apply_if_current(request_id, |state| {
                state.is_offline = true;
                state.status = SessionStatus::Error;
                state.error = Some(CartError::offline());
            });
            return;
        }

        if reason == PassReason::Auto {
            let expired = self.state.borrow().is_expired;
            if !expired {
                if let Some(session) = self.matching_session(&intent, &cancel).await {
                    debug!(request_id, session_id = %session.id, "cart: short-circuit");
                    self.accept(request_id, session);
                    return;
                }
            }
        }

        if reason == PassReason::Refresh {
            let cleared = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                cleared = self.store.clear() => cleared,
            };
            if let Err(err) = cleared {
                self.fail(request_id, ErrorCode::Unknown, &err);
                return;
            }
            self.apply_if_current(request_id, |state| state.session = None);
        }

        let outcome = self
            .config
            .retry
            .run(
                &cancel,
                StoreError::is_retryable,
                |attempt| {
                    self.apply_if_current(request_id, |state| state.attempt_count = attempt);
                },
                || self.store.create_or_update(&intent),
            )
            .await;

        match outcome {
            Ok(session) => self.accept(request_id, session),
            Err(RetryError::Cancelled) => {
                debug!(request_id, "cart: pass cancelled");
            }
            Err(err @ RetryError::TimedOut(_)) => self.fail(request_id, ErrorCode::Timeout, &err),
            Err(err @ RetryError::Exhausted { .. }) => {
                self.fail(request_id, ErrorCode::Network, &err)
            }
            Err(RetryError::Rejected(StoreError::SessionExpired(id))) => {
                self.expire_mid_request(request_id, id, &cancel, reason).await
            }
            Err(RetryError::Rejected(err)) => self.fail(request_id, ErrorCode::Unknown, &err),
        }
    }

    async fn matching_session(
        &self,
        intent: &PlanIntent,
        cancel: &CancellationToken,
    ) -> Option<CartSession> {
        let active = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            active = self.store.get_active() => active,
        };
        match active {
            Ok(Some(session)) if session.intent == *intent => Some(session),
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "cart: active session lookup failed; reconciling");
                None
            }
        }
    }

    fn accept(self: &Arc<Self>, request_id: u64, session: CartSession) {
        let now = self.clock.now();
        let accepted = session.clone();
        let applied = self.apply_if_current(request_id, |state| {
            state.status = SessionStatus::Success;
            state.session = Some(accepted);
            state.error = None;
            state.is_expired = false;
            state.last_updated = Some(now);
        });
        if applied {
            info!(
                request_id,
                session_id = %session.id,
                total = session.pricing.total,
                "cart: session reconciled"
            );
            self.schedule_expiry(&session);
        }
    }

    fn fail(&self, request_id: u64, code: ErrorCode, err: &dyn std::error::Error) {
        let error = CartError::new(code, err.to_string());
        if self.apply_if_current(request_id, |state| {
            state.status = SessionStatus::Error;
            state.error = Some(error);
        }) {
            warn!(request_id, code = %code, error = %err, "cart: reconciliation failed");
        }
    }

    // A failed renewal is not renewed again.
    async fn expire_mid_request(
        self: &Arc<Self>,
        request_id: u64,
        id: SessionId,
        cancel: &CancellationToken,
        reason: PassReason,
    ) {
        if !self.is_current(request_id) {
            return;
        }
        let cleared = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            cleared = self.store.clear() => cleared,
        };
        if let Err(err) = cleared {
            warn!(error = %err, "cart: failed to clear expired session");
        }

        let error = CartError::new(ErrorCode::Expired, format!("cart session {id} expired"));
        let applied = self.apply_if_current(request_id, |state| {
            state.status = SessionStatus::Error;
            state.error = Some(error);
            state.session = None;
            state.is_expired = true;
        });
        if !applied {
            return;
        }
        warn!(request_id, session_id = %id, "cart: session expired mid-request");
        if reason != PassReason::Renewal {
            self.spawn_renewal();
        }
    }

    fn spawn_renewal(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.reconcile(PassReason::Renewal).await;
        });
    }

    fn schedule_expiry(self: &Arc<Self>, session: &CartSession) {
        let token = self.shutdown.child_token();
        if let Some(previous) = self.control().expiry.replace(token.clone()) {
            previous.cancel();
        }

        let remaining = session.time_to_expiry(self.clock.now());
        if remaining.is_zero() {
            self.mark_expired(session.id);
            return;
        }

        let inner = Arc::clone(self);
        let session_id = session.id;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(remaining) => inner.mark_expired(session_id),
            }
        });
    }

    fn mark_expired(self: &Arc<Self>, session_id: SessionId) {
        let transitioned = {
            let _control = self.control();
            if self.shutdown.is_cancelled() {
                return;
            }
            self.state.send_if_modified(|state| match &state.session {
                Some(current) if current.id == session_id && !state.is_expired => {
                    state.is_expired = true;
                    true
                }
                _ => false,
            })
        };
        if !transitioned {
            return;
        }

        info!(session_id = %session_id, "cart: session expired; renewing");
        self.spawn_renewal();
    }

    fn spawn_connectivity_watch(self: &Arc<Self>) {
        let mut online = self.connectivity.subscribe();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => break,
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let is_online = *online.borrow_and_update();
                inner.on_connectivity_changed(is_online);
            }
        });
    }

    fn on_connectivity_changed(self: &Arc<Self>, online: bool) {
        let resume = {
            let _control = self.control();
            if self.shutdown.is_cancelled() {
                return;
            }
            let mut resume = false;
            self.state.send_modify(|state| {
                state.is_offline = !online;
                resume = online && state.error.as_ref().is_some_and(CartError::is_offline);
            });
            resume
        };

        if resume {
            info!("cart: back online; retrying");
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.reconcile(PassReason::Retry).await;
            });
        }
    }
}

#[cfg(test)]
#[path = "tests/orchestrator_tests.rs"]
mod tests;
