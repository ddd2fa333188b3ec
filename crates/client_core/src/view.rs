use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{
    domain::{BillingPeriod, PlanTier, SessionId},
    error::ErrorCode,
};

use crate::orchestrator::{OrchestratorState, SessionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Affordance {
    #[default]
    None,
    /// Recovery is automatic once connectivity returns.
    WaitForNetwork,
    OfferRetry,
    Renewing,
}

impl Affordance {
    pub fn for_error(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Offline => Affordance::WaitForNetwork,
            ErrorCode::Timeout | ErrorCode::Network | ErrorCode::Unknown => {
                Affordance::OfferRetry
            }
            ErrorCode::Expired => Affordance::Renewing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CartView {
    pub status: SessionStatus,
    pub busy: bool,
    pub session_id: Option<SessionId>,
    pub tier: Option<PlanTier>,
    pub billing_period: Option<BillingPeriod>,
    pub seat_count: Option<u32>,
    pub subtotal: Option<f64>,
    pub discount: Option<f64>,
    pub total: Option<f64>,
    pub expires_in_secs: Option<u64>,
    pub message: Option<String>,
    pub attempt: u32,
    pub offline: bool,
    pub affordance: Affordance,
}

impl CartView {
    pub fn project(state: &OrchestratorState, now: DateTime<Utc>) -> Self {
        let session = state.session.as_ref();
        let affordance = match &state.error {
            Some(error) => Affordance::for_error(error.code),
            None if state.is_expired => Affordance::Renewing,
            None => Affordance::None,
        };

        Self {
            status: state.status,
            busy: state.status == SessionStatus::Loading,
            session_id: session.map(|s| s.id),
            tier: session.map(|s| s.intent.tier),
            billing_period: session.map(|s| s.intent.billing_period),
            seat_count: session.map(|s| s.intent.seat_count),
            subtotal: session.map(|s| s.pricing.subtotal),
            discount: session.map(|s| s.pricing.discount),
            total: session.map(|s| s.pricing.total),
            expires_in_secs: session
                .filter(|_| !state.is_expired)
                .map(|s| s.time_to_expiry(now).as_secs()),
            message: state.error.as_ref().map(|error| error.message.clone()),
            attempt: state.attempt_count,
            offline: state.is_offline,
            affordance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use shared::{
        domain::{CartSession, PlanIntent, Pricing},
        error::CartError,
    };

    fn session(now: DateTime<Utc>) -> CartSession {
        CartSession {
            id: SessionId::new(),
            intent: PlanIntent::new(PlanTier::Standard, BillingPeriod::Annual, 3),
            pricing: Pricing {
                subtotal: 120.0,
                discount: 19.2,
                total: 100.8,
            },
            created_at: now,
            updated_at: now,
            expires_at: now + TimeDelta::hours(24),
        }
    }

    #[test]
    fn success_projects_session_fields() {
        let now = Utc::now();
        let session = session(now);
        let state = OrchestratorState {
            status: SessionStatus::Success,
            session: Some(session.clone()),
            last_updated: Some(now),
            ..OrchestratorState::default()
        };

        let view = CartView::project(&state, now + TimeDelta::hours(1));

        assert!(!view.busy);
        assert_eq!(view.session_id, Some(session.id));
        assert_eq!(view.seat_count, Some(3));
        assert_eq!(view.total, Some(100.8));
        assert_eq!(view.expires_in_secs, Some(23 * 3600));
        assert_eq!(view.affordance, Affordance::None);
    }

    #[test]
    fn error_codes_map_to_affordances() {
        assert_eq!(
            Affordance::for_error(ErrorCode::Offline),
            Affordance::WaitForNetwork
        );
        for code in [ErrorCode::Timeout, ErrorCode::Network, ErrorCode::Unknown] {
            assert_eq!(Affordance::for_error(code), Affordance::OfferRetry);
        }
        assert_eq!(Affordance::for_error(ErrorCode::Expired), Affordance::Renewing);
    }

    #[test]
    fn expired_session_awaiting_renewal_shows_renewing() {
        let now = Utc::now();
        let state = OrchestratorState {
            status: SessionStatus::Loading,
            session: Some(session(now)),
            is_expired: true,
            ..OrchestratorState::default()
        };

        let view = CartView::project(&state, now + TimeDelta::hours(25));

        assert!(view.busy);
        assert_eq!(view.expires_in_secs, None);
        assert_eq!(view.affordance, Affordance::Renewing);
    }

    #[test]
    fn offline_error_carries_message() {
        let state = OrchestratorState {
            status: SessionStatus::Error,
            error: Some(CartError::offline()),
            is_offline: true,
            ..OrchestratorState::default()
        };

        let view = CartView::project(&state, Utc::now());

        assert!(view.offline);
        assert!(view.message.is_some());
        assert_eq!(view.affordance, Affordance::WaitForNetwork);
    }
}
