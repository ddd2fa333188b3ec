mod config;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use client_core::{
    CartOrchestrator, CartView, Clock, Connectivity, OrchestratorState, SessionStatus,
    SessionStore, TokioClock,
};
use serde::Serialize;
use shared::domain::{BillingPeriod, PlanIntent, PlanTier};
use storage::{MemorySlotStore, SlotStore, Storage};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Drives one cart session through a scripted sequence of seat counts and
/// prints every state transition as a JSON line.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "cart.toml")]
    config: PathBuf,
    /// Overrides `database_url` from the config file.
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long, default_value = "standard")]
    tier: PlanTier,
    #[arg(long, default_value = "monthly")]
    billing_period: BillingPeriod,
    #[arg(long, value_delimiter = ',', default_values_t = [2, 3, 4])]
    seats: Vec<u32>,
    /// Pause between consecutive intents.
    #[arg(long, default_value_t = 100)]
    step_ms: u64,
    /// Drop connectivity just before the intent at this index.
    #[arg(long)]
    offline_at: Option<usize>,
    #[arg(long, default_value_t = 1500)]
    offline_ms: u64,
    /// Discard the reconciled session and create a fresh one at the end.
    #[arg(long)]
    refresh: bool,
    /// Clear the session before exiting.
    #[arg(long)]
    clear: bool,
    #[arg(long, default_value_t = 8000)]
    settle_ms: u64,
}

#[derive(Serialize)]
struct Transition<'a> {
    at: DateTime<Utc>,
    state: &'a OrchestratorState,
    view: CartView,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = config::load_settings(&args.config)?;
    if let Some(url) = &args.database_url {
        settings.database_url = config::normalize_database_url(url);
    }

    let backend: Arc<dyn SlotStore> = match &settings.database_url {
        Some(url) => {
            let storage = Storage::new(url)
                .await
                .with_context(|| format!("failed to open session database '{url}'"))?;
            storage.health_check().await?;
            info!(database_url = %url, slots = storage.slot_count().await?, "storage ready");
            Arc::new(storage)
        }
        None => Arc::new(MemorySlotStore::new()),
    };

    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let connectivity = Connectivity::online();
    let store = SessionStore::with_config(
        backend,
        settings.pricer(),
        clock.clone(),
        settings.session_store_config(),
    );
    let orchestrator = CartOrchestrator::new(
        Arc::new(store),
        clock.clone(),
        connectivity.clone(),
        settings.orchestrator_config(),
    );

    let printer = tokio::spawn(print_transitions(orchestrator.subscribe(), clock.clone()));

    let plan = PlanIntent::new(args.tier, args.billing_period, 1);
    for (index, seat_count) in args.seats.iter().copied().enumerate() {
        if args.offline_at == Some(index) {
            simulate_outage(&connectivity, Duration::from_millis(args.offline_ms));
        }
        orchestrator.set_intent(plan.with_seats(seat_count));
        tokio::time::sleep(Duration::from_millis(args.step_ms)).await;
    }
    let last_intent = args.seats.last().map(|&seats| plan.with_seats(seats));
    settle(&orchestrator, last_intent, Duration::from_millis(args.settle_ms)).await;

    if args.refresh {
        orchestrator.refresh().await;
    }
    if args.clear {
        orchestrator.clear().await;
    }

    let final_state = orchestrator.state();
    match &final_state.session {
        Some(session) => info!(
            session_id = %session.id,
            seat_count = session.intent.seat_count,
            total = session.pricing.total,
            "final session"
        ),
        None => info!(status = ?final_state.status, "no active session"),
    }

    orchestrator.dispose();
    drop(orchestrator);
    if tokio::time::timeout(Duration::from_secs(1), printer)
        .await
        .is_err()
    {
        warn!("transition printer did not stop");
    }
    Ok(())
}

fn simulate_outage(connectivity: &Connectivity, outage: Duration) {
    connectivity.set_online(false);
    let connectivity = connectivity.clone();
    tokio::spawn(async move {
        tokio::time::sleep(outage).await;
        connectivity.set_online(true);
    });
}

/// Waits until `expected` is reconciled or fails for good, or `limit` passes.
async fn settle(orchestrator: &CartOrchestrator, expected: Option<PlanIntent>, limit: Duration) {
    let Some(expected) = expected else {
        return;
    };
    let mut rx = orchestrator.subscribe();
    let settled = tokio::time::timeout(
        limit,
        rx.wait_for(|state| match state.status {
            SessionStatus::Success => state
                .session
                .as_ref()
                .is_some_and(|session| session.intent == expected),
            SessionStatus::Error => !state.is_offline,
            SessionStatus::Idle | SessionStatus::Loading => false,
        }),
    )
    .await
    .is_ok();
    if !settled {
        warn!(?limit, "cart did not settle in time");
    }
}

async fn print_transitions(mut rx: watch::Receiver<OrchestratorState>, clock: Arc<dyn Clock>) {
    while rx.changed().await.is_ok() {
        let state = rx.borrow_and_update().clone();
        if let Err(err) = emit(&state, clock.now()) {
            warn!(error = %err, "failed to print transition");
        }
    }
}

fn emit(state: &OrchestratorState, now: DateTime<Utc>) -> Result<()> {
    let transition = Transition {
        at: now,
        state,
        view: CartView::project(state, now),
    };
    println!("{}", serde_json::to_string(&transition)?);
    Ok(())
}
