pub mod clock;
pub mod connectivity;
pub mod orchestrator;
pub mod pricing;
pub mod retry;
pub mod session_store;
pub mod view;

pub use clock::{Clock, ManualClock, TokioClock};
pub use connectivity::Connectivity;
pub use orchestrator::{
    CartOrchestrator, OrchestratorConfig, OrchestratorState, SessionStatus, DEFAULT_DEBOUNCE,
};
pub use pricing::{PriceBook, PriceSource, Pricer, PricingError};
pub use retry::{RetryError, RetryPolicy};
pub use session_store::{CartSessionStore, SessionStore, SessionStoreConfig, StoreError};
pub use view::{Affordance, CartView};
