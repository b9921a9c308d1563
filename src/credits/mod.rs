//! Credit gating
//!
//! Decides whether a user may run a metered AI action. Two quotas exist side
//! by side: a daily call counter guarded by [`CreditProtection`], and the
//! persisted vault-credit balance checked by [`VaultQuota`]. [`QuotaService`]
//! owns both and is the entry point for callers.

pub mod bypass;
pub mod clock;
pub mod protection;
pub mod service;
pub mod types;
pub mod usage;
pub mod vault;

pub use bypass::{BypassFlag, GOD_MODE_KEY};
pub use clock::{Clock, ManualClock, SystemClock};
pub use protection::CreditProtection;
pub use service::{Consumption, QuotaService};
pub use types::*;
pub use usage::UsageLedger;
pub use vault::VaultQuota;
