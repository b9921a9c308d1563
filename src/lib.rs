//! Credit and usage gating for metered AI actions
//!
//! Decides whether a user may run a paid generation, keeps daily and vault
//! quotas, resets them daily, and derives the banners shown to the user.

pub mod banner;
pub mod config;
pub mod credits;
pub mod error;
pub mod generation;
pub mod profile;
pub mod storage;

pub use banner::{Banner, BannerSeverity, UsageBar};
pub use config::CreditProtectionConfig;
pub use credits::{
    BypassFlag, Consumption, CreditCheck, CreditProtection, Credits, DenialReason, Meter,
    ProtectionLevel, QuotaService, QuotaSnapshot, SubscriptionTier, UsageStats,
};
pub use error::{CreditError, CreditResult};
pub use generation::{GenerationOutcome, Generator, MeteredAction};
pub use profile::{ContentKind, ContentRef, ProfileStore, UserProfile};

use tracing_subscriber::EnvFilter;

/// Load `.env` from the working directory, falling back to the parent
pub fn load_env() {
    if dotenvy::dotenv().is_err() {
        // Try loading from parent directory (workspace root)
        let _ = dotenvy::from_path("../.env");
    }
}

/// Install the fmt subscriber with a `RUST_LOG` filter
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,credit_gate=info")),
        )
        .try_init();
}

/// Load the environment and open the service in the default data directory
pub fn open_default() -> CreditResult<QuotaService> {
    load_env();
    init_tracing();
    let config = CreditProtectionConfig::from_env()?;
    let dir = config::data_dir();
    tracing::info!(dir = ?dir, limit = config.daily_free_limit, "Starting credit gate");
    QuotaService::open(config, &dir)
}
