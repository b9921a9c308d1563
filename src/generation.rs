//! Metered AI actions
//!
//! Wraps a caller's upstream generation call: credits are consumed before
//! the call, kept on success and refunded on failure. A failed call never
//! looks like a success; if a demo fallback is configured the caller gets
//! [`GenerationOutcome::Fallback`] carrying the upstream error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use tracing::{debug, warn};

use crate::credits::{Meter, QuotaService};
use crate::error::{CreditError, CreditResult};
use crate::profile::ContentKind;

/// Upstream AI provider seam
#[async_trait]
pub trait Generator: Send + Sync {
    type Output: Send;

    async fn generate(&self, prompt: &str) -> Result<Self::Output, String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(tag = "status")]
pub enum GenerationOutcome<T> {
    #[serde(rename = "generated")]
    Generated { content: T },
    /// Upstream failed; `content` is demo output and credits were refunded
    #[serde(rename = "fallback")]
    Fallback { content: T, error: String },
}

impl<T> GenerationOutcome<T> {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }

    pub fn content(&self) -> &T {
        match self {
            Self::Generated { content } | Self::Fallback { content, .. } => content,
        }
    }

    pub fn into_content(self) -> T {
        match self {
            Self::Generated { content } | Self::Fallback { content, .. } => content,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Fallback { error, .. } => Some(error),
            Self::Generated { .. } => None,
        }
    }
}

/// One metered action: what it draws from and what happens after
#[derive(Debug, Clone)]
pub struct MeteredAction<T> {
    meter: Meter,
    amount: u32,
    content: Option<(ContentKind, String)>,
    fallback: Option<T>,
}

impl<T> MeteredAction<T> {
    pub fn new(meter: Meter) -> Self {
        Self {
            meter,
            amount: 1,
            content: None,
            fallback: None,
        }
    }

    /// Number of credits the action costs (default 1)
    pub fn amount(mut self, amount: u32) -> Self {
        self.amount = amount;
        self
    }

    /// Record a content reference on the profile after a successful run
    pub fn record_content(mut self, kind: ContentKind, title: impl Into<String>) -> Self {
        self.content = Some((kind, title.into()));
        self
    }

    /// Demo output returned when the upstream call fails
    pub fn with_fallback(mut self, demo: T) -> Self {
        self.fallback = Some(demo);
        self
    }

    /// Consume, await `op`, then commit or refund
    pub async fn run<F, E>(
        self,
        service: &QuotaService,
        uid: &str,
        op: F,
    ) -> CreditResult<GenerationOutcome<T>>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let consumption = service.try_consume(uid, self.meter, self.amount)?;

        match op.await {
            Ok(content) => {
                if let Some((kind, title)) = &self.content {
                    // Credits stay spent even if the content ref cannot be stored
                    if let Err(e) = service.add_content(uid, *kind, title) {
                        warn!(uid, error = %e, "Failed to record generated content");
                    }
                }
                debug!(uid, remaining = %consumption.remaining, "Metered action succeeded");
                Ok(GenerationOutcome::Generated { content })
            }
            Err(e) => {
                let error = e.to_string();
                warn!(uid, error = %error, "Upstream call failed, refunding credits");
                service.refund(consumption)?;
                match self.fallback {
                    Some(content) => Ok(GenerationOutcome::Fallback { content, error }),
                    None => Err(CreditError::Upstream(error)),
                }
            }
        }
    }

    /// Run against a [`Generator`]
    pub async fn generate<G>(
        self,
        service: &QuotaService,
        uid: &str,
        generator: &G,
        prompt: &str,
    ) -> CreditResult<GenerationOutcome<T>>
    where
        G: Generator<Output = T> + ?Sized,
    {
        self.run(service, uid, generator.generate(prompt)).await
    }
}
