//! Decision oracle adapter
//!
//! Wraps an external intent classifier behind one call that yields a validated
//! [`Decision`]. The classifier is built on first use; concurrent first callers
//! share a single initialisation and wait for it to finish.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::OracleError;
use crate::types::{Decision, RawDecision};

/// Default deadline for one classification
pub const DEFAULT_ORACLE_TIMEOUT: Duration = Duration::from_secs(60);

/// The external classifier
#[async_trait]
pub trait DecisionBackend: Send + Sync {
    async fn classify(&self, system_prompt: &str, message: &str) -> Result<RawDecision, OracleError>;
}

/// Builds the classifier; may be expensive
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self) -> anyhow::Result<Arc<dyn DecisionBackend>>;
}

struct Prebuilt(Arc<dyn DecisionBackend>);

#[async_trait]
impl BackendFactory for Prebuilt {
    async fn create(&self) -> anyhow::Result<Arc<dyn DecisionBackend>> {
        Ok(Arc::clone(&self.0))
    }
}

/// Uniform two-outcome decision over a lazily built classifier
pub struct DecisionOracle {
    backend: OnceCell<Arc<dyn DecisionBackend>>,
    factory: Arc<dyn BackendFactory>,
    timeout: Duration,
}

impl DecisionOracle {
    pub fn new(factory: Arc<dyn BackendFactory>, timeout: Duration) -> Self {
        Self {
            backend: OnceCell::new(),
            factory,
            timeout,
        }
    }

    /// Oracle over an already constructed backend
    pub fn with_backend(backend: Arc<dyn DecisionBackend>, timeout: Duration) -> Self {
        Self::new(Arc::new(Prebuilt(backend)), timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_initialized(&self) -> bool {
        self.backend.initialized()
    }

    async fn backend(&self) -> Result<&Arc<dyn DecisionBackend>, OracleError> {
        self.backend
            .get_or_try_init(|| async {
                debug!("Initialising decision backend");
                let backend = self
                    .factory
                    .create()
                    .await
                    .map_err(|e| OracleError::Init(format!("{e:#}")))?;
                info!("Decision backend ready");
                Ok(backend)
            })
            .await
    }

    /// Classify `message` under `prompt`. Exactly one backend call, no retry.
    pub async fn decide(&self, prompt: &str, message: &str) -> Result<Decision, OracleError> {
        let backend = self.backend().await?;

        let raw = match tokio::time::timeout(self.timeout, backend.classify(prompt, message)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "Decision oracle timed out");
                return Err(OracleError::Timeout(self.timeout));
            }
        };

        let decision = Decision::try_from(raw).inspect_err(|e| {
            warn!(error = %e, "Decision oracle returned an invalid decision");
        })?;

        info!(
            action = %decision.action(),
            agent = ?decision.agent(),
            "Decision made"
        );
        Ok(decision)
    }
}
