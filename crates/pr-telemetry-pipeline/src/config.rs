use std::time::Duration;

use pr_telemetry_domain::PipelineError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// How long a committed chunk result answers duplicate submissions.
    pub idempotency_retention_secs: u64,
    /// Lease on an uncommitted reservation; a crashed submission frees its key after this.
    pub reservation_lease_ms: u64,
    pub reservation_poll_ms: u64,
    pub finalization_lease_secs: u64,
    pub max_events_per_chunk: usize,
    pub max_artifact_bytes: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            idempotency_retention_secs: 86_400,
            reservation_lease_ms: 30_000,
            reservation_poll_ms: 25,
            finalization_lease_secs: 300,
            max_events_per_chunk: 10_000,
            max_artifact_bytes: 64 * 1024 * 1024,
        }
    }
}

impl PipelineConfig {
    /// # Errors
    /// Returns `PipelineError::Config` naming the first zero-valued setting.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let checks = [
            ("idempotency_retention_secs", self.idempotency_retention_secs),
            ("reservation_lease_ms", self.reservation_lease_ms),
            ("reservation_poll_ms", self.reservation_poll_ms),
            ("finalization_lease_secs", self.finalization_lease_secs),
            (
                "max_events_per_chunk",
                u64::try_from(self.max_events_per_chunk).unwrap_or(u64::MAX),
            ),
            ("max_artifact_bytes", self.max_artifact_bytes),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(PipelineError::Config(format!(
                    "pipeline.{name} must be greater than zero"
                )));
            }
        }
        if self.reservation_poll_ms > self.reservation_lease_ms {
            return Err(PipelineError::Config(
                "pipeline.reservation_poll_ms must not exceed reservation_lease_ms".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn idempotency_retention(&self) -> Duration {
        Duration::from_secs(self.idempotency_retention_secs)
    }

    #[must_use]
    pub fn reservation_lease(&self) -> Duration {
        Duration::from_millis(self.reservation_lease_ms)
    }

    #[must_use]
    pub fn reservation_poll(&self) -> Duration {
        Duration::from_millis(self.reservation_poll_ms)
    }

    #[must_use]
    pub fn finalization_lease(&self) -> Duration {
        Duration::from_secs(self.finalization_lease_secs)
    }
}
