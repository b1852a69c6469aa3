// ABOUTME: Decides whether an operation is done by reconciling pushed signals with backend probes
// ABOUTME: Bounds lost operations with the missing-signal window and detects stalled progress

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::message::Signal;
use crate::backends::{BackendRegistry, ProbeStatus};
use crate::operation::{Operation, Result, Timestamp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatorConfig {
    /// How long past the first empty probe a result may still appear.
    #[serde(with = "humantime_serde")]
    pub missing_signal_window: Duration,
    /// Consecutive wake-ups without progress before an operation counts as stalled.
    /// Zero disables stall detection.
    pub stall_wakeups: u32,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            missing_signal_window: Duration::from_secs(600),
            stall_wakeups: 3,
        }
    }
}

/// Outcome of one completion check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// A result is attached.
    Completed,
    Running,
    /// Still running, but its progress proxy has not moved for too many wake-ups.
    Stalled,
    /// No result appeared within the missing-signal window; the operation was force-failed.
    Lost,
}

#[derive(Debug, Clone, Default)]
pub struct Correlator {
    config: CorrelatorConfig,
}

impl Correlator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Fast path: attaches the result carried by a signal for this operation.
    ///
    /// Returns `false` for a signal about another operation, or when a result
    /// is already attached.
    pub fn apply_signal(operation: &mut Operation, signal: &Signal) -> Result<bool> {
        if operation.id()? != &signal.operation_id {
            return Ok(false);
        }
        if operation.has_completed() {
            debug!(
                "Ignoring signal {} for already completed {}",
                signal.signal_id, signal.operation_id
            );
            return Ok(false);
        }
        let attached = operation.attach_result(signal.to_result()?);
        if attached {
            debug!(
                "Attached result for {} from signal {}",
                signal.operation_id, signal.signal_id
            );
        }
        Ok(attached)
    }

    /// True once `now` is strictly past the missing-signal failure time plus the window.
    pub fn missing_signal_expired(&self, operation: &Operation, now: Timestamp) -> bool {
        let window = i64::try_from(self.config.missing_signal_window.as_secs()).unwrap_or(i64::MAX);
        operation
            .missing_signal_failure_time()
            .is_some_and(|failed_at| now > failed_at.saturating_add(window))
    }

    /// Fallback path: probes the backend when no result is cached.
    ///
    /// Backend outages surface as transient errors; the caller keeps waiting.
    /// Completed operations are released by whoever collects their result.
    pub async fn check(
        &self,
        operation: &mut Operation,
        backends: &BackendRegistry,
        now: Timestamp,
    ) -> Result<Completion> {
        if operation.has_completed() {
            return Ok(Completion::Completed);
        }

        let backend = backends.require(operation.backend())?;
        let running = match backend.probe_status(operation).await? {
            ProbeStatus::Finished(result) => {
                operation.attach_result(result);
                return Ok(Completion::Completed);
            }
            ProbeStatus::Unknown => {
                if operation.missing_signal_failure_time().is_none() {
                    debug!(
                        "Backend '{}' has no record of {}; starting missing-signal window",
                        operation.backend(),
                        operation.id()?
                    );
                }
                operation.set_missing_signal_failure_time(now)?;
                false
            }
            ProbeStatus::Running => true,
        };

        if self.missing_signal_expired(operation, now) {
            let reason = format!(
                "No result for {} within {}s of the first missing signal",
                operation.id()?,
                self.config.missing_signal_window.as_secs()
            );
            warn!("{}", reason);
            self.force_fail(operation, backends, &reason, now).await?;
            return Ok(Completion::Lost);
        }

        if running && self.config.stall_wakeups > 0 {
            if let Some(sample) = backend.fetch_progress(operation).await? {
                let unchanged = operation.progress_mut().record(sample, now);
                if unchanged >= self.config.stall_wakeups {
                    debug!(
                        "{} shows no progress for {} wake-ups",
                        operation.id()?,
                        unchanged
                    );
                    return Ok(Completion::Stalled);
                }
            }
        }

        Ok(Completion::Running)
    }

    /// Best-effort kill followed by an unconditional force-fail.
    ///
    /// A failed kill is logged and does not stop the force-fail.
    pub async fn force_fail(
        &self,
        operation: &mut Operation,
        backends: &BackendRegistry,
        reason: &str,
        now: Timestamp,
    ) -> Result<()> {
        if !operation.has_completed() {
            match backends.require(operation.backend()) {
                Ok(backend) => match backend.kill(operation).await {
                    Ok(true) => debug!("Kill accepted for {}", operation.description()),
                    Ok(false) => debug!("Backend could not kill {}", operation.description()),
                    Err(e) => warn!("Kill failed for {}: {}", operation.description(), e),
                },
                Err(e) => warn!("Skipping kill: {}", e),
            }
        }

        operation.apply_force_fail(reason, now);
        warn!("Force-failed {}: {}", operation.description(), reason);
        self.release(operation, backends).await;
        Ok(())
    }

    /// Lets the backend free whatever it kept for a finished operation.
    ///
    /// Failures are logged. Releasing twice is harmless.
    pub async fn release(&self, operation: &Operation, backends: &BackendRegistry) {
        let Some(backend) = backends.get(operation.backend()) else {
            return;
        };
        if let Err(e) = backend.release(operation).await {
            warn!(
                "Failed to release backend resources of {}: {}",
                operation.description(),
                e
            );
        }
    }
}
