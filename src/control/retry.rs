//! Bounded-retry VM lookup.

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ControlPlane, VmSnapshot};

/// Errors surfaced once the retry budget is spent.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LookupError {
    /// Every attempt failed or found nothing.
    #[error("lookup of VM {name} failed after {attempts} attempts: {last}")]
    Exhausted {
        /// VM name being resolved.
        name: String,
        /// Attempts made.
        attempts: u32,
        /// Description of the final failure.
        last: String,
    },
    /// The operation was cancelled between attempts.
    #[error("lookup of VM {name} cancelled")]
    Cancelled {
        /// VM name being resolved.
        name: String,
    },
}

/// Fixed attempt count and fixed sleep between attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LookupRetry {
    attempts: u32,
    delay: Duration,
}

impl LookupRetry {
    /// Creates a policy; `attempts` is raised to at least one.
    #[must_use]
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Resolves `name`, retrying transient failures. `Ok(None)` means the
    /// control plane answered and the VM does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::Exhausted`] when every attempt errors and
    /// [`LookupError::Cancelled`] when `cancel` fires.
    pub async fn find<C: ControlPlane + ?Sized>(
        &self,
        control: &C,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<VmSnapshot>, LookupError> {
        self.attempt(control, name, cancel, false).await
    }

    /// Resolves `name`, treating absence as transient inventory lag.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::Exhausted`] when the VM never appears or every
    /// attempt errors, and [`LookupError::Cancelled`] when `cancel` fires.
    pub async fn require<C: ControlPlane + ?Sized>(
        &self,
        control: &C,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<VmSnapshot, LookupError> {
        self.attempt(control, name, cancel, true)
            .await?
            .ok_or_else(|| LookupError::Exhausted {
                name: name.to_owned(),
                attempts: self.attempts,
                last: String::from("VM not found"),
            })
    }

    async fn attempt<C: ControlPlane + ?Sized>(
        &self,
        control: &C,
        name: &str,
        cancel: &CancellationToken,
        require: bool,
    ) -> Result<Option<VmSnapshot>, LookupError> {
        let mut last = String::new();
        for attempt in 1..=self.attempts {
            if cancel.is_cancelled() {
                return Err(LookupError::Cancelled {
                    name: name.to_owned(),
                });
            }
            match control.lookup_vm(name) {
                Ok(Some(snapshot)) => return Ok(Some(snapshot)),
                Ok(None) if !require => return Ok(None),
                Ok(None) => last = String::from("VM not found"),
                Err(err) => last = err.to_string(),
            }
            debug!(vm = name, attempt, error = %last, "VM lookup attempt failed");
            if attempt < self.attempts {
                tokio::select! {
                    () = cancel.cancelled() => {
                        return Err(LookupError::Cancelled { name: name.to_owned() });
                    }
                    () = sleep(self.delay) => {}
                }
            }
        }
        Err(LookupError::Exhausted {
            name: name.to_owned(),
            attempts: self.attempts,
            last,
        })
    }
}
