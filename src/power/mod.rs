//! Power lifecycle controller.
//!
//! Every operation re-resolves the VM before deciding anything and reports
//! one [`PowerOutcome`]. Loops are bounded by the configured [`Timings`] and
//! stop early when the cancellation token fires.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Timings;
use crate::control::{ControlPlane, GuestChannel, LookupError, LookupRetry, PowerState};

/// Closed outcome vocabulary for power operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerOutcome {
    /// The VM was already on.
    AlreadyStarted,
    /// The transition completed (and, for starts, the channel is ready).
    Success,
    /// The transition was not attempted because power changes are disabled.
    Skipped,
    /// The transition did not complete in time.
    Timeout,
    /// The start request was refused or lookups kept failing.
    StartFailed,
    /// The stop request was refused or lookups kept failing.
    StopFailed,
    /// The VM's state could not be determined.
    StatUnknown,
    /// The VM was already off.
    AlreadyStopped,
}

impl PowerOutcome {
    /// Stable lowercase label for logs and reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyStarted => "already-started",
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Timeout => "timeout",
            Self::StartFailed => "start-failed",
            Self::StopFailed => "stop-failed",
            Self::StatUnknown => "stat-unknown",
            Self::AlreadyStopped => "already-stopped",
        }
    }

    /// Whether the VM is known to be running afterwards.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::AlreadyStarted | Self::Success)
    }
}

impl fmt::Display for PowerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when the cancellation token fires mid-operation.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Sleeps for `duration` unless `cancel` fires first.
///
/// # Errors
///
/// Returns [`Cancelled`] when the token fires.
pub async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    tokio::select! {
        () = cancel.cancelled() => Err(Cancelled),
        () = sleep(duration) => Ok(()),
    }
}

/// Starts, stops and waits on one VM's power and guest channel.
#[derive(Debug)]
pub struct PowerController<'a, C: ?Sized, G: ?Sized> {
    control: &'a C,
    guest: &'a G,
    timings: Timings,
    retry: LookupRetry,
    no_power_change: bool,
    cancel: &'a CancellationToken,
}

impl<'a, C, G> PowerController<'a, C, G>
where
    C: ControlPlane + ?Sized,
    G: GuestChannel + ?Sized,
{
    /// Creates a controller. With `no_power_change` set, transitions are
    /// reported as [`PowerOutcome::Skipped`] unless forced.
    #[must_use]
    pub fn new(
        control: &'a C,
        guest: &'a G,
        timings: Timings,
        no_power_change: bool,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            control,
            guest,
            timings,
            retry: LookupRetry::new(timings.lookup_attempts, timings.lookup_delay),
            no_power_change,
            cancel,
        }
    }

    /// The lookup policy shared with callers.
    #[must_use]
    pub const fn retry(&self) -> &LookupRetry {
        &self.retry
    }

    /// Timing budget in force.
    #[must_use]
    pub const fn timings(&self) -> &Timings {
        &self.timings
    }

    async fn current_power(&self, vm: &str) -> Result<Option<PowerState>, Cancelled> {
        match self.retry.find(self.control, vm, self.cancel).await {
            Ok(snapshot) => Ok(snapshot.map(|found| found.power)),
            Err(LookupError::Cancelled { .. }) => Err(Cancelled),
            Err(err @ LookupError::Exhausted { .. }) => {
                warn!(vm, error = %err, "power state unknown");
                Ok(None)
            }
        }
    }

    /// Ensures the VM is running and its command channel is ready.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] when the token fires.
    pub async fn ensure_started(&self, vm: &str, force: bool) -> Result<PowerOutcome, Cancelled> {
        let Some(power) = self.current_power(vm).await? else {
            return Ok(PowerOutcome::StatUnknown);
        };
        if power == PowerState::On {
            return Ok(PowerOutcome::AlreadyStarted);
        }
        if self.no_power_change && !force {
            info!(vm, "power-on skipped: automatic power changes disabled");
            return Ok(PowerOutcome::Skipped);
        }
        if let Err(err) = self.control.power_on(vm) {
            warn!(vm, error = %err, "power-on request refused");
            return Ok(PowerOutcome::StartFailed);
        }
        info!(vm, "power-on requested");
        let powered = self
            .wait_for_power(vm, PowerState::On, PowerOutcome::StartFailed)
            .await?;
        if powered != PowerOutcome::Success {
            return Ok(powered);
        }
        let ready = self
            .wait_channel_ready(
                vm,
                self.timings.channel_ready_timeout,
                self.timings.channel_poll_interval,
            )
            .await?;
        Ok(if ready {
            PowerOutcome::Success
        } else {
            PowerOutcome::Timeout
        })
    }

    /// Ensures the VM is powered off through a guest shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] when the token fires.
    pub async fn ensure_stopped(&self, vm: &str) -> Result<PowerOutcome, Cancelled> {
        let Some(power) = self.current_power(vm).await? else {
            return Ok(PowerOutcome::StatUnknown);
        };
        match power {
            PowerState::Off => return Ok(PowerOutcome::AlreadyStopped),
            PowerState::Suspended => {
                warn!(vm, "VM is suspended; a guest shutdown cannot be issued");
                return Ok(PowerOutcome::StopFailed);
            }
            PowerState::On => {}
        }
        if self.no_power_change {
            info!(vm, "shutdown skipped: automatic power changes disabled");
            return Ok(PowerOutcome::Skipped);
        }
        if let Err(err) = self.control.shutdown_guest(vm) {
            warn!(vm, error = %err, "guest shutdown refused");
            return Ok(PowerOutcome::StopFailed);
        }
        info!(vm, "guest shutdown requested");
        self.wait_for_power(vm, PowerState::Off, PowerOutcome::StopFailed)
            .await
    }

    /// Polls power state until it equals `target`. Consecutive lookup
    /// failures beyond the tolerance yield `on_failure`. A VM missing from
    /// the inventory counts as a failed lookup; only a resolved snapshot
    /// resets the count.
    async fn wait_for_power(
        &self,
        vm: &str,
        target: PowerState,
        on_failure: PowerOutcome,
    ) -> Result<PowerOutcome, Cancelled> {
        let deadline = Instant::now() + self.timings.power_wait;
        let mut failures = 0_u32;
        loop {
            pause(self.timings.power_poll_interval, self.cancel).await?;
            match self.control.lookup_vm(vm) {
                Ok(Some(snapshot)) if snapshot.power == target => {
                    return Ok(PowerOutcome::Success);
                }
                Ok(Some(_)) => failures = 0,
                Ok(None) => {
                    failures += 1;
                    debug!(vm, failures, "VM not found while polling power state");
                }
                Err(err) => {
                    failures += 1;
                    debug!(vm, failures, error = %err, "power poll lookup failed");
                }
            }
            if failures > self.timings.power_lookup_failures {
                return Ok(on_failure);
            }
            if Instant::now() >= deadline {
                return Ok(PowerOutcome::Timeout);
            }
        }
    }

    /// Polls the guest agent until it reports ready or `timeout` elapses.
    /// Read failures count as not ready.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] when the token fires.
    pub async fn wait_channel_ready(
        &self,
        vm: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<bool, Cancelled> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.guest.tools_ready(vm) {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(err) => debug!(vm, error = %err, "channel readiness query failed"),
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            pause(interval, self.cancel).await?;
        }
    }
}
