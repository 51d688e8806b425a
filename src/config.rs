//! Tool configuration loading via `ortho-config`.
//!
//! [`ToolConfig`] covers everything that is a property of the workstation
//! running `clonekit` rather than of a single deployment: external binaries,
//! template and staging locations, and the default timing budget. The
//! deployment parameter file may tighten or relax the timing values through
//! its own `timeouts` section (see [`Timings::with_overrides`]).

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::params::TimeoutOverrides;

/// Lower bound for the completion ceiling. Weak evidence clamps the ceiling
/// into `[WEAK_CEILING_MIN, WEAK_CEILING_MAX]`, so the full ceiling must not
/// be shorter than the upper end of that window.
pub const MIN_COMPLETION_CEILING_SECS: u64 = 60;

/// Workstation-level settings merged from defaults, `clonekit.toml` and
/// `CLONEKIT_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "CLONEKIT",
    discovery(
        app_name = "clonekit",
        env_var = "CLONEKIT_CONFIG_PATH",
        config_file_name = "clonekit.toml",
        dotfile_name = ".clonekit.toml",
        project_file_name = "clonekit.toml"
    )
)]
pub struct ToolConfig {
    /// Path to the `govc` executable used for control-plane and guest calls.
    #[ortho_config(default = "govc".to_owned())]
    pub govc_bin: String,
    /// Path to the ISO builder used to package the seed medium.
    #[ortho_config(default = "genisoimage".to_owned())]
    pub iso_builder_bin: String,
    /// Directory holding `user-data.tmpl`, `meta-data.tmpl`, the optional
    /// `network-config.tmpl` and `guest-prep.sh`.
    #[ortho_config(default = "templates".to_owned())]
    pub template_dir: String,
    /// Local scratch directory for rendered documents and generated scripts.
    #[ortho_config(default = "/tmp/clonekit".to_owned())]
    pub staging_dir: String,
    /// Guest-writable directory that receives generated scripts.
    #[ortho_config(default = "/tmp/clonekit".to_owned())]
    pub guest_work_dir: String,
    /// Prefix used to run guest scripts with elevated privileges.
    #[ortho_config(default = "sudo -n".to_owned())]
    pub elevate_command: String,
    /// Attempts made by the bounded-retry VM lookup.
    #[ortho_config(default = 5)]
    pub lookup_attempts: u32,
    /// Fixed sleep between lookup attempts, in seconds.
    #[ortho_config(default = 3)]
    pub lookup_delay_secs: u64,
    /// Interval between power-state polls, in seconds.
    #[ortho_config(default = 5)]
    pub power_poll_interval_secs: u64,
    /// Total wait for a power transition, in seconds.
    #[ortho_config(default = 300)]
    pub power_wait_secs: u64,
    /// Consecutive lookup failures tolerated while waiting for power-on.
    #[ortho_config(default = 3)]
    pub power_lookup_failures: u32,
    /// Wait for the guest command channel after power-on, in seconds.
    #[ortho_config(default = 300)]
    pub channel_ready_timeout_secs: u64,
    /// Interval between guest command channel readiness polls, in seconds.
    #[ortho_config(default = 5)]
    pub channel_poll_interval_secs: u64,
    /// Shorter channel wait applied before every detection probe, in seconds.
    #[ortho_config(default = 60)]
    pub channel_probe_timeout_secs: u64,
    /// Interval between completion probes, in seconds.
    #[ortho_config(default = 10)]
    pub completion_interval_secs: u64,
    /// Completion poll ceiling when activation evidence is strong, in seconds.
    #[ortho_config(default = 1800)]
    pub completion_ceiling_secs: u64,
    /// Completion poll ceiling applied after weak evidence, in seconds.
    #[ortho_config(default = 45)]
    pub weak_ceiling_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl ToolConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("clonekit")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to clonekit.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required string is empty
    /// and [`ConfigError::Invalid`] when a numeric setting is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.govc_bin,
            &FieldMetadata::new("govc binary", "CLONEKIT_GOVC_BIN", "govc_bin"),
        )?;
        Self::require_field(
            &self.iso_builder_bin,
            &FieldMetadata::new("ISO builder", "CLONEKIT_ISO_BUILDER_BIN", "iso_builder_bin"),
        )?;
        Self::require_field(
            &self.template_dir,
            &FieldMetadata::new("template directory", "CLONEKIT_TEMPLATE_DIR", "template_dir"),
        )?;
        Self::require_field(
            &self.staging_dir,
            &FieldMetadata::new("staging directory", "CLONEKIT_STAGING_DIR", "staging_dir"),
        )?;
        Self::require_field(
            &self.guest_work_dir,
            &FieldMetadata::new(
                "guest work directory",
                "CLONEKIT_GUEST_WORK_DIR",
                "guest_work_dir",
            ),
        )?;
        if self.lookup_attempts == 0 {
            return Err(ConfigError::Invalid(String::from(
                "lookup_attempts must be at least 1 (CLONEKIT_LOOKUP_ATTEMPTS)",
            )));
        }
        self.timings().validate()
    }

    /// Converts the configured second counts into a [`Timings`] budget.
    #[must_use]
    pub const fn timings(&self) -> Timings {
        Timings {
            lookup_attempts: self.lookup_attempts,
            lookup_delay: Duration::from_secs(self.lookup_delay_secs),
            power_poll_interval: Duration::from_secs(self.power_poll_interval_secs),
            power_wait: Duration::from_secs(self.power_wait_secs),
            power_lookup_failures: self.power_lookup_failures,
            channel_ready_timeout: Duration::from_secs(self.channel_ready_timeout_secs),
            channel_poll_interval: Duration::from_secs(self.channel_poll_interval_secs),
            channel_probe_timeout: Duration::from_secs(self.channel_probe_timeout_secs),
            completion_interval: Duration::from_secs(self.completion_interval_secs),
            completion_ceiling: Duration::from_secs(self.completion_ceiling_secs),
            weak_ceiling: Duration::from_secs(self.weak_ceiling_secs),
        }
    }
}

/// Timing budget shared by the power controller and the activation detector.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timings {
    /// Attempts made by the bounded-retry VM lookup.
    pub lookup_attempts: u32,
    /// Sleep between lookup attempts.
    pub lookup_delay: Duration,
    /// Interval between power-state polls.
    pub power_poll_interval: Duration,
    /// Total wait for a power transition.
    pub power_wait: Duration,
    /// Consecutive lookup failures tolerated while waiting for power-on.
    pub power_lookup_failures: u32,
    /// Wait for the command channel after power-on.
    pub channel_ready_timeout: Duration,
    /// Interval between channel readiness polls.
    pub channel_poll_interval: Duration,
    /// Channel wait applied before each detection probe.
    pub channel_probe_timeout: Duration,
    /// Interval between completion probes.
    pub completion_interval: Duration,
    /// Completion ceiling for strong evidence.
    pub completion_ceiling: Duration,
    /// Completion ceiling for weak evidence, before clamping.
    pub weak_ceiling: Duration,
}

impl Timings {
    /// Applies the per-deployment overrides from the parameter file.
    #[must_use]
    pub fn with_overrides(mut self, overrides: &TimeoutOverrides) -> Self {
        if let Some(secs) = overrides.power_wait_secs {
            self.power_wait = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.channel_ready_secs {
            self.channel_ready_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.completion_ceiling_secs {
            self.completion_ceiling = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.completion_interval_secs {
            self.completion_interval = Duration::from_secs(secs);
        }
        self
    }

    /// Checks the invariants the detector relies on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the completion ceiling is shorter
    /// than [`MIN_COMPLETION_CEILING_SECS`] or an interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.completion_ceiling < Duration::from_secs(MIN_COMPLETION_CEILING_SECS) {
            return Err(ConfigError::Invalid(format!(
                "completion ceiling must be at least {MIN_COMPLETION_CEILING_SECS} seconds, got {}",
                self.completion_ceiling.as_secs()
            )));
        }
        if self.completion_interval.is_zero()
            || self.power_poll_interval.is_zero()
            || self.channel_poll_interval.is_zero()
        {
            return Err(ConfigError::Invalid(String::from(
                "poll intervals must be greater than zero",
            )));
        }
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value is present but out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
