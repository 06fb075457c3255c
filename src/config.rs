//! Configuration of redirection passes.
//!
//! [`RedirectConfig`] controls how a [`Redirector`](crate::Redirector) reacts to
//! failures and which safety checks the patch engine performs. Use one of the presets
//! or start from the default and adjust individual settings:
//!
//! ```rust
//! use redirection::{FailurePolicy, RedirectConfig};
//!
//! let config = RedirectConfig::default()
//!     .with_failure_policy(FailurePolicy::RollbackAll)
//!     .with_slot_fallback(false);
//! assert!(config.detect_cycles);
//! ```

/// What a pass does when one of its entries fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display)]
pub enum FailurePolicy {
    /// Record the failure and continue with the next entry.
    #[default]
    Continue,
    /// Revert every patch applied by the pass, in reverse order, and stop.
    RollbackAll,
}

/// Settings of a redirection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectConfig {
    /// Reaction to per-entry failures
    pub failure_policy: FailurePolicy,
    /// Reject installs whose target chain leads back to the source
    pub detect_cycles: bool,
    /// Repoint the dispatch slot when the jump does not fit the entry
    pub slot_fallback: bool,
    /// Read written bytes back and compare them
    pub verify_writes: bool,
    /// Cache resolutions per (declaration, annotated method)
    pub cache_resolutions: bool,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Continue,
            detect_cycles: true,
            slot_fallback: true,
            verify_writes: true,
            cache_resolutions: true,
        }
    }
}

impl RedirectConfig {
    /// All-or-nothing passes that only ever rewrite entry points.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            failure_policy: FailurePolicy::RollbackAll,
            slot_fallback: false,
            ..Default::default()
        }
    }

    /// Best-effort passes that skip cycle detection and read-back verification.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            failure_policy: FailurePolicy::Continue,
            detect_cycles: false,
            verify_writes: false,
            ..Default::default()
        }
    }

    /// Sets the failure policy.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Enables or disables cycle detection.
    #[must_use]
    pub fn with_cycle_detection(mut self, enabled: bool) -> Self {
        self.detect_cycles = enabled;
        self
    }

    /// Enables or disables the dispatch slot fallback.
    #[must_use]
    pub fn with_slot_fallback(mut self, enabled: bool) -> Self {
        self.slot_fallback = enabled;
        self
    }

    /// Enables or disables read-back verification.
    #[must_use]
    pub fn with_verification(mut self, enabled: bool) -> Self {
        self.verify_writes = enabled;
        self
    }

    /// Enables or disables the resolution cache.
    #[must_use]
    pub fn with_resolution_cache(mut self, enabled: bool) -> Self {
        self.cache_resolutions = enabled;
        self
    }
}
