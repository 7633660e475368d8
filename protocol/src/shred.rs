//! # Shred-Version Filter
//!
//! After a cluster restart, nodes that restarted from the new snapshot carry
//! a new shred version; nodes still running the old fork carry the old one.
//! Both keep gossiping. The filter decides which of the two logical clusters
//! we rank, and marks everything else [`Compatibility::Foreign`].
//!
//! ## Canonical value
//!
//! Two sources can supply it: an operator override, and the value observed
//! in the contact record of the entrypoint we bootstrapped from. Which one
//! wins is a [`ShredVersionPolicy`]. Until one is available, nothing is
//! compatible.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::gossip::crds::ContactInfo;

/// Sentinel for "not observed yet". Real shred versions are 16-bit.
const UNSET: u32 = u32::MAX;

/// Precedence between the operator override and the observed value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShredVersionPolicy {
    /// The override if given, else the observed value.
    #[default]
    PreferOverride,
    /// The observed value once known, else the override.
    PreferObserved,
    /// Only the override. Without one, everything is foreign.
    OverrideOnly,
    /// Only the observed value. The override is ignored.
    ObservedOnly,
}

impl std::str::FromStr for ShredVersionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prefer-override" => Ok(Self::PreferOverride),
            "prefer-observed" => Ok(Self::PreferObserved),
            "override-only" => Ok(Self::OverrideOnly),
            "observed-only" => Ok(Self::ObservedOnly),
            other => Err(format!(
                "unknown shred version policy '{other}' (expected prefer-override, \
                 prefer-observed, override-only or observed-only)"
            )),
        }
    }
}

/// Result of [`ShredVersionFilter::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compatibility {
    Compatible,
    Foreign,
}

/// Classifies contact records against the canonical shred version.
#[derive(Debug)]
pub struct ShredVersionFilter {
    policy: ShredVersionPolicy,
    override_version: Option<u16>,
    observed: AtomicU32,
}

impl ShredVersionFilter {
    pub fn new(policy: ShredVersionPolicy, override_version: Option<u16>) -> Self {
        Self {
            policy,
            override_version,
            observed: AtomicU32::new(UNSET),
        }
    }

    /// Records the shred version seen in the entrypoint's contact record.
    ///
    /// Zero means "unknown" on the wire and is never adopted. Returns true if
    /// the observed value changed.
    pub fn observe(&self, shred_version: u16) -> bool {
        if shred_version == 0 {
            return false;
        }
        let previous = self.observed.swap(u32::from(shred_version), Ordering::AcqRel);
        let changed = previous != u32::from(shred_version);
        if changed {
            info!(shred_version, "adopted shred version from entrypoint");
        }
        changed
    }

    /// The observed value, if any.
    pub fn observed(&self) -> Option<u16> {
        match self.observed.load(Ordering::Acquire) {
            UNSET => None,
            value => u16::try_from(value).ok(),
        }
    }

    /// The value entries are compared against, per the policy.
    pub fn canonical(&self) -> Option<u16> {
        let observed = self.observed();
        match self.policy {
            ShredVersionPolicy::PreferOverride => self.override_version.or(observed),
            ShredVersionPolicy::PreferObserved => observed.or(self.override_version),
            ShredVersionPolicy::OverrideOnly => self.override_version,
            ShredVersionPolicy::ObservedOnly => observed,
        }
    }

    /// Compatible iff the record carries the canonical shred version.
    ///
    /// A record with shred version 0 has not joined any cluster yet and is
    /// only compatible when the canonical value is itself 0.
    pub fn classify(&self, info: &ContactInfo) -> Compatibility {
        match self.canonical() {
            Some(canonical) if canonical == info.shred_version => Compatibility::Compatible,
            _ => Compatibility::Foreign,
        }
    }

    pub fn policy(&self) -> ShredVersionPolicy {
        self.policy
    }
}

impl Default for ShredVersionFilter {
    fn default() -> Self {
        Self::new(ShredVersionPolicy::default(), None)
    }
}
