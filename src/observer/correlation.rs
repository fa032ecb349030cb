//! Correlation between front-end volumes and backend claims
//!
//! The backend claim of a front-end volume is found purely by naming
//! convention: it lives in the system namespace and is named
//! `<prefix><front-end volume name>`. Nothing is cached; the mapping is
//! re-derived every time.

use crate::config::ExporterConfig;
use crate::domain::model::{Claim, ObjectRef, Volume};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

// =============================================================================
// Correlation Key
// =============================================================================

/// Identifies one correlation: the front-end volume name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey(pub String);

impl CorrelationKey {
    pub fn new(volume_name: impl Into<String>) -> Self {
        Self(volume_name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CorrelationKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CorrelationKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Naming Convention
// =============================================================================

/// Derives backend claim identities from front-end volume names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingConvention {
    pub system_namespace: String,
    pub backend_claim_prefix: String,
}

impl NamingConvention {
    pub fn new(system_namespace: impl Into<String>, backend_claim_prefix: impl Into<String>) -> Self {
        Self {
            system_namespace: system_namespace.into(),
            backend_claim_prefix: backend_claim_prefix.into(),
        }
    }

    pub fn from_config(config: &ExporterConfig) -> Self {
        Self::new(&config.system_namespace, &config.backend_claim_prefix)
    }

    /// Backend claim for a front-end volume
    pub fn backend_claim(&self, key: &CorrelationKey) -> ObjectRef {
        ObjectRef::new(
            &self.system_namespace,
            format!("{}{}", self.backend_claim_prefix, key.as_str()),
        )
    }

    /// Correlation key of a backend claim, if the claim follows the convention
    pub fn key_for_backend_claim(&self, namespace: &str, name: &str) -> Option<CorrelationKey> {
        if namespace != self.system_namespace {
            return None;
        }
        name.strip_prefix(&self.backend_claim_prefix)
            .filter(|volume| !volume.is_empty())
            .map(CorrelationKey::from)
    }
}

// =============================================================================
// Correlation Event
// =============================================================================

/// Observed state of the backend claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendState {
    Found(Claim),
    /// Provisioning has not created the claim yet, or it was collected
    NotFound,
}

impl BackendState {
    pub fn claim(&self) -> Option<&Claim> {
        match self {
            BackendState::Found(claim) => Some(claim),
            BackendState::NotFound => None,
        }
    }

    /// Annotations currently on the backend claim (empty when not found)
    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.claim()
            .map(|claim| claim.annotations.clone())
            .unwrap_or_default()
    }
}

/// Snapshot of one correlation at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationEvent {
    pub key: CorrelationKey,
    /// Front-end volume, `None` once it has been removed
    pub volume: Option<Volume>,
    /// Front-end claim, `None` if unbound or deleted
    pub claim: Option<Claim>,
    /// Backend claim
    pub backend: BackendState,
    pub observed_at: DateTime<Utc>,
}

impl CorrelationEvent {
    /// Whether the volume is still present
    pub fn volume_exists(&self) -> bool {
        self.volume.is_some()
    }
}
