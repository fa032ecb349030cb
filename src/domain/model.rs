//! Domain Model - Storage resources as seen by the exporter
//!
//! Store adapters translate their native objects (PersistentVolume,
//! PersistentVolumeClaim) into these types so the reconciler never depends on
//! a particular client library.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Annotation set by the external provisioner on every volume it creates
pub const PROVISIONED_BY_ANNOTATION: &str = "pv.kubernetes.io/provisioned-by";

// =============================================================================
// Reclaim Policy
// =============================================================================

/// What happens to a volume once its claim is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReclaimPolicy {
    /// The volume and its storage are removed with the claim
    Delete,
    /// The volume survives claim deletion until an administrator removes it
    Retain,
}

impl ReclaimPolicy {
    /// Parse the Kubernetes `persistentVolumeReclaimPolicy` field.
    ///
    /// Dynamically provisioned volumes default to `Delete`. The deprecated
    /// `Recycle` policy keeps the volume object alive, so it behaves like
    /// `Retain` for export purposes.
    pub fn from_k8s(value: Option<&str>) -> Self {
        match value {
            Some("Retain") | Some("Recycle") => ReclaimPolicy::Retain,
            _ => ReclaimPolicy::Delete,
        }
    }
}

impl std::fmt::Display for ReclaimPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReclaimPolicy::Delete => write!(f, "Delete"),
            ReclaimPolicy::Retain => write!(f, "Retain"),
        }
    }
}

// =============================================================================
// Phases
// =============================================================================

/// Lifecycle phase of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumePhase {
    Pending,
    Available,
    Bound,
    Released,
    Failed,
}

impl VolumePhase {
    pub fn from_k8s(value: Option<&str>) -> Self {
        match value {
            Some("Available") => VolumePhase::Available,
            Some("Bound") => VolumePhase::Bound,
            Some("Released") => VolumePhase::Released,
            Some("Failed") => VolumePhase::Failed,
            _ => VolumePhase::Pending,
        }
    }
}

/// Lifecycle phase of a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClaimPhase {
    Pending,
    Bound,
    Lost,
}

impl ClaimPhase {
    pub fn from_k8s(value: Option<&str>) -> Self {
        match value {
            Some("Bound") => ClaimPhase::Bound,
            Some("Lost") => ClaimPhase::Lost,
            _ => ClaimPhase::Pending,
        }
    }
}

// =============================================================================
// Object Reference
// =============================================================================

/// Reference to a namespaced object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Identifier written into export annotations: `<namespace>-<name>`
    pub fn export_id(&self) -> String {
        format!("{}-{}", self.namespace, self.name)
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// =============================================================================
// Volume
// =============================================================================

/// A cluster-scoped storage unit bound to a claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name (cluster-scoped)
    pub name: String,
    /// Reclaim policy
    pub reclaim_policy: ReclaimPolicy,
    /// Claim this volume is bound to
    pub claim_ref: Option<ObjectRef>,
    /// Current phase
    pub phase: VolumePhase,
    /// Deletion has been requested (deletionTimestamp is set)
    pub deletion_requested: bool,
    /// Finalizers holding the object
    pub finalizers: Vec<String>,
    /// Object annotations
    pub annotations: BTreeMap<String, String>,
    /// Version used for conditional updates
    pub resource_version: Option<String>,
}

impl Volume {
    /// Create a bound volume with the given policy
    pub fn new(name: impl Into<String>, reclaim_policy: ReclaimPolicy) -> Self {
        Self {
            name: name.into(),
            reclaim_policy,
            claim_ref: None,
            phase: VolumePhase::Pending,
            deletion_requested: false,
            finalizers: Vec::new(),
            annotations: BTreeMap::new(),
            resource_version: None,
        }
    }

    /// Bind the volume to a claim
    pub fn bound_to(mut self, claim: ObjectRef) -> Self {
        self.claim_ref = Some(claim);
        self.phase = VolumePhase::Bound;
        self
    }

    /// Set the provisioner annotation
    pub fn provisioned_by(mut self, provisioner: impl Into<String>) -> Self {
        self.annotations
            .insert(PROVISIONED_BY_ANNOTATION.to_string(), provisioner.into());
        self
    }

    /// Name of the provisioner that created this volume
    pub fn provisioner(&self) -> Option<&str> {
        self.annotations
            .get(PROVISIONED_BY_ANNOTATION)
            .map(String::as_str)
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }
}

// =============================================================================
// Claim
// =============================================================================

/// A namespaced request for storage, bound 1:1 to a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub namespace: String,
    pub name: String,
    pub phase: ClaimPhase,
    pub storage_class: Option<String>,
    /// Volume this claim is bound to
    pub volume_name: Option<String>,
    pub annotations: BTreeMap<String, String>,
    /// Deletion has been requested (deletionTimestamp is set)
    pub deletion_requested: bool,
    /// Version used for conditional updates
    pub resource_version: Option<String>,
}

impl Claim {
    /// Create a pending claim
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            phase: ClaimPhase::Pending,
            storage_class: None,
            volume_name: None,
            annotations: BTreeMap::new(),
            deletion_requested: false,
            resource_version: None,
        }
    }

    /// Bind the claim to a volume
    pub fn bound_to(mut self, volume: impl Into<String>) -> Self {
        self.volume_name = Some(volume.into());
        self.phase = ClaimPhase::Bound;
        self
    }

    pub fn with_storage_class(mut self, storage_class: impl Into<String>) -> Self {
        self.storage_class = Some(storage_class.into());
        self
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(&self.namespace, &self.name)
    }

    /// Volume name, only once the claim is bound
    pub fn bound_volume(&self) -> Option<&str> {
        match self.phase {
            ClaimPhase::Bound => self.volume_name.as_deref(),
            _ => None,
        }
    }
}
