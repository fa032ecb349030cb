//! Domain Ports - Core trait definitions for the exporter
//!
//! These traits define the boundaries between the reconciliation logic and
//! external systems. Adapters implement these traits to provide concrete
//! functionality.

use crate::domain::model::{Claim, Volume};
use crate::error::Result;
use crate::events::ExportRecord;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Change Notifications
// =============================================================================

/// Notification that a watched resource changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceChange {
    /// A volume was created, updated or removed
    Volume {
        name: String,
        /// Provisioner annotation of the volume, if known
        provisioner: Option<String>,
    },
    /// A claim was created, updated or removed
    Claim {
        namespace: String,
        name: String,
        /// Volume the claim was bound to, if known
        volume_name: Option<String>,
    },
    /// The change feed lost track; every correlation must be re-listed
    Resync,
}

// =============================================================================
// Resource Store Port
// =============================================================================

/// Port for reading and conditionally mutating volumes and claims
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Get a volume by name
    async fn get_volume(&self, name: &str) -> Result<Option<Volume>>;

    /// List all volumes
    async fn list_volumes(&self) -> Result<Vec<Volume>>;

    /// Get a claim by namespace and name
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<Claim>>;

    /// List claims in a namespace
    async fn list_claims(&self, namespace: &str) -> Result<Vec<Claim>>;

    /// Add annotations to a claim, only if it is still at `resource_version`.
    ///
    /// Keys not named in `annotations` are left untouched. Fails with
    /// `Error::Conflict` on a version mismatch and `Error::ResourceNotFound`
    /// when the claim is gone.
    async fn add_claim_annotations(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Claim>;

    /// Replace a volume's finalizers, only if it is still at `resource_version`.
    ///
    /// Returns `None` when the update released the last finalizer of a volume
    /// under deletion and the volume is gone.
    async fn set_volume_finalizers(
        &self,
        name: &str,
        resource_version: &str,
        finalizers: &[String],
    ) -> Result<Option<Volume>>;

    /// Stream of change notifications; infinite until the store shuts down
    fn changes(&self) -> BoxStream<'static, Result<ResourceChange>>;

    /// Name of this store, for logs
    fn store_name(&self) -> &str;
}

// =============================================================================
// Event Sink Port
// =============================================================================

/// Port for delivering export records to an external receiver
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one record. Must be safe to call more than once per record.
    async fn send(&self, record: &ExportRecord) -> Result<()>;

    /// Name of this sink, for logs
    fn sink_name(&self) -> &str;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ResourceStoreRef = Arc<dyn ResourceStore>;
pub type EventSinkRef = Arc<dyn EventSink>;
