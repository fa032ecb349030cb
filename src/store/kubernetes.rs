//! Kubernetes resource store
//!
//! Reads PersistentVolumes and PersistentVolumeClaims through the API server
//! and performs conditional merge patches. A merge patch that carries
//! `metadata.resourceVersion` is rejected with 409 when the object changed,
//! which gives the same optimistic concurrency as an update.

use crate::domain::model::{Claim, ClaimPhase, ObjectRef, ReclaimPolicy, Volume, VolumePhase};
use crate::domain::ports::{ResourceChange, ResourceStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

/// `ResourceStore` backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

// =============================================================================
// Conversions
// =============================================================================

fn volume_from_k8s(pv: PersistentVolume) -> Volume {
    let spec = pv.spec.unwrap_or_default();
    let status = pv.status.unwrap_or_default();
    let claim_ref = spec
        .claim_ref
        .and_then(|r| Some(ObjectRef::new(r.namespace?, r.name?)));

    Volume {
        name: pv.metadata.name.unwrap_or_default(),
        reclaim_policy: ReclaimPolicy::from_k8s(spec.persistent_volume_reclaim_policy.as_deref()),
        claim_ref,
        phase: VolumePhase::from_k8s(status.phase.as_deref()),
        deletion_requested: pv.metadata.deletion_timestamp.is_some(),
        finalizers: pv.metadata.finalizers.unwrap_or_default(),
        annotations: pv.metadata.annotations.unwrap_or_default(),
        resource_version: pv.metadata.resource_version,
    }
}

fn claim_from_k8s(pvc: PersistentVolumeClaim) -> Claim {
    let spec = pvc.spec.unwrap_or_default();
    let status = pvc.status.unwrap_or_default();

    Claim {
        namespace: pvc.metadata.namespace.unwrap_or_default(),
        name: pvc.metadata.name.unwrap_or_default(),
        phase: ClaimPhase::from_k8s(status.phase.as_deref()),
        storage_class: spec.storage_class_name,
        volume_name: spec.volume_name,
        annotations: pvc.metadata.annotations.unwrap_or_default(),
        deletion_requested: pvc.metadata.deletion_timestamp.is_some(),
        resource_version: pvc.metadata.resource_version,
    }
}

fn volume_change(pv: &PersistentVolume) -> ResourceChange {
    ResourceChange::Volume {
        name: pv.metadata.name.clone().unwrap_or_default(),
        provisioner: pv
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(crate::domain::model::PROVISIONED_BY_ANNOTATION))
            .cloned(),
    }
}

fn claim_change(pvc: &PersistentVolumeClaim) -> ResourceChange {
    ResourceChange::Claim {
        namespace: pvc.metadata.namespace.clone().unwrap_or_default(),
        name: pvc.metadata.name.clone().unwrap_or_default(),
        volume_name: pvc.spec.as_ref().and_then(|s| s.volume_name.clone()),
    }
}

/// Map a watcher event to change notifications
fn changes_from_event<K>(
    event: std::result::Result<Event<K>, watcher::Error>,
    to_change: fn(&K) -> ResourceChange,
) -> Vec<Result<ResourceChange>> {
    match event {
        Ok(Event::Applied(obj)) | Ok(Event::Deleted(obj)) => vec![Ok(to_change(&obj))],
        // Relist after a desync; deletions during the gap are only visible here
        Ok(Event::Restarted(_)) => vec![Ok(ResourceChange::Resync)],
        Err(e) => vec![Err(Error::Watch(e.to_string()))],
    }
}

/// Map API errors for a single object to domain errors
fn map_api_error(kind: &str, name: &str, error: kube::Error) -> Error {
    match error {
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict {
            kind: kind.into(),
            name: name.into(),
        },
        kube::Error::Api(ae) if ae.code == 404 => Error::ResourceNotFound {
            kind: kind.into(),
            name: name.into(),
        },
        e => Error::Kube(e),
    }
}

// =============================================================================
// Store Implementation
// =============================================================================

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_volume(&self, name: &str) -> Result<Option<Volume>> {
        Ok(self.volumes().get_opt(name).await?.map(volume_from_k8s))
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        let list = self.volumes().list(&ListParams::default()).await?;
        Ok(list.items.into_iter().map(volume_from_k8s).collect())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<Claim>> {
        Ok(self
            .claims(namespace)
            .get_opt(name)
            .await?
            .map(claim_from_k8s))
    }

    async fn list_claims(&self, namespace: &str) -> Result<Vec<Claim>> {
        let list = self.claims(namespace).list(&ListParams::default()).await?;
        Ok(list.items.into_iter().map(claim_from_k8s).collect())
    }

    #[instrument(skip(self, annotations), fields(keys = annotations.len()))]
    async fn add_claim_annotations(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Claim> {
        let patch = json!({
            "metadata": {
                "resourceVersion": resource_version,
                "annotations": annotations,
            }
        });

        let pvc = self
            .claims(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                map_api_error("PersistentVolumeClaim", &format!("{}/{}", namespace, name), e)
            })?;

        debug!("annotated claim");
        Ok(claim_from_k8s(pvc))
    }

    #[instrument(skip(self))]
    async fn set_volume_finalizers(
        &self,
        name: &str,
        resource_version: &str,
        finalizers: &[String],
    ) -> Result<Option<Volume>> {
        let patch = json!({
            "metadata": {
                "resourceVersion": resource_version,
                "finalizers": finalizers,
            }
        });

        let pv = self
            .volumes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_api_error("PersistentVolume", name, e))?;

        let volume = volume_from_k8s(pv);
        // The API server removes the object once the last finalizer is gone
        if volume.deletion_requested && volume.finalizers.is_empty() {
            return Ok(None);
        }
        Ok(Some(volume))
    }

    fn changes(&self) -> BoxStream<'static, Result<ResourceChange>> {
        let volumes = watcher(self.volumes(), watcher::Config::default())
            .default_backoff()
            .flat_map(|event| stream::iter(changes_from_event(event, volume_change)));

        // Front-end claims live in arbitrary namespaces
        let claims = watcher(
            Api::<PersistentVolumeClaim>::all(self.client.clone()),
            watcher::Config::default(),
        )
        .default_backoff()
        .flat_map(|event| stream::iter(changes_from_event(event, claim_change)));

        stream::select(volumes, claims).boxed()
    }

    fn store_name(&self) -> &str {
        "kubernetes"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ObjectReference, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus,
        PersistentVolumeSpec, PersistentVolumeStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_volume_from_k8s() {
        let pv = PersistentVolume {
            metadata: ObjectMeta {
                name: Some("pv-xyz".into()),
                resource_version: Some("42".into()),
                annotations: Some(
                    [(
                        "pv.kubernetes.io/provisioned-by".to_string(),
                        "openebs.io/nfsrwx".to_string(),
                    )]
                    .into(),
                ),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                persistent_volume_reclaim_policy: Some("Retain".into()),
                claim_ref: Some(ObjectReference {
                    namespace: Some("app-ns".into()),
                    name: Some("pvc1".into()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: Some(PersistentVolumeStatus {
                phase: Some("Bound".into()),
                ..Default::default()
            }),
        };

        let volume = volume_from_k8s(pv);
        assert_eq!(volume.name, "pv-xyz");
        assert_eq!(volume.reclaim_policy, ReclaimPolicy::Retain);
        assert_eq!(volume.claim_ref, Some(ObjectRef::new("app-ns", "pvc1")));
        assert_eq!(volume.phase, VolumePhase::Bound);
        assert_eq!(volume.provisioner(), Some("openebs.io/nfsrwx"));
        assert_eq!(volume.resource_version.as_deref(), Some("42"));
        assert!(!volume.deletion_requested);
    }

    #[test]
    fn test_claim_from_k8s() {
        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                namespace: Some("openebs".into()),
                name: Some("nfs-pv-xyz".into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                volume_name: Some("pv-backend-abc".into()),
                storage_class_name: Some("cstor".into()),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".into()),
                ..Default::default()
            }),
        };

        let claim = claim_from_k8s(pvc);
        assert_eq!(claim.object_ref(), ObjectRef::new("openebs", "nfs-pv-xyz"));
        assert_eq!(claim.bound_volume(), Some("pv-backend-abc"));
        assert_eq!(claim.storage_class.as_deref(), Some("cstor"));
    }

    #[test]
    fn test_watch_restart_requests_resync() {
        let changes = changes_from_event::<PersistentVolume>(Ok(Event::Restarted(vec![])), volume_change);
        assert!(matches!(changes.as_slice(), [Ok(ResourceChange::Resync)]));
    }
}
