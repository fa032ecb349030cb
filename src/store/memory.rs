//! In-memory resource store
//!
//! Behaves like the Kubernetes API for the operations the exporter uses:
//! every mutation bumps a resource version, conditional writes fail with
//! `Conflict` on a stale version, and a volume under deletion disappears once
//! its last finalizer is released.

use crate::domain::model::{Claim, Volume, VolumePhase};
use crate::domain::ports::{ResourceChange, ResourceStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct State {
    volumes: BTreeMap<String, Volume>,
    claims: BTreeMap<(String, String), Claim>,
    version: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// In-process `ResourceStore`
pub struct InMemoryStore {
    state: RwLock<State>,
    changes: broadcast::Sender<ResourceChange>,
    faults: AtomicU32,
    annotation_conflicts: AtomicU32,
    annotation_writes: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(Self {
            state: RwLock::new(State::default()),
            changes,
            faults: AtomicU32::new(0),
            annotation_conflicts: AtomicU32::new(0),
            annotation_writes: AtomicU64::new(0),
        })
    }

    // =========================================================================
    // Fixture API
    // =========================================================================

    /// Create or replace a volume
    pub fn put_volume(&self, mut volume: Volume) -> Volume {
        let change = {
            let mut state = self.state.write();
            volume.resource_version = Some(state.next_version());
            state.volumes.insert(volume.name.clone(), volume.clone());
            volume_change(&volume)
        };
        self.notify(change);
        volume
    }

    /// Create or replace a claim
    pub fn put_claim(&self, mut claim: Claim) -> Claim {
        let change = {
            let mut state = self.state.write();
            claim.resource_version = Some(state.next_version());
            state
                .claims
                .insert((claim.namespace.clone(), claim.name.clone()), claim.clone());
            claim_change(&claim)
        };
        self.notify(change);
        claim
    }

    /// Mutate a volume in place, bumping its version
    pub fn update_volume(&self, name: &str, f: impl FnOnce(&mut Volume)) -> Option<Volume> {
        let volume = {
            let mut state = self.state.write();
            let version = state.next_version();
            let volume = state.volumes.get_mut(name)?;
            f(volume);
            volume.resource_version = Some(version);
            volume.clone()
        };
        self.notify(volume_change(&volume));
        Some(volume)
    }

    /// Mutate a claim in place, bumping its version
    pub fn update_claim(
        &self,
        namespace: &str,
        name: &str,
        f: impl FnOnce(&mut Claim),
    ) -> Option<Claim> {
        let claim = {
            let mut state = self.state.write();
            let version = state.next_version();
            let claim = state
                .claims
                .get_mut(&(namespace.to_string(), name.to_string()))?;
            f(claim);
            claim.resource_version = Some(version);
            claim.clone()
        };
        self.notify(claim_change(&claim));
        Some(claim)
    }

    /// Remove a claim, releasing the volume bound to it
    pub fn delete_claim(&self, namespace: &str, name: &str) -> Option<Claim> {
        let (claim, released) = {
            let mut state = self.state.write();
            let claim = state
                .claims
                .remove(&(namespace.to_string(), name.to_string()))?;
            let version = state.next_version();
            let released = claim
                .volume_name
                .as_ref()
                .and_then(|volume| state.volumes.get_mut(volume))
                .filter(|volume| {
                    volume
                        .claim_ref
                        .as_ref()
                        .is_some_and(|r| r.namespace == namespace && r.name == name)
                })
                .map(|volume| {
                    volume.phase = VolumePhase::Released;
                    volume.resource_version = Some(version);
                    volume.clone()
                });
            (claim, released)
        };
        self.notify(claim_change(&claim));
        if let Some(volume) = released {
            self.notify(volume_change(&volume));
        }
        Some(claim)
    }

    /// Request deletion of a volume; it is removed once no finalizers remain
    pub fn request_volume_deletion(&self, name: &str) -> bool {
        let change = {
            let mut state = self.state.write();
            let version = state.next_version();
            let Some(volume) = state.volumes.get_mut(name) else {
                return false;
            };
            volume.deletion_requested = true;
            volume.resource_version = Some(version);
            let change = volume_change(volume);
            if volume.finalizers.is_empty() {
                state.volumes.remove(name);
                debug!(volume = %name, "volume removed");
            }
            change
        };
        self.notify(change);
        true
    }

    /// Remove a volume regardless of finalizers
    pub fn remove_volume(&self, name: &str) -> Option<Volume> {
        let volume = self.state.write().volumes.remove(name)?;
        self.notify(volume_change(&volume));
        Some(volume)
    }

    pub fn volume(&self, name: &str) -> Option<Volume> {
        self.state.read().volumes.get(name).cloned()
    }

    pub fn claim(&self, namespace: &str, name: &str) -> Option<Claim> {
        self.state
            .read()
            .claims
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Fail the next `count` operations with `StoreUnavailable`
    pub fn inject_transient_failures(&self, count: u32) {
        self.faults.store(count, Ordering::SeqCst);
    }

    /// Reject the next `count` annotation writes with `Conflict`, as if
    /// another writer had updated the claim first
    pub fn inject_annotation_conflicts(&self, count: u32) {
        self.annotation_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn remaining_faults(&self) -> u32 {
        self.faults.load(Ordering::SeqCst)
    }

    /// Successful annotation writes so far
    pub fn annotation_writes(&self) -> u64 {
        self.annotation_writes.load(Ordering::SeqCst)
    }

    /// Signal that the change feed lost events
    pub fn notify_resync(&self) {
        self.notify(ResourceChange::Resync);
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn notify(&self, change: ResourceChange) {
        trace!(?change, "store change");
        // No subscribers is fine
        let _ = self.changes.send(change);
    }

    fn check_fault(&self) -> Result<()> {
        if take_one(&self.faults) {
            return Err(Error::StoreUnavailable {
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }
}

/// Consume one injected failure, if any are left
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn volume_change(volume: &Volume) -> ResourceChange {
    ResourceChange::Volume {
        name: volume.name.clone(),
        provisioner: volume.provisioner().map(str::to_string),
    }
}

fn claim_change(claim: &Claim) -> ResourceChange {
    ResourceChange::Claim {
        namespace: claim.namespace.clone(),
        name: claim.name.clone(),
        volume_name: claim.volume_name.clone(),
    }
}

fn check_version(kind: &str, name: &str, current: Option<&String>, expected: &str) -> Result<()> {
    if current.map(String::as_str) != Some(expected) {
        return Err(Error::Conflict {
            kind: kind.into(),
            name: name.into(),
        });
    }
    Ok(())
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get_volume(&self, name: &str) -> Result<Option<Volume>> {
        self.check_fault()?;
        Ok(self.volume(name))
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        self.check_fault()?;
        Ok(self.state.read().volumes.values().cloned().collect())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<Claim>> {
        self.check_fault()?;
        Ok(self.claim(namespace, name))
    }

    async fn list_claims(&self, namespace: &str) -> Result<Vec<Claim>> {
        self.check_fault()?;
        Ok(self
            .state
            .read()
            .claims
            .values()
            .filter(|claim| claim.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn add_claim_annotations(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Claim> {
        self.check_fault()?;
        let claim = {
            let mut state = self.state.write();
            let version = state.next_version();
            let claim = state
                .claims
                .get_mut(&(namespace.to_string(), name.to_string()))
                .ok_or_else(|| Error::ResourceNotFound {
                    kind: "PersistentVolumeClaim".into(),
                    name: format!("{}/{}", namespace, name),
                })?;
            check_version(
                "PersistentVolumeClaim",
                name,
                claim.resource_version.as_ref(),
                resource_version,
            )?;
            if take_one(&self.annotation_conflicts) {
                return Err(Error::Conflict {
                    kind: "PersistentVolumeClaim".into(),
                    name: name.into(),
                });
            }
            claim
                .annotations
                .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
            claim.resource_version = Some(version);
            claim.clone()
        };
        self.annotation_writes.fetch_add(1, Ordering::SeqCst);
        self.notify(claim_change(&claim));
        Ok(claim)
    }

    async fn set_volume_finalizers(
        &self,
        name: &str,
        resource_version: &str,
        finalizers: &[String],
    ) -> Result<Option<Volume>> {
        self.check_fault()?;
        let (volume, removed) = {
            let mut state = self.state.write();
            let version = state.next_version();
            let volume = state
                .volumes
                .get_mut(name)
                .ok_or_else(|| Error::ResourceNotFound {
                    kind: "PersistentVolume".into(),
                    name: name.into(),
                })?;
            check_version(
                "PersistentVolume",
                name,
                volume.resource_version.as_ref(),
                resource_version,
            )?;
            volume.finalizers = finalizers.to_vec();
            volume.resource_version = Some(version);
            let volume = volume.clone();
            let removed = volume.deletion_requested && volume.finalizers.is_empty();
            if removed {
                state.volumes.remove(name);
            }
            (volume, removed)
        };
        self.notify(volume_change(&volume));
        Ok(if removed { None } else { Some(volume) })
    }

    fn changes(&self) -> BoxStream<'static, Result<ResourceChange>> {
        let receiver = self.changes.subscribe();
        stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(change) => Some((Ok(change), receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "change feed lagged, requesting resync");
                    Some((Ok(ResourceChange::Resync), receiver))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })
        .boxed()
    }

    fn store_name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{ObjectRef, ReclaimPolicy};
    use assert_matches::assert_matches;

    fn annotations(key: &str, value: &str) -> BTreeMap<String, String> {
        [(key.to_string(), value.to_string())].into()
    }

    #[tokio::test]
    async fn test_conditional_annotation_write() {
        let store = InMemoryStore::new();
        let claim = store.put_claim(Claim::new("openebs", "nfs-pv-xyz"));
        let rv = claim.resource_version.clone().unwrap();

        let updated = store
            .add_claim_annotations("openebs", "nfs-pv-xyz", &rv, &annotations("a", "1"))
            .await
            .unwrap();
        assert_eq!(updated.annotations.get("a").map(String::as_str), Some("1"));
        assert_ne!(updated.resource_version, Some(rv.clone()));

        // Stale version
        let result = store
            .add_claim_annotations("openebs", "nfs-pv-xyz", &rv, &annotations("b", "2"))
            .await;
        assert_matches!(result, Err(Error::Conflict { .. }));
        assert_eq!(store.annotation_writes(), 1);

        let result = store
            .add_claim_annotations("openebs", "missing", &rv, &annotations("b", "2"))
            .await;
        assert_matches!(result, Err(Error::ResourceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_annotation_write_keeps_existing_keys() {
        let store = InMemoryStore::new();
        let mut claim = Claim::new("openebs", "nfs-pv-xyz");
        claim.annotations.insert("existing".into(), "kept".into());
        let claim = store.put_claim(claim);

        let updated = store
            .add_claim_annotations(
                "openebs",
                "nfs-pv-xyz",
                claim.resource_version.as_deref().unwrap(),
                &annotations("new", "value"),
            )
            .await
            .unwrap();
        assert_eq!(updated.annotations.len(), 2);
    }

    #[tokio::test]
    async fn test_finalizer_blocks_removal() {
        let store = InMemoryStore::new();
        let mut volume = Volume::new("pv-xyz", ReclaimPolicy::Retain);
        volume.finalizers.push("example.io/hold".into());
        store.put_volume(volume);

        assert!(store.request_volume_deletion("pv-xyz"));
        let volume = store.volume("pv-xyz").unwrap();
        assert!(volume.deletion_requested);

        let result = store
            .set_volume_finalizers("pv-xyz", volume.resource_version.as_deref().unwrap(), &[])
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(store.volume("pv-xyz").is_none());
    }

    #[tokio::test]
    async fn test_delete_claim_releases_volume() {
        let store = InMemoryStore::new();
        store.put_volume(
            Volume::new("pv-xyz", ReclaimPolicy::Retain).bound_to(ObjectRef::new("app-ns", "pvc1")),
        );
        store.put_claim(Claim::new("app-ns", "pvc1").bound_to("pv-xyz"));

        store.delete_claim("app-ns", "pvc1");
        assert_eq!(store.volume("pv-xyz").unwrap().phase, VolumePhase::Released);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let store = InMemoryStore::new();
        store.inject_transient_failures(2);

        assert_matches!(store.get_volume("x").await, Err(Error::StoreUnavailable { .. }));
        assert_matches!(store.list_volumes().await, Err(Error::StoreUnavailable { .. }));
        assert_matches!(store.get_volume("x").await, Ok(None));
        assert_eq!(store.remaining_faults(), 0);
    }

    #[tokio::test]
    async fn test_injected_conflicts_reject_annotation_writes() {
        let store = InMemoryStore::new();
        let claim = store.put_claim(Claim::new("openebs", "nfs-pv-xyz"));
        let rv = claim.resource_version.clone().unwrap();
        store.inject_annotation_conflicts(1);

        let result = store
            .add_claim_annotations("openebs", "nfs-pv-xyz", &rv, &annotations("a", "1"))
            .await;
        assert_matches!(result, Err(Error::Conflict { .. }));
        assert!(store.claim("openebs", "nfs-pv-xyz").unwrap().annotations.is_empty());

        let result = store
            .add_claim_annotations("openebs", "nfs-pv-xyz", &rv, &annotations("a", "1"))
            .await;
        assert_matches!(result, Ok(_));
        assert_eq!(store.annotation_writes(), 1);
    }

    #[tokio::test]
    async fn test_changes_stream() {
        let store = InMemoryStore::new();
        let mut changes = store.changes();

        store.put_claim(Claim::new("openebs", "nfs-pv-xyz").bound_to("pv-backend"));
        let change = changes.next().await.unwrap().unwrap();
        assert_eq!(
            change,
            ResourceChange::Claim {
                namespace: "openebs".into(),
                name: "nfs-pv-xyz".into(),
                volume_name: Some("pv-backend".into()),
            }
        );
    }
}
