//! Export Decision
//!
//! Pure projection from an observed correlation snapshot and the backend
//! claim's current annotations to the exports still owed. Decisions never
//! depend on event history, so duplicate or reordered events are harmless:
//! deciding again on the post-write state always yields `NoOp`.

use crate::error::{Error, Result};
use crate::events::{EventKind, ExportRecord, Presence};
use crate::observer::correlation::{BackendState, CorrelationEvent};
use std::collections::BTreeMap;

/// Why a reconciliation cannot make progress yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeferReason {
    /// The backend claim does not exist yet
    BackendNotReady,
    /// The backend claim exists but is not bound to a volume
    BackendNotBound,
    /// The front-end volume is not bound to a claim
    FrontendNotBound,
}

impl DeferReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeferReason::BackendNotReady => "backend-not-ready",
            DeferReason::BackendNotBound => "backend-not-bound",
            DeferReason::FrontendNotBound => "frontend-not-bound",
        }
    }
}

impl std::fmt::Display for DeferReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single step of a reconciliation plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    NoOp,
    WriteCreateExport(ExportRecord),
    WriteDeleteExport(ExportRecord),
    DeferRetry(DeferReason),
}

/// Ordered actions for one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    actions: Vec<Action>,
}

impl Plan {
    pub fn noop() -> Self {
        Self {
            actions: vec![Action::NoOp],
        }
    }

    pub fn defer(reason: DeferReason) -> Self {
        Self {
            actions: vec![Action::DeferRetry(reason)],
        }
    }

    fn from_actions(actions: Vec<Action>) -> Self {
        if actions.is_empty() {
            Self::noop()
        } else {
            Self { actions }
        }
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn is_noop(&self) -> bool {
        self.actions == [Action::NoOp]
    }

    pub fn deferred(&self) -> Option<DeferReason> {
        self.actions.iter().find_map(|action| match action {
            Action::DeferRetry(reason) => Some(*reason),
            _ => None,
        })
    }

    /// Records to write, create before delete
    pub fn records(&self) -> Vec<ExportRecord> {
        self.actions
            .iter()
            .filter_map(|action| match action {
                Action::WriteCreateExport(record) | Action::WriteDeleteExport(record) => {
                    Some(record.clone())
                }
                _ => None,
            })
            .collect()
    }
}

/// Decide what to export for `event`, given the backend claim's annotations
pub fn decide(event: &CorrelationEvent, current: &BTreeMap<String, String>) -> Result<Plan> {
    let backend = match &event.backend {
        BackendState::Found(claim) => claim,
        BackendState::NotFound => return Ok(Plan::defer(DeferReason::BackendNotReady)),
    };
    let backend_pv = match backend.bound_volume() {
        Some(name) => name,
        None => return Ok(Plan::defer(DeferReason::BackendNotBound)),
    };
    let backend_pvc = backend.object_ref().export_id();

    let mut actions = Vec::new();
    let stored_create = ExportRecord::from_annotations(EventKind::Create, current);

    // Create facts come from the live volume; once it is gone only the stored
    // record is left to derive the delete facts from.
    let created = match &event.volume {
        Some(volume) => match &volume.claim_ref {
            Some(claim_ref) => {
                let record = ExportRecord::new(
                    EventKind::Create,
                    claim_ref.export_id(),
                    &volume.name,
                    &backend_pvc,
                    backend_pv,
                );
                if check(event, &record, current)? {
                    actions.push(Action::WriteCreateExport(record.clone()));
                }
                Some(record)
            }
            None => match stored_create {
                Some(record) => Some(record),
                None => return Ok(Plan::defer(DeferReason::FrontendNotBound)),
            },
        },
        None => stored_create,
    };

    if delete_due(event) {
        // A volume that vanished before its creation was exported has no
        // facts left to mirror
        if let Some(created) = created {
            let record = ExportRecord::new(
                EventKind::Delete,
                created.nfs_pvc,
                created.nfs_pv,
                &backend_pvc,
                backend_pv,
            );
            if check(event, &record, current)? {
                actions.push(Action::WriteDeleteExport(record));
            }
        }
    }

    Ok(Plan::from_actions(actions))
}

/// Whether `record` still has to be written; errors if it would overwrite
fn check(event: &CorrelationEvent, record: &ExportRecord, current: &BTreeMap<String, String>) -> Result<bool> {
    match record.presence(current) {
        Presence::Conflicting {
            key,
            existing,
            expected,
        } => Err(Error::InvariantViolation {
            key: event.key.to_string(),
            reason: format!(
                "{} holds {:?}, observed state says {:?}",
                key, existing, expected
            ),
        }),
        presence => Ok(presence.needs_write()),
    }
}

/// Whether the front-end volume is irrevocably going away.
///
/// Only removal of the volume resource counts, for both reclaim policies. A
/// released volume still held by its reclaimer has not been deleted yet.
fn delete_due(event: &CorrelationEvent) -> bool {
    event
        .volume
        .as_ref()
        .map_or(true, |volume| volume.deletion_requested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{Claim, ObjectRef, ReclaimPolicy, Volume, VolumePhase};
    use crate::events::keys::*;
    use crate::observer::correlation::CorrelationKey;
    use assert_matches::assert_matches;
    use chrono::Utc;

    fn volume(policy: ReclaimPolicy) -> Volume {
        Volume::new("pv-xyz", policy)
            .provisioned_by("openebs.io/nfsrwx")
            .bound_to(ObjectRef::new("app-ns", "pvc1"))
    }

    fn backend() -> Claim {
        Claim::new("openebs", "nfs-pv-xyz").bound_to("pv-backend-abc")
    }

    fn event(volume: Option<Volume>, claim: Option<Claim>, backend: BackendState) -> CorrelationEvent {
        CorrelationEvent {
            key: CorrelationKey::new("pv-xyz"),
            volume,
            claim,
            backend,
            observed_at: Utc::now(),
        }
    }

    fn live(policy: ReclaimPolicy) -> CorrelationEvent {
        event(
            Some(volume(policy)),
            Some(Claim::new("app-ns", "pvc1").bound_to("pv-xyz")),
            BackendState::Found(backend()),
        )
    }

    fn apply(plan: &Plan, annotations: &mut BTreeMap<String, String>) {
        for record in plan.records() {
            for (key, value) in record.entries() {
                annotations.entry(key.to_string()).or_insert_with(|| value.to_string());
            }
        }
    }

    #[test]
    fn test_literal_create_export() {
        let plan = decide(&live(ReclaimPolicy::Retain), &BTreeMap::new()).unwrap();
        let records = plan.records();
        assert_eq!(records.len(), 1);

        let mut annotations = BTreeMap::new();
        apply(&plan, &mut annotations);
        assert_eq!(annotations[VOLUME_CREATE_NFS_PVC_KEY], "app-ns-pvc1");
        assert_eq!(annotations[VOLUME_CREATE_NFS_PV_KEY], "pv-xyz");
        assert_eq!(annotations[VOLUME_CREATE_BACKEND_PVC_KEY], "openebs-nfs-pv-xyz");
        assert_eq!(annotations[VOLUME_CREATE_BACKEND_PV_KEY], "pv-backend-abc");
    }

    #[test]
    fn test_decide_is_idempotent() {
        let cases = vec![
            live(ReclaimPolicy::Retain),
            live(ReclaimPolicy::Delete),
            event(None, None, BackendState::Found(backend())),
            {
                let mut deleting = volume(ReclaimPolicy::Retain);
                deleting.deletion_requested = true;
                event(Some(deleting), None, BackendState::Found(backend()))
            },
        ];

        for case in cases {
            let mut annotations = BTreeMap::new();
            let first = decide(&case, &annotations).unwrap();
            apply(&first, &mut annotations);
            let second = decide(&case, &annotations).unwrap();
            assert!(second.is_noop(), "second decision for {:?} was {:?}", case.volume, second);
        }
    }

    #[test]
    fn test_missing_backend_defers() {
        let case = event(Some(volume(ReclaimPolicy::Delete)), None, BackendState::NotFound);
        assert_eq!(
            decide(&case, &BTreeMap::new()).unwrap().deferred(),
            Some(DeferReason::BackendNotReady)
        );

        let unbound = Claim::new("openebs", "nfs-pv-xyz");
        let case = event(Some(volume(ReclaimPolicy::Delete)), None, BackendState::Found(unbound));
        assert_eq!(
            decide(&case, &BTreeMap::new()).unwrap().deferred(),
            Some(DeferReason::BackendNotBound)
        );
    }

    #[test]
    fn test_unbound_frontend_defers() {
        let case = event(
            Some(Volume::new("pv-xyz", ReclaimPolicy::Delete)),
            None,
            BackendState::Found(backend()),
        );
        assert_eq!(
            decide(&case, &BTreeMap::new()).unwrap().deferred(),
            Some(DeferReason::FrontendNotBound)
        );
    }

    #[test]
    fn test_retain_claim_deletion_exports_nothing() {
        let mut released = volume(ReclaimPolicy::Retain);
        released.phase = VolumePhase::Released;
        let case = event(Some(released), None, BackendState::Found(backend()));

        let mut annotations = BTreeMap::new();
        apply(&decide(&live(ReclaimPolicy::Retain), &annotations).unwrap(), &mut annotations);

        for _ in 0..10 {
            let plan = decide(&case, &annotations).unwrap();
            assert!(plan.is_noop());
        }
    }

    #[test]
    fn test_retain_volume_removal_exports_delete() {
        let mut annotations = BTreeMap::new();
        apply(&decide(&live(ReclaimPolicy::Retain), &annotations).unwrap(), &mut annotations);

        let case = event(None, None, BackendState::Found(backend()));
        let plan = decide(&case, &annotations).unwrap();
        assert_matches!(plan.actions(), [Action::WriteDeleteExport(record)] => {
            assert_eq!(record.nfs_pvc, "app-ns-pvc1");
            assert_eq!(record.nfs_pv, "pv-xyz");
            assert_eq!(record.backend_pvc, "openebs-nfs-pv-xyz");
            assert_eq!(record.backend_pv, "pv-backend-abc");
        });
    }

    #[test]
    fn test_delete_policy_waits_for_volume_removal() {
        let mut annotations = BTreeMap::new();
        apply(&decide(&live(ReclaimPolicy::Delete), &annotations).unwrap(), &mut annotations);

        // Claim gone and volume released, but the volume resource still exists
        let mut released = volume(ReclaimPolicy::Delete);
        released.phase = VolumePhase::Released;
        let case = event(Some(released.clone()), None, BackendState::Found(backend()));
        assert!(decide(&case, &annotations).unwrap().is_noop());

        released.deletion_requested = true;
        let case = event(Some(released), None, BackendState::Found(backend()));
        assert_matches!(
            decide(&case, &annotations).unwrap().actions(),
            [Action::WriteDeleteExport(_)]
        );

        let case = event(None, None, BackendState::Found(backend()));
        assert_matches!(
            decide(&case, &annotations).unwrap().actions(),
            [Action::WriteDeleteExport(_)]
        );
    }

    #[test]
    fn test_pending_frontend_claim_still_exports_create() {
        let mut claim = Claim::new("app-ns", "pvc1");
        claim.volume_name = None;
        let case = event(
            Some(volume(ReclaimPolicy::Delete)),
            Some(claim),
            BackendState::Found(backend()),
        );
        assert_matches!(
            decide(&case, &BTreeMap::new()).unwrap().actions(),
            [Action::WriteCreateExport(_)]
        );
    }

    #[test]
    fn test_rapid_create_then_delete_orders_create_first() {
        let mut deleting = volume(ReclaimPolicy::Delete);
        deleting.deletion_requested = true;
        let case = event(Some(deleting), None, BackendState::Found(backend()));

        let plan = decide(&case, &BTreeMap::new()).unwrap();
        assert_matches!(
            plan.actions(),
            [Action::WriteCreateExport(_), Action::WriteDeleteExport(_)]
        );
    }

    #[test]
    fn test_vanished_volume_without_create_is_noop() {
        let case = event(None, None, BackendState::Found(backend()));
        assert!(decide(&case, &BTreeMap::new()).unwrap().is_noop());
    }

    #[test]
    fn test_conflicting_create_value_is_invariant_violation() {
        let mut annotations = BTreeMap::new();
        annotations.insert(VOLUME_CREATE_NFS_PVC_KEY.to_string(), "other-ns-pvc9".to_string());

        let result = decide(&live(ReclaimPolicy::Retain), &annotations);
        assert_matches!(result, Err(Error::InvariantViolation { .. }));
    }

    #[test]
    fn test_backend_rebound_is_invariant_violation() {
        let mut annotations = BTreeMap::new();
        apply(&decide(&live(ReclaimPolicy::Retain), &annotations).unwrap(), &mut annotations);

        let rebound = Claim::new("openebs", "nfs-pv-xyz").bound_to("pv-backend-new");
        let case = event(Some(volume(ReclaimPolicy::Retain)), None, BackendState::Found(rebound));
        assert_matches!(decide(&case, &annotations), Err(Error::InvariantViolation { .. }));
    }

    #[test]
    fn test_partial_create_is_completed() {
        let mut annotations = BTreeMap::new();
        annotations.insert(VOLUME_CREATE_NFS_PV_KEY.to_string(), "pv-xyz".to_string());

        let plan = decide(&live(ReclaimPolicy::Retain), &annotations).unwrap();
        assert_matches!(plan.actions(), [Action::WriteCreateExport(_)]);
    }
}
