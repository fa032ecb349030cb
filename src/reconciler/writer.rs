//! Annotation Writer
//!
//! Applies export records to the backend claim with a single conditional
//! update. Only keys that are missing are written; a key that already holds
//! a different value is never overwritten.

use crate::domain::model::ObjectRef;
use crate::domain::ports::ResourceStoreRef;
use crate::error::{Error, Result};
use crate::events::{EventKind, ExportRecord};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Result of applying records to a backend claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The update was committed
    Applied { keys_written: usize },
    /// Every key was already present with the expected value
    AlreadyPresent,
    /// The backend claim no longer exists
    NotFound,
}

/// Keys found missing on a backend claim at a given resource version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    target: ObjectRef,
    resource_version: String,
    missing: BTreeMap<String, String>,
    records: Vec<ExportRecord>,
}

impl PendingWrite {
    /// Records with at least one missing key, in write order
    pub fn records(&self) -> &[ExportRecord] {
        &self.records
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.records.iter().map(|record| record.kind).collect()
    }

    pub fn len(&self) -> usize {
        self.missing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Backend claim state read ahead of a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared {
    Pending(PendingWrite),
    AlreadyPresent,
    NotFound,
}

/// Writes export annotations onto backend claims
pub struct AnnotationWriter {
    store: ResourceStoreRef,
}

impl AnnotationWriter {
    pub fn new(store: ResourceStoreRef) -> Self {
        Self { store }
    }

    /// Apply `records` in order as one update.
    ///
    /// Fails with `Error::Conflict` if the claim changed since it was read;
    /// the caller re-reads and decides again.
    pub async fn apply(&self, target: &ObjectRef, records: &[ExportRecord]) -> Result<WriteOutcome> {
        match self.prepare(target, records).await? {
            Prepared::Pending(write) => self.commit(&write).await,
            Prepared::AlreadyPresent => Ok(WriteOutcome::AlreadyPresent),
            Prepared::NotFound => Ok(WriteOutcome::NotFound),
        }
    }

    /// Re-read the claim and collect the keys `records` still need
    pub async fn prepare(&self, target: &ObjectRef, records: &[ExportRecord]) -> Result<Prepared> {
        let claim = match self.store.get_claim(&target.namespace, &target.name).await? {
            Some(claim) => claim,
            None => return Ok(Prepared::NotFound),
        };
        let resource_version = claim.resource_version.clone().ok_or_else(|| {
            Error::Internal(format!("claim {} has no resource version", target))
        })?;

        let mut missing = BTreeMap::new();
        let mut pending = Vec::new();
        for record in records {
            let mut incomplete = false;
            for (key, value) in record.entries() {
                match claim.annotations.get(key) {
                    Some(existing) if existing == value => {}
                    Some(existing) => {
                        return Err(Error::InvariantViolation {
                            key: record.nfs_pv.clone(),
                            reason: format!(
                                "{} on {} holds {:?}, refusing to overwrite with {:?}",
                                key, target, existing, value
                            ),
                        })
                    }
                    None => {
                        missing.insert(key.to_string(), value.to_string());
                        incomplete = true;
                    }
                }
            }
            if incomplete {
                pending.push(record.clone());
            }
        }

        if missing.is_empty() {
            debug!(claim = %target, "export annotations already present");
            return Ok(Prepared::AlreadyPresent);
        }

        Ok(Prepared::Pending(PendingWrite {
            target: target.clone(),
            resource_version,
            missing,
            records: pending,
        }))
    }

    /// Write the missing keys, conditional on the version they were read at
    pub async fn commit(&self, write: &PendingWrite) -> Result<WriteOutcome> {
        let target = &write.target;
        match self
            .store
            .add_claim_annotations(
                &target.namespace,
                &target.name,
                &write.resource_version,
                &write.missing,
            )
            .await
        {
            Ok(_) => {
                info!(claim = %target, keys = write.len(), "export annotations written");
                Ok(WriteOutcome::Applied {
                    keys_written: write.len(),
                })
            }
            Err(e) if e.is_not_found() => Ok(WriteOutcome::NotFound),
            Err(e) => Err(e),
        }
    }
}
