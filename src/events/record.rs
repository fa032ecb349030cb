//! Export Records
//!
//! The lifecycle facts mirrored onto the backend claim, and how they compare
//! against annotations already present there.

use super::keys::{KeySet, CREATE_KEYS, DELETE_KEYS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Create,
    Delete,
}

impl EventKind {
    /// Annotation keys for this kind
    pub fn keys(&self) -> KeySet {
        match self {
            EventKind::Create => CREATE_KEYS,
            EventKind::Delete => DELETE_KEYS,
        }
    }
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle fact about a front-end volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRecord {
    pub kind: EventKind,
    /// Front-end claim, `<namespace>-<name>`
    pub nfs_pvc: String,
    /// Front-end volume name
    pub nfs_pv: String,
    /// Backend claim, `<namespace>-<name>`
    pub backend_pvc: String,
    /// Backend volume name
    pub backend_pv: String,
}

/// How a record relates to the annotations already on the backend claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presence {
    /// None of the record's keys are present
    Absent,
    /// Some keys are present, all with the expected values
    Partial,
    /// All four keys are present with the expected values
    Complete,
    /// A key holds a value other than the expected one
    Conflicting {
        key: &'static str,
        existing: String,
        expected: String,
    },
}

impl Presence {
    /// Whether the record still needs to be written
    pub fn needs_write(&self) -> bool {
        matches!(self, Presence::Absent | Presence::Partial)
    }
}

impl ExportRecord {
    pub fn new(
        kind: EventKind,
        nfs_pvc: impl Into<String>,
        nfs_pv: impl Into<String>,
        backend_pvc: impl Into<String>,
        backend_pv: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            nfs_pvc: nfs_pvc.into(),
            nfs_pv: nfs_pv.into(),
            backend_pvc: backend_pvc.into(),
            backend_pv: backend_pv.into(),
        }
    }

    /// Key/value pairs in write order
    pub fn entries(&self) -> [(&'static str, &str); 4] {
        let keys = self.kind.keys();
        [
            (keys.nfs_pvc, self.nfs_pvc.as_str()),
            (keys.nfs_pv, self.nfs_pv.as_str()),
            (keys.backend_pvc, self.backend_pvc.as_str()),
            (keys.backend_pv, self.backend_pv.as_str()),
        ]
    }

    /// Rebuild a record of `kind` from annotations, if all four keys are set
    pub fn from_annotations(kind: EventKind, annotations: &BTreeMap<String, String>) -> Option<Self> {
        let keys = kind.keys();
        Some(Self {
            kind,
            nfs_pvc: annotations.get(keys.nfs_pvc)?.clone(),
            nfs_pv: annotations.get(keys.nfs_pv)?.clone(),
            backend_pvc: annotations.get(keys.backend_pvc)?.clone(),
            backend_pv: annotations.get(keys.backend_pv)?.clone(),
        })
    }

    /// Compare this record against existing annotations
    pub fn presence(&self, annotations: &BTreeMap<String, String>) -> Presence {
        let mut present = 0;
        for (key, expected) in self.entries() {
            match annotations.get(key) {
                Some(existing) if existing == expected => present += 1,
                Some(existing) => {
                    return Presence::Conflicting {
                        key,
                        existing: existing.clone(),
                        expected: expected.to_string(),
                    }
                }
                None => {}
            }
        }

        match present {
            0 => Presence::Absent,
            4 => Presence::Complete,
            _ => Presence::Partial,
        }
    }
}

/// Whether any key of `kind` is present in the annotations
pub fn has_any_key(kind: EventKind, annotations: &BTreeMap<String, String>) -> bool {
    kind.keys()
        .as_array()
        .iter()
        .any(|key| annotations.contains_key(*key))
}
