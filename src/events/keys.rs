//! Export Annotation Keys
//!
//! The eight annotation keys written onto the backend claim. These names are
//! the wire contract with downstream consumers and must never change.

/// Create event: front-end (NFS) claim, as `<namespace>-<name>`
pub const VOLUME_CREATE_NFS_PVC_KEY: &str = "nfs.events.openebs.io/create-nfs-pvc";
/// Create event: front-end (NFS) volume name
pub const VOLUME_CREATE_NFS_PV_KEY: &str = "nfs.events.openebs.io/create-nfs-pv";
/// Create event: backend claim, as `<namespace>-<name>`
pub const VOLUME_CREATE_BACKEND_PVC_KEY: &str = "nfs.events.openebs.io/create-backend-pvc";
/// Create event: backend volume name
pub const VOLUME_CREATE_BACKEND_PV_KEY: &str = "nfs.events.openebs.io/create-backend-pv";

/// Delete event: front-end (NFS) claim, as `<namespace>-<name>`
pub const VOLUME_DELETE_NFS_PVC_KEY: &str = "nfs.events.openebs.io/delete-nfs-pvc";
/// Delete event: front-end (NFS) volume name
pub const VOLUME_DELETE_NFS_PV_KEY: &str = "nfs.events.openebs.io/delete-nfs-pv";
/// Delete event: backend claim, as `<namespace>-<name>`
pub const VOLUME_DELETE_BACKEND_PVC_KEY: &str = "nfs.events.openebs.io/delete-backend-pvc";
/// Delete event: backend volume name
pub const VOLUME_DELETE_BACKEND_PV_KEY: &str = "nfs.events.openebs.io/delete-backend-pv";

/// The four keys written for one event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySet {
    pub nfs_pvc: &'static str,
    pub nfs_pv: &'static str,
    pub backend_pvc: &'static str,
    pub backend_pv: &'static str,
}

impl KeySet {
    /// Keys in write order
    pub fn as_array(&self) -> [&'static str; 4] {
        [self.nfs_pvc, self.nfs_pv, self.backend_pvc, self.backend_pv]
    }
}

pub const CREATE_KEYS: KeySet = KeySet {
    nfs_pvc: VOLUME_CREATE_NFS_PVC_KEY,
    nfs_pv: VOLUME_CREATE_NFS_PV_KEY,
    backend_pvc: VOLUME_CREATE_BACKEND_PVC_KEY,
    backend_pv: VOLUME_CREATE_BACKEND_PV_KEY,
};

pub const DELETE_KEYS: KeySet = KeySet {
    nfs_pvc: VOLUME_DELETE_NFS_PVC_KEY,
    nfs_pv: VOLUME_DELETE_NFS_PV_KEY,
    backend_pvc: VOLUME_DELETE_BACKEND_PVC_KEY,
    backend_pv: VOLUME_DELETE_BACKEND_PV_KEY,
};
