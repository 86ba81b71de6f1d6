//! Storage pool bookkeeping.
//!
//! The manager only records which pool ids exist, where they are backed and
//! which VMs hold volumes in them. Issuing the hypervisor define/undefine
//! calls is the session's job (see
//! [`OrchestratorSession::allocate_pool`](super::OrchestratorSession::allocate_pool)).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};

/// A named storage allocation unit bound to one backing path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourcePool {
    pub id: String,
    pub backing_path: String,
    /// volume id -> VM holding it
    volumes: BTreeMap<String, String>,
}

impl ResourcePool {
    fn new(id: &str, backing_path: &str) -> Self {
        Self {
            id: id.to_string(),
            backing_path: backing_path.to_string(),
            volumes: BTreeMap::new(),
        }
    }

    pub fn volume_ids(&self) -> impl Iterator<Item = &str> {
        self.volumes.keys().map(String::as_str)
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    /// VMs that currently hold a volume here.
    pub fn referenced_by(&self) -> BTreeSet<&str> {
        self.volumes.values().map(String::as_str).collect()
    }

    pub fn is_referenced(&self) -> bool {
        !self.volumes.is_empty()
    }
}

/// What [`PoolManager::select`] decided for a candidate list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolSelection {
    /// A known pool with room left.
    Existing(String),
    /// No usable known pool; this id should be created.
    Create(String),
}

#[derive(Debug, Default)]
pub struct PoolManager {
    pools: HashMap<String, ResourcePool>,
    volume_capacity: Option<usize>,
}

impl PoolManager {
    pub fn new(volume_capacity: Option<usize>) -> Self {
        Self {
            pools: HashMap::new(),
            volume_capacity,
        }
    }

    pub fn get(&self, pool_id: &str) -> Option<&ResourcePool> {
        self.pools.get(pool_id)
    }

    pub fn pool_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pools.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn is_exhausted(&self, pool: &ResourcePool) -> bool {
        self.volume_capacity
            .is_some_and(|cap| pool.volume_count() >= cap)
    }

    /// Pick a pool for `candidates`: the first known one with room, otherwise
    /// the first id not known yet. Deterministic, so repeated calls before
    /// any consumption agree.
    pub fn select(&self, candidates: &[String]) -> Result<PoolSelection> {
        if let Some(id) = candidates
            .iter()
            .find(|id| self.pools.get(*id).is_some_and(|p| !self.is_exhausted(p)))
        {
            return Ok(PoolSelection::Existing(id.clone()));
        }

        candidates
            .iter()
            .find(|id| !self.pools.contains_key(*id))
            .map(|id| PoolSelection::Create(id.clone()))
            .ok_or_else(|| Error::PoolExhausted {
                candidates: candidates.to_vec(),
            })
    }

    /// Record a pool the hypervisor has just defined.
    pub fn register(&mut self, pool_id: &str, backing_path: &str) {
        debug!(pool = pool_id, path = backing_path, "pool registered");
        self.pools
            .entry(pool_id.to_string())
            .or_insert_with(|| ResourcePool::new(pool_id, backing_path));
    }

    /// Hand out a volume in `pool_id` to `vm_name`.
    ///
    /// With no explicit `volume_id` the volume is named after the VM.
    pub fn allocate_volume(
        &mut self,
        pool_id: &str,
        vm_name: &str,
        volume_id: Option<&str>,
    ) -> Result<String> {
        let capacity = self.volume_capacity;
        let pool = self
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| Error::UnknownPool(pool_id.to_string()))?;

        if capacity.is_some_and(|cap| pool.volume_count() >= cap) {
            return Err(Error::PoolExhausted {
                candidates: vec![pool_id.to_string()],
            });
        }

        let volume = volume_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("{vm_name}-vol"));
        if let Some(owner) = pool.volumes.get(&volume).filter(|owner| *owner != vm_name) {
            return Err(Error::VolumeInUse {
                pool_id: pool_id.to_string(),
                volume_id: volume,
                vm: owner.clone(),
            });
        }
        pool.volumes.insert(volume.clone(), vm_name.to_string());
        debug!(pool = pool_id, volume = %volume, vm = vm_name, "volume allocated");
        Ok(volume)
    }

    /// Drop every volume `vm_name` holds in `pool_id`.
    pub fn release_vm(&mut self, pool_id: &str, vm_name: &str) {
        if let Some(pool) = self.pools.get_mut(pool_id) {
            pool.volumes.retain(|_, owner| owner != vm_name);
        }
    }

    /// Check that `pool_id` can be deleted.
    pub fn ensure_releasable(&self, pool_id: &str) -> Result<()> {
        let pool = self
            .pools
            .get(pool_id)
            .ok_or_else(|| Error::UnknownPool(pool_id.to_string()))?;
        if pool.is_referenced() {
            return Err(Error::PoolBusy {
                pool_id: pool_id.to_string(),
                vms: pool.referenced_by().into_iter().map(str::to_string).collect(),
            });
        }
        Ok(())
    }

    /// Forget a pool. Fails with `PoolBusy` while any VM references it.
    pub fn remove(&mut self, pool_id: &str) -> Result<ResourcePool> {
        self.ensure_releasable(pool_id)?;
        self.pools
            .remove(pool_id)
            .ok_or_else(|| Error::UnknownPool(pool_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn select_creates_first_unknown_candidate() {
        let mgr = PoolManager::new(None);
        assert_eq!(
            mgr.select(&ids(&["Storage_0", "Storage_1"])).unwrap(),
            PoolSelection::Create("Storage_0".into())
        );
    }

    #[test]
    fn select_prefers_known_pool_with_room() {
        let mut mgr = PoolManager::new(Some(1));
        mgr.register("Storage_0", "/mnt/a");
        mgr.register("Storage_1", "/mnt/b");
        mgr.allocate_volume("Storage_0", "vm1", None).unwrap();
        assert_eq!(
            mgr.select(&ids(&["Storage_0", "Storage_1"])).unwrap(),
            PoolSelection::Existing("Storage_1".into())
        );
    }

    #[test]
    fn select_fails_when_every_candidate_is_full() {
        let mut mgr = PoolManager::new(Some(1));
        mgr.register("p", "/mnt/a");
        mgr.allocate_volume("p", "vm1", None).unwrap();
        assert!(matches!(
            mgr.select(&ids(&["p"])),
            Err(Error::PoolExhausted { .. })
        ));
    }

    #[test]
    fn remove_is_blocked_while_referenced() {
        let mut mgr = PoolManager::new(None);
        mgr.register("p", "/mnt/a");
        let vol = mgr.allocate_volume("p", "vm1", Some("disk7")).unwrap();
        assert_eq!(vol, "disk7");

        match mgr.remove("p") {
            Err(Error::PoolBusy { vms, .. }) => assert_eq!(vms, vec!["vm1".to_string()]),
            other => panic!("expected PoolBusy, got {other:?}"),
        }

        mgr.release_vm("p", "vm1");
        assert!(mgr.remove("p").is_ok());
        assert!(mgr.get("p").is_none());
    }

    #[test]
    fn unknown_pool_is_reported() {
        let mut mgr = PoolManager::new(None);
        assert!(matches!(mgr.remove("nope"), Err(Error::UnknownPool(_))));
        assert!(matches!(
            mgr.allocate_volume("nope", "vm", None),
            Err(Error::UnknownPool(_))
        ));
    }

    #[test]
    fn held_volume_is_not_handed_to_another_vm() {
        let mut mgr = PoolManager::new(None);
        mgr.register("p", "/mnt/a");
        mgr.allocate_volume("p", "vm1", Some("disk0")).unwrap();

        match mgr.allocate_volume("p", "vm2", Some("disk0")) {
            Err(Error::VolumeInUse { volume_id, vm, .. }) => {
                assert_eq!(volume_id, "disk0");
                assert_eq!(vm, "vm1");
            }
            other => panic!("expected VolumeInUse, got {other:?}"),
        }
        let owners: Vec<_> = mgr.get("p").unwrap().referenced_by().into_iter().collect();
        assert_eq!(owners, vec!["vm1"]);

        // Same owner asking again is fine.
        assert_eq!(mgr.allocate_volume("p", "vm1", Some("disk0")).unwrap(), "disk0");
    }
}
